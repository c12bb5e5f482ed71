//! Delivery driver.
//!
//! At most one send loop runs per client. The loop owns the gateway
//! connection, drains the queue into frames, reconnects with a linear
//! backoff, and parks the connection when the queue runs dry. When
//! reconnecting gives up, another loop is started once the backoff cap has
//! passed.
//!
//! ```text
//! Idle -> Connecting -> Sending -> (write error) Connecting -> ... -> Idle
//! ```

use crate::config::GatewayConfig;
use crate::connection::{Connection, Dialer, ResponseHandler, TcpDialer};
use crate::error::{GatewayError, GatewayResult};
use crate::feedback::{read_feedback, FeedbackRecord};
use crate::protocol::ErrorResponse;
use apns_queue::{EvictionTask, Notification, NotificationQueue, QueuedItem};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::runtime::Handle;
use tracing::{debug, error, info, warn};

/// How often `flush` checks whether the loop has drained the queue.
const FLUSH_POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Single-flight state of the send loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
enum LoopState {
    Idle = 0,
    /// Claimed by `kick`, task not yet running.
    Starting = 1,
    Running = 2,
}

/// Delay before reconnect attempt `attempt + 1` after `attempt` failures.
///
/// Grows by `step` per failure and never exceeds `max`.
pub fn backoff_delay(step: Duration, max: Duration, attempt: u32) -> Duration {
    step.saturating_mul(attempt).min(max)
}

/// APNs gateway client.
///
/// `send` only enqueues; delivery happens on a background loop that is
/// started on demand. Dropping the client stops cache eviction; a loop that
/// is already running finishes draining the queue first.
pub struct Client {
    inner: Arc<ClientInner>,
    _eviction: EvictionTask,
}

struct ClientInner {
    config: GatewayConfig,
    addr: String,
    dialer: Arc<dyn Dialer>,
    queue: Arc<NotificationQueue>,
    state: AtomicU8,
    /// Connection kept between loop runs.
    parked: Mutex<Option<Connection>>,
    runtime: Handle,
}

impl Client {
    /// Create a client that reaches the gateway through `dialer`.
    ///
    /// Must be called from within a tokio runtime; the send loop and the
    /// cache eviction task run on it.
    pub fn new(config: GatewayConfig, dialer: Arc<dyn Dialer>) -> GatewayResult<Self> {
        config.validate()?;
        let runtime = Handle::try_current().map_err(|_| {
            GatewayError::Config("client must be created inside a tokio runtime".to_string())
        })?;

        let queue = Arc::new(NotificationQueue::new(config.queue_config()));
        let eviction = queue.spawn_eviction();

        info!(
            addr = %config.gateway_addr(),
            sandbox = config.sandbox,
            max_frame_size = config.max_frame_size,
            "Created gateway client"
        );

        let inner = Arc::new(ClientInner {
            addr: config.gateway_addr().to_string(),
            config,
            dialer,
            queue,
            state: AtomicU8::new(LoopState::Idle as u8),
            parked: Mutex::new(None),
            runtime,
        });

        Ok(Self {
            inner,
            _eviction: eviction,
        })
    }

    /// Create a client that connects over plain TCP.
    pub fn with_tcp(config: GatewayConfig) -> GatewayResult<Self> {
        let dialer = Arc::new(TcpDialer::new(config.connect_timeout()));
        Self::new(config, dialer)
    }

    /// Queue `notification` for every valid token and make sure the send
    /// loop is running.
    ///
    /// Returns how many notifications were queued. Invalid tokens are
    /// skipped; a payload that cannot be encoded fails the whole call and
    /// queues nothing.
    pub fn send<I, S>(&self, notification: &Notification, tokens: I) -> GatewayResult<usize>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let count = self.inner.queue.enqueue(notification, tokens)?;
        if count > 0 {
            self.inner.kick();
        }
        Ok(count)
    }

    /// Wait until the queue is drained and the send loop has stopped.
    pub async fn flush(&self, timeout: Duration) -> GatewayResult<()> {
        let drained = async {
            while self.is_sending() || self.inner.queue.has_pending() {
                tokio::time::sleep(FLUSH_POLL_INTERVAL).await;
            }
        };

        tokio::time::timeout(timeout, drained)
            .await
            .map_err(|_| GatewayError::Timeout(timeout))
    }

    /// Number of notifications waiting to be sent.
    pub fn pending(&self) -> usize {
        self.inner.queue.pending_len()
    }

    /// True while a send loop is claimed or running.
    pub fn is_sending(&self) -> bool {
        self.inner.state.load(Ordering::Acquire) != LoopState::Idle as u8
    }

    /// The underlying queue, shared with the send loop.
    pub fn queue(&self) -> &Arc<NotificationQueue> {
        &self.inner.queue
    }

    /// Configuration the client was built with.
    pub fn config(&self) -> &GatewayConfig {
        &self.inner.config
    }

    /// Close the parked connection, if any.
    ///
    /// A running loop is not interrupted.
    pub async fn close(&self) {
        let parked = self.inner.parked.lock().take();
        if let Some(conn) = parked {
            debug!(addr = %conn.addr(), "Closing parked connection");
            conn.close().await;
        }
    }

    /// Read invalid-token reports from the feedback service.
    pub async fn feedback(&self) -> GatewayResult<Vec<FeedbackRecord>> {
        read_feedback(self.inner.dialer.as_ref(), &self.inner.config).await
    }
}

impl ClientInner {
    /// Start the send loop unless one is already claimed or running.
    fn kick(self: &Arc<Self>) {
        if self
            .state
            .compare_exchange(
                LoopState::Idle as u8,
                LoopState::Starting as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_err()
        {
            return;
        }

        let inner = Arc::clone(self);
        self.runtime.spawn(async move {
            inner.run_loop().await;
        });
    }

    async fn run_loop(self: Arc<Self>) {
        self.state.store(LoopState::Running as u8, Ordering::Release);

        loop {
            let outcome = self.drive().await;
            self.state.store(LoopState::Idle as u8, Ordering::Release);

            if let Err(e) = outcome {
                error!(
                    addr = %self.addr,
                    pending = self.queue.pending_len(),
                    error = %e,
                    "Send loop stopped"
                );
                self.schedule_retry();
                break;
            }

            // Work queued after the last dequeue may have lost its kick to us
            if !self.queue.has_pending() {
                break;
            }
            if self
                .state
                .compare_exchange(
                    LoopState::Idle as u8,
                    LoopState::Running as u8,
                    Ordering::AcqRel,
                    Ordering::Acquire,
                )
                .is_err()
            {
                break;
            }
        }
    }

    /// Start another loop after the backoff cap if work is still pending.
    fn schedule_retry(self: &Arc<Self>) {
        let weak = Arc::downgrade(self);
        let delay = self.config.reconnect_max();

        self.runtime.spawn(async move {
            tokio::time::sleep(delay).await;
            if let Some(inner) = weak.upgrade() {
                if inner.queue.has_pending() {
                    info!(addr = %inner.addr, "Retrying gateway connection");
                    inner.kick();
                }
            }
        });
    }

    /// Drain the queue, reconnecting as needed. Only fails when reconnecting
    /// gives up.
    async fn drive(self: &Arc<Self>) -> GatewayResult<()> {
        let mut parked = self.parked.lock().take();

        loop {
            let mut conn = match parked.take() {
                Some(conn) if conn.is_alive() => conn,
                _ => self.connect_with_backoff().await?,
            };

            match self.send_pending(&mut conn).await {
                Ok(()) => {
                    *self.parked.lock() = Some(conn);
                    return Ok(());
                }
                Err(e) => {
                    warn!(addr = %self.addr, error = %e, "Gateway send interrupted, reconnecting");
                }
            }
        }
    }

    async fn connect_with_backoff(self: &Arc<Self>) -> GatewayResult<Connection> {
        let max_attempts = self.config.max_reconnect_attempts;
        let mut attempt: u32 = 0;

        loop {
            attempt += 1;

            match self.connect().await {
                Ok(conn) => {
                    info!(addr = %self.addr, attempt, "Connected to gateway");
                    return Ok(conn);
                }
                Err(e) => {
                    if attempt >= max_attempts {
                        return Err(GatewayError::Connection(format!(
                            "giving up on {} after {} attempts: {}",
                            self.addr, attempt, e
                        )));
                    }

                    let delay = backoff_delay(
                        self.config.reconnect_step(),
                        self.config.reconnect_max(),
                        attempt,
                    );
                    warn!(
                        addr = %self.addr,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "Gateway connect failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }

    async fn connect(self: &Arc<Self>) -> std::io::Result<Connection> {
        let weak = Arc::downgrade(self);
        let on_response: ResponseHandler = Box::new(move |response| {
            if let Some(inner) = weak.upgrade() {
                inner.handle_error_response(response);
            }
        });

        Connection::open(
            self.dialer.as_ref(),
            &self.addr,
            self.config.read_timeout(),
            on_response,
        )
        .await
    }

    /// Rewind the queue to the notification the gateway rejected.
    fn handle_error_response(self: &Arc<Self>, response: ErrorResponse) {
        let discard = response.status.discards_named();
        if !self.queue.resume_from(response.id, discard) {
            warn!(
                id = response.id,
                status = %response.status,
                "Rejected notification is no longer cached, nothing to resend"
            );
        }

        if self.queue.has_pending() {
            self.kick();
        }
    }

    /// Send everything pending on `conn`.
    ///
    /// On a write error the items of the unwritten frame are pending again.
    /// A resend requested by the gateway fails the call with `Resumed`; the
    /// resend has already made every buffered item pending.
    async fn send_pending(&self, conn: &mut Connection) -> GatewayResult<()> {
        let epoch = self.queue.epoch();

        // Backlog from a previous loop, a rewind or a resend
        let backlog = self.queue.flush_to(conn).await?;
        if backlog > 0 {
            conn.touch_deadline();
        }

        let send_delay = self.config.send_delay();
        let max_frame_size = self.queue.config().max_frame_size;
        let mut buf = self.queue.acquire_buffer();
        let mut frame_first: Option<u32> = None;
        let mut frame_count = 0usize;
        let mut next: Option<QueuedItem> = None;

        loop {
            if next.is_none() {
                next = self.queue.dequeue_in(epoch)?;
                if next.is_none() && !send_delay.is_zero() {
                    tokio::time::sleep(send_delay).await;
                    if !conn.is_alive() {
                        // Nothing in hand; the loop's pending check reconnects if needed
                        if buf.is_empty() {
                            return Ok(());
                        }
                        self.requeue_frame(frame_first, epoch);
                        return Err(GatewayError::Connection(format!(
                            "{} closed the connection",
                            self.addr
                        )));
                    }
                    next = self.queue.dequeue_in(epoch)?;
                }
            }

            let overflow = next
                .as_ref()
                .is_some_and(|item| buf.len() + item.wire_len() > max_frame_size);

            if (next.is_none() || overflow) && !buf.is_empty() {
                let written = match conn.write_all(buf.as_slice()).await {
                    Ok(()) => conn.flush().await,
                    Err(e) => Err(e),
                };
                if let Err(e) = written {
                    self.requeue_frame(frame_first, epoch);
                    return Err(e.into());
                }

                conn.touch_deadline();
                debug!(count = frame_count, bytes = buf.len(), "Sent frame");
                buf.clear();
                frame_first = None;
                frame_count = 0;
            }

            let Some(item) = next.take() else {
                return Ok(());
            };
            frame_first.get_or_insert(item.id());
            item.write_to(&mut buf);
            frame_count += 1;
        }
    }

    /// Make an unwritten frame pending again, unless a resend already did.
    fn requeue_frame(&self, frame_first: Option<u32>, epoch: u64) {
        if let Some(id) = frame_first {
            if self.queue.epoch() == epoch {
                self.queue.rewind_to(id);
            }
        }
    }
}
