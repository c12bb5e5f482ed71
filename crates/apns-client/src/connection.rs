//! Connections to the gateway.
//!
//! The gateway never acknowledges a notification. The only thing it ever
//! writes back is a single error response, right before it closes the
//! connection. Each [`Connection`] therefore pairs the write half, owned by
//! the driver, with a reader task that waits for that response, end of
//! stream, or the read deadline.

use crate::protocol::{ErrorResponse, ERROR_RESPONSE_SIZE};
use async_trait::async_trait;
use std::io;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::net::TcpStream;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, trace, warn};

/// Byte stream a [`Dialer`] hands back.
pub trait AsyncStream: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> AsyncStream for T {}

/// Boxed stream to the gateway or feedback service.
pub type GatewayStream = Box<dyn AsyncStream>;

/// Opens streams to the gateway.
///
/// The gateway requires TLS with a client certificate; callers plug that in
/// with their own dialer. [`TcpDialer`] covers plain TCP.
#[async_trait]
pub trait Dialer: Send + Sync {
    async fn dial(&self, addr: &str) -> io::Result<GatewayStream>;
}

/// Plain TCP dialer with a connect timeout.
#[derive(Debug, Clone)]
pub struct TcpDialer {
    connect_timeout: Duration,
}

impl TcpDialer {
    pub fn new(connect_timeout: Duration) -> Self {
        Self { connect_timeout }
    }
}

impl Default for TcpDialer {
    fn default() -> Self {
        Self::new(Duration::from_secs(10))
    }
}

#[async_trait]
impl Dialer for TcpDialer {
    async fn dial(&self, addr: &str) -> io::Result<GatewayStream> {
        let stream = tokio::time::timeout(self.connect_timeout, TcpStream::connect(addr))
            .await
            .map_err(|_| {
                io::Error::new(
                    io::ErrorKind::TimedOut,
                    format!("connect to {} timed out", addr),
                )
            })??;
        stream.set_nodelay(true)?;
        Ok(Box::new(stream))
    }
}

/// Called with the gateway's error response, at most once per connection.
pub(crate) type ResponseHandler = Box<dyn FnOnce(ErrorResponse) + Send>;

/// Live connection to the gateway.
///
/// Writes fail with `BrokenPipe` once the connection is known to be dead.
pub struct Connection {
    addr: String,
    writer: WriteHalf<GatewayStream>,
    alive: Arc<AtomicBool>,
    deadline: watch::Sender<Instant>,
    read_timeout: Duration,
    reader: JoinHandle<()>,
}

impl Connection {
    /// Dial `addr` and start watching for an error response.
    pub(crate) async fn open(
        dialer: &dyn Dialer,
        addr: &str,
        read_timeout: Duration,
        on_response: ResponseHandler,
    ) -> io::Result<Self> {
        let stream = dialer.dial(addr).await?;
        let (read_half, writer) = tokio::io::split(stream);

        let alive = Arc::new(AtomicBool::new(true));
        let (deadline, deadline_rx) = watch::channel(Instant::now() + read_timeout);
        let reader = tokio::spawn(watch_responses(
            read_half,
            deadline_rx,
            alive.clone(),
            on_response,
            addr.to_string(),
        ));

        Ok(Self {
            addr: addr.to_string(),
            writer,
            alive,
            deadline,
            read_timeout,
            reader,
        })
    }

    /// Address this connection was dialed to.
    pub fn addr(&self) -> &str {
        &self.addr
    }

    /// False once the gateway answered, hung up, or stayed silent past the deadline.
    pub fn is_alive(&self) -> bool {
        self.alive.load(Ordering::SeqCst) && !self.reader.is_finished()
    }

    /// Push the read deadline out by the read timeout.
    pub fn touch_deadline(&self) {
        self.deadline.send_replace(Instant::now() + self.read_timeout);
    }

    /// Shut down the write side and stop the reader.
    pub async fn close(mut self) {
        if let Err(e) = self.writer.shutdown().await {
            trace!(addr = %self.addr, error = %e, "Shutdown failed");
        }
        self.alive.store(false, Ordering::SeqCst);
        self.reader.abort();
    }

    fn broken_pipe(&self) -> io::Error {
        io::Error::new(
            io::ErrorKind::BrokenPipe,
            format!("connection to {} is closed", self.addr),
        )
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.reader.abort();
    }
}

impl AsyncWrite for Connection {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        if !self.is_alive() {
            return Poll::Ready(Err(self.broken_pipe()));
        }
        Pin::new(&mut self.writer).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        if !self.is_alive() {
            return Poll::Ready(Err(self.broken_pipe()));
        }
        Pin::new(&mut self.writer).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.writer).poll_shutdown(cx)
    }
}

/// Wait for the gateway to say something, hang up, or time out.
async fn watch_responses(
    mut reader: ReadHalf<GatewayStream>,
    mut deadline: watch::Receiver<Instant>,
    alive: Arc<AtomicBool>,
    on_response: ResponseHandler,
    addr: String,
) {
    let mut buf = [0u8; ERROR_RESPONSE_SIZE];
    let mut filled = 0;
    let mut on_response = Some(on_response);

    loop {
        let until = *deadline.borrow_and_update();

        tokio::select! {
            result = reader.read(&mut buf[filled..]) => match result {
                Ok(0) => {
                    debug!(addr = %addr, "Gateway closed connection");
                    break;
                }
                Ok(n) => {
                    filled += n;
                    if filled < ERROR_RESPONSE_SIZE {
                        continue;
                    }

                    // Dead before anyone hears about the response
                    alive.store(false, Ordering::SeqCst);
                    match ErrorResponse::decode(&buf) {
                        Ok(response) => {
                            warn!(
                                addr = %addr,
                                status = %response.status,
                                id = response.id,
                                "Gateway rejected notification"
                            );
                            if let Some(handler) = on_response.take() {
                                handler(response);
                            }
                        }
                        Err(e) => warn!(addr = %addr, error = %e, "Undecodable gateway response"),
                    }
                    break;
                }
                Err(e) => {
                    debug!(addr = %addr, error = %e, "Gateway read failed");
                    break;
                }
            },
            _ = tokio::time::sleep_until(until) => {
                debug!(addr = %addr, "Read deadline passed, dropping connection");
                break;
            }
            changed = deadline.changed() => {
                if changed.is_err() {
                    break;
                }
            }
        }
    }

    alive.store(false, Ordering::SeqCst);
}
