//! Ordered notification queue that doubles as the recently-sent cache.
//!
//! Items live in a single `VecDeque` split by a cursor. Everything before
//! `pending_from` has been handed to the gateway and is kept around so an
//! error response can rewind the stream; everything from the cursor on is
//! waiting to be sent. Sent timestamps never decrease along the sent region,
//! which lets eviction stop at the first stale item it meets walking backwards.
//!
//! Every `resume_from` bumps the queue's epoch. A sender that read items under
//! an older epoch holds a frame the gateway has already thrown away, so
//! `dequeue_in` and the publish step of `flush_to` refuse to move the cursor
//! for it.

use crate::{
    BufferPool, DeviceToken, EvictionTask, Notification, PooledBuffer, QueueError, QueueResult,
    QueuedItem,
};
use parking_lot::{RwLock, RwLockUpgradableReadGuard};
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Default ceiling for a single frame write.
pub const DEFAULT_MAX_FRAME_SIZE: usize = 65_535;

/// Default time a sent notification stays available for resending.
pub const DEFAULT_RETENTION: Duration = Duration::from_secs(5 * 60);

const DEFAULT_INITIAL_CAPACITY: usize = 1000;

/// Queue tunables.
#[derive(Debug, Clone)]
pub struct QueueConfig {
    /// A frame is written out before it would grow past this many bytes.
    pub max_frame_size: usize,
    /// Sent notifications older than this are evicted.
    pub retention: Duration,
    /// Preallocated item slots.
    pub initial_capacity: usize,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
            retention: DEFAULT_RETENTION,
            initial_capacity: DEFAULT_INITIAL_CAPACITY,
        }
    }
}

#[derive(Debug)]
struct QueueState {
    items: VecDeque<QueuedItem>,
    /// Index of the first item not yet sent.
    pending_from: usize,
    id_counter: u32,
    /// Bumped by every resend.
    epoch: u64,
}

impl QueueState {
    fn next_id(&mut self) -> u32 {
        // 0 marks an unassigned id
        self.id_counter = self.id_counter.wrapping_add(1);
        if self.id_counter == 0 {
            self.id_counter = 1;
        }
        self.id_counter
    }

    fn take_next(&mut self) -> Option<QueuedItem> {
        let index = self.pending_from;
        let item = {
            let item = self.items.get_mut(index)?;
            item.sent_at = Some(Instant::now());
            item.clone()
        };
        self.pending_from += 1;
        Some(item)
    }

    /// Index of `id` within the sent region.
    fn position_sent(&self, id: u32) -> Option<usize> {
        self.items.range(..self.pending_from).position(|item| item.id == id)
    }
}

/// Thread-safe queue of notifications waiting for, or recently through, the gateway.
#[derive(Debug)]
pub struct NotificationQueue {
    config: QueueConfig,
    state: RwLock<QueueState>,
    pool: BufferPool,
}

impl NotificationQueue {
    /// Create a queue with the given tunables.
    pub fn new(config: QueueConfig) -> Self {
        let state = QueueState {
            items: VecDeque::with_capacity(config.initial_capacity),
            pending_from: 0,
            id_counter: 0,
            epoch: 0,
        };

        Self {
            config,
            state: RwLock::new(state),
            pool: BufferPool::new(),
        }
    }

    /// Create with default tunables.
    pub fn with_defaults() -> Self {
        Self::new(QueueConfig::default())
    }

    /// Queue tunables.
    pub fn config(&self) -> &QueueConfig {
        &self.config
    }

    /// Borrow a frame buffer from the queue's pool.
    pub fn acquire_buffer(&self) -> PooledBuffer<'_> {
        self.pool.acquire()
    }

    /// Queue `notification` once for every valid hex token.
    ///
    /// Tokens that are not 32 bytes of valid hex are skipped. If the
    /// notification cannot be converted nothing is queued. Returns the number
    /// of items added.
    pub fn enqueue<I, S>(&self, notification: &Notification, tokens: I) -> QueueResult<usize>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let tokens: Vec<S> = tokens.into_iter().collect();
        if tokens.is_empty() {
            return Ok(0);
        }

        let template = notification.convert()?;
        let valid: Vec<DeviceToken> = tokens
            .iter()
            .filter_map(|token| DeviceToken::from_hex(token.as_ref()))
            .collect();

        let skipped = tokens.len() - valid.len();
        if skipped > 0 {
            debug!(skipped, "Ignoring malformed device tokens");
        }

        let mut state = self.state.write();
        for token in valid.iter() {
            let id = state.next_id();
            state.items.push_back(template.with_token(*token).with_id(id));
        }

        debug!(count = valid.len(), last_id = state.id_counter, "Enqueued notifications");
        Ok(valid.len())
    }

    /// Admit externally built items, assigning ids to those without one.
    pub fn append<I>(&self, items: I)
    where
        I: IntoIterator<Item = QueuedItem>,
    {
        let mut state = self.state.write();
        for mut item in items {
            if item.id == 0 {
                item.id = state.next_id();
            }
            item.sent_at = None;
            state.items.push_back(item);
        }
    }

    /// True if at least one item is waiting to be sent.
    pub fn has_pending(&self) -> bool {
        let state = self.state.read();
        state.items.len() > state.pending_from
    }

    /// Number of items waiting to be sent.
    pub fn pending_len(&self) -> usize {
        let state = self.state.read();
        state.items.len() - state.pending_from
    }

    /// Number of items held, sent and pending.
    pub fn len(&self) -> usize {
        self.state.read().items.len()
    }

    /// True if the queue holds nothing at all.
    pub fn is_empty(&self) -> bool {
        self.state.read().items.is_empty()
    }

    /// Number of resends so far.
    pub fn epoch(&self) -> u64 {
        self.state.read().epoch
    }

    /// Take the next pending item, marking it sent.
    pub fn dequeue(&self) -> Option<QueuedItem> {
        self.state.write().take_next()
    }

    /// Like [`dequeue`](Self::dequeue), but fails with `Resumed` if a resend
    /// happened since `epoch` was read.
    pub fn dequeue_in(&self, epoch: u64) -> QueueResult<Option<QueuedItem>> {
        let mut state = self.state.write();
        if state.epoch != epoch {
            return Err(QueueError::Resumed { epoch });
        }
        Ok(state.take_next())
    }

    /// Write every pending item to `sink`, batching into frames.
    ///
    /// Items are encoded without holding the lock; the cursor moves past a
    /// frame's items only once that frame has been written. On failure the
    /// error carries the number of bytes in frames that did go out.
    pub async fn flush_to<W>(&self, sink: &mut W) -> QueueResult<u64>
    where
        W: AsyncWrite + Unpin + ?Sized,
    {
        let (epoch, pending): (u64, Vec<QueuedItem>) = {
            let state = self.state.read();
            let pending = state.items.range(state.pending_from..).cloned().collect();
            (state.epoch, pending)
        };
        if pending.is_empty() {
            return Ok(0);
        }

        let max_frame_size = self.config.max_frame_size;
        let mut buf = self.pool.acquire();
        let mut written: u64 = 0;
        let mut frame_start = 0;

        for (index, item) in pending.iter().enumerate() {
            if !buf.is_empty() && buf.len() + item.wire_len() > max_frame_size {
                written += write_frame(sink, &mut buf, written).await?;
                if !self.publish_sent(&pending[frame_start..index], epoch) {
                    return Ok(written);
                }
                frame_start = index;
            }
            item.write_to(&mut buf);
        }

        written += write_frame(sink, &mut buf, written).await?;
        if !self.publish_sent(&pending[frame_start..], epoch) {
            return Ok(written);
        }

        debug!(count = pending.len(), bytes = written, "Flushed pending notifications");
        Ok(written)
    }

    /// Mark a written frame's items as sent and move the cursor past them.
    ///
    /// Returns false if a resend happened since `epoch` or the cursor no
    /// longer points at the frame's first item.
    fn publish_sent(&self, items: &[QueuedItem], epoch: u64) -> bool {
        let Some(first) = items.first() else {
            return true;
        };

        let mut state = self.state.write();
        let start = state.pending_from;
        if state.epoch != epoch || state.items.get(start).map(|item| item.id) != Some(first.id) {
            warn!(
                expected_id = first.id,
                epoch,
                current_epoch = state.epoch,
                "Queue cursor moved during flush, not advancing"
            );
            return false;
        }

        let now = Instant::now();
        let end = (start + items.len()).min(state.items.len());
        for item in state.items.range_mut(start..end) {
            item.sent_at = Some(now);
        }
        state.pending_from = end;
        true
    }

    /// Restart sending from the sent item with the given id.
    ///
    /// Everything before the match is dropped, as is the match itself when
    /// `exclude_matched` is set; the rest becomes pending again. Returns false,
    /// leaving the queue untouched, if no sent item has that id.
    pub fn resume_from(&self, id: u32, exclude_matched: bool) -> bool {
        let state = self.state.upgradable_read();
        let Some(index) = state.position_sent(id) else {
            debug!(id, "Resend id not in sent cache");
            return false;
        };

        let mut state = RwLockUpgradableReadGuard::upgrade(state);
        let discard = if exclude_matched { index + 1 } else { index };
        state.items.drain(..discard);

        let resend = state.pending_from - discard;
        for item in state.items.range_mut(..resend) {
            item.sent_at = None;
        }
        state.pending_from = 0;
        state.epoch += 1;

        info!(id, discarded = discard, resend, epoch = state.epoch, "Resuming from notification");
        true
    }

    /// Move the cursor back to the sent item with the given id, keeping
    /// everything in the cache. Returns false if no sent item has that id.
    pub fn rewind_to(&self, id: u32) -> bool {
        let state = self.state.upgradable_read();
        let Some(index) = state.position_sent(id) else {
            return false;
        };

        let mut state = RwLockUpgradableReadGuard::upgrade(state);
        let end = state.pending_from;
        for item in state.items.range_mut(index..end) {
            item.sent_at = None;
        }
        state.pending_from = index;

        debug!(id, requeued = end - index, "Rewound queue cursor");
        true
    }

    /// Drop sent items older than `retention`. Returns how many were removed.
    pub fn evict_expired(&self, retention: Duration) -> usize {
        match Instant::now().checked_sub(retention) {
            Some(cutoff) => self.evict_sent_before(cutoff),
            None => 0,
        }
    }

    /// Drop every sent item stamped at or before `cutoff`.
    pub fn evict_sent_before(&self, cutoff: Instant) -> usize {
        let state = self.state.upgradable_read();

        // Stamps are ordered, so the newest stale item bounds the prefix.
        let stale = (0..state.pending_from)
            .rev()
            .find(|&index| state.items[index].sent_at.is_some_and(|at| at <= cutoff));
        let Some(index) = stale else {
            return 0;
        };

        let mut state = RwLockUpgradableReadGuard::upgrade(state);
        let removed = index + 1;
        state.items.drain(..removed);
        state.pending_from -= removed;
        removed
    }

    /// Start the periodic eviction task for this queue.
    ///
    /// The task runs every `retention` and stops when the returned handle is
    /// dropped or the queue itself goes away.
    pub fn spawn_eviction(self: &Arc<Self>) -> EvictionTask {
        EvictionTask::spawn(Arc::downgrade(self), self.config.retention)
    }
}

async fn write_frame<W>(sink: &mut W, buf: &mut Vec<u8>, written: u64) -> QueueResult<u64>
where
    W: AsyncWrite + Unpin + ?Sized,
{
    let len = buf.len() as u64;
    let result = match sink.write_all(buf.as_slice()).await {
        Ok(()) => sink.flush().await,
        Err(e) => Err(e),
    };
    buf.clear();

    result
        .map(|()| len)
        .map_err(|source| QueueError::Flush { written, source })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io;
    use std::pin::Pin;
    use std::task::{Context, Poll};

    /// Sink that records every write call and can fail after a number of writes.
    #[derive(Default)]
    struct RecordingSink {
        writes: Vec<Vec<u8>>,
        fail_after: Option<usize>,
    }

    impl AsyncWrite for RecordingSink {
        fn poll_write(
            mut self: Pin<&mut Self>,
            _cx: &mut Context<'_>,
            buf: &[u8],
        ) -> Poll<io::Result<usize>> {
            if self.fail_after.is_some_and(|limit| self.writes.len() >= limit) {
                return Poll::Ready(Err(io::Error::new(io::ErrorKind::BrokenPipe, "sink closed")));
            }
            self.writes.push(buf.to_vec());
            Poll::Ready(Ok(buf.len()))
        }

        fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
            Poll::Ready(Ok(()))
        }

        fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
            Poll::Ready(Ok(()))
        }
    }

    fn tokens(count: usize) -> Vec<String> {
        (0..count).map(|i| format!("{:02x}", i % 256).repeat(32)).collect()
    }

    /// Notification whose enhanced record is exactly `wire_len` bytes.
    fn notification_of_wire_len(wire_len: usize) -> Notification {
        // 45 bytes of record header + `{"p":""}` (8 bytes) around the filler
        Notification::new(serde_json::json!({ "p": "x".repeat(wire_len - 53) }))
    }

    fn queue_with_frame_size(max_frame_size: usize) -> NotificationQueue {
        NotificationQueue::new(QueueConfig {
            max_frame_size,
            ..Default::default()
        })
    }

    fn ids(queue: &NotificationQueue) -> Vec<u32> {
        queue.state.read().items.iter().map(|item| item.id).collect()
    }

    fn pending_from(queue: &NotificationQueue) -> usize {
        queue.state.read().pending_from
    }

    fn assert_invariants(queue: &NotificationQueue) {
        let state = queue.state.read();
        assert!(state.pending_from <= state.items.len());

        let mut last: Option<Instant> = None;
        for (index, item) in state.items.iter().enumerate() {
            if index < state.pending_from {
                let sent_at = item.sent_at.expect("sent item without timestamp");
                if let Some(last) = last {
                    assert!(sent_at >= last, "sent timestamps must not decrease");
                }
                last = Some(sent_at);
            } else {
                assert!(item.sent_at.is_none(), "pending item with timestamp");
            }
        }
    }

    fn record_ids(frame: &[u8], record_len: usize) -> Vec<u32> {
        frame
            .chunks(record_len)
            .map(|record| u32::from_be_bytes(record[1..5].try_into().unwrap()))
            .collect()
    }

    #[test]
    fn test_ids_are_monotonic() {
        let queue = NotificationQueue::with_defaults();
        let ntf = Notification::alert("hello");

        assert_eq!(queue.enqueue(&ntf, tokens(3)).unwrap(), 3);
        assert_eq!(queue.enqueue(&ntf, tokens(2)).unwrap(), 2);
        queue.dequeue();
        assert_eq!(queue.enqueue(&ntf, tokens(4)).unwrap(), 4);

        assert_eq!(ids(&queue), (1..=9).collect::<Vec<u32>>());
        assert_invariants(&queue);
    }

    #[test]
    fn test_concurrent_enqueue_keeps_ids_unique_and_ordered() {
        let queue = NotificationQueue::with_defaults();
        let ntf = Notification::alert("hello");

        std::thread::scope(|scope| {
            for _ in 0..4 {
                scope.spawn(|| {
                    for _ in 0..50 {
                        queue.enqueue(&ntf, tokens(5)).unwrap();
                    }
                });
            }
        });

        let ids = ids(&queue);
        assert_eq!(ids.len(), 1000);
        assert!(ids.windows(2).all(|pair| pair[0] < pair[1]));
    }

    #[test]
    fn test_invalid_tokens_are_skipped() {
        let queue = NotificationQueue::with_defaults();
        let ntf = Notification::alert("hello");
        let valid = "aa".repeat(32);

        let short = "aa".repeat(31);
        let long = "aa".repeat(33);
        let not_hex = "zz".repeat(32);
        assert_eq!(queue.enqueue(&ntf, [&short, &long, &not_hex]).unwrap(), 0);
        assert!(queue.is_empty());

        assert_eq!(queue.enqueue(&ntf, [&short, &valid, &not_hex]).unwrap(), 1);
        assert_eq!(queue.len(), 1);

        let item = queue.dequeue().unwrap();
        assert_eq!(item.token().as_bytes(), &[0xAA; 32]);
    }

    #[test]
    fn test_malformed_payload_queues_nothing() {
        let queue = NotificationQueue::with_defaults();
        let ntf = Notification::new(serde_json::json!("not an object"));

        let result = queue.enqueue(&ntf, tokens(10));
        assert!(matches!(result, Err(QueueError::MalformedPayload(_))));
        assert!(queue.is_empty());
        assert!(!queue.has_pending());
    }

    #[test]
    fn test_empty_token_list_is_a_noop() {
        let queue = NotificationQueue::with_defaults();
        let ntf = Notification::new(serde_json::json!("never converted"));

        assert_eq!(queue.enqueue(&ntf, Vec::<String>::new()).unwrap(), 0);
        assert!(queue.is_empty());
    }

    #[test]
    fn test_dequeue_moves_cursor_in_order() {
        let queue = NotificationQueue::with_defaults();
        queue.enqueue(&Notification::alert("hello"), tokens(3)).unwrap();
        assert!(queue.has_pending());
        assert_eq!(queue.pending_len(), 3);

        let first = queue.dequeue().unwrap();
        assert_eq!(first.id(), 1);
        assert!(first.sent_at().is_some());
        assert_eq!(pending_from(&queue), 1);
        assert_invariants(&queue);

        assert_eq!(queue.dequeue().unwrap().id(), 2);
        assert_eq!(queue.dequeue().unwrap().id(), 3);
        assert!(queue.dequeue().is_none());
        assert!(!queue.has_pending());

        // Sent items stay cached
        assert_eq!(queue.len(), 3);
        assert_invariants(&queue);
    }

    #[test]
    fn test_append_assigns_missing_ids() {
        let queue = NotificationQueue::with_defaults();
        queue.enqueue(&Notification::alert("hello"), tokens(2)).unwrap();

        let template = Notification::alert("again").convert().unwrap();
        let token = DeviceToken::from_slice(&[0x11; 32]).unwrap();
        let sent = queue.dequeue().unwrap();

        queue.append(vec![template.with_token(token), sent.clone()]);

        assert_eq!(ids(&queue), vec![1, 2, 3, 1]);
        assert_eq!(queue.pending_len(), 3);
        assert_invariants(&queue);
    }

    #[tokio::test]
    async fn test_flush_under_frame_limit() {
        let queue = queue_with_frame_size(2048);
        queue.enqueue(&notification_of_wire_len(100), tokens(10)).unwrap();

        let mut sink = RecordingSink::default();
        let written = queue.flush_to(&mut sink).await.unwrap();

        assert_eq!(written, 1000);
        assert_eq!(sink.writes.len(), 1);
        assert_eq!(sink.writes[0].len(), 1000);
        assert!(!queue.has_pending());
        assert_invariants(&queue);
    }

    #[tokio::test]
    async fn test_flush_splits_frames_at_limit() {
        let queue = queue_with_frame_size(2048);
        queue.enqueue(&notification_of_wire_len(100), tokens(30)).unwrap();

        let mut sink = RecordingSink::default();
        let written = queue.flush_to(&mut sink).await.unwrap();

        assert_eq!(written, 3000);
        let sizes: Vec<usize> = sink.writes.iter().map(Vec::len).collect();
        assert_eq!(sizes, vec![2000, 1000]);

        // Strictly increasing ids across frames, nothing repeated or skipped
        let sent: Vec<u32> = sink
            .writes
            .iter()
            .flat_map(|frame| record_ids(frame, 100))
            .collect();
        assert_eq!(sent, (1..=30).collect::<Vec<u32>>());
        assert_invariants(&queue);
    }

    #[tokio::test]
    async fn test_flush_with_nothing_pending() {
        let queue = queue_with_frame_size(2048);
        let mut sink = RecordingSink::default();

        assert_eq!(queue.flush_to(&mut sink).await.unwrap(), 0);
        assert!(sink.writes.is_empty());
    }

    #[tokio::test]
    async fn test_flush_oversized_item_goes_alone() {
        let queue = queue_with_frame_size(150);
        queue.enqueue(&notification_of_wire_len(100), tokens(1)).unwrap();
        queue.enqueue(&notification_of_wire_len(200), tokens(1)).unwrap();
        queue.enqueue(&notification_of_wire_len(100), tokens(1)).unwrap();

        let mut sink = RecordingSink::default();
        queue.flush_to(&mut sink).await.unwrap();

        let sizes: Vec<usize> = sink.writes.iter().map(Vec::len).collect();
        assert_eq!(sizes, vec![100, 200, 100]);
        assert!(!queue.has_pending());
    }

    #[tokio::test]
    async fn test_flush_failure_advances_only_written_frames() {
        let queue = queue_with_frame_size(2048);
        queue.enqueue(&notification_of_wire_len(100), tokens(30)).unwrap();

        let mut sink = RecordingSink {
            fail_after: Some(1),
            ..Default::default()
        };
        let result = queue.flush_to(&mut sink).await;

        match result {
            Err(QueueError::Flush { written, .. }) => assert_eq!(written, 2000),
            other => panic!("expected flush error, got {:?}", other),
        }
        assert_eq!(pending_from(&queue), 20);
        assert_eq!(queue.pending_len(), 10);
        assert_invariants(&queue);

        // A healthy sink picks up where the failed one stopped
        let mut sink = RecordingSink::default();
        assert_eq!(queue.flush_to(&mut sink).await.unwrap(), 1000);
        assert_eq!(record_ids(&sink.writes[0], 100), (21..=30).collect::<Vec<u32>>());
    }

    #[tokio::test]
    async fn test_flush_returns_buffer_to_pool() {
        let queue = queue_with_frame_size(2048);
        queue.enqueue(&notification_of_wire_len(100), tokens(5)).unwrap();

        let mut sink = RecordingSink {
            fail_after: Some(0),
            ..Default::default()
        };
        assert!(queue.flush_to(&mut sink).await.is_err());
        assert_eq!(queue.pool.idle_count(), 1);
    }

    #[test]
    fn test_resume_from_includes_matched() {
        let queue = NotificationQueue::with_defaults();
        queue.enqueue(&Notification::alert("hello"), tokens(6)).unwrap();
        for _ in 0..5 {
            queue.dequeue();
        }

        assert!(queue.resume_from(5, false));
        assert_eq!(ids(&queue), vec![5, 6]);
        assert_eq!(pending_from(&queue), 0);
        assert_invariants(&queue);

        assert_eq!(queue.dequeue().unwrap().id(), 5);
        assert_eq!(queue.dequeue().unwrap().id(), 6);
    }

    #[test]
    fn test_resume_from_excludes_matched() {
        let queue = NotificationQueue::with_defaults();
        queue.enqueue(&Notification::alert("hello"), tokens(6)).unwrap();
        for _ in 0..5 {
            queue.dequeue();
        }

        assert!(queue.resume_from(5, true));
        assert_eq!(ids(&queue), vec![6]);
        assert_eq!(queue.dequeue().unwrap().id(), 6);
        assert_invariants(&queue);
    }

    #[test]
    fn test_resume_from_unknown_id_leaves_queue_alone() {
        let queue = NotificationQueue::with_defaults();
        queue.enqueue(&Notification::alert("hello"), tokens(6)).unwrap();
        for _ in 0..5 {
            queue.dequeue();
        }

        // Pending and unknown ids are not in the sent region
        assert!(!queue.resume_from(6, false));
        assert!(!queue.resume_from(42, true));
        assert_eq!(ids(&queue), (1..=6).collect::<Vec<u32>>());
        assert_eq!(pending_from(&queue), 5);
    }

    #[test]
    fn test_rewind_keeps_cache() {
        let queue = NotificationQueue::with_defaults();
        queue.enqueue(&Notification::alert("hello"), tokens(5)).unwrap();
        for _ in 0..4 {
            queue.dequeue();
        }

        assert!(queue.rewind_to(3));
        assert_eq!(queue.len(), 5);
        assert_eq!(pending_from(&queue), 2);
        assert_invariants(&queue);
        assert_eq!(queue.dequeue().unwrap().id(), 3);

        assert!(!queue.rewind_to(5));
    }

    #[test]
    fn test_dequeue_in_refuses_after_resend() {
        let queue = NotificationQueue::with_defaults();
        queue.enqueue(&Notification::alert("hello"), tokens(6)).unwrap();
        let epoch = queue.epoch();
        for _ in 0..4 {
            queue.dequeue_in(epoch).unwrap();
        }

        assert!(queue.resume_from(2, true));
        assert_eq!(queue.epoch(), epoch + 1);
        assert!(matches!(
            queue.dequeue_in(epoch),
            Err(QueueError::Resumed { epoch: stale }) if stale == epoch
        ));
        assert_eq!(pending_from(&queue), 0);

        let item = queue.dequeue_in(queue.epoch()).unwrap().unwrap();
        assert_eq!(item.id(), 3);
        assert_invariants(&queue);
    }

    /// Sink that resends from `id` on the queue during its first write, the
    /// way an error response can land while a frame is in flight.
    struct ResendingSink<'a> {
        queue: &'a NotificationQueue,
        id: u32,
        writes: usize,
    }

    impl AsyncWrite for ResendingSink<'_> {
        fn poll_write(
            mut self: Pin<&mut Self>,
            _cx: &mut Context<'_>,
            buf: &[u8],
        ) -> Poll<io::Result<usize>> {
            if self.writes == 0 {
                assert!(self.queue.resume_from(self.id, true));
            }
            self.writes += 1;
            Poll::Ready(Ok(buf.len()))
        }

        fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
            Poll::Ready(Ok(()))
        }

        fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
            Poll::Ready(Ok(()))
        }
    }

    #[tokio::test]
    async fn test_flush_does_not_publish_frame_discarded_by_resend() {
        let queue = queue_with_frame_size(2048);
        queue.enqueue(&notification_of_wire_len(100), tokens(5)).unwrap();
        for _ in 0..3 {
            queue.dequeue();
        }

        // The resend leaves 4 at the cursor, the same first id as the frame
        let mut sink = ResendingSink {
            queue: &queue,
            id: 3,
            writes: 0,
        };
        assert_eq!(queue.flush_to(&mut sink).await.unwrap(), 200);

        assert_eq!(ids(&queue), vec![4, 5]);
        assert_eq!(pending_from(&queue), 0);
        assert_eq!(queue.pending_len(), 2);
        assert_invariants(&queue);
    }

    #[tokio::test(start_paused = true)]
    async fn test_eviction_removes_exact_stale_prefix() {
        let queue = NotificationQueue::with_defaults();
        queue.enqueue(&Notification::alert("hello"), tokens(6)).unwrap();

        // Sent at t0, t0+1s, ..., t0+4s
        for _ in 0..5 {
            queue.dequeue();
            tokio::time::advance(Duration::from_secs(1)).await;
        }

        // Now t0+5s: nothing is older than 10s
        assert_eq!(queue.evict_expired(Duration::from_secs(10)), 0);
        assert_eq!(queue.len(), 6);

        // Cutoff t0+2s removes the items sent at t0, t0+1s and t0+2s
        assert_eq!(queue.evict_expired(Duration::from_secs(3)), 3);
        assert_eq!(ids(&queue), vec![4, 5, 6]);
        assert_eq!(pending_from(&queue), 2);
        assert_invariants(&queue);
    }

    #[tokio::test(start_paused = true)]
    async fn test_eviction_never_touches_pending() {
        let queue = NotificationQueue::with_defaults();
        queue.enqueue(&Notification::alert("hello"), tokens(3)).unwrap();
        tokio::time::advance(Duration::from_secs(60)).await;

        assert_eq!(queue.evict_sent_before(Instant::now()), 0);
        assert_eq!(queue.pending_len(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_eviction_task_trims_cache() {
        let queue = Arc::new(NotificationQueue::new(QueueConfig {
            retention: Duration::from_secs(10),
            ..Default::default()
        }));
        queue.enqueue(&Notification::alert("hello"), tokens(4)).unwrap();
        queue.dequeue();
        queue.dequeue();

        let task = queue.spawn_eviction();
        tokio::time::sleep(Duration::from_secs(11)).await;

        assert_eq!(ids(&queue), vec![3, 4]);
        assert_eq!(pending_from(&queue), 0);

        task.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_eviction_task_stops_with_queue() {
        let queue = Arc::new(NotificationQueue::new(QueueConfig {
            retention: Duration::from_secs(1),
            ..Default::default()
        }));
        let task = queue.spawn_eviction();

        drop(queue);
        tokio::time::sleep(Duration::from_secs(2)).await;

        assert!(task.is_finished());
    }
}
