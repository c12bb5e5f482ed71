//! Notification queue for the APNs binary gateway.
//!
//! This crate provides:
//! - Notification: caller-facing template (JSON payload, expiry, priority)
//! - QueuedItem: one notification bound to one device token, with its wire encoding
//! - NotificationQueue: ordered pending queue that doubles as the recently-sent cache
//! - BufferPool: reusable frame buffers with scoped release

mod error;
mod eviction;
mod notification;
mod pool;
mod queue;

pub use error::{QueueError, QueueResult};
pub use eviction::EvictionTask;
pub use notification::{
    DeviceToken, Notification, PayloadTemplate, Priority, QueuedItem, COMMAND_ENHANCED,
    COMMAND_FRAMED, MAX_PAYLOAD_SIZE, TOKEN_SIZE,
};
pub use pool::{BufferPool, PooledBuffer, DEFAULT_BUFFER_CAPACITY, MAX_POOLED_CAPACITY};
pub use queue::{NotificationQueue, QueueConfig, DEFAULT_MAX_FRAME_SIZE, DEFAULT_RETENTION};
