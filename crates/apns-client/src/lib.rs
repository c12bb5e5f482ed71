//! Client for the APNs binary gateway.
//!
//! Notifications are expanded per device token into an ordered queue, batched
//! into frames and streamed over one persistent connection. The gateway only
//! ever answers with an error response naming the first notification it
//! rejected; the client rewinds the queue to that point and resends the rest.
//!
//! This crate provides:
//! - Client: single-flight delivery driver with reconnect backoff
//! - Dialer / TcpDialer: how connections to the gateway are opened
//! - ErrorResponse: the gateway's 6-byte error response
//! - read_feedback: drains the feedback service's invalid-token reports
//!
//! # Architecture
//!
//! ```text
//! send() -> NotificationQueue -> driver loop -> Connection -> gateway
//!                 ^                                 |
//!                 |____ resume_from <_ error response
//! ```

pub mod config;
pub mod connection;
pub mod driver;
pub mod error;
pub mod feedback;
pub mod protocol;

#[cfg(test)]
mod tests;

pub use apns_queue::{DeviceToken, Notification, NotificationQueue, Priority, QueueError};
pub use config::GatewayConfig;
pub use connection::{AsyncStream, Connection, Dialer, GatewayStream, TcpDialer};
pub use driver::Client;
pub use error::{GatewayError, GatewayResult};
pub use feedback::{read_feedback, read_records, FeedbackRecord};
pub use protocol::{ErrorResponse, ErrorStatus};
