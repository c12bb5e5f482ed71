//! Error types for the gateway client.

use crate::feedback::FeedbackRecord;
use apns_queue::QueueError;
use std::time::Duration;
use thiserror::Error;

/// Gateway client error type.
#[derive(Error, Debug)]
pub enum GatewayError {
    /// Queue rejected or failed to flush notifications
    #[error("Queue error: {0}")]
    Queue(#[from] QueueError),

    /// IO error (socket, file operations)
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Could not reach the gateway
    #[error("Connection error: {0}")]
    Connection(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// JSON error (config files)
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Protocol error (unexpected bytes from the gateway)
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Operation did not finish in time
    #[error("Timed out after {0:?}")]
    Timeout(Duration),

    /// Feedback stream failed; carries the records read before the failure
    #[error("Feedback read failed after {} records: {source}", records.len())]
    Feedback {
        records: Vec<FeedbackRecord>,
        #[source]
        source: std::io::Error,
    },
}

/// Result type for gateway client operations.
pub type GatewayResult<T> = Result<T, GatewayError>;
