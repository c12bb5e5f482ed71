//! Queue error types.

use thiserror::Error;

/// Queue error type.
#[derive(Error, Debug)]
pub enum QueueError {
    /// The notification template cannot be serialized for the gateway.
    #[error("Malformed payload: {0}")]
    MalformedPayload(String),

    /// A frame write failed part-way through a flush.
    #[error("Flush failed after {written} bytes: {source}")]
    Flush {
        written: u64,
        #[source]
        source: std::io::Error,
    },

    /// An error response rewound the queue after the caller read `epoch`.
    #[error("Queue resumed since epoch {epoch}")]
    Resumed { epoch: u64 },
}

/// Result type alias using QueueError.
pub type QueueResult<T> = Result<T, QueueError>;
