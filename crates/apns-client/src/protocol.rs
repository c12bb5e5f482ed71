//! Gateway response and feedback framing.
//!
//! All integers are big-endian.

use crate::error::{GatewayError, GatewayResult};
use std::fmt;

/// Command byte of a gateway error response.
pub const COMMAND_ERROR_RESPONSE: u8 = 8;

/// Size of a gateway error response.
pub const ERROR_RESPONSE_SIZE: usize = 6;

/// Size of the fixed part of a feedback record (timestamp + token length).
pub const FEEDBACK_HEADER_SIZE: usize = 6;

/// Status reported in a gateway error response.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorStatus {
    NoErrors,
    ProcessingError,
    MissingDeviceToken,
    MissingTopic,
    MissingPayload,
    InvalidTokenSize,
    InvalidTopicSize,
    InvalidPayloadSize,
    InvalidToken,
    /// Gateway is closing the connection; the id is the last one it accepted.
    Shutdown,
    Unknown,
}

impl ErrorStatus {
    /// Convert from wire format byte. Unassigned codes map to `Unknown`.
    pub fn from_byte(byte: u8) -> Self {
        match byte {
            0 => ErrorStatus::NoErrors,
            1 => ErrorStatus::ProcessingError,
            2 => ErrorStatus::MissingDeviceToken,
            3 => ErrorStatus::MissingTopic,
            4 => ErrorStatus::MissingPayload,
            5 => ErrorStatus::InvalidTokenSize,
            6 => ErrorStatus::InvalidTopicSize,
            7 => ErrorStatus::InvalidPayloadSize,
            8 => ErrorStatus::InvalidToken,
            10 => ErrorStatus::Shutdown,
            _ => ErrorStatus::Unknown,
        }
    }

    /// Convert to wire format byte.
    pub fn to_byte(self) -> u8 {
        match self {
            ErrorStatus::NoErrors => 0,
            ErrorStatus::ProcessingError => 1,
            ErrorStatus::MissingDeviceToken => 2,
            ErrorStatus::MissingTopic => 3,
            ErrorStatus::MissingPayload => 4,
            ErrorStatus::InvalidTokenSize => 5,
            ErrorStatus::InvalidTopicSize => 6,
            ErrorStatus::InvalidPayloadSize => 7,
            ErrorStatus::InvalidToken => 8,
            ErrorStatus::Shutdown => 10,
            ErrorStatus::Unknown => 255,
        }
    }

    /// Whether the named notification itself should be dropped rather than resent.
    ///
    /// Only a processing error is the gateway's fault; every other status
    /// means the notification is bad or was already accepted.
    pub fn discards_named(self) -> bool {
        self != ErrorStatus::ProcessingError
    }
}

impl fmt::Display for ErrorStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            ErrorStatus::NoErrors => "no errors",
            ErrorStatus::ProcessingError => "processing error",
            ErrorStatus::MissingDeviceToken => "missing device token",
            ErrorStatus::MissingTopic => "missing topic",
            ErrorStatus::MissingPayload => "missing payload",
            ErrorStatus::InvalidTokenSize => "invalid token size",
            ErrorStatus::InvalidTopicSize => "invalid topic size",
            ErrorStatus::InvalidPayloadSize => "invalid payload size",
            ErrorStatus::InvalidToken => "invalid token",
            ErrorStatus::Shutdown => "shutdown",
            ErrorStatus::Unknown => "unknown",
        };
        f.write_str(text)
    }
}

/// Error response sent by the gateway before it closes the connection.
///
/// Wire format:
/// ```text
/// [1: command=8][1: status][4: notification id]
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ErrorResponse {
    pub status: ErrorStatus,
    /// Id of the notification the status refers to.
    pub id: u32,
}

impl ErrorResponse {
    pub fn new(status: ErrorStatus, id: u32) -> Self {
        Self { status, id }
    }

    /// Decode an error response.
    pub fn decode(data: &[u8]) -> GatewayResult<Self> {
        if data.len() != ERROR_RESPONSE_SIZE {
            return Err(GatewayError::Protocol(format!(
                "Error response must be {} bytes, got {}",
                ERROR_RESPONSE_SIZE,
                data.len()
            )));
        }

        if data[0] != COMMAND_ERROR_RESPONSE {
            return Err(GatewayError::Protocol(format!(
                "Expected error response command {:#04x}, got {:#04x}",
                COMMAND_ERROR_RESPONSE, data[0]
            )));
        }

        let id_bytes: [u8; 4] = data[2..6]
            .try_into()
            .map_err(|_| GatewayError::Protocol("Invalid notification id length".to_string()))?;

        Ok(Self {
            status: ErrorStatus::from_byte(data[1]),
            id: u32::from_be_bytes(id_bytes),
        })
    }

    /// Encode to wire format.
    pub fn encode(&self) -> [u8; ERROR_RESPONSE_SIZE] {
        let id = self.id.to_be_bytes();
        [
            COMMAND_ERROR_RESPONSE,
            self.status.to_byte(),
            id[0],
            id[1],
            id[2],
            id[3],
        ]
    }
}
