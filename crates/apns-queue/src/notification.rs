//! Notification templates and their binary gateway encoding.

use crate::{QueueError, QueueResult};
use bytes::{BufMut, Bytes};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use tokio::time::Instant;

/// Size of a device token in bytes.
pub const TOKEN_SIZE: usize = 32;

/// Largest serialized JSON payload the gateway accepts.
pub const MAX_PAYLOAD_SIZE: usize = 2048;

/// Command byte for the enhanced notification format (no priority).
pub const COMMAND_ENHANCED: u8 = 1;

/// Command byte for the item-framed notification format.
pub const COMMAND_FRAMED: u8 = 2;

const ITEM_TOKEN: u8 = 1;
const ITEM_PAYLOAD: u8 = 2;
const ITEM_ID: u8 = 3;
const ITEM_EXPIRY: u8 = 4;
const ITEM_PRIORITY: u8 = 5;

/// command + id + expiry + token_len + token + payload_len
const ENHANCED_OVERHEAD: usize = 1 + 4 + 4 + 2 + TOKEN_SIZE + 2;

/// command + frame_len
const FRAMED_HEADER: usize = 1 + 4;

/// Every framed item carries a 1-byte item id and a 2-byte length.
const ITEM_HEADER: usize = 1 + 2;

const FRAMED_OVERHEAD: usize = FRAMED_HEADER
    + (ITEM_HEADER + TOKEN_SIZE)
    + ITEM_HEADER
    + (ITEM_HEADER + 4)
    + (ITEM_HEADER + 4)
    + (ITEM_HEADER + 1);

/// Delivery priority of a notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    /// Deliver immediately.
    Immediate,
    /// Deliver at a time that conserves power on the device.
    PowerSaving,
}

impl Priority {
    /// Convert to wire format byte.
    pub fn to_byte(self) -> u8 {
        match self {
            Priority::Immediate => 10,
            Priority::PowerSaving => 5,
        }
    }
}

/// A 32-byte device token.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DeviceToken([u8; TOKEN_SIZE]);

impl DeviceToken {
    /// Parse a hex-encoded token. Returns `None` for bad hex or a wrong length.
    pub fn from_hex(token: &str) -> Option<Self> {
        let bytes = hex::decode(token.trim()).ok()?;
        Self::from_slice(&bytes)
    }

    /// Build a token from raw bytes. Returns `None` unless exactly 32 bytes.
    pub fn from_slice(bytes: &[u8]) -> Option<Self> {
        <[u8; TOKEN_SIZE]>::try_from(bytes).ok().map(Self)
    }

    /// Raw token bytes.
    pub fn as_bytes(&self) -> &[u8; TOKEN_SIZE] {
        &self.0
    }
}

impl fmt::Display for DeviceToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

/// Notification as supplied by callers.
///
/// The same template is fanned out to every token passed to
/// [`NotificationQueue::enqueue`](crate::NotificationQueue::enqueue).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Notification {
    /// JSON payload; must be an object (usually carrying an `aps` dictionary).
    pub payload: serde_json::Value,
    /// When the gateway may stop trying to deliver.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expiry: Option<DateTime<Utc>>,
    /// Delivery priority. When set the item-framed format is used.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub priority: Option<Priority>,
}

impl Notification {
    /// Create a notification from a JSON payload.
    pub fn new(payload: serde_json::Value) -> Self {
        Self {
            payload,
            expiry: None,
            priority: None,
        }
    }

    /// Create a notification that shows a plain alert.
    pub fn alert(text: impl Into<String>) -> Self {
        Self::new(serde_json::json!({ "aps": { "alert": text.into() } }))
    }

    /// Set the expiry.
    pub fn with_expiry(mut self, expiry: DateTime<Utc>) -> Self {
        self.expiry = Some(expiry);
        self
    }

    /// Set the priority.
    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = Some(priority);
        self
    }

    /// Convert into the internal representation shared by every token.
    pub fn convert(&self) -> QueueResult<PayloadTemplate> {
        let object = self
            .payload
            .as_object()
            .ok_or_else(|| QueueError::MalformedPayload("payload must be a JSON object".to_string()))?;
        if object.is_empty() {
            return Err(QueueError::MalformedPayload("payload is empty".to_string()));
        }

        let encoded = serde_json::to_vec(&self.payload)
            .map_err(|e| QueueError::MalformedPayload(e.to_string()))?;
        if encoded.len() > MAX_PAYLOAD_SIZE {
            return Err(QueueError::MalformedPayload(format!(
                "payload is {} bytes, limit is {}",
                encoded.len(),
                MAX_PAYLOAD_SIZE
            )));
        }

        let expiry = match self.expiry {
            Some(at) => u32::try_from(at.timestamp()).map_err(|_| {
                QueueError::MalformedPayload(format!("expiry {} is out of range", at))
            })?,
            None => 0,
        };

        Ok(PayloadTemplate {
            payload: Bytes::from(encoded),
            expiry,
            priority: self.priority,
        })
    }
}

/// Serialized notification, ready to be bound to device tokens.
#[derive(Debug, Clone)]
pub struct PayloadTemplate {
    payload: Bytes,
    expiry: u32,
    priority: Option<Priority>,
}

impl PayloadTemplate {
    /// Serialized JSON payload.
    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    /// Bind the template to a device token. The item has no id yet.
    pub fn with_token(&self, token: DeviceToken) -> QueuedItem {
        QueuedItem {
            id: 0,
            token,
            payload: self.payload.clone(),
            expiry: self.expiry,
            priority: self.priority,
            sent_at: None,
        }
    }
}

/// One notification addressed to one device.
#[derive(Debug, Clone)]
pub struct QueuedItem {
    pub(crate) id: u32,
    pub(crate) token: DeviceToken,
    pub(crate) payload: Bytes,
    pub(crate) expiry: u32,
    pub(crate) priority: Option<Priority>,
    pub(crate) sent_at: Option<Instant>,
}

impl QueuedItem {
    /// Set the identifier. Zero means "assign one on append".
    pub fn with_id(mut self, id: u32) -> Self {
        self.id = id;
        self
    }

    /// Identifier, unique within one queue.
    pub fn id(&self) -> u32 {
        self.id
    }

    /// Destination device.
    pub fn token(&self) -> &DeviceToken {
        &self.token
    }

    /// Serialized JSON payload.
    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    /// Expiry as unix seconds, 0 for none.
    pub fn expiry(&self) -> u32 {
        self.expiry
    }

    /// Delivery priority, if any.
    pub fn priority(&self) -> Option<Priority> {
        self.priority
    }

    /// When the item was handed to the connection.
    pub fn sent_at(&self) -> Option<Instant> {
        self.sent_at
    }

    /// Number of bytes [`write_to`](Self::write_to) appends.
    pub fn wire_len(&self) -> usize {
        match self.priority {
            None => ENHANCED_OVERHEAD + self.payload.len(),
            Some(_) => FRAMED_OVERHEAD + self.payload.len(),
        }
    }

    /// Append the binary record to `buf`, returning the number of bytes written.
    ///
    /// Enhanced format:
    /// ```text
    /// [1: cmd=1][4: id][4: expiry][2: token_len][32: token][2: payload_len][N: payload]
    /// ```
    ///
    /// Framed format (used when a priority is set):
    /// ```text
    /// [1: cmd=2][4: frame_len]([1: item_id][2: item_len][N: item_data])*
    /// ```
    pub fn write_to(&self, buf: &mut Vec<u8>) -> usize {
        let len = self.wire_len();
        buf.reserve(len);

        match self.priority {
            None => {
                buf.put_u8(COMMAND_ENHANCED);
                buf.put_u32(self.id);
                buf.put_u32(self.expiry);
                buf.put_u16(TOKEN_SIZE as u16);
                buf.put_slice(self.token.as_bytes());
                buf.put_u16(self.payload.len() as u16);
                buf.put_slice(&self.payload);
            }
            Some(priority) => {
                buf.put_u8(COMMAND_FRAMED);
                buf.put_u32((len - FRAMED_HEADER) as u32);
                put_item(buf, ITEM_TOKEN, self.token.as_bytes());
                put_item(buf, ITEM_PAYLOAD, &self.payload);
                put_item(buf, ITEM_ID, &self.id.to_be_bytes());
                put_item(buf, ITEM_EXPIRY, &self.expiry.to_be_bytes());
                put_item(buf, ITEM_PRIORITY, &[priority.to_byte()]);
            }
        }

        len
    }
}

fn put_item(buf: &mut Vec<u8>, item_id: u8, data: &[u8]) {
    buf.put_u8(item_id);
    buf.put_u16(data.len() as u16);
    buf.put_slice(data);
}
