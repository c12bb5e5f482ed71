//! Feedback service reader.
//!
//! The feedback service streams back the device tokens that stopped accepting
//! notifications, then closes the connection. Each record is:
//!
//! ```text
//! [4: timestamp][2: token length][N: token]
//! ```

use crate::config::GatewayConfig;
use crate::connection::Dialer;
use crate::error::{GatewayError, GatewayResult};
use crate::protocol::FEEDBACK_HEADER_SIZE;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::fmt;
use std::io;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tracing::{debug, info, warn};

/// One invalid-token report.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FeedbackRecord {
    /// Unix seconds at which the service saw the token go bad.
    pub timestamp: u32,
    pub token: Vec<u8>,
}

impl FeedbackRecord {
    pub fn time(&self) -> DateTime<Utc> {
        DateTime::from_timestamp(i64::from(self.timestamp), 0).unwrap_or_default()
    }

    pub fn token_hex(&self) -> String {
        hex::encode(&self.token)
    }
}

impl fmt::Display for FeedbackRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.token_hex())
    }
}

/// Connect to the feedback service and read every record it sends.
///
/// The stream is shut down on every exit path. On failure the error carries
/// the records read so far.
pub async fn read_feedback(
    dialer: &dyn Dialer,
    config: &GatewayConfig,
) -> GatewayResult<Vec<FeedbackRecord>> {
    let addr = config.feedback_addr();
    let mut stream = dialer
        .dial(addr)
        .await
        .map_err(|e| GatewayError::Connection(format!("{}: {}", addr, e)))?;
    debug!(addr = %addr, "Connected to feedback service");

    let result = collect_records(&mut stream, Some(config.read_timeout())).await;
    if let Err(e) = stream.shutdown().await {
        debug!(addr = %addr, error = %e, "Feedback stream shutdown failed");
    }

    match &result {
        Ok(records) => info!(addr = %addr, count = records.len(), "Read feedback"),
        Err(e) => warn!(addr = %addr, error = %e, "Feedback read failed"),
    }
    result
}

/// Parse feedback records from `reader` until end of stream.
///
/// End of stream between records is the normal way the service finishes.
/// End of stream inside a record is an error.
pub async fn read_records<R>(reader: &mut R) -> GatewayResult<Vec<FeedbackRecord>>
where
    R: AsyncRead + Unpin + ?Sized,
{
    collect_records(reader, None).await
}

async fn collect_records<R>(
    reader: &mut R,
    read_timeout: Option<Duration>,
) -> GatewayResult<Vec<FeedbackRecord>>
where
    R: AsyncRead + Unpin + ?Sized,
{
    let mut records = Vec::new();

    loop {
        let next = match read_timeout {
            Some(limit) => match tokio::time::timeout(limit, read_record(reader)).await {
                Ok(next) => next,
                Err(_) => Err(io::Error::new(
                    io::ErrorKind::TimedOut,
                    format!("no feedback data for {:?}", limit),
                )),
            },
            None => read_record(reader).await,
        };

        match next {
            Ok(Some(record)) => records.push(record),
            Ok(None) => return Ok(records),
            Err(source) => return Err(GatewayError::Feedback { records, source }),
        }
    }
}

async fn read_record<R>(reader: &mut R) -> io::Result<Option<FeedbackRecord>>
where
    R: AsyncRead + Unpin + ?Sized,
{
    let mut header = [0u8; FEEDBACK_HEADER_SIZE];
    let n = reader.read(&mut header).await?;
    if n == 0 {
        return Ok(None);
    }
    reader.read_exact(&mut header[n..]).await?;

    let timestamp = u32::from_be_bytes([header[0], header[1], header[2], header[3]]);
    let token_len = u16::from_be_bytes([header[4], header[5]]) as usize;

    let mut token = vec![0u8; token_len];
    reader.read_exact(&mut token).await?;

    Ok(Some(FeedbackRecord { timestamp, token }))
}
