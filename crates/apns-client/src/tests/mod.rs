//! Integration tests for the gateway client.
//!
//! - `harness.rs`   - Mock gateway, test dialers and frame decoding
//! - `delivery.rs`  - Draining, ordering, single-flight, connection reuse
//! - `recovery.rs`  - Error responses, hang-ups, reconnect backoff
//! - `feedback.rs`  - Feedback service over TCP
