//! External channel trait

use std::time::Duration;

use async_trait::async_trait;
use mgw_core::{ExternalClientMessage, ExternalServerMessage};

use super::TransportError;

/// Transport-agnostic channel to one fleet-server endpoint
///
/// A channel is opened once per handshake and closed on teardown. Sending and
/// receiving may happen concurrently from different tasks.
#[async_trait]
pub trait ExternalChannel: Send + Sync {
    /// Establish the underlying connection
    async fn open(&self) -> Result<(), TransportError>;

    /// Send one message to the server
    async fn send(&self, message: &ExternalClientMessage) -> Result<(), TransportError>;

    /// Wait up to `timeout` for the next message from the server
    ///
    /// Returns `Ok(None)` when nothing arrived in time.
    async fn receive(
        &self,
        timeout: Duration,
    ) -> Result<Option<ExternalServerMessage>, TransportError>;

    /// Close the connection; closing a closed channel is a no-op
    async fn close(&self);

    /// Short description for logs (e.g. "mqtt://broker:1883")
    fn describe(&self) -> String;
}
