//! Connector trait -- how a driver (re)establishes its transport.
//!
//! Every driver owns exactly one live connection at a time, but must be able
//! to create a fresh one: on `connect()`, on `soft_reset()`, and when the
//! reader loop detects a dead socket and reconnects in place. A [`Connector`]
//! captures the endpoint (host and port for TCP) so the same link can be
//! reopened any number of times.

use async_trait::async_trait;

use crate::error::Result;
use crate::transport::Transport;

/// Factory for [`Transport`] instances to a fixed endpoint.
///
/// `hydrolib-transport` provides `TcpConnector`; the test harness provides
/// scripted connectors that hand out mock transports.
#[async_trait]
pub trait Connector: Send + Sync {
    /// Open a new transport to the endpoint.
    async fn open(&self) -> Result<Box<dyn Transport>>;
}
