//! IscoBuilder -- fluent builder for [`Isco`] driver instances.

use std::sync::Arc;
use std::time::Duration;

use hydrolib_core::error::{Error, Result};
use hydrolib_core::{CollectingGate, Connector};
use hydrolib_transport::TcpConnector;

use crate::driver::{Isco, IscoConfig};

/// Fluent builder for [`Isco`].
pub struct IscoBuilder {
    connector: Option<Arc<dyn Connector>>,
    read_timeout: Duration,
    attempts: u32,
    default_sample_volume: i32,
    watch_interval: Duration,
    gate: CollectingGate,
}

impl Default for IscoBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl IscoBuilder {
    /// Create a builder with the field defaults: 2 s line reads, three
    /// attempts, 1000 ml samples, one-second status watching.
    pub fn new() -> Self {
        Self {
            connector: None,
            read_timeout: Duration::from_secs(2),
            attempts: 3,
            default_sample_volume: 1000,
            watch_interval: Duration::from_secs(1),
            gate: CollectingGate::default(),
        }
    }

    /// Set the `host:port` endpoint, connected over TCP.
    pub fn endpoint(mut self, addr: &str) -> Self {
        self.connector = Some(Arc::new(TcpConnector::new(addr)));
        self
    }

    /// Supply a custom connector.
    pub fn connector(mut self, connector: Arc<dyn Connector>) -> Self {
        self.connector = Some(connector);
        self
    }

    /// Per-line read deadline (default: 2 s).
    pub fn read_timeout(mut self, timeout: Duration) -> Self {
        self.read_timeout = timeout;
        self
    }

    /// Attempts per exchange before `Timeout` (default: 3).
    pub fn attempts(mut self, attempts: u32) -> Self {
        self.attempts = attempts;
        self
    }

    /// Sample volume for `take_next_sample` in ml (default: 1000).
    pub fn default_sample_volume(mut self, volume_ml: i32) -> Self {
        self.default_sample_volume = volume_ml;
        self
    }

    /// Watcher poll interval while sampling (default: 1 s).
    pub fn watch_interval(mut self, interval: Duration) -> Self {
        self.watch_interval = interval;
        self
    }

    /// Share the system's collecting gate.
    pub fn collecting_gate(mut self, gate: CollectingGate) -> Self {
        self.gate = gate;
        self
    }

    /// Build the driver, disconnected.
    pub fn build(self) -> Result<Isco> {
        let connector = self
            .connector
            .ok_or_else(|| Error::UnsupportedState("an endpoint or connector is required".into()))?;
        let config = IscoConfig {
            read_timeout: self.read_timeout,
            attempts: self.attempts,
            default_sample_volume: self.default_sample_volume,
            watch_interval: self.watch_interval,
        };
        Ok(Isco::new(connector, config, self.gate))
    }
}
