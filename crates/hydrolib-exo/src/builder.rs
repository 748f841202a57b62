//! Exo2Builder -- fluent builder for [`Exo2`] driver instances.
//!
//! # Example
//!
//! ```no_run
//! use hydrolib_exo::Exo2Builder;
//! use std::time::Duration;
//!
//! # fn example() -> hydrolib_core::Result<()> {
//! let sonde = Exo2Builder::new()
//!     .endpoint("profiler.example.org:55233")
//!     .sampling_max_time(Duration::from_secs(3600))
//!     .build()?;
//! # Ok(())
//! # }
//! ```

use std::sync::Arc;
use std::time::Duration;

use hydrolib_core::error::{Error, Result};
use hydrolib_core::{CollectingGate, Connector};
use hydrolib_transport::TcpConnector;

use crate::driver::{Exo2, ExoConfig};

/// Fluent builder for [`Exo2`].
pub struct Exo2Builder {
    connector: Option<Arc<dyn Connector>>,
    expect_ttl: Duration,
    wipe_ttl: Duration,
    change_retries: u32,
    probe_ttl: Duration,
    sampling_max_time: Duration,
    clock_sync_period: Duration,
    gate: CollectingGate,
}

impl Default for Exo2Builder {
    fn default() -> Self {
        Self::new()
    }
}

impl Exo2Builder {
    /// Create a builder with the field-proven defaults: 30 s command
    /// replies, 60 s wipe cycles, one-hour sampling ceiling, 15-minute
    /// clock sync.
    pub fn new() -> Self {
        Self {
            connector: None,
            expect_ttl: Duration::from_secs(30),
            wipe_ttl: Duration::from_secs(60),
            change_retries: 5,
            probe_ttl: Duration::from_secs(10),
            sampling_max_time: Duration::from_secs(3600),
            clock_sync_period: Duration::from_secs(900),
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

    /// Reply deadline for ordinary commands (default: 30 s).
    pub fn expect_ttl(mut self, ttl: Duration) -> Self {
        self.expect_ttl = ttl;
        self
    }

    /// Reply deadline for a wipe cycle (default: 60 s).
    pub fn wipe_ttl(mut self, ttl: Duration) -> Self {
        self.wipe_ttl = ttl;
        self
    }

    /// Resend attempts for state changes (default: 5).
    pub fn change_retries(mut self, retries: u32) -> Self {
        self.change_retries = retries;
        self
    }

    /// Per-attempt window for rate-dependent transitions (default: 10 s).
    pub fn probe_ttl(mut self, ttl: Duration) -> Self {
        self.probe_ttl = ttl;
        self
    }

    /// Hard ceiling on one sampling session (default: 1 h).
    pub fn sampling_max_time(mut self, max: Duration) -> Self {
        self.sampling_max_time = max;
        self
    }

    /// Clock re-sync interval (default: 15 min).
    pub fn clock_sync_period(mut self, period: Duration) -> Self {
        self.clock_sync_period = period;
        self
    }

    /// Share the system's collecting gate.
    pub fn collecting_gate(mut self, gate: CollectingGate) -> Self {
        self.gate = gate;
        self
    }

    /// Build the driver, disconnected.
    pub fn build(self) -> Result<Exo2> {
        let connector = self
            .connector
            .ok_or_else(|| Error::UnsupportedState("an endpoint or connector is required".into()))?;
        let config = ExoConfig {
            expect_ttl: self.expect_ttl,
            wipe_ttl: self.wipe_ttl,
            change_retries: self.change_retries,
            probe_ttl: self.probe_ttl,
            sampling_max_time: self.sampling_max_time,
            clock_sync_period: self.clock_sync_period,
        };
        Ok(Exo2::new(connector, config, self.gate))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hydrolib_core::Instrument;
    use hydrolib_test_harness::{MockTransport, QueueConnector};

    #[test]
    fn endpoint_or_connector_required() {
        assert!(Exo2Builder::new().build().is_err());
    }

    #[test]
    fn builder_defaults() {
        let sonde = Exo2Builder::new()
            .connector(Arc::new(QueueConnector::single(MockTransport::new())))
            .build()
            .unwrap();
        assert_eq!(sonde.name(), "exo2");
        assert!(!sonde.is_connected());
    }
}
