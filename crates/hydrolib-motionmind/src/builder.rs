//! Mm3Builder -- fluent builder for [`MotionMind3`] driver instances.
//!
//! Separates configuration from construction: endpoint, device address,
//! retry policy, and timing parameters are set up front, and the driver is
//! built disconnected. Call [`connect()`](hydrolib_core::Instrument::connect)
//! on the result.
//!
//! # Example
//!
//! ```no_run
//! use hydrolib_motionmind::Mm3Builder;
//! use std::time::Duration;
//!
//! # fn example() -> hydrolib_core::Result<()> {
//! let motor = Mm3Builder::new()
//!     .endpoint("profiler.example.org:55232")
//!     .max_retries(3)
//!     .poll_period(Duration::from_millis(200))
//!     .build()?;
//! # Ok(())
//! # }
//! ```

use std::sync::Arc;
use std::time::Duration;

use hydrolib_core::error::{Error, Result};
use hydrolib_core::{CollectingGate, Connector};
use hydrolib_transport::TcpConnector;

use crate::driver::{Mm3Config, MotionMind3};

/// Fluent builder for [`MotionMind3`].
///
/// Defaults follow the controller's manual: operations take up to a few
/// milliseconds to process (waited generously at 250 ms), EEPROM stores up
/// to 40 ms (waited at 400 ms), and commands need 20 ms of bus settling
/// time between them.
pub struct Mm3Builder {
    connector: Option<Arc<dyn Connector>>,
    address: u8,
    max_retries: u32,
    processing_time: Duration,
    write_store_processing_time: Duration,
    char_latency: Duration,
    send_spacing: Duration,
    poll_period: Duration,
    gate: CollectingGate,
}

impl Default for Mm3Builder {
    fn default() -> Self {
        Self::new()
    }
}

impl Mm3Builder {
    /// Create a builder with default timing and retry parameters.
    pub fn new() -> Self {
        Self {
            connector: None,
            address: 1,
            max_retries: 3,
            processing_time: Duration::from_millis(250),
            write_store_processing_time: Duration::from_millis(400),
            char_latency: Duration::from_millis(30),
            send_spacing: Duration::from_millis(20),
            poll_period: Duration::from_millis(200),
            gate: CollectingGate::default(),
        }
    }

    /// Set the `host:port` endpoint, connected over TCP.
    pub fn endpoint(mut self, addr: &str) -> Self {
        self.connector = Some(Arc::new(TcpConnector::new(addr)));
        self
    }

    /// Supply a custom connector (mock transports in tests, alternative
    /// links in production).
    pub fn connector(mut self, connector: Arc<dyn Connector>) -> Self {
        self.connector = Some(connector);
        self
    }

    /// Device address on the controller bus (default: 1).
    pub fn device_address(mut self, address: u8) -> Self {
        self.address = address;
        self
    }

    /// Send attempts per command before `Timeout` (default: 3).
    pub fn max_retries(mut self, retries: u32) -> Self {
        self.max_retries = retries;
        self
    }

    /// Wait for the first reply byte of an ordinary command (default: 250 ms).
    pub fn processing_time(mut self, time: Duration) -> Self {
        self.processing_time = time;
        self
    }

    /// Wait for the first reply byte of a WRITE_STORE (default: 400 ms).
    pub fn write_store_processing_time(mut self, time: Duration) -> Self {
        self.write_store_processing_time = time;
        self
    }

    /// Inter-character window ending a reply burst (default: 30 ms).
    pub fn char_latency(mut self, latency: Duration) -> Self {
        self.char_latency = latency;
        self
    }

    /// Minimum spacing between sends (default: 20 ms).
    pub fn send_spacing(mut self, spacing: Duration) -> Self {
        self.send_spacing = spacing;
        self
    }

    /// Register cache freshness window (default: 200 ms).
    pub fn poll_period(mut self, period: Duration) -> Self {
        self.poll_period = period;
        self
    }

    /// Share the system's collecting gate; snapshots are only delivered to
    /// listeners while it is armed.
    pub fn collecting_gate(mut self, gate: CollectingGate) -> Self {
        self.gate = gate;
        self
    }

    /// Build the driver, disconnected.
    pub fn build(self) -> Result<MotionMind3> {
        let connector = self
            .connector
            .ok_or_else(|| Error::UnsupportedState("an endpoint or connector is required".into()))?;
        let config = Mm3Config {
            address: self.address,
            max_retries: self.max_retries,
            processing_time: self.processing_time,
            write_store_processing_time: self.write_store_processing_time,
            char_latency: self.char_latency,
            send_spacing: self.send_spacing,
            poll_period: self.poll_period,
        };
        Ok(MotionMind3::new(connector, config, self.gate))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hydrolib_core::Instrument;
    use hydrolib_test_harness::{MockTransport, QueueConnector};

    #[test]
    fn endpoint_or_connector_required() {
        let result = Mm3Builder::new().build();
        assert!(result.is_err());
    }

    #[test]
    fn builder_defaults() {
        let motor = Mm3Builder::new()
            .connector(Arc::new(QueueConnector::single(MockTransport::new())))
            .build()
            .unwrap();
        assert_eq!(motor.name(), "mm3");
        assert!(!motor.is_connected());
    }

    #[test]
    fn builder_fluent_chain() {
        let motor = Mm3Builder::new()
            .connector(Arc::new(QueueConnector::single(MockTransport::new())))
            .device_address(2)
            .max_retries(5)
            .processing_time(Duration::from_millis(100))
            .write_store_processing_time(Duration::from_millis(500))
            .char_latency(Duration::from_millis(10))
            .send_spacing(Duration::from_millis(5))
            .poll_period(Duration::from_secs(1))
            .collecting_gate(CollectingGate::new(false))
            .build()
            .unwrap();
        assert!(!motor.is_connected());
    }
}
