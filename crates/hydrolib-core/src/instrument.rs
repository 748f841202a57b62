//! The `Instrument` trait -- unified lifecycle interface for all drivers.
//!
//! Broker processes program against `dyn Instrument` for connection
//! management and sampling control without knowing which wire protocol is
//! in use. Instrument-specific operations (register writes, wipe cycles,
//! sample triggers) live on the concrete driver types.

use async_trait::async_trait;

use crate::error::Result;

/// Unified asynchronous lifecycle interface for a field instrument.
///
/// All methods take `&self`: drivers share their state with a background
/// reader task and use interior mutability throughout.
///
/// The contract, common to every driver:
///
/// - [`connect()`](Instrument::connect) fails with
///   [`UnsupportedState`](crate::Error::UnsupportedState) unless the driver
///   is currently disconnected, and with
///   [`UnknownState`](crate::Error::UnknownState) if the instrument's state
///   cannot be probed after the socket opens.
/// - [`disconnect()`](Instrument::disconnect) is always safe to call and
///   never fails; it requests a cooperative shutdown that the reader task
///   observes within one poll interval.
/// - [`soft_reset()`](Instrument::soft_reset) is the universal recovery
///   action: stop sampling (best effort), disconnect, reconnect,
///   reinitialize.
#[async_trait]
pub trait Instrument: Send + Sync {
    /// Short human-readable name for logging (e.g. `"mm3"`, `"exo2"`).
    fn name(&self) -> &str;

    /// Open the connection, probe the device state, and initialize.
    async fn connect(&self) -> Result<()>;

    /// Request a cooperative shutdown and release the connection.
    async fn disconnect(&self);

    /// Whether a connection is currently established.
    fn is_connected(&self) -> bool;

    /// Put the instrument into its operating/streaming mode.
    ///
    /// Returns `true` if the instrument is now sampling. Instruments that
    /// stream unconditionally return `true` without touching the wire.
    async fn start_sampling(&self) -> Result<bool>;

    /// Return the instrument to its idle state.
    async fn stop_sampling(&self) -> Result<bool>;

    /// Disconnect, reconnect, and restore prior settings.
    ///
    /// Applied uniformly after checksum failures, timeouts, or a detected
    /// dead socket.
    async fn soft_reset(&self) -> Result<()>;
}
