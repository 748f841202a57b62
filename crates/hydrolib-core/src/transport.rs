//! Transport trait for instrument communication.
//!
//! The [`Transport`] trait abstracts over the physical link to an
//! instrument. In the field every instrument is reachable as a TCP byte
//! stream (usually a terminal server or a `socat` bridge in front of a
//! serial port); in tests the same trait is implemented by the mock
//! transports in `hydrolib-test-harness`.
//!
//! Protocol engines (the frame codec in `hydrolib-motionmind`, the line
//! reader in `hydrolib-core`) operate on a `Transport` rather than on a
//! socket directly, enabling both real hardware control and deterministic
//! unit testing.

use async_trait::async_trait;
use std::time::Duration;

use crate::error::Result;

/// Asynchronous byte-level transport to an instrument.
///
/// Implementations handle connection state and error mapping at the
/// physical layer. Protocol-level concerns (framing, checksums, prompts)
/// are handled by the drivers that consume this trait.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Send raw bytes to the instrument.
    ///
    /// Implementations should not return until all bytes have been handed
    /// to the underlying transport and flushed.
    async fn send(&mut self, data: &[u8]) -> Result<()>;

    /// Receive bytes from the instrument into the provided buffer.
    ///
    /// Returns the number of bytes actually read. Waits up to `timeout`
    /// for data to arrive; returns [`Error::Timeout`](crate::Error::Timeout)
    /// if nothing arrives within the deadline. Absence of data is normal
    /// for quiet instruments and is not a link failure.
    async fn receive(&mut self, buf: &mut [u8], timeout: Duration) -> Result<usize>;

    /// Close the transport connection.
    ///
    /// After calling `close()`, subsequent `send()` and `receive()` calls
    /// should return [`Error::NotConnected`](crate::Error::NotConnected).
    async fn close(&mut self) -> Result<()>;

    /// Check whether the transport is currently connected.
    fn is_connected(&self) -> bool;
}
