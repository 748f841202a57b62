//! Error types for hydrolib.
//!
//! All fallible operations across the library return [`Result<T>`], which
//! uses [`Error`] as the error type. Transport-layer, protocol-layer, and
//! sequencing errors are all captured here.

/// The error type for all hydrolib operations.
///
/// Variants cover the full range of failure modes encountered when driving
/// field instruments over unreliable links: physical transport failures,
/// reply timeouts, commands issued in the wrong device state, and data that
/// cannot be parsed into a measurement.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// A transport-level error (TCP socket, serial bridge).
    #[error("transport error: {0}")]
    Transport(String),

    /// No valid reply arrived within the retry/timeout budget.
    ///
    /// Recoverable: the caller may retry the operation or run a soft reset.
    #[error("timeout waiting for instrument")]
    Timeout,

    /// A command was invoked while the device is not in a state that
    /// permits it. This is a sequencing error and is never retried
    /// internally.
    #[error("unsupported state: {0}")]
    UnsupportedState(String),

    /// The device state could not be determined even after reset attempts.
    ///
    /// Usually means the instrument needs operator attention or a power
    /// cycle.
    #[error("device state could not be determined")]
    UnknownState,

    /// The instrument sent data that cannot be parsed into a measurement.
    ///
    /// The offending record is logged and dropped; this error surfaces only
    /// when a caller explicitly asked for the value.
    #[error("invalid input from instrument: {0}")]
    InvalidInput(String),

    /// No connection to the instrument has been established.
    #[error("not connected")]
    NotConnected,

    /// The connection to the instrument was lost unexpectedly.
    #[error("connection lost")]
    ConnectionLost,

    /// An underlying I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// A convenience `Result` alias using [`Error`] as the error type.
pub type Result<T> = std::result::Result<T, Error>;
