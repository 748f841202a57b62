//! hydrolib-core: Core traits, types, and error definitions for hydrolib.
//!
//! This crate defines the instrument-agnostic abstractions that all hydrolib
//! drivers implement. Broker processes and other applications depend on these
//! types without pulling in any specific instrument driver.
//!
//! # Key types
//!
//! - [`Instrument`] -- the unified lifecycle trait for any field instrument
//! - [`Transport`] / [`Connector`] -- byte-level communication channel
//! - [`ExpectEngine`] -- send-and-wait correlation for line protocols
//! - [`LineBuffer`] -- decoded lines shared between reader task and callers
//! - [`Error`] / [`Result`] -- error handling

pub mod connector;
pub mod error;
pub mod expect;
pub mod instrument;
pub mod line_buffer;
pub mod listener;
pub mod reader;
pub mod state;
pub mod transport;

// Re-export key types at crate root for ergonomic `use hydrolib_core::*`.
pub use connector::Connector;
pub use error::{Error, Result};
pub use expect::ExpectEngine;
pub use instrument::Instrument;
pub use line_buffer::LineBuffer;
pub use listener::{CollectingGate, FnListener, Listener, ListenerSet};
pub use reader::{spawn_line_reader, ReaderConfig, ReaderHandle};
pub use state::{classify, DeviceState, LinePattern, SharedState, StateTarget, TransitionRule};
pub use transport::Transport;
