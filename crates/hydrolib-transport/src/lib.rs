//! hydrolib-transport: TCP transport for hydrolib instrument links.
//!
//! Field instruments are reached as plain TCP byte streams -- either a
//! device-server port or a `socat`-style bridge in front of a serial line.
//! This crate provides [`TcpTransport`], the production implementation of
//! [`hydrolib_core::Transport`], and [`TcpConnector`], the matching
//! [`hydrolib_core::Connector`] used for reconnection.

pub mod tcp;

pub use tcp::{TcpConnector, TcpTransport};
