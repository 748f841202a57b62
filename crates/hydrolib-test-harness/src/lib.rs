//! hydrolib-test-harness: Mock transports and scripted servers for testing
//! instrument drivers without hardware.
//!
//! - [`MockTransport`] -- ordered request/response expectations, for
//!   strictly solicited protocols (the motor controller, the sampler).
//! - [`StreamTransport`] -- a scripted byte feed decoupled from writes, for
//!   streaming instruments and reader-loop tests (wind, sounder, sonde run
//!   mode).
//! - [`MockTcpServer`] -- scripted expectations behind a real TCP listener,
//!   for exercising the production transport end to end.

pub mod mock_stream;
pub mod mock_tcp;
pub mod mock_transport;

pub use mock_stream::{stream_transport, StreamHandle, StreamTransport};
pub use mock_tcp::MockTcpServer;
pub use mock_transport::{MockTransport, QueueConnector};
