//! Mock TCP server for transport-level testing.
//!
//! [`MockTcpServer`] provides a TCP listener pre-loaded with scripted
//! responses, enabling deterministic end-to-end tests of the production
//! `TcpTransport` against a driver without an instrument or a serial
//! bridge.
//!
//! # Example
//!
//! ```
//! use hydrolib_test_harness::MockTcpServer;
//!
//! # async fn example() -> hydrolib_core::Result<()> {
//! let mut server = MockTcpServer::new().await?;
//!
//! // When the client sends "sn\r", reply with the serial number block.
//! server.expect(b"sn\r", b"sn\r\n0167BF55\r\n# ");
//!
//! let addr = server.addr().to_string();
//! // ... connect a TcpTransport to `addr` and run the driver ...
//! # Ok(())
//! # }
//! ```

use hydrolib_core::error::{Error, Result};
use std::collections::VecDeque;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

/// A pre-loaded request/response pair for the mock TCP server.
#[derive(Debug, Clone)]
struct TcpExpectation {
    request: Vec<u8>,
    response: Vec<u8>,
}

/// A mock TCP server for testing drivers over a real socket.
///
/// The server listens on a random localhost port. Once
/// [`start`](MockTcpServer::start) is called it accepts a single connection
/// and processes expectations in order: for each expected request it reads
/// from the client and writes back the scripted response. A mismatch ends
/// the session with an error reported by [`wait`](MockTcpServer::wait).
pub struct MockTcpServer {
    addr: String,
    expectations: VecDeque<TcpExpectation>,
    server_handle: Option<JoinHandle<std::result::Result<(), String>>>,
}

impl MockTcpServer {
    /// Create a server on a random port. Connections are not accepted until
    /// [`start`](MockTcpServer::start), so expectations can be loaded first.
    pub async fn new() -> Result<Self> {
        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .map_err(|e| Error::Transport(format!("failed to bind mock TCP server: {}", e)))?;
        let addr = listener.local_addr().map_err(Error::Io)?.to_string();
        // The listener is re-bound in start(); only the reserved port
        // matters here.
        Ok(Self {
            addr,
            expectations: VecDeque::new(),
            server_handle: None,
        })
    }

    /// Add an expected request/response pair, consumed in order.
    pub fn expect(&mut self, request: &[u8], response: &[u8]) {
        self.expectations.push_back(TcpExpectation {
            request: request.to_vec(),
            response: response.to_vec(),
        });
    }

    /// The address the server listens on.
    pub fn addr(&self) -> &str {
        &self.addr
    }

    /// Start the server and return a channel that fires once the listener
    /// is ready, avoiding connect-before-bind races.
    pub fn start(&mut self) -> oneshot::Receiver<()> {
        let addr = self.addr.clone();
        let expectations: Vec<TcpExpectation> = self.expectations.drain(..).collect();
        let (ready_tx, ready_rx) = oneshot::channel();

        let handle = tokio::spawn(async move {
            let listener = TcpListener::bind(&addr)
                .await
                .map_err(|e| format!("failed to re-bind mock TCP server on {}: {}", addr, e))?;

            let _ = ready_tx.send(());

            let (mut stream, _) = listener
                .accept()
                .await
                .map_err(|e| format!("failed to accept connection: {}", e))?;

            for (i, expectation) in expectations.iter().enumerate() {
                let mut buf = vec![0u8; expectation.request.len()];
                let mut total_read = 0;

                while total_read < expectation.request.len() {
                    let n = stream
                        .read(&mut buf[total_read..])
                        .await
                        .map_err(|e| format!("expectation {}: read error: {}", i, e))?;
                    if n == 0 {
                        return Err(format!(
                            "expectation {}: client disconnected after {} bytes (expected {})",
                            i,
                            total_read,
                            expectation.request.len()
                        ));
                    }
                    total_read += n;
                }

                if buf != expectation.request {
                    return Err(format!(
                        "expectation {}: request mismatch: expected {:02X?}, got {:02X?}",
                        i, expectation.request, buf
                    ));
                }

                stream
                    .write_all(&expectation.response)
                    .await
                    .map_err(|e| format!("expectation {}: write error: {}", i, e))?;
                stream
                    .flush()
                    .await
                    .map_err(|e| format!("expectation {}: flush error: {}", i, e))?;
            }

            Ok(())
        });

        self.server_handle = Some(handle);
        ready_rx
    }

    /// Wait for the server task to finish and surface any scripting errors.
    pub async fn wait(self) -> std::result::Result<(), String> {
        if let Some(handle) = self.server_handle {
            handle
                .await
                .map_err(|e| format!("server task panicked: {}", e))?
        } else {
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpStream;

    #[tokio::test]
    async fn scripted_exchange() {
        let mut server = MockTcpServer::new().await.unwrap();
        server.expect(b"STS,1\r\n", b"STS,MO,6712,ID,42,TI,123.5,STS,1,MO\r\n");
        let addr = server.addr().to_string();
        let ready = server.start();
        ready.await.unwrap();

        let mut client = TcpStream::connect(&addr).await.unwrap();
        client.write_all(b"STS,1\r\n").await.unwrap();

        let mut buf = [0u8; 128];
        let n = client.read(&mut buf).await.unwrap();
        assert!(std::str::from_utf8(&buf[..n]).unwrap().contains("MO"));

        drop(client);
        server.wait().await.unwrap();
    }

    #[tokio::test]
    async fn mismatch_is_reported() {
        let mut server = MockTcpServer::new().await.unwrap();
        server.expect(b"???", b"banner");
        let addr = server.addr().to_string();
        let ready = server.start();
        ready.await.unwrap();

        let mut client = TcpStream::connect(&addr).await.unwrap();
        client.write_all(b"!!!").await.unwrap();

        let result = server.wait().await;
        assert!(result.unwrap_err().contains("mismatch"));
    }
}
