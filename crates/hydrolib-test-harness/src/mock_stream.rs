//! Scripted streaming transport for reader-loop tests.
//!
//! Streaming instruments (wind, depth sounder, a sonde in run mode) emit
//! data that is not correlated with anything the driver sent, so the
//! request/response [`MockTransport`](crate::MockTransport) cannot script
//! them. [`StreamTransport`] decouples the two sides: the test feeds
//! arbitrary byte chunks through a [`StreamHandle`] whenever it likes, and
//! inspects everything the driver wrote.
//!
//! # Example
//!
//! ```
//! use hydrolib_test_harness::stream_transport;
//!
//! # async fn example() {
//! let (transport, handle) = stream_transport();
//! // hand `transport` to a driver, then script the instrument:
//! handle.feed(b"$WIMDA,30.1,I,1.02,B,21.4,C,,,,,,,,,,,,,,*XX\r\n").await;
//! let written = handle.sent();
//! # }
//! ```

use async_trait::async_trait;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use hydrolib_core::error::{Error, Result};
use hydrolib_core::Transport;
use tokio::sync::mpsc;

/// Create a connected [`StreamTransport`] / [`StreamHandle`] pair.
pub fn stream_transport() -> (StreamTransport, StreamHandle) {
    let (feed_tx, feed_rx) = mpsc::channel(64);
    let sent = Arc::new(Mutex::new(Vec::new()));
    let fail_sends = Arc::new(Mutex::new(false));

    let transport = StreamTransport {
        feed_rx,
        sent: Arc::clone(&sent),
        fail_sends: Arc::clone(&fail_sends),
        connected: true,
    };
    let handle = StreamHandle {
        feed_tx,
        sent,
        fail_sends,
    };
    (transport, handle)
}

/// The driver-side half: a [`Transport`] whose received bytes come from the
/// test script.
pub struct StreamTransport {
    feed_rx: mpsc::Receiver<Vec<u8>>,
    sent: Arc<Mutex<Vec<Vec<u8>>>>,
    fail_sends: Arc<Mutex<bool>>,
    connected: bool,
}

/// The test-side half: feeds bytes and inspects writes.
#[derive(Clone)]
pub struct StreamHandle {
    feed_tx: mpsc::Sender<Vec<u8>>,
    sent: Arc<Mutex<Vec<Vec<u8>>>>,
    fail_sends: Arc<Mutex<bool>>,
}

impl StreamHandle {
    /// Queue a chunk of bytes for the driver to receive.
    pub async fn feed(&self, bytes: &[u8]) {
        let _ = self.feed_tx.send(bytes.to_vec()).await;
    }

    /// Feed a text line terminated with CRLF.
    pub async fn feed_line(&self, line: &str) {
        self.feed(format!("{line}\r\n").as_bytes()).await;
    }

    /// Everything the driver has written, one element per `send()`.
    pub fn sent(&self) -> Vec<Vec<u8>> {
        self.sent.lock().unwrap_or_else(|p| p.into_inner()).clone()
    }

    /// Concatenation of everything the driver has written.
    pub fn sent_bytes(&self) -> Vec<u8> {
        self.sent().concat()
    }

    /// Make subsequent driver writes fail with a broken-pipe error,
    /// simulating a dead socket discovered by the liveness probe.
    pub fn break_writes(&self) {
        *self.fail_sends.lock().unwrap_or_else(|p| p.into_inner()) = true;
    }
}

#[async_trait]
impl Transport for StreamTransport {
    async fn send(&mut self, data: &[u8]) -> Result<()> {
        if !self.connected {
            return Err(Error::NotConnected);
        }
        if *self.fail_sends.lock().unwrap_or_else(|p| p.into_inner()) {
            return Err(Error::ConnectionLost);
        }
        self.sent
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .push(data.to_vec());
        Ok(())
    }

    async fn receive(&mut self, buf: &mut [u8], timeout: Duration) -> Result<usize> {
        if !self.connected {
            return Err(Error::NotConnected);
        }
        match tokio::time::timeout(timeout, self.feed_rx.recv()).await {
            Ok(Some(chunk)) => {
                let n = chunk.len().min(buf.len());
                buf[..n].copy_from_slice(&chunk[..n]);
                Ok(n)
            }
            Ok(None) => Err(Error::ConnectionLost),
            Err(_) => Err(Error::Timeout),
        }
    }

    async fn close(&mut self) -> Result<()> {
        self.connected = false;
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn feed_and_receive() {
        let (mut transport, handle) = stream_transport();
        handle.feed(b"00 02 40").await;

        let mut buf = [0u8; 64];
        let n = transport
            .receive(&mut buf, Duration::from_millis(100))
            .await
            .unwrap();
        assert_eq!(&buf[..n], b"00 02 40");
    }

    #[tokio::test]
    async fn receive_times_out_when_idle() {
        let (mut transport, _handle) = stream_transport();
        let mut buf = [0u8; 64];
        let result = transport.receive(&mut buf, Duration::from_millis(50)).await;
        assert!(matches!(result, Err(Error::Timeout)));
    }

    #[tokio::test]
    async fn records_driver_writes() {
        let (mut transport, handle) = stream_transport();
        transport.send(b"CMD100\r\n").await.unwrap();
        assert_eq!(handle.sent(), vec![b"CMD100\r\n".to_vec()]);
        assert_eq!(handle.sent_bytes(), b"CMD100\r\n");
    }

    #[tokio::test]
    async fn broken_writes_fail() {
        let (mut transport, handle) = stream_transport();
        handle.break_writes();
        let result = transport.send(b"\n").await;
        assert!(matches!(result, Err(Error::ConnectionLost)));
    }

    #[tokio::test]
    async fn feed_line_appends_crlf() {
        let (mut transport, handle) = stream_transport();
        handle.feed_line("#").await;

        let mut buf = [0u8; 8];
        let n = transport
            .receive(&mut buf, Duration::from_millis(100))
            .await
            .unwrap();
        assert_eq!(&buf[..n], b"#\r\n");
    }
}
