//! Mock transport for deterministic request/response testing.
//!
//! [`MockTransport`] implements the [`Transport`] trait with pre-loaded
//! request/response pairs. This lets you test frame encoding, command
//! generation, and reply parsing without real hardware.
//!
//! # Example
//!
//! ```
//! use hydrolib_test_harness::MockTransport;
//!
//! let mut mock = MockTransport::new();
//! // When the driver sends this frame, return an ACK with its checksum.
//! mock.expect(&[0x1C, 0x01, 0x1D], &[0x06, 0x06]);
//! ```

use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use hydrolib_core::error::{Error, Result};
use hydrolib_core::{Connector, Transport};

/// A pre-loaded request/response pair.
#[derive(Debug, Clone)]
struct Expectation {
    /// The exact bytes we expect to be sent.
    request: Vec<u8>,
    /// The bytes to return when the matching request is received.
    response: Vec<u8>,
}

/// A mock [`Transport`] for testing drivers without hardware.
///
/// Expectations are consumed in order. When `send()` is called, the sent
/// data is recorded and matched against the next expectation; the
/// corresponding response is then returned by subsequent `receive()` calls
/// (possibly across several reads). With no pending response, `receive()`
/// times out -- exactly how a quiet instrument behaves.
#[derive(Debug)]
pub struct MockTransport {
    expectations: VecDeque<Expectation>,
    pending_response: Option<Vec<u8>>,
    response_cursor: usize,
    connected: bool,
    sent_log: Arc<Mutex<Vec<Vec<u8>>>>,
    /// When set, send() accepts anything and replies with the next queued
    /// response regardless of content.
    lenient: bool,
}

impl MockTransport {
    /// Create a new mock transport in the connected state.
    pub fn new() -> Self {
        MockTransport {
            expectations: VecDeque::new(),
            pending_response: None,
            response_cursor: 0,
            connected: true,
            sent_log: Arc::new(Mutex::new(Vec::new())),
            lenient: false,
        }
    }

    /// Create a mock that replies to *any* request with the queued
    /// responses in order. Useful for retry tests where every attempt gets
    /// the same corrupt reply.
    pub fn lenient() -> Self {
        MockTransport {
            lenient: true,
            ..Self::new()
        }
    }

    /// Create a disconnected mock, for exercising `NotConnected` paths.
    pub fn disconnected() -> Self {
        let mut mock = Self::new();
        mock.connected = false;
        mock
    }

    /// Add an expected request/response pair.
    pub fn expect(&mut self, request: &[u8], response: &[u8]) {
        self.expectations.push_back(Expectation {
            request: request.to_vec(),
            response: response.to_vec(),
        });
    }

    /// Queue a response for a lenient mock (the request is ignored).
    pub fn reply_with(&mut self, response: &[u8]) {
        self.expectations.push_back(Expectation {
            request: Vec::new(),
            response: response.to_vec(),
        });
    }

    /// All data sent through this transport, one element per `send()`.
    pub fn sent_data(&self) -> Vec<Vec<u8>> {
        self.sent_log
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .clone()
    }

    /// A handle on the sent-data log that survives moving the transport
    /// into a driver.
    pub fn sent_log(&self) -> Arc<Mutex<Vec<Vec<u8>>>> {
        Arc::clone(&self.sent_log)
    }

    /// Number of expectations not yet consumed.
    pub fn remaining_expectations(&self) -> usize {
        self.expectations.len()
    }

    /// Force the connected state (e.g. to simulate a dead link).
    pub fn set_connected(&mut self, connected: bool) {
        self.connected = connected;
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn send(&mut self, data: &[u8]) -> Result<()> {
        if !self.connected {
            return Err(Error::NotConnected);
        }

        self.sent_log
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .push(data.to_vec());

        if let Some(expectation) = self.expectations.pop_front() {
            if !self.lenient && data != expectation.request.as_slice() {
                return Err(Error::Transport(format!(
                    "unexpected send data: expected {:02X?}, got {:02X?}",
                    expectation.request, data
                )));
            }
            self.pending_response = Some(expectation.response);
            self.response_cursor = 0;
            Ok(())
        } else {
            Err(Error::Transport(
                "no more expectations in mock transport".into(),
            ))
        }
    }

    async fn receive(&mut self, buf: &mut [u8], _timeout: Duration) -> Result<usize> {
        if !self.connected {
            return Err(Error::NotConnected);
        }

        if let Some(ref response) = self.pending_response {
            let remaining = &response[self.response_cursor..];
            if remaining.is_empty() {
                self.pending_response = None;
                self.response_cursor = 0;
                return Err(Error::Timeout);
            }
            let n = remaining.len().min(buf.len());
            buf[..n].copy_from_slice(&remaining[..n]);
            self.response_cursor += n;
            if self.response_cursor >= response.len() {
                self.pending_response = None;
                self.response_cursor = 0;
            }
            Ok(n)
        } else {
            Err(Error::Timeout)
        }
    }

    async fn close(&mut self) -> Result<()> {
        self.connected = false;
        self.pending_response = None;
        self.response_cursor = 0;
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected
    }
}

/// Connector handing out a fixed queue of transports, one per `open()`.
///
/// Lets driver tests script `connect()` / `soft_reset()` sequences: the
/// first transport serves the initial session, the next one the session
/// after a reconnect. An exhausted queue fails like an unreachable
/// endpoint.
#[derive(Default)]
pub struct QueueConnector {
    transports: Mutex<VecDeque<Box<dyn Transport>>>,
}

impl QueueConnector {
    /// Connector that will hand out the given transport once.
    pub fn single(transport: impl Transport + 'static) -> Self {
        let connector = Self::default();
        connector.push(transport);
        connector
    }

    /// Queue another transport for a later `open()`.
    pub fn push(&self, transport: impl Transport + 'static) {
        self.transports
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .push_back(Box::new(transport));
    }
}

#[async_trait]
impl Connector for QueueConnector {
    async fn open(&self) -> Result<Box<dyn Transport>> {
        self.transports
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .pop_front()
            .ok_or_else(|| Error::Transport("no more scripted transports".into()))
    }
}
