//! The per-connection reader task for line-oriented instruments.
//!
//! Exactly one task touches a live transport. It is spawned on `connect()`
//! and runs until cancelled, each iteration giving priority to:
//!
//! 1. Cancellation (the shutdown flag) -- exit and close the socket.
//! 2. Caller write requests -- command methods never hold the transport;
//!    they queue bytes through the handle.
//! 3. A bounded read (~100 ms) so cancellation is always observed promptly;
//!    absence of data is not an error.
//!
//! Received bytes are split on line terminators, trimmed, and handed to the
//! shared [`LineBuffer`] plus the driver's classification handler. A prompt
//! that arrives without a newline (`"#"`, `">"`) is flushed as a line once
//! the link goes idle. After a configured silence the task writes a probe
//! byte; if the write fails the link is considered dead and is reopened
//! through the driver's [`Connector`].

use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::connector::Connector;
use crate::error::{Error, Result};
use crate::line_buffer::LineBuffer;
use crate::transport::Transport;

/// Maximum partial-line accumulation before the buffer is dropped to
/// prevent unbounded growth on a stream with no terminators.
const MAX_PARTIAL: usize = 4096;

/// Pause after a failed reconnection attempt before reads resume.
const RECONNECT_BACKOFF: Duration = Duration::from_millis(500);

/// Configuration for the reader task.
pub struct ReaderConfig {
    /// Per-read timeout; also the bound on cancellation latency.
    pub read_timeout: Duration,
    /// Prompt strings flushed as lines when left dangling at idle.
    pub prompts: Vec<&'static str>,
    /// Silence duration after which the socket is probed, if set.
    pub liveness_timeout: Option<Duration>,
    /// Harmless byte sequence written as the liveness probe.
    pub probe: Vec<u8>,
    /// How to reopen the link when it is found dead. Without one the task
    /// exits instead and the next command surfaces the failure.
    pub reconnect: Option<Arc<dyn Connector>>,
}

impl Default for ReaderConfig {
    fn default() -> Self {
        Self {
            read_timeout: Duration::from_millis(100),
            prompts: Vec::new(),
            liveness_timeout: None,
            probe: b"\n".to_vec(),
            reconnect: None,
        }
    }
}

/// Handle to a running reader task. Owned by the driver's connection.
pub struct ReaderHandle {
    write_tx: mpsc::Sender<Vec<u8>>,
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

impl ReaderHandle {
    /// Queue bytes for transmission on the instrument link.
    pub async fn send(&self, bytes: Vec<u8>) -> Result<()> {
        self.write_tx
            .send(bytes)
            .await
            .map_err(|_| Error::NotConnected)
    }

    /// A clonable sender for components that write independently
    /// (the expect engine, in-handler re-initialization).
    pub fn writer(&self) -> mpsc::Sender<Vec<u8>> {
        self.write_tx.clone()
    }

    /// Whether the task has exited on its own (dead link, no reconnect).
    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Cancel the task and wait for it to close the socket and exit.
    pub async fn shutdown(self) {
        self.cancel.cancel();
        let _ = self.task.await;
    }
}

/// Spawn the reader task for a line-oriented instrument.
///
/// Every decoded line is appended to `lines` and then passed to `handler`
/// for state classification and measurement dispatch. The handler runs on
/// the reader task and must not block.
pub fn spawn_line_reader<F>(
    transport: Box<dyn Transport>,
    config: ReaderConfig,
    lines: LineBuffer,
    cancel: CancellationToken,
    handler: F,
) -> ReaderHandle
where
    F: FnMut(&str) + Send + 'static,
{
    let (write_tx, write_rx) = mpsc::channel::<Vec<u8>>(16);
    let token = cancel.clone();
    let task = tokio::spawn(reader_loop(transport, config, lines, token, write_rx, handler));

    ReaderHandle {
        write_tx,
        cancel,
        task,
    }
}

async fn reader_loop<F>(
    mut transport: Box<dyn Transport>,
    config: ReaderConfig,
    lines: LineBuffer,
    cancel: CancellationToken,
    mut write_rx: mpsc::Receiver<Vec<u8>>,
    mut handler: F,
) where
    F: FnMut(&str) + Send + 'static,
{
    let mut partial: Vec<u8> = Vec::new();
    let mut last_rx = Instant::now();

    loop {
        tokio::select! {
            biased;

            _ = cancel.cancelled() => {
                debug!("reader task cancelled");
                let _ = transport.close().await;
                break;
            }

            req = write_rx.recv() => {
                match req {
                    Some(bytes) => {
                        if let Err(e) = transport.send(&bytes).await {
                            warn!(error = %e, "write to instrument failed");
                            if !reopen(&mut transport, config.reconnect.as_ref()).await {
                                let _ = transport.close().await;
                                break;
                            }
                            partial.clear();
                        }
                    }
                    None => {
                        debug!("all writers dropped, exiting reader task");
                        let _ = transport.close().await;
                        break;
                    }
                }
            }

            alive = async {
                let mut buf = [0u8; 512];
                match transport.receive(&mut buf, config.read_timeout).await {
                    Ok(n) if n > 0 => {
                        last_rx = Instant::now();
                        for &b in &buf[..n] {
                            if b == b'\n' {
                                emit_line(&mut partial, &lines, &mut handler);
                            } else {
                                partial.push(b);
                                if partial.len() > MAX_PARTIAL {
                                    warn!(len = partial.len(), "partial line overflow, resetting");
                                    partial.clear();
                                }
                            }
                        }
                        true
                    }
                    Ok(_) => true,
                    Err(Error::Timeout) => {
                        // The link went quiet. A prompt without a newline is
                        // complete now.
                        emit_prompt(&mut partial, &config.prompts, &lines, &mut handler);

                        if let Some(liveness) = config.liveness_timeout {
                            if last_rx.elapsed() > liveness {
                                last_rx = Instant::now();
                                if let Err(e) = transport.send(&config.probe).await {
                                    warn!(error = %e, "liveness probe failed");
                                    if !reopen(&mut transport, config.reconnect.as_ref()).await {
                                        return false;
                                    }
                                    partial.clear();
                                }
                            }
                        }
                        true
                    }
                    Err(e) => {
                        warn!(error = %e, "read from instrument failed");
                        if !reopen(&mut transport, config.reconnect.as_ref()).await {
                            return false;
                        }
                        partial.clear();
                        true
                    }
                }
            } => {
                if !alive {
                    let _ = transport.close().await;
                    break;
                }
            }
        }
    }
}

/// Reopen the link through the connector. Returns `false` when the task
/// should exit: no connector was configured. A failed attempt keeps the
/// task alive to try again after a backoff.
async fn reopen(
    transport: &mut Box<dyn Transport>,
    reconnect: Option<&Arc<dyn Connector>>,
) -> bool {
    let Some(connector) = reconnect else {
        return false;
    };
    let _ = transport.close().await;
    match connector.open().await {
        Ok(fresh) => {
            info!("instrument link reopened");
            *transport = fresh;
        }
        Err(e) => {
            warn!(error = %e, "reconnect failed");
            tokio::time::sleep(RECONNECT_BACKOFF).await;
        }
    }
    true
}

fn emit_line<F: FnMut(&str)>(partial: &mut Vec<u8>, lines: &LineBuffer, handler: &mut F) {
    let line = String::from_utf8_lossy(partial).trim().to_string();
    partial.clear();
    if line.is_empty() {
        return;
    }
    if line.contains('\0') {
        debug!("line contains NUL, dropping");
        return;
    }
    lines.push(&line);
    handler(&line);
}

fn emit_prompt<F: FnMut(&str)>(
    partial: &mut Vec<u8>,
    prompts: &[&'static str],
    lines: &LineBuffer,
    handler: &mut F,
) {
    if partial.is_empty() {
        return;
    }
    let text = String::from_utf8_lossy(partial).trim().to_string();
    if prompts.iter().any(|p| text == *p) {
        partial.clear();
        lines.push(&text);
        handler(&text);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::Mutex;

    /// Minimal scripted transport: received chunks are fed through a
    /// channel, sent bytes are logged. The full-featured version lives in
    /// `hydrolib-test-harness`; core cannot depend on it.
    struct FeedTransport {
        rx: mpsc::Receiver<Vec<u8>>,
        sent: Arc<Mutex<Vec<Vec<u8>>>>,
        connected: bool,
    }

    fn feed_transport() -> (FeedTransport, mpsc::Sender<Vec<u8>>, Arc<Mutex<Vec<Vec<u8>>>>) {
        let (tx, rx) = mpsc::channel(32);
        let sent = Arc::new(Mutex::new(Vec::new()));
        let transport = FeedTransport {
            rx,
            sent: Arc::clone(&sent),
            connected: true,
        };
        (transport, tx, sent)
    }

    #[async_trait]
    impl Transport for FeedTransport {
        async fn send(&mut self, data: &[u8]) -> Result<()> {
            self.sent.lock().unwrap().push(data.to_vec());
            Ok(())
        }

        async fn receive(&mut self, buf: &mut [u8], timeout: Duration) -> Result<usize> {
            match tokio::time::timeout(timeout, self.rx.recv()).await {
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

    fn collected() -> (Arc<Mutex<Vec<String>>>, impl FnMut(&str) + Send + 'static) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        (seen, move |line: &str| sink.lock().unwrap().push(line.to_string()))
    }

    #[tokio::test]
    async fn splits_and_trims_lines() {
        let (transport, feed, _) = feed_transport();
        let (seen, handler) = collected();
        let lines = LineBuffer::new();
        let cancel = CancellationToken::new();
        let reader = spawn_line_reader(
            Box::new(transport),
            ReaderConfig::default(),
            lines.clone(),
            cancel,
            handler,
        );

        feed.send(b"sn\r\n0167BF55\r\n\r\n#\r\n".to_vec()).await.unwrap();
        tokio::time::sleep(Duration::from_millis(200)).await;

        // Empty line dropped, the rest buffered in arrival order.
        assert_eq!(lines.lines(), vec!["sn", "0167BF55", "#"]);
        assert_eq!(*seen.lock().unwrap(), vec!["sn", "0167BF55", "#"]);

        reader.shutdown().await;
    }

    #[tokio::test]
    async fn reassembles_lines_across_chunks() {
        let (transport, feed, _) = feed_transport();
        let (_, handler) = collected();
        let lines = LineBuffer::new();
        let reader = spawn_line_reader(
            Box::new(transport),
            ReaderConfig::default(),
            lines.clone(),
            CancellationToken::new(),
            handler,
        );

        feed.send(b"0090 1800 0 0".to_vec()).await.unwrap();
        feed.send(b" 0 0 1800 1800\r\n".to_vec()).await.unwrap();
        tokio::time::sleep(Duration::from_millis(200)).await;

        assert_eq!(lines.lines(), vec!["0090 1800 0 0 0 0 1800 1800"]);
        reader.shutdown().await;
    }

    #[tokio::test]
    async fn flushes_dangling_prompt_on_idle() {
        let (transport, feed, _) = feed_transport();
        let (_, handler) = collected();
        let lines = LineBuffer::new();
        let config = ReaderConfig {
            prompts: vec!["#"],
            ..ReaderConfig::default()
        };
        let reader = spawn_line_reader(
            Box::new(transport),
            config,
            lines.clone(),
            CancellationToken::new(),
            handler,
        );

        // Prompt arrives with a trailing space and no newline.
        feed.send(b"# ".to_vec()).await.unwrap();
        tokio::time::sleep(Duration::from_millis(300)).await;

        assert_eq!(lines.lines(), vec!["#"]);
        reader.shutdown().await;
    }

    #[tokio::test]
    async fn forwards_caller_writes() {
        let (transport, _feed, sent) = feed_transport();
        let (_, handler) = collected();
        let reader = spawn_line_reader(
            Box::new(transport),
            ReaderConfig::default(),
            LineBuffer::new(),
            CancellationToken::new(),
            handler,
        );

        reader.send(b"run\r".to_vec()).await.unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;

        assert_eq!(*sent.lock().unwrap(), vec![b"run\r".to_vec()]);
        reader.shutdown().await;
    }

    #[tokio::test]
    async fn drops_nul_lines() {
        let (transport, feed, _) = feed_transport();
        let (_, handler) = collected();
        let lines = LineBuffer::new();
        let reader = spawn_line_reader(
            Box::new(transport),
            ReaderConfig::default(),
            lines.clone(),
            CancellationToken::new(),
            handler,
        );

        feed.send(b"ok\r\nbad\0line\r\n".to_vec()).await.unwrap();
        tokio::time::sleep(Duration::from_millis(200)).await;

        assert_eq!(lines.lines(), vec!["ok"]);
        reader.shutdown().await;
    }

    #[tokio::test]
    async fn probes_after_silence() {
        let (transport, _feed, sent) = feed_transport();
        let (_, handler) = collected();
        let config = ReaderConfig {
            liveness_timeout: Some(Duration::from_millis(150)),
            probe: b"\n".to_vec(),
            ..ReaderConfig::default()
        };
        let reader = spawn_line_reader(
            Box::new(transport),
            config,
            LineBuffer::new(),
            CancellationToken::new(),
            handler,
        );

        tokio::time::sleep(Duration::from_millis(500)).await;
        assert!(!sent.lock().unwrap().is_empty(), "expected a liveness probe");
        reader.shutdown().await;
    }

    #[tokio::test]
    async fn cancellation_is_prompt() {
        let (transport, _feed, _) = feed_transport();
        let (_, handler) = collected();
        let cancel = CancellationToken::new();
        let reader = spawn_line_reader(
            Box::new(transport),
            ReaderConfig::default(),
            LineBuffer::new(),
            cancel.clone(),
            handler,
        );

        cancel.cancel();
        tokio::time::sleep(Duration::from_millis(300)).await;
        assert!(reader.is_finished());
        reader.shutdown().await;
    }
}
