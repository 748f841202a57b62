//! The Isco sampler driver.
//!
//! Strictly request/response: every command re-arms the command line
//! (banner or `>` prompt), flushes stale input, sends, and reads lines
//! until the status reply (recognized by its `MO` model token) arrives,
//! with three attempts before giving up. A background watcher polls the
//! status once a second while a sample is being drawn and notifies
//! listeners when it completes.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use hydrolib_core::error::{Error, Result};
use hydrolib_core::{CollectingGate, Connector, Instrument, Listener, ListenerSet, Transport};

use crate::data::IscoData;

/// Bottles in the sampler carousel.
const MAX_BOTTLE: i32 = 24;

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|p| p.into_inner())
}

#[derive(Debug, Clone)]
pub(crate) struct IscoConfig {
    /// Per-line read deadline.
    pub read_timeout: Duration,
    /// Attempts per exchange before `Timeout`.
    pub attempts: u32,
    /// Sample volume for `take_next_sample`, in milliliters.
    pub default_sample_volume: i32,
    /// Watcher poll interval while a sample is in progress.
    pub watch_interval: Duration,
}

pub(crate) struct Inner {
    connector: Arc<dyn Connector>,
    config: IscoConfig,
    link: tokio::sync::Mutex<Option<Box<dyn Transport>>>,
    connected: AtomicBool,
    sampling: AtomicBool,
    data: Mutex<IscoData>,
    listeners: ListenerSet<IscoData>,
    gate: CollectingGate,
}

/// Isco automated water sampler driver.
pub struct Isco {
    inner: Arc<Inner>,
    watcher: tokio::sync::Mutex<Option<JoinHandle<()>>>,
    cancel: Mutex<CancellationToken>,
}

impl Isco {
    pub(crate) fn new(
        connector: Arc<dyn Connector>,
        config: IscoConfig,
        gate: CollectingGate,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                connector,
                config,
                link: tokio::sync::Mutex::new(None),
                connected: AtomicBool::new(false),
                sampling: AtomicBool::new(false),
                data: Mutex::new(IscoData::default()),
                listeners: ListenerSet::new(),
                gate,
            }),
            watcher: tokio::sync::Mutex::new(None),
            cancel: Mutex::new(CancellationToken::new()),
        }
    }

    /// Register a listener, notified when a sample completes.
    pub fn add_listener(&self, listener: Arc<dyn Listener<IscoData>>) {
        self.inner.listeners.add(listener);
    }

    /// Snapshot of the sampler's identity and last status.
    pub fn status(&self) -> IscoData {
        lock(&self.inner.data).clone()
    }

    /// Whether a sample is believed to be in progress.
    pub fn is_sampling(&self) -> bool {
        self.inner.sampling.load(Ordering::SeqCst)
    }

    /// Poll the sampler for its current status (`STS,1`).
    pub async fn poll_status(&self) -> Result<IscoData> {
        status_exchange(&self.inner, b"STS,1\r\n").await
    }

    /// Turn the sampler on through its software interface and read the
    /// status (`STS,2`).
    pub async fn soft_power(&self) -> Result<IscoData> {
        status_exchange(&self.inner, b"STS,2\r\n").await
    }

    /// Draw a sample into the given bottle (`BTL,n,SVO,v`).
    ///
    /// The reply is the usual status string; the watcher then follows the
    /// sample to completion.
    pub async fn take_sample(&self, bottle: i32, volume_ml: i32) -> Result<IscoData> {
        if !(1..=MAX_BOTTLE).contains(&bottle) {
            return Err(Error::InvalidInput(format!("bottle {bottle} out of range")));
        }
        let command = format!("BTL,{bottle},SVO,{volume_ml}\r\n");
        let data = status_exchange(&self.inner, command.as_bytes()).await?;
        self.inner.sampling.store(true, Ordering::SeqCst);
        Ok(data)
    }

    /// Draw a default-volume sample into the next bottle.
    pub async fn take_next_sample(&self) -> Result<IscoData> {
        let bottle = lock(&self.inner.data).bottle.map(|b| b + 1).unwrap_or(1);
        if bottle > MAX_BOTTLE {
            return Err(Error::InvalidInput("bottle carousel exhausted".into()));
        }
        self.take_sample(bottle, self.inner.config.default_sample_volume)
            .await
    }
}

#[async_trait]
impl Instrument for Isco {
    fn name(&self) -> &str {
        "isco"
    }

    async fn connect(&self) -> Result<()> {
        if self.is_connected() {
            return Err(Error::UnsupportedState("you must call disconnect()".into()));
        }

        establish(&self.inner).await?;

        let cancel = CancellationToken::new();
        let task = tokio::spawn(watcher_loop(Arc::clone(&self.inner), cancel.clone()));
        *self.watcher.lock().await = Some(task);
        *lock(&self.cancel) = cancel;

        info!(model = ?self.status().model, "connected to sampler");
        Ok(())
    }

    async fn disconnect(&self) {
        lock(&self.cancel).cancel();
        if let Some(task) = self.watcher.lock().await.take() {
            let _ = task.await;
        }
        teardown_link(&self.inner).await;
        self.inner.sampling.store(false, Ordering::SeqCst);
    }

    fn is_connected(&self) -> bool {
        self.inner.connected.load(Ordering::SeqCst)
    }

    /// The sampler draws on command; there is no streaming mode to arm.
    async fn start_sampling(&self) -> Result<bool> {
        Ok(true)
    }

    async fn stop_sampling(&self) -> Result<bool> {
        Ok(true)
    }

    async fn soft_reset(&self) -> Result<()> {
        self.disconnect().await;
        tokio::time::sleep(Duration::from_secs(1)).await;
        self.connect().await
    }
}

/// Open the link and power up the sampler. Shared by `connect()` and the
/// watcher's recovery path.
async fn establish(inner: &Arc<Inner>) -> Result<()> {
    let transport = inner.connector.open().await?;
    *inner.link.lock().await = Some(transport);
    inner.connected.store(true, Ordering::SeqCst);

    if let Err(e) = status_exchange(inner, b"STS,2\r\n").await {
        error!(error = %e, "sampler power-on handshake failed");
        teardown_link(inner).await;
        return Err(Error::UnknownState);
    }
    if lock(&inner.data).status_timestamp.is_none() {
        teardown_link(inner).await;
        return Err(Error::UnknownState);
    }
    Ok(())
}

async fn teardown_link(inner: &Arc<Inner>) {
    inner.connected.store(false, Ordering::SeqCst);
    if let Some(mut transport) = inner.link.lock().await.take() {
        let _ = transport.close().await;
    }
}

/// Watch a sample to completion; recover a dead link.
async fn watcher_loop(inner: Arc<Inner>, cancel: CancellationToken) {
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = tokio::time::sleep(inner.config.watch_interval) => {}
        }
        if cancel.is_cancelled() {
            break;
        }

        if !inner.connected.load(Ordering::SeqCst) {
            warn!("sampler link down, attempting soft reset");
            teardown_link(&inner).await;
            tokio::time::sleep(Duration::from_secs(1)).await;
            if cancel.is_cancelled() {
                break;
            }
            if let Err(e) = establish(&inner).await {
                warn!(error = %e, "sampler reset failed");
            }
            continue;
        }

        if inner.sampling.load(Ordering::SeqCst) {
            match status_exchange(&inner, b"STS,1\r\n").await {
                Ok(data) => {
                    if !data.sample_in_progress() {
                        debug!(status = ?data.sample_status, "sample complete");
                        inner.sampling.store(false, Ordering::SeqCst);
                        inner.listeners.notify(&data, &inner.gate);
                    }
                }
                Err(e) => {
                    warn!(error = %e, "status poll during sampling failed");
                }
            }
        }
    }
    debug!("sampler watcher exiting");
}

/// One full command exchange with bounded retries: re-arm the command
/// line, flush stale input, send, read until the status line, parse.
/// Exhausting the attempts marks the driver disconnected and fails with
/// `Timeout`.
async fn status_exchange(inner: &Arc<Inner>, command: &[u8]) -> Result<IscoData> {
    let mut link = inner.link.lock().await;
    let transport = link.as_mut().ok_or(Error::NotConnected)?;
    let mut ex = Exchange::new(transport, inner.config.read_timeout);

    for attempt in 0..inner.config.attempts {
        if attempt > 0 {
            debug!(attempt, "retrying sampler exchange");
        }
        let result = async {
            banner(&mut ex, inner).await?;
            ex.flush_input().await?;
            ex.send(command).await?;
            ex.read_until_contains("MO", inner.config.read_timeout * 3)
                .await
        }
        .await;

        match result {
            Ok(line) => {
                let mut data = lock(&inner.data);
                data.parse_status(&line)?;
                return Ok(data.clone());
            }
            Err(e) => {
                if attempt + 1 == inner.config.attempts {
                    error!(error = %e, "sampler not responding");
                    inner.connected.store(false, Ordering::SeqCst);
                    return Err(Error::Timeout);
                }
            }
        }
    }
    Err(Error::Timeout)
}

/// Re-arm the command line. Once the banner identity is known a bare CRLF
/// produces the `>` prompt; otherwise (or if the prompt fails to appear)
/// `???` wakes the unit and yields the banner.
async fn banner(ex: &mut Exchange<'_>, inner: &Arc<Inner>) -> Result<()> {
    let known = lock(&inner.data).model.is_some();
    if known {
        ex.send(b"\r\n").await?;
        if ex.await_prompt().await.is_ok() {
            return Ok(());
        }
    }

    for _ in 0..inner.config.attempts {
        ex.send(b"???").await?;
        match ex
            .read_until_contains("Model", inner.config.read_timeout * 3)
            .await
        {
            Ok(line) => {
                lock(&inner.data).parse_banner(&line);
                return Ok(());
            }
            Err(Error::Timeout) => continue,
            Err(e) => return Err(e),
        }
    }
    Err(Error::Timeout)
}

/// Buffered line reading over a borrowed transport for the duration of
/// one exchange.
struct Exchange<'a> {
    transport: &'a mut Box<dyn Transport>,
    pending: VecDeque<u8>,
    read_timeout: Duration,
}

impl<'a> Exchange<'a> {
    fn new(transport: &'a mut Box<dyn Transport>, read_timeout: Duration) -> Self {
        Self {
            transport,
            pending: VecDeque::new(),
            read_timeout,
        }
    }

    async fn send(&mut self, bytes: &[u8]) -> Result<()> {
        self.transport.send(bytes).await
    }

    /// Drop everything already received: a previous reply's stragglers
    /// must not be taken for the next reply.
    async fn flush_input(&mut self) -> Result<()> {
        self.pending.clear();
        let mut scratch = [0u8; 256];
        loop {
            match self
                .transport
                .receive(&mut scratch, Duration::from_millis(1))
                .await
            {
                Ok(n) if n > 0 => {
                    debug!(flushed = n, "flushing stale sampler input");
                }
                Ok(_) => return Ok(()),
                Err(Error::Timeout) => return Ok(()),
                Err(e) => return Err(e),
            }
        }
    }

    /// Read one non-empty CR/LF-terminated line, bounded by the per-line
    /// deadline.
    async fn read_line(&mut self) -> Result<String> {
        let deadline = Instant::now() + self.read_timeout;
        let mut line: Vec<u8> = Vec::new();
        let mut scratch = [0u8; 256];
        loop {
            while let Some(b) = self.pending.pop_front() {
                match b {
                    b'\r' | b'\n' => {
                        if !line.is_empty() {
                            return Ok(String::from_utf8_lossy(&line).trim().to_string());
                        }
                    }
                    _ => line.push(b),
                }
            }

            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(Error::Timeout);
            }
            match self
                .transport
                .receive(&mut scratch, remaining.min(Duration::from_millis(100)))
                .await
            {
                Ok(n) => self.pending.extend(&scratch[..n]),
                Err(Error::Timeout) => {}
                Err(e) => return Err(e),
            }
        }
    }

    /// Read lines until one contains `needle`, bounded by `overall`.
    async fn read_until_contains(&mut self, needle: &str, overall: Duration) -> Result<String> {
        let deadline = Instant::now() + overall;
        loop {
            let line = self.read_line().await?;
            debug!(line, "sampler line");
            if line.contains(needle) {
                return Ok(line);
            }
            if Instant::now() >= deadline {
                return Err(Error::Timeout);
            }
        }
    }

    /// Wait for the `>` prompt, which arrives without a line terminator.
    async fn await_prompt(&mut self) -> Result<()> {
        let deadline = Instant::now() + self.read_timeout;
        let mut scratch = [0u8; 256];
        loop {
            while let Some(b) = self.pending.pop_front() {
                if b == b'>' {
                    return Ok(());
                }
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(Error::Timeout);
            }
            match self
                .transport
                .receive(&mut scratch, remaining.min(Duration::from_millis(100)))
                .await
            {
                Ok(n) => self.pending.extend(&scratch[..n]),
                Err(Error::Timeout) => {}
                Err(e) => return Err(e),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builder::IscoBuilder;
    use hydrolib_core::FnListener;
    use hydrolib_test_harness::{MockTransport, QueueConnector};

    const BANNER: &[u8] = b"ISCO Model 6712 HW Rev A Software Rev 1.20 ID 42\r\n";
    const STATUS_IDLE: &[u8] = b"MO,6712,ID,42,TI,123.456,STS,1,MM,0\r\n";
    const STATUS_SAMPLING: &[u8] =
        b"MO,6712,ID,42,TI,123.456,STS,1,STI,120.1,BTL,3,SVO,1000,SST,12,CS,3F\r\n";
    const STATUS_DONE: &[u8] =
        b"MO,6712,ID,42,TI,125.9,STS,1,STI,125.0,BTL,3,SVO,1000,SST,1,CS,40\r\n";

    /// Expectations for the connect handshake: banner then power-on
    /// status.
    fn connect_exchanges(mock: &mut MockTransport) {
        mock.expect(b"???", BANNER);
        mock.expect(b"STS,2\r\n", STATUS_IDLE);
    }

    fn sampler_with(mock: MockTransport) -> Isco {
        IscoBuilder::new()
            .connector(Arc::new(QueueConnector::single(mock)))
            .read_timeout(Duration::from_millis(200))
            .watch_interval(Duration::from_millis(100))
            .build()
            .unwrap()
    }

    #[tokio::test]
    async fn connect_reads_banner_and_status() {
        let mut mock = MockTransport::new();
        connect_exchanges(&mut mock);
        let sampler = sampler_with(mock);

        sampler.connect().await.unwrap();
        assert!(sampler.is_connected());

        let status = sampler.status();
        assert_eq!(status.model.as_deref(), Some("6712"));
        assert_eq!(status.hardware_revision.as_deref(), Some("A"));
        assert_eq!(status.id.as_deref(), Some("42"));
        assert!(status.status_timestamp.is_some());
        assert!(!sampler.is_sampling());

        sampler.disconnect().await;
        assert!(!sampler.is_connected());
    }

    #[tokio::test]
    async fn silent_sampler_fails_with_unknown_state() {
        // No expectations: every send fails, all attempts burn out.
        let sampler = sampler_with(MockTransport::new());
        let result = sampler.connect().await;
        assert!(matches!(result, Err(Error::UnknownState)));
        assert!(!sampler.is_connected());
    }

    #[tokio::test]
    async fn take_sample_uses_prompt_once_banner_known() {
        let mut mock = MockTransport::new();
        connect_exchanges(&mut mock);
        // Banner known: bare CRLF re-arms the prompt, then the command.
        mock.expect(b"\r\n", b">");
        mock.expect(b"BTL,3,SVO,1000\r\n", STATUS_SAMPLING);
        let sent = mock.sent_log();
        let sampler = sampler_with(mock);

        sampler.connect().await.unwrap();
        let data = sampler.take_sample(3, 1000).await.unwrap();

        assert!(data.sample_in_progress());
        assert_eq!(data.bottle, Some(3));
        assert!(sampler.is_sampling());
        assert!(sent
            .lock()
            .unwrap()
            .iter()
            .any(|s| s == b"BTL,3,SVO,1000\r\n"));
    }

    #[tokio::test]
    async fn bottle_out_of_range_is_invalid_input() {
        let mut mock = MockTransport::new();
        connect_exchanges(&mut mock);
        let sampler = sampler_with(mock);
        sampler.connect().await.unwrap();

        assert!(matches!(
            sampler.take_sample(0, 1000).await,
            Err(Error::InvalidInput(_))
        ));
        assert!(matches!(
            sampler.take_sample(25, 1000).await,
            Err(Error::InvalidInput(_))
        ));
    }

    #[tokio::test]
    async fn watcher_notifies_when_sample_completes() {
        let mut mock = MockTransport::new();
        connect_exchanges(&mut mock);
        mock.expect(b"\r\n", b">");
        mock.expect(b"BTL,3,SVO,1000\r\n", STATUS_SAMPLING);
        // The watcher's poll: prompt re-arm, then a completed status.
        mock.expect(b"\r\n", b">");
        mock.expect(b"STS,1\r\n", STATUS_DONE);
        let sampler = sampler_with(mock);

        let received = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&received);
        sampler.add_listener(Arc::new(FnListener(move |d: &IscoData| {
            sink.lock().unwrap().push(d.clone());
        })));

        sampler.connect().await.unwrap();
        sampler.take_sample(3, 1000).await.unwrap();
        assert!(sampler.is_sampling());

        // Let the watcher tick.
        tokio::time::sleep(Duration::from_millis(500)).await;

        assert!(!sampler.is_sampling());
        let notifications = received.lock().unwrap();
        assert_eq!(notifications.len(), 1);
        assert_eq!(notifications[0].sample_status, Some(1));
    }

    #[tokio::test]
    async fn poll_status_parses_reply() {
        let mut mock = MockTransport::new();
        connect_exchanges(&mut mock);
        mock.expect(b"\r\n", b">");
        mock.expect(b"STS,1\r\n", STATUS_IDLE);
        let sampler = sampler_with(mock);

        sampler.connect().await.unwrap();
        let data = sampler.poll_status().await.unwrap();
        assert_eq!(data.status, Some(1));
        assert_eq!(data.status_time, Some(123.456));
    }
}
