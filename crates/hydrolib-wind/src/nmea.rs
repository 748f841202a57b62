//! Airmar NMEA weather-station driver.
//!
//! The station streams standard NMEA 0183 sentences (`$TALKER,…*CS`,
//! checksum = XOR of everything between `$` and `*`). One wind reading
//! requires three sentence types to have all arrived since the last
//! reading: `$HCHDG` (heading), `$WIMWD` (wind), `$WIMDA` (meteorological
//! composite). Arrival is tracked in a bitmask that resets to zero each
//! time a reading is emitted.
//!
//! On connect the station is told which sentences to emit via proprietary
//! `$PAMTC,EN` commands; if too many sentences pass without completing a
//! reading, the initialization set is sent again.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use hydrolib_core::error::{Error, Result};
use hydrolib_core::{
    spawn_line_reader, CollectingGate, Connector, DeviceState, Instrument, LineBuffer, Listener,
    ListenerSet, ReaderConfig, ReaderHandle, SharedState,
};
use hydrolib_transport::TcpConnector;

use crate::data::WindData;

/// Bit set when a `$HCHDG` sentence has arrived.
const HAVE_HEADING: u8 = 0x01;
/// Bit set when a `$WIMWD` sentence has arrived.
const HAVE_WIND: u8 = 0x02;
/// Bit set when a `$WIMDA` sentence has arrived.
const HAVE_MET: u8 = 0x04;
/// All three sentence types present.
const HAVE_ALL: u8 = HAVE_HEADING | HAVE_WIND | HAVE_MET;

/// Sentences without a completed reading before the station is
/// re-initialized.
const MAX_SENTENCES_WITHOUT_WIND: u32 = 100;

/// Sentence-enable commands sent at connect, before checksum and CRLF are
/// appended. Everything else stays disabled.
const INIT_SENTENCES: &[&str] = &[
    "$PAMTC,EN,ALL,0*",
    "$PAMTC,EN,HDG,1,2*",
    "$PAMTC,EN,MWD,1,5*",
    "$PAMTC,EN,MDA,1,5*",
    // Use GPS course over ground instead of the compass above 3 knots.
    "$PAMTC,OPTION,SET,1,1*",
];

/// NMEA device states: the station either streams or it doesn't.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AirmarState {
    /// No wind reading completed yet.
    Unknown,
    /// Readings are flowing.
    Operating,
}

impl DeviceState for AirmarState {
    fn is_unknown(&self) -> bool {
        matches!(self, AirmarState::Unknown)
    }
}

/// Two-hex-digit XOR checksum of an NMEA sentence body.
///
/// The leading `$` and anything from `*` on are excluded.
pub fn nmea_checksum(sentence: &str) -> String {
    let body = sentence.strip_prefix('$').unwrap_or(sentence);
    let body = body.split('*').next().unwrap_or(body);
    let sum = body.bytes().fold(0u8, |acc, b| acc ^ b);
    format!("{sum:02X}")
}

/// Whether a received sentence's checksum (if it carries one) is valid.
fn checksum_ok(sentence: &str) -> bool {
    match sentence.rsplit_once('*') {
        Some((_, given)) => given.trim().eq_ignore_ascii_case(&nmea_checksum(sentence)),
        None => true,
    }
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|p| p.into_inner())
}

/// Airmar NMEA weather-station driver.
pub struct AirmarWind {
    connector: Arc<dyn Connector>,
    probe_ttl: Duration,
    state: SharedState<AirmarState>,
    lines: LineBuffer,
    listeners: ListenerSet<WindData>,
    gate: CollectingGate,
    connected: AtomicBool,
    reader: tokio::sync::Mutex<Option<ReaderHandle>>,
    cancel: Mutex<CancellationToken>,
    writer: Arc<Mutex<Option<mpsc::Sender<Vec<u8>>>>>,
}

impl AirmarWind {
    fn new(connector: Arc<dyn Connector>, probe_ttl: Duration, gate: CollectingGate) -> Self {
        Self {
            connector,
            probe_ttl,
            state: SharedState::new(AirmarState::Unknown),
            lines: LineBuffer::new(),
            listeners: ListenerSet::new(),
            gate,
            connected: AtomicBool::new(false),
            reader: tokio::sync::Mutex::new(None),
            cancel: Mutex::new(CancellationToken::new()),
            writer: Arc::new(Mutex::new(None)),
        }
    }

    /// Register a listener for wind readings.
    pub fn add_listener(&self, listener: Arc<dyn Listener<WindData>>) {
        self.listeners.add(listener);
    }

    /// The station's current believed state.
    pub fn device_state(&self) -> AirmarState {
        self.state.get()
    }

    /// Queue the sentence-enable set on the link.
    async fn send_init_sentences(&self) -> Result<()> {
        let writer = lock(&self.writer).clone().ok_or(Error::NotConnected)?;
        for body in INIT_SENTENCES {
            let sentence = format!("{body}{}\r\n", nmea_checksum(body));
            writer
                .send(sentence.into_bytes())
                .await
                .map_err(|_| Error::NotConnected)?;
        }
        Ok(())
    }

    async fn teardown(&self) {
        self.connected.store(false, Ordering::SeqCst);
        lock(&self.cancel).cancel();
        if let Some(reader) = self.reader.lock().await.take() {
            reader.shutdown().await;
        }
        *lock(&self.writer) = None;
    }

    fn make_handler(&self) -> impl FnMut(&str) + Send + 'static {
        let state = self.state.clone();
        let listeners = self.listeners.clone();
        let gate = self.gate.clone();
        let writer = Arc::clone(&self.writer);

        let mut have: u8 = 0;
        let mut sentences_without_wind: u32 = 0;
        let mut heading = String::new();
        let mut wind = String::new();
        let mut met = String::new();

        move |line: &str| {
            if !line.starts_with('$') {
                return;
            }
            if !checksum_ok(line) {
                debug!(line, "dropping sentence with bad checksum");
                return;
            }

            let talker = line.split(',').next().unwrap_or("");
            if talker.contains("$HCHDG") {
                heading = line.to_string();
                have |= HAVE_HEADING;
            } else if talker.contains("$WIMWD") {
                wind = line.to_string();
                have |= HAVE_WIND;
            } else if talker.contains("$WIMDA") {
                met = line.to_string();
                have |= HAVE_MET;
            }
            // Other sentence types (GPS and friends) pass through
            // uncounted toward a reading.

            sentences_without_wind += 1;
            if sentences_without_wind >= MAX_SENTENCES_WITHOUT_WIND {
                warn!("too many sentences without a wind reading, re-initializing");
                if let Some(tx) = lock(&writer).clone() {
                    for body in INIT_SENTENCES {
                        let sentence = format!("{body}{}\r\n", nmea_checksum(body));
                        // Best effort from the reader task; a full queue
                        // just drops the re-init until next time.
                        let _ = tx.try_send(sentence.into_bytes());
                    }
                }
                sentences_without_wind = 0;
                state.set(AirmarState::Unknown);
            }

            if have == HAVE_ALL {
                have = 0;
                sentences_without_wind = 0;
                match WindData::from_nmea_sentences(&heading, &wind, &met) {
                    Ok(reading) => {
                        listeners.notify(&reading, &gate);
                        state.set(AirmarState::Operating);
                    }
                    Err(e) => debug!(error = %e, "dropping malformed sentence triple"),
                }
            }
        }
    }
}

#[async_trait]
impl Instrument for AirmarWind {
    fn name(&self) -> &str {
        "airmar"
    }

    async fn connect(&self) -> Result<()> {
        if self.is_connected() {
            return Err(Error::UnsupportedState("you must call disconnect()".into()));
        }

        let transport = self.connector.open().await?;
        let cancel = CancellationToken::new();
        self.state.set(AirmarState::Unknown);
        self.lines.clear();

        let reader_config = ReaderConfig {
            liveness_timeout: Some(Duration::from_secs(10)),
            probe: b"\n".to_vec(),
            reconnect: Some(Arc::clone(&self.connector)),
            ..ReaderConfig::default()
        };
        let reader = spawn_line_reader(
            transport,
            reader_config,
            self.lines.clone(),
            cancel.clone(),
            self.make_handler(),
        );
        *lock(&self.writer) = Some(reader.writer());
        *self.reader.lock().await = Some(reader);
        *lock(&self.cancel) = cancel.clone();
        self.connected.store(true, Ordering::SeqCst);

        self.send_init_sentences().await?;

        // Wait for the first complete reading to confirm the station is
        // alive and configured.
        let deadline = Instant::now() + self.probe_ttl;
        while self.state.get().is_unknown() {
            if cancel.is_cancelled() {
                return Ok(());
            }
            if Instant::now() >= deadline {
                error!("no wind reading after initialization");
                self.teardown().await;
                return Err(Error::UnknownState);
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }

        info!("connected to weather station");
        Ok(())
    }

    async fn disconnect(&self) {
        self.teardown().await;
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    /// The station streams unconditionally.
    async fn start_sampling(&self) -> Result<bool> {
        Ok(true)
    }

    async fn stop_sampling(&self) -> Result<bool> {
        Ok(true)
    }

    async fn soft_reset(&self) -> Result<()> {
        self.disconnect().await;
        self.connect().await
    }
}

/// Fluent builder for [`AirmarWind`].
pub struct AirmarBuilder {
    connector: Option<Arc<dyn Connector>>,
    probe_ttl: Duration,
    gate: CollectingGate,
}

impl Default for AirmarBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl AirmarBuilder {
    /// Create a builder with default windows.
    pub fn new() -> Self {
        Self {
            connector: None,
            probe_ttl: Duration::from_secs(10),
            gate: CollectingGate::default(),
        }
    }

    /// Set the `host:port` endpoint, connected over TCP.
    pub fn endpoint(mut self, addr: &str) -> Self {
        self.connector = Some(Arc::new(TcpConnector::new(addr)));
        self
    }

    /// Supply a custom connector.
    pub fn connector(mut self, connector: Arc<dyn Connector>) -> Self {
        self.connector = Some(connector);
        self
    }

    /// How long connect() waits for the first reading (default: 10 s).
    pub fn probe_ttl(mut self, ttl: Duration) -> Self {
        self.probe_ttl = ttl;
        self
    }

    /// Share the system's collecting gate.
    pub fn collecting_gate(mut self, gate: CollectingGate) -> Self {
        self.gate = gate;
        self
    }

    /// Build the driver, disconnected.
    pub fn build(self) -> Result<AirmarWind> {
        let connector = self
            .connector
            .ok_or_else(|| Error::UnsupportedState("an endpoint or connector is required".into()))?;
        Ok(AirmarWind::new(connector, self.probe_ttl, self.gate))
    }
}
