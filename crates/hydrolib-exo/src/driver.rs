//! The EXO2 sonde driver.
//!
//! All command correlation goes through the expect engine: send, wait for
//! the `#` prompt in the line buffer, extract fixed-position fields, clear.
//! The reader task classifies traffic into the three-state machine
//! (`Unknown` / `MenuMain` / `Operating`) and dispatches run-mode records
//! to listeners.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::{Local, NaiveTime};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use hydrolib_core::error::{Error, Result};
use hydrolib_core::{
    spawn_line_reader, CollectingGate, Connector, DeviceState, ExpectEngine, Instrument,
    LineBuffer, Listener, ListenerSet, ReaderConfig, ReaderHandle, SharedState, StateTarget,
};

use crate::data::{Exo2Data, VERTICAL_POSITION_ID};

/// Sentinel parameter count before `para` has run; no record is that wide,
/// so only explicit `*` records classify as data until then.
const NUM_PARAMS_UNSET: usize = 99;

/// EXO2 device states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExoState {
    /// Just connected, traffic not yet classified.
    Unknown,
    /// At the DCP main menu (`#` prompt).
    MenuMain,
    /// Streaming run-mode records.
    Operating,
}

impl DeviceState for ExoState {
    fn is_unknown(&self) -> bool {
        matches!(self, ExoState::Unknown)
    }
}

/// Timing parameters, fixed at build time.
#[derive(Debug, Clone)]
pub(crate) struct ExoConfig {
    /// Reply wait for ordinary commands.
    pub expect_ttl: Duration,
    /// Reply wait for a wipe cycle, which runs the wiper motor.
    pub wipe_ttl: Duration,
    /// Resend attempts for state changes.
    pub change_retries: u32,
    /// Widened per-attempt window for transitions confirmed by streamed
    /// data (entering run mode, probing an unclassified device).
    pub probe_ttl: Duration,
    /// Hard ceiling on one sampling session.
    pub sampling_max_time: Duration,
    /// Re-sync the sonde clock when the last sync is older than this.
    pub clock_sync_period: Duration,
}

/// YSI EXO2 multi-parameter sonde driver.
pub struct Exo2 {
    connector: Arc<dyn Connector>,
    config: ExoConfig,
    state: SharedState<ExoState>,
    lines: LineBuffer,
    identifiers: Arc<Mutex<Vec<String>>>,
    num_params: Arc<AtomicUsize>,
    listeners: ListenerSet<Exo2Data>,
    gate: CollectingGate,
    connected: AtomicBool,
    engine: Mutex<Option<Arc<ExpectEngine>>>,
    reader: tokio::sync::Mutex<Option<ReaderHandle>>,
    cancel: Mutex<CancellationToken>,
    serial: Mutex<String>,
    sample_period_ms: Mutex<Option<f64>>,
    sampling_started: Arc<Mutex<Option<Instant>>>,
    last_clock_sync: Mutex<Option<Instant>>,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|p| p.into_inner())
}

/// Commands carry two backspaces to clear stray characters at the prompt,
/// and a CR terminator.
fn cmd(text: &str) -> Vec<u8> {
    format!("\x08\x08{text}\r").into_bytes()
}

impl Exo2 {
    pub(crate) fn new(
        connector: Arc<dyn Connector>,
        config: ExoConfig,
        gate: CollectingGate,
    ) -> Self {
        Self {
            connector,
            config,
            state: SharedState::new(ExoState::Unknown),
            lines: LineBuffer::new(),
            identifiers: Arc::new(Mutex::new(Vec::new())),
            num_params: Arc::new(AtomicUsize::new(NUM_PARAMS_UNSET)),
            listeners: ListenerSet::new(),
            gate,
            connected: AtomicBool::new(false),
            engine: Mutex::new(None),
            reader: tokio::sync::Mutex::new(None),
            cancel: Mutex::new(CancellationToken::new()),
            serial: Mutex::new(String::new()),
            sample_period_ms: Mutex::new(None),
            sampling_started: Arc::new(Mutex::new(None)),
            last_clock_sync: Mutex::new(None),
        }
    }

    /// Register a listener for run-mode records.
    pub fn add_listener(&self, listener: Arc<dyn Listener<Exo2Data>>) {
        self.listeners.add(listener);
    }

    /// The sonde's current believed state.
    pub fn device_state(&self) -> ExoState {
        self.state.get()
    }

    /// Serial number read at connect time.
    pub fn serial(&self) -> String {
        lock(&self.serial).clone()
    }

    /// Sample period in milliseconds read at connect time.
    pub fn sample_period_ms(&self) -> Option<f64> {
        *lock(&self.sample_period_ms)
    }

    /// Parameter identifiers reported by `para`.
    pub fn identifiers(&self) -> Vec<String> {
        lock(&self.identifiers).clone()
    }

    fn engine(&self) -> Result<Arc<ExpectEngine>> {
        lock(&self.engine).clone().ok_or(Error::NotConnected)
    }

    /// Widened window for transitions confirmed by streamed data, whose
    /// arrival depends on the sample rate: entering run mode, or probing
    /// an unclassified device.
    fn change_ttl(&self, target: StateTarget<ExoState>) -> Duration {
        if matches!(target, StateTarget::State(ExoState::Operating)) || self.state.get().is_unknown()
        {
            self.config.probe_ttl
        } else {
            Duration::from_secs(1)
        }
    }

    /// Read the sonde serial number (`sn`).
    pub async fn serial_number(&self) -> Result<String> {
        let engine = self.engine()?;
        engine.expect(&cmd("sn"), self.config.expect_ttl, "#").await?;
        // Reply shape: the echoed command, the serial, the prompt.
        let sn = if engine.lines().len() >= 3 {
            engine.lines().line(1).unwrap_or_default()
        } else {
            return Err(Error::InvalidInput("short reply to sn".into()));
        };
        engine.lines().clear();
        Ok(sn)
    }

    /// Set the run-mode sample interval, in milliseconds (`Setperiod`).
    pub async fn set_sample_interval(&self, interval_ms: f64) -> Result<()> {
        let engine = self.engine()?;
        engine
            .expect(
                &cmd(&format!("Setperiod {interval_ms}")),
                self.config.expect_ttl,
                "#",
            )
            .await?;
        engine.lines().clear();
        Ok(())
    }

    /// Read the configured sample interval in milliseconds.
    pub async fn read_sample_interval(&self) -> Result<f64> {
        let engine = self.engine()?;
        engine
            .expect(&cmd("Setperiod"), self.config.expect_ttl, "#")
            .await?;
        let value = engine
            .lines()
            .line(1)
            .and_then(|l| l.trim().parse::<f64>().ok())
            .ok_or_else(|| Error::InvalidInput("unparseable sample interval".into()));
        engine.lines().clear();
        value
    }

    /// Run a brush wipe cycle (`Twipeb`). Slow; the wiper motor has to
    /// finish before the prompt returns.
    pub async fn wipe(&self) -> Result<()> {
        let engine = self.engine()?;
        engine.expect(&cmd("Twipeb"), self.config.wipe_ttl, "#").await?;
        engine.lines().clear();
        Ok(())
    }

    /// Wipes remaining in the current wipe cycle (`Hwipesleft`); zero when
    /// idle.
    pub async fn wipes_left(&self) -> Result<i32> {
        let engine = self.engine()?;
        engine
            .expect(&cmd("Hwipesleft"), self.config.expect_ttl, "#")
            .await?;
        let wipes = engine
            .lines()
            .line(1)
            .and_then(|l| {
                l.split_whitespace()
                    .next()
                    .and_then(|f| f.parse::<i32>().ok())
            })
            .ok_or_else(|| Error::InvalidInput("unparseable wipes-left reply".into()));
        engine.lines().clear();
        wipes
    }

    /// Read the sonde's clock (`time`). The DCP has no date command; the
    /// date is assumed correct.
    pub async fn read_clock(&self) -> Result<NaiveTime> {
        let engine = self.engine()?;
        engine.expect(&cmd("time"), self.config.expect_ttl, "#").await?;
        let time = engine
            .lines()
            .line(1)
            .and_then(|l| NaiveTime::parse_from_str(l.trim(), "%H:%M:%S").ok())
            .ok_or_else(|| Error::InvalidInput("unparseable sonde time".into()));
        engine.lines().clear();
        time
    }

    /// Compare the sonde clock against the system clock and set it when
    /// drift exceeds two seconds. Drift beyond five minutes is flagged.
    pub async fn sync_clock(&self) -> Result<()> {
        let sonde_time = self.read_clock().await?;
        let now = Local::now();
        let drift = (now.date_naive().and_time(sonde_time) - now.naive_local()).abs();

        debug!(sonde = %sonde_time, drift_s = drift.num_seconds(), "clock sync check");
        if drift > chrono::Duration::minutes(5) {
            warn!("sonde clock more than 5 minutes from system clock");
        }

        if drift > chrono::Duration::seconds(2) {
            // One second ahead to cover command turnaround.
            let target = Local::now().naive_local() + chrono::Duration::seconds(1);
            let engine = self.engine()?;
            engine
                .expect(
                    &cmd(&format!("time {}", target.format("%-H:%M:%S"))),
                    self.config.expect_ttl,
                    "#",
                )
                .await?;
            engine.lines().clear();
        }

        *lock(&self.last_clock_sync) = Some(Instant::now());
        Ok(())
    }

    /// Query which parameter identifiers are in the data stream (`para`).
    async fn para(&self) -> Result<()> {
        let engine = self.engine()?;
        engine.expect(&cmd("para"), self.config.expect_ttl, "#").await?;

        // Reply shape: the echoed command, an identifier list, the prompt.
        for line in engine.lines().lines() {
            let tokens: Vec<&str> = line
                .split(|c: char| c == ',' || c.is_whitespace())
                .filter(|t| !t.is_empty())
                .collect();
            if tokens.len() <= 1 {
                continue;
            }
            if tokens[0].parse::<u32>().is_err() {
                continue;
            }
            let ids: Vec<String> = tokens
                .iter()
                .map(|t| {
                    if *t == VERTICAL_POSITION_ID {
                        // Unfiltered vertical position doubles as depth_m.
                        "22".to_string()
                    } else {
                        (*t).to_string()
                    }
                })
                .collect();
            self.num_params.store(ids.len(), Ordering::SeqCst);
            *lock(&self.identifiers) = ids;
        }
        engine.lines().clear();
        Ok(())
    }

    /// Escape run mode back to the main menu.
    async fn pause(&self) -> Result<()> {
        if self.state.get() != ExoState::Operating {
            return Ok(());
        }
        let engine = self.engine()?;
        let mut last = Ok(());
        for _ in 0..self.config.change_retries {
            if lock(&self.cancel).is_cancelled() {
                return Ok(());
            }
            match engine
                .expect(&cmd("\x1b"), self.config.probe_ttl, "#")
                .await
            {
                Ok(()) => {
                    engine.lines().clear();
                    return Ok(());
                }
                Err(e) => last = Err(e),
            }
        }
        last
    }

    /// Put the sonde in a known state: probe, pause if running, then learn
    /// the parameter list.
    async fn settle(&self) -> Result<()> {
        let engine = self.engine()?;
        // Prompt the device to reveal its state.
        engine
            .change_state(
                &cmd(""),
                StateTarget::NotUnknown,
                self.config.change_retries,
                &self.state,
                self.change_ttl(StateTarget::NotUnknown),
            )
            .await?;

        match self.state.get() {
            ExoState::Operating => self.pause().await?,
            ExoState::MenuMain => {}
            ExoState::Unknown => return Err(Error::UnknownState),
        }
        self.para().await?;
        self.lines.clear();
        Ok(())
    }

    /// Best-effort identity and configuration pass after connect.
    async fn initialize(&self) -> Result<()> {
        self.sync_clock().await?;
        *lock(&self.serial) = self.serial_number().await?;
        self.set_sample_interval(1000.0).await?;
        *lock(&self.sample_period_ms) = Some(self.read_sample_interval().await?);
        Ok(())
    }

    async fn teardown(&self) {
        self.connected.store(false, Ordering::SeqCst);
        lock(&self.cancel).cancel();
        if let Some(reader) = self.reader.lock().await.take() {
            reader.shutdown().await;
        }
        *lock(&self.engine) = None;
    }

    fn make_handler(&self) -> impl FnMut(&str) + Send + 'static {
        let state = self.state.clone();
        let identifiers = Arc::clone(&self.identifiers);
        let num_params = Arc::clone(&self.num_params);
        let listeners = self.listeners.clone();
        let gate = self.gate.clone();
        let sampling_started = Arc::clone(&self.sampling_started);
        let max_sampling = self.config.sampling_max_time;

        move |line: &str| {
            // Sampling sessions have a hard ceiling; disarm collection
            // when one overruns.
            if gate.is_collecting() {
                if let Some(t0) = *lock(&sampling_started) {
                    if t0.elapsed() > max_sampling {
                        warn!("sampling window exceeded, disarming collection");
                        gate.set_collecting(false);
                    }
                }
            }

            if line.contains("***") {
                return;
            }
            if line == "#" {
                state.set(ExoState::MenuMain);
                return;
            }

            let stripped = line.trim_start_matches(['#', '*']).trim();
            let nfields = stripped.split_whitespace().count();
            let num = num_params.load(Ordering::SeqCst);
            if line.starts_with('*') || nfields >= num + 2 {
                let ids = lock(&identifiers).clone();
                match Exo2Data::parse(line, &ids) {
                    Ok(record) => listeners.notify(&record, &gate),
                    Err(e) => debug!(error = %e, line, "dropping unparseable record"),
                }
                state.set(ExoState::Operating);
            } else {
                state.set(ExoState::Unknown);
            }
        }
    }
}

#[async_trait]
impl Instrument for Exo2 {
    fn name(&self) -> &str {
        "exo2"
    }

    async fn connect(&self) -> Result<()> {
        if self.is_connected() {
            return Err(Error::UnsupportedState("you must call disconnect()".into()));
        }
        debug!("connecting to sonde");

        let transport = self.connector.open().await?;
        let cancel = CancellationToken::new();
        self.state.set(ExoState::Unknown);
        self.lines.clear();

        let reader_config = ReaderConfig {
            prompts: vec!["#"],
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
        let engine = Arc::new(ExpectEngine::new(
            reader.writer(),
            self.lines.clone(),
            cancel.clone(),
            self.gate.clone(),
            b"sn\r".to_vec(),
        ));
        *lock(&self.engine) = Some(Arc::clone(&engine));
        *self.reader.lock().await = Some(reader);
        *lock(&self.cancel) = cancel;
        self.connected.store(true, Ordering::SeqCst);

        // Escape run mode (in case it is running) and find the main menu,
        // then settle into a known state.
        let handshake = async {
            engine
                .change_state(
                    &cmd("\x1b"),
                    StateTarget::State(ExoState::MenuMain),
                    self.config.change_retries,
                    &self.state,
                    self.change_ttl(StateTarget::State(ExoState::MenuMain)),
                )
                .await?;
            self.settle().await
        };
        if let Err(e) = handshake.await {
            error!(error = %e, "sonde handshake failed");
            self.teardown().await;
            return Err(Error::UnknownState);
        }

        // Identity and defaults; failures here are not fatal to the
        // connection.
        if let Err(e) = self.initialize().await {
            warn!(error = %e, "sonde initialization incomplete");
        }

        info!(serial = %self.serial(), "connected to sonde");
        Ok(())
    }

    async fn disconnect(&self) {
        self.teardown().await;
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    /// Enter run mode. Refused while a wipe cycle is in progress, and a
    /// no-op when the system is already collecting.
    async fn start_sampling(&self) -> Result<bool> {
        if !self.is_connected() {
            return Ok(false);
        }
        if self.gate.is_collecting() {
            debug!("sonde already sampling, doing nothing");
            return Ok(false);
        }

        let wipes = self.wipes_left().await.unwrap_or(99);
        if wipes != 0 {
            warn!(wipes, "wipe cycle in progress, not starting sampling");
            return Ok(false);
        }

        let stale = lock(&self.last_clock_sync)
            .map(|t| t.elapsed() > self.config.clock_sync_period)
            .unwrap_or(true);
        if stale {
            if let Err(e) = self.sync_clock().await {
                warn!(error = %e, "clock sync before sampling failed");
            }
        }

        let engine = self.engine()?;
        engine
            .change_state(
                &cmd("run"),
                StateTarget::State(ExoState::Operating),
                3,
                &self.state,
                self.change_ttl(StateTarget::State(ExoState::Operating)),
            )
            .await?;
        *lock(&self.sampling_started) = Some(Instant::now());
        Ok(true)
    }

    async fn stop_sampling(&self) -> Result<bool> {
        if !self.is_connected() {
            return Ok(false);
        }
        if self.gate.is_collecting() {
            let engine = self.engine()?;
            engine
                .change_state(
                    &cmd("\x1b"),
                    StateTarget::State(ExoState::MenuMain),
                    self.config.change_retries,
                    &self.state,
                    self.change_ttl(StateTarget::State(ExoState::MenuMain)),
                )
                .await?;
        }
        Ok(true)
    }

    async fn soft_reset(&self) -> Result<()> {
        let _ = self.stop_sampling().await;
        self.disconnect().await;
        self.connect().await
    }
}
