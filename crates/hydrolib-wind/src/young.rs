//! Young 32500 compass/anemometer interface driver.
//!
//! The 32500 exposes two ASCII interface flavors depending on firmware
//! setup: an interactive menu (multi-line screens ending in `X) EXIT`
//! lines) and a terser command line (`CMDnnn` commands behind a `>`
//! prompt). The flavor is detected from observed traffic, never assumed.
//! Data records are 8 space-separated integers at 0.1, 2, or 15 Hz.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use hydrolib_core::error::{Error, Result};
use hydrolib_core::{
    spawn_line_reader, CollectingGate, Connector, DeviceState, ExpectEngine, Instrument,
    LineBuffer, Listener, ListenerSet, ReaderConfig, ReaderHandle, SharedState, StateTarget,
};
use hydrolib_transport::TcpConnector;

use crate::data::WindData;

/// Young 32500 device states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum YoungState {
    /// Just connected, traffic not yet classified.
    Unknown,
    /// At the interactive main menu.
    MenuMain,
    /// Streaming data records.
    Operating,
    /// In the output-rate submenu.
    OutputRate,
    /// In the compass-damping submenu.
    CompassDamping,
    /// At the `>` command-line prompt.
    CmdLine,
    /// A command-line command was sent and its outcome not yet observed.
    EvaluatingCmd,
}

impl DeviceState for YoungState {
    fn is_unknown(&self) -> bool {
        matches!(self, YoungState::Unknown)
    }
}

/// Which interface flavor the instrument is running.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum InterfaceKind {
    Unknown,
    Menu,
    CmdLine,
}

/// Output data rates the 32500 supports.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputRate {
    /// One record every ten seconds.
    Hz0_1,
    /// Two records per second.
    Hz2,
    /// Fifteen records per second.
    Hz15,
}

impl OutputRate {
    /// The nearest supported rate for a requested frequency, if any.
    pub fn from_hz(hz: f64) -> Option<Self> {
        if hz == 0.1 {
            Some(OutputRate::Hz0_1)
        } else if hz == 2.0 {
            Some(OutputRate::Hz2)
        } else if hz == 15.0 {
            Some(OutputRate::Hz15)
        } else {
            None
        }
    }

    /// The rate in hertz.
    pub fn as_hz(&self) -> f64 {
        match self {
            OutputRate::Hz0_1 => 0.1,
            OutputRate::Hz2 => 2.0,
            OutputRate::Hz15 => 15.0,
        }
    }
}

/// Compass damping settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Damping {
    /// No averaging.
    None,
    /// Fast averaging.
    Fast,
    /// Slow averaging.
    Slow,
}

/// Menu screens span multiple lines; this tracks which screen's heading we
/// are inside while waiting for its closing `X) EXIT` line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum MenuSection {
    None,
    Commands,
    Rate,
    Damping,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|p| p.into_inner())
}

/// The wind instrument expects CRLF line terminators.
fn cmd(text: &str) -> Vec<u8> {
    format!("{text}\r\n").into_bytes()
}

/// Young 32500 driver.
pub struct Young32500 {
    connector: Arc<dyn Connector>,
    change_retries: u32,
    probe_ttl: Duration,
    state: SharedState<YoungState>,
    interface: Arc<Mutex<InterfaceKind>>,
    lines: LineBuffer,
    listeners: ListenerSet<WindData>,
    gate: CollectingGate,
    connected: AtomicBool,
    engine: Mutex<Option<Arc<ExpectEngine>>>,
    reader: tokio::sync::Mutex<Option<ReaderHandle>>,
    cancel: Mutex<CancellationToken>,
    rate: Mutex<OutputRate>,
    damping: Mutex<Damping>,
}

impl Young32500 {
    fn new(
        connector: Arc<dyn Connector>,
        change_retries: u32,
        probe_ttl: Duration,
        gate: CollectingGate,
    ) -> Self {
        Self {
            connector,
            change_retries,
            probe_ttl,
            state: SharedState::new(YoungState::Unknown),
            interface: Arc::new(Mutex::new(InterfaceKind::Unknown)),
            lines: LineBuffer::new(),
            listeners: ListenerSet::new(),
            gate,
            connected: AtomicBool::new(false),
            engine: Mutex::new(None),
            reader: tokio::sync::Mutex::new(None),
            cancel: Mutex::new(CancellationToken::new()),
            rate: Mutex::new(OutputRate::Hz2),
            damping: Mutex::new(Damping::Slow),
        }
    }

    /// Register a listener for wind readings.
    pub fn add_listener(&self, listener: Arc<dyn Listener<WindData>>) {
        self.listeners.add(listener);
    }

    /// The instrument's current believed state.
    pub fn device_state(&self) -> YoungState {
        self.state.get()
    }

    /// The configured output rate in hertz.
    pub fn output_rate_hz(&self) -> f64 {
        lock(&self.rate).as_hz()
    }

    fn engine(&self) -> Result<Arc<ExpectEngine>> {
        lock(&self.engine).clone().ok_or(Error::NotConnected)
    }

    fn interface_kind(&self) -> InterfaceKind {
        *lock(&self.interface)
    }

    fn change_ttl(&self, target: YoungState) -> Duration {
        if target == YoungState::Operating || self.state.get().is_unknown() {
            self.probe_ttl
        } else {
            Duration::from_secs(1)
        }
    }

    /// Send a command and wait for the target state, marking command-line
    /// commands as in evaluation so the `>` prompt re-confirms the state.
    async fn change(&self, text: &str, target: YoungState, retries: u32) -> Result<()> {
        if self.state.get() == YoungState::CmdLine {
            self.state.set(YoungState::EvaluatingCmd);
        }
        let engine = self.engine()?;
        engine
            .change_state(
                &cmd(text),
                StateTarget::State(target),
                retries,
                &self.state,
                self.change_ttl(target),
            )
            .await
    }

    /// Escape the data stream back to the idle prompt/menu.
    async fn pause(&self) -> Result<()> {
        let target = if self.interface_kind() == InterfaceKind::CmdLine {
            YoungState::CmdLine
        } else {
            YoungState::MenuMain
        };
        let current = self.state.get();
        if current == target {
            return Ok(());
        }
        if current != YoungState::Operating {
            return Err(Error::UnknownState);
        }
        self.change("\u{1b}\u{1b}\u{1b}", target, 3).await
    }

    /// Set the output data rate, from any state the instrument can be
    /// driven out of.
    pub async fn set_output_rate(&self, rate: OutputRate) -> Result<()> {
        if !self.is_connected() {
            return Err(Error::UnsupportedState("you must call connect()".into()));
        }
        let cmdline = self.interface_kind() == InterfaceKind::CmdLine;
        let code = match (rate, cmdline) {
            (OutputRate::Hz15, false) => "A",
            (OutputRate::Hz2, false) => "B",
            (OutputRate::Hz0_1, false) => "C",
            (OutputRate::Hz15, true) => "0",
            (OutputRate::Hz0_1, true) => "1",
            (OutputRate::Hz2, true) => "2",
        };

        match self.state.get() {
            YoungState::Operating => {
                self.pause().await?;
                if cmdline {
                    self.change(&format!("CMD220 {code}"), YoungState::CmdLine, self.change_retries)
                        .await?;
                    self.change("CMD100", YoungState::Operating, self.change_retries)
                        .await?;
                } else {
                    self.change("R", YoungState::OutputRate, self.change_retries).await?;
                    self.change(code, YoungState::MenuMain, self.change_retries).await?;
                    self.change("X", YoungState::Operating, self.change_retries).await?;
                }
            }
            YoungState::MenuMain => {
                self.change("R", YoungState::OutputRate, self.change_retries).await?;
                self.change(code, YoungState::MenuMain, self.change_retries).await?;
            }
            YoungState::CmdLine => {
                self.change(&format!("CMD220 {code}"), YoungState::CmdLine, self.change_retries)
                    .await?;
            }
            other => {
                return Err(Error::UnsupportedState(format!(
                    "set_output_rate from {other:?}"
                )));
            }
        }
        *lock(&self.rate) = rate;
        Ok(())
    }

    /// Set the compass damping (averaging) speed.
    pub async fn set_damping(&self, damping: Damping) -> Result<()> {
        if !self.is_connected() {
            return Err(Error::UnsupportedState("you must call connect()".into()));
        }
        let cmdline = self.interface_kind() == InterfaceKind::CmdLine;
        let code = match (damping, cmdline) {
            (Damping::None, false) => "N",
            (Damping::Fast, false) => "F",
            (Damping::Slow, false) => "S",
            (Damping::None, true) => "0",
            (Damping::Fast, true) => "1",
            (Damping::Slow, true) => "2",
        };

        match self.state.get() {
            YoungState::Operating => {
                self.pause().await?;
                if cmdline {
                    self.change(&format!("CMD200 {code}"), YoungState::CmdLine, self.change_retries)
                        .await?;
                    self.change("CMD100", YoungState::Operating, self.change_retries)
                        .await?;
                } else {
                    self.change("D", YoungState::CompassDamping, self.change_retries)
                        .await?;
                    self.change(code, YoungState::MenuMain, self.change_retries).await?;
                    self.change("X", YoungState::Operating, self.change_retries).await?;
                }
            }
            YoungState::MenuMain => {
                self.change("D", YoungState::CompassDamping, self.change_retries)
                    .await?;
                self.change(code, YoungState::MenuMain, self.change_retries).await?;
            }
            YoungState::CmdLine => {
                self.change(&format!("CMD200 {code}"), YoungState::CmdLine, self.change_retries)
                    .await?;
            }
            other => {
                return Err(Error::UnsupportedState(format!(
                    "set_damping from {other:?}"
                )));
            }
        }
        *lock(&self.damping) = damping;
        Ok(())
    }

    /// Put the instrument in a known, paused state with default settings:
    /// 2 Hz output, slow damping.
    async fn settle(&self) -> Result<()> {
        // Prompt the device to reveal its state.
        let engine = self.engine()?;
        engine
            .change_state(
                &cmd(""),
                StateTarget::NotUnknown,
                self.change_retries,
                &self.state,
                self.probe_ttl,
            )
            .await?;

        match self.state.get() {
            YoungState::Operating => self.pause().await?,
            YoungState::OutputRate | YoungState::CompassDamping => {
                self.change("X", YoungState::MenuMain, self.change_retries).await?;
            }
            YoungState::MenuMain | YoungState::CmdLine => {}
            other => {
                return Err(Error::UnsupportedState(format!(
                    "soft reset not supported from {other:?}"
                )));
            }
        }

        self.set_output_rate(OutputRate::Hz2).await?;
        self.set_damping(Damping::Slow).await?;
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
        let interface = Arc::clone(&self.interface);
        let listeners = self.listeners.clone();
        let gate = self.gate.clone();
        let mut section = MenuSection::None;

        move |line: &str| {
            let fields: Vec<&str> = line.split_whitespace().collect();
            match section {
                MenuSection::None => {
                    if line == "COMMANDS" {
                        section = MenuSection::Commands;
                        *lock(&interface) = InterfaceKind::Menu;
                    } else if line == "OUTPUT RATE" {
                        section = MenuSection::Rate;
                        *lock(&interface) = InterfaceKind::Menu;
                    } else if line == "COMPASS DAMPING" {
                        section = MenuSection::Damping;
                        *lock(&interface) = InterfaceKind::Menu;
                    } else if line.starts_with('*') || line.starts_with('>') {
                        *lock(&interface) = InterfaceKind::CmdLine;
                        if fields.len() == 8 {
                            state.set(YoungState::Operating);
                        } else {
                            state.set(YoungState::CmdLine);
                        }
                    } else if fields.len() == 8 {
                        match WindData::from_ascii_record(line) {
                            Ok(reading) => listeners.notify(&reading, &gate),
                            Err(e) => debug!(error = %e, line, "dropping malformed record"),
                        }
                        state.set(YoungState::Operating);
                    } else {
                        if state.get() == YoungState::Operating {
                            warn!(line, "unrecognized line while operating");
                        }
                        state.set(YoungState::Unknown);
                    }
                }
                MenuSection::Commands => {
                    if line == "X) EXIT TO OPERATE MODE" {
                        state.set(YoungState::MenuMain);
                        section = MenuSection::None;
                    }
                }
                MenuSection::Rate => {
                    if line == "X) EXIT" {
                        state.set(YoungState::OutputRate);
                        section = MenuSection::None;
                    }
                }
                MenuSection::Damping => {
                    if line == "X) EXIT" {
                        state.set(YoungState::CompassDamping);
                        section = MenuSection::None;
                    }
                }
            }
        }
    }
}

#[async_trait]
impl Instrument for Young32500 {
    fn name(&self) -> &str {
        "young32500"
    }

    async fn connect(&self) -> Result<()> {
        if self.is_connected() {
            return Err(Error::UnsupportedState("you must call disconnect()".into()));
        }

        let transport = self.connector.open().await?;
        let cancel = CancellationToken::new();
        self.state.set(YoungState::Unknown);
        *lock(&self.interface) = InterfaceKind::Unknown;
        self.lines.clear();

        let reader_config = ReaderConfig {
            prompts: vec![">"],
            liveness_timeout: Some(Duration::from_secs(10)),
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
            cmd(""),
        ));
        *lock(&self.engine) = Some(engine);
        *self.reader.lock().await = Some(reader);
        *lock(&self.cancel) = cancel;
        self.connected.store(true, Ordering::SeqCst);

        if let Err(e) = self.settle().await {
            error!(error = %e, "wind instrument handshake failed");
            self.teardown().await;
            return Err(Error::UnknownState);
        }

        info!("connected to wind instrument");
        Ok(())
    }

    async fn disconnect(&self) {
        self.teardown().await;
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    async fn start_sampling(&self) -> Result<bool> {
        if !self.is_connected() {
            return Ok(false);
        }
        let (idle, run_cmd) = if self.interface_kind() == InterfaceKind::CmdLine {
            (YoungState::CmdLine, "CMD100")
        } else {
            (YoungState::MenuMain, "X")
        };
        if self.state.get() != idle {
            return Ok(false);
        }
        self.change(run_cmd, YoungState::Operating, self.change_retries)
            .await?;
        Ok(true)
    }

    async fn stop_sampling(&self) -> Result<bool> {
        if !self.is_connected() {
            return Ok(false);
        }
        if self.state.get() == YoungState::MenuMain {
            return Ok(true);
        }
        self.pause().await?;
        Ok(true)
    }

    async fn soft_reset(&self) -> Result<()> {
        let _ = self.stop_sampling().await;
        self.disconnect().await;
        self.connect().await
    }
}

/// Fluent builder for [`Young32500`].
pub struct YoungBuilder {
    connector: Option<Arc<dyn Connector>>,
    change_retries: u32,
    probe_ttl: Duration,
    gate: CollectingGate,
}

impl Default for YoungBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl YoungBuilder {
    /// Create a builder with default retry and probe windows.
    pub fn new() -> Self {
        Self {
            connector: None,
            change_retries: 5,
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

    /// Resend attempts for state changes (default: 5).
    pub fn change_retries(mut self, retries: u32) -> Self {
        self.change_retries = retries;
        self
    }

    /// Per-attempt window for rate-dependent transitions (default: 10 s).
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
    pub fn build(self) -> Result<Young32500> {
        let connector = self
            .connector
            .ok_or_else(|| Error::UnsupportedState("an endpoint or connector is required".into()))?;
        Ok(Young32500::new(
            connector,
            self.change_retries,
            self.probe_ttl,
            self.gate,
        ))
    }
}
