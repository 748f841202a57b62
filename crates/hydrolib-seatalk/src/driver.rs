//! The SeaTalk sounder driver.
//!
//! Packets are `[type, length, payload(length+1)]`; type 0 carries a flags
//! byte and a little-endian 16-bit depth word. The instrument speaks in
//! bursts separated by silence, which is also what re-aligns the stream
//! after an unrecognized packet type: everything buffered is discarded and
//! reading resumes at the next gap.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use hydrolib_core::error::{Error, Result};
use hydrolib_core::{
    CollectingGate, Connector, DeviceState, Instrument, Listener, ListenerSet, SharedState,
    Transport,
};
use hydrolib_transport::TcpConnector;

use crate::data::SounderData;

/// Depth packet type byte.
const PACKET_DEPTH: u8 = 0x00;

/// Flag bits marking a bad ping (defective or implausible return).
const FLAGS_BAD_PING: u8 = 0x0C;

/// Silence before the socket is probed with a harmless byte.
const SOCKET_TEST_TIMEOUT: Duration = Duration::from_secs(3);

/// Per-read timeout; a timeout is also the burst separator that re-aligns
/// the stream after a resync.
const READ_TIMEOUT: Duration = Duration::from_millis(100);

/// Sounder device states: it either streams depth or it doesn't.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SounderState {
    /// No depth packet seen yet.
    Unknown,
    /// Depth packets are flowing.
    Operating,
}

impl DeviceState for SounderState {
    fn is_unknown(&self) -> bool {
        matches!(self, SounderState::Unknown)
    }
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|p| p.into_inner())
}

/// SeaTalk depth sounder driver.
pub struct SeaTalkSounder {
    connector: Arc<dyn Connector>,
    probe_ttl: Duration,
    state: SharedState<SounderState>,
    listeners: ListenerSet<SounderData>,
    gate: CollectingGate,
    connected: AtomicBool,
    task: tokio::sync::Mutex<Option<JoinHandle<()>>>,
    cancel: Mutex<CancellationToken>,
}

impl SeaTalkSounder {
    fn new(connector: Arc<dyn Connector>, probe_ttl: Duration, gate: CollectingGate) -> Self {
        Self {
            connector,
            probe_ttl,
            state: SharedState::new(SounderState::Unknown),
            listeners: ListenerSet::new(),
            gate,
            connected: AtomicBool::new(false),
            task: tokio::sync::Mutex::new(None),
            cancel: Mutex::new(CancellationToken::new()),
        }
    }

    /// Register a listener for depth readings.
    pub fn add_listener(&self, listener: Arc<dyn Listener<SounderData>>) {
        self.listeners.add(listener);
    }

    /// The sounder's current believed state.
    pub fn device_state(&self) -> SounderState {
        self.state.get()
    }

    async fn teardown(&self) {
        self.connected.store(false, Ordering::SeqCst);
        lock(&self.cancel).cancel();
        if let Some(task) = self.task.lock().await.take() {
            let _ = task.await;
        }
    }
}

/// The per-connection packet reader.
async fn reader_loop(
    mut transport: Box<dyn Transport>,
    connector: Arc<dyn Connector>,
    state: SharedState<SounderState>,
    listeners: ListenerSet<SounderData>,
    gate: CollectingGate,
    cancel: CancellationToken,
) {
    let mut acc: Vec<u8> = Vec::new();
    let mut resyncing = false;
    let mut last_rx = Instant::now();
    let mut scratch = [0u8; 256];

    loop {
        if cancel.is_cancelled() {
            debug!("sounder reader cancelled");
            let _ = transport.close().await;
            return;
        }

        match transport.receive(&mut scratch, READ_TIMEOUT).await {
            Ok(n) if n > 0 => {
                last_rx = Instant::now();
                if resyncing {
                    // Out of sync: drop everything until a silence gap.
                    continue;
                }
                acc.extend_from_slice(&scratch[..n]);
                decode_packets(&mut acc, &mut resyncing, &state, &listeners, &gate);
            }
            Ok(_) => {}
            Err(Error::Timeout) => {
                if resyncing {
                    debug!("silence gap, stream re-aligned");
                    resyncing = false;
                    acc.clear();
                }
                if last_rx.elapsed() > SOCKET_TEST_TIMEOUT {
                    last_rx = Instant::now();
                    if let Err(e) = transport.send(b"\n").await {
                        warn!(error = %e, "sounder liveness probe failed, reconnecting");
                        reconnect(&mut transport, &connector).await;
                        acc.clear();
                    }
                }
            }
            Err(e) => {
                warn!(error = %e, "sounder read failed, reconnecting");
                reconnect(&mut transport, &connector).await;
                acc.clear();
            }
        }
    }
}

async fn reconnect(transport: &mut Box<dyn Transport>, connector: &Arc<dyn Connector>) {
    let _ = transport.close().await;
    match connector.open().await {
        Ok(fresh) => {
            info!("sounder link reopened");
            *transport = fresh;
        }
        Err(e) => {
            warn!(error = %e, "sounder reconnect failed");
            tokio::time::sleep(Duration::from_millis(500)).await;
        }
    }
}

/// Decode all complete packets at the front of `acc`. An unrecognized
/// packet type flips `resyncing`: the caller discards bytes until the
/// stream goes quiet.
fn decode_packets(
    acc: &mut Vec<u8>,
    resyncing: &mut bool,
    state: &SharedState<SounderState>,
    listeners: &ListenerSet<SounderData>,
    gate: &CollectingGate,
) {
    loop {
        if acc.len() < 2 {
            return;
        }
        let packet_type = acc[0];
        let payload_len = acc[1] as usize + 1;

        match packet_type {
            PACKET_DEPTH => {
                let total = 2 + payload_len;
                if acc.len() < total {
                    return;
                }
                // A depth packet, good ping or not, means the device is
                // operating.
                state.set(SounderState::Operating);

                let flags = acc[2];
                if flags & FLAGS_BAD_PING != 0 {
                    debug!(flags, "bad ping, dropping depth packet");
                } else if total >= 5 {
                    let raw = acc[3] as u16 | (acc[4] as u16) << 8;
                    let reading = SounderData::from_raw_depth(raw);
                    if reading.depth_ft != 0.0 {
                        listeners.notify(&reading, gate);
                    }
                }
                acc.drain(..total);
            }
            other => {
                debug!(packet_type = other, "unrecognized packet type, resyncing");
                acc.clear();
                *resyncing = true;
                return;
            }
        }
    }
}

#[async_trait]
impl Instrument for SeaTalkSounder {
    fn name(&self) -> &str {
        "seatalk"
    }

    /// Open the socket, start the packet reader, and wait for depth data
    /// to start flowing. The sounder accepts no commands, so there is
    /// nothing else connect can do.
    async fn connect(&self) -> Result<()> {
        if self.is_connected() {
            return Err(Error::UnsupportedState("you must call disconnect()".into()));
        }

        let transport = self.connector.open().await?;
        let cancel = CancellationToken::new();
        self.state.set(SounderState::Unknown);

        let task = tokio::spawn(reader_loop(
            transport,
            Arc::clone(&self.connector),
            self.state.clone(),
            self.listeners.clone(),
            self.gate.clone(),
            cancel.clone(),
        ));
        *self.task.lock().await = Some(task);
        *lock(&self.cancel) = cancel.clone();
        self.connected.store(true, Ordering::SeqCst);

        // Bounded wait for the first depth packet.
        let deadline = Instant::now() + self.probe_ttl;
        while self.state.get().is_unknown() {
            if cancel.is_cancelled() {
                return Ok(());
            }
            if Instant::now() >= deadline {
                error!("sounder is not sending data");
                self.teardown().await;
                return Err(Error::UnknownState);
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }

        info!("connected to sounder");
        Ok(())
    }

    async fn disconnect(&self) {
        self.teardown().await;
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    /// The sounder is always sampling.
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

/// Fluent builder for [`SeaTalkSounder`].
pub struct SeaTalkBuilder {
    connector: Option<Arc<dyn Connector>>,
    probe_ttl: Duration,
    gate: CollectingGate,
}

impl Default for SeaTalkBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl SeaTalkBuilder {
    /// Create a builder with the default 10 s wait for first data.
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

    /// How long connect() waits for the first depth packet (default: 10 s).
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
    pub fn build(self) -> Result<SeaTalkSounder> {
        let connector = self
            .connector
            .ok_or_else(|| Error::UnsupportedState("an endpoint or connector is required".into()))?;
        Ok(SeaTalkSounder::new(connector, self.probe_ttl, self.gate))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hydrolib_core::FnListener;
    use hydrolib_test_harness::{stream_transport, QueueConnector, StreamHandle};

    /// Depth packet: type 0, length 2 (payload = 3 bytes), good ping,
    /// raw depth little-endian.
    fn depth_packet(raw: u16) -> Vec<u8> {
        vec![0x00, 0x02, 0x00, (raw & 0xFF) as u8, (raw >> 8) as u8]
    }

    fn sounder() -> (SeaTalkSounder, StreamHandle, Arc<Mutex<Vec<SounderData>>>) {
        let (transport, handle) = stream_transport();
        let driver = SeaTalkBuilder::new()
            .connector(Arc::new(QueueConnector::single(transport)))
            .probe_ttl(Duration::from_secs(5))
            .build()
            .unwrap();

        let received = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&received);
        driver.add_listener(Arc::new(FnListener(move |d: &SounderData| {
            sink.lock().unwrap().push(d.clone());
        })));
        (driver, handle, received)
    }

    async fn connect_with_data(driver: &SeaTalkSounder, handle: &StreamHandle) {
        let feeder = {
            let handle = handle.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(150)).await;
                handle.feed(&depth_packet(1000)).await;
            })
        };
        driver.connect().await.unwrap();
        feeder.await.unwrap();
    }

    #[tokio::test]
    async fn connect_waits_for_depth_data() {
        let (driver, handle, received) = sounder();
        connect_with_data(&driver, &handle).await;

        assert!(driver.is_connected());
        assert_eq!(driver.device_state(), SounderState::Operating);

        let readings = received.lock().unwrap();
        assert_eq!(readings.len(), 1);
        assert!((readings[0].depth_m - 1.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn silent_sounder_fails_with_unknown_state() {
        let (transport, _handle) = stream_transport();
        let driver = SeaTalkBuilder::new()
            .connector(Arc::new(QueueConnector::single(transport)))
            .probe_ttl(Duration::from_millis(300))
            .build()
            .unwrap();

        let result = driver.connect().await;
        assert!(matches!(result, Err(Error::UnknownState)));
        assert!(!driver.is_connected());
    }

    #[tokio::test]
    async fn bad_ping_packets_are_dropped() {
        let (driver, handle, received) = sounder();
        connect_with_data(&driver, &handle).await;

        // Flags with bit 2 set: transducer reported a bad ping.
        handle.feed(&[0x00, 0x02, 0x04, 0xE8, 0x03]).await;
        tokio::time::sleep(Duration::from_millis(300)).await;

        assert_eq!(received.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn packets_split_across_reads_reassemble() {
        let (driver, handle, received) = sounder();
        connect_with_data(&driver, &handle).await;

        let packet = depth_packet(2500);
        handle.feed(&packet[..2]).await;
        handle.feed(&packet[2..]).await;
        tokio::time::sleep(Duration::from_millis(300)).await;

        let readings = received.lock().unwrap();
        assert_eq!(readings.len(), 2);
        assert!((readings[1].depth_m - 2.5).abs() < 1e-9);
    }

    #[tokio::test]
    async fn unknown_packet_type_resyncs_on_silence_gap() {
        let (driver, handle, received) = sounder();
        connect_with_data(&driver, &handle).await;

        // Garbage burst with an unknown type, then a silence gap (the
        // 100 ms read timeout), then a clean depth packet.
        handle.feed(&[0x55, 0x03, 0xDE, 0xAD, 0xBE, 0xEF]).await;
        handle.feed(&[0x01, 0x02, 0x03]).await;
        tokio::time::sleep(Duration::from_millis(400)).await;

        handle.feed(&depth_packet(3000)).await;
        tokio::time::sleep(Duration::from_millis(300)).await;

        let readings = received.lock().unwrap();
        assert_eq!(readings.len(), 2);
        assert!((readings[1].depth_m - 3.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn probe_failure_reconnects_through_connector() {
        let (transport, handle) = stream_transport();
        let (transport2, handle2) = stream_transport();
        let connector = QueueConnector::single(transport);
        connector.push(transport2);

        let driver = SeaTalkBuilder::new()
            .connector(Arc::new(connector))
            .probe_ttl(Duration::from_secs(5))
            .build()
            .unwrap();
        let received = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&received);
        driver.add_listener(Arc::new(FnListener(move |d: &SounderData| {
            sink.lock().unwrap().push(d.clone());
        })));

        connect_with_data(&driver, &handle).await;

        // Break the first link; after 3 s of silence the probe fails and
        // the reader reopens through the connector.
        handle.break_writes();
        tokio::time::sleep(Duration::from_millis(3500)).await;

        handle2.feed(&depth_packet(4000)).await;
        tokio::time::sleep(Duration::from_millis(300)).await;

        let readings = received.lock().unwrap();
        assert_eq!(readings.len(), 2);
        assert!((readings[1].depth_m - 4.0).abs() < 1e-9);
    }
}
