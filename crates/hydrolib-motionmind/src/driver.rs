//! The MotionMind 3 driver.
//!
//! Request/response only: every exchange is a caller-built frame followed
//! by a burst-read reply on the same task. The transport lives behind an
//! async mutex, serializing commands the way the controller's half-duplex
//! bus requires.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant, SystemTime};

use async_trait::async_trait;
use tracing::{debug, error, info, warn};

use hydrolib_core::error::{Error, Result};
use hydrolib_core::{CollectingGate, Connector, Instrument, ListenerSet, Transport};

use crate::cache::{CachePlan, RegisterCache};
use crate::frame::{self, command};
use crate::registers::{register, RegisterDescriptor};

/// A batch of register values captured at one instant.
#[derive(Debug, Clone)]
pub struct RegisterSnapshot {
    /// Register name to sign-extended value.
    pub values: HashMap<String, i32>,
    /// Capture time.
    pub timestamp: SystemTime,
}

/// Timing and retry parameters, fixed at build time.
#[derive(Debug, Clone)]
pub(crate) struct Mm3Config {
    pub address: u8,
    pub max_retries: u32,
    /// Reply wait for ordinary commands.
    pub processing_time: Duration,
    /// Reply wait for WRITE_STORE, which commits to EEPROM.
    pub write_store_processing_time: Duration,
    /// Inter-character latency ending a reply burst.
    pub char_latency: Duration,
    /// Minimum spacing between sends; the controller needs settling time.
    pub send_spacing: Duration,
    pub poll_period: Duration,
}

/// MotionMind 3 motor controller driver.
pub struct MotionMind3 {
    connector: Arc<dyn Connector>,
    config: Mm3Config,
    link: tokio::sync::Mutex<Option<Box<dyn Transport>>>,
    connected: AtomicBool,
    last_send: Mutex<Option<Instant>>,
    cache: Mutex<RegisterCache>,
    listeners: ListenerSet<RegisterSnapshot>,
    gate: CollectingGate,
}

impl MotionMind3 {
    pub(crate) fn new(
        connector: Arc<dyn Connector>,
        config: Mm3Config,
        gate: CollectingGate,
    ) -> Self {
        let poll_period = config.poll_period;
        Self {
            connector,
            config,
            link: tokio::sync::Mutex::new(None),
            connected: AtomicBool::new(false),
            last_send: Mutex::new(None),
            cache: Mutex::new(RegisterCache::new(poll_period)),
            listeners: ListenerSet::new(),
            gate,
        }
    }

    /// Register a listener for register snapshots.
    pub fn add_listener(&self, listener: Arc<dyn hydrolib_core::Listener<RegisterSnapshot>>) {
        self.listeners.add(listener);
    }

    fn lock_cache(&self) -> MutexGuard<'_, RegisterCache> {
        self.cache.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn lock_last_send(&self) -> MutexGuard<'_, Option<Instant>> {
        self.last_send.lock().unwrap_or_else(|p| p.into_inner())
    }

    /// Move at a constant velocity (signed counts per PID period).
    pub async fn move_at(&self, velocity: i32) -> Result<()> {
        self.ack_command(command::MOVE_AT, &frame::encode_value(velocity, 2))
            .await
    }

    /// Change velocity while a position move is in progress.
    pub async fn change_speed(&self, velocity: i32) -> Result<()> {
        self.ack_command(command::CHANGE_SPEED, &frame::encode_value(velocity, 2))
            .await
    }

    /// Move to an absolute encoder position.
    pub async fn move_absolute(&self, position: i32) -> Result<()> {
        self.ack_command(command::MOVE_ABSOLUTE, &frame::encode_value(position, 4))
            .await
    }

    /// Move relative to the current encoder position.
    pub async fn move_relative(&self, offset: i32) -> Result<()> {
        self.ack_command(command::MOVE_RELATIVE, &frame::encode_value(offset, 4))
            .await
    }

    /// Set the PID terms, in order. Stops at the first failed write.
    pub async fn set_pid_terms(&self, p: i32, i: i32, d: i32) -> Result<()> {
        self.write("p_term", p).await?;
        self.write("i_term", i).await?;
        self.write("d_term", d).await
    }

    /// Write a register value.
    pub async fn write(&self, name: &str, value: i32) -> Result<()> {
        let desc = lookup(name)?;
        let mut payload = vec![desc.position];
        payload.extend(frame::encode_value(value, desc.width));
        let reply = self
            .exchange(command::WRITE, &payload, self.config.processing_time)
            .await?;
        expect_ack(&reply)
    }

    /// Write a register value and store it to EEPROM.
    pub async fn write_store(&self, name: &str, value: i32) -> Result<()> {
        let desc = lookup(name)?;
        let mut payload = vec![desc.position];
        payload.extend(frame::encode_value(value, desc.width));
        let reply = self
            .exchange(
                command::WRITE_STORE,
                &payload,
                self.config.write_store_processing_time,
            )
            .await?;
        expect_ack(&reply)
    }

    /// Read one register, bypassing the cache.
    pub async fn read_register(&self, name: &str) -> Result<i32> {
        let desc = lookup(name)?;
        let reply = self
            .exchange(
                command::READ_REGISTER,
                &[desc.position],
                self.config.processing_time,
            )
            .await?;
        // Reply layout: leading byte, value, checksum.
        if reply.len() < 1 + desc.width + 1 {
            return Err(Error::InvalidInput(format!(
                "short reply reading {}: {} bytes",
                name,
                reply.len()
            )));
        }
        Ok(frame::decode_value(&reply[1..1 + desc.width]))
    }

    /// Read a batch of registers, honoring the cache policy.
    ///
    /// Values younger than the poll period are served without a round
    /// trip. When any requested register is stale, one batched READ
    /// refreshes every register the cache currently tracks (amortizing
    /// the exchange across all pollers); only the requested names are
    /// returned.
    pub async fn read(&self, names: &[&str]) -> Result<RegisterSnapshot> {
        let mut resolved = Vec::with_capacity(names.len());
        for name in names {
            resolved.push(lookup(name)?.name);
        }

        let plan = self.lock_cache().plan(&resolved, Instant::now());
        let values = match plan {
            CachePlan::Fresh(values) => values,
            CachePlan::Refresh(tracked) => self.refresh(&tracked, &resolved).await?,
        };

        let snapshot = RegisterSnapshot {
            values,
            timestamp: SystemTime::now(),
        };
        self.listeners.notify(&snapshot, &self.gate);
        Ok(snapshot)
    }

    /// Issue the batched READ for `tracked` registers and refresh the
    /// cache; returns the values for `requested` names only.
    async fn refresh(
        &self,
        tracked: &[&'static str],
        requested: &[&'static str],
    ) -> Result<HashMap<String, i32>> {
        let mut mask: u32 = 0;
        for name in tracked {
            if let Some(desc) = register(name) {
                mask |= 1 << desc.position;
            }
        }
        let reply = self
            .exchange(
                command::READ,
                &frame::encode_value(mask as i32, 4),
                self.config.processing_time,
            )
            .await?;

        // Values are packed in position order after the leading byte.
        let now = Instant::now();
        let mut values = HashMap::new();
        let mut index = 1;
        let mut cache = self.lock_cache();
        for name in tracked {
            let Some(desc) = register(name) else {
                continue;
            };
            if index + desc.width + 1 > reply.len() {
                return Err(Error::InvalidInput(format!(
                    "batched read reply too short at {}",
                    name
                )));
            }
            let value = frame::decode_value(&reply[index..index + desc.width]);
            index += desc.width;

            let wanted = requested.contains(name);
            cache.store(name, value, now, wanted);
            if wanted {
                values.insert((*name).to_string(), value);
            }
        }
        cache.complete_refresh(now);
        Ok(values)
    }

    /// Reset the controller.
    pub async fn reset_device(&self) -> Result<()> {
        let reply = self
            .exchange(command::RESET, &[], self.config.processing_time)
            .await?;
        expect_ack(&reply)
    }

    /// Restore factory defaults from EEPROM.
    pub async fn restore(&self) -> Result<()> {
        let reply = self
            .exchange(command::RESTORE, &[], self.config.processing_time)
            .await?;
        expect_ack(&reply)
    }

    async fn ack_command(&self, cmd: u8, payload: &[u8]) -> Result<()> {
        let reply = self
            .exchange(cmd, payload, self.config.processing_time)
            .await?;
        expect_ack(&reply)
    }

    async fn exchange(&self, cmd: u8, payload: &[u8], processing_time: Duration) -> Result<Vec<u8>> {
        let bytes = frame::build_frame(cmd, self.config.address, payload);
        self.send_frame(&bytes, self.config.max_retries, processing_time)
            .await
    }

    /// Send a frame and collect the reply burst, with bounded retries.
    ///
    /// Exactly `max_retries` send attempts are made; exhausting them fails
    /// with [`Error::Timeout`]. A reply is accepted when its checksum
    /// verifies and its leading byte is the ACK or the echoed device
    /// address.
    pub async fn send_frame(
        &self,
        bytes: &[u8],
        max_retries: u32,
        processing_time: Duration,
    ) -> Result<Vec<u8>> {
        if !self.is_connected() {
            return Err(Error::UnsupportedState(
                "must be connected to send frames".into(),
            ));
        }

        let mut link = self.link.lock().await;
        let transport = link.as_mut().ok_or(Error::NotConnected)?;

        // The controller needs settling time between commands.
        let spacing_wait = self
            .lock_last_send()
            .map(|t| (t + self.config.send_spacing).saturating_duration_since(Instant::now()))
            .unwrap_or(Duration::ZERO);
        if !spacing_wait.is_zero() {
            tokio::time::sleep(spacing_wait).await;
        }

        let mut scratch = [0u8; 256];
        for attempt in 0..max_retries {
            if attempt > 0 {
                debug!(attempt, sent = ?bytes, "retrying frame");
            }

            // Flush stale input: a late retransmission of the previous
            // reply must not be taken for this command's reply.
            loop {
                match transport.receive(&mut scratch, Duration::from_millis(1)).await {
                    Ok(n) if n > 0 => {
                        debug!(flushed = ?&scratch[..n], "flushing stale input");
                    }
                    Ok(_) => break,
                    Err(Error::Timeout) => break,
                    Err(e) => return Err(e),
                }
            }

            transport.send(bytes).await?;

            // Composite read: wait up to processing_time for the first
            // byte, then keep reading until the burst goes quiet.
            let mut reply = Vec::new();
            match transport.receive(&mut scratch, processing_time).await {
                Ok(n) => reply.extend_from_slice(&scratch[..n]),
                Err(Error::Timeout) => continue,
                Err(e) => return Err(e),
            }
            loop {
                match transport
                    .receive(&mut scratch, self.config.char_latency)
                    .await
                {
                    Ok(n) => reply.extend_from_slice(&scratch[..n]),
                    Err(Error::Timeout) => break,
                    Err(e) => return Err(e),
                }
            }

            if !frame::verify(&reply) {
                warn!(sent = ?bytes, received = ?reply, "reply had bad checksum");
                continue;
            }
            if reply[0] != frame::ACK && reply[0] != self.config.address {
                warn!(leading = reply[0], "reply had unexpected first byte");
                continue;
            }

            *self.lock_last_send() = Some(Instant::now());
            return Ok(reply);
        }

        Err(Error::Timeout)
    }

    async fn open_link(&self) -> Result<()> {
        let transport = self.connector.open().await?;
        *self.link.lock().await = Some(transport);
        self.connected.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn close_link(&self) {
        self.connected.store(false, Ordering::SeqCst);
        if let Some(mut transport) = self.link.lock().await.take() {
            let _ = transport.close().await;
        }
    }
}

fn lookup(name: &str) -> Result<&'static RegisterDescriptor> {
    register(name).ok_or_else(|| Error::InvalidInput(format!("unknown register: {name}")))
}

fn expect_ack(reply: &[u8]) -> Result<()> {
    if reply.first() == Some(&frame::ACK) {
        Ok(())
    } else {
        Err(Error::InvalidInput(format!(
            "command not acknowledged: {:02X?}",
            reply
        )))
    }
}

#[async_trait]
impl Instrument for MotionMind3 {
    fn name(&self) -> &str {
        "mm3"
    }

    /// Open the socket and probe the controller by reading a register;
    /// a controller that cannot answer anything leaves us with
    /// [`Error::UnknownState`].
    async fn connect(&self) -> Result<()> {
        if self.is_connected() {
            return Err(Error::UnsupportedState("you must call disconnect()".into()));
        }
        self.open_link().await?;

        match self.read_register("function").await {
            Ok(_) => {
                info!("motor controller connected");
                Ok(())
            }
            Err(e) => {
                error!(error = %e, "motor controller probe failed");
                self.close_link().await;
                Err(Error::UnknownState)
            }
        }
    }

    /// Best-effort stop the motor, then close the socket. Always safe.
    async fn disconnect(&self) {
        if self.is_connected() {
            if let Err(e) = self.move_at(0).await {
                warn!(error = %e, "failed to zero velocity on disconnect");
            }
        }
        self.close_link().await;
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    /// The controller is request/response; there is no streaming mode to
    /// arm.
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

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builder::Mm3Builder;
    use hydrolib_test_harness::{MockTransport, QueueConnector};

    /// Probe exchange used by connect(): read the `function` register.
    fn probe_exchange(mock: &mut MockTransport) {
        // [READ_REGISTER, addr, position=3, ck]
        let request = frame::build_frame(command::READ_REGISTER, 1, &[3]);
        // [addr, value lo, value hi, ck]
        let reply = vec![0x01, 0x0F, 0x00, 0x10];
        mock.expect(&request, &reply);
    }

    fn driver_with(mock: MockTransport) -> MotionMind3 {
        Mm3Builder::new()
            .connector(Arc::new(QueueConnector::single(mock)))
            .send_spacing(Duration::ZERO)
            .build()
            .unwrap()
    }

    #[tokio::test]
    async fn connect_probes_function_register() {
        let mut mock = MockTransport::new();
        probe_exchange(&mut mock);
        let motor = driver_with(mock);

        motor.connect().await.unwrap();
        assert!(motor.is_connected());
    }

    #[tokio::test]
    async fn connect_twice_is_a_sequencing_error() {
        let mut mock = MockTransport::new();
        probe_exchange(&mut mock);
        let motor = driver_with(mock);

        motor.connect().await.unwrap();
        let result = motor.connect().await;
        assert!(matches!(result, Err(Error::UnsupportedState(_))));
    }

    #[tokio::test]
    async fn failed_probe_surfaces_unknown_state() {
        // No expectations: the probe send fails, connect() must close up
        // and report an undeterminable state.
        let mock = MockTransport::new();
        let motor = driver_with(mock);

        let result = motor.connect().await;
        assert!(matches!(result, Err(Error::UnknownState)));
        assert!(!motor.is_connected());
    }

    #[tokio::test]
    async fn write_p_term_sends_documented_frame() {
        let mut mock = MockTransport::new();
        probe_exchange(&mut mock);
        // write("p_term", 1000): [WRITE, addr, position=4, 0xE8, 0x03, ck]
        let request = vec![0x18, 0x01, 0x04, 0xE8, 0x03, 0x08];
        let ack = vec![frame::ACK, 0x06];
        mock.expect(&request, &ack);
        let sent = mock.sent_log();
        let motor = driver_with(mock);

        motor.connect().await.unwrap();
        motor.write("p_term", 1000).await.unwrap();

        let log = sent.lock().unwrap();
        assert_eq!(log[1], request);
        assert_eq!(log[1].len(), 6);
    }

    #[tokio::test]
    async fn move_at_encodes_velocity_little_endian() {
        let mut mock = MockTransport::new();
        probe_exchange(&mut mock);
        let request = frame::build_frame(command::MOVE_AT, 1, &[0xFA, 0x00]);
        mock.expect(&request, &[frame::ACK, 0x06]);
        let motor = driver_with(mock);

        motor.connect().await.unwrap();
        motor.move_at(250).await.unwrap();
    }

    #[tokio::test]
    async fn corrupt_replies_exhaust_exactly_max_retries() {
        let mut mock = MockTransport::lenient();
        // Probe succeeds.
        mock.reply_with(&[0x01, 0x0F, 0x00, 0x10]);
        // Then every attempt gets a checksum-corrupt reply.
        for _ in 0..3 {
            mock.reply_with(&[0x06, 0xFF]);
        }
        let sent = mock.sent_log();
        let motor = driver_with(mock);

        motor.connect().await.unwrap();
        let result = motor.read_register("velocity").await;
        assert!(matches!(result, Err(Error::Timeout)));

        // One probe send plus exactly three attempts, never more.
        assert_eq!(sent.lock().unwrap().len(), 1 + 3);
    }

    #[tokio::test]
    async fn read_register_decodes_signed_value() {
        let mut mock = MockTransport::new();
        probe_exchange(&mut mock);
        // velocity is register 14, width 2; reply value -2 = 0xFFFE.
        let request = frame::build_frame(command::READ_REGISTER, 1, &[14]);
        let reply = vec![0x01, 0xFE, 0xFF, frame::checksum(&[0x01, 0xFE, 0xFF])];
        mock.expect(&request, &reply);
        let motor = driver_with(mock);

        motor.connect().await.unwrap();
        assert_eq!(motor.read_register("velocity").await.unwrap(), -2);
    }

    #[tokio::test]
    async fn batched_read_hits_cache_within_poll_period() {
        let mut mock = MockTransport::new();
        probe_exchange(&mut mock);
        // One READ for the velocity bitmask (bit 14), and only one.
        let mask = frame::encode_value(1 << 14, 4);
        let request = frame::build_frame(command::READ, 1, &mask);
        let reply = vec![0x01, 0x64, 0x00, frame::checksum(&[0x01, 0x64, 0x00])];
        mock.expect(&request, &reply);
        let motor = driver_with(mock);

        motor.connect().await.unwrap();
        let first = motor.read(&["velocity"]).await.unwrap();
        assert_eq!(first.values["velocity"], 100);

        // Second read inside the poll period: no expectations remain, so
        // any transport exchange would error. The cache must answer.
        let second = motor.read(&["velocity"]).await.unwrap();
        assert_eq!(second.values["velocity"], 100);
    }

    #[tokio::test]
    async fn batched_read_unpacks_position_order() {
        let mut mock = MockTransport::new();
        probe_exchange(&mut mock);
        // position (0, width 4) and velocity (14, width 2) together.
        let mask = frame::encode_value((1 << 0) | (1 << 14), 4);
        let request = frame::build_frame(command::READ, 1, &mask);
        let mut body = vec![0x01];
        body.extend(frame::encode_value(-100, 4));
        body.extend(frame::encode_value(42, 2));
        let mut reply = body.clone();
        reply.push(frame::checksum(&body));
        mock.expect(&request, &reply);
        let motor = driver_with(mock);

        motor.connect().await.unwrap();
        let snapshot = motor.read(&["velocity", "position"]).await.unwrap();
        assert_eq!(snapshot.values["position"], -100);
        assert_eq!(snapshot.values["velocity"], 42);
    }

    #[tokio::test]
    async fn unknown_register_is_invalid_input() {
        let mut mock = MockTransport::new();
        probe_exchange(&mut mock);
        let motor = driver_with(mock);
        motor.connect().await.unwrap();

        let result = motor.read(&["flux_capacitor"]).await;
        assert!(matches!(result, Err(Error::InvalidInput(_))));
    }

    #[tokio::test]
    async fn disconnect_zeroes_velocity_first() {
        let mut mock = MockTransport::new();
        probe_exchange(&mut mock);
        let stop = frame::build_frame(command::MOVE_AT, 1, &[0x00, 0x00]);
        mock.expect(&stop, &[frame::ACK, 0x06]);
        let sent = mock.sent_log();
        let motor = driver_with(mock);

        motor.connect().await.unwrap();
        motor.disconnect().await;

        assert!(!motor.is_connected());
        assert_eq!(sent.lock().unwrap().last().unwrap(), &stop);
    }

    #[tokio::test]
    async fn send_frame_requires_connection() {
        let mock = MockTransport::new();
        let motor = driver_with(mock);
        let result = motor
            .send_frame(&[0x17, 0x01, 0x00, 0x00, 0x18], 3, Duration::from_millis(10))
            .await;
        assert!(matches!(result, Err(Error::UnsupportedState(_))));
    }

    #[tokio::test]
    async fn soft_reset_reconnects_through_connector() {
        let mut first = MockTransport::new();
        probe_exchange(&mut first);
        // disconnect() inside soft_reset zeroes the velocity.
        let stop = frame::build_frame(command::MOVE_AT, 1, &[0x00, 0x00]);
        first.expect(&stop, &[frame::ACK, 0x06]);

        let mut second = MockTransport::new();
        probe_exchange(&mut second);

        let connector = QueueConnector::single(first);
        connector.push(second);
        let motor = Mm3Builder::new()
            .connector(Arc::new(connector))
            .send_spacing(Duration::ZERO)
            .build()
            .unwrap();

        motor.connect().await.unwrap();
        motor.soft_reset().await.unwrap();
        assert!(motor.is_connected());
    }
}
