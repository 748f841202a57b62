//! The expect engine -- synchronous command/response correlation for line
//! protocols.
//!
//! Every sonde and sampler command follows the same shape: wake the
//! instrument if it may be asleep, clear the line buffer, write the
//! command, then wait (bounded) until a recognizable reply token shows up
//! in the buffer. The per-instrument drivers used to duplicate this; it is
//! factored here once, parameterized by target pattern and timeout.

use std::time::{Duration, Instant};

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::line_buffer::LineBuffer;
use crate::listener::CollectingGate;
use crate::state::{DeviceState, SharedState, StateTarget};

/// Poll interval while waiting for the target line.
const EXPECT_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Poll interval while waiting for a state transition.
const STATE_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Rounds of wake probes before giving up and sending the command anyway.
const WAKE_ATTEMPTS: u32 = 10;

/// Send-and-wait correlation over a shared [`LineBuffer`].
///
/// One engine per driver instance; it holds clones of the connection's
/// write channel, line buffer, shutdown token, and the collecting gate
/// (instruments that are mid-sampling must not be woken).
pub struct ExpectEngine {
    writer: mpsc::Sender<Vec<u8>>,
    lines: LineBuffer,
    cancel: CancellationToken,
    gate: CollectingGate,
    wake_cmd: Vec<u8>,
}

impl ExpectEngine {
    /// Create an engine over an established connection.
    ///
    /// `wake_cmd` is a harmless command that always produces at least one
    /// line of reply from an awake instrument.
    pub fn new(
        writer: mpsc::Sender<Vec<u8>>,
        lines: LineBuffer,
        cancel: CancellationToken,
        gate: CollectingGate,
        wake_cmd: Vec<u8>,
    ) -> Self {
        Self {
            writer,
            lines,
            cancel,
            gate,
            wake_cmd,
        }
    }

    /// The line buffer replies accumulate in. Callers extract fixed-position
    /// fields from it after a successful [`expect`](Self::expect) and then
    /// [`clear`](LineBuffer::clear) it.
    pub fn lines(&self) -> &LineBuffer {
        &self.lines
    }

    /// Queue raw bytes on the instrument link.
    pub async fn send(&self, bytes: &[u8]) -> Result<()> {
        self.writer
            .send(bytes.to_vec())
            .await
            .map_err(|_| Error::NotConnected)
    }

    /// Send `cmd` and wait until a line equal to `target` is buffered.
    ///
    /// If the instrument is not mid-sampling it is woken first (guards
    /// against instruments that sleep between commands). The wait is a
    /// bounded sleep-poll: exceeding `ttl` fails with
    /// [`Error::Timeout`]; a shutdown observed mid-wait returns early
    /// without error.
    pub async fn expect(&self, cmd: &[u8], ttl: Duration, target: &str) -> Result<()> {
        if !self.gate.is_collecting() {
            self.wake().await;
        }

        self.lines.clear();
        self.send(cmd).await?;

        let deadline = Instant::now() + ttl;
        loop {
            if self.cancel.is_cancelled() {
                return Ok(());
            }
            if self.lines.contains(target) {
                return Ok(());
            }
            if Instant::now() >= deadline {
                return Err(Error::Timeout);
            }
            tokio::time::sleep(EXPECT_POLL_INTERVAL).await;
        }
    }

    /// Wake a potentially sleeping instrument.
    ///
    /// Sends the wake command and waits briefly for a couple of reply
    /// lines; an asleep instrument eats the first probe, so this retries.
    /// Exhausting the attempts is logged but not fatal -- the following
    /// command will fail on its own terms if the instrument is truly gone.
    pub async fn wake(&self) {
        for attempt in 0..WAKE_ATTEMPTS {
            self.lines.clear();
            if self.send(&self.wake_cmd).await.is_err() {
                return;
            }
            match self
                .lines
                .wait_for_lines(2, Duration::from_secs(1), &self.cancel)
                .await
            {
                Ok(()) => {
                    debug!(attempt, "instrument awake");
                    self.lines.clear();
                    return;
                }
                Err(_) => continue,
            }
        }
        warn!("no reply to wake probes, proceeding anyway");
    }

    /// Send `cmd` and wait for the device to reach `target`, resending up
    /// to `max_retries` times.
    ///
    /// State changes are confirmed by what the reader observes, never
    /// assumed from the write. Each attempt polls the shared state for up
    /// to `ttl`; the caller widens `ttl` for transitions whose
    /// confirmation depends on the output rate (entering operating mode,
    /// probing an unknown device).
    pub async fn change_state<S: DeviceState>(
        &self,
        cmd: &[u8],
        target: StateTarget<S>,
        max_retries: u32,
        state: &SharedState<S>,
        ttl: Duration,
    ) -> Result<()> {
        for _ in 0..max_retries {
            self.send(cmd).await?;
            let deadline = Instant::now() + ttl;
            while Instant::now() < deadline {
                if target.matches(state.get()) {
                    return Ok(());
                }
                tokio::time::sleep(STATE_POLL_INTERVAL).await;
                if self.cancel.is_cancelled() {
                    return Ok(());
                }
            }
        }
        Err(Error::Timeout)
    }
}
