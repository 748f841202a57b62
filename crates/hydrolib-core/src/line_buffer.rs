//! Thread-safe buffer of decoded text lines.
//!
//! The reader task appends every line it decodes; command methods correlate
//! replies by waiting for lines to appear, inspecting them, and clearing
//! the buffer once consumed. The buffer is the unit of expect-style
//! correlation: a command clears it, sends, and then watches it fill.

use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use tokio_util::sync::CancellationToken;

use crate::error::{Error, Result};

/// How often waiting callers re-check the buffer.
const WAIT_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Clonable handle to an append-only list of decoded lines.
///
/// All clones share the same underlying buffer. Lines accumulate from the
/// moment of the last [`clear()`](LineBuffer::clear).
#[derive(Clone, Default)]
pub struct LineBuffer {
    inner: Arc<Mutex<Vec<String>>>,
}

impl LineBuffer {
    /// Create a new, empty buffer.
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Vec<String>> {
        // A poisoned lock still holds valid line data.
        self.inner.lock().unwrap_or_else(|p| p.into_inner())
    }

    /// Append a decoded line.
    pub fn push(&self, line: &str) {
        self.lock().push(line.to_string());
    }

    /// Discard all buffered lines.
    pub fn clear(&self) {
        self.lock().clear();
    }

    /// Number of lines currently buffered.
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    /// Whether the buffer is empty.
    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Whether any buffered line is exactly equal to `target`.
    pub fn contains(&self, target: &str) -> bool {
        self.lock().iter().any(|l| l == target)
    }

    /// Copy of the line at `index`, if present.
    pub fn line(&self, index: usize) -> Option<String> {
        self.lock().get(index).cloned()
    }

    /// Snapshot of all buffered lines.
    pub fn lines(&self) -> Vec<String> {
        self.lock().clone()
    }

    /// Wait until at least `count` lines are buffered.
    ///
    /// Bounded sleep-poll: fails with [`Error::Timeout`] once `ttl` elapses.
    /// A cancellation observed mid-wait returns `Ok(())` without error so
    /// that `disconnect()` gets a bounded-time response; callers re-check
    /// the token before trusting the buffer contents.
    pub async fn wait_for_lines(
        &self,
        count: usize,
        ttl: Duration,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let deadline = Instant::now() + ttl;
        loop {
            tokio::time::sleep(WAIT_POLL_INTERVAL).await;
            if self.len() >= count {
                return Ok(());
            }
            if cancel.is_cancelled() {
                return Ok(());
            }
            if Instant::now() >= deadline {
                return Err(Error::Timeout);
            }
        }
    }
}

impl std::fmt::Debug for LineBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LineBuffer")
            .field("len", &self.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn push_and_inspect() {
        let buf = LineBuffer::new();
        assert!(buf.is_empty());

        buf.push("sn");
        buf.push("0167BF55");
        buf.push("#");

        assert_eq!(buf.len(), 3);
        assert!(buf.contains("#"));
        assert!(!buf.contains("##"));
        assert_eq!(buf.line(1).as_deref(), Some("0167BF55"));
        assert_eq!(buf.lines(), vec!["sn", "0167BF55", "#"]);
    }

    #[test]
    fn clear_resets() {
        let buf = LineBuffer::new();
        buf.push("a");
        buf.clear();
        assert!(buf.is_empty());
        assert_eq!(buf.line(0), None);
    }

    #[test]
    fn clones_share_storage() {
        let buf = LineBuffer::new();
        let other = buf.clone();
        buf.push("hello");
        assert!(other.contains("hello"));
    }

    #[tokio::test]
    async fn wait_returns_when_lines_arrive() {
        let buf = LineBuffer::new();
        let writer = buf.clone();
        let cancel = CancellationToken::new();

        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            writer.push("one");
            writer.push("two");
        });

        buf.wait_for_lines(2, Duration::from_secs(2), &cancel)
            .await
            .unwrap();
        assert_eq!(buf.len(), 2);
    }

    #[tokio::test]
    async fn wait_times_out() {
        let buf = LineBuffer::new();
        let cancel = CancellationToken::new();

        let result = buf
            .wait_for_lines(1, Duration::from_millis(200), &cancel)
            .await;
        assert!(matches!(result, Err(Error::Timeout)));
    }

    #[tokio::test]
    async fn wait_aborts_gracefully_on_cancel() {
        let buf = LineBuffer::new();
        let cancel = CancellationToken::new();
        let token = cancel.clone();

        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            token.cancel();
        });

        // Shutdown mid-wait is not an error.
        buf.wait_for_lines(5, Duration::from_secs(30), &cancel)
            .await
            .unwrap();
        assert!(cancel.is_cancelled());
    }
}
