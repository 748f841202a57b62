//! Register value cache.
//!
//! The broker polls a handful of registers every poll period; issuing one
//! transport round trip per register per caller would swamp the link. The
//! cache amortizes: a value younger than the poll period is served
//! directly, and when any tracked register goes stale a single batched
//! read refreshes *all* of them together. Entries nobody has asked about
//! for ten poll periods are dropped from the tracked set.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use crate::registers::register;

/// How many poll periods an entry may go unaccessed before eviction.
const EVICT_FACTOR: u32 = 10;

#[derive(Debug, Clone, Copy)]
struct Entry {
    value: i32,
    last_access: Instant,
}

/// What the caller must do to satisfy a batched read request.
#[derive(Debug)]
pub enum CachePlan {
    /// Every requested register is fresh; values attached.
    Fresh(HashMap<String, i32>),
    /// A transport read is required. The attached list is *every* tracked
    /// register, sorted by position -- the order values appear in the
    /// reply.
    Refresh(Vec<&'static str>),
}

/// Cache of last-read register values with access-time bookkeeping.
///
/// Methods take `now` explicitly so tests control the clock.
#[derive(Debug)]
pub struct RegisterCache {
    poll_period: Duration,
    last_read: Option<Instant>,
    entries: HashMap<&'static str, Entry>,
}

impl RegisterCache {
    /// Cache with the given poll period.
    pub fn new(poll_period: Duration) -> Self {
        Self {
            poll_period,
            last_read: None,
            entries: HashMap::new(),
        }
    }

    /// The configured poll period.
    pub fn poll_period(&self) -> Duration {
        self.poll_period
    }

    /// Registers currently tracked (in no particular order).
    pub fn tracked(&self) -> Vec<&'static str> {
        self.entries.keys().copied().collect()
    }

    /// Decide whether `requested` can be served from cache.
    ///
    /// Evicts idle entries, starts tracking any register not yet tracked,
    /// and stamps access times on a cache hit.
    pub fn plan(&mut self, requested: &[&'static str], now: Instant) -> CachePlan {
        self.evict_idle(now);

        let fresh = self
            .last_read
            .map(|t| t + self.poll_period > now)
            .unwrap_or(false);

        let mut need_read = false;
        for name in requested {
            if self.entries.contains_key(name) {
                if !fresh {
                    need_read = true;
                }
            } else {
                self.entries.insert(
                    name,
                    Entry {
                        value: 0,
                        last_access: now,
                    },
                );
                need_read = true;
            }
        }

        if need_read {
            let mut tracked: Vec<&'static str> = self.entries.keys().copied().collect();
            tracked.sort_by_key(|n| register(n).map(|r| r.position).unwrap_or(u8::MAX));
            CachePlan::Refresh(tracked)
        } else {
            let mut values = HashMap::new();
            for name in requested {
                if let Some(entry) = self.entries.get_mut(name) {
                    entry.last_access = now;
                    values.insert((*name).to_string(), entry.value);
                }
            }
            CachePlan::Fresh(values)
        }
    }

    /// Store one value from a refresh. `accessed` marks registers the
    /// current caller actually asked for; only those get their access time
    /// stamped, so bystander registers still age toward eviction.
    pub fn store(&mut self, name: &'static str, value: i32, now: Instant, accessed: bool) {
        let entry = self.entries.entry(name).or_insert(Entry {
            value,
            last_access: now,
        });
        entry.value = value;
        if accessed {
            entry.last_access = now;
        }
    }

    /// Mark a refresh complete; all tracked values are now poll-period
    /// fresh.
    pub fn complete_refresh(&mut self, now: Instant) {
        self.last_read = Some(now);
    }

    fn evict_idle(&mut self, now: Instant) {
        let horizon = self.poll_period * EVICT_FACTOR;
        self.entries
            .retain(|_, entry| now.duration_since(entry.last_access) <= horizon);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const POLL: Duration = Duration::from_millis(200);

    fn refreshed(cache: &mut RegisterCache, names: &[&'static str], now: Instant) {
        for (i, name) in names.iter().enumerate() {
            cache.store(name, i as i32 + 1, now, true);
        }
        cache.complete_refresh(now);
    }

    #[test]
    fn first_request_requires_read() {
        let mut cache = RegisterCache::new(POLL);
        let t0 = Instant::now();
        match cache.plan(&["velocity"], t0) {
            CachePlan::Refresh(tracked) => assert_eq!(tracked, vec!["velocity"]),
            other => panic!("expected Refresh, got {other:?}"),
        }
    }

    #[test]
    fn value_within_poll_period_is_served_from_cache() {
        let mut cache = RegisterCache::new(POLL);
        let t0 = Instant::now();
        let _ = cache.plan(&["velocity"], t0);
        cache.store("velocity", 42, t0, true);
        cache.complete_refresh(t0);

        // One millisecond before the poll period elapses: no transport read.
        let t1 = t0 + POLL - Duration::from_millis(1);
        match cache.plan(&["velocity"], t1) {
            CachePlan::Fresh(values) => assert_eq!(values["velocity"], 42),
            other => panic!("expected Fresh, got {other:?}"),
        }
    }

    #[test]
    fn value_past_poll_period_forces_refresh() {
        let mut cache = RegisterCache::new(POLL);
        let t0 = Instant::now();
        let _ = cache.plan(&["velocity"], t0);
        refreshed(&mut cache, &["velocity"], t0);

        let t1 = t0 + POLL + Duration::from_millis(1);
        assert!(matches!(
            cache.plan(&["velocity"], t1),
            CachePlan::Refresh(_)
        ));
    }

    #[test]
    fn idle_entry_is_evicted_after_ten_poll_periods() {
        let mut cache = RegisterCache::new(POLL);
        let t0 = Instant::now();
        let _ = cache.plan(&["velocity"], t0);
        refreshed(&mut cache, &["velocity"], t0);

        // Untouched for just over 10x the poll period.
        let t1 = t0 + POLL * 10 + Duration::from_millis(1);
        let _ = cache.plan(&["amps"], t1);
        assert!(!cache.tracked().contains(&"velocity"));

        // A later request for it must go back to the transport.
        assert!(matches!(
            cache.plan(&["velocity"], t1),
            CachePlan::Refresh(_)
        ));
    }

    #[test]
    fn access_keeps_entry_alive() {
        let mut cache = RegisterCache::new(POLL);
        let t0 = Instant::now();
        let _ = cache.plan(&["velocity"], t0);
        refreshed(&mut cache, &["velocity"], t0);

        // Touch it at half the eviction horizon...
        let t1 = t0 + POLL * 5;
        let _ = cache.plan(&["velocity"], t1);
        // ...and it survives past the original horizon.
        let t2 = t0 + POLL * 12;
        let _ = cache.plan(&["amps"], t2);
        assert!(cache.tracked().contains(&"velocity"));
    }

    #[test]
    fn refresh_covers_all_tracked_registers_in_position_order() {
        let mut cache = RegisterCache::new(POLL);
        let t0 = Instant::now();
        let _ = cache.plan(&["velocity"], t0);
        refreshed(&mut cache, &["velocity"], t0);

        // A second caller asks for different registers; the refresh list
        // includes the first caller's register too, position-sorted.
        let t1 = t0 + POLL * 2;
        match cache.plan(&["amps", "position"], t1) {
            CachePlan::Refresh(tracked) => {
                assert_eq!(tracked, vec!["position", "velocity", "amps"]);
            }
            other => panic!("expected Refresh, got {other:?}"),
        }
    }

    #[test]
    fn bystander_values_are_stored_but_not_stamped() {
        let mut cache = RegisterCache::new(POLL);
        let t0 = Instant::now();
        let _ = cache.plan(&["velocity", "amps"], t0);
        cache.store("velocity", 10, t0, true);
        cache.store("amps", 3, t0, false);
        cache.complete_refresh(t0);

        // Only velocity keeps being requested; amps ages out.
        let mut t = t0;
        for _ in 0..12 {
            t += POLL * 2;
            if let CachePlan::Refresh(_) = cache.plan(&["velocity"], t) {
                cache.store("velocity", 10, t, true);
                cache.complete_refresh(t);
            }
        }
        assert!(cache.tracked().contains(&"velocity"));
        assert!(!cache.tracked().contains(&"amps"));
    }
}
