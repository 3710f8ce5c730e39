//! Per-address connection rate limiting.
//!
//! Each source address gets its own sliding window of recent admitted
//! attempts. Windows are locked individually so clients from different
//! addresses never contend on the same lock during a check; the outer
//! map is only write-locked to insert a new address or to sweep.

use std::collections::{HashMap, VecDeque};
use std::net::{IpAddr, SocketAddr};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};
use std::time::{Duration, Instant};
use tracing::{debug, trace};

/// Identity used for rate limiting: the peer address without its port.
pub type SourceKey = IpAddr;

/// Derive the rate limiting key for a peer.
///
/// IPv4-mapped IPv6 addresses are folded into plain IPv4 so a dual-stack
/// listener counts a client once.
pub fn source_key(peer: &SocketAddr) -> SourceKey {
    peer.ip().to_canonical()
}

/// Recent attempts from one source
#[derive(Debug, Default)]
struct Window {
    timestamps: VecDeque<Instant>,
    /// Set by the sweeper once the record is unlinked from the map
    evicted: bool,
}

impl Window {
    /// Drop attempts older than `start`; an attempt exactly at `start` stays.
    fn compact(&mut self, start: Option<Instant>) {
        if let Some(start) = start {
            self.timestamps.retain(|t| *t >= start);
        }
    }

    fn is_stale(&self, cutoff: Instant) -> bool {
        self.timestamps.iter().all(|t| *t < cutoff)
    }
}

/// Sliding-window limiter keyed by source address
pub struct RateLimiter {
    records: RwLock<HashMap<SourceKey, Arc<Mutex<Window>>>>,
    window: Duration,
    max: usize,
}

impl RateLimiter {
    /// Allow at most `max` attempts per source within any `window`.
    pub fn new(window: Duration, max: usize) -> Self {
        Self {
            records: RwLock::new(HashMap::new()),
            window,
            max,
        }
    }

    /// Record an attempt from `key` if it is within the limit.
    pub fn check(&self, key: SourceKey) -> bool {
        self.check_at(key, Instant::now())
    }

    /// [`check`](Self::check) with an explicit clock reading.
    pub fn check_at(&self, key: SourceKey, now: Instant) -> bool {
        loop {
            let record = self.record(key);
            let mut window = lock(&record);

            // Lost a race with the sweeper; this record is no longer reachable
            if window.evicted {
                continue;
            }

            window.compact(now.checked_sub(self.window));

            if window.timestamps.len() >= self.max {
                trace!(%key, attempts = window.timestamps.len(), "Rate limit exceeded");
                return false;
            }

            window.timestamps.push_back(now);
            return true;
        }
    }

    /// Find or lazily create the record for `key`
    fn record(&self, key: SourceKey) -> Arc<Mutex<Window>> {
        {
            let records = self.records.read().unwrap_or_else(PoisonError::into_inner);
            if let Some(record) = records.get(&key) {
                return Arc::clone(record);
            }
        }

        let mut records = self.records.write().unwrap_or_else(PoisonError::into_inner);
        Arc::clone(records.entry(key).or_default())
    }

    /// Evict sources whose every attempt is older than twice the window.
    /// Returns the number of records removed.
    pub fn sweep(&self) -> usize {
        self.sweep_at(Instant::now())
    }

    /// [`sweep`](Self::sweep) with an explicit clock reading.
    pub fn sweep_at(&self, now: Instant) -> usize {
        let cutoff = self
            .window
            .checked_mul(2)
            .and_then(|max_age| now.checked_sub(max_age));
        let Some(cutoff) = cutoff else {
            // Nothing can be that old yet
            return 0;
        };

        let mut records = self.records.write().unwrap_or_else(PoisonError::into_inner);
        let before = records.len();

        records.retain(|_, record| {
            let mut window = lock(record);
            if window.is_stale(cutoff) {
                window.evicted = true;
                false
            } else {
                true
            }
        });

        let removed = before - records.len();
        if removed > 0 {
            debug!(removed, remaining = records.len(), "Swept stale rate limit records");
        }
        removed
    }

    /// Number of sources currently tracked
    pub fn len(&self) -> usize {
        self.records
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    #[cfg(test)]
    fn contains(&self, key: SourceKey) -> bool {
        self.records
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(&key)
    }
}

fn lock(record: &Mutex<Window>) -> MutexGuard<'_, Window> {
    record.lock().unwrap_or_else(PoisonError::into_inner)
}
