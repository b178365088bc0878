// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Event Hub Statistics
//!
//! Monotonic counters shared by the connection manager, publishers and the
//! consume loop. Counters are independent; no cross-field consistency is kept.

use serde::Serialize;
use std::{
    sync::atomic::{AtomicBool, AtomicU64, Ordering},
    time::{Duration, Instant},
};

/// Counter names accepted by [`EventHubStats::increment`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stat {
    Published,
    Consumed,
    Acknowledged,
    Nacked,
    Rejected,
    Errors,
}

#[derive(Debug)]
pub struct EventHubStats {
    published: AtomicU64,
    consumed: AtomicU64,
    acknowledged: AtomicU64,
    nacked: AtomicU64,
    rejected: AtomicU64,
    errors: AtomicU64,
    connected: AtomicBool,
    started_at: Instant,
}

/// Point-in-time copy of the counters.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StatsSnapshot {
    pub published: u64,
    pub consumed: u64,
    pub acknowledged: u64,
    pub nacked: u64,
    pub rejected: u64,
    pub errors: u64,
    pub connected: bool,
    pub uptime: Duration,
}

impl Default for EventHubStats {
    fn default() -> Self {
        Self {
            published: AtomicU64::new(0),
            consumed: AtomicU64::new(0),
            acknowledged: AtomicU64::new(0),
            nacked: AtomicU64::new(0),
            rejected: AtomicU64::new(0),
            errors: AtomicU64::new(0),
            connected: AtomicBool::new(false),
            started_at: Instant::now(),
        }
    }
}

impl EventHubStats {
    pub fn increment(&self, stat: Stat) {
        let counter = match stat {
            Stat::Published => &self.published,
            Stat::Consumed => &self.consumed,
            Stat::Acknowledged => &self.acknowledged,
            Stat::Nacked => &self.nacked,
            Stat::Rejected => &self.rejected,
            Stat::Errors => &self.errors,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn set_connected(&self, connected: bool) {
        self.connected.store(connected, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            published: self.published.load(Ordering::Relaxed),
            consumed: self.consumed.load(Ordering::Relaxed),
            acknowledged: self.acknowledged.load(Ordering::Relaxed),
            nacked: self.nacked.load(Ordering::Relaxed),
            rejected: self.rejected.load(Ordering::Relaxed),
            errors: self.errors.load(Ordering::Relaxed),
            connected: self.connected.load(Ordering::Relaxed),
            uptime: self.started_at.elapsed(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_are_independent() {
        let stats = EventHubStats::default();

        stats.increment(Stat::Published);
        stats.increment(Stat::Published);
        stats.increment(Stat::Nacked);
        stats.set_connected(true);

        let snapshot = stats.snapshot();
        assert_eq!(snapshot.published, 2);
        assert_eq!(snapshot.nacked, 1);
        assert_eq!(snapshot.acknowledged, 0);
        assert!(snapshot.connected);
    }
}
