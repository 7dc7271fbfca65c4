//! Best-effort duplicate-delivery filter.
//!
//! Webhook providers redeliver on timeouts, so recently seen delivery ids are
//! remembered for a bounded window. Two limits apply:
//!
//! - **capacity**: adding past capacity evicts the oldest id first;
//! - **ttl**: lookups first expire ids older than the TTL.
//!
//! Time comes from the tokio clock so paused-time tests can advance it.

use std::collections::{HashMap, VecDeque};
use std::time::Duration;

use serde::Serialize;
use tokio::time::Instant;

// =============================================================================
// DeliveryFilter
// =============================================================================

pub struct DeliveryFilter {
    entries: VecDeque<(String, Instant)>,
    // id -> occurrences in `entries`
    counts: HashMap<String, usize>,
    capacity: usize,
    ttl: Duration,
    evicted: u64,
}

/// Point-in-time view of the filter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct DeliveryFilterStats {
    pub len: usize,
    pub capacity: usize,
    pub ttl_secs: u64,
    pub evicted: u64,
}

impl DeliveryFilter {
    /// A zero capacity is raised to 1.
    #[must_use]
    pub fn new(capacity: usize, ttl: Duration) -> Self {
        let capacity = capacity.max(1);
        Self {
            entries: VecDeque::with_capacity(capacity.min(1024)),
            counts: HashMap::new(),
            capacity,
            ttl,
            evicted: 0,
        }
    }

    /// Remember `id` as seen now.
    pub fn add(&mut self, id: impl Into<String>) {
        let id = id.into();
        while self.entries.len() >= self.capacity {
            self.pop_front();
        }
        *self.counts.entry(id.clone()).or_insert(0) += 1;
        self.entries.push_back((id, Instant::now()));
    }

    /// Whether `id` was added within the TTL.
    pub fn exists(&mut self, id: &str) -> bool {
        self.expire(Instant::now());
        self.counts.contains_key(id)
    }

    pub fn clear(&mut self) {
        self.entries.clear();
        self.counts.clear();
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    #[must_use]
    pub fn stats(&self) -> DeliveryFilterStats {
        DeliveryFilterStats {
            len: self.entries.len(),
            capacity: self.capacity,
            ttl_secs: self.ttl.as_secs(),
            evicted: self.evicted,
        }
    }

    fn expire(&mut self, now: Instant) {
        while let Some((_, seen)) = self.entries.front() {
            if now.duration_since(*seen) <= self.ttl {
                break;
            }
            self.pop_front();
        }
    }

    fn pop_front(&mut self) {
        let Some((id, _)) = self.entries.pop_front() else {
            return;
        };
        self.evicted += 1;
        if let Some(count) = self.counts.get_mut(&id) {
            *count -= 1;
            if *count == 0 {
                self.counts.remove(&id);
            }
        }
    }
}
