//! Bounded log of recent pipeline failures.
//!
//! Keeps the newest `capacity` records; older ones fall off the front.

use std::collections::VecDeque;

use chrono::{DateTime, Utc};
use serde::Serialize;

/// Where a failure happened.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "stage", rename_all = "snake_case")]
pub enum FailureContext {
    /// Intake was full for the whole submit timeout.
    QueueFull { intake_depth: usize },
    /// The handler returned an error or the payload was not processable.
    Handler { worker: usize },
    /// The handler panicked.
    Panicked { worker: usize },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FailureRecord {
    pub timestamp: DateTime<Utc>,
    pub reason: String,
    #[serde(flatten)]
    pub context: FailureContext,
}

#[derive(Debug)]
pub struct FailureLog {
    records: VecDeque<FailureRecord>,
    capacity: usize,
    total: u64,
}

impl FailureLog {
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            records: VecDeque::with_capacity(capacity.min(1024)),
            capacity,
            total: 0,
        }
    }

    pub fn record(&mut self, reason: impl Into<String>, context: FailureContext) {
        self.total += 1;
        if self.capacity == 0 {
            return;
        }
        if self.records.len() == self.capacity {
            self.records.pop_front();
        }
        self.records.push_back(FailureRecord {
            timestamp: Utc::now(),
            reason: reason.into(),
            context,
        });
    }

    /// Oldest first.
    #[must_use]
    pub fn recent(&self) -> Vec<FailureRecord> {
        self.records.iter().cloned().collect()
    }

    /// Failures ever recorded, including ones that fell off.
    #[must_use]
    pub fn total(&self) -> u64 {
        self.total
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keeps_newest_records() {
        let mut log = FailureLog::new(2);
        for worker in 0..3 {
            log.record(format!("boom {worker}"), FailureContext::Handler { worker });
        }
        let recent = log.recent();
        assert_eq!(recent.len(), 2);
        assert_eq!(recent[0].reason, "boom 1");
        assert_eq!(recent[1].context, FailureContext::Handler { worker: 2 });
        assert_eq!(log.total(), 3);
    }

    #[test]
    fn serializes_flat() {
        let mut log = FailureLog::new(4);
        log.record("queue full", FailureContext::QueueFull { intake_depth: 7 });
        let json = serde_json::to_value(&log.recent()[0]).unwrap();
        assert_eq!(json["reason"], "queue full");
        assert_eq!(json["stage"], "queue_full");
        assert_eq!(json["intake_depth"], 7);
    }
}
