//! Dispatch reports and the bounded per-event execution history.

use std::collections::VecDeque;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;

/// What a successful `publish` did.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DispatchReport {
    pub event: String,
    pub handlers_invoked: usize,
    /// Handlers that returned an error or panicked. They still count as invoked.
    pub handlers_failed: usize,
    pub elapsed: Duration,
    /// 1 for a top-level publish, +1 per nested publish on the same thread.
    pub depth: usize,
    pub dispatched_at: DateTime<Utc>,
    /// The schema was one-shot and has now been removed.
    pub one_shot_consumed: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum DispatchOutcome {
    Dispatched {
        handlers_invoked: usize,
        handlers_failed: usize,
    },
    Rejected {
        reason: String,
    },
}

/// One entry of an event's history ring.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DispatchRecord {
    pub at: DateTime<Utc>,
    pub elapsed: Duration,
    #[serde(flatten)]
    pub outcome: DispatchOutcome,
}

impl From<&DispatchReport> for DispatchRecord {
    fn from(report: &DispatchReport) -> Self {
        Self {
            at: report.dispatched_at,
            elapsed: report.elapsed,
            outcome: DispatchOutcome::Dispatched {
                handlers_invoked: report.handlers_invoked,
                handlers_failed: report.handlers_failed,
            },
        }
    }
}

/// Fixed-capacity ring; the oldest record is evicted first.
#[derive(Debug, Clone)]
pub(crate) struct HistoryRing {
    capacity: usize,
    records: VecDeque<DispatchRecord>,
}

impl HistoryRing {
    pub(crate) fn new(capacity: usize) -> Self {
        Self {
            capacity,
            records: VecDeque::with_capacity(capacity.min(1024)),
        }
    }

    pub(crate) fn push(&mut self, record: DispatchRecord) {
        if self.capacity == 0 {
            return;
        }
        while self.records.len() >= self.capacity {
            self.records.pop_front();
        }
        self.records.push_back(record);
    }

    pub(crate) fn snapshot(&self) -> Vec<DispatchRecord> {
        self.records.iter().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rejected(reason: &str) -> DispatchRecord {
        DispatchRecord {
            at: DateTime::<Utc>::default(),
            elapsed: Duration::ZERO,
            outcome: DispatchOutcome::Rejected {
                reason: reason.to_string(),
            },
        }
    }

    #[test]
    fn ring_evicts_oldest_first() {
        let mut ring = HistoryRing::new(2);
        ring.push(rejected("a"));
        ring.push(rejected("b"));
        ring.push(rejected("c"));

        let reasons: Vec<_> = ring
            .snapshot()
            .into_iter()
            .map(|r| match r.outcome {
                DispatchOutcome::Rejected { reason } => reason,
                DispatchOutcome::Dispatched { .. } => unreachable!(),
            })
            .collect();
        assert_eq!(reasons, vec!["b", "c"]);
    }

    #[test]
    fn zero_capacity_keeps_nothing() {
        let mut ring = HistoryRing::new(0);
        ring.push(rejected("a"));
        assert!(ring.snapshot().is_empty());
    }
}
