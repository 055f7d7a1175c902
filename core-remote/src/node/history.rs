//! Bounded record of recent ticks for one node.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::VecDeque;
use std::time::Duration;

/// How a tick ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", content = "status", rename_all = "snake_case")]
pub enum TickStatus {
    /// 2xx response, applied.
    Success(u16),
    /// Non-2xx response.
    HttpError(u16),
    /// Connect failure, timeout or broken exchange.
    TransportError,
    /// Response arrived after the node left the polling states.
    Discarded,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TickRecord {
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub status: TickStatus,
    pub request_size: usize,
    pub response_size: usize,
}

impl TickRecord {
    pub fn duration(&self) -> Duration {
        (self.finished_at - self.started_at)
            .to_std()
            .unwrap_or(Duration::ZERO)
    }

    pub fn is_success(&self) -> bool {
        matches!(self.status, TickStatus::Success(_))
    }
}

/// Ring of the most recent tick records; the oldest is evicted on overflow.
#[derive(Debug)]
pub struct TickHistory {
    records: VecDeque<TickRecord>,
    capacity: usize,
}

impl TickHistory {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            records: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    pub fn push(&mut self, record: TickRecord) {
        if self.records.len() == self.capacity {
            self.records.pop_front();
        }
        self.records.push_back(record);
    }

    /// Records from oldest to newest.
    pub fn snapshot(&self) -> Vec<TickRecord> {
        self.records.iter().cloned().collect()
    }

    pub fn last_success(&self) -> Option<&TickRecord> {
        self.records.iter().rev().find(|record| record.is_success())
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn record(second: u32, status: TickStatus) -> TickRecord {
        let started_at = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, second).unwrap();
        TickRecord {
            started_at,
            finished_at: started_at + chrono::Duration::milliseconds(40),
            status,
            request_size: 64,
            response_size: 128,
        }
    }

    #[test]
    fn test_oldest_evicted_on_overflow() {
        let mut history = TickHistory::new(3);
        for second in 0..5 {
            history.push(record(second, TickStatus::Success(200)));
        }

        let snapshot = history.snapshot();
        assert_eq!(history.len(), 3);
        assert_eq!(snapshot[0].started_at.timestamp() % 60, 2);
        assert_eq!(snapshot[2].started_at.timestamp() % 60, 4);
    }

    #[test]
    fn test_last_success_skips_failures() {
        let mut history = TickHistory::new(10);
        history.push(record(0, TickStatus::Success(200)));
        history.push(record(1, TickStatus::HttpError(503)));
        history.push(record(2, TickStatus::TransportError));

        let last = history.last_success().unwrap();
        assert_eq!(last.started_at.timestamp() % 60, 0);
        assert_eq!(last.duration(), Duration::from_millis(40));
    }
}
