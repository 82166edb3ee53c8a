//! Bounded status history

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::time::Duration;

use crate::Value;

/// Default number of entries kept per status object
pub const DEFAULT_HISTORY_CAPACITY: usize = 100;

/// One committed status
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub time: DateTime<Utc>,
    pub value: Value,
}

/// Ring buffer of committed statuses, oldest first
///
/// Writes closer together than `min_interval` replace the newest entry
/// instead of appending, so a chattering sensor cannot flush out the useful
/// part of the history.
#[derive(Debug, Clone)]
pub struct History {
    entries: VecDeque<HistoryEntry>,
    capacity: usize,
    min_interval: Duration,
}

impl History {
    pub fn new(capacity: usize, min_interval: Duration) -> Self {
        Self {
            entries: VecDeque::with_capacity(capacity.min(1024)),
            capacity,
            min_interval,
        }
    }

    pub fn record(&mut self, time: DateTime<Utc>, value: Value) {
        if self.capacity == 0 {
            return;
        }
        if let Some(last) = self.entries.back_mut() {
            let elapsed = (time - last.time).to_std().unwrap_or(Duration::ZERO);
            if elapsed < self.min_interval {
                last.time = time;
                last.value = value;
                return;
            }
        }
        if self.entries.len() == self.capacity {
            self.entries.pop_front();
        }
        self.entries.push_back(HistoryEntry { time, value });
    }

    pub fn entries(&self) -> Vec<HistoryEntry> {
        self.entries.iter().cloned().collect()
    }

    pub fn last(&self) -> Option<&HistoryEntry> {
        self.entries.back()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

impl Default for History {
    fn default() -> Self {
        Self::new(DEFAULT_HISTORY_CAPACITY, Duration::ZERO)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration as ChronoDuration;

    #[test]
    fn test_evicts_oldest() {
        let mut history = History::new(3, Duration::ZERO);
        let t0 = Utc::now();
        for i in 0..5 {
            history.record(t0 + ChronoDuration::seconds(i), Value::Int(i));
        }
        let values: Vec<Value> = history.entries().into_iter().map(|e| e.value).collect();
        assert_eq!(values, vec![Value::Int(2), Value::Int(3), Value::Int(4)]);
    }

    #[test]
    fn test_coalesces_within_interval() {
        let mut history = History::new(10, Duration::from_secs(1));
        let t0 = Utc::now();
        history.record(t0, Value::Int(1));
        history.record(t0 + ChronoDuration::milliseconds(200), Value::Int(2));
        history.record(t0 + ChronoDuration::milliseconds(1500), Value::Int(3));
        assert_eq!(history.len(), 2);
        assert_eq!(history.entries()[0].value, Value::Int(2));
        assert_eq!(history.last().unwrap().value, Value::Int(3));
    }

    #[test]
    fn test_zero_capacity_records_nothing() {
        let mut history = History::new(0, Duration::ZERO);
        history.record(Utc::now(), Value::Bool(true));
        assert!(history.is_empty());
    }
}
