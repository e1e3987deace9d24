//! Bounded per-series rolling window
//!
//! Records are kept in arrival order in a `VecDeque`. Both caps are enforced
//! synchronously on every append: the count cap (`max_records`) and the time
//! cap (`max_age_secs` relative to the newest timestamp). Timestamps that arrive
//! out of order are clamped to the newest one so the buffer stays
//! non-decreasing.

use std::collections::vec_deque;
use std::collections::VecDeque;

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use tracing::debug;

use crate::config::WindowConfig;
use crate::models::EventRecord;

/// Rolling window for a single series
#[derive(Debug, Clone)]
pub struct Window {
    records: VecDeque<EventRecord>,
    max_records: usize,
    max_age: Duration,
    recent_fraction: f64,
    recent_count: Option<usize>,
    next_sequence: u64,
    evicted: u64,
}

impl Window {
    pub fn new(config: &WindowConfig) -> Self {
        Self {
            records: VecDeque::with_capacity(config.max_records.min(4096)),
            max_records: config.max_records,
            max_age: Duration::seconds(config.max_age_secs as i64),
            recent_fraction: config.recent_fraction,
            recent_count: config.recent_count,
            next_sequence: 0,
            evicted: 0,
        }
    }

    /// Append a record, assign its sequence number and evict past either cap
    ///
    /// Returns the stored copy (sequence assigned, timestamp possibly clamped).
    pub fn append(&mut self, mut record: EventRecord) -> EventRecord {
        if let Some(newest) = self.newest() {
            if record.timestamp < newest {
                debug!(
                    source = %record.source_id,
                    timestamp = %record.timestamp,
                    newest = %newest,
                    "Clamping out-of-order record timestamp"
                );
                record.timestamp = newest;
            }
        }

        record.sequence = self.next_sequence;
        self.next_sequence += 1;

        let stored = record.clone();
        self.records.push_back(record);
        self.evict(stored.timestamp);
        stored
    }

    fn evict(&mut self, newest: DateTime<Utc>) {
        while self.records.len() > self.max_records {
            self.records.pop_front();
            self.evicted += 1;
        }

        let cutoff = newest - self.max_age;
        while self
            .records
            .front()
            .map(|r| r.timestamp < cutoff)
            .unwrap_or(false)
        {
            self.records.pop_front();
            self.evicted += 1;
        }
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn newest(&self) -> Option<DateTime<Utc>> {
        self.records.back().map(|r| r.timestamp)
    }

    pub fn oldest(&self) -> Option<DateTime<Utc>> {
        self.records.front().map(|r| r.timestamp)
    }

    /// Size of the recent sub-window for the current length
    fn recent_len(&self) -> usize {
        let len = self.records.len();
        if len == 0 {
            return 0;
        }
        let k = match self.recent_count {
            Some(k) => k,
            None => (len as f64 * self.recent_fraction).ceil() as usize,
        };
        k.clamp(1, len)
    }

    /// Read-only view partitioned into baseline and recent sub-windows
    pub fn snapshot(&self) -> WindowSnapshot<'_> {
        WindowSnapshot {
            records: &self.records,
            split: self.records.len() - self.recent_len(),
        }
    }

    pub fn stats(&self, series_key: &str) -> WindowStats {
        WindowStats {
            series_key: series_key.to_string(),
            size: self.records.len(),
            capacity: self.max_records,
            oldest: self.oldest(),
            newest: self.newest(),
            total_appended: self.next_sequence,
            total_evicted: self.evicted,
        }
    }
}

/// Borrowed, consistent view of a window at one instant
#[derive(Debug, Clone, Copy)]
pub struct WindowSnapshot<'a> {
    records: &'a VecDeque<EventRecord>,
    split: usize,
}

impl<'a> WindowSnapshot<'a> {
    pub fn full(&self) -> vec_deque::Iter<'a, EventRecord> {
        self.records.iter()
    }

    /// Older portion of the window
    pub fn baseline(&self) -> vec_deque::Iter<'a, EventRecord> {
        self.records.range(..self.split)
    }

    /// Newest portion of the window
    pub fn recent(&self) -> vec_deque::Iter<'a, EventRecord> {
        self.records.range(self.split..)
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn baseline_len(&self) -> usize {
        self.split
    }

    pub fn recent_len(&self) -> usize {
        self.records.len() - self.split
    }

    pub fn latest(&self) -> Option<&'a EventRecord> {
        self.records.back()
    }

    /// The last `n` records, oldest first
    pub fn last_n(&self, n: usize) -> vec_deque::Iter<'a, EventRecord> {
        let start = self.records.len().saturating_sub(n);
        self.records.range(start..)
    }
}

/// Window occupancy, exposed through the read API
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct WindowStats {
    pub series_key: String,
    pub size: usize,
    pub capacity: usize,
    pub oldest: Option<DateTime<Utc>>,
    pub newest: Option<DateTime<Utc>>,
    pub total_appended: u64,
    pub total_evicted: u64,
}
