//! Bounded, time-ordered alert event history

use std::collections::{BTreeMap, VecDeque};
use std::sync::{Mutex, PoisonError};

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;

use crate::config::AlertConfig;
use crate::models::{AlertEvent, AlertTransition, Severity};

/// Alert history shared by every series
///
/// Retention is bounded both by entry count and by age relative to the newest
/// event; the oldest entries go first.
#[derive(Debug)]
pub struct AlertHistory {
    events: Mutex<VecDeque<AlertEvent>>,
    max_entries: usize,
    max_age: Duration,
}

/// Event counts over the retained history
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct HistoryStats {
    pub total: usize,
    pub by_severity: BTreeMap<Severity, usize>,
    pub by_transition: BTreeMap<String, usize>,
    pub oldest: Option<DateTime<Utc>>,
    pub newest: Option<DateTime<Utc>>,
    /// Active alerts nobody has acknowledged; filled in by the pipeline
    pub unacknowledged: usize,
}

impl AlertHistory {
    pub fn new(config: &AlertConfig) -> Self {
        Self {
            events: Mutex::new(VecDeque::new()),
            max_entries: config.history_max_entries,
            max_age: Duration::seconds(config.history_max_age_secs as i64),
        }
    }

    pub fn record(&self, event: AlertEvent) {
        let mut events = self.events.lock().unwrap_or_else(PoisonError::into_inner);
        let newest = events
            .back()
            .map(|e| e.emitted_at.max(event.emitted_at))
            .unwrap_or(event.emitted_at);
        events.push_back(event);

        while events.len() > self.max_entries {
            events.pop_front();
        }
        let cutoff = newest - self.max_age;
        while events.front().map(|e| e.emitted_at < cutoff).unwrap_or(false) {
            events.pop_front();
        }
    }

    /// Events emitted at or after `since`, oldest first
    pub fn since(&self, since: DateTime<Utc>) -> Vec<AlertEvent> {
        let events = self.events.lock().unwrap_or_else(PoisonError::into_inner);
        let mut out: Vec<AlertEvent> = events
            .iter()
            .filter(|e| e.emitted_at >= since)
            .cloned()
            .collect();
        out.sort_by(|a, b| a.emitted_at.cmp(&b.emitted_at));
        out
    }

    /// Up to `limit` events, newest first, optionally of one severity only
    pub fn recent(&self, limit: usize, severity: Option<Severity>) -> Vec<AlertEvent> {
        let events = self.events.lock().unwrap_or_else(PoisonError::into_inner);
        let mut out: Vec<AlertEvent> = events
            .iter()
            .filter(|e| severity.map_or(true, |s| e.alert.severity == s))
            .cloned()
            .collect();
        out.sort_by(|a, b| b.emitted_at.cmp(&a.emitted_at));
        out.truncate(limit);
        out
    }

    /// Drop events of one severity, or everything; returns how many went
    pub fn clear(&self, severity: Option<Severity>) -> usize {
        let mut events = self.events.lock().unwrap_or_else(PoisonError::into_inner);
        let before = events.len();
        match severity {
            Some(level) => events.retain(|e| e.alert.severity != level),
            None => events.clear(),
        }
        before - events.len()
    }

    pub fn len(&self) -> usize {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn stats(&self) -> HistoryStats {
        let events = self.events.lock().unwrap_or_else(PoisonError::into_inner);
        let mut stats = HistoryStats {
            total: events.len(),
            ..HistoryStats::default()
        };
        for event in events.iter() {
            *stats.by_severity.entry(event.alert.severity).or_default() += 1;
            *stats
                .by_transition
                .entry(event.transition.as_str().to_string())
                .or_default() += 1;
            stats.oldest = Some(
                stats
                    .oldest
                    .map_or(event.emitted_at, |o| o.min(event.emitted_at)),
            );
            stats.newest = Some(
                stats
                    .newest
                    .map_or(event.emitted_at, |n| n.max(event.emitted_at)),
            );
        }
        stats
    }

    /// Count of events for one transition kind
    pub fn count(&self, transition: AlertTransition) -> usize {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .filter(|e| e.transition == transition)
            .count()
    }
}
