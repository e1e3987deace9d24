//! Per-series alert state machine
//!
//! Each `(kind, source_id)` key moves New -> Active -> Resolved. Findings that
//! match an active alert are merged; downstream only hears about the first
//! occurrence, severity escalations, renotifications after the dedup window
//! and resolutions after the cool-down.
//!
//! Alert fields carry event times taken from the findings, so replays behave
//! the same as live streams. Each alert also remembers the processing clock at
//! which a finding last touched it; the sweeper measures quiet time on that
//! clock, so a stream lagging behind wall time does not look quiet.

use std::collections::HashMap;

use chrono::{DateTime, Duration, Utc};
use uuid::Uuid;

use crate::config::AlertConfig;
use crate::models::{
    Alert, AlertEvent, AlertKey, AlertState, AlertTransition, Finding, Severity,
};

struct Tracked {
    alert: Alert,
    /// Processing time of the last matching finding
    touched: DateTime<Utc>,
}

pub struct AlertManager {
    dedup_window: Duration,
    cooldown: Duration,
    active: HashMap<AlertKey, Tracked>,
}

impl AlertManager {
    pub fn new(config: &AlertConfig) -> Self {
        Self {
            dedup_window: Duration::seconds(config.dedup_window_secs as i64),
            cooldown: Duration::seconds(config.cooldown_secs as i64),
            active: HashMap::new(),
        }
    }

    /// Fold one tick's findings into the active set
    ///
    /// Findings are handled most severe first so a tick carrying both a warning
    /// and a critical finding for one key raises once at critical. `now` is
    /// the processing clock the sweeper later compares against.
    pub fn ingest(&mut self, mut findings: Vec<Finding>, now: DateTime<Utc>) -> Vec<AlertEvent> {
        findings.sort_by(|a, b| b.severity.cmp(&a.severity));
        let mut events = Vec::new();
        for finding in findings {
            self.apply(finding, now, &mut events);
        }
        events
    }

    fn apply(&mut self, finding: Finding, now: DateTime<Utc>, events: &mut Vec<AlertEvent>) {
        let key = finding.key();
        let at = finding.timestamp;

        // A gap in event time longer than the cool-down resolves first
        let stale = self
            .active
            .get(&key)
            .map(|t| at - t.alert.last_seen >= self.cooldown)
            .unwrap_or(false);
        if stale {
            if let Some(old) = self.active.remove(&key) {
                let resolved_at = old.alert.last_seen + self.cooldown;
                events.push(resolve(old.alert, resolved_at));
            }
        }

        if !self.active.contains_key(&key) {
            let alert = Alert::from_finding(&finding);
            events.push(AlertEvent {
                transition: AlertTransition::Raised,
                emitted_at: at,
                alert: alert.clone(),
            });
            self.active.insert(
                key,
                Tracked {
                    alert,
                    touched: now,
                },
            );
            return;
        }
        let Some(tracked) = self.active.get_mut(&key) else {
            return;
        };
        tracked.touched = tracked.touched.max(now);
        let alert = &mut tracked.alert;

        let since_last = at - alert.last_seen;
        let escalated = finding.severity > alert.severity;

        alert.occurrence_count += 1;
        if at > alert.last_seen {
            alert.last_seen = at;
        }
        alert.score = alert.score.max(finding.score);
        if escalated {
            alert.severity = finding.severity;
            alert.detector_name = finding.detector_name;
            alert.detail = finding.detail;
            alert.acknowledged = false;
        }

        let transition = if escalated {
            Some(AlertTransition::Escalated)
        } else if since_last > self.dedup_window && !alert.acknowledged {
            Some(AlertTransition::Renotified)
        } else {
            None
        };
        if let Some(transition) = transition {
            events.push(AlertEvent {
                transition,
                emitted_at: at,
                alert: alert.clone(),
            });
        }
    }

    /// Resolve alerts no finding has touched for the cool-down
    ///
    /// Quiet time is measured on the processing clock; the resolution is
    /// stamped on the event timeline at `last_seen` plus that quiet time.
    pub fn sweep(&mut self, now: DateTime<Utc>) -> Vec<AlertEvent> {
        let expired: Vec<AlertKey> = self
            .active
            .iter()
            .filter(|(_, t)| now - t.touched >= self.cooldown)
            .map(|(k, _)| k.clone())
            .collect();

        let mut events: Vec<AlertEvent> = expired
            .into_iter()
            .filter_map(|key| self.active.remove(&key))
            .map(|t| {
                let resolved_at = t.alert.last_seen + (now - t.touched);
                resolve(t.alert, resolved_at)
            })
            .collect();
        events.sort_by(|a, b| a.alert.first_seen.cmp(&b.alert.first_seen));
        events
    }

    pub fn find(&self, id: Uuid) -> Option<&Alert> {
        self.active().find(|a| a.id == id)
    }

    /// Mark an active alert acknowledged
    ///
    /// Returns the event to publish, or `None` when the id is unknown or the
    /// alert was already acknowledged.
    pub fn acknowledge(&mut self, id: Uuid, at: DateTime<Utc>) -> Option<AlertEvent> {
        let tracked = self.active.values_mut().find(|t| t.alert.id == id)?;
        if tracked.alert.acknowledged {
            return None;
        }
        tracked.alert.acknowledged = true;
        Some(AlertEvent {
            transition: AlertTransition::Acknowledged,
            emitted_at: at,
            alert: tracked.alert.clone(),
        })
    }

    /// Drop active alerts of one severity, or all of them, without resolving
    pub fn clear(&mut self, severity: Option<Severity>) -> Vec<Alert> {
        let keys: Vec<AlertKey> = self
            .active
            .iter()
            .filter(|(_, t)| severity.map_or(true, |s| t.alert.severity == s))
            .map(|(k, _)| k.clone())
            .collect();
        keys.into_iter()
            .filter_map(|key| self.active.remove(&key))
            .map(|t| t.alert)
            .collect()
    }

    pub fn active(&self) -> impl Iterator<Item = &Alert> {
        self.active.values().map(|t| &t.alert)
    }

    pub fn active_count(&self) -> usize {
        self.active.len()
    }
}

fn resolve(mut alert: Alert, at: DateTime<Utc>) -> AlertEvent {
    alert.state = AlertState::Resolved;
    alert.resolved_at = Some(at);
    AlertEvent {
        transition: AlertTransition::Resolved,
        emitted_at: at,
        alert,
    }
}
