//! ==============================================================================
//! evaluator.rs - threshold evaluation and warning history
//! ==============================================================================
//!
//! purpose:
//!     turns a filtered reading window into warnings. one comparison rule,
//!     used at two granularities:
//!     - evaluate_history: every reading in the window
//!     - evaluate_latest: only the newest reading (the "active" warnings)
//!
//!     rule, per parameter present in the threshold table:
//!         value > high             -> high warning
//!         value < low and low > 0  -> low warning
//!         otherwise                -> nothing
//!
//! relationships:
//!     - uses: domain.rs (ThresholdTable is the single source of truth)
//!     - used by: server.rs (warnings endpoint, latest-values status)
//!
//! ==============================================================================

use std::collections::{HashSet, VecDeque};
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;

use crate::domain::{Direction, Parameter, Reading, ThresholdTable, Warning};

/// Hard cap on retained warnings, on top of the time-based eviction.
const MAX_HISTORY_SIZE: usize = 10_000;

/// Per-metric status badge for the latest-values summary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Status {
    High,
    Low,
    Normal,
}

#[derive(Debug, Clone)]
pub struct ThresholdEvaluator {
    table: Arc<ThresholdTable>,
}

impl ThresholdEvaluator {
    pub fn new(table: Arc<ThresholdTable>) -> Self {
        Self { table }
    }

    pub fn table(&self) -> &ThresholdTable {
        &self.table
    }

    /// Compare one value; returns the breached direction and bound.
    fn check(&self, parameter: Parameter, value: f64) -> Option<(Direction, f64)> {
        if !value.is_finite() {
            return None;
        }
        let threshold = self.table.get(parameter)?;
        if value > threshold.high {
            Some((Direction::High, threshold.high))
        } else if threshold.has_low_bound() && value < threshold.low {
            Some((Direction::Low, threshold.low))
        } else {
            None
        }
    }

    pub fn classify(&self, parameter: Parameter, value: f64) -> Status {
        match self.check(parameter, value) {
            Some((Direction::High, _)) => Status::High,
            Some((Direction::Low, _)) => Status::Low,
            None => Status::Normal,
        }
    }

    fn evaluate_reading(&self, reading: &Reading, out: &mut Vec<Warning>) {
        for (parameter, _) in self.table.iter() {
            let Some(value) = reading.value(parameter) else {
                continue;
            };
            if let Some((direction, threshold_value)) = self.check(parameter, value) {
                out.push(Warning {
                    parameter,
                    direction,
                    observed_value: value,
                    threshold_value,
                    timestamp: reading.timestamp,
                    unit: parameter.unit(),
                });
            }
        }
    }

    /// Warnings for every reading in the window, in reading order.
    pub fn evaluate_history(&self, readings: &[Reading]) -> Vec<Warning> {
        let mut warnings = Vec::new();
        for reading in readings {
            self.evaluate_reading(reading, &mut warnings);
        }
        warnings
    }

    /// Warnings for the newest reading only.
    pub fn evaluate_latest(&self, readings: &[Reading]) -> Vec<Warning> {
        let mut warnings = Vec::new();
        if let Some(latest) = readings.last() {
            self.evaluate_reading(latest, &mut warnings);
        }
        warnings
    }
}

// ==============================================================================
// warning history
// ==============================================================================

/// Append-only warning log with time-based eviction.
///
/// Entries are deduplicated by `Warning::key`, so re-evaluating the same
/// window on every poll does not grow the log.
#[derive(Debug, Clone)]
pub struct WarningHistory {
    entries: VecDeque<Warning>,
    keys: HashSet<String>,
    retention: Duration,
}

impl WarningHistory {
    pub fn new(retention: Duration) -> Self {
        Self {
            entries: VecDeque::new(),
            keys: HashSet::new(),
            retention,
        }
    }

    /// retentions reaching past the calendar keep everything
    fn cutoff(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        now.checked_sub_signed(self.retention)
            .unwrap_or(DateTime::<Utc>::MIN_UTC)
    }

    fn evict(&mut self, now: DateTime<Utc>) {
        let cutoff = self.cutoff(now);
        let keys = &mut self.keys;
        self.entries.retain(|w| {
            let keep = w.timestamp >= cutoff;
            if !keep {
                keys.remove(&w.key());
            }
            keep
        });
    }

    /// Evict expired entries, then append unseen warnings. Returns how many
    /// were added.
    pub fn record<I>(&mut self, warnings: I, now: DateTime<Utc>) -> usize
    where
        I: IntoIterator<Item = Warning>,
    {
        self.evict(now);
        let cutoff = self.cutoff(now);
        let mut added = 0;
        for warning in warnings {
            if warning.timestamp < cutoff || !self.keys.insert(warning.key()) {
                continue;
            }
            self.entries.push_back(warning);
            added += 1;
        }
        while self.entries.len() > MAX_HISTORY_SIZE {
            if let Some(oldest) = self.entries.pop_front() {
                self.keys.remove(&oldest.key());
            }
        }
        added
    }

    /// Entries inside the retention window, newest first.
    pub fn recent(&self, now: DateTime<Utc>) -> Vec<Warning> {
        let cutoff = self.cutoff(now);
        let mut recent: Vec<Warning> = self
            .entries
            .iter()
            .filter(|w| w.timestamp >= cutoff)
            .cloned()
            .collect();
        recent.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
        recent
    }

    /// Every retained entry, newest first.
    pub fn all(&self) -> Vec<Warning> {
        let mut all: Vec<Warning> = self.entries.iter().cloned().collect();
        all.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
        all
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
