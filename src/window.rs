//! Sliding-window power-coverage estimator
//!
//! A bounded, strictly time-ordered sequence of per-minute power records.
//! The scheduler is the only writer; observers get snapshots. The two ratio
//! estimators are pure functions of the window contents.
//!
//! List arguments follow one convention everywhere:
//! - `ignore`: tasks whose entire draw is treated as reclaimable (they are
//!   lower priority and may be preempted for the candidate).
//! - `minimum` / `minimize`: running auto-adjust tasks, which will shrink
//!   back to nominal; only their draw above nominal is reclaimable.

use std::collections::VecDeque;
use tracing::warn;

use crate::domain::{ChannelKey, PowerRecord};

/// What the estimator needs to know about a task
#[derive(Debug, Clone)]
pub struct TaskProfile {
    pub id: String,
    pub keys: Vec<ChannelKey>,
    pub nominal_power_kw: f64,
}

#[derive(Debug)]
pub struct SlidingWindow {
    capacity: usize,
    records: VecDeque<PowerRecord>,
}

impl SlidingWindow {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            records: VecDeque::with_capacity(capacity.max(1)),
        }
    }

    /// Append a record, evicting the oldest when full. Records that do not
    /// advance time are dropped to keep the window strictly ordered.
    pub fn push(&mut self, record: PowerRecord) -> bool {
        if let Some(last) = self.records.back() {
            if record.timestamp <= last.timestamp {
                warn!(
                    at = %record.timestamp,
                    last = %last.timestamp,
                    "dropping out-of-order power record"
                );
                return false;
            }
        }
        if self.records.len() == self.capacity {
            self.records.pop_front();
        }
        self.records.push_back(record);
        true
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn latest(&self) -> Option<&PowerRecord> {
        self.records.back()
    }

    /// Copy for observers; the window itself is never shared mutably
    pub fn snapshot(&self) -> Vec<PowerRecord> {
        self.records.iter().cloned().collect()
    }

    /// Present draw of a task: sum of its channels in the latest record
    pub fn power_used_by(&self, task: &TaskProfile) -> f64 {
        self.latest()
            .map(|record| record.sum_of(&task.keys))
            .unwrap_or(0.0)
    }

    /// Fraction of `task.nominal_power` that production would cover if the
    /// task started right now, judged on the latest record.
    ///
    /// Power already drawn by `ignore` tasks counts as available again, as
    /// does the above-nominal surplus of `minimum` tasks.
    pub fn available_for(
        &self,
        task: &TaskProfile,
        minimum: &[TaskProfile],
        ignore: &[TaskProfile],
    ) -> f64 {
        if task.nominal_power_kw <= 0.0 {
            return 0.0;
        }
        let Some(record) = self.latest() else {
            return 0.0;
        };

        let reclaimable: f64 = ignore
            .iter()
            .map(|t| record.sum_of(&t.keys))
            .chain(
                minimum
                    .iter()
                    .map(|t| (record.sum_of(&t.keys) - t.nominal_power_kw).max(0.0)),
            )
            .sum();

        let available = record.production() - (record.consumption() - reclaimable);
        (available / task.nominal_power_kw).max(0.0)
    }

    /// Fraction of the energy the task drew over the window that production
    /// simultaneously covered. 0 when the task drew nothing.
    ///
    /// Per record, production is first charged with the rest of the home's
    /// consumption; what remains, up to the task's own draw, counts as
    /// covered. `minimize` surplus and `ignore` draw are excluded from that
    /// competing consumption.
    pub fn covered_by_production(
        &self,
        task: &TaskProfile,
        minimize: &[TaskProfile],
        ignore: &[TaskProfile],
    ) -> f64 {
        let mut drawn = 0.0;
        let mut covered = 0.0;

        for record in &self.records {
            let task_power = record.sum_of(&task.keys);
            if task_power <= 0.0 {
                continue;
            }

            let excluded: f64 = ignore
                .iter()
                .map(|t| record.sum_of(&t.keys))
                .chain(
                    minimize
                        .iter()
                        .map(|t| (record.sum_of(&t.keys) - t.nominal_power_kw).max(0.0)),
                )
                .sum();

            let other = (record.consumption() - task_power - excluded).max(0.0);
            let attributable = (record.production() - other).max(0.0).min(task_power);

            drawn += task_power;
            covered += attributable;
        }

        if drawn > 0.0 {
            covered / drawn
        } else {
            0.0
        }
    }
}
