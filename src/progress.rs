//! Progress reporting derived from the checkpoint.

use crate::checkpoint::CheckpointSet;
use crate::core::SampleStatus;
use crate::queue::SampleQueue;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::Serialize;
use std::fmt;
use tracing::info;

/// Read-only view of how far a run has come.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProgressSnapshot {
    pub total: usize,
    pub completed: usize,
    pub succeeded: usize,
    pub failed: usize,
    /// Samples finished by this run (excludes those resumed from disk)
    pub processed_this_run: usize,
    pub percent: f64,
    pub success_rate: f64,
    pub failure_rate: f64,
    pub elapsed_secs: f64,
    pub mean_secs_per_sample: Option<f64>,
    pub eta_secs: Option<f64>,
    pub projected_completion: Option<DateTime<Utc>>,
}

impl ProgressSnapshot {
    /// Summarize `set` against the queue. `baseline` is how many queued
    /// samples were already checkpointed when the run started.
    pub fn compute(
        set: &CheckpointSet,
        queue: &SampleQueue,
        baseline: usize,
        run_started: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Self {
        let mut succeeded: usize = 0;
        let mut failed: usize = 0;
        for record in set.iter().filter(|r| queue.contains(&r.path)) {
            match record.status {
                SampleStatus::Done => succeeded += 1,
                SampleStatus::Failed => failed += 1,
                _ => {}
            }
        }
        let total = queue.len();
        let completed = succeeded + failed;
        let processed_this_run = completed.saturating_sub(baseline);
        let remaining = total.saturating_sub(completed);

        let elapsed_secs = (now - run_started).num_milliseconds().max(0) as f64 / 1000.0;
        let mean_secs_per_sample =
            (processed_this_run > 0).then(|| elapsed_secs / processed_this_run as f64);
        let eta_secs = mean_secs_per_sample.map(|mean| mean * remaining as f64);
        let projected_completion =
            eta_secs.map(|eta| now + ChronoDuration::milliseconds((eta * 1000.0) as i64));

        Self {
            total,
            completed,
            succeeded,
            failed,
            processed_this_run,
            percent: ratio(completed * 100, total),
            success_rate: ratio(succeeded, completed),
            failure_rate: ratio(failed, completed),
            elapsed_secs,
            mean_secs_per_sample,
            eta_secs,
            projected_completion,
        }
    }

    pub fn remaining(&self) -> usize {
        self.total.saturating_sub(self.completed)
    }
}

fn ratio(part: usize, whole: usize) -> f64 {
    if whole == 0 {
        0.0
    } else {
        part as f64 / whole as f64
    }
}

fn hms(secs: f64) -> String {
    let total = secs.max(0.0).round() as u64;
    format!("{}h{:02}m{:02}s", total / 3600, (total % 3600) / 60, total % 60)
}

impl fmt::Display for ProgressSnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}/{} samples ({:.1}%) | ok {} ({:.1}%) failed {} ({:.1}%) | elapsed {}",
            self.completed,
            self.total,
            self.percent,
            self.succeeded,
            self.success_rate * 100.0,
            self.failed,
            self.failure_rate * 100.0,
            hms(self.elapsed_secs)
        )?;
        match (
            self.mean_secs_per_sample,
            self.eta_secs,
            self.projected_completion,
        ) {
            (Some(mean), Some(eta), Some(at)) => write!(
                f,
                " | {:.1}s/sample | eta {} (~{})",
                mean,
                hms(eta),
                at.format("%Y-%m-%d %H:%M:%S UTC")
            ),
            _ => write!(f, " | eta unknown"),
        }
    }
}

/// Decides when to emit a progress line.
#[derive(Debug, Clone)]
pub struct ProgressReporter {
    every: usize,
    baseline: usize,
    run_started: DateTime<Utc>,
}

impl ProgressReporter {
    pub fn new(every: usize, baseline: usize, run_started: DateTime<Utc>) -> Self {
        Self {
            every: every.max(1),
            baseline,
            run_started,
        }
    }

    pub fn should_emit(&self, processed_this_run: usize) -> bool {
        processed_this_run > 0 && processed_this_run % self.every == 0
    }

    pub fn snapshot(&self, set: &CheckpointSet, queue: &SampleQueue) -> ProgressSnapshot {
        ProgressSnapshot::compute(set, queue, self.baseline, self.run_started, Utc::now())
    }

    /// Emit a progress line; returns the snapshot that was logged.
    pub fn emit(&self, set: &CheckpointSet, queue: &SampleQueue) -> ProgressSnapshot {
        let snapshot = self.snapshot(set, queue);
        info!(
            completed = snapshot.completed,
            total = snapshot.total,
            "progress: {}",
            snapshot
        );
        snapshot
    }
}
