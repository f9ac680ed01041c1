//! Deadline supervision for blocking collaborator calls.
//!
//! Each call runs on tokio's blocking pool and is raced against a timer.
//! A call that loses the race is not killed: it keeps running in the
//! background and its late result is dropped. The pipeline decides whether
//! that warrants forcing the VM off.

use crate::config::PhaseTimeout;
use crate::core::{Fault, FaultKind, Phase};
use crate::vm::VmResult;
use std::time::{Duration, Instant};
use tokio::task::spawn_blocking;
use tokio::time::timeout;
use tracing::{debug, error, warn};

/// Classified result of one supervised phase.
#[derive(Debug)]
pub enum PhaseOutcome<T> {
    Success(T),
    /// Eligible for retry if the sample has attempts left
    TransientFailure(Fault),
    /// Not retryable
    TerminalFailure(Fault),
}

impl<T> PhaseOutcome<T> {
    pub fn classify(result: VmResult<T>) -> Self {
        match result {
            Ok(value) => PhaseOutcome::Success(value),
            Err(fault) if fault.retryable => PhaseOutcome::TransientFailure(fault),
            Err(fault) => PhaseOutcome::TerminalFailure(fault),
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, PhaseOutcome::Success(_))
    }

    pub fn fault(&self) -> Option<&Fault> {
        match self {
            PhaseOutcome::Success(_) => None,
            PhaseOutcome::TransientFailure(f) | PhaseOutcome::TerminalFailure(f) => Some(f),
        }
    }

    pub fn into_result(self) -> VmResult<T> {
        match self {
            PhaseOutcome::Success(v) => Ok(v),
            PhaseOutcome::TransientFailure(f) | PhaseOutcome::TerminalFailure(f) => Err(f),
        }
    }
}

/// Wall-clock budget for one sample, across every phase and retry.
#[derive(Debug, Clone)]
pub struct SampleClock {
    start: Instant,
    budget: Duration,
}

impl SampleClock {
    pub fn start(budget: Duration) -> Self {
        Self {
            start: Instant::now(),
            budget,
        }
    }

    pub fn budget(&self) -> Duration {
        self.budget
    }

    pub fn elapsed(&self) -> Duration {
        self.start.elapsed()
    }

    pub fn remaining(&self) -> Duration {
        self.budget.saturating_sub(self.elapsed())
    }

    pub fn expired(&self) -> bool {
        self.remaining().is_zero()
    }

    /// Shrink `limit` to what is left of the budget. The flag reports
    /// whether the budget, not `limit`, is the binding constraint.
    pub fn clamp(&self, limit: Duration) -> (Duration, bool) {
        let remaining = self.remaining();
        if remaining < limit {
            (remaining, true)
        } else {
            (limit, false)
        }
    }

    pub fn deadline_fault(&self) -> Fault {
        Fault::sample_deadline(self.budget)
    }
}

/// Deadline settings for one supervised phase.
#[derive(Debug, Clone)]
pub struct PhaseDeadline {
    pub phase: Phase,
    pub limit: Duration,
    pub sub_attempts: u32,
}

impl PhaseDeadline {
    pub fn new(phase: Phase, limit: Duration) -> Self {
        Self {
            phase,
            limit,
            sub_attempts: 1,
        }
    }

    pub fn from_config(phase: Phase, entry: &PhaseTimeout) -> Self {
        Self {
            phase,
            limit: entry.timeout(),
            sub_attempts: entry.sub_attempts.max(1),
        }
    }

    pub fn with_sub_attempts(mut self, sub_attempts: u32) -> Self {
        self.sub_attempts = sub_attempts.max(1);
        self
    }
}

/// Outcome of a single bounded call.
#[derive(Debug)]
pub enum Bounded<T> {
    Completed(T),
    TimedOut,
    Panicked(String),
}

/// Run a blocking call, giving up on it after `limit`.
pub async fn run_bounded<T, F>(operation: &str, limit: Duration, op: F) -> Bounded<T>
where
    F: FnOnce() -> T + Send + 'static,
    T: Send + 'static,
{
    debug!(
        operation,
        limit_ms = limit.as_millis() as u64,
        "starting bounded call"
    );

    let handle = spawn_blocking(op);
    match timeout(limit, handle).await {
        Ok(Ok(value)) => Bounded::Completed(value),
        Ok(Err(join_error)) => {
            error!(operation, error = %join_error, "collaborator call panicked");
            Bounded::Panicked(join_error.to_string())
        }
        Err(_) => {
            warn!(
                operation,
                limit_ms = limit.as_millis() as u64,
                "call overran its deadline, leaving it in the background"
            );
            Bounded::TimedOut
        }
    }
}

/// Run one phase under its deadline, clamped to the sample clock.
///
/// `make_op` builds a fresh call for every sub-attempt. Transient failures
/// are retried internally until `sub_attempts` is used up; a fault that
/// needs VM recovery is handed straight back.
pub async fn supervise<T, F, G>(
    deadline: &PhaseDeadline,
    clock: &SampleClock,
    mut make_op: F,
) -> PhaseOutcome<T>
where
    F: FnMut() -> G,
    G: FnOnce() -> VmResult<T> + Send + 'static,
    T: Send + 'static,
{
    let tries = deadline.sub_attempts.max(1);
    let mut sub = 0;
    loop {
        sub += 1;
        if clock.expired() {
            return PhaseOutcome::TerminalFailure(clock.deadline_fault());
        }

        let (limit, clamped) = clock.clamp(deadline.limit);
        let outcome = match run_bounded(deadline.phase.as_str(), limit, make_op()).await {
            Bounded::Completed(result) => PhaseOutcome::classify(result),
            Bounded::TimedOut if clamped => PhaseOutcome::TerminalFailure(clock.deadline_fault()),
            Bounded::TimedOut => {
                PhaseOutcome::TransientFailure(Fault::timeout(deadline.phase, limit))
            }
            Bounded::Panicked(msg) => {
                PhaseOutcome::TerminalFailure(Fault::terminal(FaultKind::Internal, msg))
            }
        };

        match outcome {
            PhaseOutcome::TransientFailure(fault) if sub < tries && !fault.requires_recovery() => {
                debug!(
                    phase = %deadline.phase,
                    sub_attempt = sub,
                    of = tries,
                    fault = %fault,
                    "retrying within phase"
                );
            }
            other => return other,
        }
    }
}
