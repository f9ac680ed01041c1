//! Fault taxonomy for phase operations.
//!
//! A fault is what a VM collaborator call (or its deadline) produced. Faults
//! are plain data: the pipeline turns them into state transitions.

use super::phase::Phase;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

/// Standardized fault kinds encountered while driving a sample.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Hash)]
pub enum FaultKind {
    /// VM startup failed or the guest is not ready for commands
    VmAcquisition,
    /// Copying the sample into the guest failed or timed out
    Transfer,
    /// The guest command failed to start
    Execution,
    /// The telemetry window expired before monitoring finished
    MonitoringIncomplete,
    /// Data gathering timed out or failed
    CollectionPartial,
    /// The VM stopped responding and needs a snapshot restore
    VmUnresponsive,
    /// Snapshot restore failed; the run cannot continue safely
    FatalEnvironment,
    /// The sample-global deadline was exhausted
    SampleDeadline,
    /// A collaborator call panicked
    Internal,
}

/// What the pipeline does with a fault of a given kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// Retry while attempts remain
    Retry,
    /// Proceed with whatever partial data exists
    Absorb,
    /// Restore the VM snapshot, then retry while attempts remain
    Recover,
    /// Stop the whole run once progress is flushed
    Abort,
    /// Fail the sample, no retry
    Terminal,
}

impl FaultKind {
    pub fn disposition(self) -> Disposition {
        use FaultKind::*;
        match self {
            VmAcquisition | Transfer | Execution => Disposition::Retry,
            MonitoringIncomplete | CollectionPartial => Disposition::Absorb,
            VmUnresponsive => Disposition::Recover,
            FatalEnvironment => Disposition::Abort,
            SampleDeadline | Internal => Disposition::Terminal,
        }
    }
}

impl fmt::Display for FaultKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        use FaultKind::*;
        match self {
            VmAcquisition => write!(f, "VMAcquisitionError"),
            Transfer => write!(f, "TransferError"),
            Execution => write!(f, "ExecutionError"),
            MonitoringIncomplete => write!(f, "MonitoringIncomplete"),
            CollectionPartial => write!(f, "CollectionPartial"),
            VmUnresponsive => write!(f, "VMUnresponsive"),
            FatalEnvironment => write!(f, "FatalEnvironmentError"),
            SampleDeadline => write!(f, "SampleDeadlineExceeded"),
            Internal => write!(f, "InternalError"),
        }
    }
}

/// Concrete fault with message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Fault {
    pub kind: FaultKind,
    pub message: String,
    /// Cleared by collaborators for faults that can never succeed on retry
    /// (permission denied, missing sample file).
    pub retryable: bool,
    /// Set when the fault stands for a deadline breach, not a returned error
    pub timed_out: bool,
}

impl Fault {
    pub fn new(kind: FaultKind, message: impl Into<String>) -> Self {
        let retryable = matches!(
            kind.disposition(),
            Disposition::Retry | Disposition::Recover
        );
        Self {
            kind,
            message: message.into(),
            retryable,
            timed_out: false,
        }
    }

    /// A fault the collaborator knows will not go away on retry.
    pub fn terminal(kind: FaultKind, message: impl Into<String>) -> Self {
        Self {
            retryable: false,
            ..Self::new(kind, message)
        }
    }

    /// Fault standing in for a phase that overran its deadline.
    pub fn timeout(phase: Phase, after: Duration) -> Self {
        Self {
            timed_out: true,
            ..Self::new(
                phase.timeout_kind(),
                format!("{} timed out after {}ms", phase, after.as_millis()),
            )
        }
    }

    pub fn sample_deadline(budget: Duration) -> Self {
        Self::new(
            FaultKind::SampleDeadline,
            format!("sample deadline of {}ms exhausted", budget.as_millis()),
        )
    }

    /// Whether the VM must be restored before anything else touches it.
    pub fn requires_recovery(&self) -> bool {
        self.kind == FaultKind::VmUnresponsive
    }

    pub fn is_fatal(&self) -> bool {
        self.kind.disposition() == Disposition::Abort
    }
}

impl fmt::Display for Fault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind, self.message)
    }
}
