//! Pipeline phases and the per-sample status they drive.

use super::fault::FaultKind;
use serde::{Deserialize, Serialize};
use std::fmt;

/// One discrete step of the per-sample pipeline, in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Phase {
    #[serde(rename = "AcquiringVM")]
    AcquiringVm,
    Transferring,
    Executing,
    Monitoring,
    Collecting,
}

impl Phase {
    /// All phases in pipeline order.
    pub const ALL: [Phase; 5] = [
        Phase::AcquiringVm,
        Phase::Transferring,
        Phase::Executing,
        Phase::Monitoring,
        Phase::Collecting,
    ];

    /// The phase that follows this one, `None` after `Collecting`.
    pub fn next(self) -> Option<Phase> {
        match self {
            Phase::AcquiringVm => Some(Phase::Transferring),
            Phase::Transferring => Some(Phase::Executing),
            Phase::Executing => Some(Phase::Monitoring),
            Phase::Monitoring => Some(Phase::Collecting),
            Phase::Collecting => None,
        }
    }

    /// Fault kind reported when this phase overruns its deadline.
    pub fn timeout_kind(self) -> FaultKind {
        match self {
            Phase::AcquiringVm => FaultKind::VmAcquisition,
            Phase::Transferring => FaultKind::Transfer,
            Phase::Executing => FaultKind::Execution,
            Phase::Monitoring => FaultKind::MonitoringIncomplete,
            Phase::Collecting => FaultKind::CollectionPartial,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Phase::AcquiringVm => "AcquiringVM",
            Phase::Transferring => "Transferring",
            Phase::Executing => "Executing",
            Phase::Monitoring => "Monitoring",
            Phase::Collecting => "Collecting",
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Status of a sample record. `Done` and `Failed` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SampleStatus {
    Queued,
    #[serde(rename = "AcquiringVM")]
    AcquiringVm,
    Transferring,
    Executing,
    Monitoring,
    Collecting,
    Done,
    Failed,
}

impl SampleStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, SampleStatus::Done | SampleStatus::Failed)
    }

    /// The phase this status corresponds to, if it is an in-flight status.
    pub fn phase(self) -> Option<Phase> {
        match self {
            SampleStatus::AcquiringVm => Some(Phase::AcquiringVm),
            SampleStatus::Transferring => Some(Phase::Transferring),
            SampleStatus::Executing => Some(Phase::Executing),
            SampleStatus::Monitoring => Some(Phase::Monitoring),
            SampleStatus::Collecting => Some(Phase::Collecting),
            SampleStatus::Queued | SampleStatus::Done | SampleStatus::Failed => None,
        }
    }
}

impl From<Phase> for SampleStatus {
    fn from(phase: Phase) -> Self {
        match phase {
            Phase::AcquiringVm => SampleStatus::AcquiringVm,
            Phase::Transferring => SampleStatus::Transferring,
            Phase::Executing => SampleStatus::Executing,
            Phase::Monitoring => SampleStatus::Monitoring,
            Phase::Collecting => SampleStatus::Collecting,
        }
    }
}

impl fmt::Display for SampleStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SampleStatus::Queued => f.write_str("Queued"),
            SampleStatus::Done => f.write_str("Done"),
            SampleStatus::Failed => f.write_str("Failed"),
            other => match other.phase() {
                Some(phase) => write!(f, "{}", phase),
                None => Ok(()),
            },
        }
    }
}
