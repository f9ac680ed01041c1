//! Resilient batch orchestration for VM-based dynamic analysis.
//!
//! Samples are pushed one at a time through a supervised pipeline
//! (acquire VM, transfer, execute, monitor, collect). Every phase is
//! deadline-bound, transient faults are retried under a per-sample cap,
//! the VM is restored to a clean snapshot after every sample, and each
//! terminal outcome is checkpointed so an interrupted run resumes where
//! it stopped.

/// Logging and tracing setup
#[macro_use]
pub mod logging;

/// Sample, phase and fault data model
pub mod core;

/// Error types
pub mod error;

/// Phase timeout table and run configuration
pub mod config;

/// VM collaborator interface
pub mod vm;

/// Deadline supervision of collaborator calls
pub mod supervisor;

/// Per-sample state machine
pub mod pipeline;

/// Persisted set of terminal records
pub mod checkpoint;

/// Append-only failure log
pub mod failure_log;

/// Sample enumeration
pub mod queue;

/// Progress and ETA reporting
pub mod progress;

/// Cooperative cancellation
pub mod cancel;

/// Behavioral payload hand-off
pub mod features;

/// Batch driver
pub mod orchestrator;

pub use cancel::CancelSignal;
pub use checkpoint::{CheckpointSet, CheckpointStore};
pub use config::{
    DetonatorConfig, OverrunPolicy, PhaseTimeout, PhaseTimeoutTable, TimeoutAction,
};
pub use core::{DataPresence, Fault, FaultKind, Label, Phase, SampleRecord, SampleStatus};
pub use error::{DetonatorError, Result};
pub use failure_log::{FailureLog, FailureLogEntry};
pub use features::{DiscardFeatures, FeatureSink, PayloadDir};
pub use orchestrator::{Orchestrator, RunStatus, RunSummary};
pub use progress::{ProgressReporter, ProgressSnapshot};
pub use queue::{SampleQueue, SampleSpec};
pub use vm::{BehaviorBuffer, Session, VmBackend, VmResult, VmState};
