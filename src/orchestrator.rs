//! Batch orchestration.
//!
//! Walks the queue in order, skipping everything the checkpoint already
//! holds, and drives each pending sample through the [`SamplePipeline`].
//! A terminal record is committed to the checkpoint before the next sample
//! starts; failures are additionally appended to the failure log.

use crate::cancel::CancelSignal;
use crate::checkpoint::CheckpointStore;
use crate::config::DetonatorConfig;
use crate::core::{Fault, SampleStatus};
use crate::error::{DetonatorError, Result};
use crate::failure_log::{FailureLog, FailureLogEntry};
use crate::features::{DiscardFeatures, FeatureSink};
use crate::pipeline::SamplePipeline;
use crate::progress::ProgressReporter;
use crate::queue::{SampleQueue, SampleSpec};
use crate::vm::VmBackend;
use chrono::Utc;
use serde::Serialize;
use std::fmt;
use std::sync::Arc;
use tracing::{error, info, info_span, warn, Instrument};
use uuid::Uuid;

/// How a run ended.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum RunStatus {
    /// Every queued sample is checkpointed
    Completed,
    /// Stopped between samples on request; resumable
    Cancelled,
    /// The environment failed; resumable once fixed
    Aborted { reason: String },
}

impl RunStatus {
    pub fn exit_code(&self) -> i32 {
        match self {
            RunStatus::Completed => 0,
            RunStatus::Cancelled => 130,
            RunStatus::Aborted { .. } => 2,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub run_id: Uuid,
    /// Samples in the queue
    pub total: usize,
    /// Samples already checkpointed when the run started
    pub skipped: usize,
    /// Samples committed by this run
    pub processed: usize,
    pub succeeded: usize,
    pub failed: usize,
    /// `Done` samples with partial behavioral data
    pub partial: usize,
    /// VM snapshot restores, end-of-sample resets included
    pub recoveries: u32,
    pub log_write_failures: usize,
    pub status: RunStatus,
}

impl RunSummary {
    fn new(run_id: Uuid, total: usize, skipped: usize) -> Self {
        Self {
            run_id,
            total,
            skipped,
            processed: 0,
            succeeded: 0,
            failed: 0,
            partial: 0,
            recoveries: 0,
            log_write_failures: 0,
            status: RunStatus::Completed,
        }
    }

    pub fn exit_code(&self) -> i32 {
        self.status.exit_code()
    }
}

impl fmt::Display for RunSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "run {}: {:?}, {} queued, {} skipped, {} processed ({} ok, {} partial, {} failed)",
            self.run_id,
            self.status,
            self.total,
            self.skipped,
            self.processed,
            self.succeeded,
            self.partial,
            self.failed
        )
    }
}

pub struct Orchestrator<B: VmBackend> {
    config: DetonatorConfig,
    backend: Arc<B>,
    store: CheckpointStore,
    failures: FailureLog,
    cancel: CancelSignal,
    sink: Box<dyn FeatureSink>,
}

impl<B: VmBackend> Orchestrator<B> {
    /// Validate `config` and bind the checkpoint and failure log paths it
    /// names. Nothing is read until [`run`](Self::run).
    pub fn new(config: DetonatorConfig, backend: Arc<B>) -> Result<Self> {
        config.validate()?;
        let store = CheckpointStore::new(&config.storage.checkpoint_path);
        let failures = FailureLog::new(&config.storage.failure_log_path);
        Ok(Self {
            config,
            backend,
            store,
            failures,
            cancel: CancelSignal::new(),
            sink: Box::new(DiscardFeatures),
        })
    }

    pub fn with_cancel_signal(mut self, cancel: CancelSignal) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn with_feature_sink(mut self, sink: impl FeatureSink + 'static) -> Self {
        self.sink = Box::new(sink);
        self
    }

    pub fn cancel_signal(&self) -> &CancelSignal {
        &self.cancel
    }

    pub fn config(&self) -> &DetonatorConfig {
        &self.config
    }

    pub fn checkpoint(&self) -> &CheckpointStore {
        &self.store
    }

    pub fn failure_log(&self) -> &FailureLog {
        &self.failures
    }

    /// Process every pending sample of `queue`.
    ///
    /// Returns `Err` only when the run cannot record its own progress
    /// (checkpoint I/O, a rejected feature payload). Sample failures and an
    /// unrecoverable VM are reported through [`RunSummary::status`].
    pub async fn run(&mut self, queue: &SampleQueue) -> Result<RunSummary> {
        let run_id = Uuid::new_v4();
        let span = info_span!("run", run_id = %run_id);
        self.run_inner(run_id, queue).instrument(span).await
    }

    async fn run_inner(&mut self, run_id: Uuid, queue: &SampleQueue) -> Result<RunSummary> {
        if !self.config.resume {
            self.store.archive()?;
            self.failures.archive()?;
        }
        self.store.load()?;
        if let Err(e) = self.failures.reconcile(self.store.set()) {
            warn!(
                path = %self.failures.path().display(),
                error = %e,
                "could not reconcile failure log with checkpoint"
            );
        }

        let pending: Vec<&SampleSpec> = queue
            .iter()
            .filter(|spec| !self.store.set().contains(&spec.key()))
            .collect();
        let baseline = queue.len() - pending.len();
        let mut summary = RunSummary::new(run_id, queue.len(), baseline);
        let reporter = ProgressReporter::new(self.config.progress.every, baseline, Utc::now());

        info!(
            total = queue.len(),
            skipped = baseline,
            pending = pending.len(),
            resume = self.config.resume,
            "{}",
            self.config.retry
        );

        for (i, spec) in pending.iter().enumerate() {
            if self.cancel.is_cancelled() {
                info!(
                    remaining = pending.len() - i,
                    "cancelled, leaving remaining samples for the next run"
                );
                summary.status = RunStatus::Cancelled;
                break;
            }

            if let Some(fatal) = self.process(spec, &mut summary).await? {
                error!(fault = %fatal, "VM environment failed, aborting run");
                self.store.flush()?;
                summary.status = RunStatus::Aborted {
                    reason: fatal.to_string(),
                };
                break;
            }

            if reporter.should_emit(summary.processed) {
                reporter.emit(self.store.set(), queue);
            }
        }

        self.store.flush()?;
        reporter.emit(self.store.set(), queue);
        info!(
            status = ?summary.status,
            processed = summary.processed,
            failed = summary.failed,
            "run finished"
        );
        Ok(summary)
    }

    /// Run one sample to a terminal state and commit it. Returns the fault
    /// that should stop the run, if any.
    async fn process(
        &mut self,
        spec: &SampleSpec,
        summary: &mut RunSummary,
    ) -> Result<Option<Fault>> {
        let record = spec.to_record();
        let span = sample_span!(record);
        let pipeline = SamplePipeline::new(&self.backend, &self.config, &self.cancel);
        let report = pipeline.run(record).instrument(span.clone()).await?;
        let _entered = span.enter();

        let mut record = report.record;
        summary.recoveries += report.recoveries;

        if record.status == SampleStatus::Done {
            let payload = std::mem::take(&mut record.payload);
            self.sink
                .accept(&record, &payload)
                .map_err(|source| DetonatorError::FeatureSink {
                    path: record.path.clone(),
                    source,
                })?;
        }

        let entry = FailureLogEntry::from_record(&record);
        let partial = record.partial;
        self.store.commit(record)?;
        summary.processed += 1;

        match entry {
            Some(entry) => {
                summary.failed += 1;
                if let Err(e) = self.failures.record(&entry) {
                    warn!(error = %e, "could not append to failure log");
                    summary.log_write_failures += 1;
                }
            }
            None => {
                summary.succeeded += 1;
                if partial {
                    summary.partial += 1;
                }
            }
        }

        Ok(report.fatal)
    }
}
