//! Per-sample state machine.
//!
//! `Queued -> AcquiringVM -> Transferring -> Executing -> Monitoring ->
//! Collecting -> {Done | Failed}`. Every phase runs under the supervisor
//! with its configured deadline, clamped to the sample-global budget. What
//! happens after a failed phase depends on whether it timed out (the phase
//! table decides) or returned a fault (the fault taxonomy decides).
//!
//! Whatever the verdict, the VM is reset to its clean snapshot before the
//! pipeline returns, so the next sample starts from a known state.

use crate::cancel::CancelSignal;
use crate::config::{DetonatorConfig, OverrunPolicy, TimeoutAction};
use crate::core::{DataPresence, Disposition, Fault, FaultKind, Phase, SampleRecord};
use crate::error::Result;
use crate::supervisor::{run_bounded, supervise, Bounded, PhaseDeadline, SampleClock};
use crate::vm::{BehaviorBuffer, Session, VmBackend, VmState};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// Terminal record plus what the run needs to know about the VM.
#[derive(Debug)]
pub struct PipelineReport {
    pub record: SampleRecord,
    /// Snapshot restores performed, the final reset included
    pub recoveries: u32,
    /// Set when the VM could not be recovered; the run must stop
    pub fatal: Option<Fault>,
}

#[derive(Debug)]
enum Verdict {
    Done,
    Failed(Fault),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Decision {
    Advance,
    Retry,
    Fail,
    Abort,
}

pub struct SamplePipeline<'a, B: VmBackend> {
    backend: &'a Arc<B>,
    config: &'a DetonatorConfig,
    cancel: &'a CancelSignal,
}

impl<'a, B: VmBackend> SamplePipeline<'a, B> {
    pub fn new(backend: &'a Arc<B>, config: &'a DetonatorConfig, cancel: &'a CancelSignal) -> Self {
        Self {
            backend,
            config,
            cancel,
        }
    }

    /// Drive `record` to `Done` or `Failed`.
    pub async fn run(&self, mut record: SampleRecord) -> Result<PipelineReport> {
        let cap = self.config.retry.max_attempts;
        let clock = SampleClock::start(self.config.retry.sample_deadline());
        let buffer = BehaviorBuffer::new();
        let mut session: Option<Session> = None;
        let mut recoveries = 0;
        let mut fatal: Option<Fault> = None;
        // sessions abandoned after a forced shutdown, released once terminal
        let mut stale: Vec<Session> = Vec::new();
        let mut cancel_seen = false;
        let mut phase = Phase::AcquiringVm;

        record.start_attempt(cap)?;
        info!(attempt = record.attempts, "sample started");

        let verdict = loop {
            if !cancel_seen && self.cancel.is_cancelled() {
                cancel_seen = true;
                info!(phase = %phase, "cancellation observed, finishing sample first");
            }
            if clock.expired() {
                break Verdict::Failed(clock.deadline_fault());
            }

            record.enter(phase)?;
            let fault = match self
                .run_phase(phase, &mut session, &record, &buffer, &clock)
                .await
            {
                Ok(()) => match phase.next() {
                    Some(next) => {
                        phase = next;
                        continue;
                    }
                    None => break Verdict::Done,
                },
                Err(fault) => fault,
            };

            record.note_fault(&fault)?;
            warn!(phase = %phase, attempt = record.attempts, fault = %fault, "phase failed");

            if fault.timed_out && self.config.phases.get(phase).overrun == OverrunPolicy::ForceStop
            {
                let (limit, _) = clock.clamp(self.restore_limit());
                if !limit.is_zero() {
                    self.force_stop(limit).await;
                }
                stale.extend(session.take());
                if clock.expired() {
                    // the end-of-sample cleanup finishes the shutdown
                    break Verdict::Failed(clock.deadline_fault());
                }
            }

            let mut decision = self.decide(phase, &fault);
            if phase == Phase::Collecting {
                decision = collecting_decision(decision, &fault, &buffer);
            }

            match decision {
                Decision::Advance => {
                    record.mark_partial()?;
                    match phase.next() {
                        Some(next) => phase = next,
                        None => break Verdict::Done,
                    }
                }
                Decision::Retry => {
                    if record.attempts >= cap {
                        break Verdict::Failed(fault);
                    }
                    let mut restart = phase;
                    let unresponsive = fault.requires_recovery()
                        || self.vm_unresponsive(&session, &clock).await;
                    if clock.expired() {
                        break Verdict::Failed(clock.deadline_fault());
                    }
                    if unresponsive {
                        match self.recover(&session, &clock).await {
                            Ok(()) => {
                                recoveries += 1;
                                // the restore discarded the transferred sample
                                restart = restart.min(Phase::Transferring);
                            }
                            Err(f) if f.kind == FaultKind::SampleDeadline => {
                                break Verdict::Failed(f)
                            }
                            Err(f) => {
                                fatal = Some(f.clone());
                                break Verdict::Failed(f);
                            }
                        }
                    }
                    if session.is_none() {
                        restart = Phase::AcquiringVm;
                    }
                    if restart <= Phase::Executing {
                        buffer.take();
                        record.reset_partial()?;
                    }
                    if clock.expired() {
                        break Verdict::Failed(clock.deadline_fault());
                    }
                    record.start_attempt(cap)?;
                    info!(
                        attempt = record.attempts,
                        from = %restart,
                        "retrying sample"
                    );
                    phase = restart;
                }
                Decision::Fail => break Verdict::Failed(fault),
                Decision::Abort => {
                    fatal = Some(fault.clone());
                    break Verdict::Failed(fault);
                }
            }
        };

        match verdict {
            Verdict::Done => {
                let data = if buffer.is_empty() {
                    DataPresence::Empty
                } else if record.partial {
                    DataPresence::Partial
                } else {
                    DataPresence::Full
                };
                record.complete(data, buffer.take())?;
                info!(
                    attempts = record.attempts,
                    partial = record.partial,
                    elapsed_ms = clock.elapsed().as_millis() as u64,
                    "sample done"
                );
            }
            Verdict::Failed(fault) => {
                record.fail(&fault)?;
                warn!(
                    attempts = record.attempts,
                    phase = ?record.phase,
                    fault = %fault,
                    "sample failed"
                );
            }
        }

        for s in stale {
            self.release(s).await;
        }
        match (session.take(), fatal.is_some()) {
            // the snapshot already refused to restore once
            (Some(s), true) => self.release(s).await,
            (Some(s), false) => match self.reset(s).await {
                Ok(()) => recoveries += 1,
                Err(f) => {
                    error!(fault = %f, "VM reset failed");
                    fatal = Some(f);
                }
            },
            (None, _) => {
                // acquisition never completed; make sure nothing half-started lingers
                self.force_stop(self.restore_limit()).await;
            }
        }

        Ok(PipelineReport {
            record,
            recoveries,
            fatal,
        })
    }

    fn decide(&self, phase: Phase, fault: &Fault) -> Decision {
        if fault.is_fatal() {
            return Decision::Abort;
        }
        if fault.kind == FaultKind::SampleDeadline {
            return Decision::Fail;
        }
        if fault.timed_out {
            return match self.config.phases.get(phase).on_timeout {
                TimeoutAction::RetryPhase => Decision::Retry,
                TimeoutAction::ContinuePartial => Decision::Advance,
                TimeoutAction::AbortSample => Decision::Fail,
            };
        }
        match fault.kind.disposition() {
            Disposition::Retry | Disposition::Recover if fault.retryable => Decision::Retry,
            Disposition::Absorb => Decision::Advance,
            Disposition::Abort => Decision::Abort,
            _ => Decision::Fail,
        }
    }

    async fn run_phase(
        &self,
        phase: Phase,
        session: &mut Option<Session>,
        record: &SampleRecord,
        buffer: &BehaviorBuffer,
        clock: &SampleClock,
    ) -> std::result::Result<(), Fault> {
        let deadline = PhaseDeadline::from_config(phase, self.config.phases.get(phase));
        let backend = self.backend.clone();

        if phase == Phase::AcquiringVm {
            if session.is_some() {
                return Ok(());
            }
            let acquired = supervise(&deadline, clock, || {
                let backend = backend.clone();
                move || backend.acquire()
            })
            .await
            .into_result()?;
            debug!(session = %acquired, "VM acquired");
            *session = Some(acquired);
            return Ok(());
        }

        let s = session.clone().ok_or_else(|| {
            Fault::terminal(
                FaultKind::Internal,
                format!("{} entered without a VM session", phase),
            )
        })?;
        let local = PathBuf::from(&record.path);
        let remote = self.config.guest.remote_path_for(&local);

        match phase {
            Phase::Transferring => supervise(&deadline, clock, || {
                let (backend, s, local, remote) =
                    (backend.clone(), s.clone(), local.clone(), remote.clone());
                move || backend.copy_into(&s, &local, &remote)
            })
            .await
            .into_result(),
            Phase::Executing => supervise(&deadline, clock, || {
                let (backend, s, remote) = (backend.clone(), s.clone(), remote.clone());
                move || backend.execute(&s, &remote)
            })
            .await
            .into_result(),
            Phase::Monitoring => {
                let window = self.config.guest.monitor_window();
                supervise(&deadline, clock, || {
                    let (backend, s, buffer) = (backend.clone(), s.clone(), buffer.clone());
                    move || backend.monitor(&s, window, &buffer)
                })
                .await
                .into_result()
            }
            Phase::Collecting => supervise(&deadline, clock, || {
                let (backend, s, buffer) = (backend.clone(), s.clone(), buffer.clone());
                move || backend.collect(&s, &buffer)
            })
            .await
            .into_result(),
            Phase::AcquiringVm => Ok(()),
        }
    }

    fn restore_limit(&self) -> Duration {
        self.config.recovery.restore_timeout()
    }

    async fn vm_unresponsive(&self, session: &Option<Session>, clock: &SampleClock) -> bool {
        let Some(s) = session.clone() else {
            return false;
        };
        let (limit, _) = clock.clamp(self.restore_limit());
        if limit.is_zero() {
            return false;
        }
        let backend = self.backend.clone();
        match run_bounded("observe_state", limit, move || backend.observe_state(&s)).await {
            Bounded::Completed(state) => state == VmState::Unresponsive,
            Bounded::TimedOut | Bounded::Panicked(_) => true,
        }
    }

    /// Restore the clean snapshot mid-sample, within the sample budget.
    async fn recover(
        &self,
        session: &Option<Session>,
        clock: &SampleClock,
    ) -> std::result::Result<(), Fault> {
        let (limit, clamped) = clock.clamp(self.restore_limit());
        if limit.is_zero() {
            return Err(clock.deadline_fault());
        }
        let Some(s) = session.clone() else {
            self.force_stop(limit).await;
            return Ok(());
        };
        info!(snapshot = %self.config.recovery.snapshot, "recovering VM");
        match self.restore(s, limit).await {
            Err(f) if clamped && f.timed_out => Err(clock.deadline_fault()),
            other => other,
        }
    }

    /// End-of-sample reset: restore the snapshot, then release the session.
    async fn reset(&self, session: Session) -> std::result::Result<(), Fault> {
        let restored = self.restore(session.clone(), self.restore_limit()).await;
        self.release(session).await;
        restored
    }

    async fn restore(&self, session: Session, limit: Duration) -> std::result::Result<(), Fault> {
        let backend = self.backend.clone();
        let snapshot = self.config.recovery.snapshot.clone();
        let outcome = run_bounded("restore_snapshot", limit, move || {
            backend.restore_snapshot(&session, &snapshot)
        })
        .await;
        match outcome {
            Bounded::Completed(Ok(())) => Ok(()),
            Bounded::Completed(Err(f)) => Err(Fault::terminal(
                FaultKind::FatalEnvironment,
                format!("snapshot restore failed: {}", f.message),
            )),
            Bounded::TimedOut => Err(Fault {
                timed_out: true,
                ..Fault::terminal(
                    FaultKind::FatalEnvironment,
                    format!("snapshot restore timed out after {}ms", limit.as_millis()),
                )
            }),
            Bounded::Panicked(msg) => Err(Fault::terminal(
                FaultKind::FatalEnvironment,
                format!("snapshot restore panicked: {}", msg),
            )),
        }
    }

    async fn release(&self, session: Session) {
        let backend = self.backend.clone();
        if let Bounded::TimedOut = run_bounded("release", self.restore_limit(), move || {
            backend.release(&session)
        })
        .await
        {
            warn!("VM release did not return in time");
        }
    }

    async fn force_stop(&self, limit: Duration) {
        let backend = self.backend.clone();
        match run_bounded("force_stop", limit, move || backend.force_stop()).await {
            Bounded::Completed(Ok(())) => {}
            Bounded::Completed(Err(f)) => warn!(fault = %f, "forced VM shutdown failed"),
            Bounded::TimedOut | Bounded::Panicked(_) => {
                warn!("forced VM shutdown did not complete")
            }
        }
    }
}

/// A failing `Collecting` phase still ends in `Done` when any behavioral
/// data made it out of the guest.
fn collecting_decision(decision: Decision, fault: &Fault, buffer: &BehaviorBuffer) -> Decision {
    match decision {
        Decision::Abort => Decision::Abort,
        _ if fault.kind == FaultKind::SampleDeadline => Decision::Fail,
        _ if !buffer.is_empty() => Decision::Advance,
        Decision::Retry => Decision::Retry,
        _ => Decision::Fail,
    }
}
