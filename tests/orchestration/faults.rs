use crate::common::{sample_key, ScriptedVm, Step, Workspace};
use detonator::{
    CheckpointStore, DataPresence, DetonatorError, Fault, FaultKind, Orchestrator, Phase,
    RunStatus, SampleRecord, SampleStatus,
};
use std::fs;
use std::sync::Arc;
use std::time::{Duration, Instant};

#[tokio::test]
async fn attempts_never_exceed_cap() {
    let ws = Workspace::new();
    let queue = ws.queue(1);
    let vm = Arc::new(ScriptedVm::new());
    vm.script(
        "s01.exe",
        Phase::Executing,
        (0..6).map(|_| Step::Fail(Fault::new(FaultKind::Execution, "crashed"))),
    );
    let mut config = ws.config();
    config.retry.max_attempts = 3;

    let mut orch = Orchestrator::new(config, vm.clone()).unwrap();
    orch.run(&queue).await.unwrap();

    let record = orch.checkpoint().set().get(&sample_key(&ws, 1)).unwrap();
    assert_eq!(record.status, SampleStatus::Failed);
    assert_eq!(record.attempts, 3);
    assert_eq!(vm.count("execute:s01.exe"), 3);
}

#[tokio::test]
async fn non_retryable_fault_fails_first_time() {
    let ws = Workspace::new();
    let queue = ws.queue(2);
    let vm = Arc::new(ScriptedVm::new());
    vm.script(
        "s01.exe",
        Phase::Transferring,
        [Step::Fail(Fault::terminal(
            FaultKind::Transfer,
            "permission denied",
        ))],
    );

    let mut orch = Orchestrator::new(ws.config(), vm.clone()).unwrap();
    let summary = orch.run(&queue).await.unwrap();

    assert_eq!(summary.failed, 1);
    assert_eq!(summary.succeeded, 1);
    let record = orch.checkpoint().set().get(&sample_key(&ws, 1)).unwrap();
    assert_eq!(record.attempts, 1);
    assert_eq!(record.phase, Some(Phase::Transferring));
    // transfer sub-attempts are only spent on transient faults
    assert_eq!(vm.count("copy:s01.exe"), 1);
}

#[tokio::test]
async fn transfer_hiccups_absorbed_within_phase() {
    let ws = Workspace::new();
    let queue = ws.queue(1);
    let vm = Arc::new(ScriptedVm::new());
    vm.script(
        "s01.exe",
        Phase::Transferring,
        (0..2).map(|_| Step::Fail(Fault::new(FaultKind::Transfer, "share busy"))),
    );
    let mut config = ws.config();
    config.phases.transferring.sub_attempts = 3;

    let mut orch = Orchestrator::new(config, vm.clone()).unwrap();
    orch.run(&queue).await.unwrap();

    let record = orch.checkpoint().set().get(&sample_key(&ws, 1)).unwrap();
    assert_eq!(record.status, SampleStatus::Done);
    assert_eq!(record.attempts, 1);
    assert_eq!(vm.count("copy:s01.exe"), 3);
}

#[tokio::test]
async fn sample_deadline_cuts_phase_short() {
    let ws = Workspace::new();
    let queue = ws.queue(2);
    let vm = Arc::new(ScriptedVm::new());
    vm.script(
        "s01.exe",
        Phase::Executing,
        [Step::Stall(Duration::from_millis(1500))],
    );
    let mut config = ws.config();
    config.phases.executing.timeout_ms = 5_000;
    config.retry.sample_deadline_ms = 200;

    let started = Instant::now();
    let mut orch = Orchestrator::new(config, vm.clone()).unwrap();
    let summary = orch.run(&queue).await.unwrap();

    assert!(started.elapsed() < Duration::from_millis(1200));
    assert_eq!(summary.status, RunStatus::Completed);
    let record = orch.checkpoint().set().get(&sample_key(&ws, 1)).unwrap();
    assert_eq!(record.status, SampleStatus::Failed);
    assert_eq!(record.error_kind, Some(FaultKind::SampleDeadline));
    assert_eq!(record.attempts, 1);

    let next = orch.checkpoint().set().get(&sample_key(&ws, 2)).unwrap();
    assert_eq!(next.status, SampleStatus::Done);
}

#[tokio::test]
async fn executing_timeout_continues_with_partial_data() {
    let ws = Workspace::new();
    let queue = ws.queue(1);
    let vm = Arc::new(ScriptedVm::new());
    vm.script(
        "s01.exe",
        Phase::Executing,
        [Step::Stall(Duration::from_millis(700))],
    );

    let mut orch = Orchestrator::new(ws.config(), vm.clone()).unwrap();
    orch.run(&queue).await.unwrap();

    let record = orch.checkpoint().set().get(&sample_key(&ws, 1)).unwrap();
    assert_eq!(record.status, SampleStatus::Done);
    assert!(record.partial);
    assert_eq!(record.data, DataPresence::Partial);
    assert_eq!(vm.count("monitor:s01.exe"), 1);
}

#[tokio::test]
async fn monitoring_error_is_absorbed() {
    let ws = Workspace::new();
    let queue = ws.queue(1);
    let vm = Arc::new(ScriptedVm::new());
    vm.script(
        "s01.exe",
        Phase::Monitoring,
        [Step::Fail(Fault::new(
            FaultKind::MonitoringIncomplete,
            "procmon log truncated",
        ))],
    );

    let mut orch = Orchestrator::new(ws.config(), vm.clone()).unwrap();
    orch.run(&queue).await.unwrap();

    let record = orch.checkpoint().set().get(&sample_key(&ws, 1)).unwrap();
    assert_eq!(record.status, SampleStatus::Done);
    assert_eq!(record.attempts, 1);
    assert!(record.partial);
    assert_eq!(vm.count("collect:s01.exe"), 1);
}

#[tokio::test]
async fn acquisition_overrun_forces_vm_off_and_retries() {
    let ws = Workspace::new();
    let queue = ws.queue(1);
    let vm = Arc::new(ScriptedVm::new());
    vm.script_acquire([Step::Stall(Duration::from_millis(700))]);

    let mut orch = Orchestrator::new(ws.config(), vm.clone()).unwrap();
    orch.run(&queue).await.unwrap();

    let record = orch.checkpoint().set().get(&sample_key(&ws, 1)).unwrap();
    assert_eq!(record.status, SampleStatus::Done);
    assert_eq!(record.attempts, 2);

    let events = vm.events();
    let stop = events.iter().position(|e| e == "force_stop").unwrap();
    let copy = events.iter().position(|e| e == "copy:s01.exe").unwrap();
    assert!(stop < copy);
    assert!(events[..copy].iter().filter(|e| *e == "acquire").count() >= 2);
}

#[tokio::test]
async fn slow_forced_shutdown_stays_within_sample_deadline() {
    let ws = Workspace::new();
    let queue = ws.queue(1);
    let vm = Arc::new(ScriptedVm::new());
    vm.script_acquire([Step::Stall(Duration::from_millis(2000))]);
    vm.slow_force_stop(Duration::from_millis(1500));
    let mut config = ws.config();
    config.phases.acquiring_vm.timeout_ms = 200;
    config.retry.sample_deadline_ms = 400;
    config.recovery.restore_timeout_ms = 5_000;

    let mut orch = Orchestrator::new(config, vm.clone()).unwrap();
    orch.run(&queue).await.unwrap();

    let record = orch.checkpoint().set().get(&sample_key(&ws, 1)).unwrap();
    assert_eq!(record.status, SampleStatus::Failed);
    assert_eq!(record.error_kind, Some(FaultKind::SampleDeadline));
    let elapsed = record.finished_at.unwrap() - record.started_at.unwrap();
    assert!(
        elapsed < chrono::Duration::milliseconds(700),
        "terminal after {}ms",
        elapsed.num_milliseconds()
    );
    // the interrupted shutdown is completed after the terminal transition
    assert!(vm.count("force_stop") >= 2);
}

#[tokio::test]
async fn unresponsive_vm_is_restored_before_retry() {
    let ws = Workspace::new();
    let queue = ws.queue(1);
    let vm = Arc::new(ScriptedVm::new());
    vm.script(
        "s01.exe",
        Phase::Executing,
        [Step::Fail(Fault::new(
            FaultKind::VmUnresponsive,
            "guest agent stopped answering",
        ))],
    );

    let mut orch = Orchestrator::new(ws.config(), vm.clone()).unwrap();
    let summary = orch.run(&queue).await.unwrap();

    let record = orch.checkpoint().set().get(&sample_key(&ws, 1)).unwrap();
    assert_eq!(record.status, SampleStatus::Done);
    assert_eq!(record.attempts, 2);
    // restore wiped the guest, so the sample is copied again
    assert_eq!(vm.count("copy:s01.exe"), 2);
    assert_eq!(vm.count("restore"), 2);
    assert_eq!(summary.recoveries, 2);

    let events = vm.events();
    let first_exec = events.iter().position(|e| e == "execute:s01.exe").unwrap();
    let second_copy = events.iter().rposition(|e| e == "copy:s01.exe").unwrap();
    assert!(events[first_exec..second_copy].iter().any(|e| e == "restore"));
}

#[tokio::test]
async fn failed_restore_aborts_after_commit() {
    let ws = Workspace::new();
    let queue = ws.queue(3);
    let vm = Arc::new(ScriptedVm::new());
    vm.script(
        "s01.exe",
        Phase::Executing,
        [Step::Fail(Fault::new(FaultKind::VmUnresponsive, "hung"))],
    );
    vm.fail_restores();

    let mut orch = Orchestrator::new(ws.config(), vm.clone()).unwrap();
    let summary = orch.run(&queue).await.unwrap();

    assert!(matches!(summary.status, RunStatus::Aborted { .. }));
    assert_eq!(summary.exit_code(), 2);
    assert_eq!(summary.processed, 1);
    assert_eq!(vm.count("copy:s02.exe"), 0);

    let on_disk = CheckpointStore::open(ws.checkpoint_path()).unwrap();
    assert_eq!(on_disk.set().len(), 1);
    let record = on_disk.set().get(&sample_key(&ws, 1)).unwrap();
    assert_eq!(record.status, SampleStatus::Failed);
    assert_eq!(record.error_kind, Some(FaultKind::FatalEnvironment));

    let entries = orch.failure_log().read_all().unwrap();
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].error_kind, FaultKind::FatalEnvironment);
}

#[tokio::test]
async fn failed_reset_after_success_aborts_run() {
    let ws = Workspace::new();
    let queue = ws.queue(2);
    let vm = Arc::new(ScriptedVm::new());
    vm.fail_restores();

    let mut orch = Orchestrator::new(ws.config(), vm.clone()).unwrap();
    let summary = orch.run(&queue).await.unwrap();

    assert!(matches!(summary.status, RunStatus::Aborted { .. }));
    assert_eq!(summary.succeeded, 1);
    let record = orch.checkpoint().set().get(&sample_key(&ws, 1)).unwrap();
    assert_eq!(record.status, SampleStatus::Done);
    assert!(orch.checkpoint().set().get(&sample_key(&ws, 2)).is_none());
}

#[tokio::test]
async fn unwritable_failure_log_does_not_stop_run() {
    let ws = Workspace::new();
    let queue = ws.queue(3);
    let vm = Arc::new(ScriptedVm::new());
    vm.script(
        "s02.exe",
        Phase::Transferring,
        [Step::Fail(Fault::terminal(FaultKind::Transfer, "denied"))],
    );
    let config = ws.config();
    // a directory where the log file should be
    fs::create_dir_all(&config.storage.failure_log_path).unwrap();

    let mut orch = Orchestrator::new(config, vm).unwrap();
    let summary = orch.run(&queue).await.unwrap();

    assert_eq!(summary.status, RunStatus::Completed);
    assert_eq!(summary.log_write_failures, 1);
    assert_eq!(summary.processed, 3);
    let record = orch.checkpoint().set().get(&sample_key(&ws, 2)).unwrap();
    assert_eq!(record.status, SampleStatus::Failed);
}

#[tokio::test]
async fn rejected_payload_stops_run_uncommitted() {
    let ws = Workspace::new();
    let queue = ws.queue(3);
    let vm = Arc::new(ScriptedVm::new());
    let sink = |record: &SampleRecord, _: &[u8]| -> anyhow::Result<()> {
        if record.path.ends_with("s02.exe") {
            anyhow::bail!("feature store offline");
        }
        Ok(())
    };

    let mut orch = Orchestrator::new(ws.config(), vm)
        .unwrap()
        .with_feature_sink(sink);
    let err = orch.run(&queue).await.unwrap_err();

    assert!(matches!(err, DetonatorError::FeatureSink { .. }));
    let on_disk = CheckpointStore::open(ws.checkpoint_path()).unwrap();
    assert_eq!(on_disk.set().len(), 1);
    assert!(!on_disk.set().contains(&sample_key(&ws, 2)));
}

#[tokio::test]
async fn invalid_config_rejected_up_front() {
    let ws = Workspace::new();
    let mut config = ws.config();
    config.retry.max_attempts = 0;
    let err = Orchestrator::new(config, Arc::new(ScriptedVm::new())).err();
    assert!(matches!(err, Some(DetonatorError::InvalidConfig(_))));
}
