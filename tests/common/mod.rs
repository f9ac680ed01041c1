//! Common test utilities and helpers.
//!
//! `ScriptedVm` is an in-memory `VmBackend`: every call succeeds unless a
//! step was scripted for that sample and phase. Calls are recorded as
//! events (`"copy:s01.exe"`, `"restore"`) so tests can check ordering.

#![allow(dead_code)]

use detonator::vm::{BehaviorBuffer, Session, VmBackend, VmResult, VmState};
use detonator::{
    CancelSignal, DetonatorConfig, Fault, Label, Phase, SampleQueue, SampleSpec, TimeoutAction,
};
use std::collections::{HashMap, VecDeque};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use std::thread;
use std::time::Duration;

/// What a scripted call does instead of succeeding.
#[derive(Debug, Clone)]
pub enum Step {
    Fail(Fault),
    /// Block for the duration, then succeed
    Stall(Duration),
}

#[derive(Default)]
struct Inner {
    current: Option<String>,
    scripts: HashMap<(String, Phase), VecDeque<Step>>,
    acquire: VecDeque<Step>,
    sessions: u32,
    cancel_on_monitor: Option<(String, CancelSignal)>,
}

#[derive(Default)]
pub struct ScriptedVm {
    inner: Mutex<Inner>,
    events: Mutex<Vec<String>>,
    restore_fails: AtomicBool,
    force_stop_delay: Mutex<Option<Duration>>,
}

impl ScriptedVm {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue steps for the next calls of `phase` while `sample` is loaded.
    pub fn script(&self, sample: &str, phase: Phase, steps: impl IntoIterator<Item = Step>) {
        self.inner
            .lock()
            .unwrap()
            .scripts
            .entry((sample.to_string(), phase))
            .or_default()
            .extend(steps);
    }

    pub fn script_acquire(&self, steps: impl IntoIterator<Item = Step>) {
        self.inner.lock().unwrap().acquire.extend(steps);
    }

    /// Trip `signal` while `sample` is being monitored.
    pub fn cancel_during_monitor(&self, sample: &str, signal: CancelSignal) {
        self.inner.lock().unwrap().cancel_on_monitor = Some((sample.to_string(), signal));
    }

    pub fn fail_restores(&self) {
        self.restore_fails.store(true, Ordering::SeqCst);
    }

    /// Make every `force_stop` block for `delay` before succeeding.
    pub fn slow_force_stop(&self, delay: Duration) {
        *self.force_stop_delay.lock().unwrap() = Some(delay);
    }

    pub fn events(&self) -> Vec<String> {
        self.events.lock().unwrap().clone()
    }

    pub fn count(&self, event: &str) -> usize {
        self.events().iter().filter(|e| *e == event).count()
    }

    fn log(&self, event: String) {
        self.events.lock().unwrap().push(event);
    }

    fn current(&self) -> String {
        self.inner
            .lock()
            .unwrap()
            .current
            .clone()
            .unwrap_or_default()
    }

    fn next_step(&self, sample: &str, phase: Phase) -> Option<Step> {
        self.inner
            .lock()
            .unwrap()
            .scripts
            .get_mut(&(sample.to_string(), phase))
            .and_then(|steps| steps.pop_front())
    }

    fn play(step: Option<Step>) -> VmResult<()> {
        match step {
            None => Ok(()),
            Some(Step::Fail(fault)) => Err(fault),
            Some(Step::Stall(d)) => {
                thread::sleep(d);
                Ok(())
            }
        }
    }
}

fn file_name(path: &str) -> String {
    path.rsplit(['\\', '/']).next().unwrap_or(path).to_string()
}

impl VmBackend for ScriptedVm {
    fn acquire(&self) -> VmResult<Session> {
        self.log("acquire".into());
        let step = self.inner.lock().unwrap().acquire.pop_front();
        Self::play(step)?;
        let mut inner = self.inner.lock().unwrap();
        inner.sessions += 1;
        Ok(Session::new(format!("vm-{}", inner.sessions)))
    }

    fn copy_into(&self, _session: &Session, local: &Path, _remote: &str) -> VmResult<()> {
        let name = file_name(&local.to_string_lossy());
        self.inner.lock().unwrap().current = Some(name.clone());
        self.log(format!("copy:{}", name));
        Self::play(self.next_step(&name, Phase::Transferring))
    }

    fn execute(&self, _session: &Session, command: &str) -> VmResult<()> {
        let name = file_name(command);
        self.log(format!("execute:{}", name));
        Self::play(self.next_step(&name, Phase::Executing))
    }

    fn monitor(
        &self,
        _session: &Session,
        _window: Duration,
        buffer: &BehaviorBuffer,
    ) -> VmResult<()> {
        let name = self.current();
        self.log(format!("monitor:{}", name));
        buffer.push(format!("telemetry:{};", name).as_bytes());
        let hook = self.inner.lock().unwrap().cancel_on_monitor.clone();
        if let Some((target, signal)) = hook {
            if target == name {
                signal.cancel();
            }
        }
        Self::play(self.next_step(&name, Phase::Monitoring))
    }

    fn collect(&self, _session: &Session, buffer: &BehaviorBuffer) -> VmResult<()> {
        let name = self.current();
        self.log(format!("collect:{}", name));
        Self::play(self.next_step(&name, Phase::Collecting))?;
        buffer.push(format!("artifacts:{};", name).as_bytes());
        Ok(())
    }

    fn observe_state(&self, _session: &Session) -> VmState {
        VmState::Running
    }

    fn restore_snapshot(&self, _session: &Session, name: &str) -> VmResult<()> {
        self.log("restore".into());
        if self.restore_fails.load(Ordering::SeqCst) {
            return Err(Fault::new(
                detonator::FaultKind::FatalEnvironment,
                format!("snapshot {} not found", name),
            ));
        }
        self.inner.lock().unwrap().current = None;
        Ok(())
    }

    fn release(&self, _session: &Session) {
        self.log("release".into());
    }

    fn force_stop(&self) -> VmResult<()> {
        self.log("force_stop".into());
        let delay = *self.force_stop_delay.lock().unwrap();
        if let Some(d) = delay {
            thread::sleep(d);
        }
        Ok(())
    }
}

/// Sample directory with `n` files named `s01.exe`, `s02.exe`, ...
pub struct Workspace {
    pub dir: tempfile::TempDir,
}

impl Workspace {
    pub fn new() -> Self {
        Self {
            dir: tempfile::TempDir::new().unwrap(),
        }
    }

    pub fn path(&self) -> &Path {
        self.dir.path()
    }

    pub fn checkpoint_path(&self) -> PathBuf {
        self.path().join("state/checkpoint.json")
    }

    pub fn failure_log_path(&self) -> PathBuf {
        self.path().join("state/failures.jsonl")
    }

    pub fn queue(&self, n: usize) -> SampleQueue {
        let samples = self.path().join("samples");
        fs::create_dir_all(&samples).unwrap();
        (1..=n)
            .map(|i| {
                let path = samples.join(sample_name(i));
                fs::write(&path, format!("MZ sample {}", i)).unwrap();
                let label = if i % 2 == 0 {
                    Label::Benign
                } else {
                    Label::Malware
                };
                SampleSpec::new(path, label)
            })
            .collect()
    }

    /// Millisecond-scale deadlines pointed at this workspace.
    pub fn config(&self) -> DetonatorConfig {
        let mut config = DetonatorConfig::default();
        for phase in Phase::ALL {
            config.phases.get_mut(phase).timeout_ms = 300;
        }
        config.phases.executing.on_timeout = TimeoutAction::ContinuePartial;
        config.retry.sample_deadline_ms = 5_000;
        config.recovery.restore_timeout_ms = 300;
        config.guest.monitor_window_ms = 10;
        config.progress.every = 2;
        config.storage.checkpoint_path = self.checkpoint_path();
        config.storage.failure_log_path = self.failure_log_path();
        config
    }
}

pub fn sample_name(i: usize) -> String {
    format!("s{:02}.exe", i)
}

/// Queue key of sample `i` in `ws`.
pub fn sample_key(ws: &Workspace, i: usize) -> String {
    ws.path()
        .join("samples")
        .join(sample_name(i))
        .to_string_lossy()
        .into_owned()
}
