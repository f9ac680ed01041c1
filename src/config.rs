//! Configuration for the batch orchestrator.
//!
//! Centralized configuration with defaults matching the standard phase
//! timeout table. Every field may be overridden from a JSON document;
//! anything left out keeps its default.

use crate::core::Phase;
use crate::error::{DetonatorError, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Upper bound accepted for `retry.max_attempts`.
pub const MAX_ATTEMPTS_LIMIT: u32 = 10;

/// Master configuration for a batch run.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DetonatorConfig {
    /// Per-phase deadlines and timeout actions.
    pub phases: PhaseTimeoutTable,
    /// Attempt cap and sample-global deadline.
    pub retry: RetryConfig,
    /// Snapshot used to reset the VM.
    pub recovery: RecoveryConfig,
    /// Guest-side paths and the monitoring window.
    pub guest: GuestConfig,
    /// Progress reporting cadence.
    pub progress: ProgressConfig,
    /// Checkpoint and failure log locations.
    pub storage: StorageConfig,
    /// Continue from an existing checkpoint instead of starting fresh.
    pub resume: bool,
}

impl Default for DetonatorConfig {
    fn default() -> Self {
        Self {
            phases: PhaseTimeoutTable::default(),
            retry: RetryConfig::default(),
            recovery: RecoveryConfig::default(),
            guest: GuestConfig::default(),
            progress: ProgressConfig::default(),
            storage: StorageConfig::default(),
            resume: true,
        }
    }
}

impl DetonatorConfig {
    /// Parse a JSON override document and validate the result.
    pub fn from_json_str(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json)
            .map_err(|e| DetonatorError::InvalidConfig(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_path(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::from_json_str(&text)
    }

    pub fn validate(&self) -> Result<()> {
        for (phase, entry) in self.phases.iter() {
            if entry.timeout_ms == 0 {
                return Err(invalid(format!("phases.{}.timeout_ms must be > 0", phase)));
            }
            if entry.sub_attempts == 0 {
                return Err(invalid(format!(
                    "phases.{}.sub_attempts must be >= 1",
                    phase
                )));
            }
            // nothing is left to continue with once the VM was forced off
            if entry.overrun == OverrunPolicy::ForceStop
                && entry.on_timeout == TimeoutAction::ContinuePartial
            {
                return Err(invalid(format!(
                    "phases.{}: force_stop cannot be combined with continue_partial",
                    phase
                )));
            }
        }
        if self.retry.max_attempts == 0 || self.retry.max_attempts > MAX_ATTEMPTS_LIMIT {
            return Err(invalid(format!(
                "retry.max_attempts must be within 1..={}",
                MAX_ATTEMPTS_LIMIT
            )));
        }
        if self.retry.sample_deadline_ms == 0 {
            return Err(invalid("retry.sample_deadline_ms must be > 0".into()));
        }
        if self.recovery.snapshot.trim().is_empty() {
            return Err(invalid("recovery.snapshot must not be empty".into()));
        }
        if self.recovery.restore_timeout_ms == 0 {
            return Err(invalid("recovery.restore_timeout_ms must be > 0".into()));
        }
        if self.progress.every == 0 {
            return Err(invalid("progress.every must be >= 1".into()));
        }
        Ok(())
    }
}

fn invalid(msg: String) -> DetonatorError {
    DetonatorError::InvalidConfig(msg)
}

/// What the pipeline does when a phase overruns its deadline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TimeoutAction {
    /// Re-enter the phase, subject to the attempt cap
    RetryPhase,
    /// Advance anyway and flag the sample's data as partial
    ContinuePartial,
    /// Fail the sample
    AbortSample,
}

/// What happens to the collaborator call left running after a timeout.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OverrunPolicy {
    /// Let it finish in the background and discard its result
    Background,
    /// Force the VM off so the call cannot keep touching it
    ForceStop,
}

/// Deadline and breach handling for one phase.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PhaseTimeout {
    pub timeout_ms: u64,
    pub on_timeout: TimeoutAction,
    pub overrun: OverrunPolicy,
    /// Tries inside the supervisor before the phase counts as failed once
    pub sub_attempts: u32,
}

impl PhaseTimeout {
    pub fn new(timeout_ms: u64, on_timeout: TimeoutAction) -> Self {
        Self {
            timeout_ms,
            on_timeout,
            overrun: OverrunPolicy::Background,
            sub_attempts: 1,
        }
    }

    pub fn with_overrun(mut self, overrun: OverrunPolicy) -> Self {
        self.overrun = overrun;
        self
    }

    pub fn with_sub_attempts(mut self, sub_attempts: u32) -> Self {
        self.sub_attempts = sub_attempts;
        self
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

/// Ordered phase -> timeout mapping.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "PhaseTableOverrides")]
pub struct PhaseTimeoutTable {
    pub acquiring_vm: PhaseTimeout,
    pub transferring: PhaseTimeout,
    pub executing: PhaseTimeout,
    pub monitoring: PhaseTimeout,
    pub collecting: PhaseTimeout,
}

impl Default for PhaseTimeoutTable {
    fn default() -> Self {
        Self {
            acquiring_vm: PhaseTimeout::new(120_000, TimeoutAction::RetryPhase)
                .with_overrun(OverrunPolicy::ForceStop),
            transferring: PhaseTimeout::new(60_000, TimeoutAction::RetryPhase)
                .with_sub_attempts(3),
            executing: PhaseTimeout::new(45_000, TimeoutAction::ContinuePartial),
            monitoring: PhaseTimeout::new(60_000, TimeoutAction::ContinuePartial),
            collecting: PhaseTimeout::new(90_000, TimeoutAction::ContinuePartial),
        }
    }
}

impl PhaseTimeoutTable {
    pub fn get(&self, phase: Phase) -> &PhaseTimeout {
        match phase {
            Phase::AcquiringVm => &self.acquiring_vm,
            Phase::Transferring => &self.transferring,
            Phase::Executing => &self.executing,
            Phase::Monitoring => &self.monitoring,
            Phase::Collecting => &self.collecting,
        }
    }

    pub fn get_mut(&mut self, phase: Phase) -> &mut PhaseTimeout {
        match phase {
            Phase::AcquiringVm => &mut self.acquiring_vm,
            Phase::Transferring => &mut self.transferring,
            Phase::Executing => &mut self.executing,
            Phase::Monitoring => &mut self.monitoring,
            Phase::Collecting => &mut self.collecting,
        }
    }

    /// Entries in pipeline order.
    pub fn iter(&self) -> impl Iterator<Item = (Phase, &PhaseTimeout)> + '_ {
        Phase::ALL.into_iter().map(move |p| (p, self.get(p)))
    }
}

/// Partial override of one phase entry.
#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
struct PhaseTimeoutOverride {
    timeout_ms: Option<u64>,
    on_timeout: Option<TimeoutAction>,
    overrun: Option<OverrunPolicy>,
    sub_attempts: Option<u32>,
}

impl PhaseTimeoutOverride {
    fn apply(self, base: &mut PhaseTimeout) {
        if let Some(v) = self.timeout_ms {
            base.timeout_ms = v;
        }
        if let Some(v) = self.on_timeout {
            base.on_timeout = v;
        }
        if let Some(v) = self.overrun {
            base.overrun = v;
        }
        if let Some(v) = self.sub_attempts {
            base.sub_attempts = v;
        }
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
struct PhaseTableOverrides {
    acquiring_vm: PhaseTimeoutOverride,
    transferring: PhaseTimeoutOverride,
    executing: PhaseTimeoutOverride,
    monitoring: PhaseTimeoutOverride,
    collecting: PhaseTimeoutOverride,
}

impl From<PhaseTableOverrides> for PhaseTimeoutTable {
    fn from(o: PhaseTableOverrides) -> Self {
        let mut table = PhaseTimeoutTable::default();
        o.acquiring_vm.apply(&mut table.acquiring_vm);
        o.transferring.apply(&mut table.transferring);
        o.executing.apply(&mut table.executing);
        o.monitoring.apply(&mut table.monitoring);
        o.collecting.apply(&mut table.collecting);
        table
    }
}

/// Attempt cap and sample-global deadline.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Total attempts per sample, first try included.
    pub max_attempts: u32,
    /// Wall-clock ceiling across every phase and retry of one sample.
    pub sample_deadline_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 2,
            sample_deadline_ms: 8 * 60 * 1000,
        }
    }
}

impl RetryConfig {
    pub fn sample_deadline(&self) -> Duration {
        Duration::from_millis(self.sample_deadline_ms)
    }
}

impl fmt::Display for RetryConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Budget: {} attempts, {}s per sample",
            self.max_attempts,
            self.sample_deadline().as_secs()
        )
    }
}

/// VM snapshot restore settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RecoveryConfig {
    /// Name of the clean snapshot restored between samples.
    pub snapshot: String,
    pub restore_timeout_ms: u64,
}

impl Default for RecoveryConfig {
    fn default() -> Self {
        Self {
            snapshot: "clean".to_string(),
            restore_timeout_ms: 120_000,
        }
    }
}

impl RecoveryConfig {
    pub fn restore_timeout(&self) -> Duration {
        Duration::from_millis(self.restore_timeout_ms)
    }
}

/// Guest-side settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct GuestConfig {
    /// Directory inside the guest the sample is copied to.
    pub remote_dir: String,
    /// How long the monitor collects telemetry after execution starts.
    pub monitor_window_ms: u64,
}

impl Default for GuestConfig {
    fn default() -> Self {
        Self {
            remote_dir: r"C:\analysis".to_string(),
            monitor_window_ms: 30_000,
        }
    }
}

impl GuestConfig {
    pub fn monitor_window(&self) -> Duration {
        Duration::from_millis(self.monitor_window_ms)
    }

    /// Guest path for a local sample, keeping its file name.
    pub fn remote_path_for(&self, local: &Path) -> String {
        let name = local
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "sample.bin".to_string());
        let sep = if self.remote_dir.contains('\\') { '\\' } else { '/' };
        format!(
            "{}{}{}",
            self.remote_dir.trim_end_matches(['\\', '/']),
            sep,
            name
        )
    }
}

/// Progress reporting cadence.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProgressConfig {
    /// Emit a progress line every `every` completed samples.
    pub every: usize,
}

impl Default for ProgressConfig {
    fn default() -> Self {
        Self { every: 5 }
    }
}

/// Where run state lives on disk.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub checkpoint_path: PathBuf,
    pub failure_log_path: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            checkpoint_path: PathBuf::from("checkpoint.json"),
            failure_log_path: PathBuf::from("failures.jsonl"),
        }
    }
}
