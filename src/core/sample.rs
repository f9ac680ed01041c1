//! Sample records: the unit of work the orchestrator drives.

use super::fault::{Fault, FaultKind};
use super::phase::{Phase, SampleStatus};
use crate::error::{DetonatorError, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Ground-truth label of a sample.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Label {
    Malware,
    Benign,
}

impl fmt::Display for Label {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Label::Malware => write!(f, "malware"),
            Label::Benign => write!(f, "benign"),
        }
    }
}

/// How much behavioral data a sample produced.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DataPresence {
    Full,
    Partial,
    #[default]
    #[serde(rename = "none")]
    Empty,
}

/// One sample's journey through the pipeline.
///
/// Also the on-disk checkpoint record; `payload` is handed to the feature
/// sink and never persisted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SampleRecord {
    /// Sample path, the unique key
    pub path: String,
    pub label: Label,
    /// Hex SHA-256 of the sample file, when it could be read
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sha256: Option<String>,
    pub status: SampleStatus,
    pub attempts: u32,
    /// Phase at which the last attempt stopped
    #[serde(default)]
    pub phase: Option<Phase>,
    #[serde(default)]
    pub error_kind: Option<FaultKind>,
    #[serde(default)]
    pub error_message: Option<String>,
    /// Set when a phase was cut short and the pipeline moved on anyway
    #[serde(default)]
    pub partial: bool,
    #[serde(default)]
    pub data: DataPresence,
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub finished_at: Option<DateTime<Utc>>,
    #[serde(skip)]
    pub payload: Vec<u8>,
}

impl SampleRecord {
    pub fn new(path: impl Into<String>, label: Label) -> Self {
        Self {
            path: path.into(),
            label,
            sha256: None,
            status: SampleStatus::Queued,
            attempts: 0,
            phase: None,
            error_kind: None,
            error_message: None,
            partial: false,
            data: DataPresence::Empty,
            started_at: None,
            finished_at: None,
            payload: Vec::new(),
        }
    }

    pub fn with_sha256(mut self, digest: impl Into<String>) -> Self {
        self.sha256 = Some(digest.into());
        self
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    fn ensure_open(&self) -> Result<()> {
        if self.is_terminal() {
            return Err(DetonatorError::AlreadyTerminal(self.path.clone()));
        }
        Ok(())
    }

    /// Count a new attempt at this sample. Fails once `cap` is reached.
    pub fn start_attempt(&mut self, cap: u32) -> Result<u32> {
        self.ensure_open()?;
        if self.attempts >= cap {
            return Err(DetonatorError::Internal(format!(
                "{} would exceed the attempt cap of {}",
                self.path, cap
            )));
        }
        self.attempts += 1;
        if self.started_at.is_none() {
            self.started_at = Some(Utc::now());
        }
        Ok(self.attempts)
    }

    /// Enter a phase.
    pub fn enter(&mut self, phase: Phase) -> Result<()> {
        self.ensure_open()?;
        self.status = phase.into();
        self.phase = Some(phase);
        Ok(())
    }

    /// Remember the most recent fault without leaving the current state.
    pub fn note_fault(&mut self, fault: &Fault) -> Result<()> {
        self.ensure_open()?;
        self.error_kind = Some(fault.kind);
        self.error_message = Some(fault.message.clone());
        Ok(())
    }

    pub fn mark_partial(&mut self) -> Result<()> {
        self.ensure_open()?;
        self.partial = true;
        Ok(())
    }

    /// Forget the partial flag of an attempt whose data was thrown away.
    pub fn reset_partial(&mut self) -> Result<()> {
        self.ensure_open()?;
        self.partial = false;
        Ok(())
    }

    /// Terminal success.
    pub fn complete(&mut self, data: DataPresence, payload: Vec<u8>) -> Result<()> {
        self.ensure_open()?;
        self.data = data;
        if data == DataPresence::Partial {
            self.partial = true;
        }
        self.payload = payload;
        self.status = SampleStatus::Done;
        self.finished_at = Some(Utc::now());
        Ok(())
    }

    /// Terminal failure; `fault` becomes the recorded cause.
    pub fn fail(&mut self, fault: &Fault) -> Result<()> {
        self.note_fault(fault)?;
        self.status = SampleStatus::Failed;
        self.finished_at = Some(Utc::now());
        Ok(())
    }
}
