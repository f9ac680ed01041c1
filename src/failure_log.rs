//! Append-only log of terminal sample failures (JSON Lines).

use crate::checkpoint::CheckpointSet;
use crate::core::{FaultKind, Label, Phase, SampleRecord, SampleStatus};
use crate::error::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fs::{self, OpenOptions};
use std::io::{BufRead, BufReader, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use tracing::{info, warn};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FailureLogEntry {
    pub path: String,
    pub label: Label,
    pub phase: Option<Phase>,
    pub error_kind: FaultKind,
    pub message: String,
    pub attempt: u32,
    pub timestamp: DateTime<Utc>,
}

impl FailureLogEntry {
    /// Entry for a `Failed` record; `None` for anything else.
    pub fn from_record(record: &SampleRecord) -> Option<Self> {
        if record.status != SampleStatus::Failed {
            return None;
        }
        Some(Self {
            path: record.path.clone(),
            label: record.label,
            phase: record.phase,
            error_kind: record.error_kind.unwrap_or(FaultKind::Internal),
            message: record.error_message.clone().unwrap_or_default(),
            attempt: record.attempts,
            timestamp: record.finished_at.unwrap_or_else(Utc::now),
        })
    }
}

#[derive(Debug, Clone)]
pub struct FailureLog {
    path: PathBuf,
}

impl FailureLog {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append one entry and sync it to disk.
    pub fn record(&self, entry: &FailureLogEntry) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        let mut file = OpenOptions::new()
            .read(true)
            .create(true)
            .append(true)
            .open(&self.path)?;
        let mut line = Vec::new();
        if ends_mid_line(&mut file)? {
            // terminate a line torn by an earlier crash
            line.push(b'\n');
        }
        serde_json::to_writer(&mut line, entry)?;
        line.push(b'\n');
        file.write_all(&line)?;
        file.sync_data()?;
        Ok(())
    }

    /// Move an existing log aside so a fresh run starts with no entries.
    pub fn archive(&self) -> Result<Option<PathBuf>> {
        if !self.path.exists() {
            return Ok(None);
        }
        let name = self
            .path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "failures".to_string());
        let stamp = Utc::now().format("%Y%m%dT%H%M%S%.3f");
        let backup = self.path.with_file_name(format!("{}.{}.bak", name, stamp));
        fs::rename(&self.path, &backup)?;
        info!(backup = %backup.display(), "archived previous failure log");
        Ok(Some(backup))
    }

    /// All readable entries. A line torn by a crash mid-append is skipped.
    pub fn read_all(&self) -> Result<Vec<FailureLogEntry>> {
        let file = match fs::File::open(&self.path) {
            Ok(f) => f,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        let mut entries = Vec::new();
        for (lineno, line) in BufReader::new(file).lines().enumerate() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str(&line) {
                Ok(entry) => entries.push(entry),
                Err(e) => warn!(
                    path = %self.path.display(),
                    line = lineno + 1,
                    error = %e,
                    "skipping unreadable failure log line"
                ),
            }
        }
        Ok(entries)
    }

    /// Append entries for failed checkpoint records the log is missing,
    /// e.g. after a crash between the checkpoint commit and the append.
    pub fn reconcile(&self, set: &CheckpointSet) -> Result<usize> {
        let logged: HashSet<String> = self.read_all()?.into_iter().map(|e| e.path).collect();
        let mut added = 0;
        for entry in set.iter().filter_map(FailureLogEntry::from_record) {
            if !logged.contains(&entry.path) {
                self.record(&entry)?;
                added += 1;
            }
        }
        if added > 0 {
            info!(added, "restored missing failure log entries");
        }
        Ok(added)
    }
}

fn ends_mid_line(file: &mut fs::File) -> Result<bool> {
    let len = file.metadata()?.len();
    if len == 0 {
        return Ok(false);
    }
    let mut last = [0u8; 1];
    file.seek(SeekFrom::Start(len - 1))?;
    file.read_exact(&mut last)?;
    Ok(last[0] != b'\n')
}
