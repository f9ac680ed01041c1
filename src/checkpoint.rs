//! Durable record of samples that reached a terminal state.
//!
//! The checkpoint file is the single source of truth for "already
//! processed". Every commit rewrites the full document to a temporary
//! sibling and renames it into place, so an interrupted write leaves either
//! the old file or the new one, never a torn one.

use crate::core::{SampleRecord, SampleStatus};
use crate::error::{DetonatorError, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// On-disk format version.
pub const CHECKPOINT_VERSION: u32 = 1;

#[derive(Debug, Serialize, Deserialize)]
struct CheckpointDocument {
    version: u32,
    #[serde(default)]
    updated_at: Option<DateTime<Utc>>,
    records: Vec<SampleRecord>,
}

/// Terminal sample outcomes in commit order.
#[derive(Debug, Clone, Default)]
pub struct CheckpointSet {
    records: Vec<SampleRecord>,
    index: HashMap<String, usize>,
}

impl PartialEq for CheckpointSet {
    fn eq(&self, other: &Self) -> bool {
        self.records == other.records
    }
}

impl CheckpointSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn contains(&self, path: &str) -> bool {
        self.index.contains_key(path)
    }

    pub fn get(&self, path: &str) -> Option<&SampleRecord> {
        self.index.get(path).map(|&i| &self.records[i])
    }

    pub fn iter(&self) -> impl Iterator<Item = &SampleRecord> {
        self.records.iter()
    }

    pub fn records(&self) -> &[SampleRecord] {
        &self.records
    }

    pub fn succeeded(&self) -> usize {
        self.count(SampleStatus::Done)
    }

    pub fn failed(&self) -> usize {
        self.count(SampleStatus::Failed)
    }

    fn count(&self, status: SampleStatus) -> usize {
        self.records.iter().filter(|r| r.status == status).count()
    }

    /// Add a terminal record. Duplicates and in-flight records are refused.
    pub fn insert(&mut self, record: SampleRecord) -> Result<()> {
        if !record.is_terminal() {
            return Err(DetonatorError::NotTerminal {
                path: record.path,
                status: record.status.to_string(),
            });
        }
        if self.contains(&record.path) {
            return Err(DetonatorError::DuplicateCheckpoint(record.path));
        }
        self.index.insert(record.path.clone(), self.records.len());
        self.records.push(record);
        Ok(())
    }

    fn pop(&mut self) -> Option<SampleRecord> {
        let record = self.records.pop()?;
        self.index.remove(&record.path);
        Some(record)
    }
}

/// File-backed owner of the [`CheckpointSet`].
#[derive(Debug)]
pub struct CheckpointStore {
    path: PathBuf,
    set: CheckpointSet,
}

impl CheckpointStore {
    /// A store for `path`; nothing is read until [`load`](Self::load).
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            set: CheckpointSet::new(),
        }
    }

    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let mut store = Self::new(path);
        store.load()?;
        Ok(store)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn set(&self) -> &CheckpointSet {
        &self.set
    }

    /// Read the persisted set, replacing anything held in memory. A missing
    /// file is an empty set.
    pub fn load(&mut self) -> Result<&CheckpointSet> {
        let mut set = CheckpointSet::new();
        match fs::read(&self.path) {
            Ok(bytes) => {
                let doc: CheckpointDocument = serde_json::from_slice(&bytes)?;
                if doc.version != CHECKPOINT_VERSION {
                    return Err(DetonatorError::UnsupportedCheckpoint {
                        path: self.path.clone(),
                        found: doc.version,
                        expected: CHECKPOINT_VERSION,
                    });
                }
                for record in doc.records {
                    set.insert(record)?;
                }
                info!(
                    path = %self.path.display(),
                    records = set.len(),
                    "loaded checkpoint"
                );
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!(path = %self.path.display(), "no checkpoint yet");
            }
            Err(e) => return Err(e.into()),
        }
        self.set = set;
        Ok(&self.set)
    }

    /// Add one terminal record and persist before returning. On a failed
    /// write the record is dropped again, so memory never runs ahead of
    /// disk.
    pub fn commit(&mut self, mut record: SampleRecord) -> Result<()> {
        record.payload.clear();
        let path = record.path.clone();
        self.set.insert(record)?;
        if let Err(e) = self.persist() {
            self.set.pop();
            return Err(e);
        }
        debug!(sample = %path, total = self.set.len(), "checkpoint committed");
        Ok(())
    }

    /// Rewrite the persisted document from memory.
    pub fn flush(&self) -> Result<()> {
        self.persist()
    }

    /// Move an existing checkpoint aside so a fresh run starts empty.
    pub fn archive(&mut self) -> Result<Option<PathBuf>> {
        if !self.path.exists() {
            self.set = CheckpointSet::new();
            return Ok(None);
        }
        let name = self
            .path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "checkpoint".to_string());
        let stamp = Utc::now().format("%Y%m%dT%H%M%S%.3f");
        let backup = self.path.with_file_name(format!("{}.{}.bak", name, stamp));
        fs::rename(&self.path, &backup)?;
        self.set = CheckpointSet::new();
        info!(backup = %backup.display(), "archived previous checkpoint");
        Ok(Some(backup))
    }

    fn persist(&self) -> Result<()> {
        let doc = CheckpointDocument {
            version: CHECKPOINT_VERSION,
            updated_at: Some(Utc::now()),
            records: self.set.records.clone(),
        };
        let bytes = serde_json::to_vec_pretty(&doc)?;
        atomic_write_bytes(&self.path, &bytes)
    }
}

pub(crate) fn atomic_write_bytes(path: &Path, bytes: &[u8]) -> Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)?;
        }
    }
    let name = path
        .file_name()
        .and_then(|s| s.to_str())
        .unwrap_or("tmpfile");
    let tmp = path.with_file_name(format!(
        ".{}.tmp.{}.{}",
        name,
        std::process::id(),
        Utc::now().timestamp_micros()
    ));
    let written = fs::File::create(&tmp)
        .and_then(|mut file| {
            file.write_all(bytes)?;
            file.sync_all()
        })
        .and_then(|()| fs::rename(&tmp, path));
    if let Err(e) = written {
        let _ = fs::remove_file(&tmp);
        return Err(e.into());
    }
    if let Some(parent) = path.parent() {
        if let Ok(dir) = fs::File::open(parent) {
            let _ = dir.sync_all();
        }
    }
    Ok(())
}
