//! Sample enumeration.
//!
//! Queue order is processing order, so directory listings are sorted to keep
//! it stable across restarts.

use crate::core::{Label, SampleRecord};
use crate::error::{DetonatorError, Result};
use sha2::{Digest, Sha256};
use std::collections::HashSet;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// Extension picked up by [`SampleQueue::from_dirs`] when none is given.
pub const DEFAULT_EXTENSION: &str = "exe";

/// One queued sample.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SampleSpec {
    pub path: PathBuf,
    pub label: Label,
}

impl SampleSpec {
    pub fn new(path: impl Into<PathBuf>, label: Label) -> Self {
        Self {
            path: path.into(),
            label,
        }
    }

    /// Identity used in the checkpoint.
    pub fn key(&self) -> String {
        self.path.to_string_lossy().into_owned()
    }

    /// Fresh record for this sample, with its digest when the file is
    /// readable.
    pub fn to_record(&self) -> SampleRecord {
        let record = SampleRecord::new(self.key(), self.label);
        match file_sha256(&self.path) {
            Ok(digest) => record.with_sha256(digest),
            Err(e) => {
                debug!(sample = %self.path.display(), error = %e, "could not hash sample");
                record
            }
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct SampleQueue {
    items: Vec<SampleSpec>,
    keys: HashSet<String>,
}

impl SampleQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a sample; returns `false` if its path is already queued.
    pub fn push(&mut self, spec: SampleSpec) -> bool {
        if !self.keys.insert(spec.key()) {
            return false;
        }
        self.items.push(spec);
        true
    }

    /// Queue every file with `extension` (case-insensitive) in the malware
    /// directory, then the benign one, each sorted by path.
    pub fn from_dirs(malware_dir: &Path, benign_dir: &Path, extension: &str) -> Result<Self> {
        let mut queue = Self::new();
        for (dir, label) in [(malware_dir, Label::Malware), (benign_dir, Label::Benign)] {
            for path in scan_dir(dir, extension)? {
                queue.push(SampleSpec::new(path, label));
            }
        }
        if queue.is_empty() {
            return Err(DetonatorError::InvalidQueue(format!(
                "no .{} samples under {} or {}",
                extension,
                malware_dir.display(),
                benign_dir.display()
            )));
        }
        info!(samples = queue.len(), "sample queue built");
        Ok(queue)
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn contains(&self, key: &str) -> bool {
        self.keys.contains(key)
    }

    pub fn iter(&self) -> impl Iterator<Item = &SampleSpec> {
        self.items.iter()
    }
}

impl FromIterator<SampleSpec> for SampleQueue {
    fn from_iter<I: IntoIterator<Item = SampleSpec>>(iter: I) -> Self {
        let mut queue = SampleQueue::new();
        for spec in iter {
            queue.push(spec);
        }
        queue
    }
}

fn scan_dir(dir: &Path, extension: &str) -> Result<Vec<PathBuf>> {
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            debug!(dir = %dir.display(), "sample directory missing, skipping");
            return Ok(Vec::new());
        }
        Err(e) => return Err(e.into()),
    };
    let mut paths = Vec::new();
    for entry in entries {
        let path = entry?.path();
        let matches = path
            .extension()
            .map(|ext| ext.to_string_lossy().eq_ignore_ascii_case(extension))
            .unwrap_or(false);
        if matches && path.is_file() {
            paths.push(path);
        }
    }
    paths.sort();
    Ok(paths)
}

/// Hex SHA-256 of a file, streamed.
pub fn file_sha256(path: &Path) -> io::Result<String> {
    let mut file = fs::File::open(path)?;
    let mut hasher = Sha256::new();
    io::copy(&mut file, &mut hasher)?;
    Ok(hex::encode(hasher.finalize()))
}
