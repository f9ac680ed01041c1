//! Hand-off of collected behavioral payloads to feature extraction.
//!
//! The orchestrator only cares whether data exists; what the payload means
//! is the sink's business.

use crate::core::SampleRecord;
use std::fs;
use std::path::PathBuf;

/// Receives the payload of every `Done` sample before it is checkpointed.
pub trait FeatureSink: Send {
    fn accept(&mut self, record: &SampleRecord, payload: &[u8]) -> anyhow::Result<()>;
}

impl<F> FeatureSink for F
where
    F: FnMut(&SampleRecord, &[u8]) -> anyhow::Result<()> + Send,
{
    fn accept(&mut self, record: &SampleRecord, payload: &[u8]) -> anyhow::Result<()> {
        self(record, payload)
    }
}

/// Drops every payload.
#[derive(Debug, Default, Clone, Copy)]
pub struct DiscardFeatures;

impl FeatureSink for DiscardFeatures {
    fn accept(&mut self, _record: &SampleRecord, _payload: &[u8]) -> anyhow::Result<()> {
        Ok(())
    }
}

/// Writes each payload to `<dir>/<sha256 or file stem>.behavior` for an
/// offline extractor to pick up.
#[derive(Debug, Clone)]
pub struct PayloadDir {
    dir: PathBuf,
}

impl PayloadDir {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn path_for(&self, record: &SampleRecord) -> PathBuf {
        let stem = record.sha256.clone().unwrap_or_else(|| {
            std::path::Path::new(&record.path)
                .file_stem()
                .map(|s| s.to_string_lossy().into_owned())
                .unwrap_or_else(|| "sample".to_string())
        });
        self.dir.join(format!("{}.behavior", stem))
    }
}

impl FeatureSink for PayloadDir {
    fn accept(&mut self, record: &SampleRecord, payload: &[u8]) -> anyhow::Result<()> {
        if payload.is_empty() {
            return Ok(());
        }
        fs::create_dir_all(&self.dir)?;
        fs::write(self.path_for(record), payload)?;
        Ok(())
    }
}
