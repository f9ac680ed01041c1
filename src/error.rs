//! Error types for the detonator batch orchestrator.
//!
//! These are run-level errors: things that stop the orchestrator from
//! making progress (bad configuration, an unwritable checkpoint, a corrupt
//! checkpoint file). Faults raised by the VM collaborator while a sample is
//! in flight are data, see [`crate::core::fault`].

use std::path::PathBuf;
use thiserror::Error;

/// Main error type for detonator operations.
#[derive(Debug, Error)]
pub enum DetonatorError {
    /// Configuration could not be parsed or failed validation
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// A checkpoint document uses a format this build cannot read
    #[error("Unsupported checkpoint version {found} in {path:?} (expected {expected})")]
    UnsupportedCheckpoint {
        path: PathBuf,
        found: u32,
        expected: u32,
    },

    /// A sample was committed twice
    #[error("Sample already checkpointed: {0}")]
    DuplicateCheckpoint(String),

    /// Only terminal records may enter the checkpoint set
    #[error("Sample {path} is not terminal (status {status})")]
    NotTerminal { path: String, status: String },

    /// Terminal records are frozen
    #[error("Sample {0} is already terminal")]
    AlreadyTerminal(String),

    /// Sample enumeration errors
    #[error("Invalid sample queue: {0}")]
    InvalidQueue(String),

    /// The feature extraction collaborator rejected a payload
    #[error("Feature sink failed for {path}: {source}")]
    FeatureSink {
        path: String,
        #[source]
        source: anyhow::Error,
    },

    /// File I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization/deserialization errors
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Generic internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Result type alias for detonator operations
pub type Result<T> = std::result::Result<T, DetonatorError>;
