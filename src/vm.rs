//! VM session collaborator interface.
//!
//! The orchestrator only ever talks to the hypervisor through
//! [`VmBackend`]. Every method is a blocking call; the supervisor runs them
//! on the blocking pool and races them against phase deadlines, so
//! implementations must be `Send + Sync + 'static`.

use crate::core::Fault;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

/// Result of a collaborator call.
pub type VmResult<T> = std::result::Result<T, Fault>;

/// Observable VM state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum VmState {
    Stopped,
    Starting,
    Running,
    Unresponsive,
}

/// Opaque handle for an acquired VM.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Session {
    id: String,
}

impl Session {
    pub fn new(id: impl Into<String>) -> Self {
        Self { id: id.into() }
    }

    pub fn id(&self) -> &str {
        &self.id
    }
}

impl fmt::Display for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.id)
    }
}

/// Hypervisor control surface.
pub trait VmBackend: Send + Sync + 'static {
    /// Start (or attach to) the VM and verify the guest accepts commands
    /// and file operations. A guest that is not ready yields
    /// `FaultKind::VmAcquisition`.
    fn acquire(&self) -> VmResult<Session>;

    fn copy_into(&self, session: &Session, local: &Path, remote: &str) -> VmResult<()>;

    /// Launch `command` in the guest. Guest unreachable is reported as
    /// `FaultKind::VmUnresponsive`.
    fn execute(&self, session: &Session, command: &str) -> VmResult<()>;

    /// Gather telemetry for `window`, streaming it into `buffer` as it
    /// arrives.
    fn monitor(&self, session: &Session, window: Duration, buffer: &BehaviorBuffer)
        -> VmResult<()>;

    /// Pull the remaining behavioral artifacts out of the guest.
    fn collect(&self, session: &Session, buffer: &BehaviorBuffer) -> VmResult<()>;

    fn observe_state(&self, session: &Session) -> VmState;

    fn restore_snapshot(&self, session: &Session, name: &str) -> VmResult<()>;

    fn release(&self, session: &Session);

    /// Power the VM off without a session, used when a call overran.
    fn force_stop(&self) -> VmResult<()>;
}

/// Behavioral data shared between the pipeline and in-flight collaborator
/// calls, so bytes gathered before a deadline survive the timeout.
#[derive(Debug, Clone, Default)]
pub struct BehaviorBuffer {
    inner: Arc<Mutex<Vec<u8>>>,
}

impl BehaviorBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Vec<u8>> {
        // a panicking collaborator must not cost us the data it already wrote
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn push(&self, bytes: &[u8]) {
        self.lock().extend_from_slice(bytes);
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    pub fn snapshot(&self) -> Vec<u8> {
        self.lock().clone()
    }

    /// Move the contents out, leaving the buffer empty.
    pub fn take(&self) -> Vec<u8> {
        std::mem::take(&mut *self.lock())
    }
}
