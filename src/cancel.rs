//! Cooperative cancellation.
//!
//! The signal is only ever polled at phase boundaries and between samples;
//! nothing interrupts a collaborator call in flight.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{info, warn};

#[derive(Debug, Clone, Default)]
pub struct CancelSignal {
    flag: Arc<AtomicBool>,
}

impl CancelSignal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        if !self.flag.swap(true, Ordering::SeqCst) {
            info!("cancellation requested, finishing in-flight sample");
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }

    /// Trip the signal on the first Ctrl+C. Must be called from inside a
    /// tokio runtime.
    pub fn listen_for_ctrl_c(&self) -> tokio::task::JoinHandle<()> {
        let signal = self.clone();
        tokio::spawn(async move {
            match tokio::signal::ctrl_c().await {
                Ok(()) => signal.cancel(),
                Err(e) => warn!(error = %e, "unable to listen for Ctrl+C"),
            }
        })
    }
}
