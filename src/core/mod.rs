//! Core data types for detonator.
//!
//! Phases, faults and the sample record shared by every other module.

pub mod fault;
pub mod phase;
pub mod sample;

pub use fault::{Disposition, Fault, FaultKind};
pub use phase::{Phase, SampleStatus};
pub use sample::{DataPresence, Label, SampleRecord};
