//! Core data models for trailprobe.
//!
//! Epistemic mapping:
//! - K_i (Knowledge): Probe space, patterns and labels are pure functions of width
//! - B_i (Beliefs): Audit entries and labels read back are wrapped in Result/Option
//! - I^R (Resolvable): Config parameters
//! - I^B (Bounded): Error variants with degrade-or-abort strategies

mod config;
mod credentials;
mod digits;
mod error;
mod log_entry;
mod probe;

pub use config::*;
pub use credentials::*;
pub use digits::*;
pub use error::*;
pub use log_entry::*;
pub use probe::*;
