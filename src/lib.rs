//! trailprobe - Recover the account id owning an S3 bucket from CloudTrail.
//!
//! ## Architecture
//!
//! trailprobe runs two decoupled phases:
//! - **Probe Pool**: For every (position, digit) pair, assumes the probing role
//!   under a session name encoding that pair and reads the bucket ACL once
//! - **Correlator**: Polls CloudTrail for those reads, keeps the ones that
//!   transited the expected VPC gateway endpoint and decodes their session names
//!
//! ## Pipeline
//!
//! Probe space → Probe pool → Correlator → Assembled identifier (`?` = unresolved)
//!
//! ## Epistemic Design
//!
//! - K_i (Knowledge): Probe space and label encoding are pure and total
//! - B_i (Beliefs): Collaborator calls and audit contents (Result, Option)
//! - I^R (Resolvable): Endpoints, bucket, gateway, role and timing via config
//! - I^B (Bounded): Audit delivery lag (polling deadline), throttling (backoff)

pub mod client;
pub mod models;
pub mod pipeline;
pub mod pool;

// Re-exports for convenience
pub use client::{AuditLog, IdentityIssuer, RateLimiter, ServiceRegistry, TargetService};
pub use models::{Config, ConfirmedDigits, IdentityLabel, Pattern, Probe, Result, TrailprobeError};
pub use pipeline::{Correlator, InvocationResponse, RecoveryPipeline, RecoveryReport};
pub use pool::{ProbeDelivery, ProbePool};
