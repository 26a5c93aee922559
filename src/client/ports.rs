//! Collaborator interfaces consumed by the probing engine.
//!
//! The engine only ever talks to these traits; the AWS adapters in this
//! module and the fakes in tests both implement them.

use crate::models::{Credentials, IdentityLabel, LogEntry, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};

/// Issues short-lived credentials tagged with a session label.
#[async_trait]
pub trait IdentityIssuer: Send + Sync {
    /// Assume `role_arn`, recording `label` as the session name.
    async fn assume(&self, role_arn: &str, label: &IdentityLabel) -> Result<Credentials>;
}

/// The storage service holding the target resource.
#[async_trait]
pub trait TargetService: Send + Sync {
    /// Issue one metadata-only, side-effect-free read against `resource`.
    async fn probe_operation(&self, credentials: &Credentials, resource: &str) -> Result<()>;
}

/// Filter for one audit log lookup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuditQuery {
    /// Operation to look up (e.g. `GetBucketAcl`)
    pub event_name: String,
    /// Earliest event time to include
    pub start_time: DateTime<Utc>,
}

/// One page of audit log results.
#[derive(Debug, Clone, Default)]
pub struct AuditPage {
    pub entries: Vec<LogEntry>,
    /// Token for the next page, `None` on the last page
    pub next_token: Option<String>,
    /// Events on this page whose document could not be parsed
    pub skipped: usize,
}

/// Read access to the audit log.
#[async_trait]
pub trait AuditLog: Send + Sync {
    /// Fetch one page of entries matching `query`.
    async fn lookup(&self, query: &AuditQuery, next_token: Option<&str>) -> Result<AuditPage>;
}
