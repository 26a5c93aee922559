//! Audit log entries.
//!
//! K_i: CloudTrail wraps each event as a JSON document inside a string field.
//! B_i: Any field of that document may be absent → Option

use chrono::{DateTime, Utc};
use serde::Deserialize;

/// The slice of an audit event the correlator cares about.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct LogEntry {
    pub event_id: Option<String>,
    /// Operation name (e.g. `GetBucketAcl`)
    pub event_name: Option<String>,
    /// Target bucket from the request parameters
    pub bucket_name: Option<String>,
    /// Session label: the part of the principal id after `:`
    pub session_label: Option<String>,
    /// Name of the role that issued the session
    pub issuer_role_name: Option<String>,
    /// VPC endpoint the request transited, if any
    pub vpc_endpoint_id: Option<String>,
    pub event_time: Option<DateTime<Utc>>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawEvent {
    #[serde(rename = "eventID")]
    event_id: Option<String>,
    event_name: Option<String>,
    event_time: Option<DateTime<Utc>>,
    #[serde(default)]
    request_parameters: Option<RawRequestParameters>,
    #[serde(default)]
    user_identity: Option<RawUserIdentity>,
    vpc_endpoint_id: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawRequestParameters {
    bucket_name: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawUserIdentity {
    principal_id: Option<String>,
    session_context: Option<RawSessionContext>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawSessionContext {
    session_issuer: Option<RawSessionIssuer>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawSessionIssuer {
    user_name: Option<String>,
}

impl LogEntry {
    /// Parse a CloudTrail event document.
    pub fn from_event_json(document: &str) -> serde_json::Result<Self> {
        let raw: RawEvent = serde_json::from_str(document)?;

        let user_identity = raw.user_identity;
        let session_label = user_identity
            .as_ref()
            .and_then(|u| u.principal_id.as_deref())
            .and_then(|p| p.split_once(':'))
            .map(|(_, session)| session.to_string());
        let issuer_role_name = user_identity
            .and_then(|u| u.session_context)
            .and_then(|c| c.session_issuer)
            .and_then(|i| i.user_name);

        Ok(Self {
            event_id: raw.event_id,
            event_name: raw.event_name,
            bucket_name: raw.request_parameters.and_then(|p| p.bucket_name),
            session_label,
            issuer_role_name,
            vpc_endpoint_id: raw.vpc_endpoint_id,
            event_time: raw.event_time,
        })
    }
}
