//! CloudTrail `LookupEvents` adapter.
//!
//! Epistemic foundation:
//! - K_i: LookupEvents filters by a single attribute and a time range
//! - K_i: Each event embeds the full record as a JSON string
//! - B_i: Events show up within minutes, not immediately
//! - I^B: Delivery lag unknowable → the correlator re-polls

use crate::client::aws_client::{AwsClient, AwsRequest};
use crate::client::{AuditLog, AuditPage, AuditQuery};
use crate::models::{AwsError, LogEntry, Result, TrailprobeError};
use async_trait::async_trait;
use reqwest::{Method, Url};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::debug;

const LOOKUP_EVENTS_TARGET: &str = "com.amazonaws.cloudtrail.v20131101.CloudTrail_20131101.LookupEvents";

/// Largest page LookupEvents returns.
const MAX_RESULTS: u32 = 50;

#[derive(Debug, Serialize)]
#[serde(rename_all = "PascalCase")]
struct LookupEventsRequest<'a> {
    lookup_attributes: Vec<LookupAttribute<'a>>,
    /// Epoch seconds
    start_time: i64,
    max_results: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    next_token: Option<&'a str>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "PascalCase")]
struct LookupAttribute<'a> {
    attribute_key: &'a str,
    attribute_value: &'a str,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct LookupEventsResponse {
    #[serde(default)]
    events: Vec<TrailEvent>,
    next_token: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct TrailEvent {
    event_id: Option<String>,
    cloud_trail_event: Option<String>,
}

/// Reads the management event history of the current region.
pub struct CloudTrailLog {
    client: Arc<AwsClient>,
    endpoint: Url,
}

impl CloudTrailLog {
    pub fn new(client: Arc<AwsClient>, endpoint: Url) -> Self {
        Self { client, endpoint }
    }
}

/// Turn a LookupEvents response body into a page of entries.
///
/// Events whose embedded record does not parse are counted, not fatal.
pub fn parse_lookup_response(body: &str) -> std::result::Result<AuditPage, AwsError> {
    let response: LookupEventsResponse =
        serde_json::from_str(body).map_err(|e| AwsError::InvalidResponse {
            service: "cloudtrail".to_string(),
            message: e.to_string(),
        })?;

    let mut page = AuditPage {
        entries: Vec::with_capacity(response.events.len()),
        next_token: response.next_token.filter(|t| !t.is_empty()),
        skipped: 0,
    };

    for event in response.events {
        let parsed = event
            .cloud_trail_event
            .as_deref()
            .map(LogEntry::from_event_json);
        match parsed {
            Some(Ok(mut entry)) => {
                if entry.event_id.is_none() {
                    entry.event_id = event.event_id;
                }
                page.entries.push(entry);
            }
            Some(Err(e)) => {
                debug!(event_id = ?event.event_id, error = %e, "Skipping unparseable event");
                page.skipped += 1;
            }
            None => page.skipped += 1,
        }
    }

    Ok(page)
}

#[async_trait]
impl AuditLog for CloudTrailLog {
    async fn lookup(&self, query: &AuditQuery, next_token: Option<&str>) -> Result<AuditPage> {
        let payload = LookupEventsRequest {
            lookup_attributes: vec![LookupAttribute {
                attribute_key: "EventName",
                attribute_value: &query.event_name,
            }],
            start_time: query.start_time.timestamp(),
            max_results: MAX_RESULTS,
            next_token,
        };
        let body = serde_json::to_vec(&payload)
            .map_err(|e| TrailprobeError::Internal(format!("Failed to encode lookup: {e}")))?;

        let request = AwsRequest::new("cloudtrail", Method::POST, self.endpoint.clone())
            .header("content-type", "application/x-amz-json-1.1")
            .header("x-amz-target", LOOKUP_EVENTS_TARGET)
            .body(body);

        let response = self.client.send(&request).await?;
        Ok(parse_lookup_response(&response.body)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};

    #[test]
    fn test_request_payload_shape() {
        let payload = LookupEventsRequest {
            lookup_attributes: vec![LookupAttribute {
                attribute_key: "EventName",
                attribute_value: "GetBucketAcl",
            }],
            start_time: Utc.with_ymd_and_hms(2024, 5, 1, 10, 0, 0).unwrap().timestamp(),
            max_results: MAX_RESULTS,
            next_token: None,
        };

        let json = serde_json::to_value(&payload).unwrap();
        assert_eq!(
            json,
            serde_json::json!({
                "LookupAttributes": [
                    { "AttributeKey": "EventName", "AttributeValue": "GetBucketAcl" }
                ],
                "StartTime": 1714557600,
                "MaxResults": 50
            })
        );
    }

    #[test]
    fn test_parse_lookup_response() {
        let inner = serde_json::json!({
            "eventName": "GetBucketAcl",
            "userIdentity": {
                "principalId": "AROAEXAMPLE:-----3------",
                "sessionContext": { "sessionIssuer": { "userName": "probe-role" } }
            },
            "requestParameters": { "bucketName": "target-bucket" },
            "vpcEndpointId": "vpce-0abc"
        })
        .to_string();

        let body = serde_json::json!({
            "Events": [
                { "EventId": "e-1", "EventName": "GetBucketAcl", "CloudTrailEvent": inner },
                { "EventId": "e-2", "EventName": "GetBucketAcl", "CloudTrailEvent": "{broken" },
                { "EventId": "e-3", "EventName": "GetBucketAcl" }
            ],
            "NextToken": "page-2"
        })
        .to_string();

        let page = parse_lookup_response(&body).unwrap();
        assert_eq!(page.entries.len(), 1);
        assert_eq!(page.skipped, 2);
        assert_eq!(page.next_token.as_deref(), Some("page-2"));

        let entry = &page.entries[0];
        assert_eq!(entry.event_id.as_deref(), Some("e-1"));
        assert_eq!(entry.session_label.as_deref(), Some("-----3------"));
    }

    #[test]
    fn test_parse_last_page() {
        let page = parse_lookup_response(r#"{"Events": [], "NextToken": ""}"#).unwrap();
        assert!(page.entries.is_empty());
        assert_eq!(page.next_token, None);

        assert!(parse_lookup_response("<html>").is_err());
    }
}
