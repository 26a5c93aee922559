//! STS `AssumeRole` adapter.
//!
//! K_i: The session name is recorded verbatim in the principal id of every
//! request made with the issued credentials.
//! B_i: STS accepts the label (charset `[\w+=,.@-]`, 2-64 chars)

use crate::client::aws_client::{xml_field, AwsClient, AwsRequest};
use crate::client::sigv4::uri_encode;
use crate::client::IdentityIssuer;
use crate::models::{AwsError, Credentials, IdentityLabel, Result, TrailprobeError};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::{Method, Url};
use std::sync::Arc;
use tracing::debug;

const STS_API_VERSION: &str = "2011-06-15";

/// Issues probe sessions through STS.
pub struct StsIssuer {
    client: Arc<AwsClient>,
    endpoint: Url,
    duration_secs: u32,
}

impl StsIssuer {
    pub fn new(client: Arc<AwsClient>, endpoint: Url, duration_secs: u32) -> Self {
        Self {
            client,
            endpoint,
            duration_secs,
        }
    }

    fn request_body(&self, role_arn: &str, session_name: &str) -> String {
        let duration = self.duration_secs.to_string();
        [
            ("Action", "AssumeRole"),
            ("Version", STS_API_VERSION),
            ("RoleArn", role_arn),
            ("RoleSessionName", session_name),
            ("DurationSeconds", duration.as_str()),
        ]
        .iter()
        .map(|(k, v)| format!("{k}={}", uri_encode(v)))
        .collect::<Vec<_>>()
        .join("&")
    }
}

/// Extract temporary credentials from an `AssumeRoleResponse` document.
pub fn parse_assume_role_response(body: &str) -> std::result::Result<Credentials, AwsError> {
    let field = |tag: &str| {
        xml_field(body, tag).ok_or_else(|| AwsError::InvalidResponse {
            service: "sts".to_string(),
            message: format!("missing <{tag}> in AssumeRole response"),
        })
    };

    let mut credentials = Credentials::new(
        field("AccessKeyId")?,
        field("SecretAccessKey")?,
        Some(field("SessionToken")?),
    );
    credentials.expiration = xml_field(body, "Expiration")
        .and_then(|s| DateTime::parse_from_rfc3339(&s).ok())
        .map(|t| t.with_timezone(&Utc));
    Ok(credentials)
}

#[async_trait]
impl IdentityIssuer for StsIssuer {
    async fn assume(&self, role_arn: &str, label: &IdentityLabel) -> Result<Credentials> {
        let request = AwsRequest::new("sts", Method::POST, self.endpoint.clone())
            .header(
                "content-type",
                "application/x-www-form-urlencoded; charset=utf-8",
            )
            .body(self.request_body(role_arn, label.as_str()));

        let issuance_error = |source: AwsError| TrailprobeError::Issuance {
            session: label.to_string(),
            source,
        };

        let response = match self.client.send(&request).await {
            Ok(r) => r,
            Err(TrailprobeError::Aws(source)) => return Err(issuance_error(source)),
            Err(e) => return Err(e),
        };

        let credentials = parse_assume_role_response(&response.body).map_err(issuance_error)?;
        debug!(
            session = %label,
            access_key_id = %credentials.access_key_id,
            duration_ms = response.duration.as_millis() as u64,
            "Assumed probe role"
        );
        Ok(credentials)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const RESPONSE: &str = r#"<AssumeRoleResponse xmlns="https://sts.amazonaws.com/doc/2011-06-15/">
  <AssumeRoleResult>
    <AssumedRoleUser>
      <Arn>arn:aws:sts::111122223333:assumed-role/probe-role/--7---------</Arn>
      <AssumedRoleId>AROAEXAMPLE:--7---------</AssumedRoleId>
    </AssumedRoleUser>
    <Credentials>
      <AccessKeyId>ASIAEXAMPLE</AccessKeyId>
      <SecretAccessKey>secretEXAMPLE</SecretAccessKey>
      <SessionToken>tokenEXAMPLE</SessionToken>
      <Expiration>2024-05-01T10:15:00Z</Expiration>
    </Credentials>
  </AssumeRoleResult>
</AssumeRoleResponse>"#;

    #[test]
    fn test_parse_assume_role_response() {
        let creds = parse_assume_role_response(RESPONSE).unwrap();
        assert_eq!(creds.access_key_id, "ASIAEXAMPLE");
        assert_eq!(creds.secret_access_key, "secretEXAMPLE");
        assert_eq!(creds.session_token.as_deref(), Some("tokenEXAMPLE"));
        assert_eq!(
            creds.expiration.map(|t| t.to_rfc3339()),
            Some("2024-05-01T10:15:00+00:00".to_string())
        );
    }

    #[test]
    fn test_parse_rejects_incomplete_response() {
        let err = parse_assume_role_response("<AssumeRoleResponse/>").unwrap_err();
        assert!(matches!(err, AwsError::InvalidResponse { .. }));
    }

    #[test]
    fn test_request_body_encoding() {
        let client = Arc::new(
            AwsClient::new(
                "eu-west-1".to_string(),
                Credentials::new("AKID", "secret", None),
                5,
                1,
                None,
            )
            .unwrap(),
        );
        let issuer = StsIssuer::new(
            client,
            Url::parse("https://sts.eu-west-1.amazonaws.com/").unwrap(),
            900,
        );

        let body = issuer.request_body("arn:aws:iam::111122223333:role/probe-role", "--7---------");
        assert_eq!(
            body,
            "Action=AssumeRole&Version=2011-06-15\
             &RoleArn=arn%3Aaws%3Aiam%3A%3A111122223333%3Arole%2Fprobe-role\
             &RoleSessionName=--7---------&DurationSeconds=900"
        );
    }
}
