//! S3 `GetBucketAcl` adapter.
//!
//! K_i: GetBucketAcl is read-only and always recorded as a management event.
//! B_i: The response is irrelevant; only the audit record matters.

use crate::client::aws_client::{AwsClient, AwsRequest};
use crate::client::TargetService;
use crate::models::{Credentials, Result, TrailprobeError};
use async_trait::async_trait;
use reqwest::{Method, Url};
use std::sync::Arc;
use tracing::debug;

/// Probes a bucket by reading its ACL.
pub struct S3AclProbe {
    client: Arc<AwsClient>,
    /// Endpoint override; forces path-style addressing
    endpoint: Option<String>,
}

impl S3AclProbe {
    pub fn new(client: Arc<AwsClient>, endpoint: Option<String>) -> Self {
        Self { client, endpoint }
    }

    /// URL of the bucket's `?acl` subresource.
    ///
    /// Virtual-hosted style unless the bucket name contains dots (which break
    /// the wildcard certificate) or an endpoint override is configured.
    pub fn acl_url(&self, bucket: &str) -> Result<Url> {
        let raw = match &self.endpoint {
            Some(endpoint) => {
                let base = endpoint.trim_end_matches('/');
                let base = if base.contains("://") {
                    base.to_string()
                } else {
                    format!("https://{base}")
                };
                format!("{base}/{bucket}?acl")
            }
            None if bucket.contains('.') => {
                format!("https://s3.{}.amazonaws.com/{bucket}?acl", self.client.region())
            }
            None => format!("https://{bucket}.s3.{}.amazonaws.com/?acl", self.client.region()),
        };

        Url::parse(&raw)
            .map_err(|e| TrailprobeError::ParseError(format!("Invalid S3 URL '{raw}': {e}")))
    }
}

#[async_trait]
impl TargetService for S3AclProbe {
    async fn probe_operation(&self, credentials: &Credentials, resource: &str) -> Result<()> {
        let request = AwsRequest::new("s3", Method::GET, self.acl_url(resource)?);
        let response = self.client.send_with(&request, credentials).await?;
        debug!(
            bucket = resource,
            status = response.status,
            "Bucket ACL readable by probe session"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn probe(endpoint: Option<&str>) -> S3AclProbe {
        let client = AwsClient::new(
            "eu-west-1".to_string(),
            Credentials::new("AKID", "secret", None),
            5,
            1,
            None,
        )
        .unwrap();
        S3AclProbe::new(Arc::new(client), endpoint.map(str::to_string))
    }

    #[test]
    fn test_acl_url_addressing() {
        assert_eq!(
            probe(None).acl_url("target-bucket").unwrap().as_str(),
            "https://target-bucket.s3.eu-west-1.amazonaws.com/?acl"
        );
        assert_eq!(
            probe(None).acl_url("dotted.bucket").unwrap().as_str(),
            "https://s3.eu-west-1.amazonaws.com/dotted.bucket?acl"
        );
        assert_eq!(
            probe(Some("http://localhost:9000/")).acl_url("b").unwrap().as_str(),
            "http://localhost:9000/b?acl"
        );
        assert_eq!(
            probe(Some("bucket.vpce-1.s3.eu-west-1.vpce.amazonaws.com"))
                .acl_url("b")
                .unwrap()
                .as_str(),
            "https://bucket.vpce-1.s3.eu-west-1.vpce.amazonaws.com/b?acl"
        );
    }
}
