//! Service registry wiring the AWS adapters from configuration.
//!
//! Epistemic foundation:
//! - K_i: All adapters share one signed transport and one rate limiter
//! - I^R: User configures which endpoints (gateway entry points) to use

use crate::client::{
    AuditLog, AwsClient, CloudTrailLog, IdentityIssuer, RateLimiter, S3AclProbe, StsIssuer,
    TargetService,
};
use crate::models::{Config, ConfigError};
use reqwest::Url;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

/// CloudTrail allows 2 LookupEvents calls per second per account and region.
const CLOUDTRAIL_MIN_INTERVAL: Duration = Duration::from_millis(500);

/// The three collaborators the engine needs, as shared trait objects.
///
/// # Example
///
/// ```ignore
/// use trailprobe::{Config, ServiceRegistry};
///
/// let config = Config::from_file("config.toml")?;
/// let services = ServiceRegistry::from_config(&config)?;
/// let pipeline = RecoveryPipeline::new(config, services);
/// ```
#[derive(Clone)]
pub struct ServiceRegistry {
    pub issuer: Arc<dyn IdentityIssuer>,
    pub target: Arc<dyn TargetService>,
    pub audit_log: Arc<dyn AuditLog>,
    rate_limiter: Arc<RateLimiter>,
}

impl ServiceRegistry {
    /// Build the AWS-backed registry from configuration.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::MissingCredentials` if no AWS credentials are
    /// configured or present in the environment, and `ConfigError::Invalid`
    /// if an endpoint is not a valid URL.
    pub fn from_config(config: &Config) -> Result<Self, ConfigError> {
        let credentials = config.resolve_credentials()?;
        let rate_limiter = Arc::new(
            RateLimiter::new().with_min_interval("cloudtrail", CLOUDTRAIL_MIN_INTERVAL),
        );

        let client = Arc::new(
            AwsClient::new(
                config.aws.region.clone(),
                credentials,
                config.aws.timeout_secs,
                config.aws.max_retries,
                Some(Arc::clone(&rate_limiter)),
            )
            .map_err(|e| ConfigError::Invalid {
                field: "aws".to_string(),
                reason: format!("failed to create HTTP client: {e}"),
            })?,
        );

        let sts_url = parse_endpoint("endpoints.sts", &config.sts_url())?;
        let cloudtrail_url = parse_endpoint("endpoints.cloudtrail", &config.cloudtrail_url())?;

        info!(
            region = %config.aws.region,
            sts = %sts_url,
            cloudtrail = %cloudtrail_url,
            s3 = config.endpoints.s3.as_deref().unwrap_or("regional"),
            "AWS services configured"
        );

        Ok(Self {
            issuer: Arc::new(StsIssuer::new(
                Arc::clone(&client),
                sts_url,
                config.probing.session_duration_secs,
            )),
            target: Arc::new(S3AclProbe::new(
                Arc::clone(&client),
                config.endpoints.s3.clone(),
            )),
            audit_log: Arc::new(CloudTrailLog::new(client, cloudtrail_url)),
            rate_limiter,
        })
    }

    /// Assemble a registry from arbitrary implementations.
    pub fn new(
        issuer: Arc<dyn IdentityIssuer>,
        target: Arc<dyn TargetService>,
        audit_log: Arc<dyn AuditLog>,
    ) -> Self {
        Self {
            issuer,
            target,
            audit_log,
            rate_limiter: Arc::new(RateLimiter::new()),
        }
    }

    /// Get the rate limiter shared by the AWS adapters.
    pub fn rate_limiter(&self) -> &Arc<RateLimiter> {
        &self.rate_limiter
    }
}

fn parse_endpoint(field: &str, raw: &str) -> Result<Url, ConfigError> {
    Url::parse(raw).map_err(|e| ConfigError::Invalid {
        field: field.to_string(),
        reason: format!("'{raw}' is not a valid URL: {e}"),
    })
}
