//! Account id recovery pipeline.
//!
//! Pipeline flow:
//! Probe space → Probe pool (one full pass) → Correlator → Assembled identifier

use crate::client::{RateLimiter, ServiceRegistry};
use crate::models::{
    probe_space, Config, CorrelationAnomaly, Pattern, Result, TrailprobeError, ACCOUNT_ID_WIDTH,
    DIGIT_RANGE, UNKNOWN,
};
use crate::pipeline::{CorrelationState, Correlator, CorrelatorSettings, ProbeWindow};
use crate::pool::{ProbePool, ProbeReport};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{info, info_span, Instrument};
use uuid::Uuid;

/// Summary of one recovery run.
#[derive(Debug, Clone, Serialize)]
pub struct RecoveryReport {
    pub run_id: String,
    pub bucket: String,

    /// Recovered identifier, `?` for unresolved positions
    pub account_id: String,

    pub resolved_positions: usize,
    pub distinct_labels: usize,
    pub anomalies: Vec<CorrelationAnomaly>,
    pub outcome: CorrelationState,
    pub polls: usize,
    pub probes: ProbeReport,

    /// Total runtime in seconds
    pub runtime_secs: f64,
}

impl RecoveryReport {
    /// Every position resolved.
    pub fn is_complete(&self) -> bool {
        !self.account_id.contains(UNKNOWN)
    }
}

/// Handler-style response: status code plus a JSON-encoded body string.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InvocationResponse {
    #[serde(rename = "statusCode")]
    pub status_code: u16,
    pub body: String,
}

impl InvocationResponse {
    pub fn from_report(report: &RecoveryReport) -> Result<Self> {
        let body = serde_json::to_string(&serde_json::json!({ "account_id": report.account_id }))
            .map_err(|e| TrailprobeError::Internal(format!("Failed to encode body: {e}")))?;
        Ok(Self {
            status_code: 200,
            body,
        })
    }
}

/// Pipeline recovering the account id that owns the configured bucket.
pub struct RecoveryPipeline {
    config: Config,
    pool: ProbePool,
    correlator: Correlator,
    rate_limiter: Arc<RateLimiter>,
}

impl RecoveryPipeline {
    /// Create a new recovery pipeline from configuration and services.
    pub fn new(config: Config, services: ServiceRegistry) -> Self {
        let pool = ProbePool::new(
            Arc::clone(&services.issuer),
            Arc::clone(&services.target),
            config.target.role_arn.clone(),
            config.target.bucket.clone(),
            config.probing.concurrency,
        );
        let correlator = Correlator::new(
            Arc::clone(&services.audit_log),
            CorrelatorSettings::from_config(&config),
        );

        Self {
            config,
            pool,
            correlator,
            rate_limiter: Arc::clone(services.rate_limiter()),
        }
    }

    /// Show a progress bar while probes are issued.
    pub fn with_progress(mut self, show: bool) -> Self {
        self.pool = self.pool.with_progress(show);
        self
    }

    /// Every probe pattern of a run, in issuance order.
    pub fn probe_patterns() -> Vec<Pattern> {
        probe_space(ACCOUNT_ID_WIDTH, DIGIT_RANGE)
            .into_iter()
            .map(|probe| Pattern::new(ACCOUNT_ID_WIDTH, probe))
            .collect()
    }

    /// Run the recovery pipeline.
    ///
    /// # Errors
    ///
    /// Only a gateway mismatch (or an internal failure) is an error; a run
    /// that times out returns a partial identifier.
    pub async fn run(&self) -> Result<RecoveryReport> {
        let run_id = Uuid::new_v4().to_string();
        let span = info_span!("recovery", run_id = %run_id, bucket = %self.config.target.bucket);
        self.run_inner(run_id).instrument(span).await
    }

    async fn run_inner(&self, run_id: String) -> Result<RecoveryReport> {
        let target = &self.config.target;
        info!(
            role_arn = %target.role_arn,
            gateway = %target.gateway_id,
            concurrency = self.config.probing.concurrency,
            "Starting recovery"
        );

        let window = ProbeWindow::open();
        let probes = self.pool.probe_all(Self::probe_patterns()).await;

        let correlation = self
            .correlator
            .correlate(&target.gateway_id, &window, &target.bucket)
            .await?;

        let account_id = correlation.identifier(ACCOUNT_ID_WIDTH);
        let report = RecoveryReport {
            run_id,
            bucket: target.bucket.clone(),
            resolved_positions: correlation.digits.len(),
            distinct_labels: correlation.distinct_labels.len(),
            anomalies: correlation.digits.anomalies().to_vec(),
            outcome: correlation.outcome,
            polls: correlation.polls,
            probes,
            runtime_secs: window.started.elapsed().as_secs_f64(),
            account_id,
        };

        let limiter = self.rate_limiter.stats();
        info!(
            account_id = %report.account_id,
            resolved = report.resolved_positions,
            anomalies = report.anomalies.len(),
            outcome = ?report.outcome,
            throttles = limiter.total_throttles,
            runtime = format!("{:.1}s", report.runtime_secs),
            "Recovery complete"
        );

        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::{AuditLog, AuditPage, AuditQuery, IdentityIssuer, TargetService};
    use crate::models::{decode, AwsError, Credentials, IdentityLabel, LogEntry};
    use async_trait::async_trait;
    use std::sync::Mutex;

    /// One account whose gateway only admits requests matching its id.
    struct SimulatedAccount {
        account_id: &'static str,
        gateway: &'static str,
        trail: Mutex<Vec<LogEntry>>,
    }

    impl SimulatedAccount {
        fn new(account_id: &'static str, gateway: &'static str) -> Arc<Self> {
            Arc::new(Self {
                account_id,
                gateway,
                trail: Mutex::new(Vec::new()),
            })
        }

        fn registry(self: &Arc<Self>) -> ServiceRegistry {
            ServiceRegistry::new(self.clone(), self.clone(), self.clone())
        }
    }

    #[async_trait]
    impl IdentityIssuer for SimulatedAccount {
        async fn assume(&self, _role_arn: &str, label: &IdentityLabel) -> Result<Credentials> {
            Ok(Credentials::new(label.as_str(), "secret", Some("token".to_string())))
        }
    }

    #[async_trait]
    impl TargetService for SimulatedAccount {
        async fn probe_operation(&self, credentials: &Credentials, resource: &str) -> Result<()> {
            let session = credentials.access_key_id.as_str();
            let probe = decode(session, ACCOUNT_ID_WIDTH)?.probe();
            let owner_digit = self.account_id.as_bytes()[probe.position] - b'0';
            if owner_digit != probe.digit {
                return Err(TrailprobeError::Aws(AwsError::AccessDenied(
                    "denied by endpoint policy".to_string(),
                )));
            }

            self.trail.lock().unwrap().push(LogEntry {
                event_id: Some(format!("evt-{session}")),
                event_name: Some("GetBucketAcl".to_string()),
                bucket_name: Some(resource.to_string()),
                session_label: Some(session.to_string()),
                issuer_role_name: Some("probe-role".to_string()),
                vpc_endpoint_id: Some(self.gateway.to_string()),
                event_time: None,
            });
            Ok(())
        }
    }

    #[async_trait]
    impl AuditLog for SimulatedAccount {
        async fn lookup(&self, _query: &AuditQuery, _next_token: Option<&str>) -> Result<AuditPage> {
            Ok(AuditPage {
                entries: self.trail.lock().unwrap().clone(),
                next_token: None,
                skipped: 0,
            })
        }
    }

    fn config() -> Config {
        toml::from_str(
            r#"
[aws]
region = "eu-west-1"

[target]
bucket = "target-bucket"
gateway_id = "vpce-0abc"
role_arn = "arn:aws:iam::111122223333:role/probe-role"
"#,
        )
        .unwrap()
    }

    #[tokio::test(start_paused = true)]
    async fn test_recovers_account_id() {
        let account = SimulatedAccount::new("123456789012", "vpce-0abc");
        let pipeline = RecoveryPipeline::new(config(), account.registry());

        let report = pipeline.run().await.unwrap();

        assert_eq!(report.account_id, "123456789012");
        assert!(report.is_complete());
        assert_eq!(report.outcome, CorrelationState::Satisfied);
        assert_eq!(report.polls, 1);
        assert_eq!(report.probes.issued, 120);
        assert_eq!(report.probes.delivered, 12);
        assert_eq!(report.probes.swallowed_request, 108);
        assert!(report.anomalies.is_empty());

        let response = InvocationResponse::from_report(&report).unwrap();
        assert_eq!(
            serde_json::to_string(&response).unwrap(),
            r#"{"statusCode":200,"body":"{\"account_id\":\"123456789012\"}"}"#
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_wrong_gateway_fails_run() {
        let account = SimulatedAccount::new("123456789012", "vpce-elsewhere");
        let pipeline = RecoveryPipeline::new(config(), account.registry());

        let err = pipeline.run().await.unwrap_err();
        assert!(matches!(err, TrailprobeError::GatewayMismatch { .. }));
        assert!(err.to_string().contains("check configuration"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_partial_result_after_deadline() {
        let account = SimulatedAccount::new("123456789012", "vpce-0abc");
        let mut config = config();
        config.correlation.stop_after_distinct = 13;
        config.correlation.deadline_secs = 30;
        let pipeline = RecoveryPipeline::new(config, account.registry());

        let report = pipeline.run().await.unwrap();
        assert_eq!(report.outcome, CorrelationState::TimedOut);
        assert_eq!(report.account_id, "123456789012");
        assert!(report.polls > 1);
    }

    #[test]
    fn test_probe_patterns() {
        let patterns = RecoveryPipeline::probe_patterns();
        assert_eq!(patterns.len(), 120);
        assert_eq!(patterns[0].to_string(), "0???????????");
        assert_eq!(patterns[119].to_string(), "???????????9");
    }
}
