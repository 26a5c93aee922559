//! Probe pool: one attributed request per probe.
//!
//! Epistemic foundation:
//! - K_i: A probe's only purpose is to leave an audit record
//! - K_i: Probes are independent and may run in parallel
//! - B_i: Issuance or the request may fail → swallowed, the probe still counts
//! - I^R: Concurrency is configurable (1 = sequential)

use crate::client::{IdentityIssuer, TargetService};
use crate::models::{encode, Pattern};
use indicatif::{ProgressBar, ProgressStyle};
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::Semaphore;
use tracing::{debug, info, warn};

/// Where a swallowed probe failure happened.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ProbeStage {
    /// Credentials could not be obtained
    Issuance,
    /// The request against the target failed (denied, throttled, network)
    Request,
}

/// Fire-and-forget result of one probe.
///
/// Both variants count as issued: a denied request is still logged, and a
/// failed issuance is not retried within the run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProbeDelivery {
    /// The request went out and the target answered with success
    Delivered,
    /// Something failed along the way; ignored for sequencing
    Swallowed { stage: ProbeStage, reason: String },
}

impl ProbeDelivery {
    /// Always true; the probe phase never waits on or retries a probe.
    pub fn is_issued(&self) -> bool {
        true
    }
}

/// Counts for one pass over the probe space.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ProbeReport {
    pub issued: usize,
    pub delivered: usize,
    pub swallowed_issuance: usize,
    pub swallowed_request: usize,
    /// Probe tasks that panicked
    pub lost: usize,
}

impl ProbeReport {
    fn record(&mut self, delivery: &ProbeDelivery) {
        if delivery.is_issued() {
            self.issued += 1;
        }
        match delivery {
            ProbeDelivery::Delivered => self.delivered += 1,
            ProbeDelivery::Swallowed {
                stage: ProbeStage::Issuance,
                ..
            } => self.swallowed_issuance += 1,
            ProbeDelivery::Swallowed {
                stage: ProbeStage::Request,
                ..
            } => self.swallowed_request += 1,
        }
    }
}

/// Everything a single probe needs, shared across spawned tasks.
struct ProbeContext {
    issuer: Arc<dyn IdentityIssuer>,
    target: Arc<dyn TargetService>,
    role_arn: String,
    resource: String,
}

impl ProbeContext {
    async fn probe(&self, pattern: &Pattern) -> ProbeDelivery {
        let label = encode(pattern);

        let credentials = match self.issuer.assume(&self.role_arn, &label).await {
            Ok(c) => c,
            Err(e) => {
                warn!(session = %label, error = %e, "Credential issuance failed, probe skipped");
                return ProbeDelivery::Swallowed {
                    stage: ProbeStage::Issuance,
                    reason: e.to_string(),
                };
            }
        };

        debug!(resource = %self.resource, session = %label, "Requesting resource");
        match self.target.probe_operation(&credentials, &self.resource).await {
            Ok(()) => ProbeDelivery::Delivered,
            Err(e) => {
                // Denied requests are the common case and are still logged
                debug!(session = %label, error = %e, "Probe request failed (ignored)");
                ProbeDelivery::Swallowed {
                    stage: ProbeStage::Request,
                    reason: e.to_string(),
                }
            }
        }
    }
}

/// Pool issuing probes with bounded concurrency.
pub struct ProbePool {
    context: Arc<ProbeContext>,
    /// Pool size (max probes in flight)
    pool_size: usize,
    /// Semaphore for concurrency control
    semaphore: Arc<Semaphore>,
    /// Draw a progress bar while probing
    show_progress: bool,
}

impl ProbePool {
    /// Create a new probe pool.
    pub fn new(
        issuer: Arc<dyn IdentityIssuer>,
        target: Arc<dyn TargetService>,
        role_arn: String,
        resource: String,
        pool_size: usize,
    ) -> Self {
        let pool_size = pool_size.max(1);
        Self {
            context: Arc::new(ProbeContext {
                issuer,
                target,
                role_arn,
                resource,
            }),
            pool_size,
            semaphore: Arc::new(Semaphore::new(pool_size)),
            show_progress: false,
        }
    }

    pub fn with_progress(mut self, show: bool) -> Self {
        self.show_progress = show;
        self
    }

    /// Issue a single probe.
    pub async fn probe(&self, pattern: &Pattern) -> ProbeDelivery {
        self.context.probe(pattern).await
    }

    /// Issue every probe once and wait for all of them.
    ///
    /// A pool size of 1 issues probes one after another in the given order;
    /// larger pools spawn a task per probe and complete in any order.
    pub async fn probe_all(&self, patterns: Vec<Pattern>) -> ProbeReport {
        let total = patterns.len();
        info!(
            probes = total,
            concurrency = self.pool_size,
            resource = %self.context.resource,
            "Issuing probes"
        );

        let pb = if self.show_progress {
            let pb = ProgressBar::new(total as u64);
            if let Ok(style) = ProgressStyle::default_bar()
                .template("[{elapsed_precise}] {bar:40.cyan/blue} {pos}/{len} probes {msg}")
            {
                pb.set_style(style.progress_chars("##-"));
            }
            pb
        } else {
            ProgressBar::hidden()
        };

        let mut report = ProbeReport::default();

        if self.pool_size == 1 {
            for pattern in patterns {
                let delivery = self.context.probe(&pattern).await;
                report.record(&delivery);
                tick(&pb, &report);
            }
        } else {
            let mut handles = Vec::with_capacity(total);
            for pattern in patterns {
                let context = Arc::clone(&self.context);
                let semaphore = Arc::clone(&self.semaphore);
                handles.push(tokio::spawn(async move {
                    let _permit = match semaphore.acquire_owned().await {
                        Ok(p) => p,
                        Err(_) => {
                            return ProbeDelivery::Swallowed {
                                stage: ProbeStage::Issuance,
                                reason: "probe pool closed".to_string(),
                            };
                        }
                    };
                    context.probe(&pattern).await
                }));
            }

            for handle in handles {
                match handle.await {
                    Ok(delivery) => report.record(&delivery),
                    Err(e) => {
                        warn!(error = %e, "Probe task panicked");
                        report.lost += 1;
                    }
                }
                tick(&pb, &report);
            }
        }
        pb.finish_and_clear();

        info!(
            issued = report.issued,
            delivered = report.delivered,
            swallowed_issuance = report.swallowed_issuance,
            swallowed_request = report.swallowed_request,
            "All probes issued"
        );
        report
    }
}

fn tick(pb: &ProgressBar, report: &ProbeReport) {
    pb.inc(1);
    pb.set_message(format!(
        "delivered: {}, swallowed: {}",
        report.delivered,
        report.swallowed_issuance + report.swallowed_request
    ));
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{
        probe_space, AwsError, Credentials, IdentityLabel, Probe, Result, TrailprobeError,
        ACCOUNT_ID_WIDTH, DIGIT_RANGE,
    };
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    /// Issues credentials named after the session, failing for position 0.
    struct FakeIssuer {
        calls: Mutex<Vec<(String, String)>>,
    }

    #[async_trait]
    impl IdentityIssuer for FakeIssuer {
        async fn assume(&self, role_arn: &str, label: &IdentityLabel) -> Result<Credentials> {
            self.calls
                .lock()
                .unwrap()
                .push((role_arn.to_string(), label.to_string()));
            if label.as_str().starts_with(|c: char| c.is_ascii_digit()) {
                return Err(TrailprobeError::Issuance {
                    session: label.to_string(),
                    source: AwsError::AccessDenied("not allowed".to_string()),
                });
            }
            Ok(Credentials::new(label.as_str(), "secret", None))
        }
    }

    /// Denies every request whose session carries digit 3.
    struct FakeTarget {
        requests: AtomicUsize,
        in_flight: AtomicUsize,
        max_in_flight: AtomicUsize,
    }

    #[async_trait]
    impl TargetService for FakeTarget {
        async fn probe_operation(&self, credentials: &Credentials, resource: &str) -> Result<()> {
            assert_eq!(resource, "target-bucket");
            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_in_flight.fetch_max(now, Ordering::SeqCst);
            tokio::task::yield_now().await;
            self.in_flight.fetch_sub(1, Ordering::SeqCst);
            self.requests.fetch_add(1, Ordering::SeqCst);

            if credentials.access_key_id.contains('3') {
                return Err(TrailprobeError::Aws(AwsError::AccessDenied(
                    "s3: AccessDenied".to_string(),
                )));
            }
            Ok(())
        }
    }

    fn pool(size: usize) -> (ProbePool, Arc<FakeIssuer>, Arc<FakeTarget>) {
        let issuer = Arc::new(FakeIssuer {
            calls: Mutex::new(Vec::new()),
        });
        let target = Arc::new(FakeTarget {
            requests: AtomicUsize::new(0),
            in_flight: AtomicUsize::new(0),
            max_in_flight: AtomicUsize::new(0),
        });
        let pool = ProbePool::new(
            issuer.clone(),
            target.clone(),
            "arn:aws:iam::111122223333:role/probe-role".to_string(),
            "target-bucket".to_string(),
            size,
        );
        (pool, issuer, target)
    }

    fn patterns() -> Vec<Pattern> {
        probe_space(ACCOUNT_ID_WIDTH, DIGIT_RANGE)
            .into_iter()
            .map(|p| Pattern::new(ACCOUNT_ID_WIDTH, p))
            .collect()
    }

    #[tokio::test]
    async fn test_failures_are_swallowed_and_counted() {
        let (pool, issuer, target) = pool(1);
        let report = pool.probe_all(patterns()).await;

        // Position 0 (10 probes) fails issuance; 11 remaining probes carry a 3
        assert_eq!(report.issued, 120);
        assert_eq!(report.swallowed_issuance, 10);
        assert_eq!(report.swallowed_request, 11);
        assert_eq!(report.delivered, 99);
        assert_eq!(report.lost, 0);
        assert_eq!(target.requests.load(Ordering::SeqCst), 110);
        assert_eq!(issuer.calls.lock().unwrap().len(), 120);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_sequential_pool_preserves_order() {
        let (pool, issuer, target) = pool(1);
        pool.probe_all(patterns()).await;

        assert_eq!(target.max_in_flight.load(Ordering::SeqCst), 1);
        let calls = issuer.calls.lock().unwrap();
        assert_eq!(calls[0].1, "0-----------");
        assert_eq!(calls[11].1, "-1----------");
        assert_eq!(calls[119].1, "-----------9");
        assert!(calls
            .iter()
            .all(|(role, _)| role == "arn:aws:iam::111122223333:role/probe-role"));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrency_is_bounded() {
        let (pool, _issuer, target) = pool(4);
        let report = pool.probe_all(patterns()).await;

        assert_eq!(report.issued, 120);
        assert!(target.max_in_flight.load(Ordering::SeqCst) <= 4);
    }

    #[tokio::test]
    async fn test_single_probe_delivery() {
        let (pool, _issuer, _target) = pool(1);
        let delivered = pool
            .probe(&Pattern::new(ACCOUNT_ID_WIDTH, Probe::new(4, 8)))
            .await;
        assert_eq!(delivered, ProbeDelivery::Delivered);

        let denied = pool
            .probe(&Pattern::new(ACCOUNT_ID_WIDTH, Probe::new(4, 3)))
            .await;
        assert!(matches!(
            denied,
            ProbeDelivery::Swallowed {
                stage: ProbeStage::Request,
                ..
            }
        ));
        assert!(denied.is_issued());
    }
}
