//! Audit log correlation: maps logged sessions back to confirmed digits.
//!
//! Epistemic foundation:
//! - K_i: Only requests matching the owner condition transit the gateway
//! - K_i: A decoded label identifies exactly one (position, digit)
//! - B_i: Audit delivery lags by minutes → poll until satisfied or deadline
//! - I^B: A request seen outside the gateway means the network path is
//!   misconfigured → abort, never work around it

use crate::client::{AuditLog, AuditQuery};
use crate::models::{
    assemble, decode, encode, Config, ConfirmedDigits, IdentityLabel, LogEntry, RecordOutcome,
    Result, TrailprobeError, ACCOUNT_ID_WIDTH,
};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Polling loop state, evaluated once per iteration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CorrelationState {
    Polling,
    /// Enough distinct labels observed
    Satisfied,
    /// Deadline reached, result is partial
    TimedOut,
    /// Gateway mismatch observed
    Faulted,
}

/// When probing began, on both clocks.
///
/// The wall clock bounds the log query; the monotonic clock bounds the deadline.
#[derive(Debug, Clone, Copy)]
pub struct ProbeWindow {
    pub started_at: DateTime<Utc>,
    pub started: Instant,
}

impl ProbeWindow {
    pub fn open() -> Self {
        Self {
            started_at: Utc::now(),
            started: Instant::now(),
        }
    }
}

/// Correlator settings resolved from configuration.
#[derive(Debug, Clone)]
pub struct CorrelatorSettings {
    pub event_name: String,
    /// Session issuer role name the probes were issued under
    pub role_name: String,
    pub width: usize,
    pub stop_after_distinct: usize,
    pub deadline: Duration,
    pub lookback: Duration,
    pub poll_interval: Duration,
}

impl CorrelatorSettings {
    pub fn from_config(config: &Config) -> Self {
        let correlation = &config.correlation;
        Self {
            event_name: correlation.event_name.clone(),
            role_name: config.role_name(),
            width: ACCOUNT_ID_WIDTH,
            stop_after_distinct: correlation.stop_after_distinct,
            deadline: Duration::from_secs(correlation.deadline_secs),
            lookback: Duration::from_secs(correlation.lookback_secs),
            poll_interval: Duration::from_secs(correlation.poll_interval_secs),
        }
    }
}

/// Outcome of a correlation pass.
#[derive(Debug, Clone)]
pub struct Correlation {
    pub digits: ConfirmedDigits,
    /// Every distinct label decoded so far
    pub distinct_labels: BTreeSet<IdentityLabel>,
    pub outcome: CorrelationState,
    pub polls: usize,
    /// Entries that passed the operation/resource/role filter
    pub attributed_entries: usize,
    pub malformed_labels: usize,
    /// Log documents the audit adapter could not parse
    pub unparsed_events: usize,
}

impl Correlation {
    fn new() -> Self {
        Self {
            digits: ConfirmedDigits::new(),
            distinct_labels: BTreeSet::new(),
            outcome: CorrelationState::Polling,
            polls: 0,
            attributed_entries: 0,
            malformed_labels: 0,
            unparsed_events: 0,
        }
    }

    /// Assemble the identifier from what has been confirmed.
    pub fn identifier(&self, width: usize) -> String {
        assemble(&self.digits, width)
    }
}

/// Polls the audit log and accumulates confirmed digits.
pub struct Correlator {
    audit_log: Arc<dyn AuditLog>,
    settings: CorrelatorSettings,
}

impl Correlator {
    pub fn new(audit_log: Arc<dyn AuditLog>, settings: CorrelatorSettings) -> Self {
        Self {
            audit_log,
            settings,
        }
    }

    /// Poll until satisfied, timed out or faulted.
    ///
    /// The first poll always happens, even past the deadline. Every other
    /// poll is cut off at the deadline; entries read before the cut are kept.
    ///
    /// # Errors
    ///
    /// Returns `TrailprobeError::GatewayMismatch` as soon as an attributed
    /// entry did not transit `expected_gateway_id`. Every other audit log
    /// failure is logged and retried by the next poll.
    pub async fn correlate(
        &self,
        expected_gateway_id: &str,
        window: &ProbeWindow,
        target_resource: &str,
    ) -> Result<Correlation> {
        let lookback = chrono::Duration::from_std(self.settings.lookback)
            .map_err(|e| TrailprobeError::Internal(format!("Invalid lookback: {e}")))?;
        let query = AuditQuery {
            event_name: self.settings.event_name.clone(),
            start_time: window.started_at - lookback,
        };
        let deadline = window.started + self.settings.deadline;

        info!(
            event_name = %query.event_name,
            start_time = %query.start_time,
            gateway = expected_gateway_id,
            deadline_secs = self.settings.deadline.as_secs(),
            "Correlating audit log"
        );

        let mut correlation = Correlation::new();
        let mut fault = None;

        loop {
            correlation.polls += 1;
            let unbounded = correlation.polls == 1 && Instant::now() >= deadline;
            let poll = self.poll(&query, expected_gateway_id, target_resource, &mut correlation);
            let polled = if unbounded {
                Ok(poll.await)
            } else {
                tokio::time::timeout_at(deadline, poll).await
            };

            let mut pace = self.settings.poll_interval;
            match polled {
                Ok(Ok(())) => {}
                Ok(Err(e)) if e.is_fatal() => {
                    fault = Some(e);
                }
                Ok(Err(e)) => {
                    if let Some(secs) = e.retry_after() {
                        pace = pace.max(Duration::from_secs_f64(secs));
                    }
                    warn!(
                        poll = correlation.polls,
                        retryable = e.is_retryable(),
                        error = %e,
                        "Audit log poll failed, retrying"
                    );
                }
                Err(_) => {
                    warn!(poll = correlation.polls, "Audit log poll cut off at the deadline");
                }
            }

            correlation.outcome = self.evaluate(&correlation, fault.is_some(), deadline);
            if correlation.outcome != CorrelationState::Polling {
                break;
            }

            debug!(
                poll = correlation.polls,
                distinct_labels = correlation.distinct_labels.len(),
                resolved = correlation.digits.len(),
                "Waiting for more audit entries"
            );
            let wake = (Instant::now() + pace).min(deadline);
            tokio::time::sleep_until(wake).await;
        }

        match correlation.outcome {
            CorrelationState::Faulted => {
                let e = fault.unwrap_or_else(|| {
                    TrailprobeError::Internal("faulted without a recorded fault".to_string())
                });
                warn!(error = %e, polls = correlation.polls, "Correlation aborted");
                return Err(e);
            }
            CorrelationState::TimedOut => warn!(
                polls = correlation.polls,
                resolved = correlation.digits.len(),
                "Deadline reached, returning partial result"
            ),
            _ => info!(
                polls = correlation.polls,
                distinct_labels = correlation.distinct_labels.len(),
                resolved = correlation.digits.len(),
                "Correlation satisfied"
            ),
        }

        Ok(correlation)
    }

    // Stopping rule counts distinct decoded labels, not resolved positions:
    // with duplicates or conflicts the loop can stop with positions unresolved.
    fn evaluate(
        &self,
        correlation: &Correlation,
        faulted: bool,
        deadline: Instant,
    ) -> CorrelationState {
        if faulted {
            CorrelationState::Faulted
        } else if correlation.distinct_labels.len() >= self.settings.stop_after_distinct {
            CorrelationState::Satisfied
        } else if Instant::now() >= deadline {
            CorrelationState::TimedOut
        } else {
            CorrelationState::Polling
        }
    }

    /// Read every page once, recording what each entry proves.
    async fn poll(
        &self,
        query: &AuditQuery,
        expected_gateway_id: &str,
        target_resource: &str,
        correlation: &mut Correlation,
    ) -> Result<()> {
        let mut next_token: Option<String> = None;
        loop {
            let page = self.audit_log.lookup(query, next_token.as_deref()).await?;
            correlation.unparsed_events += page.skipped;

            for entry in &page.entries {
                self.observe(entry, expected_gateway_id, target_resource, correlation)?;
            }

            match page.next_token {
                Some(token) => next_token = Some(token),
                None => return Ok(()),
            }
        }
    }

    fn observe(
        &self,
        entry: &LogEntry,
        expected_gateway_id: &str,
        target_resource: &str,
        correlation: &mut Correlation,
    ) -> Result<()> {
        let settings = &self.settings;
        if entry.event_name.as_deref() != Some(settings.event_name.as_str())
            || entry.bucket_name.as_deref() != Some(target_resource)
            || entry.issuer_role_name.as_deref() != Some(settings.role_name.as_str())
        {
            return Ok(());
        }
        correlation.attributed_entries += 1;

        if entry.vpc_endpoint_id.as_deref() != Some(expected_gateway_id) {
            return Err(TrailprobeError::GatewayMismatch {
                expected: expected_gateway_id.to_string(),
                observed: entry.vpc_endpoint_id.clone(),
                session: entry.session_label.clone().unwrap_or_default(),
            });
        }

        let Some(raw_label) = entry.session_label.as_deref() else {
            correlation.malformed_labels += 1;
            return Ok(());
        };
        let pattern = match decode(raw_label, settings.width) {
            Ok(p) => p,
            Err(e) => {
                debug!(event_id = ?entry.event_id, error = %e, "Skipping undecodable session");
                correlation.malformed_labels += 1;
                return Ok(());
            }
        };

        let label = encode(&pattern);
        if !correlation.distinct_labels.insert(label.clone()) {
            return Ok(());
        }

        let probe = pattern.probe();
        match correlation.digits.record(probe, &label) {
            RecordOutcome::Confirmed => info!(
                position = probe.position,
                digit = probe.digit,
                session = %label,
                "Digit confirmed"
            ),
            RecordOutcome::Conflict { kept } => warn!(
                position = probe.position,
                kept,
                conflicting = probe.digit,
                session = %label,
                "Conflicting evidence, keeping first digit"
            ),
            RecordOutcome::Duplicate => {}
        }
        Ok(())
    }
}
