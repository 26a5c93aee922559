//! Signed HTTP transport for AWS APIs.
//!
//! Epistemic foundation:
//! - K_i: Every AWS call is an HTTPS request signed with SigV4
//! - B_i: API will respond within timeout (might fail)
//! - B_i: Error bodies carry a code (JSON `__type` or XML `<Code>`)
//! - I^B: Network availability and throttling unknowable → retry with backoff

use crate::client::sigv4::{SignableRequest, Signer};
use crate::client::RateLimiter;
use crate::models::{AwsError, Credentials, Result, TrailprobeError};
use chrono::Utc;
use dashmap::DashMap;
use regex::Regex;
use reqwest::{Method, Url};
use std::sync::{Arc, OnceLock};
use std::time::{Duration, Instant};
use tracing::debug;

/// Error codes AWS uses to signal throttling.
const THROTTLE_CODES: &[&str] = &[
    "Throttling",
    "ThrottlingException",
    "ThrottledException",
    "RequestLimitExceeded",
    "TooManyRequestsException",
    "SlowDown",
];

/// Longest pause between two attempts of one call.
const MAX_RETRY_BACKOFF_SECS: u64 = 30;

/// One AWS request before signing.
#[derive(Debug, Clone)]
pub struct AwsRequest {
    /// Signing name, also the rate limiter key (`sts`, `s3`, `cloudtrail`)
    pub service: &'static str,
    pub method: Method,
    pub url: Url,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
}

impl AwsRequest {
    pub fn new(service: &'static str, method: Method, url: Url) -> Self {
        Self {
            service,
            method,
            url,
            headers: Vec::new(),
            body: Vec::new(),
        }
    }

    pub fn header(mut self, name: &str, value: impl Into<String>) -> Self {
        self.headers.push((name.to_ascii_lowercase(), value.into()));
        self
    }

    pub fn body(mut self, body: impl Into<Vec<u8>>) -> Self {
        self.body = body.into();
        self
    }
}

/// Successful response from an AWS call.
#[derive(Debug, Clone)]
pub struct AwsResponse {
    pub status: u16,
    pub body: String,
    pub duration: Duration,
}

/// Signed, rate-limited, retrying client shared by every AWS adapter.
pub struct AwsClient {
    client: reqwest::Client,
    /// Region used in the signing scope
    region: String,
    /// The engine's own credentials
    credentials: Credentials,
    /// Request timeout
    timeout: Duration,
    /// Maximum attempts per call
    max_retries: u32,
    /// Rate limiter
    rate_limiter: Arc<RateLimiter>,
}

impl AwsClient {
    /// Create a new AWS client.
    pub fn new(
        region: String,
        credentials: Credentials,
        timeout_secs: u64,
        max_retries: u32,
        rate_limiter: Option<Arc<RateLimiter>>,
    ) -> Result<Self> {
        let timeout = Duration::from_secs(timeout_secs);

        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(TrailprobeError::Network)?;

        Ok(Self {
            client,
            region,
            credentials,
            timeout,
            max_retries: max_retries.max(1),
            rate_limiter: rate_limiter.unwrap_or_else(|| Arc::new(RateLimiter::new())),
        })
    }

    pub fn region(&self) -> &str {
        &self.region
    }

    /// Get the rate limiter.
    pub fn rate_limiter(&self) -> &Arc<RateLimiter> {
        &self.rate_limiter
    }

    /// Send a request signed with the engine's own credentials.
    pub async fn send(&self, request: &AwsRequest) -> Result<AwsResponse> {
        self.send_with(request, &self.credentials).await
    }

    /// Send a request signed with the given credentials.
    ///
    /// B_i(API available) → Result
    /// I^B(throttling) → adaptive backoff via the shared rate limiter
    pub async fn send_with(
        &self,
        request: &AwsRequest,
        credentials: &Credentials,
    ) -> Result<AwsResponse> {
        let start = Instant::now();
        let service = request.service;
        let signer = Signer::new(credentials, &self.region, service);
        let mut last_error: Option<TrailprobeError> = None;

        for attempt in 0..self.max_retries {
            self.rate_limiter.wait_if_needed(service).await;

            let signable = SignableRequest {
                method: request.method.as_str(),
                url: &request.url,
                headers: &request.headers,
                body: &request.body,
            };
            let signed_headers = signer.sign(&signable, Utc::now());

            let mut builder = self
                .client
                .request(request.method.clone(), request.url.clone())
                .body(request.body.clone());
            for (name, value) in request.headers.iter().chain(signed_headers.iter()) {
                builder = builder.header(name.as_str(), value.as_str());
            }

            let response = match builder.send().await {
                Ok(r) => r,
                Err(e) => {
                    if e.is_timeout() {
                        last_error = Some(TrailprobeError::Timeout(self.timeout));
                    } else {
                        last_error = Some(TrailprobeError::Network(e));
                    }
                    self.backoff(service, attempt, "network error").await;
                    continue;
                }
            };

            let status = response.status().as_u16();
            let retry_after = response
                .headers()
                .get("retry-after")
                .and_then(|v| v.to_str().ok())
                .and_then(|s| s.parse::<f64>().ok());
            let body = match response.text().await {
                Ok(body) => body,
                Err(e) => {
                    last_error = Some(TrailprobeError::Network(e));
                    self.backoff(service, attempt, "body read error").await;
                    continue;
                }
            };

            if (200..300).contains(&status) {
                self.rate_limiter.record_request(service, false, None);
                return Ok(AwsResponse {
                    status,
                    body,
                    duration: start.elapsed(),
                });
            }

            let error = classify_error(service, status, &body, retry_after);
            let throttled = matches!(error, AwsError::Throttled { .. });
            self.rate_limiter
                .record_request(service, throttled, retry_after);

            if throttled {
                // The rate limiter already holds the backoff for the next attempt
                debug!(service = service, attempt = attempt, "Throttled, retrying");
                last_error = Some(TrailprobeError::Aws(error));
                continue;
            }

            // Client errors other than throttling will not improve on retry
            if status < 500 {
                return Err(TrailprobeError::Aws(error));
            }

            last_error = Some(TrailprobeError::Aws(error));
            self.backoff(service, attempt, "server error").await;
        }

        Err(match last_error {
            Some(TrailprobeError::Aws(AwsError::Throttled { .. })) | None => {
                TrailprobeError::Aws(AwsError::MaxRetriesExceeded {
                    service: service.to_string(),
                    attempts: self.max_retries,
                    last_error: "throttled".to_string(),
                })
            }
            Some(other) => other,
        })
    }

    async fn backoff(&self, service: &str, attempt: u32, reason: &str) {
        if attempt + 1 < self.max_retries {
            let backoff = retry_backoff(attempt);
            debug!(
                service = service,
                attempt = attempt,
                backoff_secs = backoff.as_secs(),
                reason = reason,
                "Retrying AWS call"
            );
            tokio::time::sleep(backoff).await;
        }
    }
}

/// Exponential delay before retry `attempt + 1`, capped.
fn retry_backoff(attempt: u32) -> Duration {
    Duration::from_secs(2u64.saturating_pow(attempt).min(MAX_RETRY_BACKOFF_SECS))
}

/// Pull `(code, message)` out of a JSON or XML AWS error body.
pub fn parse_error_body(body: &str) -> (Option<String>, Option<String>) {
    if let Ok(value) = serde_json::from_str::<serde_json::Value>(body) {
        let code = value
            .get("__type")
            .or_else(|| value.get("code"))
            .and_then(|v| v.as_str())
            .map(|s| s.rsplit('#').next().unwrap_or(s).to_string());
        let message = value
            .get("message")
            .or_else(|| value.get("Message"))
            .and_then(|v| v.as_str())
            .map(str::to_string);
        return (code, message);
    }

    (xml_field(body, "Code"), xml_field(body, "Message"))
}

/// Extract the text of the first `<tag>...</tag>` element.
pub fn xml_field(body: &str, tag: &str) -> Option<String> {
    xml_pattern(tag)?
        .captures(body)
        .and_then(|c| c.get(1))
        .map(|m| m.as_str().trim().to_string())
}

/// Compiled element pattern for `tag`, built once per tag.
fn xml_pattern(tag: &str) -> Option<Regex> {
    static PATTERNS: OnceLock<DashMap<String, Regex>> = OnceLock::new();
    let patterns = PATTERNS.get_or_init(DashMap::new);
    if let Some(re) = patterns.get(tag) {
        return Some(re.clone());
    }

    let tag_pattern = regex::escape(tag);
    let re = Regex::new(&format!(r"(?s)<{tag_pattern}>(.*?)</{tag_pattern}>")).ok()?;
    patterns.insert(tag.to_string(), re.clone());
    Some(re)
}

fn classify_error(service: &str, status: u16, body: &str, retry_after: Option<f64>) -> AwsError {
    let (code, message) = parse_error_body(body);
    let code = code.unwrap_or_else(|| format!("Http{status}"));
    let message = message.unwrap_or_else(|| body.chars().take(200).collect());

    if status == 429 || THROTTLE_CODES.contains(&code.as_str()) {
        return AwsError::Throttled {
            service: service.to_string(),
            message,
            retry_after_secs: retry_after,
        };
    }

    if status == 403 || code.starts_with("AccessDenied") {
        return AwsError::AccessDenied(format!("{service}: {code}: {message}"));
    }

    AwsError::Service {
        service: service.to_string(),
        status,
        code,
        message,
    }
}
