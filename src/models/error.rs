//! Error types for trailprobe.
//!
//! Epistemic taxonomy:
//! - B_i falsified: Expected failures (malformed labels, bad config)
//! - I^B materialized: Infrastructure failures (network, throttling, denied)
//! - K_i violated: The deployment premise is false (gateway mismatch)

use std::time::Duration;
use thiserror::Error;

/// Top-level error type for trailprobe.
#[derive(Debug, Error)]
pub enum TrailprobeError {
    // ═══════════════════════════════════════════════════════════════════
    // B_i FALSIFIED — Belief proven wrong (expected failures)
    // ═══════════════════════════════════════════════════════════════════

    #[error("Configuration error: {0}")]
    Config(#[from] super::ConfigError),

    #[error("Malformed session label: {0}")]
    MalformedLabel(#[from] LabelError),

    #[error("Parse error: {0}")]
    ParseError(String),

    // ═══════════════════════════════════════════════════════════════════
    // I^B MATERIALIZED — Bounded ignorance became known-bad
    // ═══════════════════════════════════════════════════════════════════

    #[error("Credential issuance failed for session '{session}': {source}")]
    Issuance {
        session: String,
        #[source]
        source: AwsError,
    },

    #[error("AWS API error: {0}")]
    Aws(#[from] AwsError),

    #[error("Network error: {0}")]
    Network(#[from] reqwest::Error),

    #[error("Request timeout after {0:?}")]
    Timeout(Duration),

    // ═══════════════════════════════════════════════════════════════════
    // K_i VIOLATED — The network topology assumption does not hold
    // ═══════════════════════════════════════════════════════════════════

    #[error(
        "Traffic not going through gateway {expected} (observed {observed:?} for session '{session}'), check configuration"
    )]
    GatewayMismatch {
        expected: String,
        observed: Option<String>,
        session: String,
    },

    #[error("Internal error: {0}")]
    Internal(String),
}

/// AWS API specific errors.
#[derive(Debug, Error)]
pub enum AwsError {
    #[error("Access denied: {0}")]
    AccessDenied(String),

    #[error("Throttled by {service}: {message}")]
    Throttled {
        service: String,
        message: String,
        retry_after_secs: Option<f64>,
    },

    #[error("{service} error (status {status}, code {code}): {message}")]
    Service {
        service: String,
        status: u16,
        code: String,
        message: String,
    },

    #[error("Invalid response from {service}: {message}")]
    InvalidResponse { service: String, message: String },

    #[error("Request to {service} failed after {attempts} attempts: {last_error}")]
    MaxRetriesExceeded {
        service: String,
        attempts: u32,
        last_error: String,
    },
}

/// Why a string is not a valid session label.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LabelError {
    #[error("'{label}' has length {actual}, expected {expected}")]
    WrongLength {
        label: String,
        expected: usize,
        actual: usize,
    },

    #[error("'{label}' contains unexpected character {found:?} at position {position}")]
    InvalidCharacter {
        label: String,
        position: usize,
        found: char,
    },

    #[error("'{label}' carries {digits} digits, expected exactly one")]
    DigitCount { label: String, digits: usize },
}

impl TrailprobeError {
    /// Check if this error is retryable.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Timeout(_)
                | Self::Network(_)
                | Self::Aws(AwsError::Throttled { .. })
                | Self::Aws(AwsError::MaxRetriesExceeded { .. })
        )
    }

    /// Whether this error must abort the whole run.
    ///
    /// K_i: Only a gateway mismatch invalidates the premise of the search.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::GatewayMismatch { .. } | Self::Config(_))
    }

    /// Get retry delay hint in seconds, if applicable.
    pub fn retry_after(&self) -> Option<f64> {
        match self {
            Self::Aws(AwsError::Throttled {
                retry_after_secs, ..
            }) => *retry_after_secs,
            _ => None,
        }
    }
}

/// Result type alias for trailprobe.
pub type Result<T> = std::result::Result<T, TrailprobeError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_gateway_mismatch_is_fatal_not_retryable() {
        let err = TrailprobeError::GatewayMismatch {
            expected: "vpce-1".to_string(),
            observed: None,
            session: "4-----------".to_string(),
        };
        assert!(err.is_fatal());
        assert!(!err.is_retryable());
        assert!(err.to_string().contains("check configuration"));
    }

    #[test]
    fn test_throttle_retry_hint() {
        let err = TrailprobeError::Aws(AwsError::Throttled {
            service: "cloudtrail".to_string(),
            message: "Rate exceeded".to_string(),
            retry_after_secs: Some(2.0),
        });
        assert!(err.is_retryable());
        assert_eq!(err.retry_after(), Some(2.0));

        let denied = TrailprobeError::Aws(AwsError::AccessDenied("nope".to_string()));
        assert!(!denied.is_retryable());
        assert_eq!(denied.retry_after(), None);
    }
}
