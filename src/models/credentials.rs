//! AWS credential bundles.

use chrono::{DateTime, Utc};
use std::fmt;

/// Access key, secret and optional session token.
///
/// K_i: Debug output never contains the secret or the token.
#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    pub access_key_id: String,
    pub secret_access_key: String,
    pub session_token: Option<String>,
    /// When the issuer says these stop working (temporary credentials only)
    pub expiration: Option<DateTime<Utc>>,
}

impl Credentials {
    pub fn new(
        access_key_id: impl Into<String>,
        secret_access_key: impl Into<String>,
        session_token: Option<String>,
    ) -> Self {
        Self {
            access_key_id: access_key_id.into(),
            secret_access_key: secret_access_key.into(),
            session_token,
            expiration: None,
        }
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("access_key_id", &self.access_key_id)
            .field("secret_access_key", &"<redacted>")
            .field(
                "session_token",
                &self.session_token.as_ref().map(|_| "<redacted>"),
            )
            .field("expiration", &self.expiration)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_debug_redacts_secrets() {
        let creds = Credentials::new("AKIDEXAMPLE", "super-secret", Some("tok".to_string()));
        let rendered = format!("{creds:?}");
        assert!(rendered.contains("AKIDEXAMPLE"));
        assert!(!rendered.contains("super-secret"));
        assert!(!rendered.contains("tok\""));
    }
}
