//! Configuration models for trailprobe.
//!
//! All I^R (resolvable ignorance) is parameterized here.
//! The user resolves these unknowns at runtime via config file or the
//! deployment environment.

use super::{Credentials, DIGIT_RANGE};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Top-level configuration for trailprobe.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// AWS account access used by the engine itself
    pub aws: AwsConfig,

    /// Service endpoints (gateway entry points)
    #[serde(default)]
    pub endpoints: EndpointsConfig,

    /// Bucket, gateway and probing role
    pub target: TargetConfig,

    /// Probe issuance settings
    #[serde(default)]
    pub probing: ProbingConfig,

    /// Audit log correlation settings
    #[serde(default)]
    pub correlation: CorrelationConfig,
}

/// AWS access configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AwsConfig {
    /// Region of the VPC, the gateway and the bucket
    pub region: String,

    /// Explicit access key id (otherwise read from `access_key_id_env`)
    #[serde(default)]
    pub access_key_id: Option<String>,

    /// Explicit secret access key (otherwise read from `secret_access_key_env`)
    #[serde(default)]
    pub secret_access_key: Option<String>,

    /// Explicit session token (otherwise read from `session_token_env`, if set)
    #[serde(default)]
    pub session_token: Option<String>,

    #[serde(default = "default_access_key_id_env")]
    pub access_key_id_env: String,

    #[serde(default = "default_secret_access_key_env")]
    pub secret_access_key_env: String,

    #[serde(default = "default_session_token_env")]
    pub session_token_env: String,

    /// Request timeout in seconds
    #[serde(default = "default_timeout")]
    pub timeout_secs: u64,

    /// Maximum attempts per AWS call
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
}

/// Upper bound for `aws.max_retries`.
pub const MAX_RETRIES_LIMIT: u32 = 10;

fn default_access_key_id_env() -> String {
    "AWS_ACCESS_KEY_ID".to_string()
}

fn default_secret_access_key_env() -> String {
    "AWS_SECRET_ACCESS_KEY".to_string()
}

fn default_session_token_env() -> String {
    "AWS_SESSION_TOKEN".to_string()
}

fn default_timeout() -> u64 {
    30
}

fn default_max_retries() -> u32 {
    3
}

/// Service endpoints.
///
/// Values may be bare hosts (`vpce-123.sts.eu-west-1.vpce.amazonaws.com`) or
/// full URLs. Unset endpoints fall back to the regional public endpoint.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EndpointsConfig {
    #[serde(default)]
    pub sts: Option<String>,

    #[serde(default)]
    pub cloudtrail: Option<String>,

    /// Override for the S3 endpoint; the bucket is then addressed path-style
    #[serde(default)]
    pub s3: Option<String>,
}

/// What is being probed and how it is attributed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TargetConfig {
    /// Bucket whose owner is being recovered
    pub bucket: String,

    /// VPC endpoint id every probe must transit (e.g. `vpce-0abc...`)
    pub gateway_id: String,

    /// Role assumed for every probe session
    pub role_arn: String,

    /// Role name as it appears in the audit trail (derived from the ARN if unset)
    #[serde(default)]
    pub role_name: Option<String>,
}

/// Probe issuance configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProbingConfig {
    /// Probes in flight at once (1 = strictly sequential)
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,

    /// Lifetime requested for each probe session
    #[serde(default = "default_session_duration")]
    pub session_duration_secs: u32,
}

fn default_concurrency() -> usize {
    1
}

fn default_session_duration() -> u32 {
    900
}

impl Default for ProbingConfig {
    fn default() -> Self {
        Self {
            concurrency: default_concurrency(),
            session_duration_secs: default_session_duration(),
        }
    }
}

/// Correlation configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CorrelationConfig {
    /// Audit event name the probes produce
    #[serde(default = "default_event_name")]
    pub event_name: String,

    /// Give up this long after probing started
    #[serde(default = "default_deadline")]
    pub deadline_secs: u64,

    /// Query the log from this long before probing started
    #[serde(default = "default_lookback")]
    pub lookback_secs: u64,

    /// Pause between polls
    #[serde(default = "default_poll_interval")]
    pub poll_interval_secs: u64,

    /// Stop once this many distinct session labels have been decoded
    #[serde(default = "default_stop_after_distinct")]
    pub stop_after_distinct: usize,
}

fn default_event_name() -> String {
    "GetBucketAcl".to_string()
}

fn default_deadline() -> u64 {
    600
}

fn default_lookback() -> u64 {
    60
}

fn default_poll_interval() -> u64 {
    5
}

fn default_stop_after_distinct() -> usize {
    DIGIT_RANGE as usize
}

impl Default for CorrelationConfig {
    fn default() -> Self {
        Self {
            event_name: default_event_name(),
            deadline_secs: default_deadline(),
            lookback_secs: default_lookback(),
            poll_interval_secs: default_poll_interval(),
            stop_after_distinct: default_stop_after_distinct(),
        }
    }
}

impl Config {
    /// Load configuration from a TOML file.
    ///
    /// B_i(file exists) → Result
    /// B_i(file is valid TOML) → Result
    pub fn from_file(path: &std::path::Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::FileRead {
            path: path.to_owned(),
            source: e,
        })?;

        let config: Self = toml::from_str(&content).map_err(|e| ConfigError::Parse {
            path: path.to_owned(),
            source: e,
        })?;

        Ok(config.expanded())
    }

    /// Build configuration from the deployment environment.
    ///
    /// Reads `REGION`, `S3_GATEWAY_ID`, `STS_GATEWAY_ENTRY_POINT`,
    /// `CLOUDTRAIL_GATEWAY_ENTRY_POINT`, `BUCKET_NAME`, `ROLE_ARN` and the
    /// optional `ROLE_NAME`.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let required = |key: &str| lookup(key).ok_or_else(|| ConfigError::MissingEnv(key.into()));

        Ok(Self {
            aws: AwsConfig {
                region: required("REGION")?,
                access_key_id: None,
                secret_access_key: None,
                session_token: None,
                access_key_id_env: default_access_key_id_env(),
                secret_access_key_env: default_secret_access_key_env(),
                session_token_env: default_session_token_env(),
                timeout_secs: default_timeout(),
                max_retries: default_max_retries(),
            },
            endpoints: EndpointsConfig {
                sts: Some(required("STS_GATEWAY_ENTRY_POINT")?),
                cloudtrail: Some(required("CLOUDTRAIL_GATEWAY_ENTRY_POINT")?),
                s3: None,
            },
            target: TargetConfig {
                bucket: required("BUCKET_NAME")?,
                gateway_id: required("S3_GATEWAY_ID")?,
                role_arn: required("ROLE_ARN")?,
                role_name: lookup("ROLE_NAME"),
            },
            probing: ProbingConfig::default(),
            correlation: CorrelationConfig::default(),
        })
    }

    /// Apply `${VAR}` expansion to every free-form string value.
    fn expanded(mut self) -> Self {
        let expand_opt = |v: &mut Option<String>| {
            if let Some(s) = v.as_mut() {
                *s = expand_env_vars(s);
            }
        };

        self.aws.region = expand_env_vars(&self.aws.region);
        expand_opt(&mut self.aws.access_key_id);
        expand_opt(&mut self.aws.secret_access_key);
        expand_opt(&mut self.aws.session_token);
        expand_opt(&mut self.endpoints.sts);
        expand_opt(&mut self.endpoints.cloudtrail);
        expand_opt(&mut self.endpoints.s3);
        self.target.bucket = expand_env_vars(&self.target.bucket);
        self.target.gateway_id = expand_env_vars(&self.target.gateway_id);
        self.target.role_arn = expand_env_vars(&self.target.role_arn);
        expand_opt(&mut self.target.role_name);
        self
    }

    /// Check values the engine cannot work without.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let non_empty = [
            ("aws.region", &self.aws.region),
            ("target.bucket", &self.target.bucket),
            ("target.gateway_id", &self.target.gateway_id),
            ("target.role_arn", &self.target.role_arn),
            ("correlation.event_name", &self.correlation.event_name),
        ];
        for (field, value) in non_empty {
            if value.trim().is_empty() || value.contains("${") {
                return Err(ConfigError::Invalid {
                    field: field.to_string(),
                    reason: "must be set".to_string(),
                });
            }
        }

        if !self.target.role_arn.starts_with("arn:") || !self.target.role_arn.contains(":role/") {
            return Err(ConfigError::Invalid {
                field: "target.role_arn".to_string(),
                reason: format!("'{}' is not a role ARN", self.target.role_arn),
            });
        }
        if self.probing.concurrency == 0 {
            return Err(ConfigError::Invalid {
                field: "probing.concurrency".to_string(),
                reason: "must be at least 1".to_string(),
            });
        }
        if !(1..=MAX_RETRIES_LIMIT).contains(&self.aws.max_retries) {
            return Err(ConfigError::Invalid {
                field: "aws.max_retries".to_string(),
                reason: format!("must be between 1 and {MAX_RETRIES_LIMIT}"),
            });
        }
        if self.correlation.stop_after_distinct == 0 {
            return Err(ConfigError::Invalid {
                field: "correlation.stop_after_distinct".to_string(),
                reason: "must be at least 1".to_string(),
            });
        }
        if !(900..=43_200).contains(&self.probing.session_duration_secs) {
            return Err(ConfigError::Invalid {
                field: "probing.session_duration_secs".to_string(),
                reason: "must be between 900 and 43200".to_string(),
            });
        }
        Ok(())
    }

    /// Role name as recorded in the session issuer of audit events.
    pub fn role_name(&self) -> String {
        self.target
            .role_name
            .clone()
            .unwrap_or_else(|| role_name_from_arn(&self.target.role_arn).to_string())
    }

    /// Base URL for STS calls.
    pub fn sts_url(&self) -> String {
        endpoint_url(
            self.endpoints.sts.as_deref(),
            &format!("sts.{}.amazonaws.com", self.aws.region),
        )
    }

    /// Base URL for CloudTrail calls.
    pub fn cloudtrail_url(&self) -> String {
        endpoint_url(
            self.endpoints.cloudtrail.as_deref(),
            &format!("cloudtrail.{}.amazonaws.com", self.aws.region),
        )
    }

    /// Resolve the engine's own AWS credentials from config or environment.
    ///
    /// B_i(credentials available) → Result
    pub fn resolve_credentials(&self) -> Result<Credentials, ConfigError> {
        let resolve = |explicit: &Option<String>, env_var: &str| -> Option<String> {
            explicit.clone().or_else(|| std::env::var(env_var).ok())
        };

        let access_key_id = resolve(&self.aws.access_key_id, &self.aws.access_key_id_env)
            .ok_or_else(|| ConfigError::MissingCredentials {
                env_var: self.aws.access_key_id_env.clone(),
            })?;
        let secret_access_key =
            resolve(&self.aws.secret_access_key, &self.aws.secret_access_key_env).ok_or_else(
                || ConfigError::MissingCredentials {
                    env_var: self.aws.secret_access_key_env.clone(),
                },
            )?;
        let session_token = resolve(&self.aws.session_token, &self.aws.session_token_env);

        Ok(Credentials::new(access_key_id, secret_access_key, session_token))
    }
}

/// Last path segment of a role ARN (`arn:aws:iam::1:role/path/name` → `name`).
pub fn role_name_from_arn(arn: &str) -> &str {
    arn.rsplit('/').next().unwrap_or(arn)
}

fn endpoint_url(configured: Option<&str>, fallback_host: &str) -> String {
    let raw = configured.unwrap_or(fallback_host).trim_end_matches('/');
    if raw.starts_with("https://") || raw.starts_with("http://") {
        raw.to_string()
    } else {
        format!("https://{raw}")
    }
}

/// Expand environment variables in a string.
///
/// Supports ${VAR_NAME} syntax.
/// If the variable is not set, the placeholder is left unchanged.
pub fn expand_env_vars(s: &str) -> String {
    let mut result = s.to_string();
    let re = match regex::Regex::new(r"\$\{([^}]+)\}") {
        Ok(re) => re,
        Err(_) => return result,
    };

    for cap in re.captures_iter(s) {
        let var_name = &cap[1];
        if let Ok(value) = std::env::var(var_name) {
            result = result.replace(&cap[0], &value);
        }
    }

    result
}

/// Configuration errors.
///
/// Epistemic origin:
/// - B_i falsified: File not found, parse error, invalid value
/// - I^B materialized: Missing credentials or environment
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {source}")]
    FileRead {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Failed to parse config file {path}: {source}")]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },

    #[error("Missing AWS credentials: set {env_var} env var or the value in [aws]")]
    MissingCredentials { env_var: String },

    #[error("Missing environment variable {0}")]
    MissingEnv(String),

    #[error("Invalid value for {field}: {reason}")]
    Invalid { field: String, reason: String },
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::io::Write;
    use tempfile::NamedTempFile;

    const MINIMAL: &str = r#"
[aws]
region = "eu-west-1"
access_key_id = "AKIDEXAMPLE"
secret_access_key = "secret"

[target]
bucket = "target-bucket"
gateway_id = "vpce-0abc"
role_arn = "arn:aws:iam::111122223333:role/probes/probe-role"
"#;

    fn write_config(content: &str) -> NamedTempFile {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(content.as_bytes()).unwrap();
        file
    }

    #[test]
    fn test_minimal_config_defaults() {
        let file = write_config(MINIMAL);
        let config = Config::from_file(file.path()).unwrap();

        assert!(config.validate().is_ok());
        assert_eq!(config.probing.concurrency, 1);
        assert_eq!(config.probing.session_duration_secs, 900);
        assert_eq!(config.correlation.event_name, "GetBucketAcl");
        assert_eq!(config.correlation.deadline_secs, 600);
        assert_eq!(config.correlation.lookback_secs, 60);
        assert_eq!(config.correlation.stop_after_distinct, 10);
        assert_eq!(config.role_name(), "probe-role");
        assert_eq!(config.sts_url(), "https://sts.eu-west-1.amazonaws.com");
        assert_eq!(
            config.cloudtrail_url(),
            "https://cloudtrail.eu-west-1.amazonaws.com"
        );

        let creds = config.resolve_credentials().unwrap();
        assert_eq!(creds.access_key_id, "AKIDEXAMPLE");
    }

    #[test]
    fn test_endpoint_overrides_and_env_expansion() {
        std::env::set_var("TRAILPROBE_TEST_BUCKET", "expanded-bucket");
        let content = format!(
            "{MINIMAL}\n[endpoints]\nsts = \"vpce-1.sts.eu-west-1.vpce.amazonaws.com/\"\ncloudtrail = \"http://localhost:4566\"\n"
        )
        .replace("\"target-bucket\"", "\"${TRAILPROBE_TEST_BUCKET}\"");
        let file = write_config(&content);
        let config = Config::from_file(file.path()).unwrap();

        assert_eq!(config.target.bucket, "expanded-bucket");
        assert_eq!(
            config.sts_url(),
            "https://vpce-1.sts.eu-west-1.vpce.amazonaws.com"
        );
        assert_eq!(config.cloudtrail_url(), "http://localhost:4566");
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let file = write_config(MINIMAL);
        let mut config = Config::from_file(file.path()).unwrap();

        config.target.role_arn = "probe-role".to_string();
        assert!(matches!(
            config.validate(),
            Err(ConfigError::Invalid { ref field, .. }) if field == "target.role_arn"
        ));

        let mut config = Config::from_file(file.path()).unwrap();
        config.target.gateway_id = "${UNSET_GATEWAY}".to_string();
        assert!(config.validate().is_err());

        let mut config = Config::from_file(file.path()).unwrap();
        config.probing.concurrency = 0;
        assert!(config.validate().is_err());

        let mut config = Config::from_file(file.path()).unwrap();
        config.aws.max_retries = 100;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::Invalid { ref field, .. }) if field == "aws.max_retries"
        ));
    }

    #[test]
    fn test_from_lookup() {
        let env: HashMap<&str, &str> = [
            ("REGION", "us-east-2"),
            ("S3_GATEWAY_ID", "vpce-s3"),
            ("STS_GATEWAY_ENTRY_POINT", "vpce-sts.example"),
            ("CLOUDTRAIL_GATEWAY_ENTRY_POINT", "vpce-ct.example"),
            ("BUCKET_NAME", "b"),
            ("ROLE_ARN", "arn:aws:iam::111122223333:role/r"),
            ("ROLE_NAME", "custom-name"),
        ]
        .into_iter()
        .collect();

        let config = Config::from_lookup(|k| env.get(k).map(|v| v.to_string())).unwrap();
        assert_eq!(config.aws.region, "us-east-2");
        assert_eq!(config.target.gateway_id, "vpce-s3");
        assert_eq!(config.role_name(), "custom-name");
        assert_eq!(config.sts_url(), "https://vpce-sts.example");

        let missing = Config::from_lookup(|_| None);
        assert!(matches!(missing, Err(ConfigError::MissingEnv(ref k)) if k == "REGION"));
    }

    #[test]
    fn test_role_name_from_arn() {
        assert_eq!(role_name_from_arn("arn:aws:iam::1:role/a/b/leaf"), "leaf");
        assert_eq!(role_name_from_arn("arn:aws:iam::1:role/plain"), "plain");
    }
}
