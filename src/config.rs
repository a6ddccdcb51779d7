//! Driver Configuration
//!
//! Configuration is read from a YAML file and may be overridden from the
//! command line. All sections have defaults so a file only needs to carry
//! the appliance connection and the dataset parent.

use crate::appliance::session::Credentials;
use crate::driver::model::ProvisioningMode;
use crate::error::{Error, Result};
use crate::naming::DatasetLayout;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

// =============================================================================
// Appliance Connection
// =============================================================================

/// Connection settings for the appliance management API
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ApplianceConfig {
    /// Base URL of the appliance (the `/api/v2.0/` suffix is added)
    pub url: String,
    /// API key, sent as a bearer credential when requesting a session token
    pub api_key: Option<String>,
    /// Username for basic-auth token requests (alternative to `api_key`)
    pub username: Option<String>,
    /// Password for basic-auth token requests
    pub password: Option<String>,
    /// Verify the appliance TLS certificate
    pub verify_tls: bool,
    /// Per-request timeout in seconds
    pub request_timeout_secs: u64,
    /// Lifetime requested for session tokens, in seconds
    pub token_ttl_secs: u64,
}

impl Default for ApplianceConfig {
    fn default() -> Self {
        Self {
            url: String::new(),
            api_key: None,
            username: None,
            password: None,
            verify_tls: true,
            request_timeout_secs: 30,
            token_ttl_secs: 600,
        }
    }
}

impl ApplianceConfig {
    /// Request timeout as a duration
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    /// Credentials used to obtain session tokens
    pub fn credentials(&self) -> Result<Credentials> {
        match (&self.api_key, &self.username, &self.password) {
            (Some(key), _, _) if !key.is_empty() => Ok(Credentials::ApiKey(key.clone())),
            (_, Some(username), Some(password)) if !username.is_empty() => {
                Ok(Credentials::Password {
                    username: username.clone(),
                    password: password.clone(),
                })
            }
            _ => Err(Error::Configuration(
                "appliance credentials missing: set api_key or username/password".into(),
            )),
        }
    }
}

// =============================================================================
// Retry Policy
// =============================================================================

/// Bounded exponential backoff for transient appliance failures
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Total attempts per call, including the first one
    pub max_attempts: u32,
    /// Delay before the first retry, in milliseconds
    pub initial_backoff_ms: u64,
    /// Upper bound on a single delay, in milliseconds
    pub max_backoff_ms: u64,
    /// Growth factor between delays
    pub multiplier: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_backoff_ms: 200,
            max_backoff_ms: 2_000,
            multiplier: 2.0,
        }
    }
}

impl RetryConfig {
    /// Build the backoff schedule for one call
    pub fn backoff(&self) -> backoff::ExponentialBackoff {
        backoff::ExponentialBackoffBuilder::new()
            .with_initial_interval(Duration::from_millis(self.initial_backoff_ms))
            .with_max_interval(Duration::from_millis(self.max_backoff_ms))
            .with_multiplier(self.multiplier)
            // Attempts are capped by count, not by elapsed time.
            .with_max_elapsed_time(None)
            .build()
    }
}

// =============================================================================
// Transfers
// =============================================================================

/// Polling behaviour for long-running appliance jobs and settling datasets
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TransferConfig {
    /// Interval between replication job polls, in milliseconds
    pub poll_interval_ms: u64,
    /// Consecutive failed polls tolerated before a transfer is abandoned
    pub max_poll_failures: u32,
    /// Polls while waiting for a freshly cloned dataset to appear
    pub settle_attempts: u32,
    /// Interval between settle polls, in milliseconds
    pub settle_interval_ms: u64,
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: 2_000,
            max_poll_failures: 5,
            settle_attempts: 10,
            settle_interval_ms: 500,
        }
    }
}

impl TransferConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn settle_interval(&self) -> Duration {
        Duration::from_millis(self.settle_interval_ms)
    }
}

// =============================================================================
// iSCSI Export
// =============================================================================

/// iSCSI export settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IscsiConfig {
    /// Appliance portal id targets are bound to
    pub portal_id: u64,
    /// Logical block size of extents
    pub block_size: u32,
    /// Address handed to initiators when the portal listens on a wildcard
    pub portal_host: Option<String>,
}

impl Default for IscsiConfig {
    fn default() -> Self {
        Self {
            portal_id: 1,
            block_size: 512,
            portal_host: None,
        }
    }
}

// =============================================================================
// Driver Configuration
// =============================================================================

/// Top-level driver configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DriverConfig {
    /// Appliance connection
    pub appliance: ApplianceConfig,
    /// Parent filesystem for all driver datasets, including the pool
    pub dataset_parent: String,
    /// Provisioning mode when a request does not specify one
    pub default_provisioning: ProvisioningMode,
    /// Retry policy for transient failures
    pub retry: RetryConfig,
    /// Job polling
    pub transfer: TransferConfig,
    /// iSCSI export
    pub iscsi: IscsiConfig,
    /// Backend name reported in capacity stats
    pub backend_name: String,
    /// Percentage of capacity reported as reserved
    pub reserved_percentage: u8,
}

impl Default for DriverConfig {
    fn default() -> Self {
        Self {
            appliance: ApplianceConfig::default(),
            dataset_parent: String::new(),
            default_provisioning: ProvisioningMode::Thick,
            retry: RetryConfig::default(),
            transfer: TransferConfig::default(),
            iscsi: IscsiConfig::default(),
            backend_name: "Generic_TrueNAS".to_string(),
            reserved_percentage: 0,
        }
    }
}

impl DriverConfig {
    /// Parse a YAML document
    pub fn from_yaml_str(yaml: &str) -> Result<Self> {
        Ok(serde_yaml::from_str(yaml)?)
    }

    /// Load a YAML file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let contents = std::fs::read_to_string(path.as_ref())?;
        Self::from_yaml_str(&contents)
    }

    /// Dataset layout derived from `dataset_parent`
    pub fn layout(&self) -> Result<DatasetLayout> {
        DatasetLayout::new(self.dataset_parent.clone())
            .map_err(|e| Error::Configuration(format!("dataset_parent: {}", e)))
    }

    /// Check the configuration is usable
    pub fn validate(&self) -> Result<()> {
        if self.appliance.url.is_empty() {
            return Err(Error::Configuration("appliance.url is required".into()));
        }
        reqwest::Url::parse(&self.appliance.url).map_err(|e| {
            Error::Configuration(format!("appliance.url {:?}: {}", self.appliance.url, e))
        })?;
        self.appliance.credentials()?;
        self.layout()?;

        if self.retry.max_attempts == 0 {
            return Err(Error::Configuration("retry.max_attempts must be at least 1".into()));
        }
        if self.retry.multiplier < 1.0 {
            return Err(Error::Configuration("retry.multiplier must be >= 1.0".into()));
        }
        if !matches!(self.iscsi.block_size, 512 | 1024 | 2048 | 4096) {
            return Err(Error::Configuration(format!(
                "iscsi.block_size {} must be one of 512, 1024, 2048, 4096",
                self.iscsi.block_size
            )));
        }
        if self.reserved_percentage > 100 {
            return Err(Error::Configuration(
                "reserved_percentage must be between 0 and 100".into(),
            ));
        }
        Ok(())
    }

    /// Host part of the appliance URL
    pub fn appliance_host(&self) -> Option<String> {
        reqwest::Url::parse(&self.appliance.url)
            .ok()
            .and_then(|url| url.host_str().map(|h| h.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use std::io::Write;

    fn valid() -> DriverConfig {
        DriverConfig {
            appliance: ApplianceConfig {
                url: "https://nas.example.com".into(),
                api_key: Some("1-abcdef".into()),
                ..Default::default()
            },
            dataset_parent: "tank/cinder".into(),
            ..Default::default()
        }
    }

    #[test]
    fn test_defaults() {
        let config = DriverConfig::default();
        assert_eq!(config.retry.max_attempts, 3);
        assert_eq!(config.iscsi.portal_id, 1);
        assert_eq!(config.iscsi.block_size, 512);
        assert_eq!(config.default_provisioning, ProvisioningMode::Thick);
        assert_eq!(config.backend_name, "Generic_TrueNAS");
    }

    #[test]
    fn test_from_file_with_partial_sections() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"
appliance:
  url: https://nas.example.com
  api_key: 1-secret
  verify_tls: false
dataset_parent: tank/openstack/cinder
default_provisioning: thin
retry:
  max_attempts: 5
iscsi:
  portal_host: 10.0.0.5
"#
        )
        .unwrap();

        let config = DriverConfig::from_file(file.path()).unwrap();
        assert!(!config.appliance.verify_tls);
        assert_eq!(config.appliance.request_timeout_secs, 30);
        assert_eq!(config.default_provisioning, ProvisioningMode::Thin);
        assert_eq!(config.retry.max_attempts, 5);
        assert_eq!(config.retry.initial_backoff_ms, 200);
        assert_eq!(config.iscsi.portal_host.as_deref(), Some("10.0.0.5"));
        assert_eq!(config.layout().unwrap().parent(), "tank/openstack/cinder");
        config.validate().unwrap();
    }

    #[test]
    fn test_validate_rejects_missing_pieces() {
        let mut config = valid();
        config.appliance.url.clear();
        assert_matches!(config.validate(), Err(Error::Configuration(_)));

        let mut config = valid();
        config.appliance.api_key = None;
        assert_matches!(config.validate(), Err(Error::Configuration(_)));

        let mut config = valid();
        config.dataset_parent = "tank/bad name".into();
        assert_matches!(config.validate(), Err(Error::Configuration(_)));

        let mut config = valid();
        config.iscsi.block_size = 3000;
        assert_matches!(config.validate(), Err(Error::Configuration(_)));

        let mut config = valid();
        config.retry.max_attempts = 0;
        assert_matches!(config.validate(), Err(Error::Configuration(_)));
    }

    #[test]
    fn test_credentials() {
        let config = valid();
        assert_matches!(config.appliance.credentials(), Ok(Credentials::ApiKey(_)));

        let mut config = valid();
        config.appliance.api_key = None;
        config.appliance.username = Some("root".into());
        config.appliance.password = Some("hunter2".into());
        assert_matches!(
            config.appliance.credentials(),
            Ok(Credentials::Password { ref username, .. }) if username == "root"
        );
    }

    #[test]
    fn test_appliance_host() {
        assert_eq!(valid().appliance_host().as_deref(), Some("nas.example.com"));
    }

    #[test]
    fn test_rejects_malformed_yaml() {
        assert_matches!(
            DriverConfig::from_yaml_str("retry: [1, 2"),
            Err(Error::YamlParse(_))
        );
    }
}
