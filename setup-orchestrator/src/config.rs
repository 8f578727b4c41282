// Wizard configuration
//
// Layered with the `config` crate: built-in defaults, then an optional TOML file, then
// `SETUP_WIZARD__<SECTION>__<KEY>` environment variables.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use url::Url;

use crate::services::http::ServiceEndpoints;
use crate::utils::path_resolver;

pub const ENV_PREFIX: &str = "SETUP_WIZARD";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to load configuration: {0}")]
    Load(#[from] config::ConfigError),
    #[error("invalid URL for {field}: {source}")]
    InvalidUrl {
        field: &'static str,
        #[source]
        source: url::ParseError,
    },
    #[error("invalid value for {field}: {reason}")]
    InvalidValue { field: &'static str, reason: String },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServicesConfig {
    pub setup_api_url: String,
    pub progress_api_url: String,
    /// Remote probe endpoint; unset probes the local machine.
    pub probe_api_url: Option<String>,
    pub request_timeout_secs: u64,
}

impl Default for ServicesConfig {
    fn default() -> Self {
        Self {
            setup_api_url: "http://127.0.0.1:5080/api/setup/".to_string(),
            progress_api_url: "http://127.0.0.1:5080/api/".to_string(),
            probe_api_url: None,
            request_timeout_secs: 130,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TimeoutsConfig {
    pub install_secs: u64,
    pub status_secs: u64,
    pub validation_secs: u64,
    pub probe_secs: u64,
    pub rescan_secs: u64,
}

impl Default for TimeoutsConfig {
    fn default() -> Self {
        Self {
            install_secs: 120,
            status_secs: 15,
            validation_secs: 30,
            probe_secs: 20,
            rescan_secs: 60,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    pub base_ms: u64,
    pub cap_ms: u64,
    pub max_attempts: u32,
    /// Attempts after which internal (5xx, malformed) failures stop being retried.
    pub internal_retry_cap: u32,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            base_ms: 500,
            cap_ms: 8_000,
            max_attempts: 3,
            internal_retry_cap: 2,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReplicationConfig {
    pub base_ms: u64,
    pub max_delay_ms: u64,
    pub retries: usize,
    pub timeout_secs: u64,
}

impl Default for ReplicationConfig {
    fn default() -> Self {
        Self {
            base_ms: 200,
            max_delay_ms: 2_000,
            retries: 2,
            timeout_secs: 10,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Snapshot file; defaults to the per-user data folder.
    pub path: Option<PathBuf>,
    /// Encrypt credentials into the snapshot.
    pub encrypt_credentials: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WizardConfig {
    pub services: ServicesConfig,
    pub timeouts: TimeoutsConfig,
    pub retry: RetryConfig,
    pub replication: ReplicationConfig,
    pub cache: CacheConfig,
    pub user_id: Option<String>,
}

impl WizardConfig {
    /// Loads from `path` (or the default config path) layered under environment variables.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let path = path
            .map(Path::to_path_buf)
            .unwrap_or_else(path_resolver::default_config_path);
        let built = config::Config::builder()
            .add_source(config::File::from(path.as_path()).required(false))
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;
        let cfg: WizardConfig = built.try_deserialize()?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.endpoints()?;
        if self.retry.max_attempts == 0 {
            return Err(ConfigError::InvalidValue {
                field: "retry.max_attempts",
                reason: "must be at least 1".to_string(),
            });
        }
        if self.retry.base_ms > self.retry.cap_ms {
            return Err(ConfigError::InvalidValue {
                field: "retry.base_ms",
                reason: format!("exceeds retry.cap_ms ({})", self.retry.cap_ms),
            });
        }
        let timeouts = [
            ("timeouts.install_secs", self.timeouts.install_secs),
            ("timeouts.status_secs", self.timeouts.status_secs),
            ("timeouts.validation_secs", self.timeouts.validation_secs),
            ("timeouts.probe_secs", self.timeouts.probe_secs),
            ("timeouts.rescan_secs", self.timeouts.rescan_secs),
        ];
        if let Some((field, _)) = timeouts.iter().find(|(_, secs)| *secs == 0) {
            return Err(ConfigError::InvalidValue {
                field: *field,
                reason: "must be greater than zero".to_string(),
            });
        }
        Ok(())
    }

    pub fn endpoints(&self) -> Result<ServiceEndpoints, ConfigError> {
        let parse = |field: &'static str, raw: &str| {
            Url::parse(raw).map_err(|source| ConfigError::InvalidUrl { field, source })
        };
        Ok(ServiceEndpoints {
            setup_api: parse("services.setup_api_url", &self.services.setup_api_url)?,
            progress_api: parse("services.progress_api_url", &self.services.progress_api_url)?,
            probe_api: self
                .services
                .probe_api_url
                .as_deref()
                .map(|raw| parse("services.probe_api_url", raw))
                .transpose()?,
        })
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.services.request_timeout_secs)
    }

    pub fn cache_path(&self) -> PathBuf {
        self.cache
            .path
            .clone()
            .unwrap_or_else(path_resolver::default_cache_path)
    }

    pub fn to_toml(&self) -> Result<String, toml::ser::Error> {
        toml::to_string_pretty(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn defaults_validate() {
        let cfg = WizardConfig::default();
        cfg.validate().unwrap();
        assert_eq!(cfg.timeouts.install_secs, 120);
        assert_eq!(cfg.retry.max_attempts, 3);
    }

    #[test]
    fn file_values_override_defaults() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(
            file,
            "user_id = \"u-1\"\n[retry]\nmax_attempts = 5\n[timeouts]\ninstall_secs = 300"
        )
        .unwrap();

        let cfg = WizardConfig::load(Some(file.path())).unwrap();
        assert_eq!(cfg.retry.max_attempts, 5);
        assert_eq!(cfg.retry.base_ms, 500);
        assert_eq!(cfg.timeouts.install_secs, 300);
        assert_eq!(cfg.user_id.as_deref(), Some("u-1"));
    }

    #[test]
    fn missing_file_falls_back_to_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = WizardConfig::load(Some(&dir.path().join("absent.toml"))).unwrap();
        assert_eq!(cfg.services, ServicesConfig::default());
    }

    #[test]
    fn invalid_url_is_reported_with_field() {
        let mut cfg = WizardConfig::default();
        cfg.services.setup_api_url = "not a url".to_string();
        match cfg.validate() {
            Err(ConfigError::InvalidUrl { field, .. }) => {
                assert_eq!(field, "services.setup_api_url")
            }
            other => panic!("expected invalid url, got {:?}", other),
        }
    }

    #[test]
    fn zero_timeouts_are_rejected() {
        let mut cfg = WizardConfig::default();
        cfg.timeouts.probe_secs = 0;
        assert!(matches!(
            cfg.validate(),
            Err(ConfigError::InvalidValue {
                field: "timeouts.probe_secs",
                ..
            })
        ));
    }

    #[test]
    fn renders_as_toml() {
        let rendered = WizardConfig::default().to_toml().unwrap();
        assert!(rendered.contains("[retry]"), "missing section: {}", rendered);
        assert!(rendered.contains("install_secs = 120"));
    }
}
