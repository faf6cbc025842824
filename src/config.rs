//! # Link Configuration
//!
//! Configuration for the agent-cloud link: cloud endpoint, proxy policy,
//! worker pool sizing and metrics gating. Loaded from a TOML file with
//! defaults for everything except `cloud_base_url`, which is mandatory and
//! validated up front — a permanently invalid cloud URL refuses to start the
//! link rather than retrying forever.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{info, warn};
use url::Url;
use uuid::Uuid;

use crate::net::proxy::ProxySetting;

pub const DEFAULT_CONFIG_FILE: &str = "cloudlink.toml";
/// Claim material lives here relative to the agent's var-lib directory.
pub const CLAIM_SUBDIR: &str = "cloud.d";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("cloud_base_url is missing or empty")]
    MissingCloudUrl,

    #[error("cloud_base_url is not a valid URL: {0}")]
    BadCloudUrl(String),

    #[error("query_thread_count must be >= 1")]
    BadThreadCount,

    #[error("Failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
}

/// File-level configuration, deserialized from TOML.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct LinkConfig {
    /// Cloud control-plane base URL. Mandatory.
    pub cloud_base_url: String,

    /// Proxy policy: `env`, `none`, or an explicit URL.
    pub proxy: ProxySetting,

    /// HTTP-query worker count. Default derives from the CPU count.
    pub query_thread_count: Option<usize>,

    /// Enables the internal metrics counters.
    pub statistics: bool,

    /// Grace period after connect before announcing readiness. Zero disables
    /// the grace window.
    pub popcorn_grace_ms: u64,

    /// Directory holding `claimed_id` and `private.pem`.
    pub claim_dir: PathBuf,

    /// Host-identifying UUID supplied by the embedding agent.
    pub machine_guid: Uuid,

    /// Agent version string reported to `/env`.
    pub agent_version: String,
}

impl Default for LinkConfig {
    fn default() -> Self {
        Self {
            cloud_base_url: String::new(),
            proxy: ProxySetting::Env,
            query_thread_count: None,
            statistics: false,
            popcorn_grace_ms: 0,
            claim_dir: default_claim_dir(),
            machine_guid: Uuid::nil(),
            agent_version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }
}

fn default_claim_dir() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".local/share/cloudlink")
        .join(CLAIM_SUBDIR)
}

impl LinkConfig {
    /// Loads from a TOML file, falling back to defaults for absent keys.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let config: LinkConfig = toml::from_str(&raw).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        info!("Loaded link configuration from {}", path.display());
        Ok(config)
    }

    /// Validates the mandatory fields and returns the parsed cloud URL.
    pub fn validate(&self) -> Result<Url, ConfigError> {
        if self.cloud_base_url.trim().is_empty() {
            return Err(ConfigError::MissingCloudUrl);
        }
        let url = Url::parse(&self.cloud_base_url)
            .map_err(|e| ConfigError::BadCloudUrl(e.to_string()))?;
        if url.host_str().is_none() {
            return Err(ConfigError::BadCloudUrl("URL has no host".into()));
        }
        if self.query_thread_count == Some(0) {
            return Err(ConfigError::BadThreadCount);
        }
        Ok(url)
    }

    /// Worker pool size: the configured value, else `max(2, min(cpus/2, 6))`.
    pub fn query_threads(&self) -> usize {
        match self.query_thread_count {
            Some(n) => n,
            None => {
                let cpus = std::thread::available_parallelism()
                    .map(|n| n.get())
                    .unwrap_or_else(|e| {
                        warn!("Could not determine CPU count ({e}), assuming 4");
                        4
                    });
                (cpus / 2).clamp(2, 6)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_cloud_url_is_rejected() {
        let config = LinkConfig::default();
        assert!(matches!(config.validate(), Err(ConfigError::MissingCloudUrl)));
    }

    #[test]
    fn bad_cloud_url_is_rejected() {
        let config = LinkConfig {
            cloud_base_url: "not a url".into(),
            ..Default::default()
        };
        assert!(matches!(config.validate(), Err(ConfigError::BadCloudUrl(_))));
    }

    #[test]
    fn valid_config_passes() {
        let config = LinkConfig {
            cloud_base_url: "https://app.cloud.example".into(),
            ..Default::default()
        };
        let url = config.validate().unwrap();
        assert_eq!(url.host_str(), Some("app.cloud.example"));
    }

    #[test]
    fn zero_workers_rejected_and_default_bounded() {
        let config = LinkConfig {
            cloud_base_url: "https://c".into(),
            query_thread_count: Some(0),
            ..Default::default()
        };
        assert!(matches!(config.validate(), Err(ConfigError::BadThreadCount)));

        let config = LinkConfig::default();
        let n = config.query_threads();
        assert!((2..=6).contains(&n));
    }

    #[test]
    fn toml_round_trip_with_proxy_string() {
        let toml_src = r#"
            cloud_base_url = "https://app.cloud.example"
            proxy = "http://user:pw@proxy:3128"
            statistics = true
        "#;
        let config: LinkConfig = toml::from_str(toml_src).unwrap();
        assert_eq!(
            config.proxy,
            ProxySetting::Url("http://user:pw@proxy:3128".into())
        );
        assert!(config.statistics);
    }
}
