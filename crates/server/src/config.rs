//! The central configuration file.

use serde::Deserialize;
use std::collections::{BTreeMap, HashMap};
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("cannot read configuration file: {0}")]
    Io(#[from] std::io::Error),
    #[error("configuration file {path} contains secrets and therefore must have 0600 permissions")]
    Permissions { path: PathBuf },
    #[error("cannot parse configuration file: {0}")]
    Json(#[from] serde_json::Error),
}

/// The central configuration, shared by the backend and its distributors.
#[derive(Clone, Debug, Deserialize)]
pub struct Config {
    pub backend: BackendConfig,
    pub distributors: DistributorsConfig,
}

#[derive(Clone, Debug, Deserialize)]
pub struct BackendConfig {
    pub extrainfo_file: PathBuf,
    /// Maps distributor names to the bearer tokens they authenticate with.
    pub api_tokens: HashMap<String, String>,
    #[serde(rename = "api_endpoint_resources")]
    pub resources_endpoint: String,
    #[serde(rename = "api_endpoint_resource_stream")]
    pub resource_stream_endpoint: String,
    #[serde(rename = "api_endpoint_targets")]
    pub targets_endpoint: String,
    #[serde(rename = "web_endpoint_status")]
    pub status_endpoint: String,
    #[serde(rename = "web_endpoint_metrics")]
    pub metrics_endpoint: String,
    pub bridgestrap_endpoint: String,
    /// The proportion of resources each distributor gets.  If https is set
    /// to x and salmon to y, https gets x/(x+y) of all resources and salmon
    /// y/(x+y).
    pub distribution_proportions: BTreeMap<String, u64>,
    pub supported_resources: Vec<String>,
    pub web_api: WebApiConfig,
}

#[derive(Clone, Debug, Deserialize)]
pub struct DistributorsConfig {
    pub https: DistConfig,
    pub salmon: SalmonDistConfig,
}

#[derive(Clone, Debug, Deserialize)]
pub struct DistConfig {
    pub resources: Vec<String>,
    pub web_api: WebApiConfig,
}

#[derive(Clone, Debug, Deserialize)]
pub struct SalmonDistConfig {
    pub resources: Vec<String>,
    pub web_api: WebApiConfig,
    /// Where salmon persists its state.
    pub working_dir: PathBuf,
}

#[derive(Clone, Debug, Deserialize)]
pub struct WebApiConfig {
    pub api_address: String,
    #[serde(default)]
    pub cert_file: Option<PathBuf>,
    #[serde(default)]
    pub key_file: Option<PathBuf>,
}

impl Config {
    /// Loads the given JSON configuration file.  The file carries bearer
    /// tokens, so any mode other than 0600 is refused.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        tracing::info!(path = %path.display(), "loading configuration file");

        let metadata = std::fs::metadata(path)?;
        if metadata.permissions().mode() & 0o777 != 0o600 {
            return Err(ConfigError::Permissions {
                path: path.to_path_buf(),
            });
        }

        let content = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&content)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    const CONFIG: &str = r#"{
        "backend": {
            "extrainfo_file": "/srv/ferry/cached-extrainfo",
            "api_tokens": {"https": "HttpsApiTokenPlaceholder"},
            "api_endpoint_resources": "/resources",
            "api_endpoint_resource_stream": "/resource-stream",
            "api_endpoint_targets": "/targets",
            "web_endpoint_status": "/status",
            "web_endpoint_metrics": "/metrics",
            "bridgestrap_endpoint": "http://localhost:5000/bridge-state",
            "distribution_proportions": {"https": 1, "salmon": 2},
            "supported_resources": ["obfs4", "vanilla"],
            "web_api": {"api_address": "127.0.0.1:7100"}
        },
        "distributors": {
            "https": {
                "resources": ["obfs4"],
                "web_api": {"api_address": "127.0.0.1:7200"}
            },
            "salmon": {
                "resources": ["obfs4"],
                "web_api": {"api_address": "127.0.0.1:7300"},
                "working_dir": "/srv/ferry/salmon"
            }
        }
    }"#;

    fn write_config(mode: u32) -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().expect("temp file");
        file.write_all(CONFIG.as_bytes()).expect("write config");
        let mut permissions = file.as_file().metadata().expect("metadata").permissions();
        permissions.set_mode(mode);
        file.as_file()
            .set_permissions(permissions)
            .expect("set permissions");
        file
    }

    #[test]
    fn loads_with_strict_permissions() {
        let file = write_config(0o600);
        let config = Config::load(file.path()).expect("valid config");
        assert_eq!(config.backend.supported_resources, ["obfs4", "vanilla"]);
        assert_eq!(config.backend.distribution_proportions["salmon"], 2);
        assert_eq!(config.distributors.salmon.resources, ["obfs4"]);
    }

    #[test]
    fn refuses_world_readable_file() {
        let file = write_config(0o644);
        assert!(matches!(
            Config::load(file.path()),
            Err(ConfigError::Permissions { .. })
        ));
    }
}
