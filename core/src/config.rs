//! Configuration for the managed companion services.
//!
//! Stored in JSON format at `~/.sw-semantic/companion.json`. The defaults
//! describe the two real services, the inference server and the Semantic
//! Engine API backend, including their launch contracts: the inference
//! server takes its port through the `OLLAMA_HOST` environment variable,
//! the backend takes its own port as a `--port` argument and learns the
//! resolved inference port and active model through `SWSE_OLLAMA_URL` and
//! `SWSE_MODEL`.

use std::collections::BTreeMap;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use tokio::fs;
use tokio::io::AsyncWriteExt;

use crate::error::{Error, Result};
use crate::models::{LaunchSpec, ServiceSpec};

/// Logical name of the inference-server service.
pub const INFERENCE_SERVICE: &str = "inference";

/// Logical name of the API-backend service.
pub const BACKEND_SERVICE: &str = "backend";

/// Configuration data stored in JSON format.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CompanionConfig {
    /// The managed services, each ensured independently.
    #[serde(default = "default_services")]
    pub services: Vec<ServiceSpec>,

    /// Active model name, available to launch specs as `{model}`.
    #[serde(default = "default_model")]
    pub model: String,

    /// Per-request probe timeout in seconds.
    #[serde(default = "default_probe_timeout_secs")]
    pub probe_timeout_secs: u64,

    /// Overall health-poll budget in seconds for a launched service.
    #[serde(default = "default_health_timeout_secs")]
    pub health_timeout_secs: u64,

    /// Number of ports scanned around a configured port.
    #[serde(default = "default_scan_range")]
    pub scan_range: u16,
}

fn default_model() -> String {
    "sw-semantic-7b".to_string()
}

fn default_probe_timeout_secs() -> u64 {
    3
}

fn default_health_timeout_secs() -> u64 {
    30
}

fn default_scan_range() -> u16 {
    crate::allocator::DEFAULT_SCAN_RANGE
}

fn default_services() -> Vec<ServiceSpec> {
    let mut inference_env = BTreeMap::new();
    inference_env.insert("OLLAMA_HOST".to_string(), "127.0.0.1:{port}".to_string());

    let mut backend_env = BTreeMap::new();
    backend_env.insert(
        "SWSE_OLLAMA_URL".to_string(),
        format!("http://127.0.0.1:{{port:{}}}", INFERENCE_SERVICE),
    );
    backend_env.insert("SWSE_MODEL".to_string(), "{model}".to_string());

    vec![
        ServiceSpec {
            name: INFERENCE_SERVICE.to_string(),
            port: 11434,
            fingerprint: "Ollama is running".to_string(),
            launch: LaunchSpec {
                program: PathBuf::from("ollama"),
                args: vec!["serve".to_string()],
                working_dir: None,
                env: inference_env,
            },
            enabled: true,
        },
        ServiceSpec {
            name: BACKEND_SERVICE.to_string(),
            port: 8000,
            fingerprint: "SolidWorks Semantic Engine".to_string(),
            launch: LaunchSpec {
                program: PathBuf::from("uvicorn"),
                args: [
                    "backend.main:app",
                    "--host",
                    "127.0.0.1",
                    "--port",
                    "{port}",
                ]
                .iter()
                .map(|s| s.to_string())
                .collect(),
                working_dir: None,
                env: backend_env,
            },
            enabled: true,
        },
    ]
}

impl Default for CompanionConfig {
    fn default() -> Self {
        Self {
            services: default_services(),
            model: default_model(),
            probe_timeout_secs: default_probe_timeout_secs(),
            health_timeout_secs: default_health_timeout_secs(),
            scan_range: default_scan_range(),
        }
    }
}

impl CompanionConfig {
    /// Looks up a service spec by logical name.
    pub fn service(&self, name: &str) -> Option<&ServiceSpec> {
        self.services.iter().find(|s| s.name == name)
    }
}

/// Configuration store for the companion services.
///
/// Handles reading and writing configuration to
/// `~/.sw-semantic/companion.json`.
pub struct ConfigStore {
    config_path: PathBuf,
}

impl ConfigStore {
    /// Create a config store with the default path.
    pub fn new() -> Result<Self> {
        let home = dirs::home_dir()
            .ok_or_else(|| Error::Config("Could not determine home directory".to_string()))?;

        let config_path = home.join(".sw-semantic").join("companion.json");
        Ok(Self { config_path })
    }

    /// Create a config store with a custom path (for testing).
    pub fn with_path(config_path: PathBuf) -> Self {
        Self { config_path }
    }

    /// Path to the configuration file.
    pub fn config_path(&self) -> &PathBuf {
        &self.config_path
    }

    /// Load configuration from disk.
    ///
    /// Returns the default configuration if the file doesn't exist.
    pub async fn load(&self) -> Result<CompanionConfig> {
        if !self.config_path.exists() {
            return Ok(CompanionConfig::default());
        }

        let content = fs::read_to_string(&self.config_path).await?;
        let config = serde_json::from_str(&content)?;
        Ok(config)
    }

    /// Save configuration to disk, creating the directory if needed.
    ///
    /// Writes to a temporary file in the same directory and renames it
    /// into place, so an interrupted save cannot truncate the config.
    pub async fn save(&self, config: &CompanionConfig) -> Result<()> {
        if let Some(dir) = self.config_path.parent() {
            fs::create_dir_all(dir).await?;
        }

        let content = serde_json::to_string_pretty(config)?;
        let tmp_path = self.config_path.with_extension("json.tmp");

        let mut file = fs::File::create(&tmp_path).await?;
        file.write_all(content.as_bytes()).await?;
        file.sync_all().await?;
        drop(file);

        fs::rename(&tmp_path, &self.config_path).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_describe_both_services() {
        let config = CompanionConfig::default();

        let inference = config.service(INFERENCE_SERVICE).unwrap();
        assert_eq!(inference.port, 11434);
        assert_eq!(inference.fingerprint, "Ollama is running");
        assert!(inference.launch.env.contains_key("OLLAMA_HOST"));

        let backend = config.service(BACKEND_SERVICE).unwrap();
        assert_eq!(backend.port, 8000);
        assert_eq!(backend.fingerprint, "SolidWorks Semantic Engine");
        assert!(backend.launch.args.contains(&"{port}".to_string()));
        assert_eq!(
            backend.launch.env.get("SWSE_OLLAMA_URL").unwrap(),
            "http://127.0.0.1:{port:inference}"
        );
    }

    #[tokio::test]
    async fn test_load_missing_file_returns_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let store = ConfigStore::with_path(dir.path().join("companion.json"));

        let config = store.load().await.unwrap();
        assert_eq!(config.services.len(), 2);
        assert_eq!(config.scan_range, 10);
    }

    #[tokio::test]
    async fn test_save_and_load_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let store = ConfigStore::with_path(dir.path().join("nested").join("companion.json"));

        let mut config = CompanionConfig::default();
        config.model = "sw-semantic-13b".to_string();
        config.services[0].port = 11500;
        config.services[1].enabled = false;

        store.save(&config).await.unwrap();
        let loaded = store.load().await.unwrap();

        assert_eq!(loaded.model, "sw-semantic-13b");
        assert_eq!(loaded.service(INFERENCE_SERVICE).unwrap().port, 11500);
        assert!(!loaded.service(BACKEND_SERVICE).unwrap().enabled);
    }

    #[tokio::test]
    async fn test_save_replaces_existing_file_cleanly() {
        let dir = tempfile::tempdir().unwrap();
        let store = ConfigStore::with_path(dir.path().join("companion.json"));

        store.save(&CompanionConfig::default()).await.unwrap();
        let mut config = CompanionConfig::default();
        config.model = "replacement".to_string();
        store.save(&config).await.unwrap();

        assert_eq!(store.load().await.unwrap().model, "replacement");
        // The intermediate temp file must not be left behind.
        let entries: Vec<_> = std::fs::read_dir(dir.path()).unwrap().collect();
        assert_eq!(entries.len(), 1);
    }

    #[tokio::test]
    async fn test_partial_file_gets_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("companion.json");
        tokio::fs::write(&path, r#"{ "model": "custom" }"#)
            .await
            .unwrap();

        let store = ConfigStore::with_path(path);
        let config = store.load().await.unwrap();

        assert_eq!(config.model, "custom");
        assert_eq!(config.services.len(), 2);
        assert_eq!(config.health_timeout_secs, 30);
    }

    #[test]
    fn test_unknown_service_lookup() {
        let config = CompanionConfig::default();
        assert!(config.service("no-such-service").is_none());
    }
}
