//! Configuration for the model router.

use config::{Config as ConfigLoader, ConfigError, Environment, File};
use serde::Deserialize;

use crate::registry::ModelCapability;

/// Main configuration structure for the router.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub api: ApiConfig,
    #[serde(default)]
    pub pool: PoolConfig,
    pub backend: BackendConfig,
    /// Statically declared models, merged with the model_dir scan.
    #[serde(default)]
    pub models: Vec<ModelEntry>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ApiConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    /// Shared secret required as a bearer token on dispatch and control-plane
    /// endpoints. If unset, all callers are allowed.
    #[serde(default)]
    pub api_key: Option<String>,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            api_key: None,
        }
    }
}

/// Slot pool policy.
#[derive(Debug, Clone, Deserialize)]
pub struct PoolConfig {
    /// Maximum number of simultaneously resident models.
    #[serde(default = "default_capacity")]
    pub capacity: usize,
    /// Whether a dispatch request may implicitly load its target model.
    /// When disabled, only the control-plane load endpoint loads models.
    #[serde(default = "default_true")]
    pub autoload: bool,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            capacity: default_capacity(),
            autoload: default_true(),
        }
    }
}

/// llama-server subprocess backend configuration.
///
/// Each loaded model runs in its own llama-server process for isolation.
#[derive(Debug, Clone, Deserialize)]
pub struct BackendConfig {
    /// Path to the llama-server binary or wrapper command (e.g., "toolbox").
    pub server_binary: String,
    /// Extra arguments inserted BEFORE the model args.
    /// Use this for wrapper commands like toolbox.
    /// Example: `["run", "-c", "llamacpp", "llama-server"]`
    #[serde(default)]
    pub server_args: Vec<String>,
    /// Directory scanned recursively for .gguf model files. Optional when all
    /// models are declared via `[[models]]` entries.
    #[serde(default)]
    pub model_dir: Option<String>,
    /// Base port for instance allocation. If not set, OS assigns ports.
    #[serde(default)]
    pub base_port: Option<u16>,
    /// Number of layers to offload to GPU (-ngl flag). 0 = CPU only.
    #[serde(default)]
    pub gpu_layers: Option<u32>,
    /// Context window size (-c flag).
    #[serde(default)]
    pub context_size: Option<u32>,
    /// Instance startup timeout in seconds (default: 120).
    #[serde(default = "default_startup_timeout")]
    pub startup_timeout_secs: u64,
    /// Instance graceful shutdown timeout in seconds (default: 10).
    #[serde(default = "default_shutdown_timeout")]
    pub shutdown_timeout_secs: u64,
    /// Log instance stdout/stderr for debugging (default: false).
    #[serde(default)]
    pub log_server_output: bool,
    /// Extra arguments appended AFTER the standard llama-server flags.
    /// Use this for flags like `["--flash-attn", "on", "--no-mmap"]`
    #[serde(default)]
    pub extra_args: Vec<String>,
}

/// A statically declared model.
#[derive(Debug, Clone, Deserialize)]
pub struct ModelEntry {
    /// Model identifier (e.g., "org/repo:quant").
    pub id: String,
    /// Path to the model file.
    pub source: String,
    #[serde(default)]
    pub capabilities: Vec<ModelCapability>,
}

// Default values
fn default_host() -> String {
    "0.0.0.0".to_string()
}
fn default_port() -> u16 {
    8080
}
fn default_capacity() -> usize {
    2
}
fn default_true() -> bool {
    true
}
fn default_startup_timeout() -> u64 {
    120
}
fn default_shutdown_timeout() -> u64 {
    10
}

impl Config {
    /// Load configuration from file and environment variables.
    ///
    /// Configuration sources (in order of precedence):
    /// 1. Environment variables (ROUTER__SECTION__KEY format)
    /// 2. config.toml file (if present)
    /// 3. Built-in defaults
    pub fn load() -> Result<Self, ConfigError> {
        let config = ConfigLoader::builder()
            .set_default("api.host", default_host())?
            .set_default("api.port", default_port() as i64)?
            .set_default("pool.capacity", default_capacity() as i64)?
            .set_default("pool.autoload", true)?
            .add_source(File::with_name("config").required(false))
            .add_source(
                Environment::with_prefix("ROUTER")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        config.try_deserialize()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_api_config() {
        let api = ApiConfig::default();
        assert_eq!(api.host, "0.0.0.0");
        assert_eq!(api.port, 8080);
        assert!(api.api_key.is_none());
    }

    #[test]
    fn test_default_pool_config() {
        let pool = PoolConfig::default();
        assert_eq!(pool.capacity, 2);
        assert!(pool.autoload);
    }

    #[test]
    fn test_backend_config_minimal_toml() {
        let toml = r#"
            server_binary = "/usr/bin/llama-server"
        "#;
        let backend: BackendConfig = toml_from_str(toml);
        assert_eq!(backend.server_binary, "/usr/bin/llama-server");
        assert!(backend.server_args.is_empty());
        assert_eq!(backend.startup_timeout_secs, 120);
        assert_eq!(backend.shutdown_timeout_secs, 10);
    }

    #[test]
    fn test_model_entry_toml() {
        let toml = r#"
            id = "llama-7b-q4_0"
            source = "/models/llama-7b-q4_0.gguf"
            capabilities = ["completion", "chat"]
        "#;
        let entry: ModelEntry = toml_from_str(toml);
        assert_eq!(entry.id, "llama-7b-q4_0");
        assert_eq!(entry.capabilities.len(), 2);
    }

    fn toml_from_str<T: serde::de::DeserializeOwned>(s: &str) -> T {
        ConfigLoader::builder()
            .add_source(config::File::from_str(s, config::FileFormat::Toml))
            .build()
            .unwrap()
            .try_deserialize()
            .unwrap()
    }
}
