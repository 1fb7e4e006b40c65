//! Model registry: the immutable catalog of models this router can serve.
//!
//! Built once at startup from statically configured `[[models]]` entries plus
//! an optional recursive scan of the backend's model directory for .gguf
//! files. Descriptors never change after construction, so the registry is
//! shared as a plain `Arc` without locking.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::config::Config;

/// Declared capabilities of a model.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModelCapability {
    /// Plain text completion
    Completion,
    /// Chat-style completion
    Chat,
    /// Vector embeddings generation
    Embedding,
    /// Image inputs alongside text
    Multimodal,
}

impl ModelCapability {
    /// All capability variants for iteration.
    pub const ALL: [ModelCapability; 4] = [
        ModelCapability::Completion,
        ModelCapability::Chat,
        ModelCapability::Embedding,
        ModelCapability::Multimodal,
    ];
}

impl std::fmt::Display for ModelCapability {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ModelCapability::Completion => write!(f, "completion"),
            ModelCapability::Chat => write!(f, "chat"),
            ModelCapability::Embedding => write!(f, "embedding"),
            ModelCapability::Multimodal => write!(f, "multimodal"),
        }
    }
}

/// Everything the backend needs to start an instance of a model.
/// Immutable once registered.
#[derive(Debug, Clone)]
pub struct ModelDescriptor {
    /// Model identifier (e.g., "org/repo:quant" or a filename stem).
    pub id: String,
    /// Path to the model file.
    pub source: PathBuf,
    pub capabilities: Vec<ModelCapability>,
}

/// Catalog mapping model ids to descriptors.
pub struct ModelRegistry {
    models: HashMap<String, ModelDescriptor>,
}

impl ModelRegistry {
    /// Build the registry from configuration.
    ///
    /// Scanned models get the `completion` capability by default; a static
    /// entry with the same id takes precedence over a scanned file.
    pub fn from_config(config: &Config) -> Self {
        let mut models = HashMap::new();

        if let Some(ref model_dir) = config.backend.model_dir {
            for (id, path) in Self::discover_models(Path::new(model_dir)) {
                models.insert(
                    id.clone(),
                    ModelDescriptor {
                        id,
                        source: path,
                        capabilities: vec![ModelCapability::Completion],
                    },
                );
            }
        }

        for entry in &config.models {
            models.insert(
                entry.id.clone(),
                ModelDescriptor {
                    id: entry.id.clone(),
                    source: PathBuf::from(&entry.source),
                    capabilities: entry.capabilities.clone(),
                },
            );
        }

        tracing::info!("Model registry built with {} models", models.len());
        Self { models }
    }

    /// Build a registry directly from descriptors (used by tests).
    pub fn from_descriptors(descriptors: Vec<ModelDescriptor>) -> Self {
        Self {
            models: descriptors.into_iter().map(|d| (d.id.clone(), d)).collect(),
        }
    }

    pub fn get(&self, model_id: &str) -> Option<&ModelDescriptor> {
        self.models.get(model_id)
    }

    pub fn contains(&self, model_id: &str) -> bool {
        self.models.contains_key(model_id)
    }

    /// All descriptors, sorted by id for stable listings.
    pub fn all(&self) -> Vec<&ModelDescriptor> {
        let mut all: Vec<&ModelDescriptor> = self.models.values().collect();
        all.sort_by(|a, b| a.id.cmp(&b.id));
        all
    }

    pub fn len(&self) -> usize {
        self.models.len()
    }

    pub fn is_empty(&self) -> bool {
        self.models.is_empty()
    }

    /// Recursively discover all GGUF model files in a directory.
    /// Returns a map of model_id -> full path, filtering out non-primary shards.
    fn discover_models(model_dir: &Path) -> HashMap<String, PathBuf> {
        let mut models = HashMap::new();
        if !model_dir.exists() {
            tracing::warn!("Model directory not found: {}", model_dir.display());
            return models;
        }
        Self::scan_directory_recursive(model_dir, &mut models);
        models
    }

    fn scan_directory_recursive(dir: &Path, models: &mut HashMap<String, PathBuf>) {
        let entries = match std::fs::read_dir(dir) {
            Ok(e) => e,
            Err(_) => return,
        };

        for entry in entries.flatten() {
            let path = entry.path();

            if path.is_dir() {
                Self::scan_directory_recursive(&path, models);
            } else if path
                .extension()
                .map_or(false, |ext| ext.eq_ignore_ascii_case("gguf"))
            {
                let filename = match path.file_name().and_then(|s| s.to_str()) {
                    Some(f) => f,
                    None => continue,
                };

                if Self::is_non_primary_shard(filename) {
                    continue;
                }

                models.insert(Self::model_id_from_filename(filename), path);
            }
        }
    }

    /// Check if a filename is a non-primary shard of a split model
    /// (e.g., -00002-of-00003.gguf). Only the first shard is registered.
    fn is_non_primary_shard(filename: &str) -> bool {
        if let Some(pos) = filename.find("-of-") {
            let prefix = &filename[..pos];
            if let Some(dash_pos) = prefix.rfind('-') {
                let shard_num = &prefix[dash_pos + 1..];
                if shard_num.chars().all(|c| c.is_ascii_digit()) && shard_num != "00001" {
                    return true;
                }
            }
        }
        false
    }

    /// Derive a model id from a GGUF filename, stripping the extension and
    /// any shard suffix like -00001-of-00002.
    fn model_id_from_filename(filename: &str) -> String {
        let stem = filename.strip_suffix(".gguf").unwrap_or(filename);
        let clean = if let Some(pos) = stem.find("-00001-of-") {
            &stem[..pos]
        } else {
            stem
        };
        clean.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ModelEntry;

    fn entry(id: &str) -> ModelEntry {
        ModelEntry {
            id: id.to_string(),
            source: format!("/models/{}.gguf", id),
            capabilities: vec![ModelCapability::Completion, ModelCapability::Chat],
        }
    }

    fn config_with_entries(entries: Vec<ModelEntry>, model_dir: Option<String>) -> Config {
        use crate::config::{ApiConfig, BackendConfig, PoolConfig};
        Config {
            api: ApiConfig::default(),
            pool: PoolConfig::default(),
            backend: BackendConfig {
                server_binary: "/usr/bin/llama-server".to_string(),
                server_args: vec![],
                model_dir,
                base_port: None,
                gpu_layers: None,
                context_size: None,
                startup_timeout_secs: 120,
                shutdown_timeout_secs: 10,
                log_server_output: false,
                extra_args: vec![],
            },
            models: entries,
        }
    }

    #[test]
    fn test_static_entries() {
        let registry =
            ModelRegistry::from_config(&config_with_entries(vec![entry("a"), entry("b")], None));
        assert_eq!(registry.len(), 2);
        assert!(registry.contains("a"));
        assert!(registry.get("a").unwrap().capabilities.contains(&ModelCapability::Chat));
        assert!(!registry.contains("c"));
    }

    #[test]
    fn test_all_is_sorted() {
        let registry =
            ModelRegistry::from_config(&config_with_entries(vec![entry("b"), entry("a")], None));
        let ids: Vec<&str> = registry.all().iter().map(|d| d.id.as_str()).collect();
        assert_eq!(ids, vec!["a", "b"]);
    }

    #[test]
    fn test_scan_model_dir() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("llama-7b-q4_0.gguf"), b"").unwrap();
        std::fs::write(dir.path().join("notes.txt"), b"").unwrap();
        let sub = dir.path().join("nested");
        std::fs::create_dir(&sub).unwrap();
        std::fs::write(sub.join("big-00001-of-00002.gguf"), b"").unwrap();
        std::fs::write(sub.join("big-00002-of-00002.gguf"), b"").unwrap();

        let registry = ModelRegistry::from_config(&config_with_entries(
            vec![],
            Some(dir.path().to_string_lossy().to_string()),
        ));
        assert_eq!(registry.len(), 2);
        assert!(registry.contains("llama-7b-q4_0"));
        // shard suffix stripped, secondary shard skipped
        assert!(registry.contains("big"));
    }

    #[test]
    fn test_static_entry_overrides_scanned() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("m.gguf"), b"").unwrap();

        let mut declared = entry("m");
        declared.source = "/elsewhere/m.gguf".to_string();
        let registry = ModelRegistry::from_config(&config_with_entries(
            vec![declared],
            Some(dir.path().to_string_lossy().to_string()),
        ));
        assert_eq!(registry.len(), 1);
        assert_eq!(
            registry.get("m").unwrap().source,
            PathBuf::from("/elsewhere/m.gguf")
        );
    }

    #[test]
    fn test_is_non_primary_shard() {
        assert!(!ModelRegistry::is_non_primary_shard("model-00001-of-00002.gguf"));
        assert!(ModelRegistry::is_non_primary_shard("model-00002-of-00002.gguf"));
        assert!(ModelRegistry::is_non_primary_shard("model-00003-of-00005.gguf"));
        assert!(!ModelRegistry::is_non_primary_shard("model.gguf"));
    }

    #[test]
    fn test_model_id_from_filename() {
        assert_eq!(
            ModelRegistry::model_id_from_filename("llama-7b-q4_0.gguf"),
            "llama-7b-q4_0"
        );
        assert_eq!(
            ModelRegistry::model_id_from_filename("big-00001-of-00002.gguf"),
            "big"
        );
    }

    #[test]
    fn test_capability_serialization() {
        for cap in ModelCapability::ALL {
            let json = serde_json::to_string(&cap).unwrap();
            let parsed: ModelCapability = serde_json::from_str(&json).unwrap();
            assert_eq!(cap, parsed);
        }
        assert_eq!(
            serde_json::to_string(&ModelCapability::Multimodal).unwrap(),
            "\"multimodal\""
        );
    }
}
