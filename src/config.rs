use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use crate::vision::backbone::Backbone;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Where vector indices and datasets live
    pub data_dir: PathBuf,
    /// Server bind address
    pub bind_addr: String,
    /// Neighbours retrieved per backbone when the request does not say
    pub top_k: usize,
    /// Upper bound on `top_k` accepted from requests
    pub max_top_k: usize,
    /// Reference images returned with each analysis
    pub similar_images_limit: usize,
    /// Largest accepted image upload in bytes
    pub max_image_bytes: usize,
    /// Embedding sidecar configuration
    pub embedder: EmbedderConfig,
    /// LLM used for explanations and chat
    pub llm: LlmConfig,
    /// Optional JSON ensemble table; the built-in table is used when unset
    pub ensemble_config_path: Option<PathBuf>,
    /// Batching for bulk upsert / delete jobs
    pub maintenance: MaintenanceConfig,
}

/// HTTP sidecar that runs the ConvNeXt and ViT backbones.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmbedderConfig {
    pub base_url: String,
    /// Request timeout in seconds
    pub timeout_secs: u64,
    /// Expected ConvNeXt embedding length (0 = don't check)
    pub conv_dim: usize,
    /// Expected ViT embedding length (0 = don't check)
    pub vit_dim: usize,
}

impl EmbedderConfig {
    pub fn dimension(&self, backbone: Backbone) -> usize {
        match backbone {
            Backbone::ConvNext => self.conv_dim,
            Backbone::Vit => self.vit_dim,
        }
    }
}

impl Default for EmbedderConfig {
    fn default() -> Self {
        Self {
            base_url: "http://127.0.0.1:8500".to_string(),
            timeout_secs: 30,
            conv_dim: 1024,
            vit_dim: 768,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmConfig {
    /// Ask the LLM for explanations at all; templates are used otherwise
    pub enabled: bool,
    /// "openai", "ollama" or "gemini"
    pub provider: String,
    /// Base URL for the LLM API
    pub base_url: String,
    /// Model name for explanations and chat
    pub chat_model: String,
    /// API key (only needed for cloud providers)
    pub api_key: Option<String>,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            provider: "ollama".to_string(),
            base_url: "http://localhost:11434".to_string(),
            chat_model: "llama3.2".to_string(),
            api_key: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MaintenanceConfig {
    /// Records per upsert / delete call
    pub batch_size: usize,
    /// Pause between batches in milliseconds, to stay under hosted-index rate limits
    pub pause_ms: u64,
}

impl Default for MaintenanceConfig {
    fn default() -> Self {
        Self {
            batch_size: 100,
            pause_ms: 500,
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("./data"),
            bind_addr: "127.0.0.1:9000".to_string(),
            top_k: 10,
            max_top_k: 100,
            similar_images_limit: 5,
            max_image_bytes: 10 * 1024 * 1024,
            embedder: EmbedderConfig::default(),
            llm: LlmConfig::default(),
            ensemble_config_path: None,
            maintenance: MaintenanceConfig::default(),
        }
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|v| v.trim().parse().ok())
}

impl Config {
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Ok(dir) = std::env::var("HAIRSCAN_DATA_DIR") {
            config.data_dir = PathBuf::from(dir);
        }
        if let Ok(addr) = std::env::var("HAIRSCAN_BIND_ADDR") {
            config.bind_addr = addr;
        }
        if let Some(v) = env_parse::<usize>("HAIRSCAN_TOP_K").filter(|v| *v > 0) {
            config.top_k = v;
        }
        if let Some(v) = env_parse("HAIRSCAN_MAX_TOP_K") {
            config.max_top_k = v;
        }
        if let Some(v) = env_parse("HAIRSCAN_SIMILAR_IMAGES") {
            config.similar_images_limit = v;
        }
        if let Some(v) = env_parse("HAIRSCAN_MAX_IMAGE_BYTES") {
            config.max_image_bytes = v;
        }

        // Embedder
        if let Ok(url) = std::env::var("EMBEDDER_BASE_URL") {
            config.embedder.base_url = url;
        }
        if let Some(v) = env_parse::<u64>("EMBEDDER_TIMEOUT_SECS") {
            config.embedder.timeout_secs = v.clamp(1, 300);
        }
        if let Some(v) = env_parse("CONV_EMBEDDING_DIM") {
            config.embedder.conv_dim = v;
        }
        if let Some(v) = env_parse("VIT_EMBEDDING_DIM") {
            config.embedder.vit_dim = v;
        }

        // LLM
        if let Some(v) = env_parse("LLM_ENABLED") {
            config.llm.enabled = v;
        }
        if let Ok(provider) = std::env::var("LLM_PROVIDER") {
            config.llm.provider = provider;
        }
        if let Ok(url) = std::env::var("LLM_BASE_URL") {
            config.llm.base_url = url;
        }
        if let Ok(model) = std::env::var("LLM_CHAT_MODEL") {
            config.llm.chat_model = model;
        }
        if let Ok(key) = std::env::var("LLM_API_KEY") {
            config.llm.api_key = Some(key);
        }

        if let Ok(path) = std::env::var("ENSEMBLE_CONFIG_PATH") {
            config.ensemble_config_path = Some(PathBuf::from(path));
        }

        // Maintenance batching
        if let Some(v) = env_parse::<usize>("MAINTENANCE_BATCH_SIZE").filter(|v| *v > 0) {
            config.maintenance.batch_size = v;
        }
        if let Some(v) = env_parse("MAINTENANCE_PAUSE_MS") {
            config.maintenance.pause_ms = v;
        }

        config
    }

    pub fn vector_dir(&self) -> PathBuf {
        self.data_dir.join("vectors")
    }

    pub fn datasets_dir(&self) -> PathBuf {
        self.data_dir.join("datasets")
    }

    /// Clamp a requested neighbour count to `1..=max_top_k`.
    pub fn effective_top_k(&self, requested: Option<usize>) -> usize {
        requested
            .unwrap_or(self.top_k)
            .clamp(1, self.max_top_k.max(1))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_effective_top_k_defaults_and_clamps() {
        let config = Config::default();
        assert_eq!(config.effective_top_k(None), 10);
        assert_eq!(config.effective_top_k(Some(0)), 1);
        assert_eq!(config.effective_top_k(Some(5000)), 100);
    }

    #[test]
    fn test_embedder_dimension_per_backbone() {
        let embedder = EmbedderConfig::default();
        assert_eq!(embedder.dimension(Backbone::ConvNext), 1024);
        assert_eq!(embedder.dimension(Backbone::Vit), 768);
    }

    #[test]
    fn test_data_subdirs() {
        let config = Config {
            data_dir: PathBuf::from("/srv/hairscan"),
            ..Config::default()
        };
        assert_eq!(config.vector_dir(), PathBuf::from("/srv/hairscan/vectors"));
        assert_eq!(config.datasets_dir(), PathBuf::from("/srv/hairscan/datasets"));
    }
}
