use parking_lot::RwLock;
use std::sync::Arc;

use anyhow::Context;

use crate::analyzer::HairLossAnalyzer;
use crate::config::Config;
use crate::ensemble::EnsembleConfig;
use crate::llm::narrate::LlmNarrator;
use crate::maintenance::batch::BatchPolicy;
use crate::search::local::LocalIndex;
use crate::vision::backbone::Backbone;
use crate::vision::client::HttpEmbedder;

const MAX_CONCURRENT_CHATS: usize = 3;

/// Shared application state.
#[derive(Clone)]
pub struct AppState {
    pub config: Config,
    pub analyzer: Arc<HairLossAnalyzer>,
    pub ensemble: Arc<RwLock<EnsembleConfig>>,
    pub http_client: reqwest::Client,
    pub chat_semaphore: Arc<tokio::sync::Semaphore>,
}

impl AppState {
    pub fn new(config: Config) -> anyhow::Result<Self> {
        std::fs::create_dir_all(config.vector_dir())?;
        std::fs::create_dir_all(config.datasets_dir())?;

        let http_client = reqwest::Client::builder()
            .connect_timeout(std::time::Duration::from_secs(10))
            .timeout(std::time::Duration::from_secs(120))
            .build()?;

        let conv_index = LocalIndex::open_or_create(&config.vector_dir(), Backbone::ConvNext.as_str())?;
        let vit_index = LocalIndex::open_or_create(&config.vector_dir(), Backbone::Vit.as_str())?;
        let embedder = HttpEmbedder::new(http_client.clone(), config.embedder.clone());

        let mut analyzer = HairLossAnalyzer::new(Arc::new(embedder), Arc::new(conv_index), Arc::new(vit_index))
            .with_similar_limit(config.similar_images_limit)
            .with_dimensions(config.embedder.conv_dim, config.embedder.vit_dim);
        if config.llm.enabled {
            analyzer = analyzer.with_narrator(Arc::new(LlmNarrator::new(
                http_client.clone(),
                config.llm.clone(),
            )));
        }

        let ensemble = EnsembleConfig::load(config.ensemble_config_path.as_deref())
            .context("Failed to load ensemble config")?;

        Ok(Self::from_parts(config, analyzer, ensemble, http_client))
    }

    /// Assemble state from pre-built parts (alternate embedders or indices).
    pub fn from_parts(
        config: Config,
        analyzer: HairLossAnalyzer,
        ensemble: EnsembleConfig,
        http_client: reqwest::Client,
    ) -> Self {
        Self {
            config,
            analyzer: Arc::new(analyzer),
            ensemble: Arc::new(RwLock::new(ensemble)),
            http_client,
            chat_semaphore: Arc::new(tokio::sync::Semaphore::new(MAX_CONCURRENT_CHATS)),
        }
    }

    pub fn batch_policy(&self) -> BatchPolicy {
        BatchPolicy::from(&self.config.maintenance)
    }

    /// Snapshot of the live ensemble config.
    pub fn ensemble(&self) -> EnsembleConfig {
        self.ensemble.read().clone()
    }

    /// Replace the live ensemble config and write it to `ensemble_config_path`
    /// when one is configured (atomic write via temp file + rename).
    pub fn replace_ensemble(&self, config: EnsembleConfig) -> anyhow::Result<()> {
        if let Some(path) = &self.config.ensemble_config_path {
            let data = serde_json::to_string_pretty(&config)?;
            let tmp_path = path.with_extension("json.tmp");
            std::fs::write(&tmp_path, &data)
                .with_context(|| format!("Failed to write {}", tmp_path.display()))?;
            std::fs::rename(&tmp_path, path)
                .with_context(|| format!("Failed to replace {}", path.display()))?;
        }
        *self.ensemble.write() = config;
        Ok(())
    }
}
