use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::Deserialize;

use super::backbone::Backbone;
use crate::config::EmbedderConfig;

/// Produces a fixed-length embedding for an image under a given backbone.
#[async_trait]
pub trait Embedder: Send + Sync {
    async fn embed(&self, backbone: Backbone, image: &[u8]) -> Result<Vec<f32>>;
}

/// Client for the model-serving sidecar that hosts the vision backbones.
///
/// `POST {base_url}/embed/{backbone}` with the raw image bytes; the sidecar
/// answers `{"embedding": [...]}`.
pub struct HttpEmbedder {
    client: reqwest::Client,
    config: EmbedderConfig,
}

#[derive(Deserialize)]
struct EmbedResponse {
    embedding: Vec<f32>,
}

impl HttpEmbedder {
    pub fn new(client: reqwest::Client, config: EmbedderConfig) -> Self {
        Self { client, config }
    }

    fn endpoint(&self, backbone: Backbone) -> String {
        format!("{}/embed/{backbone}", self.config.base_url.trim_end_matches('/'))
    }
}

#[async_trait]
impl Embedder for HttpEmbedder {
    async fn embed(&self, backbone: Backbone, image: &[u8]) -> Result<Vec<f32>> {
        if image.is_empty() {
            anyhow::bail!("Empty image payload");
        }

        let resp = self
            .client
            .post(self.endpoint(backbone))
            .timeout(Duration::from_secs(self.config.timeout_secs))
            .header(reqwest::header::CONTENT_TYPE, "application/octet-stream")
            .body(image.to_vec())
            .send()
            .await
            .with_context(|| format!("Failed to call embedding sidecar for {backbone}"))?;

        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            anyhow::bail!("Embedding sidecar returned {status} for {backbone}: {body}");
        }

        let body: EmbedResponse = resp
            .json()
            .await
            .context("Failed to parse embedding sidecar response")?;

        check_embedding(&body.embedding, self.config.dimension(backbone))?;
        Ok(body.embedding)
    }
}

/// Reject empty, non-finite, or wrongly sized embeddings. `expected == 0` skips the size check.
pub fn check_embedding(embedding: &[f32], expected: usize) -> Result<()> {
    if embedding.is_empty() {
        anyhow::bail!("Embedding is empty");
    }
    if expected > 0 && embedding.len() != expected {
        anyhow::bail!(
            "Embedding has dimension {} but {expected} was expected",
            embedding.len()
        );
    }
    if embedding.iter().any(|v| !v.is_finite()) {
        anyhow::bail!("Embedding contains non-finite values");
    }
    Ok(())
}
