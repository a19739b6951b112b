//! Request-scoped orchestration: embed → search both indices → vote →
//! ensemble → explain.
//!
//! Each step awaits the previous one; nothing here runs concurrently and no
//! state outlives a call.

use std::collections::HashSet;
use std::sync::Arc;

use crate::ensemble::knn::{class_index, knn_vote, resolve_stage, KnnVote};
use crate::ensemble::{combine, EnsembleConfig, Prediction};
use crate::error::AnalyzeError;
use crate::llm::narrate::{fallback_explanation, Narrator};
use crate::models::{ExplanationSource, SearchMatch, SimilarImage};
use crate::search::index::{MetadataFilter, VectorIndex};
use crate::vision::backbone::Backbone;
use crate::vision::client::{check_embedding, Embedder};

#[derive(Debug, Clone)]
pub struct AnalyzeOptions {
    pub top_k: usize,
    pub explain: bool,
    pub filter: Option<MetadataFilter>,
}

impl Default for AnalyzeOptions {
    fn default() -> Self {
        Self {
            top_k: 10,
            explain: false,
            filter: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Analysis {
    pub prediction: Prediction,
    pub conv: KnnVote,
    pub vit: KnnVote,
    pub strategy: &'static str,
    pub similar_images: Vec<SimilarImage>,
    pub explanation: String,
    pub explanation_source: ExplanationSource,
}

pub struct HairLossAnalyzer {
    embedder: Arc<dyn Embedder>,
    conv_index: Arc<dyn VectorIndex>,
    vit_index: Arc<dyn VectorIndex>,
    narrator: Option<Arc<dyn Narrator>>,
    similar_limit: usize,
    /// Expected embedding length per backbone; 0 skips the check.
    conv_dim: usize,
    vit_dim: usize,
}

impl HairLossAnalyzer {
    pub fn new(
        embedder: Arc<dyn Embedder>,
        conv_index: Arc<dyn VectorIndex>,
        vit_index: Arc<dyn VectorIndex>,
    ) -> Self {
        Self {
            embedder,
            conv_index,
            vit_index,
            narrator: None,
            similar_limit: 5,
            conv_dim: 0,
            vit_dim: 0,
        }
    }

    pub fn with_narrator(mut self, narrator: Arc<dyn Narrator>) -> Self {
        self.narrator = Some(narrator);
        self
    }

    pub fn with_similar_limit(mut self, limit: usize) -> Self {
        self.similar_limit = limit;
        self
    }

    /// Reject embeddings whose length differs from the indexed vectors.
    pub fn with_dimensions(mut self, conv_dim: usize, vit_dim: usize) -> Self {
        self.conv_dim = conv_dim;
        self.vit_dim = vit_dim;
        self
    }

    fn dimension(&self, backbone: Backbone) -> usize {
        match backbone {
            Backbone::ConvNext => self.conv_dim,
            Backbone::Vit => self.vit_dim,
        }
    }

    pub fn embedder(&self) -> &Arc<dyn Embedder> {
        &self.embedder
    }

    pub fn index(&self, backbone: Backbone) -> &Arc<dyn VectorIndex> {
        match backbone {
            Backbone::ConvNext => &self.conv_index,
            Backbone::Vit => &self.vit_index,
        }
    }

    /// Full pipeline from an uploaded image.
    pub async fn analyze(
        &self,
        image: &[u8],
        ensemble: &EnsembleConfig,
        options: &AnalyzeOptions,
    ) -> Result<Analysis, AnalyzeError> {
        if image.is_empty() {
            return Err(AnalyzeError::EmptyImage);
        }

        let conv = self.embed(Backbone::ConvNext, image).await?;
        let vit = self.embed(Backbone::Vit, image).await?;
        self.analyze_embeddings(&conv, &vit, ensemble, options).await
    }

    /// Pipeline from embeddings the caller already computed.
    pub async fn analyze_embeddings(
        &self,
        conv_embedding: &[f32],
        vit_embedding: &[f32],
        ensemble: &EnsembleConfig,
        options: &AnalyzeOptions,
    ) -> Result<Analysis, AnalyzeError> {
        for (backbone, embedding) in [(Backbone::ConvNext, conv_embedding), (Backbone::Vit, vit_embedding)] {
            check_embedding(embedding, self.dimension(backbone))
                .map_err(|e| AnalyzeError::InvalidInput(format!("{backbone}: {e}")))?;
        }

        let filter = options.filter.as_ref();
        let conv_matches = self.search(Backbone::ConvNext, conv_embedding, options.top_k, filter).await?;
        let vit_matches = self.search(Backbone::Vit, vit_embedding, options.top_k, filter).await?;

        let conv = knn_vote(&conv_matches, ensemble.num_classes, ensemble.temperature_conv);
        let vit = knn_vote(&vit_matches, ensemble.num_classes, ensemble.temperature_vit);
        if conv.dropped + vit.dropped > 0 {
            tracing::debug!(
                conv_dropped = conv.dropped,
                vit_dropped = vit.dropped,
                "Neighbours without a usable stage label were ignored"
            );
        }

        let probabilities = combine(&conv.probabilities, &vit.probabilities, ensemble);
        let prediction = Prediction::from_probabilities(probabilities);
        let similar_images = similar_images(
            &conv_matches,
            &vit_matches,
            ensemble.num_classes,
            self.similar_limit,
        );

        let (explanation, explanation_source) = self
            .explain(&prediction, &similar_images, options.explain)
            .await;

        tracing::info!(
            stage = ?prediction.stage,
            confidence = prediction.confidence,
            strategy = ensemble.strategy(),
            conv_hits = conv_matches.len(),
            vit_hits = vit_matches.len(),
            "Analysis complete"
        );

        Ok(Analysis {
            prediction,
            conv,
            vit,
            strategy: ensemble.strategy(),
            similar_images,
            explanation,
            explanation_source,
        })
    }

    async fn embed(&self, backbone: Backbone, image: &[u8]) -> Result<Vec<f32>, AnalyzeError> {
        self.embedder
            .embed(backbone, image)
            .await
            .map_err(|cause| AnalyzeError::Embedding { backbone, cause })
    }

    async fn search(
        &self,
        backbone: Backbone,
        vector: &[f32],
        top_k: usize,
        filter: Option<&MetadataFilter>,
    ) -> Result<Vec<SearchMatch>, AnalyzeError> {
        self.index(backbone)
            .query(vector, top_k, filter)
            .await
            .map_err(|cause| AnalyzeError::IndexUnavailable { backbone, cause })
    }

    async fn explain(
        &self,
        prediction: &Prediction,
        similar: &[SimilarImage],
        requested: bool,
    ) -> (String, ExplanationSource) {
        let template = || (fallback_explanation(prediction), ExplanationSource::Template);

        if !requested || prediction.is_none() {
            return template();
        }
        let Some(narrator) = &self.narrator else {
            return template();
        };

        match narrator.narrate(prediction, similar).await {
            Ok(text) => (text, ExplanationSource::Llm),
            Err(e) => {
                tracing::warn!("LLM explanation failed, using template: {e:#}");
                template()
            }
        }
    }
}

/// Neighbours from both indices, best first, one entry per id.
fn similar_images(
    conv: &[SearchMatch],
    vit: &[SearchMatch],
    num_classes: usize,
    limit: usize,
) -> Vec<SimilarImage> {
    let mut tagged: Vec<(Backbone, &SearchMatch)> = conv
        .iter()
        .map(|m| (Backbone::ConvNext, m))
        .chain(vit.iter().map(|m| (Backbone::Vit, m)))
        .filter(|(_, m)| m.score.is_finite())
        .collect();
    tagged.sort_by(|a, b| b.1.score.partial_cmp(&a.1.score).unwrap_or(std::cmp::Ordering::Equal));

    let mut seen = HashSet::new();
    tagged
        .into_iter()
        .filter(|(_, m)| seen.insert(m.id.clone()))
        .take(limit)
        .map(|(backbone, m)| SimilarImage {
            id: m.id.clone(),
            backbone,
            filename: m.filename().map(str::to_string),
            stage: resolve_stage(m)
                .filter(|s| class_index(*s, num_classes).is_some())
                .and_then(|s| u32::try_from(s).ok()),
            score: m.score,
        })
        .collect()
}
