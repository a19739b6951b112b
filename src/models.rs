use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::ensemble::table::EnsembleConfig;
use crate::ensemble::tuning::Evaluation;
use crate::vision::backbone::Backbone;

/// Free-form metadata attached to a stored vector (stage, filename, dataset, ...).
pub type Metadata = Map<String, Value>;

/// One neighbour returned by a vector index query.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SearchMatch {
    pub id: String,
    /// Cosine similarity in `[-1, 1]`.
    pub score: f32,
    #[serde(default)]
    pub metadata: Metadata,
}

impl SearchMatch {
    pub fn filename(&self) -> Option<&str> {
        self.metadata.get("filename").and_then(Value::as_str)
    }
}

/// A vector to be written to an index.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VectorRecord {
    pub id: String,
    pub values: Vec<f32>,
    #[serde(default)]
    pub metadata: Metadata,
}

/// An index entry without its vector, used by maintenance listings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndexEntry {
    pub id: String,
    pub metadata: Metadata,
}

impl IndexEntry {
    pub fn filename(&self) -> Option<&str> {
        self.metadata.get("filename").and_then(Value::as_str)
    }
}

/// A neighbouring reference image surfaced in the analysis response.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SimilarImage {
    pub id: String,
    pub backbone: Backbone,
    pub filename: Option<String>,
    pub stage: Option<u32>,
    pub score: f32,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ExplanationSource {
    Llm,
    Template,
}

// ─── Analysis ────────────────────────────────────────────

/// Query-string options for `POST /api/analyze`.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct AnalyzeParams {
    pub top_k: Option<usize>,
    pub explain: Option<bool>,
    /// Restrict both searches to references with this `gender` metadata value.
    pub gender: Option<String>,
}

/// Analysis from embeddings computed by the caller.
#[derive(Debug, Clone, Deserialize)]
pub struct EmbeddingAnalyzeRequest {
    pub conv_embedding: Vec<f32>,
    pub vit_embedding: Vec<f32>,
    pub top_k: Option<usize>,
    #[serde(default)]
    pub explain: bool,
    pub filter: Option<Metadata>,
}

/// Per-model class scores, keyed by stage number.
#[derive(Debug, Clone, Serialize)]
pub struct ModelScores {
    pub conv: BTreeMap<String, f64>,
    pub vit: BTreeMap<String, f64>,
}

#[derive(Debug, Clone, Serialize)]
pub struct AnalyzeResponse {
    pub analysis_id: Uuid,
    pub analyzed_at: DateTime<Utc>,
    /// `None` when no prediction could be made.
    pub predicted_stage: Option<u32>,
    pub confidence: f64,
    pub stage_scores: BTreeMap<String, f64>,
    pub model_scores: ModelScores,
    pub strategy: String,
    pub similar_images: Vec<SimilarImage>,
    pub explanation: String,
    pub explanation_source: ExplanationSource,
}

// ─── Vector maintenance ──────────────────────────────────

#[derive(Debug, Clone, Deserialize)]
pub struct UpsertRequest {
    pub records: Vec<VectorRecord>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct UpsertReport {
    pub upserted: usize,
    pub batches: usize,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DeleteByPatternRequest {
    pub pattern: String,
    #[serde(default)]
    pub dry_run: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DeleteReport {
    pub pattern: String,
    pub matched: usize,
    pub deleted: usize,
    pub batches: usize,
    pub dry_run: bool,
    /// First few matched ids, for eyeballing a dry run.
    pub sample_ids: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct IndexStats {
    pub backbone: Backbone,
    pub total: usize,
    pub per_stage: BTreeMap<String, usize>,
    pub unlabelled: usize,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ReindexRequest {
    pub dataset: String,
    /// Remove the dataset's existing vectors before indexing.
    #[serde(default)]
    pub replace: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ReindexReport {
    pub dataset: String,
    pub images_seen: usize,
    pub indexed: usize,
    pub skipped: usize,
    pub failed: usize,
    pub removed: usize,
    pub batches: usize,
}

// ─── Ensemble admin ──────────────────────────────────────

#[derive(Debug, Clone, Deserialize)]
pub struct TuneRequest {
    pub samples: Vec<crate::ensemble::tuning::ValidationSample>,
    pub temperature_grid: Option<Vec<f64>>,
    pub strong_margin: Option<f64>,
    pub min_recall: Option<f64>,
    #[serde(default)]
    pub apply: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct TuneResponse {
    pub config: EnsembleConfig,
    pub evaluation: Evaluation,
    pub baseline: Evaluation,
    pub applied: bool,
}

// ─── Chat ────────────────────────────────────────────────

/// Chat request
#[derive(Debug, Clone, Deserialize)]
pub struct ChatRequest {
    pub message: String,
    pub history: Option<Vec<ChatMessage>>,
    /// Result of a previous analysis the user wants to discuss.
    pub analysis: Option<AnalysisContext>,
}

/// A single chat turn (user or assistant)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnalysisContext {
    pub predicted_stage: Option<u32>,
    #[serde(default)]
    pub confidence: f64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_search_match_metadata_defaults_to_empty() {
        let m: SearchMatch = serde_json::from_str(r#"{"id":"a","score":0.5}"#).unwrap();
        assert!(m.metadata.is_empty());
        assert_eq!(m.filename(), None);
    }

    #[test]
    fn test_search_match_filename() {
        let m: SearchMatch = serde_json::from_str(
            r#"{"id":"a","score":0.5,"metadata":{"filename":"img_01.jpg","stage":2}}"#,
        )
        .unwrap();
        assert_eq!(m.filename(), Some("img_01.jpg"));
    }

    #[test]
    fn test_explanation_source_serializes_to_snake_case() {
        let json = serde_json::to_value(ExplanationSource::Template).unwrap();
        assert_eq!(json, "template");
    }

    #[test]
    fn test_delete_request_dry_run_defaults_false() {
        let req: DeleteByPatternRequest = serde_json::from_str(r#"{"pattern":"aug_"}"#).unwrap();
        assert!(!req.dry_run);
    }
}
