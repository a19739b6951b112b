use anyhow::Result;
use async_trait::async_trait;

use crate::models::{IndexEntry, Metadata, SearchMatch, VectorRecord};

/// Equality filter on metadata keys: every key must be present with the given value.
pub type MetadataFilter = Metadata;

/// The narrow surface the analyzer and maintenance jobs need from a vector
/// index, so a hosted service and the local flat index are interchangeable.
#[async_trait]
pub trait VectorIndex: Send + Sync {
    /// Top-`top_k` neighbours of `vector`, best first.
    async fn query(
        &self,
        vector: &[f32],
        top_k: usize,
        filter: Option<&MetadataFilter>,
    ) -> Result<Vec<SearchMatch>>;

    /// Insert or replace records by id. Returns how many were written.
    async fn upsert(&self, records: Vec<VectorRecord>) -> Result<usize>;

    /// Remove records by id. Returns how many existed.
    async fn delete(&self, ids: &[String]) -> Result<usize>;

    /// Every stored id with its metadata.
    async fn list(&self) -> Result<Vec<IndexEntry>>;

    async fn count(&self) -> Result<usize>;
}

pub fn matches_filter(metadata: &Metadata, filter: Option<&MetadataFilter>) -> bool {
    match filter {
        Some(f) => f.iter().all(|(k, v)| metadata.get(k) == Some(v)),
        None => true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn meta(v: serde_json::Value) -> Metadata {
        v.as_object().unwrap().clone()
    }

    #[test]
    fn test_no_filter_matches_everything() {
        assert!(matches_filter(&meta(json!({})), None));
    }

    #[test]
    fn test_filter_requires_all_keys() {
        let m = meta(json!({"gender": "male", "stage": 3}));
        assert!(matches_filter(&m, Some(&meta(json!({"gender": "male"})))));
        assert!(matches_filter(&m, Some(&meta(json!({"gender": "male", "stage": 3})))));
        assert!(!matches_filter(&m, Some(&meta(json!({"gender": "female"})))));
        assert!(!matches_filter(&m, Some(&meta(json!({"dataset": "v2"})))));
    }

    #[test]
    fn test_empty_filter_matches() {
        assert!(matches_filter(&meta(json!({"a": 1})), Some(&meta(json!({})))));
    }
}
