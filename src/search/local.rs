use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use async_trait::async_trait;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use super::index::{matches_filter, MetadataFilter, VectorIndex};
use crate::models::{IndexEntry, Metadata, SearchMatch, VectorRecord};

#[derive(Debug, Clone, Serialize, Deserialize)]
struct StoredVector {
    id: String,
    values: Vec<f32>,
    #[serde(default)]
    metadata: Metadata,
}

/// Flat (exhaustive) cosine index held in memory and persisted as JSON.
///
/// One instance per backbone; all vectors in an instance share a dimension.
pub struct LocalIndex {
    entries: RwLock<Vec<StoredVector>>,
    persist_path: PathBuf,
}

impl LocalIndex {
    /// Open `<dir>/<name>.json`, creating the directory if needed.
    pub fn open_or_create(dir: &Path, name: &str) -> Result<Self> {
        std::fs::create_dir_all(dir)?;
        let persist_path = dir.join(format!("{name}.json"));

        let entries = if persist_path.exists() {
            let data = std::fs::read_to_string(&persist_path)
                .with_context(|| format!("Failed to read vector index {}", persist_path.display()))?;
            serde_json::from_str(&data).unwrap_or_else(|e| {
                tracing::warn!("Vector index {} is unreadable, starting empty: {e}", persist_path.display());
                Vec::new()
            })
        } else {
            Vec::new()
        };

        Ok(Self {
            entries: RwLock::new(entries),
            persist_path,
        })
    }

    /// Dimension of the stored vectors, if any are stored.
    pub fn dimension(&self) -> Option<usize> {
        self.entries.read().first().map(|e| e.values.len())
    }

    /// Upsert by id. Memory is only updated once the new state is on disk.
    fn insert(&self, records: Vec<VectorRecord>) -> Result<usize> {
        let mut entries = self.entries.write();

        let expected = entries
            .first()
            .map(|e| e.values.len())
            .or_else(|| records.first().map(|r| r.values.len()));
        if let Some(dim) = expected {
            if let Some(bad) = records.iter().find(|r| r.values.len() != dim) {
                anyhow::bail!(
                    "Record {} has dimension {} but the index holds {dim}-d vectors",
                    bad.id,
                    bad.values.len()
                );
            }
        }

        let mut updated = entries.clone();
        let mut positions: HashMap<String, usize> = updated
            .iter()
            .enumerate()
            .map(|(i, e)| (e.id.clone(), i))
            .collect();

        let written = records.len();
        for record in records {
            let stored = StoredVector {
                id: record.id,
                values: record.values,
                metadata: record.metadata,
            };
            match positions.get(&stored.id) {
                Some(&i) => updated[i] = stored,
                None => {
                    positions.insert(stored.id.clone(), updated.len());
                    updated.push(stored);
                }
            }
        }

        persist(&self.persist_path, &updated)?;
        *entries = updated;
        Ok(written)
    }

    fn remove(&self, ids: &[String]) -> Result<usize> {
        let mut entries = self.entries.write();
        let doomed: HashSet<&str> = ids.iter().map(String::as_str).collect();
        let kept: Vec<StoredVector> = entries
            .iter()
            .filter(|e| !doomed.contains(e.id.as_str()))
            .cloned()
            .collect();
        let removed = entries.len() - kept.len();

        if removed > 0 {
            persist(&self.persist_path, &kept)?;
            *entries = kept;
        }
        Ok(removed)
    }

    fn search(&self, query: &[f32], top_k: usize, filter: Option<&MetadataFilter>) -> Vec<SearchMatch> {
        let entries = self.entries.read();

        let mut scored: Vec<(f32, &StoredVector)> = entries
            .iter()
            .filter(|e| matches_filter(&e.metadata, filter))
            .map(|e| (cosine_similarity(query, &e.values), e))
            .collect();

        // Sort descending by score
        scored.sort_by(|a, b| b.0.partial_cmp(&a.0).unwrap_or(std::cmp::Ordering::Equal));
        scored.truncate(top_k);

        scored
            .into_iter()
            .map(|(score, e)| SearchMatch {
                id: e.id.clone(),
                score,
                metadata: e.metadata.clone(),
            })
            .collect()
    }
}

#[async_trait]
impl VectorIndex for LocalIndex {
    async fn query(
        &self,
        vector: &[f32],
        top_k: usize,
        filter: Option<&MetadataFilter>,
    ) -> Result<Vec<SearchMatch>> {
        if let Some(dim) = self.dimension() {
            if dim != vector.len() {
                anyhow::bail!("Query has dimension {} but the index holds {dim}-d vectors", vector.len());
            }
        }
        Ok(self.search(vector, top_k, filter))
    }

    async fn upsert(&self, records: Vec<VectorRecord>) -> Result<usize> {
        self.insert(records)
    }

    async fn delete(&self, ids: &[String]) -> Result<usize> {
        self.remove(ids)
    }

    async fn list(&self) -> Result<Vec<IndexEntry>> {
        Ok(self
            .entries
            .read()
            .iter()
            .map(|e| IndexEntry {
                id: e.id.clone(),
                metadata: e.metadata.clone(),
            })
            .collect())
    }

    async fn count(&self) -> Result<usize> {
        Ok(self.entries.read().len())
    }
}

/// Write via temp file + rename so a crash never leaves a truncated index.
fn persist(path: &Path, entries: &[StoredVector]) -> Result<()> {
    let data = serde_json::to_string(entries)?;
    let tmp_path = path.with_extension("json.tmp");
    std::fs::write(&tmp_path, data)
        .with_context(|| format!("Failed to write {}", tmp_path.display()))?;
    std::fs::rename(&tmp_path, path)
        .with_context(|| format!("Failed to replace {}", path.display()))?;
    Ok(())
}

pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }

    let mut dot = 0.0f32;
    let mut norm_a = 0.0f32;
    let mut norm_b = 0.0f32;

    for (x, y) in a.iter().zip(b) {
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }

    let denom = norm_a.sqrt() * norm_b.sqrt();
    if denom == 0.0 {
        0.0
    } else {
        dot / denom
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn record(id: &str, values: Vec<f32>, meta: serde_json::Value) -> VectorRecord {
        VectorRecord {
            id: id.to_string(),
            values,
            metadata: meta.as_object().unwrap().clone(),
        }
    }

    #[test]
    fn test_cosine_identical_and_orthogonal() {
        assert!((cosine_similarity(&[1.0, 2.0], &[1.0, 2.0]) - 1.0).abs() < 1e-6);
        assert!(cosine_similarity(&[1.0, 0.0], &[0.0, 1.0]).abs() < 1e-6);
        assert!((cosine_similarity(&[1.0, 0.0], &[-1.0, 0.0]) + 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_cosine_degenerate_inputs() {
        assert_eq!(cosine_similarity(&[], &[]), 0.0);
        assert_eq!(cosine_similarity(&[1.0], &[1.0, 2.0]), 0.0);
        assert_eq!(cosine_similarity(&[0.0, 0.0], &[1.0, 1.0]), 0.0);
    }

    #[tokio::test]
    async fn test_query_ranks_by_similarity() {
        let dir = tempfile::tempdir().unwrap();
        let index = LocalIndex::open_or_create(dir.path(), "convnext").unwrap();
        index
            .upsert(vec![
                record("a", vec![1.0, 0.0, 0.0], json!({"stage": 1})),
                record("b", vec![0.0, 1.0, 0.0], json!({"stage": 2})),
                record("c", vec![0.7, 0.7, 0.0], json!({"stage": 3})),
            ])
            .await
            .unwrap();

        let hits = index.query(&[1.0, 0.1, 0.0], 2, None).await.unwrap();
        assert_eq!(hits.len(), 2);
        assert_eq!(hits[0].id, "a");
        assert_eq!(hits[1].id, "c");
        assert!(hits[0].score >= hits[1].score);
    }

    #[tokio::test]
    async fn test_upsert_replaces_by_id() {
        let dir = tempfile::tempdir().unwrap();
        let index = LocalIndex::open_or_create(dir.path(), "vit").unwrap();
        index.upsert(vec![record("a", vec![1.0, 0.0], json!({"stage": 1}))]).await.unwrap();
        index.upsert(vec![record("a", vec![0.0, 1.0], json!({"stage": 4}))]).await.unwrap();

        assert_eq!(index.count().await.unwrap(), 1);
        let hits = index.query(&[0.0, 1.0], 1, None).await.unwrap();
        assert_eq!(hits[0].metadata["stage"], 4);
    }

    #[tokio::test]
    async fn test_dimension_mismatch_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let index = LocalIndex::open_or_create(dir.path(), "vit").unwrap();
        index.upsert(vec![record("a", vec![1.0, 0.0], json!({}))]).await.unwrap();

        assert!(index.upsert(vec![record("b", vec![1.0], json!({}))]).await.is_err());
        assert!(index.query(&[1.0, 0.0, 0.0], 5, None).await.is_err());
        assert_eq!(index.count().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_filter_restricts_results() {
        let dir = tempfile::tempdir().unwrap();
        let index = LocalIndex::open_or_create(dir.path(), "convnext").unwrap();
        index
            .upsert(vec![
                record("m1", vec![1.0, 0.0], json!({"gender": "male"})),
                record("f1", vec![1.0, 0.0], json!({"gender": "female"})),
            ])
            .await
            .unwrap();

        let filter = json!({"gender": "female"}).as_object().unwrap().clone();
        let hits = index.query(&[1.0, 0.0], 10, Some(&filter)).await.unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].id, "f1");
    }

    #[tokio::test]
    async fn test_persists_across_reopen() {
        let dir = tempfile::tempdir().unwrap();
        {
            let index = LocalIndex::open_or_create(dir.path(), "convnext").unwrap();
            index
                .upsert(vec![
                    record("a", vec![1.0, 0.0], json!({"filename": "a.jpg"})),
                    record("b", vec![0.0, 1.0], json!({"filename": "b.jpg"})),
                ])
                .await
                .unwrap();
            assert_eq!(index.delete(&["a".to_string(), "zzz".to_string()]).await.unwrap(), 1);
        }

        let reopened = LocalIndex::open_or_create(dir.path(), "convnext").unwrap();
        let entries = reopened.list().await.unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].filename(), Some("b.jpg"));
        assert_eq!(reopened.dimension(), Some(2));
    }

    #[tokio::test]
    async fn test_failed_write_leaves_memory_untouched() {
        let dir = tempfile::tempdir().unwrap();
        let vectors = dir.path().join("vectors");
        let index = LocalIndex::open_or_create(&vectors, "convnext").unwrap();
        index
            .upsert(vec![
                record("a", vec![1.0, 0.0], json!({"stage": 1})),
                record("b", vec![0.0, 1.0], json!({"stage": 2})),
            ])
            .await
            .unwrap();

        std::fs::remove_dir_all(&vectors).unwrap();

        let err = index
            .upsert(vec![
                record("a", vec![0.5, 0.5], json!({"stage": 5})),
                record("c", vec![1.0, 1.0], json!({"stage": 3})),
            ])
            .await;
        assert!(err.is_err());
        assert!(index.delete(&["b".to_string()]).await.is_err());

        assert_eq!(index.count().await.unwrap(), 2);
        let hits = index.query(&[1.0, 0.0], 1, None).await.unwrap();
        assert_eq!(hits[0].id, "a");
        assert_eq!(hits[0].metadata["stage"], 1);
    }

    #[tokio::test]
    async fn test_upsert_batch_with_repeated_id_keeps_last() {
        let dir = tempfile::tempdir().unwrap();
        let index = LocalIndex::open_or_create(dir.path(), "vit").unwrap();
        index
            .upsert(vec![
                record("a", vec![1.0, 0.0], json!({"stage": 1})),
                record("a", vec![0.0, 1.0], json!({"stage": 2})),
            ])
            .await
            .unwrap();

        assert_eq!(index.count().await.unwrap(), 1);
        assert_eq!(index.list().await.unwrap()[0].metadata["stage"], 2);
    }

    #[tokio::test]
    async fn test_query_empty_index() {
        let dir = tempfile::tempdir().unwrap();
        let index = LocalIndex::open_or_create(dir.path(), "vit").unwrap();
        assert!(index.query(&[1.0, 2.0], 10, None).await.unwrap().is_empty());
    }
}
