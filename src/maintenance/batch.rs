//! Bulk index operations, chunked with a fixed pause between chunks so hosted
//! indices are not hammered.

use std::collections::BTreeMap;
use std::time::Duration;

use anyhow::Result;

use crate::config::MaintenanceConfig;
use crate::ensemble::knn::resolve_stage;
use crate::models::{DeleteReport, IndexEntry, IndexStats, SearchMatch, UpsertReport, VectorRecord};
use crate::search::index::VectorIndex;
use crate::vision::backbone::Backbone;

/// How many matched ids a delete report echoes back.
const SAMPLE_IDS: usize = 10;

#[derive(Debug, Clone, Copy)]
pub struct BatchPolicy {
    pub batch_size: usize,
    pub pause: Duration,
}

impl BatchPolicy {
    pub fn new(batch_size: usize, pause: Duration) -> Self {
        Self {
            batch_size: batch_size.max(1),
            pause,
        }
    }
}

impl From<&MaintenanceConfig> for BatchPolicy {
    fn from(config: &MaintenanceConfig) -> Self {
        Self::new(config.batch_size, Duration::from_millis(config.pause_ms))
    }
}

/// Upsert `records` in chunks of `policy.batch_size`.
pub async fn upsert_batched(
    index: &dyn VectorIndex,
    records: Vec<VectorRecord>,
    policy: &BatchPolicy,
) -> Result<UpsertReport> {
    let mut report = UpsertReport {
        upserted: 0,
        batches: 0,
    };
    let total = records.len();
    let mut remaining = records.into_iter().peekable();

    while remaining.peek().is_some() {
        if report.batches > 0 {
            tokio::time::sleep(policy.pause).await;
        }
        let batch: Vec<VectorRecord> = remaining.by_ref().take(policy.batch_size).collect();
        report.upserted += index.upsert(batch).await?;
        report.batches += 1;
        tracing::info!("Upserted {}/{total} vectors", report.upserted);
    }

    Ok(report)
}

/// Delete `ids` in chunks of `policy.batch_size`. Returns `(deleted, batches)`.
pub async fn delete_batched(
    index: &dyn VectorIndex,
    ids: &[String],
    policy: &BatchPolicy,
) -> Result<(usize, usize)> {
    let mut deleted = 0;
    let mut batches = 0;
    for chunk in ids.chunks(policy.batch_size) {
        if batches > 0 {
            tokio::time::sleep(policy.pause).await;
        }
        deleted += index.delete(chunk).await?;
        batches += 1;
        tracing::info!("Deleted {deleted}/{} vectors", ids.len());
    }
    Ok((deleted, batches))
}

/// Case-insensitive substring match on the `filename` metadata, or on the id
/// when a record has no filename.
pub fn entry_matches_pattern(entry: &IndexEntry, pattern: &str) -> bool {
    let needle = pattern.to_lowercase();
    entry
        .filename()
        .unwrap_or(entry.id.as_str())
        .to_lowercase()
        .contains(&needle)
}

/// Remove every record whose filename contains `pattern`.
pub async fn delete_by_pattern(
    index: &dyn VectorIndex,
    pattern: &str,
    dry_run: bool,
    policy: &BatchPolicy,
) -> Result<DeleteReport> {
    let pattern = pattern.trim();
    if pattern.is_empty() {
        anyhow::bail!("Refusing to delete with an empty pattern");
    }

    let ids: Vec<String> = index
        .list()
        .await?
        .into_iter()
        .filter(|e| entry_matches_pattern(e, pattern))
        .map(|e| e.id)
        .collect();

    let mut report = DeleteReport {
        pattern: pattern.to_string(),
        matched: ids.len(),
        deleted: 0,
        batches: 0,
        dry_run,
        sample_ids: ids.iter().take(SAMPLE_IDS).cloned().collect(),
    };

    if dry_run || ids.is_empty() {
        return Ok(report);
    }

    let (deleted, batches) = delete_batched(index, &ids, policy).await?;
    report.deleted = deleted;
    report.batches = batches;
    Ok(report)
}

/// Record counts per resolved stage.
pub async fn index_stats(index: &dyn VectorIndex, backbone: Backbone) -> Result<IndexStats> {
    let entries = index.list().await?;
    let mut per_stage: BTreeMap<String, usize> = BTreeMap::new();
    let mut unlabelled = 0;

    for entry in &entries {
        let as_match = SearchMatch {
            id: entry.id.clone(),
            score: 0.0,
            metadata: entry.metadata.clone(),
        };
        match resolve_stage(&as_match) {
            Some(stage) => *per_stage.entry(stage.to_string()).or_insert(0) += 1,
            None => unlabelled += 1,
        }
    }

    Ok(IndexStats {
        backbone,
        total: entries.len(),
        per_stage,
        unlabelled,
    })
}
