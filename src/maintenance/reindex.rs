use std::path::{Component, Path, PathBuf};

use anyhow::{Context, Result};
use serde_json::{json, Value};
use walkdir::WalkDir;

use super::batch::{delete_batched, upsert_batched, BatchPolicy};
use crate::ensemble::knn::{class_index, labelled_stage, stage_from_text};
use crate::models::{Metadata, ReindexReport, VectorRecord};
use crate::search::index::VectorIndex;
use crate::vision::backbone::Backbone;
use crate::vision::client::Embedder;

const IMAGE_EXTENSIONS: &[&str] = &["jpg", "jpeg", "png", "webp", "bmp"];

/// An image file found under a dataset root.
#[derive(Debug, Clone, PartialEq)]
pub struct DatasetImage {
    pub path: PathBuf,
    /// Path relative to the dataset root, `/`-separated.
    pub relative: String,
    /// Stage taken from the nearest stage-named ancestor directory.
    pub stage: Option<u32>,
}

/// Where to read a dataset from and where to write its vectors.
pub struct ReindexTarget<'a> {
    pub embedder: &'a dyn Embedder,
    pub conv_index: &'a dyn VectorIndex,
    pub vit_index: &'a dyn VectorIndex,
    pub datasets_dir: &'a Path,
    pub num_classes: usize,
}

/// A dataset name must be a single plain path component.
pub fn validate_dataset_name(name: &str) -> Result<()> {
    let trimmed = name.trim();
    if trimmed.is_empty() {
        anyhow::bail!("Dataset name is empty");
    }
    if trimmed.contains(|c: char| c == '/' || c == '\\') || trimmed.contains("..") {
        anyhow::bail!("Dataset name '{name}' must not contain path separators or '..'");
    }
    let mut components = Path::new(trimmed).components();
    match (components.next(), components.next()) {
        (Some(Component::Normal(_)), None) => Ok(()),
        _ => anyhow::bail!("Dataset name '{name}' is not a plain directory name"),
    }
}

fn is_image(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .map(|e| IMAGE_EXTENSIONS.contains(&e.to_ascii_lowercase().as_str()))
        .unwrap_or(false)
}

/// A directory named like `stage_3` or plainly `3`.
fn stage_dir_name(name: &str) -> Option<u64> {
    if !name.is_empty() && name.bytes().all(|b| b.is_ascii_digit()) {
        return name.parse().ok();
    }
    labelled_stage(name)
}

/// Stage of the nearest stage-named ancestor; any number in a directory name
/// is only used when no ancestor is stage-named.
fn stage_for(relative: &Path, num_classes: usize) -> Option<u32> {
    let dirs: Vec<&str> = relative
        .parent()
        .map(|p| p.components().filter_map(|c| c.as_os_str().to_str()).collect())
        .unwrap_or_default();
    let in_range = |stage: u64| {
        class_index(stage, num_classes)?;
        u32::try_from(stage).ok()
    };

    dirs.iter()
        .rev()
        .find_map(|name| stage_dir_name(name))
        .or_else(|| dirs.iter().rev().find_map(|name| stage_from_text(name)))
        .and_then(in_range)
}

/// Walk `root` and list every image, sorted by relative path.
pub fn collect_images(root: &Path, num_classes: usize) -> Result<Vec<DatasetImage>> {
    if !root.is_dir() {
        anyhow::bail!("Dataset directory {} does not exist", root.display());
    }

    let mut images = Vec::new();
    for entry in WalkDir::new(root).follow_links(false) {
        let entry = match entry {
            Ok(e) => e,
            Err(e) => {
                tracing::warn!("Skipping unreadable dataset entry: {e}");
                continue;
            }
        };
        if !entry.file_type().is_file() || !is_image(entry.path()) {
            continue;
        }
        let Ok(relative) = entry.path().strip_prefix(root) else {
            continue;
        };
        images.push(DatasetImage {
            path: entry.path().to_path_buf(),
            relative: relative
                .components()
                .map(|c| c.as_os_str().to_string_lossy())
                .collect::<Vec<_>>()
                .join("/"),
            stage: stage_for(relative, num_classes),
        });
    }

    images.sort_by(|a, b| a.relative.cmp(&b.relative));
    Ok(images)
}

async fn remove_dataset(index: &dyn VectorIndex, dataset: &str, policy: &BatchPolicy) -> Result<usize> {
    let ids: Vec<String> = index
        .list()
        .await?
        .into_iter()
        .filter(|e| e.metadata.get("dataset").and_then(Value::as_str) == Some(dataset))
        .map(|e| e.id)
        .collect();
    let (deleted, _) = delete_batched(index, &ids, policy).await?;
    Ok(deleted)
}

fn metadata_for(dataset: &str, image: &DatasetImage, stage: u32) -> Metadata {
    let filename = image
        .path
        .file_name()
        .map(|f| f.to_string_lossy().into_owned())
        .unwrap_or_default();
    let value = json!({
        "stage": stage,
        "filename": filename,
        "dataset": dataset,
        "path": image.relative,
    });
    match value {
        Value::Object(map) => map,
        _ => Metadata::new(),
    }
}

/// Embed every labelled image of `dataset` with both backbones and upsert the
/// vectors. Images that fail to read or embed are counted and skipped.
///
/// With `replace`, the dataset's old vectors are removed only after embedding,
/// and not at all when every labelled image failed.
pub async fn reindex_dataset(
    target: &ReindexTarget<'_>,
    dataset: &str,
    replace: bool,
    policy: &BatchPolicy,
) -> Result<ReindexReport> {
    validate_dataset_name(dataset)?;
    let dataset = dataset.trim();
    let root = target.datasets_dir.join(dataset);
    let num_classes = target.num_classes;

    let images = {
        let root = root.clone();
        tokio::task::spawn_blocking(move || collect_images(&root, num_classes))
            .await
            .context("Dataset scan task panicked")??
    };

    let mut report = ReindexReport {
        dataset: dataset.to_string(),
        images_seen: images.len(),
        ..Default::default()
    };
    tracing::info!("Reindexing dataset '{dataset}': {} images found", images.len());

    let mut conv_records = Vec::new();
    let mut vit_records = Vec::new();

    for image in &images {
        let Some(stage) = image.stage else {
            tracing::debug!("No stage folder for {}, skipping", image.relative);
            report.skipped += 1;
            continue;
        };

        let bytes = match tokio::fs::read(&image.path).await {
            Ok(b) => b,
            Err(e) => {
                tracing::warn!("Failed to read {}: {e}", image.path.display());
                report.failed += 1;
                continue;
            }
        };

        let conv = target.embedder.embed(Backbone::ConvNext, &bytes).await;
        let vit = target.embedder.embed(Backbone::Vit, &bytes).await;
        let (conv, vit) = match (conv, vit) {
            (Ok(c), Ok(v)) => (c, v),
            (Err(e), _) | (_, Err(e)) => {
                tracing::warn!("Failed to embed {}: {e:#}", image.relative);
                report.failed += 1;
                continue;
            }
        };

        let id = format!("{dataset}/{}", image.relative);
        let metadata = metadata_for(dataset, image, stage);
        conv_records.push(VectorRecord {
            id: id.clone(),
            values: conv,
            metadata: metadata.clone(),
        });
        vit_records.push(VectorRecord {
            id,
            values: vit,
            metadata,
        });
        report.indexed += 1;
    }

    if replace {
        // Keep the existing vectors when nothing could be embedded.
        if report.indexed == 0 && report.failed > 0 {
            anyhow::bail!(
                "All {} labelled images of '{dataset}' failed; existing vectors were kept",
                report.failed
            );
        }
        report.removed += remove_dataset(target.conv_index, dataset, policy).await?;
        report.removed += remove_dataset(target.vit_index, dataset, policy).await?;
        tracing::info!("Removed {} existing vectors for '{dataset}'", report.removed);
    }

    let conv = upsert_batched(target.conv_index, conv_records, policy).await?;
    let vit = upsert_batched(target.vit_index, vit_records, policy).await?;
    report.batches = conv.batches + vit.batches;

    tracing::info!(
        "Reindexed '{dataset}': {} indexed, {} skipped, {} failed",
        report.indexed,
        report.skipped,
        report.failed
    );
    Ok(report)
}
