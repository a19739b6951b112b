use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::Json;

use crate::maintenance::batch::{delete_by_pattern, index_stats, upsert_batched};
use crate::maintenance::reindex::{reindex_dataset, validate_dataset_name, ReindexTarget};
use crate::models::{
    DeleteByPatternRequest, DeleteReport, IndexStats, ReindexReport, ReindexRequest, UpsertReport,
    UpsertRequest,
};
use crate::state::AppState;
use crate::vision::backbone::Backbone;
use crate::vision::client::check_embedding;

fn parse_backbone(raw: &str) -> Result<Backbone, (StatusCode, String)> {
    raw.parse()
        .map_err(|_| (StatusCode::NOT_FOUND, format!("Unknown backbone '{raw}'")))
}

fn internal(context: &str, e: anyhow::Error) -> (StatusCode, String) {
    tracing::error!("{context}: {e:#}");
    (StatusCode::INTERNAL_SERVER_ERROR, format!("{context}: {e:#}"))
}

/// GET /api/vectors/{backbone}/stats - Record counts per stage
pub async fn vector_stats(
    State(state): State<AppState>,
    Path(backbone): Path<String>,
) -> Result<Json<IndexStats>, (StatusCode, String)> {
    let backbone = parse_backbone(&backbone)?;
    let index = state.analyzer.index(backbone);
    let stats = index_stats(index.as_ref(), backbone)
        .await
        .map_err(|e| internal("Failed to read index", e))?;
    Ok(Json(stats))
}

/// POST /api/vectors/{backbone} - Upsert reference vectors in batches
pub async fn upsert_vectors(
    State(state): State<AppState>,
    Path(backbone): Path<String>,
    Json(req): Json<UpsertRequest>,
) -> Result<Json<UpsertReport>, (StatusCode, String)> {
    let backbone = parse_backbone(&backbone)?;
    if req.records.is_empty() {
        return Err((StatusCode::BAD_REQUEST, "No records to upsert".to_string()));
    }

    let expected = state.config.embedder.dimension(backbone);
    for record in &req.records {
        if record.id.trim().is_empty() {
            return Err((StatusCode::UNPROCESSABLE_ENTITY, "Record id is required".to_string()));
        }
        check_embedding(&record.values, expected)
            .map_err(|e| (StatusCode::UNPROCESSABLE_ENTITY, format!("Record {}: {e}", record.id)))?;
    }

    let index = state.analyzer.index(backbone);
    let report = upsert_batched(index.as_ref(), req.records, &state.batch_policy())
        .await
        .map_err(|e| internal("Upsert failed", e))?;

    tracing::info!("Upserted {} {backbone} vectors in {} batches", report.upserted, report.batches);
    Ok(Json(report))
}

/// POST /api/vectors/{backbone}/delete - Delete records whose filename contains a pattern
pub async fn delete_vectors(
    State(state): State<AppState>,
    Path(backbone): Path<String>,
    Json(req): Json<DeleteByPatternRequest>,
) -> Result<Json<DeleteReport>, (StatusCode, String)> {
    let backbone = parse_backbone(&backbone)?;
    if req.pattern.trim().is_empty() {
        return Err((StatusCode::BAD_REQUEST, "Pattern is required".to_string()));
    }

    let index = state.analyzer.index(backbone);
    let report = delete_by_pattern(index.as_ref(), &req.pattern, req.dry_run, &state.batch_policy())
        .await
        .map_err(|e| internal("Delete failed", e))?;

    tracing::info!(
        "Pattern '{}' on {backbone}: {} matched, {} deleted (dry run: {})",
        report.pattern,
        report.matched,
        report.deleted,
        report.dry_run
    );
    Ok(Json(report))
}

/// POST /api/datasets/reindex - Embed and index a dataset folder
pub async fn reindex(
    State(state): State<AppState>,
    Json(req): Json<ReindexRequest>,
) -> Result<Json<ReindexReport>, (StatusCode, String)> {
    validate_dataset_name(&req.dataset).map_err(|e| (StatusCode::BAD_REQUEST, e.to_string()))?;

    let datasets_dir = state.config.datasets_dir();
    if !datasets_dir.join(req.dataset.trim()).is_dir() {
        return Err((
            StatusCode::NOT_FOUND,
            format!("Dataset '{}' not found", req.dataset.trim()),
        ));
    }

    let num_classes = state.ensemble.read().num_classes;
    let target = ReindexTarget {
        embedder: state.analyzer.embedder().as_ref(),
        conv_index: state.analyzer.index(Backbone::ConvNext).as_ref(),
        vit_index: state.analyzer.index(Backbone::Vit).as_ref(),
        datasets_dir: &datasets_dir,
        num_classes,
    };

    let report = reindex_dataset(&target, &req.dataset, req.replace, &state.batch_policy())
        .await
        .map_err(|e| internal("Reindex failed", e))?;
    Ok(Json(report))
}
