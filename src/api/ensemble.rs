use axum::extract::State;
use axum::http::StatusCode;
use axum::Json;
use serde::Serialize;

use crate::ensemble::tuning::{evaluate, tune, TuningOptions, DEFAULT_TEMPERATURE_GRID};
use crate::ensemble::EnsembleConfig;
use crate::models::{TuneRequest, TuneResponse};
use crate::state::AppState;
use crate::vision::backbone::Backbone;

/// GET /api/ensemble - Current ensemble config
pub async fn get_ensemble(State(state): State<AppState>) -> Json<EnsembleConfig> {
    Json(state.ensemble())
}

/// PUT /api/ensemble - Validate and replace the ensemble config
pub async fn put_ensemble(
    State(state): State<AppState>,
    Json(config): Json<EnsembleConfig>,
) -> Result<Json<EnsembleConfig>, (StatusCode, String)> {
    config
        .validate()
        .map_err(|e| (StatusCode::UNPROCESSABLE_ENTITY, e.to_string()))?;

    state.replace_ensemble(config.clone()).map_err(|e| {
        tracing::error!("Failed to save ensemble config: {e:#}");
        (StatusCode::INTERNAL_SERVER_ERROR, format!("{e:#}"))
    })?;

    tracing::info!("Ensemble config replaced (strategy: {})", config.strategy());
    Ok(Json(config))
}

/// POST /api/ensemble/tune - Derive temperatures and per-class rules from labelled samples
pub async fn tune_ensemble(
    State(state): State<AppState>,
    Json(req): Json<TuneRequest>,
) -> Result<Json<TuneResponse>, (StatusCode, String)> {
    if req.samples.is_empty() {
        return Err((StatusCode::BAD_REQUEST, "At least one sample is required".to_string()));
    }

    let grid = req
        .temperature_grid
        .unwrap_or_else(|| DEFAULT_TEMPERATURE_GRID.to_vec());
    if !grid.iter().any(|t| t.is_finite() && *t > 0.0) {
        return Err((
            StatusCode::UNPROCESSABLE_ENTITY,
            "Temperature grid needs at least one positive value".to_string(),
        ));
    }

    let defaults = TuningOptions::default();
    let options = TuningOptions {
        strong_margin: req.strong_margin.unwrap_or(defaults.strong_margin),
        min_recall: req.min_recall.unwrap_or(defaults.min_recall),
    };

    let current = state.ensemble();
    let samples = req.samples;
    let (config, evaluation, baseline) = tokio::task::spawn_blocking(move || {
        let baseline = evaluate(&samples, &current);
        let config = tune(&samples, &current, &grid, options);
        let evaluation = evaluate(&samples, &config);
        (config, evaluation, baseline)
    })
    .await
    .map_err(|e| (StatusCode::INTERNAL_SERVER_ERROR, format!("Tuning task failed: {e}")))?;

    tracing::info!(
        "Tuned ensemble on {} samples: accuracy {:.3} (was {:.3})",
        evaluation.samples,
        evaluation.accuracy,
        baseline.accuracy
    );

    let applied = req.apply;
    if applied {
        config
            .validate()
            .map_err(|e| (StatusCode::UNPROCESSABLE_ENTITY, e.to_string()))?;
        state
            .replace_ensemble(config.clone())
            .map_err(|e| (StatusCode::INTERNAL_SERVER_ERROR, format!("{e:#}")))?;
    }

    Ok(Json(TuneResponse {
        config,
        evaluation,
        baseline,
        applied,
    }))
}

// ─── Service info ────────────────────────────────────────

#[derive(Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub version: &'static str,
    pub vectors: Vec<IndexCount>,
}

#[derive(Serialize)]
pub struct IndexCount {
    pub backbone: Backbone,
    pub count: Option<usize>,
}

/// GET /api/health - Liveness plus per-index record counts
pub async fn health(State(state): State<AppState>) -> Json<HealthResponse> {
    let mut vectors = Vec::with_capacity(Backbone::ALL.len());
    let mut degraded = false;
    for backbone in Backbone::ALL {
        let count = match state.analyzer.index(backbone).count().await {
            Ok(n) => Some(n),
            Err(e) => {
                tracing::warn!("{backbone} index count failed: {e:#}");
                degraded = true;
                None
            }
        };
        vectors.push(IndexCount { backbone, count });
    }

    Json(HealthResponse {
        status: if degraded { "degraded" } else { "ok" },
        version: env!("CARGO_PKG_VERSION"),
        vectors,
    })
}

/// Config response with the API key redacted
#[derive(Serialize)]
pub struct ConfigResponse {
    pub top_k: usize,
    pub max_top_k: usize,
    pub similar_images_limit: usize,
    pub max_image_bytes: usize,
    pub embedder_base_url: String,
    pub conv_embedding_dim: usize,
    pub vit_embedding_dim: usize,
    pub llm_enabled: bool,
    pub llm_provider: String,
    pub llm_chat_model: String,
    pub has_api_key: bool,
    pub strategy: &'static str,
}

/// GET /api/config - Non-secret view of the running configuration
pub async fn get_config(State(state): State<AppState>) -> Json<ConfigResponse> {
    let config = &state.config;
    Json(ConfigResponse {
        top_k: config.top_k,
        max_top_k: config.max_top_k,
        similar_images_limit: config.similar_images_limit,
        max_image_bytes: config.max_image_bytes,
        embedder_base_url: config.embedder.base_url.clone(),
        conv_embedding_dim: config.embedder.conv_dim,
        vit_embedding_dim: config.embedder.vit_dim,
        llm_enabled: config.llm.enabled,
        llm_provider: config.llm.provider.clone(),
        llm_chat_model: config.llm.chat_model.clone(),
        has_api_key: config.llm.api_key.is_some(),
        strategy: state.ensemble.read().strategy(),
    })
}
