use axum::body::Bytes;
use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::Json;
use chrono::Utc;
use serde_json::Value;
use uuid::Uuid;

use crate::analyzer::{Analysis, AnalyzeOptions};
use crate::error::AnalyzeError;
use crate::models::{AnalyzeParams, AnalyzeResponse, EmbeddingAnalyzeRequest, Metadata, ModelScores};
use crate::state::AppState;

/// POST /api/analyze - Classify an uploaded scalp image (raw request body)
pub async fn analyze_image(
    State(state): State<AppState>,
    Query(params): Query<AnalyzeParams>,
    body: Bytes,
) -> Result<Json<AnalyzeResponse>, (StatusCode, String)> {
    if body.is_empty() {
        return Err((StatusCode::BAD_REQUEST, "Image body is required".to_string()));
    }
    if body.len() > state.config.max_image_bytes {
        return Err((
            StatusCode::PAYLOAD_TOO_LARGE,
            format!(
                "Image is {} bytes; the limit is {}",
                body.len(),
                state.config.max_image_bytes
            ),
        ));
    }

    let options = AnalyzeOptions {
        top_k: state.config.effective_top_k(params.top_k),
        explain: params.explain.unwrap_or(true),
        filter: gender_filter(params.gender.as_deref()),
    };
    let ensemble = state.ensemble();

    let analysis = state
        .analyzer
        .analyze(&body, &ensemble, &options)
        .await
        .map_err(error_response)?;

    Ok(Json(to_response(analysis)))
}

/// POST /api/analyze/embeddings - Classify from precomputed embeddings
pub async fn analyze_embeddings(
    State(state): State<AppState>,
    Json(req): Json<EmbeddingAnalyzeRequest>,
) -> Result<Json<AnalyzeResponse>, (StatusCode, String)> {
    let options = AnalyzeOptions {
        top_k: state.config.effective_top_k(req.top_k),
        explain: req.explain,
        filter: req.filter.filter(|f| !f.is_empty()),
    };
    let ensemble = state.ensemble();

    let analysis = state
        .analyzer
        .analyze_embeddings(&req.conv_embedding, &req.vit_embedding, &ensemble, &options)
        .await
        .map_err(error_response)?;

    Ok(Json(to_response(analysis)))
}

fn gender_filter(gender: Option<&str>) -> Option<Metadata> {
    let gender = gender.map(str::trim).filter(|g| !g.is_empty())?;
    let mut filter = Metadata::new();
    filter.insert("gender".to_string(), Value::String(gender.to_lowercase()));
    Some(filter)
}

pub(crate) fn error_response(err: AnalyzeError) -> (StatusCode, String) {
    let status = match &err {
        AnalyzeError::EmptyImage => StatusCode::BAD_REQUEST,
        AnalyzeError::InvalidInput(_) => StatusCode::UNPROCESSABLE_ENTITY,
        AnalyzeError::Embedding { .. } => StatusCode::BAD_GATEWAY,
        AnalyzeError::IndexUnavailable { .. } => StatusCode::SERVICE_UNAVAILABLE,
    };
    if status.is_server_error() {
        tracing::warn!("Analysis failed: {err}");
    }
    (status, err.to_string())
}

pub(crate) fn to_response(analysis: Analysis) -> AnalyzeResponse {
    AnalyzeResponse {
        analysis_id: Uuid::new_v4(),
        analyzed_at: Utc::now(),
        predicted_stage: analysis.prediction.stage,
        confidence: analysis.prediction.confidence,
        stage_scores: analysis.prediction.probabilities.to_stage_map(),
        model_scores: ModelScores {
            conv: analysis.conv.probabilities.to_stage_map(),
            vit: analysis.vit.probabilities.to_stage_map(),
        },
        strategy: analysis.strategy.to_string(),
        similar_images: analysis.similar_images,
        explanation: analysis.explanation,
        explanation_source: analysis.explanation_source,
    }
}
