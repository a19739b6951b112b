use axum::extract::DefaultBodyLimit;
use axum::routing::{get, post};
use axum::Router;

use crate::state::AppState;

pub mod analyze;
pub mod chat;
pub mod ensemble;
pub mod vectors;

/// Body limit for JSON routes that carry vectors.
const MAX_JSON_BODY: usize = 64 * 1024 * 1024;

/// All HTTP routes, bound to `state`.
pub fn router(state: AppState) -> Router {
    let max_image_bytes = state.config.max_image_bytes;

    Router::new()
        .route(
            "/api/analyze",
            post(analyze::analyze_image).layer(DefaultBodyLimit::max(max_image_bytes)),
        )
        .route("/api/analyze/embeddings", post(analyze::analyze_embeddings))
        .route(
            "/api/vectors/{backbone}",
            post(vectors::upsert_vectors).layer(DefaultBodyLimit::max(MAX_JSON_BODY)),
        )
        .route("/api/vectors/{backbone}/stats", get(vectors::vector_stats))
        .route("/api/vectors/{backbone}/delete", post(vectors::delete_vectors))
        .route("/api/datasets/reindex", post(vectors::reindex))
        .route(
            "/api/ensemble",
            get(ensemble::get_ensemble).put(ensemble::put_ensemble),
        )
        .route(
            "/api/ensemble/tune",
            post(ensemble::tune_ensemble).layer(DefaultBodyLimit::max(MAX_JSON_BODY)),
        )
        .route("/api/chat", post(chat::chat))
        .route("/api/health", get(ensemble::health))
        .route("/api/config", get(ensemble::get_config))
        .with_state(state)
}
