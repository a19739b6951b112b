use std::convert::Infallible;
use std::time::Duration;

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::sse::{Event, Sse};
use axum::Json;
use futures_util::stream::{self, Stream, StreamExt};
use serde_json::json;

use crate::llm::chat_stream::stream_chat;
use crate::llm::narrate::{sanitize_for_prompt, stage_summary};
use crate::models::{AnalysisContext, ChatMessage, ChatRequest};
use crate::state::AppState;

const MAX_CHAT_MESSAGE_LEN: usize = 2000;
const MAX_HISTORY_TURNS: usize = 10;
const IDLE_TIMEOUT_SECS: u64 = 30;

/// POST /api/chat - Advisory chat about hair loss, streamed over SSE.
pub async fn chat(
    State(state): State<AppState>,
    Json(req): Json<ChatRequest>,
) -> Result<Sse<impl Stream<Item = Result<Event, Infallible>>>, (StatusCode, String)> {
    if !state.config.llm.enabled {
        return Err((StatusCode::SERVICE_UNAVAILABLE, "Chat is disabled".to_string()));
    }

    // ── Validate and sanitize input ───────────────────────
    let message = req.message.trim().to_string();
    if message.is_empty() {
        return Err((StatusCode::BAD_REQUEST, "Message is required".to_string()));
    }
    let message = sanitize_for_prompt(&truncate_to_char_boundary(&message, MAX_CHAT_MESSAGE_LEN));
    let history = validate_and_sanitize_history(req.history);
    let analysis = req.analysis.and_then(|a| validated_context(a, state.ensemble.read().num_classes));

    // ── Acquire semaphore ─────────────────────────────────
    let _permit = state
        .chat_semaphore
        .clone()
        .acquire_owned()
        .await
        .map_err(|_| {
            (
                StatusCode::SERVICE_UNAVAILABLE,
                "Chat service at capacity".to_string(),
            )
        })?;

    let messages = build_messages(build_system_prompt(analysis.as_ref()), &history, &message);
    let context_event = sse_event("context", json!({ "analysis": analysis }));

    // ── Start LLM stream ──────────────────────────────────
    let llm_stream = stream_chat(&state.http_client, &state.config.llm, messages)
        .await
        .map_err(|e| {
            tracing::warn!("Chat stream failed to start: {e:#}");
            (StatusCode::BAD_GATEWAY, format!("LLM error: {e}"))
        })?;

    // ── Map to SSE events with idle timeout ───────────────
    let idle_timeout = Duration::from_secs(IDLE_TIMEOUT_SECS);

    let delta_stream = stream::unfold(Some(llm_stream), move |llm_stream| async move {
        let mut llm_stream = llm_stream?;
        match tokio::time::timeout(idle_timeout, llm_stream.next()).await {
            Ok(Some(Ok(content))) => Some((
                sse_event("delta", json!({ "content": content })),
                Some(llm_stream),
            )),
            // Emit the error and end the stream
            Ok(Some(Err(e))) => Some((sse_event("error", json!({ "message": e.to_string() })), None)),
            Ok(None) => None,
            Err(_) => Some((
                sse_event("error", json!({ "message": "LLM response timed out (idle)" })),
                None,
            )),
        }
    });

    let event_stream = stream::once(async move { context_event })
        .chain(delta_stream)
        .chain(stream::once(async { sse_event("done", json!({})) }));

    // Hold the semaphore permit for the lifetime of the stream
    let event_stream = event_stream.map(move |event| {
        let _permit = &_permit;
        event
    });

    Ok(Sse::new(event_stream))
}

// ─── Helper functions ────────────────────────────────────

fn sse_event(name: &str, data: serde_json::Value) -> Result<Event, Infallible> {
    Ok(Event::default().event(name).data(data.to_string()))
}

/// Drop an analysis context whose stage is outside the configured range.
fn validated_context(context: AnalysisContext, num_classes: usize) -> Option<AnalysisContext> {
    match context.predicted_stage {
        Some(stage) if stage == 0 || stage as usize > num_classes => None,
        _ => Some(AnalysisContext {
            predicted_stage: context.predicted_stage,
            confidence: if context.confidence.is_finite() {
                context.confidence.clamp(0.0, 1.0)
            } else {
                0.0
            },
        }),
    }
}

fn validate_and_sanitize_history(history: Option<Vec<ChatMessage>>) -> Vec<ChatMessage> {
    let kept: Vec<ChatMessage> = history
        .unwrap_or_default()
        .into_iter()
        .filter(|m| m.role == "user" || m.role == "assistant")
        .map(|m| ChatMessage {
            role: m.role,
            content: sanitize_for_prompt(&truncate_to_char_boundary(
                &m.content,
                MAX_CHAT_MESSAGE_LEN,
            )),
        })
        .collect();
    let skip = kept.len().saturating_sub(MAX_HISTORY_TURNS);
    kept.into_iter().skip(skip).collect()
}

fn build_system_prompt(analysis: Option<&AnalysisContext>) -> String {
    let mut prompt = String::from(
        "You are a friendly assistant that answers questions about male and female pattern hair loss.\n\
         Explain stages, common causes and general care options in plain language.\n\
         You are not a doctor: never diagnose, never prescribe, and suggest seeing a \
         dermatologist for treatment decisions.\n\
         Keep answers short and practical.",
    );

    if let Some(ctx) = analysis {
        match ctx.predicted_stage {
            Some(stage) => prompt.push_str(&format!(
                "\n\nThe user's latest photo analysis estimated stage {stage} ({}) with {:.0}% confidence. \
                 Treat this as an estimate, not a diagnosis.",
                stage_summary(stage),
                ctx.confidence * 100.0
            )),
            None => prompt.push_str(
                "\n\nThe user's latest photo analysis could not determine a stage.",
            ),
        }
    }

    prompt
}

fn build_messages(system_prompt: String, history: &[ChatMessage], message: &str) -> Vec<ChatMessage> {
    let mut messages = Vec::with_capacity(history.len() + 2);
    messages.push(ChatMessage {
        role: "system".to_string(),
        content: system_prompt,
    });
    messages.extend(history.iter().cloned());
    messages.push(ChatMessage {
        role: "user".to_string(),
        content: message.to_string(),
    });
    messages
}

fn truncate_to_char_boundary(s: &str, max_len: usize) -> String {
    if s.len() <= max_len {
        return s.to_string();
    }
    s.char_indices()
        .take_while(|(i, _)| *i < max_len)
        .map(|(_, c)| c)
        .collect()
}
