use anyhow::{Context, Result};
use futures_util::stream::{Stream, StreamExt};
use serde::{Deserialize, Serialize};
use std::pin::Pin;
use std::time::Duration;

use super::narrate::{GeminiContent, GeminiPart, GeminiRequest, GeminiResponse};
use crate::config::LlmConfig;
use crate::models::ChatMessage;

type ChatStream = Pin<Box<dyn Stream<Item = Result<String>> + Send>>;

/// Wire format of a provider's streamed reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Dialect {
    /// Newline-delimited JSON objects.
    Ollama,
    /// SSE `data:` lines with chat-completion chunks.
    OpenAi,
    /// SSE `data:` lines with `GenerateContentResponse` objects.
    Gemini,
}

impl Dialect {
    fn for_provider(provider: &str) -> Result<Self> {
        match provider {
            "ollama" => Ok(Dialect::Ollama),
            "openai" => Ok(Dialect::OpenAi),
            "gemini" => Ok(Dialect::Gemini),
            other => anyhow::bail!("Unsupported LLM provider for chat: {other}"),
        }
    }

    /// Parse one line of the stream. Returns:
    /// - Some(Ok(content)) for content deltas
    /// - Some(Err(e)) for parse errors
    /// - None to skip (blank lines, keep-alives, done markers, empty deltas)
    fn parse_line(self, line: &str) -> Option<Result<String>> {
        let line = line.trim();
        if line.is_empty() {
            return None;
        }
        match self {
            Dialect::Ollama => parse_ollama_line(line),
            Dialect::OpenAi => sse_data(line).and_then(parse_openai_data),
            Dialect::Gemini => sse_data(line).and_then(parse_gemini_data),
        }
    }
}

/// Stream a chat reply as content deltas from the configured provider.
pub async fn stream_chat(
    client: &reqwest::Client,
    config: &LlmConfig,
    messages: Vec<ChatMessage>,
) -> Result<ChatStream> {
    let dialect = Dialect::for_provider(&config.provider)?;

    let request = match dialect {
        Dialect::Ollama => client
            .post(format!("{}/api/chat", config.base_url))
            .json(&OllamaStreamRequest {
                model: config.chat_model.clone(),
                messages: to_stream_messages(messages),
                stream: true,
            }),
        Dialect::OpenAi => client
            .post(format!("{}/v1/chat/completions", config.base_url))
            .header(
                "Authorization",
                format!("Bearer {}", config.api_key.as_deref().unwrap_or("")),
            )
            .json(&OpenAiStreamRequest {
                model: config.chat_model.clone(),
                messages: to_stream_messages(messages),
                stream: true,
            }),
        Dialect::Gemini => client
            .post(format!(
                "{}/v1beta/models/{}:streamGenerateContent?alt=sse",
                config.base_url.trim_end_matches('/'),
                config.chat_model
            ))
            .header("x-goog-api-key", config.api_key.as_deref().unwrap_or(""))
            .json(&to_gemini_request(messages)),
    };

    let resp = request
        .timeout(Duration::from_secs(300))
        .send()
        .await
        .with_context(|| format!("Failed to connect to {} for chat streaming", config.provider))?;

    if !resp.status().is_success() {
        let status = resp.status();
        let body = resp.text().await.unwrap_or_default();
        anyhow::bail!("{} chat API returned {status}: {body}", config.provider);
    }

    let stream = stream_lines(resp.bytes_stream()).filter_map(move |line_result| async move {
        match line_result {
            Ok(line) => dialect.parse_line(&line),
            Err(e) => Some(Err(e)),
        }
    });

    Ok(Box::pin(stream))
}

// ─── Request shapes ──────────────────────────────────────

#[derive(Serialize, Deserialize)]
struct StreamMessage {
    role: String,
    content: String,
}

#[derive(Serialize)]
struct OllamaStreamRequest {
    model: String,
    messages: Vec<StreamMessage>,
    stream: bool,
}

#[derive(Serialize)]
struct OpenAiStreamRequest {
    model: String,
    messages: Vec<StreamMessage>,
    stream: bool,
}

fn to_stream_messages(messages: Vec<ChatMessage>) -> Vec<StreamMessage> {
    messages
        .into_iter()
        .map(|m| StreamMessage {
            role: m.role,
            content: m.content,
        })
        .collect()
}

/// Gemini has no system role in `contents`; the system turn is folded into
/// the first user turn and `assistant` becomes `model`.
fn to_gemini_request(messages: Vec<ChatMessage>) -> GeminiRequest {
    let mut system = String::new();
    let mut contents: Vec<GeminiContent> = Vec::new();

    for m in messages {
        match m.role.as_str() {
            "system" => {
                system.push_str(&m.content);
                system.push_str("\n\n");
            }
            role => {
                let role = if role == "assistant" { "model" } else { "user" };
                let mut text = m.content;
                if role == "user" && !system.is_empty() {
                    text = format!("{}{text}", std::mem::take(&mut system));
                }
                contents.push(GeminiContent {
                    role: Some(role.to_string()),
                    parts: vec![GeminiPart { text }],
                });
            }
        }
    }

    GeminiRequest { contents }
}

// ─── Line parsing ────────────────────────────────────────

#[derive(Deserialize)]
struct OllamaStreamChunk {
    message: StreamMessage,
    done: bool,
}

#[derive(Deserialize)]
struct OpenAiStreamChunk {
    choices: Vec<OpenAiStreamChoice>,
}

#[derive(Deserialize)]
struct OpenAiStreamChoice {
    delta: OpenAiStreamDelta,
}

#[derive(Deserialize)]
struct OpenAiStreamDelta {
    content: Option<String>,
}

fn non_empty(content: String) -> Option<Result<String>> {
    (!content.is_empty()).then_some(Ok(content))
}

fn sse_data(line: &str) -> Option<&str> {
    let data = line.strip_prefix("data:")?.trim();
    (data != "[DONE]").then_some(data)
}

fn parse_ollama_line(line: &str) -> Option<Result<String>> {
    match serde_json::from_str::<OllamaStreamChunk>(line) {
        Ok(chunk) if chunk.done => None,
        Ok(chunk) => non_empty(chunk.message.content),
        Err(e) => Some(Err(anyhow::anyhow!("Failed to parse Ollama chunk: {e}"))),
    }
}

fn parse_openai_data(data: &str) -> Option<Result<String>> {
    match serde_json::from_str::<OpenAiStreamChunk>(data) {
        Ok(chunk) => non_empty(
            chunk
                .choices
                .into_iter()
                .next()
                .and_then(|c| c.delta.content)
                .unwrap_or_default(),
        ),
        Err(e) => Some(Err(anyhow::anyhow!("Failed to parse OpenAI chunk: {e}"))),
    }
}

fn parse_gemini_data(data: &str) -> Option<Result<String>> {
    match serde_json::from_str::<GeminiResponse>(data) {
        Ok(chunk) => non_empty(chunk.text()),
        Err(e) => Some(Err(anyhow::anyhow!("Failed to parse Gemini chunk: {e}"))),
    }
}

// ─── Line buffering ──────────────────────────────────────

/// Convert a byte stream into a stream of complete, non-blank lines.
fn stream_lines(
    byte_stream: impl Stream<Item = reqwest::Result<bytes::Bytes>> + Send + 'static,
) -> impl Stream<Item = Result<String>> + Send {
    futures_util::stream::unfold(
        (Box::pin(byte_stream), String::new()),
        |(mut stream, mut buffer)| async move {
            loop {
                if let Some(newline_pos) = buffer.find('\n') {
                    let line: String = buffer.drain(..=newline_pos).collect();
                    if !line.trim().is_empty() {
                        return Some((Ok(line), (stream, buffer)));
                    }
                    continue;
                }

                match stream.next().await {
                    Some(Ok(bytes)) => buffer.push_str(&String::from_utf8_lossy(&bytes)),
                    Some(Err(e)) => {
                        return Some((
                            Err(anyhow::anyhow!("Stream read error: {e}")),
                            (stream, buffer),
                        ));
                    }
                    None => {
                        if buffer.trim().is_empty() {
                            return None;
                        }
                        let remaining = std::mem::take(&mut buffer);
                        return Some((Ok(remaining), (stream, buffer)));
                    }
                }
            }
        },
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    // ─── Ollama ──────────────────────────────────────────

    #[test]
    fn test_parse_ollama_chunk() {
        let line = r#"{"message":{"role":"assistant","content":"Stage 3"},"done":false}"#;
        assert_eq!(Dialect::Ollama.parse_line(line).unwrap().unwrap(), "Stage 3");
    }

    #[test]
    fn test_parse_ollama_done_and_empty() {
        let done = r#"{"message":{"role":"assistant","content":""},"done":true}"#;
        let empty = r#"{"message":{"role":"assistant","content":""},"done":false}"#;
        assert!(Dialect::Ollama.parse_line(done).is_none());
        assert!(Dialect::Ollama.parse_line(empty).is_none());
    }

    #[test]
    fn test_parse_ollama_malformed() {
        assert!(Dialect::Ollama.parse_line("not json{{").unwrap().is_err());
    }

    // ─── OpenAI ──────────────────────────────────────────

    #[test]
    fn test_parse_openai_data_line() {
        let line = r#"data: {"choices":[{"delta":{"content":"Hello"}}]}"#;
        assert_eq!(Dialect::OpenAi.parse_line(line).unwrap().unwrap(), "Hello");
    }

    #[test]
    fn test_parse_openai_skips_done_role_and_events() {
        assert!(Dialect::OpenAi.parse_line("data: [DONE]").is_none());
        assert!(Dialect::OpenAi
            .parse_line(r#"data: {"choices":[{"delta":{"role":"assistant"}}]}"#)
            .is_none());
        assert!(Dialect::OpenAi.parse_line("event: message").is_none());
    }

    #[test]
    fn test_parse_openai_malformed() {
        assert!(Dialect::OpenAi.parse_line("data: {broken").unwrap().is_err());
    }

    // ─── Gemini ──────────────────────────────────────────

    #[test]
    fn test_parse_gemini_data_line() {
        let line = r#"data: {"candidates":[{"content":{"role":"model","parts":[{"text":"Keep "}]}}]}"#;
        assert_eq!(Dialect::Gemini.parse_line(line).unwrap().unwrap(), "Keep ");
    }

    #[test]
    fn test_parse_gemini_empty_candidate() {
        assert!(Dialect::Gemini.parse_line(r#"data: {"candidates":[]}"#).is_none());
    }

    #[test]
    fn test_gemini_request_folds_system_into_first_user_turn() {
        let req = to_gemini_request(vec![
            ChatMessage {
                role: "system".into(),
                content: "Be kind.".into(),
            },
            ChatMessage {
                role: "user".into(),
                content: "Hi".into(),
            },
            ChatMessage {
                role: "assistant".into(),
                content: "Hello".into(),
            },
            ChatMessage {
                role: "user".into(),
                content: "Stage?".into(),
            },
        ]);
        assert_eq!(req.contents.len(), 3);
        assert_eq!(req.contents[0].parts[0].text, "Be kind.\n\nHi");
        assert_eq!(req.contents[1].role.as_deref(), Some("model"));
        assert_eq!(req.contents[2].parts[0].text, "Stage?");
    }

    // ─── Edge cases ──────────────────────────────────────

    #[test]
    fn test_blank_lines_are_skipped_by_every_dialect() {
        for d in [Dialect::Ollama, Dialect::OpenAi, Dialect::Gemini] {
            assert!(d.parse_line("").is_none());
            assert!(d.parse_line("   ").is_none());
        }
    }

    #[test]
    fn test_unknown_provider() {
        assert!(Dialect::for_provider("bard").is_err());
    }

    #[tokio::test]
    async fn test_stream_lines_splits_across_chunks() {
        let chunks: Vec<reqwest::Result<bytes::Bytes>> = vec![
            Ok(bytes::Bytes::from_static(b"first li")),
            Ok(bytes::Bytes::from_static(b"ne\n\nsecond\nthi")),
            Ok(bytes::Bytes::from_static(b"rd")),
        ];
        let lines: Vec<String> = stream_lines(futures_util::stream::iter(chunks))
            .map(|l| l.unwrap().trim().to_string())
            .collect()
            .await;
        assert_eq!(lines, vec!["first line", "second", "third"]);
    }
}
