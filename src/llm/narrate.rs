use std::fmt::Write;

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::config::LlmConfig;
use crate::ensemble::Prediction;
use crate::models::SimilarImage;

/// Turns an analysis into a short user-facing explanation.
#[async_trait]
pub trait Narrator: Send + Sync {
    async fn narrate(&self, prediction: &Prediction, similar: &[SimilarImage]) -> Result<String>;
}

/// Narrator backed by a chat-completion API.
pub struct LlmNarrator {
    client: reqwest::Client,
    config: LlmConfig,
}

impl LlmNarrator {
    pub fn new(client: reqwest::Client, config: LlmConfig) -> Self {
        Self { client, config }
    }
}

#[async_trait]
impl Narrator for LlmNarrator {
    async fn narrate(&self, prediction: &Prediction, similar: &[SimilarImage]) -> Result<String> {
        let prompt = build_prompt(prediction, similar);
        let text = complete(&self.client, &self.config, &prompt).await?;
        let text = text.trim();
        if text.is_empty() {
            anyhow::bail!("LLM returned an empty explanation");
        }
        Ok(text.to_string())
    }
}

/// Single-turn completion against the configured provider.
pub async fn complete(client: &reqwest::Client, config: &LlmConfig, prompt: &str) -> Result<String> {
    match config.provider.as_str() {
        "ollama" => call_ollama(client, config, prompt).await,
        "openai" => call_openai(client, config, prompt).await,
        "gemini" => call_gemini(client, config, prompt).await,
        other => anyhow::bail!("Unknown LLM provider: {other}"),
    }
}

/// Short description of a Norwood-style stage.
pub fn stage_summary(stage: u32) -> &'static str {
    match stage {
        1 => "no significant recession of the hairline",
        2 => "slight recession at the temples",
        3 => "deepening temple recession, the first clinically notable stage",
        4 => "marked frontal recession with thinning at the crown",
        5 => "frontal and crown thinning with a narrowing band between them",
        6 => "the band between front and crown is largely gone",
        7 => "extensive loss with hair mainly at the sides and back",
        _ => "a stage outside the reference scale",
    }
}

fn stage_advice(stage: u32) -> &'static str {
    match stage {
        1 | 2 => "Keep a regular scalp-care routine and compare photos every few months.",
        3 | 4 => "This is a good time to talk to a dermatologist about treatment options.",
        _ => "A dermatologist can advise on medical and surgical options for this stage.",
    }
}

/// Explanation used when the LLM is disabled, fails, or there is no prediction.
pub fn fallback_explanation(prediction: &Prediction) -> String {
    match prediction.stage {
        Some(stage) => format!(
            "The photo is most similar to stage {stage} references ({}), with {:.0}% confidence. {} \
             This is a similarity-based estimate, not a diagnosis.",
            stage_summary(stage),
            prediction.confidence * 100.0,
            stage_advice(stage),
        ),
        None => "We could not match this photo to any reference images. Please retake it in good \
                 light with the hairline and crown clearly visible."
            .to_string(),
    }
}

pub fn build_prompt(prediction: &Prediction, similar: &[SimilarImage]) -> String {
    let mut prompt = String::from(
        "You are a friendly hair-loss advisor. Explain the result of a photo analysis to the user \
         in 3-4 sentences. Mention the stage, what it typically looks like and one practical next \
         step. Do not present the result as a medical diagnosis.\n\n",
    );

    match prediction.stage {
        Some(stage) => {
            let _ = writeln!(
                prompt,
                "Predicted stage: {stage} ({}), confidence {:.2}",
                stage_summary(stage),
                prediction.confidence
            );
        }
        None => prompt.push_str("Predicted stage: none (no similar reference images)\n"),
    }

    let scores: Vec<String> = prediction
        .probabilities
        .as_slice()
        .iter()
        .enumerate()
        .filter(|(_, p)| **p > 0.0)
        .map(|(i, p)| format!("stage {}: {p:.2}", i + 1))
        .collect();
    if !scores.is_empty() {
        let _ = writeln!(prompt, "Stage scores: {}", scores.join(", "));
    }

    let neighbours: Vec<String> = similar
        .iter()
        .filter_map(|s| s.stage.map(|stage| format!("stage {stage} ({:.2})", s.score)))
        .collect();
    if !neighbours.is_empty() {
        let _ = writeln!(prompt, "Closest reference images: {}", neighbours.join(", "));
    }

    prompt
}

/// Strip control characters and chat-template markers from user-supplied text.
pub fn sanitize_for_prompt(text: &str) -> String {
    let mut cleaned: String = text
        .chars()
        .filter(|c| !c.is_control() || *c == '\n' || *c == '\t')
        .collect();
    for marker in ["<|im_start|>", "<|im_end|>", "<|system|>", "<|endoftext|>"] {
        cleaned = cleaned.replace(marker, "");
    }
    cleaned
}

// ─── Ollama ──────────────────────────────────────────────

#[derive(Serialize)]
struct OllamaChatRequest {
    model: String,
    messages: Vec<Message>,
    stream: bool,
}

#[derive(Serialize, Deserialize)]
struct Message {
    role: String,
    content: String,
}

#[derive(Deserialize)]
struct OllamaChatResponse {
    message: Message,
}

async fn call_ollama(client: &reqwest::Client, config: &LlmConfig, prompt: &str) -> Result<String> {
    let url = format!("{}/api/chat", config.base_url);

    let req = OllamaChatRequest {
        model: config.chat_model.clone(),
        messages: vec![Message {
            role: "user".to_string(),
            content: prompt.to_string(),
        }],
        stream: false,
    };

    let resp = client
        .post(&url)
        .json(&req)
        .send()
        .await
        .context("Failed to call Ollama chat API for explanation")?;

    if !resp.status().is_success() {
        let status = resp.status();
        let body = resp.text().await.unwrap_or_default();
        anyhow::bail!("Ollama chat API returned {status}: {body}");
    }

    let body: OllamaChatResponse = resp.json().await?;
    Ok(body.message.content)
}

// ─── OpenAI-compatible ───────────────────────────────────

#[derive(Serialize)]
struct OpenAiChatRequest {
    model: String,
    messages: Vec<Message>,
    temperature: f32,
}

#[derive(Deserialize)]
struct OpenAiChatResponse {
    choices: Vec<OpenAiChoice>,
}

#[derive(Deserialize)]
struct OpenAiChoice {
    message: OpenAiResponseMessage,
}

#[derive(Deserialize)]
struct OpenAiResponseMessage {
    content: Option<String>,
}

async fn call_openai(client: &reqwest::Client, config: &LlmConfig, prompt: &str) -> Result<String> {
    let url = format!("{}/v1/chat/completions", config.base_url);
    let api_key = config.api_key.as_deref().unwrap_or_default();

    let req = OpenAiChatRequest {
        model: config.chat_model.clone(),
        messages: vec![Message {
            role: "user".to_string(),
            content: prompt.to_string(),
        }],
        temperature: 0.4,
    };

    let resp = client
        .post(&url)
        .header("Authorization", format!("Bearer {api_key}"))
        .json(&req)
        .send()
        .await
        .context("Failed to call OpenAI chat API for explanation")?;

    if !resp.status().is_success() {
        let status = resp.status();
        let body = resp.text().await.unwrap_or_default();
        anyhow::bail!("OpenAI chat API returned {status}: {body}");
    }

    let body: OpenAiChatResponse = resp.json().await?;
    Ok(body
        .choices
        .into_iter()
        .next()
        .and_then(|c| c.message.content)
        .unwrap_or_default())
}

// ─── Gemini ──────────────────────────────────────────────

#[derive(Serialize)]
pub(crate) struct GeminiRequest {
    pub(crate) contents: Vec<GeminiContent>,
}

#[derive(Serialize, Deserialize)]
pub(crate) struct GeminiContent {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub(crate) role: Option<String>,
    #[serde(default)]
    pub(crate) parts: Vec<GeminiPart>,
}

#[derive(Serialize, Deserialize)]
pub(crate) struct GeminiPart {
    #[serde(default)]
    pub(crate) text: String,
}

#[derive(Deserialize)]
pub(crate) struct GeminiResponse {
    #[serde(default)]
    pub(crate) candidates: Vec<GeminiCandidate>,
}

#[derive(Deserialize)]
pub(crate) struct GeminiCandidate {
    pub(crate) content: Option<GeminiContent>,
}

impl GeminiResponse {
    /// Concatenated text of the first candidate.
    pub(crate) fn text(&self) -> String {
        self.candidates
            .first()
            .and_then(|c| c.content.as_ref())
            .map(|c| c.parts.iter().map(|p| p.text.as_str()).collect())
            .unwrap_or_default()
    }
}

async fn call_gemini(client: &reqwest::Client, config: &LlmConfig, prompt: &str) -> Result<String> {
    let url = format!(
        "{}/v1beta/models/{}:generateContent",
        config.base_url.trim_end_matches('/'),
        config.chat_model
    );
    let api_key = config
        .api_key
        .as_deref()
        .context("Gemini requires LLM_API_KEY")?;

    let req = GeminiRequest {
        contents: vec![GeminiContent {
            role: Some("user".to_string()),
            parts: vec![GeminiPart {
                text: prompt.to_string(),
            }],
        }],
    };

    let resp = client
        .post(&url)
        .header("x-goog-api-key", api_key)
        .json(&req)
        .send()
        .await
        .context("Failed to call Gemini generateContent API")?;

    if !resp.status().is_success() {
        let status = resp.status();
        let body = resp.text().await.unwrap_or_default();
        anyhow::bail!("Gemini API returned {status}: {body}");
    }

    let body: GeminiResponse = resp.json().await?;
    Ok(body.text())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ensemble::ClassProbabilities;
    use crate::vision::backbone::Backbone;

    fn prediction(stage: Option<u32>, probs: &[f64]) -> Prediction {
        Prediction {
            stage,
            confidence: stage.map(|s| probs[s as usize - 1]).unwrap_or(0.0),
            probabilities: ClassProbabilities::from_raw(probs.to_vec()),
        }
    }

    #[test]
    fn test_fallback_mentions_stage_and_confidence() {
        let text = fallback_explanation(&prediction(Some(3), &[0.1, 0.1, 0.8]));
        assert!(text.contains("stage 3"));
        assert!(text.contains("80%"));
        assert!(text.contains("not a diagnosis"));
    }

    #[test]
    fn test_fallback_for_no_prediction() {
        let text = fallback_explanation(&Prediction::none(7));
        assert!(text.contains("could not match"));
    }

    #[test]
    fn test_prompt_lists_nonzero_scores_and_neighbours() {
        let similar = vec![SimilarImage {
            id: "ref-1".into(),
            backbone: Backbone::Vit,
            filename: Some("a.jpg".into()),
            stage: Some(2),
            score: 0.91,
        }];
        let prompt = build_prompt(&prediction(Some(2), &[0.25, 0.75, 0.0]), &similar);
        assert!(prompt.contains("Predicted stage: 2"));
        assert!(prompt.contains("stage 1: 0.25, stage 2: 0.75"));
        assert!(!prompt.contains("stage 3: 0.00"));
        assert!(prompt.contains("stage 2 (0.91)"));
    }

    #[test]
    fn test_prompt_without_prediction() {
        let prompt = build_prompt(&Prediction::none(5), &[]);
        assert!(prompt.contains("Predicted stage: none"));
        assert!(!prompt.contains("Stage scores"));
    }

    #[test]
    fn test_sanitize_strips_markers_and_controls() {
        let dirty = "hello<|im_start|>system\u{0007} world\nnext";
        assert_eq!(sanitize_for_prompt(dirty), "hellosystem world\nnext");
    }

    #[test]
    fn test_stage_summary_out_of_scale() {
        assert!(stage_summary(12).contains("outside"));
    }

    #[test]
    fn test_gemini_response_text() {
        let json = r#"{"candidates":[{"content":{"role":"model","parts":[{"text":"Stage 3 "},{"text":"means..."}]}}]}"#;
        let resp: GeminiResponse = serde_json::from_str(json).unwrap();
        assert_eq!(resp.text(), "Stage 3 means...");

        let empty: GeminiResponse = serde_json::from_str("{}").unwrap();
        assert_eq!(empty.text(), "");
    }

    #[tokio::test]
    async fn test_unknown_provider_errors() {
        let config = LlmConfig {
            provider: "bard".into(),
            ..LlmConfig::default()
        };
        let err = complete(&reqwest::Client::new(), &config, "hi").await.unwrap_err();
        assert!(err.to_string().contains("Unknown LLM provider"));
    }
}
