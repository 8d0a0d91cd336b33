//! LLM text-generation client.
//!
//! One trait seam, [`TextGenerator`], shared by the thread labeler and the
//! query assistant so both can be driven by a scripted fake in tests. The
//! production implementation is [`GeminiClient`] against the
//! `generateContent` endpoint, with the same retry discipline as the
//! embedding client: 429/5xx and network errors back off and retry, other
//! 4xx fail immediately.

use anyhow::{bail, Result};
use async_trait::async_trait;
use std::time::Duration;

use crate::config::require_env;

/// Something that turns a prompt into generated text.
#[async_trait]
pub trait TextGenerator: Send + Sync {
    async fn generate(&self, prompt: &str) -> Result<String>;
}

/// Client for the Gemini `generateContent` API. Requires the
/// `GEMINI_API_KEY` environment variable.
pub struct GeminiClient {
    model: String,
    max_retries: u32,
    timeout_secs: u64,
}

impl GeminiClient {
    pub fn new(model: &str, max_retries: u32, timeout_secs: u64) -> Result<Self> {
        require_env("GEMINI_API_KEY")?;
        Ok(Self {
            model: model.to_string(),
            max_retries,
            timeout_secs,
        })
    }

    fn endpoint(&self, api_key: &str) -> String {
        format!(
            "https://generativelanguage.googleapis.com/v1beta/models/{}:generateContent?key={}",
            self.model, api_key
        )
    }
}

#[async_trait]
impl TextGenerator for GeminiClient {
    async fn generate(&self, prompt: &str) -> Result<String> {
        let api_key = require_env("GEMINI_API_KEY")?;

        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(self.timeout_secs))
            .build()?;

        let body = serde_json::json!({
            "contents": [{ "parts": [{ "text": prompt }] }],
        });

        let mut last_err = None;

        for attempt in 0..=self.max_retries {
            if attempt > 0 {
                let delay = Duration::from_secs(1 << (attempt - 1).min(5));
                tokio::time::sleep(delay).await;
            }

            let resp = client
                .post(self.endpoint(&api_key))
                .header("Content-Type", "application/json")
                .json(&body)
                .send()
                .await;

            match resp {
                Ok(response) => {
                    let status = response.status();

                    if status.is_success() {
                        let json: serde_json::Value = response.json().await?;
                        return extract_text(&json);
                    }

                    if status.as_u16() == 429 || status.is_server_error() {
                        let body_text = response.text().await.unwrap_or_default();
                        last_err = Some(anyhow::anyhow!(
                            "Gemini API error {}: {}",
                            status,
                            body_text
                        ));
                        continue;
                    }

                    let body_text = response.text().await.unwrap_or_default();
                    bail!("Gemini API error {}: {}", status, body_text);
                }
                Err(e) => {
                    last_err = Some(e.into());
                    continue;
                }
            }
        }

        Err(last_err.unwrap_or_else(|| anyhow::anyhow!("Generation failed after retries")))
    }
}

/// Pull the generated text out of a `generateContent` response body.
fn extract_text(json: &serde_json::Value) -> Result<String> {
    let text = json
        .get("candidates")
        .and_then(|c| c.get(0))
        .and_then(|c| c.get("content"))
        .and_then(|c| c.get("parts"))
        .and_then(|p| p.get(0))
        .and_then(|p| p.get("text"))
        .and_then(|t| t.as_str())
        .ok_or_else(|| anyhow::anyhow!("Invalid Gemini response: no candidate text"))?;

    if text.trim().is_empty() {
        bail!("Gemini returned empty text");
    }

    Ok(text.to_string())
}

/// Strip a surrounding markdown code fence (```json ... ``` or ``` ... ```)
/// from generated text. Models wrap JSON replies in fences routinely.
pub fn strip_code_fences(text: &str) -> &str {
    let mut s = text.trim();
    if let Some(rest) = s.strip_prefix("```json") {
        s = rest.trim_start();
    } else if let Some(rest) = s.strip_prefix("```") {
        s = rest.trim_start();
    }
    if let Some(rest) = s.strip_suffix("```") {
        s = rest.trim_end();
    }
    s
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extract_text_happy_path() {
        let json = serde_json::json!({
            "candidates": [{
                "content": { "parts": [{ "text": "hello" }] }
            }]
        });
        assert_eq!(extract_text(&json).unwrap(), "hello");
    }

    #[test]
    fn extract_text_rejects_empty_candidates() {
        let json = serde_json::json!({ "candidates": [] });
        assert!(extract_text(&json).is_err());
    }

    #[test]
    fn strip_fences_json_block() {
        let fenced = "```json\n[{\"a\": 1}]\n```";
        assert_eq!(strip_code_fences(fenced), "[{\"a\": 1}]");
    }

    #[test]
    fn strip_fences_plain_block() {
        assert_eq!(strip_code_fences("```\n{}\n```"), "{}");
    }

    #[test]
    fn strip_fences_noop_without_fence() {
        assert_eq!(strip_code_fences("  [1, 2]  "), "[1, 2]");
    }
}
