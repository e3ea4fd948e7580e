//! One-shot text replies over the Gemini REST `generateContent` endpoint.
//!
//! Used for messages produced outside a live voice connection, such as the
//! delayed proactive follow-ups.

use super::{ReplyGenerator, ReplyRequest, Role, TranscriptEntry};
use anyhow::{anyhow, Result};
use async_trait::async_trait;
use reqwest::Client;
use serde_json::{json, Value};
use std::time::Instant;
use tracing::debug;

pub struct GeminiTextClient {
    client: Client,
    api_key: String,
    model: String,
    endpoint: String,
}

impl GeminiTextClient {
    pub fn new(api_key: String, model: String, endpoint: String) -> Self {
        Self {
            client: Client::new(),
            api_key,
            model,
            endpoint,
        }
    }

    fn request_body(request: &ReplyRequest<'_>) -> Value {
        let mut contents: Vec<Value> = request
            .history
            .iter()
            .filter(|entry| !entry.text.trim().is_empty())
            .map(|entry: &TranscriptEntry| {
                let role = match entry.role {
                    Role::User => "user",
                    Role::Model => "model",
                };
                json!({ "role": role, "parts": [{ "text": entry.text }] })
            })
            .collect();
        contents.push(json!({ "role": "user", "parts": [{ "text": request.instruction }] }));

        json!({
            "systemInstruction": { "parts": [{ "text": request.system_prompt }] },
            "contents": contents,
        })
    }

    fn extract_text(response: &Value) -> Result<String> {
        let parts = response["candidates"][0]["content"]["parts"]
            .as_array()
            .ok_or_else(|| anyhow!("No content in Gemini response"))?;

        let text: String = parts.iter().filter_map(|part| part["text"].as_str()).collect();
        if text.trim().is_empty() {
            return Err(anyhow!("Empty text in Gemini response"));
        }
        Ok(text.trim().to_string())
    }
}

#[async_trait]
impl ReplyGenerator for GeminiTextClient {
    async fn generate(&self, request: ReplyRequest<'_>) -> Result<String> {
        let start = Instant::now();
        let url = format!(
            "{}/models/{}:generateContent",
            self.endpoint.trim_end_matches('/'),
            self.model
        );

        let response = self
            .client
            .post(&url)
            .header("x-goog-api-key", &self.api_key)
            .json(&Self::request_body(&request))
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status();
            let error_text = response.text().await?;
            return Err(anyhow!("Gemini API error {}: {}", status, error_text));
        }

        let raw = response.json::<Value>().await?;
        let text = Self::extract_text(&raw)?;
        debug!(model = %self.model, latency_ms = start.elapsed().as_millis() as u64, "Generated text reply");
        Ok(text)
    }
}
