//! Google Gemini adapter
//!
//! Speaks `POST /models/{model}:generateContent` with `x-goog-api-key`
//! authentication. Conversation history maps onto the `contents` array with
//! the assistant role renamed to `model`.

use super::{fail_from_response, malformed, Backend, GenerateRequest, RawCompletion};
use crate::error::{classify_transport, AppResult};
use async_trait::async_trait;
use serde_json::{json, Value};

pub struct GoogleBackend {
    client: reqwest::Client,
    base_url: String,
    model: String,
    api_key: String,
}

impl GoogleBackend {
    pub fn new(client: reqwest::Client, base_url: String, model: String, api_key: String) -> Self {
        Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            model,
            api_key,
        }
    }

    fn build_contents(&self, request: &GenerateRequest) -> Vec<Value> {
        let mut contents = Vec::new();
        for prior in &request.history {
            let role = if prior.role == "assistant" {
                "model"
            } else {
                "user"
            };
            contents.push(json!({
                "role": role,
                "parts": [{"text": prior.content}]
            }));
        }

        let mut parts = vec![json!({"text": request.prompt})];
        if let Some(image) = &request.image {
            parts.push(json!({
                "inline_data": {
                    "mime_type": image.media_type,
                    "data": image.data,
                }
            }));
        }
        contents.push(json!({"role": "user", "parts": parts}));
        contents
    }
}

#[async_trait]
impl Backend for GoogleBackend {
    async fn generate(&self, request: &GenerateRequest) -> AppResult<RawCompletion> {
        let url = format!("{}/models/{}:generateContent", self.base_url, self.model);

        let mut body = json!({
            "contents": self.build_contents(request),
            "generationConfig": {
                "maxOutputTokens": request.max_tokens,
                "temperature": request.temperature,
            }
        });
        if let Some(system) = &request.system {
            body["systemInstruction"] = json!({"parts": [{"text": system}]});
        }

        let response = self
            .client
            .post(&url)
            .header("x-goog-api-key", &self.api_key)
            .json(&body)
            .send()
            .await
            .map_err(|e| classify_transport(&self.base_url, &e))?;

        if !response.status().is_success() {
            return Err(fail_from_response(&self.base_url, response).await);
        }

        let body: Value = response
            .json()
            .await
            .map_err(|e| malformed(&self.base_url, &e.to_string()))?;

        let text = body["candidates"][0]["content"]["parts"]
            .as_array()
            .map(|parts| {
                parts
                    .iter()
                    .filter_map(|p| p["text"].as_str())
                    .collect::<Vec<_>>()
                    .join("")
            })
            .unwrap_or_default();
        if text.is_empty() {
            return Err(malformed(&self.base_url, "no candidate text parts"));
        }

        Ok(RawCompletion {
            text,
            tokens_in: body["usageMetadata"]["promptTokenCount"].as_u64(),
            tokens_out: body["usageMetadata"]["candidatesTokenCount"].as_u64(),
        })
    }

    async fn validate_credentials(&self) -> AppResult<bool> {
        let url = format!("{}/models", self.base_url);
        let response = self
            .client
            .get(&url)
            .header("x-goog-api-key", &self.api_key)
            .send()
            .await
            .map_err(|e| classify_transport(&self.base_url, &e))?;
        Ok(response.status().is_success())
    }
}
