//! OpenAI-compatible chat completions adapter
//!
//! Serves every local runtime (LM Studio, Ollama, llama.cpp, vLLM, ...)
//! plus the cloud providers that speak the same dialect (OpenAI,
//! OpenRouter, Moonshot). Authentication is a Bearer header when a key is
//! present; local runtimes take none.

use super::{
    fail_from_response, malformed, Backend, GenerateRequest, RawCompletion,
};
use crate::error::{classify_transport, AppResult};
use async_trait::async_trait;
use serde::Serialize;

/// Message content: plain text, or text plus image parts for multimodal
/// requests.
#[derive(Debug, Clone, Serialize)]
#[serde(untagged)]
enum MessageContent {
    Text(String),
    Parts(Vec<ContentPart>),
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type")]
enum ContentPart {
    #[serde(rename = "text")]
    Text { text: String },
    #[serde(rename = "image_url")]
    ImageUrl { image_url: ImageUrlDetail },
}

#[derive(Debug, Clone, Serialize)]
struct ImageUrlDetail {
    url: String,
}

#[derive(Debug, Clone, Serialize)]
struct Message {
    role: String,
    content: MessageContent,
}

#[derive(Debug, Serialize)]
struct ChatCompletionRequest {
    model: String,
    messages: Vec<Message>,
    stream: bool,
    temperature: f32,
    max_tokens: u32,
}

pub struct OpenAiCompatBackend {
    client: reqwest::Client,
    base_url: String,
    model: String,
    api_key: Option<String>,
}

impl OpenAiCompatBackend {
    pub fn new(
        client: reqwest::Client,
        base_url: String,
        model: String,
        api_key: Option<String>,
    ) -> Self {
        Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            model,
            api_key,
        }
    }

    fn build_messages(&self, request: &GenerateRequest) -> Vec<Message> {
        let mut messages = Vec::new();
        if let Some(system) = &request.system {
            messages.push(Message {
                role: "system".to_string(),
                content: MessageContent::Text(system.clone()),
            });
        }
        for prior in &request.history {
            messages.push(Message {
                role: prior.role.clone(),
                content: MessageContent::Text(prior.content.clone()),
            });
        }

        let content = match &request.image {
            Some(image) => MessageContent::Parts(vec![
                ContentPart::Text {
                    text: request.prompt.clone(),
                },
                ContentPart::ImageUrl {
                    image_url: ImageUrlDetail {
                        url: image.to_data_url(),
                    },
                },
            ]),
            None => MessageContent::Text(request.prompt.clone()),
        };
        messages.push(Message {
            role: "user".to_string(),
            content,
        });
        messages
    }

    fn authorize(&self, builder: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.api_key {
            Some(key) => builder.header("Authorization", format!("Bearer {key}")),
            None => builder,
        }
    }
}

#[async_trait]
impl Backend for OpenAiCompatBackend {
    async fn generate(&self, request: &GenerateRequest) -> AppResult<RawCompletion> {
        let url = format!("{}/chat/completions", self.base_url);
        let body = ChatCompletionRequest {
            model: self.model.clone(),
            messages: self.build_messages(request),
            stream: false,
            temperature: request.temperature,
            max_tokens: request.max_tokens,
        };

        let response = self
            .authorize(self.client.post(&url))
            .json(&body)
            .send()
            .await
            .map_err(|e| classify_transport(&self.base_url, &e))?;

        if !response.status().is_success() {
            return Err(fail_from_response(&self.base_url, response).await);
        }

        let body: serde_json::Value = response
            .json()
            .await
            .map_err(|e| malformed(&self.base_url, &e.to_string()))?;

        let text = body["choices"][0]["message"]["content"]
            .as_str()
            .ok_or_else(|| malformed(&self.base_url, "no choices[0].message.content"))?
            .to_string();

        Ok(RawCompletion {
            text,
            tokens_in: body["usage"]["prompt_tokens"].as_u64(),
            tokens_out: body["usage"]["completion_tokens"].as_u64(),
        })
    }

    async fn validate_credentials(&self) -> AppResult<bool> {
        let url = format!("{}/models", self.base_url);
        let response = self
            .authorize(self.client.get(&url))
            .send()
            .await
            .map_err(|e| classify_transport(&self.base_url, &e))?;
        Ok(response.status().is_success())
    }
}
