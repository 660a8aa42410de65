//! Anthropic Messages API adapter
//!
//! Speaks `POST /v1/messages` with `x-api-key` authentication. Images go in
//! as base64 content blocks; usage comes back as input/output token counts.

use super::{fail_from_response, malformed, Backend, GenerateRequest, RawCompletion};
use crate::error::{classify_transport, AppResult};
use async_trait::async_trait;
use serde::Serialize;

const ANTHROPIC_VERSION: &str = "2023-06-01";

#[derive(Debug, Serialize)]
struct MessagesRequest {
    model: String,
    max_tokens: u32,
    temperature: f32,
    #[serde(skip_serializing_if = "Option::is_none")]
    system: Option<String>,
    messages: Vec<Message>,
}

#[derive(Debug, Serialize)]
struct Message {
    role: String,
    content: Content,
}

#[derive(Debug, Serialize)]
#[serde(untagged)]
enum Content {
    Text(String),
    Blocks(Vec<ContentBlock>),
}

#[derive(Debug, Serialize)]
#[serde(tag = "type")]
enum ContentBlock {
    #[serde(rename = "text")]
    Text { text: String },
    #[serde(rename = "image")]
    Image { source: ImageSource },
}

#[derive(Debug, Serialize)]
struct ImageSource {
    #[serde(rename = "type")]
    source_type: String,
    media_type: String,
    data: String,
}

pub struct AnthropicBackend {
    client: reqwest::Client,
    base_url: String,
    model: String,
    api_key: String,
}

impl AnthropicBackend {
    pub fn new(client: reqwest::Client, base_url: String, model: String, api_key: String) -> Self {
        Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            model,
            api_key,
        }
    }

    fn build_messages(&self, request: &GenerateRequest) -> Vec<Message> {
        let mut messages = Vec::new();
        for prior in &request.history {
            // The Messages API only accepts user/assistant turns; system
            // context travels in the top-level field.
            if prior.role == "user" || prior.role == "assistant" {
                messages.push(Message {
                    role: prior.role.clone(),
                    content: Content::Text(prior.content.clone()),
                });
            }
        }

        let content = match &request.image {
            Some(image) => Content::Blocks(vec![
                ContentBlock::Image {
                    source: ImageSource {
                        source_type: "base64".to_string(),
                        media_type: image.media_type.clone(),
                        data: image.data.clone(),
                    },
                },
                ContentBlock::Text {
                    text: request.prompt.clone(),
                },
            ]),
            None => Content::Text(request.prompt.clone()),
        };
        messages.push(Message {
            role: "user".to_string(),
            content,
        });
        messages
    }
}

#[async_trait]
impl Backend for AnthropicBackend {
    async fn generate(&self, request: &GenerateRequest) -> AppResult<RawCompletion> {
        let url = format!("{}/v1/messages", self.base_url);
        let body = MessagesRequest {
            model: self.model.clone(),
            max_tokens: request.max_tokens,
            temperature: request.temperature,
            system: request.system.clone(),
            messages: self.build_messages(request),
        };

        let response = self
            .client
            .post(&url)
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", ANTHROPIC_VERSION)
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

        // Concatenate the text blocks; tool-use and thinking blocks are not
        // part of the returned payload.
        let text = body["content"]
            .as_array()
            .map(|blocks| {
                blocks
                    .iter()
                    .filter_map(|b| {
                        (b["type"] == "text").then(|| b["text"].as_str().unwrap_or_default())
                    })
                    .collect::<Vec<_>>()
                    .join("")
            })
            .unwrap_or_default();
        if text.is_empty() {
            return Err(malformed(&self.base_url, "no text content blocks"));
        }

        Ok(RawCompletion {
            text,
            tokens_in: body["usage"]["input_tokens"].as_u64(),
            tokens_out: body["usage"]["output_tokens"].as_u64(),
        })
    }

    async fn validate_credentials(&self) -> AppResult<bool> {
        let url = format!("{}/v1/models", self.base_url);
        let response = self
            .client
            .get(&url)
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", ANTHROPIC_VERSION)
            .send()
            .await
            .map_err(|e| classify_transport(&self.base_url, &e))?;
        Ok(response.status().is_success())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backends::ImagePayload;
    use crate::error::ErrorKind;
    use serde_json::json;
    use wiremock::matchers::{body_partial_json, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn backend(server: &MockServer) -> AnthropicBackend {
        AnthropicBackend::new(
            reqwest::Client::new(),
            server.uri(),
            "claude-sonnet-4-5".to_string(),
            "sk-ant-test".to_string(),
        )
    }

    #[tokio::test]
    async fn generate_joins_text_blocks() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/messages"))
            .and(header("x-api-key", "sk-ant-test"))
            .and(header("anthropic-version", ANTHROPIC_VERSION))
            .and(body_partial_json(json!({"model": "claude-sonnet-4-5"})))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "content": [
                    {"type": "text", "text": "part one "},
                    {"type": "text", "text": "part two"}
                ],
                "usage": {"input_tokens": 20, "output_tokens": 9}
            })))
            .mount(&server)
            .await;

        let completion = backend(&server)
            .generate(&GenerateRequest::new("hello"))
            .await
            .expect("generate should succeed");

        assert_eq!(completion.text, "part one part two");
        assert_eq!(completion.tokens_in, Some(20));
        assert_eq!(completion.tokens_out, Some(9));
    }

    #[tokio::test]
    async fn generate_sends_image_blocks() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/messages"))
            .and(body_partial_json(json!({
                "messages": [{
                    "role": "user",
                    "content": [
                        {"type": "image", "source": {"type": "base64", "media_type": "image/jpeg", "data": "QUJD"}},
                        {"type": "text", "text": "describe"}
                    ]
                }]
            })))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "content": [{"type": "text", "text": "a photo"}],
                "usage": {"input_tokens": 100, "output_tokens": 3}
            })))
            .expect(1)
            .mount(&server)
            .await;

        let mut request = GenerateRequest::new("describe");
        request.image = Some(ImagePayload {
            media_type: "image/jpeg".to_string(),
            data: "QUJD".to_string(),
        });

        backend(&server)
            .generate(&request)
            .await
            .expect("generate should succeed");
    }

    #[tokio::test]
    async fn auth_failure_is_terminal() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/messages"))
            .respond_with(ResponseTemplate::new(401).set_body_json(json!({
                "error": {"type": "authentication_error", "message": "invalid x-api-key"}
            })))
            .mount(&server)
            .await;

        let err = backend(&server)
            .generate(&GenerateRequest::new("hi"))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), Some(ErrorKind::Auth));
        assert!(!err.is_retryable());
    }

    #[tokio::test]
    async fn empty_content_is_malformed() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/messages"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "content": [],
                "usage": {"input_tokens": 1, "output_tokens": 0}
            })))
            .mount(&server)
            .await;

        let err = backend(&server)
            .generate(&GenerateRequest::new("hi"))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), Some(ErrorKind::MalformedResponse));
    }
}
