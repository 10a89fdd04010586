use async_trait::async_trait;
use futures_util::StreamExt;

use crate::errors::{SeeFlowError, SeeFlowResult};
use crate::llm::provider::ModelClient;
use crate::llm::sse_parser::StreamCollector;
use crate::llm::types::{ChatMessage, GenerateRequest, GenerateResponse};

pub struct OpenAiCompatibleClient {
    id: String,
    api_base: String,
    api_key: String,
    stream: bool,
    client: reqwest::Client,
}

impl OpenAiCompatibleClient {
    pub fn new(id: String, api_base: String, api_key: String, stream: bool) -> Self {
        Self {
            id,
            api_base,
            api_key,
            stream,
            client: reqwest::Client::new(),
        }
    }

    fn build_body(&self, request: &GenerateRequest) -> serde_json::Value {
        let mut messages = Vec::with_capacity(2);
        if let Some(system) = request.system_prompt.as_deref().filter(|s| !s.is_empty()) {
            messages.push(ChatMessage::system(system));
        }
        messages.push(ChatMessage::user(&request.parts));

        let mut body = serde_json::json!({
            "model": request.model,
            "messages": messages,
            "stream": self.stream,
            "temperature": request.temperature,
            "max_tokens": request.max_output_tokens,
        });
        if request.json_response {
            body["response_format"] = serde_json::json!({ "type": "json_object" });
        }
        body
    }
}

#[async_trait]
impl ModelClient for OpenAiCompatibleClient {
    fn name(&self) -> &str {
        &self.id
    }

    async fn generate_content(&self, request: GenerateRequest) -> SeeFlowResult<GenerateResponse> {
        let body = self.build_body(&request);

        tracing::debug!(
            provider = %self.id,
            model = %request.model,
            stream = self.stream,
            images = request.image_count(),
            "sending model request"
        );
        tracing::debug!(
            body = %sanitized_for_log(&body),
            "request body (sanitized, base64 omitted)"
        );

        let response = self
            .client
            .post(&self.api_base)
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status();
            let err_body = response.text().await.unwrap_or_default();
            return Err(SeeFlowError::ModelProvider(format!("{}: {}", status, err_body)));
        }

        let text = if self.stream {
            self.handle_stream(response).await?
        } else {
            self.handle_json(response).await?
        };
        Ok(GenerateResponse { text })
    }
}

impl OpenAiCompatibleClient {
    /// Accumulates SSE content deltas until `[DONE]` or end of stream.
    async fn handle_stream(&self, response: reqwest::Response) -> SeeFlowResult<String> {
        let mut byte_stream = response.bytes_stream();
        let mut collector = StreamCollector::new();

        while let Some(result) = byte_stream.next().await {
            let bytes = result?;
            if collector.push(&bytes)? {
                break;
            }
        }
        let reasoning_len = collector.reasoning_len();
        let content = collector.finish()?;

        tracing::info!(
            provider = %self.id,
            content_len = content.len(),
            reasoning_len,
            "model stream complete"
        );
        Ok(content)
    }

    async fn handle_json(&self, response: reqwest::Response) -> SeeFlowResult<String> {
        let json: serde_json::Value = response.json().await?;

        if let Some(message) = json["error"]["message"].as_str() {
            return Err(SeeFlowError::ModelProvider(message.to_string()));
        }

        let content = &json["choices"][0]["message"]["content"];
        // Some gateways return content as an array of text parts.
        let text = match content {
            serde_json::Value::String(s) => s.clone(),
            serde_json::Value::Array(parts) => parts
                .iter()
                .filter_map(|p| p["text"].as_str())
                .collect::<Vec<_>>()
                .join(""),
            _ => String::new(),
        };

        tracing::info!(
            provider = %self.id,
            content_len = text.len(),
            "model JSON response received"
        );
        Ok(text)
    }
}

/// Clone of the request body with image payloads replaced, for logging only.
fn sanitized_for_log(body: &serde_json::Value) -> String {
    let mut log_body = body.clone();
    if let Some(msgs) = log_body.get_mut("messages").and_then(|m| m.as_array_mut()) {
        for msg in msgs {
            let Some(parts) = msg.get_mut("content").and_then(|c| c.as_array_mut()) else {
                continue;
            };
            for part in parts {
                if part.get("type").and_then(|t| t.as_str()) == Some("image_url") {
                    if let Some(url) = part.get_mut("image_url").and_then(|u| u.get_mut("url")) {
                        *url = serde_json::Value::String("<omitted_base64_image>".to_string());
                    }
                }
            }
        }
    }
    serde_json::to_string(&log_body).unwrap_or_default()
}
