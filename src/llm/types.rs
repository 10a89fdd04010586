use serde::{Deserialize, Serialize};

/// One piece of a multimodal user turn.
#[derive(Debug, Clone, PartialEq)]
pub enum Part {
    Text(String),
    Image { data: Vec<u8>, mime_type: String },
}

impl Part {
    pub fn text(text: impl Into<String>) -> Self {
        Self::Text(text.into())
    }

    pub fn image(data: Vec<u8>, mime_type: impl Into<String>) -> Self {
        Self::Image {
            data,
            mime_type: mime_type.into(),
        }
    }
}

/// Provider-neutral request for a single model completion.
#[derive(Debug, Clone)]
pub struct GenerateRequest {
    pub model: String,
    pub system_prompt: Option<String>,
    pub parts: Vec<Part>,
    pub temperature: f64,
    pub max_output_tokens: u32,
    /// Ask the provider for a JSON object response.
    pub json_response: bool,
}

impl GenerateRequest {
    pub fn image_count(&self) -> usize {
        self.parts
            .iter()
            .filter(|p| matches!(p, Part::Image { .. }))
            .count()
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct GenerateResponse {
    pub text: String,
}

// OpenAI-compatible wire format.

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: String,
    pub content: MessageContent,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MessageContent {
    Text(String),
    Parts(Vec<ContentPart>),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentPart {
    Text { text: String },
    ImageUrl { image_url: ImageUrl },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImageUrl {
    pub url: String,
}

impl ChatMessage {
    pub fn system(text: impl Into<String>) -> Self {
        Self {
            role: "system".into(),
            content: MessageContent::Text(text.into()),
        }
    }

    /// Builds a user turn; images become base64 data URLs.
    pub fn user(parts: &[Part]) -> Self {
        let content = parts
            .iter()
            .map(|part| match part {
                Part::Text(text) => ContentPart::Text { text: text.clone() },
                Part::Image { data, mime_type } => ContentPart::ImageUrl {
                    image_url: ImageUrl {
                        url: format!(
                            "data:{mime_type};base64,{}",
                            base64::Engine::encode(
                                &base64::engine::general_purpose::STANDARD,
                                data
                            )
                        ),
                    },
                },
            })
            .collect();
        Self {
            role: "user".into(),
            content: MessageContent::Parts(content),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamChunk {
    pub kind: StreamChunkKind,
    pub content: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum StreamChunkKind {
    Reasoning,
    Content,
    Done,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn user_message_encodes_images_as_data_urls() {
        let msg = ChatMessage::user(&[Part::text("look"), Part::image(vec![1, 2, 3], "image/jpeg")]);
        let json = serde_json::to_value(&msg).expect("serialize");
        assert_eq!(json["role"], "user");
        assert_eq!(json["content"][0]["type"], "text");
        assert_eq!(json["content"][1]["type"], "image_url");
        assert_eq!(json["content"][1]["image_url"]["url"], "data:image/jpeg;base64,AQID");
    }
}
