use std::time::Duration;

use crate::llm::provider::generate_with_timeout;
use crate::llm::registry::RoleBinding;
use crate::llm::types::{GenerateRequest, Part};
use crate::perception::compress::CompressedImage;
use crate::prompts;

const SCENE_MAX_TOKENS: u32 = 384;

/// Dense caption of the whole screen, used once at the start of each step.
///
/// Never fails: any error or timeout yields an empty string and the step proceeds
/// without the overview.
pub async fn perceive_scene(
    perception: &RoleBinding,
    image: &CompressedImage,
    timeout: Duration,
) -> String {
    if image.bytes.is_empty() {
        return String::new();
    }

    let request = GenerateRequest {
        model: perception.model.clone(),
        system_prompt: None,
        parts: vec![
            Part::text(prompts::scene_caption_prompt()),
            Part::image(image.bytes.clone(), image.mime_type.clone()),
        ],
        temperature: perception.temperature,
        max_output_tokens: SCENE_MAX_TOKENS,
        json_response: false,
    };

    match generate_with_timeout(perception.client.as_ref(), request, timeout).await {
        Ok(response) => {
            let caption = response.text.trim().to_string();
            tracing::debug!(len = caption.len(), "scene caption received");
            caption
        }
        Err(e) => {
            tracing::warn!(error = %e, "perceive_scene failed");
            String::new()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::{SeeFlowError, SeeFlowResult};
    use crate::llm::provider::ModelClient;
    use crate::llm::types::GenerateResponse;
    use async_trait::async_trait;
    use std::sync::Arc;

    struct Fixed(SeeFlowResult<String>);

    #[async_trait]
    impl ModelClient for Fixed {
        fn name(&self) -> &str {
            "fixed"
        }

        async fn generate_content(&self, request: GenerateRequest) -> SeeFlowResult<GenerateResponse> {
            assert_eq!(request.image_count(), 1);
            match &self.0 {
                Ok(text) => Ok(GenerateResponse { text: text.clone() }),
                Err(_) => Err(SeeFlowError::ModelProvider("boom".into())),
            }
        }
    }

    struct Slow;

    #[async_trait]
    impl ModelClient for Slow {
        fn name(&self) -> &str {
            "slow"
        }

        async fn generate_content(&self, _request: GenerateRequest) -> SeeFlowResult<GenerateResponse> {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok(GenerateResponse { text: "late".into() })
        }
    }

    fn image() -> CompressedImage {
        CompressedImage {
            bytes: vec![1, 2, 3],
            mime_type: "image/jpeg".into(),
        }
    }

    #[tokio::test]
    async fn returns_trimmed_caption() {
        let binding = RoleBinding::new(Arc::new(Fixed(Ok("  a login form  ".into()))), "m");
        assert_eq!(
            perceive_scene(&binding, &image(), Duration::from_secs(1)).await,
            "a login form"
        );
    }

    #[tokio::test]
    async fn errors_and_timeouts_yield_empty() {
        let binding = RoleBinding::new(Arc::new(Fixed(Err(SeeFlowError::Cancelled))), "m");
        assert_eq!(perceive_scene(&binding, &image(), Duration::from_secs(1)).await, "");

        let binding = RoleBinding::new(Arc::new(Slow), "m");
        assert_eq!(perceive_scene(&binding, &image(), Duration::from_millis(20)).await, "");
    }
}
