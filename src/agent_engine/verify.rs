//! Before/after state-transition check.
//!
//! Verification is fail-open: a missing verdict, a model error, or a timeout all count
//! as success. Only an explicit `VERDICT: failed` fails the attempt.
use std::sync::OnceLock;
use std::time::Duration;

use regex::Regex;

use crate::llm::provider::generate_with_timeout;
use crate::llm::registry::RoleBinding;
use crate::llm::types::{GenerateRequest, Part};
use crate::perception::compress::compress_screenshot;
use crate::prompts;

const VERIFY_TEMPERATURE: f64 = 0.0;
const VERIFY_MAX_TOKENS: u32 = 128;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verdict {
    Success { description: String },
    Failed { description: String },
}

impl Verdict {
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success { .. })
    }

    pub fn description(&self) -> &str {
        match self {
            Self::Success { description } | Self::Failed { description } => description,
        }
    }
}

fn verdict_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?i)VERDICT:\s*(success|failed)").expect("verdict regex"))
}

/// Reads the first `VERDICT:` in the reply. No verdict means success.
pub fn parse_verdict(text: &str) -> Verdict {
    let description = match text.trim() {
        "" => "No change detected".to_string(),
        t => t.to_string(),
    };
    let failed = verdict_re()
        .captures(&description)
        .map(|caps| caps[1].eq_ignore_ascii_case("failed"));
    match failed {
        Some(true) => Verdict::Failed { description },
        Some(false) => Verdict::Success { description },
        None => {
            tracing::warn!("no VERDICT in state-transition reply; assuming success");
            Verdict::Success { description }
        }
    }
}

/// Asks the verification model whether `action` produced the expected change.
pub async fn verify_action(
    verification: &RoleBinding,
    before: &[u8],
    after: &[u8],
    action: &str,
    expected_outcome: &str,
    max_dim: u32,
    timeout: Duration,
) -> Verdict {
    let (before_img, after_img) = match (
        compress_screenshot(before, max_dim),
        compress_screenshot(after, max_dim),
    ) {
        (Ok(b), Ok(a)) => (b, a),
        (Err(e), _) | (_, Err(e)) => {
            tracing::warn!(error = %e, "verification images unavailable");
            return Verdict::Success {
                description: "Verification unavailable".into(),
            };
        }
    };

    let request = GenerateRequest {
        model: verification.model.clone(),
        system_prompt: None,
        parts: vec![
            Part::text(prompts::state_transition_prompt(action, expected_outcome)),
            Part::text("BEFORE screenshot:"),
            Part::image(before_img.bytes, before_img.mime_type),
            Part::text("AFTER screenshot:"),
            Part::image(after_img.bytes, after_img.mime_type),
        ],
        temperature: VERIFY_TEMPERATURE,
        max_output_tokens: VERIFY_MAX_TOKENS,
        json_response: false,
    };

    match generate_with_timeout(verification.client.as_ref(), request, timeout).await {
        Ok(response) => parse_verdict(&response.text),
        Err(crate::errors::SeeFlowError::Timeout(ms)) => {
            tracing::warn!(timeout_ms = ms, "state-transition verification timed out");
            Verdict::Success {
                description: "Verification timed out".into(),
            }
        }
        Err(e) => {
            tracing::warn!(error = %e, "state-transition verification failed");
            Verdict::Success {
                description: "Verification unavailable".into(),
            }
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

    #[test]
    fn explicit_failed_verdict_fails() {
        let v = parse_verdict("DESCRIPTION: nothing moved\nVERDICT: failed");
        assert!(!v.is_success());
        assert!(v.description().contains("nothing moved"));
    }

    #[test]
    fn first_verdict_is_used_and_case_is_ignored() {
        assert!(!parse_verdict("VERDICT: failed\nverdict: Success").is_success());
        assert!(parse_verdict("verdict: Success\nVERDICT: FAILED").is_success());
        assert!(!parse_verdict("DESCRIPTION: unchanged\nVerdict: FAILED").is_success());
    }

    #[test]
    fn missing_verdict_is_success() {
        assert!(parse_verdict("The dialog opened.").is_success());
        assert_eq!(parse_verdict("  ").description(), "No change detected");
    }

    struct Failing;

    #[async_trait]
    impl ModelClient for Failing {
        fn name(&self) -> &str {
            "failing"
        }

        async fn generate_content(&self, _request: GenerateRequest) -> SeeFlowResult<GenerateResponse> {
            Err(SeeFlowError::ModelProvider("HTTP 503".into()))
        }
    }

    fn png() -> Vec<u8> {
        let img = image::RgbImage::from_pixel(40, 30, image::Rgb([1, 2, 3]));
        let mut out = Vec::new();
        image::DynamicImage::ImageRgb8(img)
            .write_to(&mut std::io::Cursor::new(&mut out), image::ImageFormat::Png)
            .expect("encode");
        out
    }

    #[tokio::test]
    async fn model_error_fails_open() {
        let binding = RoleBinding::new(Arc::new(Failing), "m");
        let shot = png();
        let v = verify_action(&binding, &shot, &shot, "click(1, 2)", "", 768, Duration::from_secs(1)).await;
        assert!(v.is_success());
        assert_eq!(v.description(), "Verification unavailable");
    }
}
