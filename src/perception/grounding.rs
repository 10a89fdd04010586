use std::sync::OnceLock;
use std::time::Duration;

use regex::Regex;

use crate::llm::provider::generate_with_timeout;
use crate::llm::registry::RoleBinding;
use crate::llm::types::{GenerateRequest, Part};
use crate::perception::compress::{sniff_mime, CompressedImage};
use crate::perception::focus_crop::{self, DEFAULT_PAD_FRACTION};
use crate::perception::types::{Confidence, ElementLocation};
use crate::prompts;

const GROUNDING_MAX_TOKENS: u32 = 128;
/// Minimum side of the upscaled zoom crop.
const ZOOM_MIN_SIZE: u32 = 768;
/// Half-size of the box synthesised when the model omits `box_2d`.
const DEFAULT_BOX_HALF: i32 = 50;

/// Locates a described element. `None` on any failure, timeout, or malformed reply.
pub async fn ground_element(
    perception: &RoleBinding,
    image: &CompressedImage,
    description: &str,
    timeout: Duration,
) -> Option<ElementLocation> {
    if image.bytes.is_empty() || description.trim().is_empty() {
        return None;
    }

    let request = GenerateRequest {
        model: perception.model.clone(),
        system_prompt: None,
        parts: vec![
            Part::text(prompts::grounding_prompt(description)),
            Part::image(image.bytes.clone(), image.mime_type.clone()),
        ],
        temperature: perception.temperature,
        max_output_tokens: GROUNDING_MAX_TOKENS,
        json_response: true,
    };

    let short: String = description.chars().take(60).collect();
    match generate_with_timeout(perception.client.as_ref(), request, timeout).await {
        Ok(response) => {
            let location = parse_location(&response.text);
            if location.is_none() {
                tracing::warn!(target_desc = %short, "grounding reply was not a usable location");
            }
            location
        }
        Err(e) => {
            tracing::warn!(target_desc = %short, error = %e, "ground_element failed");
            None
        }
    }
}

/// Re-grounds inside a padded crop of `location.box_2d` and maps the result back to the
/// full image. `None` when cropping or the second grounding fails.
pub async fn zoom_and_reground(
    perception: &RoleBinding,
    screenshot: &[u8],
    location: &ElementLocation,
    description: &str,
    timeout: Duration,
) -> Option<ElementLocation> {
    let crop = match focus_crop::crop_region(
        screenshot,
        location.box_2d,
        DEFAULT_PAD_FRACTION,
        ZOOM_MIN_SIZE,
    ) {
        Ok(crop) => crop,
        Err(e) => {
            tracing::warn!(error = %e, "zoom crop failed");
            return None;
        }
    };

    let crop_image = CompressedImage {
        mime_type: sniff_mime(&crop.image_bytes).to_string(),
        bytes: crop.image_bytes.clone(),
    };
    let sub = ground_element(perception, &crop_image, description, timeout).await?;
    let full = crop.map_back(&sub);
    tracing::debug!(
        before_x = location.center_x,
        before_y = location.center_y,
        after_x = full.center_x,
        after_y = full.center_y,
        confidence = ?full.confidence,
        "zoom re-grounding refined location"
    );
    Some(full)
}

fn fence_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?s)```(?:json)?\s*(.*?)\s*```").expect("fence regex"))
}

/// Parses the grounding reply. Tolerates code fences, surrounding prose, a one-element
/// array, floats and numeric strings. Coordinates are clamped to 0–1000.
pub fn parse_location(text: &str) -> Option<ElementLocation> {
    let trimmed = text.trim();
    let body = fence_re()
        .captures(trimmed)
        .and_then(|c| c.get(1))
        .map(|m| m.as_str())
        .unwrap_or(trimmed);

    let value: serde_json::Value = serde_json::from_str(body).ok().or_else(|| {
        let start = body.find('{')?;
        let end = body.rfind('}')?;
        (end > start)
            .then(|| serde_json::from_str(&body[start..=end]).ok())
            .flatten()
    })?;
    let obj = match &value {
        serde_json::Value::Array(items) => items.first()?,
        other => other,
    };

    let center_x = number(&obj["center_x"])?;
    let center_y = number(&obj["center_y"])?;
    let box_2d = obj["box_2d"]
        .as_array()
        .filter(|b| b.len() == 4)
        .and_then(|b| {
            let v: Option<Vec<i32>> = b.iter().map(number).collect();
            v.map(|v| [v[0], v[1], v[2], v[3]])
        })
        .unwrap_or([
            center_y - DEFAULT_BOX_HALF,
            center_x - DEFAULT_BOX_HALF,
            center_y + DEFAULT_BOX_HALF,
            center_x + DEFAULT_BOX_HALF,
        ]);

    Some(
        ElementLocation {
            center_x,
            center_y,
            box_2d,
            label: obj["label"].as_str().unwrap_or_default().to_string(),
            confidence: obj["confidence"]
                .as_str()
                .map(Confidence::parse)
                .unwrap_or(Confidence::Low),
        }
        .normalised(),
    )
}

fn number(value: &serde_json::Value) -> Option<i32> {
    let n = match value {
        serde_json::Value::Number(n) => n.as_f64(),
        serde_json::Value::String(s) => s.trim().parse::<f64>().ok(),
        _ => None,
    }?;
    n.is_finite().then(|| n.round() as i32)
}
