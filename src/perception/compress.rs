//! Screenshot compression for model payloads.
//!
//! Every screenshot that goes to a model passes through here: RGB convert,
//! aspect-preserving downscale to `max_dim`, JPEG encode.
use image::codecs::jpeg::JpegEncoder;
use image::imageops::FilterType;
use image::{DynamicImage, GenericImageView, ImageFormat};

use crate::errors::{SeeFlowError, SeeFlowResult};

pub const DEFAULT_MAX_DIM: u32 = 1280;
pub const VERIFY_MAX_DIM: u32 = 768;
pub const JPEG_QUALITY: u8 = 85;
/// Smallest side accepted for a decodable image.
pub const MIN_SIDE_PX: u32 = 10;
/// Upper bound for raw bytes passed through when re-encoding is impossible.
pub const MAX_FALLBACK_BYTES: usize = 4 * 1024 * 1024;

/// Encoded image bytes plus the MIME type that describes them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompressedImage {
    pub bytes: Vec<u8>,
    pub mime_type: String,
}

/// Compresses a screenshot to JPEG, longest side at most `max_dim`.
///
/// Falls back to the original bytes (with their sniffed MIME type) when decoding or
/// encoding fails, so the caller never silently sends an empty image.
pub fn compress_screenshot(data: &[u8], max_dim: u32) -> SeeFlowResult<CompressedImage> {
    if data.is_empty() {
        return Err(SeeFlowError::Image("screenshot is empty".into()));
    }

    match image::load_from_memory(data) {
        Ok(img) => {
            let (w, h) = img.dimensions();
            if w < MIN_SIDE_PX || h < MIN_SIDE_PX {
                return Err(SeeFlowError::Image(format!(
                    "screenshot too small ({w}x{h}); likely a blank capture"
                )));
            }
            match encode_jpeg(img, max_dim) {
                Ok(bytes) => Ok(CompressedImage {
                    bytes,
                    mime_type: "image/jpeg".into(),
                }),
                Err(e) => {
                    tracing::warn!(error = %e, "JPEG encode failed; sending original bytes");
                    passthrough(data)
                }
            }
        }
        Err(e) => {
            tracing::warn!(error = %e, len = data.len(), "screenshot decode failed; sending original bytes");
            passthrough(data)
        }
    }
}

fn encode_jpeg(img: DynamicImage, max_dim: u32) -> SeeFlowResult<Vec<u8>> {
    let rgb = DynamicImage::ImageRgb8(img.to_rgb8());
    let (w, h) = rgb.dimensions();
    let rgb = if max_dim > 0 && (w > max_dim || h > max_dim) {
        let scale = (max_dim as f64 / w as f64).min(max_dim as f64 / h as f64);
        let new_w = ((w as f64 * scale) as u32).max(1);
        let new_h = ((h as f64 * scale) as u32).max(1);
        rgb.resize_exact(new_w, new_h, FilterType::Lanczos3)
    } else {
        rgb
    };

    let mut out = Vec::new();
    let encoder = JpegEncoder::new_with_quality(&mut out, JPEG_QUALITY);
    rgb.write_with_encoder(encoder)
        .map_err(|e| SeeFlowError::Image(format!("jpeg encode: {e}")))?;
    Ok(out)
}

fn passthrough(data: &[u8]) -> SeeFlowResult<CompressedImage> {
    if data.len() > MAX_FALLBACK_BYTES {
        return Err(SeeFlowError::Image(format!(
            "screenshot could not be compressed and is too large to send raw ({} bytes)",
            data.len()
        )));
    }
    Ok(CompressedImage {
        bytes: data.to_vec(),
        mime_type: sniff_mime(data).to_string(),
    })
}

/// MIME type from magic bytes; unknown formats are labelled `application/octet-stream`.
pub fn sniff_mime(data: &[u8]) -> &'static str {
    match image::guess_format(data) {
        Ok(ImageFormat::Png) => "image/png",
        Ok(ImageFormat::Jpeg) => "image/jpeg",
        Ok(ImageFormat::WebP) => "image/webp",
        Ok(ImageFormat::Gif) => "image/gif",
        Ok(ImageFormat::Bmp) => "image/bmp",
        _ => "application/octet-stream",
    }
}
