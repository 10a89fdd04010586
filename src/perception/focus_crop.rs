/// Focus-crop: cut and upscale a region around a grounded element
/// so the perception model can re-examine it at higher resolution.
///
/// Used for the zoom re-grounding pass on medium-confidence locations.
use crate::action::types::COORD_SCALE;
use crate::errors::{SeeFlowError, SeeFlowResult};
use crate::perception::types::ElementLocation;

/// Padding added on every side of the box, as a fraction of the full image.
pub const DEFAULT_PAD_FRACTION: f64 = 0.20;

/// Result of a focus crop operation.
#[derive(Debug, Clone)]
pub struct FocusCrop {
    /// PNG bytes of the cropped (possibly upscaled) region.
    pub image_bytes: Vec<u8>,
    /// The pixel offset of the crop's top-left corner in the original image.
    pub origin_x: u32,
    pub origin_y: u32,
    /// Size of the crop in the original image (before upscaling).
    pub crop_w: u32,
    pub crop_h: u32,
    pub full_w: u32,
    pub full_h: u32,
}

/// Crop the area around `box_2d` (`[y_min, x_min, y_max, x_max]`, 0–1000) from the
/// source image with `pad_fraction` of context on each side, and upscale the crop
/// to at least `min_size`.
pub fn crop_region(
    src_bytes: &[u8],
    box_2d: [i32; 4],
    pad_fraction: f64,
    min_size: u32,
) -> SeeFlowResult<FocusCrop> {
    let img = image::load_from_memory(src_bytes)
        .map_err(|e| SeeFlowError::Perception(format!("crop load: {e}")))?;
    let (w, h) = (img.width(), img.height());

    let scale = COORD_SCALE as f64;
    let [y_min, x_min, y_max, x_max] = box_2d.map(|v| v.clamp(0, COORD_SCALE) as f64 / scale);

    // Padded region, clamped to image bounds
    let cx1 = ((x_min - pad_fraction).max(0.0) * w as f64).round() as u32;
    let cy1 = ((y_min - pad_fraction).max(0.0) * h as f64).round() as u32;
    let cx2 = ((x_max + pad_fraction).min(1.0) * w as f64).round() as u32;
    let cy2 = ((y_max + pad_fraction).min(1.0) * h as f64).round() as u32;
    let cw = cx2.saturating_sub(cx1);
    let ch = cy2.saturating_sub(cy1);

    if cw == 0 || ch == 0 {
        return Err(SeeFlowError::Perception("zero-size crop".into()));
    }

    let cropped = img.crop_imm(cx1, cy1, cw, ch);

    // Upscale if smaller than min_size
    let up = if cw < min_size || ch < min_size {
        let sw = min_size as f32 / cw as f32;
        let sh = min_size as f32 / ch as f32;
        sw.max(sh).max(1.0)
    } else {
        1.0
    };
    let result_img = if up > 1.0 {
        let out_w = (cw as f32 * up).round() as u32;
        let out_h = (ch as f32 * up).round() as u32;
        cropped.resize_exact(out_w, out_h, image::imageops::FilterType::Lanczos3)
    } else {
        cropped
    };

    let mut png_bytes = Vec::new();
    result_img
        .write_to(
            &mut std::io::Cursor::new(&mut png_bytes),
            image::ImageFormat::Png,
        )
        .map_err(|e| SeeFlowError::Perception(format!("crop PNG encode: {e}")))?;

    Ok(FocusCrop {
        image_bytes: png_bytes,
        origin_x: cx1,
        origin_y: cy1,
        crop_w: cw,
        crop_h: ch,
        full_w: w,
        full_h: h,
    })
}

impl FocusCrop {
    /// Maps a single 0–1000 coordinate pair inside the crop back to 0–1000 of the full image.
    fn to_full(&self, x: i32, y: i32) -> (i32, i32) {
        let scale = COORD_SCALE as f64;
        let px = x as f64 / scale * self.crop_w as f64 + self.origin_x as f64;
        let py = y as f64 / scale * self.crop_h as f64 + self.origin_y as f64;
        (
            (px / self.full_w as f64 * scale).round() as i32,
            (py / self.full_h as f64 * scale).round() as i32,
        )
    }

    /// Re-expresses a location grounded inside the crop in full-image coordinates.
    pub fn map_back(&self, sub: &ElementLocation) -> ElementLocation {
        let (cx, cy) = self.to_full(sub.center_x, sub.center_y);
        let [y0, x0, y1, x1] = sub.box_2d;
        let (bx0, by0) = self.to_full(x0, y0);
        let (bx1, by1) = self.to_full(x1, y1);
        ElementLocation {
            center_x: cx,
            center_y: cy,
            box_2d: [by0, bx0, by1, bx1],
            label: sub.label.clone(),
            confidence: sub.confidence,
        }
        .normalised()
    }
}
