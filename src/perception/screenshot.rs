use async_trait::async_trait;
use image::{DynamicImage, RgbaImage};

use crate::errors::{SeeFlowError, SeeFlowResult};
use crate::perception::types::ScreenshotMeta;

/// Frames whose pixels never exceed this channel spread are treated as blank.
const BLANK_SPREAD: u8 = 2;

pub struct ScreenshotResult {
    /// PNG-encoded frame at physical resolution.
    pub image_bytes: Vec<u8>,
    pub meta: ScreenshotMeta,
}

/// A screen that can be captured. Implementations return an error for blank frames
/// so the caller can retry.
#[async_trait]
pub trait ScreenSource: Send + Sync {
    async fn capture(&self, monitor_index: Option<usize>) -> SeeFlowResult<ScreenshotResult>;
}

/// `xcap`-backed capture of a physical monitor.
#[derive(Debug, Default, Clone)]
pub struct XcapScreen;

#[async_trait]
impl ScreenSource for XcapScreen {
    async fn capture(&self, monitor_index: Option<usize>) -> SeeFlowResult<ScreenshotResult> {
        tokio::task::spawn_blocking(move || capture_blocking(monitor_index))
            .await
            .map_err(|e| SeeFlowError::Capture(format!("capture task failed: {e}")))?
    }
}

fn capture_blocking(monitor_index: Option<usize>) -> SeeFlowResult<ScreenshotResult> {
    let monitors = xcap::Monitor::all()
        .map_err(|e| SeeFlowError::Capture(format!("enumerate monitors: {e}")))?;
    let count = monitors.len();

    let monitor = match monitor_index {
        Some(i) => monitors.into_iter().nth(i),
        None => {
            let primary = monitors.iter().position(|m| m.is_primary()).unwrap_or(0);
            monitors.into_iter().nth(primary)
        }
    }
    .ok_or_else(|| {
        SeeFlowError::Capture(format!(
            "monitor {monitor_index:?} not found ({count} available)"
        ))
    })?;

    let frame = monitor
        .capture_image()
        .map_err(|e| SeeFlowError::Capture(format!("capture_image: {e}")))?;

    if is_blank(&frame) {
        return Err(SeeFlowError::Capture(format!(
            "blank {}x{} frame",
            frame.width(),
            frame.height()
        )));
    }

    let scale_factor = monitor.scale_factor() as f64;
    let (physical_width, physical_height) = (frame.width(), frame.height());
    let meta = ScreenshotMeta {
        monitor_index: monitor_index.unwrap_or(0) as u32,
        scale_factor,
        physical_width,
        physical_height,
        logical_width: (physical_width as f64 / scale_factor).round() as u32,
        logical_height: (physical_height as f64 / scale_factor).round() as u32,
        origin_x: monitor.x(),
        origin_y: monitor.y(),
    };

    let mut png = Vec::new();
    DynamicImage::ImageRgba8(frame)
        .write_to(&mut std::io::Cursor::new(&mut png), image::ImageFormat::Png)
        .map_err(|e| SeeFlowError::Image(format!("screenshot PNG encode: {e}")))?;

    tracing::debug!(
        width = physical_width,
        height = physical_height,
        scale = scale_factor,
        bytes = png.len(),
        "screen captured"
    );
    Ok(ScreenshotResult {
        image_bytes: png,
        meta,
    })
}

/// A frame is blank when it is empty or every sampled pixel has (almost) the same colour.
/// Screen-recording permission denials typically produce all-black frames.
pub fn is_blank(frame: &RgbaImage) -> bool {
    if frame.width() == 0 || frame.height() == 0 {
        return true;
    }
    let first = frame.get_pixel(0, 0).0;
    let step = ((frame.width() * frame.height()) as usize / 4096).max(1);
    frame.pixels().step_by(step).all(|p| {
        p.0.iter()
            .zip(first.iter())
            .take(3)
            .all(|(a, b)| a.abs_diff(*b) <= BLANK_SPREAD)
    })
}

/// Actionable message attached to the final capture failure.
pub fn permission_guidance() -> &'static str {
    if cfg!(target_os = "macos") {
        "Screen capture returned no usable frame. Grant Screen Recording permission to this \
         terminal or binary in System Settings > Privacy & Security > Screen Recording, then restart it."
    } else if cfg!(target_os = "windows") {
        "Screen capture returned no usable frame. Make sure the session is unlocked and not \
         running on a disconnected remote desktop."
    } else {
        "Screen capture returned no usable frame. Make sure a display server is running \
         (X11, or Wayland with the screencast portal) and that this process may capture it."
    }
}
