// DPI-aware coordinate mapping from the model's normalised space to input space.
use serde::{Deserialize, Serialize};

use crate::action::types::{Point, COORD_SCALE};
use crate::perception::types::ScreenshotMeta;

/// Geometry of the surface input events are sent to. Threaded explicitly through
/// every executor; there is no process-wide screen state.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct DeviceContext {
    /// Width of the input coordinate space.
    pub width: u32,
    pub height: u32,
    /// Physical pixels per input unit.
    pub scale: f64,
    /// Top-left of the target monitor in the virtual desktop.
    pub origin_x: i32,
    pub origin_y: i32,
}

impl DeviceContext {
    pub fn new(width: u32, height: u32) -> Self {
        Self {
            width,
            height,
            scale: 1.0,
            origin_x: 0,
            origin_y: 0,
        }
    }

    /// macOS input works in logical points; other platforms take physical pixels.
    pub fn from_meta(meta: &ScreenshotMeta) -> Self {
        let (width, height) = if cfg!(target_os = "macos") {
            (meta.logical_width, meta.logical_height)
        } else {
            (meta.physical_width, meta.physical_height)
        };
        Self {
            width,
            height,
            scale: meta.scale_factor,
            origin_x: meta.origin_x,
            origin_y: meta.origin_y,
        }
    }

    /// Converts a normalised 0–1000 point to absolute input coordinates.
    /// Handles multi-monitor offsets.
    pub fn to_physical(&self, point: Point) -> (i32, i32) {
        let scale = COORD_SCALE as f64;
        let x = (point.x as f64 / scale * self.width as f64).round() as i32;
        let y = (point.y as f64 / scale * self.height as f64).round() as i32;
        // 1000 maps to the last addressable pixel, not one past it.
        (
            self.origin_x + x.min(self.width.saturating_sub(1) as i32),
            self.origin_y + y.min(self.height.saturating_sub(1) as i32),
        )
    }

    /// Same as [`to_physical`](Self::to_physical) for raw step coordinates, clamped first.
    pub fn step_to_physical(&self, x: i32, y: i32) -> (i32, i32) {
        self.to_physical(Point::new(x, y))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn maps_normalised_to_pixels() {
        let ctx = DeviceContext::new(1920, 1080);
        assert_eq!(ctx.to_physical(Point::new(500, 500)), (960, 540));
        assert_eq!(ctx.to_physical(Point::new(0, 0)), (0, 0));
        assert_eq!(ctx.to_physical(Point::new(1000, 1000)), (1919, 1079));
    }

    #[test]
    fn applies_monitor_origin() {
        let ctx = DeviceContext {
            origin_x: 1920,
            origin_y: -200,
            ..DeviceContext::new(1000, 1000)
        };
        assert_eq!(ctx.step_to_physical(100, 100), (2020, -100));
        assert_eq!(ctx.step_to_physical(5000, -1), (2919, -200));
    }
}
