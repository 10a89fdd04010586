use serde::{Deserialize, Serialize};

use crate::action::types::{Point, COORD_SCALE};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Confidence {
    High,
    Medium,
    Low,
}

impl Confidence {
    /// Lenient parse of the model's confidence label; anything unrecognised is `Low`.
    pub fn parse(s: &str) -> Self {
        match s.trim().to_lowercase().as_str() {
            "high" => Self::High,
            "medium" => Self::Medium,
            _ => Self::Low,
        }
    }

    /// Only high and medium confidence may replace model-predicted coordinates.
    pub fn can_override(&self) -> bool {
        matches!(self, Self::High | Self::Medium)
    }
}

/// A grounded UI element in normalised 0–1000 space.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ElementLocation {
    pub center_x: i32,
    pub center_y: i32,
    /// `[y_min, x_min, y_max, x_max]`
    pub box_2d: [i32; 4],
    pub label: String,
    pub confidence: Confidence,
}

impl ElementLocation {
    pub fn center(&self) -> Point {
        Point::new(self.center_x, self.center_y)
    }

    /// Clamps every coordinate into [0, 1000] and orders the box corners.
    pub fn normalised(mut self) -> Self {
        let c = |v: i32| v.clamp(0, COORD_SCALE);
        self.center_x = c(self.center_x);
        self.center_y = c(self.center_y);
        let [y0, x0, y1, x1] = self.box_2d.map(c);
        self.box_2d = [y0.min(y1), x0.min(x1), y0.max(y1), x0.max(x1)];
        self
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScreenshotMeta {
    pub monitor_index: u32,
    pub scale_factor: f64,
    pub physical_width: u32,
    pub physical_height: u32,
    pub logical_width: u32,
    pub logical_height: u32,
    pub origin_x: i32,
    pub origin_y: i32,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn confidence_parse_is_lenient() {
        assert_eq!(Confidence::parse(" HIGH "), Confidence::High);
        assert_eq!(Confidence::parse("medium"), Confidence::Medium);
        assert_eq!(Confidence::parse("sure"), Confidence::Low);
        assert!(!Confidence::Low.can_override());
    }

    #[test]
    fn normalised_clamps_and_orders_box() {
        let loc = ElementLocation {
            center_x: 1500,
            center_y: -3,
            box_2d: [600, 900, 400, 1200],
            label: String::new(),
            confidence: Confidence::High,
        }
        .normalised();
        assert_eq!((loc.center_x, loc.center_y), (1000, 0));
        assert_eq!(loc.box_2d, [400, 900, 600, 1000]);
    }
}
