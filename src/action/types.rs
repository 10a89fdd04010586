use std::fmt;

use serde::{Deserialize, Serialize};

/// Upper bound of the normalised coordinate space the model works in.
pub const COORD_SCALE: i32 = 1000;

pub const MIN_WAIT_SECS: u32 = 1;
pub const MAX_WAIT_SECS: u32 = 30;

/// A point in normalised 0–1000 screen space. (0,0) is top-left.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Point {
    pub x: i32,
    pub y: i32,
}

impl Point {
    /// Builds a point, clamping both axes into the normalised range.
    pub fn new(x: i32, y: i32) -> Self {
        Self {
            x: x.clamp(0, COORD_SCALE),
            y: y.clamp(0, COORD_SCALE),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScrollDirection {
    Up,
    Down,
    Left,
    Right,
}

impl ScrollDirection {
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_lowercase().as_str() {
            "up" => Some(Self::Up),
            "down" => Some(Self::Down),
            "left" => Some(Self::Left),
            "right" => Some(Self::Right),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Up => "up",
            Self::Down => "down",
            Self::Left => "left",
            Self::Right => "right",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "by", rename_all = "snake_case")]
pub enum SelectTarget {
    At { point: Point },
    Selector { selector: String },
}

/// Fieldless mirror of [`ParsedAction`], used for dispatch tables and logging.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ActionKind {
    Click,
    RightClick,
    DoubleClick,
    Hover,
    Drag,
    Scroll,
    Type,
    Hotkey,
    Wait,
    PressKey,
    Navigate,
    SelectOption,
    WaitForElement,
    OpenApp,
    FocusApp,
    Finished,
    CallUser,
}

impl ActionKind {
    /// Resolves a lower-cased action name as emitted by the model.
    pub fn from_name(name: &str) -> Option<Self> {
        let kind = match name {
            "click" => Self::Click,
            "rightclick" => Self::RightClick,
            "doubleclick" => Self::DoubleClick,
            "hover" => Self::Hover,
            "drag" => Self::Drag,
            "scroll" => Self::Scroll,
            "type" => Self::Type,
            "hotkey" => Self::Hotkey,
            "wait" => Self::Wait,
            "presskey" => Self::PressKey,
            "navigate" => Self::Navigate,
            "selectoption" => Self::SelectOption,
            "waitforelement" => Self::WaitForElement,
            "openapp" => Self::OpenApp,
            "focusapp" => Self::FocusApp,
            "finished" => Self::Finished,
            "calluser" => Self::CallUser,
            _ => return None,
        };
        Some(kind)
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::Click => "click",
            Self::RightClick => "rightclick",
            Self::DoubleClick => "doubleclick",
            Self::Hover => "hover",
            Self::Drag => "drag",
            Self::Scroll => "scroll",
            Self::Type => "type",
            Self::Hotkey => "hotkey",
            Self::Wait => "wait",
            Self::PressKey => "presskey",
            Self::Navigate => "navigate",
            Self::SelectOption => "selectoption",
            Self::WaitForElement => "waitforelement",
            Self::OpenApp => "openapp",
            Self::FocusApp => "focusapp",
            Self::Finished => "finished",
            Self::CallUser => "calluser",
        }
    }

    /// Click-shaped actions whose coordinates may be refined by element grounding.
    pub fn is_grounding_eligible(&self) -> bool {
        matches!(
            self,
            Self::Click | Self::DoubleClick | Self::RightClick | Self::Hover | Self::Drag
        )
    }
}

/// One model-issued action, fully validated.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "lowercase")]
pub enum ParsedAction {
    Click { at: Option<Point> },
    RightClick { at: Option<Point> },
    DoubleClick { at: Option<Point> },
    Hover { at: Option<Point> },
    Drag { path: Option<(Point, Point)> },
    Scroll {
        at: Option<Point>,
        direction: ScrollDirection,
        distance: Option<i32>,
    },
    Type { content: String },
    Hotkey { keys: Vec<String> },
    Wait { seconds: u32 },
    PressKey { key: String },
    Navigate { url: String },
    SelectOption {
        target: Option<SelectTarget>,
        value: String,
    },
    WaitForElement { description: String },
    OpenApp { app_name: String },
    FocusApp { app_name: String },
    Finished { reason: Option<String> },
    CallUser { reason: Option<String> },
}

impl ParsedAction {
    pub fn kind(&self) -> ActionKind {
        match self {
            Self::Click { .. } => ActionKind::Click,
            Self::RightClick { .. } => ActionKind::RightClick,
            Self::DoubleClick { .. } => ActionKind::DoubleClick,
            Self::Hover { .. } => ActionKind::Hover,
            Self::Drag { .. } => ActionKind::Drag,
            Self::Scroll { .. } => ActionKind::Scroll,
            Self::Type { .. } => ActionKind::Type,
            Self::Hotkey { .. } => ActionKind::Hotkey,
            Self::Wait { .. } => ActionKind::Wait,
            Self::PressKey { .. } => ActionKind::PressKey,
            Self::Navigate { .. } => ActionKind::Navigate,
            Self::SelectOption { .. } => ActionKind::SelectOption,
            Self::WaitForElement { .. } => ActionKind::WaitForElement,
            Self::OpenApp { .. } => ActionKind::OpenApp,
            Self::FocusApp { .. } => ActionKind::FocusApp,
            Self::Finished { .. } => ActionKind::Finished,
            Self::CallUser { .. } => ActionKind::CallUser,
        }
    }

    /// Returns a copy with the grounding-relevant coordinate replaced:
    /// the primary point for click-shaped actions, the start point for drags.
    /// Drags without a parsed path and non-grounding actions are returned unchanged.
    pub fn with_grounded_point(&self, point: Point) -> Self {
        match self {
            Self::Click { .. } => Self::Click { at: Some(point) },
            Self::RightClick { .. } => Self::RightClick { at: Some(point) },
            Self::DoubleClick { .. } => Self::DoubleClick { at: Some(point) },
            Self::Hover { .. } => Self::Hover { at: Some(point) },
            Self::Drag { path: Some((_, end)) } => Self::Drag {
                path: Some((point, *end)),
            },
            other => other.clone(),
        }
    }
}

impl fmt::Display for ParsedAction {
    /// Trace form: `name(arg, arg, ...)`.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let args: Vec<String> = match self {
            Self::Click { at }
            | Self::RightClick { at }
            | Self::DoubleClick { at }
            | Self::Hover { at } => at
                .map(|p| vec![p.x.to_string(), p.y.to_string()])
                .unwrap_or_default(),
            Self::Drag { path } => path
                .map(|(a, b)| {
                    vec![
                        a.x.to_string(),
                        a.y.to_string(),
                        b.x.to_string(),
                        b.y.to_string(),
                    ]
                })
                .unwrap_or_default(),
            Self::Scroll {
                at,
                direction,
                distance,
            } => {
                let mut v = Vec::new();
                if let Some(p) = at {
                    v.push(p.x.to_string());
                    v.push(p.y.to_string());
                }
                v.push(direction.as_str().to_string());
                if let Some(d) = distance {
                    v.push(d.to_string());
                }
                v
            }
            Self::Type { content } => vec![content.clone()],
            Self::Hotkey { keys } => keys.clone(),
            Self::Wait { seconds } => vec![seconds.to_string()],
            Self::PressKey { key } => vec![key.clone()],
            Self::Navigate { url } => vec![url.clone()],
            Self::SelectOption { target, value } => {
                let mut v = match target {
                    Some(SelectTarget::At { point }) => {
                        vec![point.x.to_string(), point.y.to_string()]
                    }
                    Some(SelectTarget::Selector { selector }) => vec![selector.clone()],
                    None => Vec::new(),
                };
                v.push(value.clone());
                v
            }
            Self::WaitForElement { description } => vec![description.clone()],
            Self::OpenApp { app_name } | Self::FocusApp { app_name } => vec![app_name.clone()],
            Self::Finished { reason } | Self::CallUser { reason } => {
                reason.iter().cloned().collect()
            }
        };
        write!(f, "{}({})", self.kind().name(), args.join(", "))
    }
}
