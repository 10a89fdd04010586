use serde::{Deserialize, Deserializer, Serialize};

use crate::errors::SeeFlowError;

/// Environment a workflow runs against. Selects the action space shown to the model.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowType {
    #[default]
    Browser,
    Desktop,
}

impl std::str::FromStr for WorkflowType {
    type Err = SeeFlowError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "browser" => Ok(Self::Browser),
            "desktop" => Ok(Self::Desktop),
            other => Err(SeeFlowError::Workflow(format!(
                "unknown workflow type '{other}' (expected browser|desktop)"
            ))),
        }
    }
}

/// A workflow step's intent, keyed by action name. Every field the workflow may omit is
/// optional so the classifier can decide whether the step is fully specified.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action", content = "params", rename_all = "snake_case")]
pub enum StepAction {
    ClickAt {
        #[serde(default, deserialize_with = "lenient_coord")]
        x: Option<i32>,
        #[serde(default, deserialize_with = "lenient_coord")]
        y: Option<i32>,
        #[serde(default)]
        description: Option<String>,
    },
    RightClick {
        #[serde(default, deserialize_with = "lenient_coord")]
        x: Option<i32>,
        #[serde(default, deserialize_with = "lenient_coord")]
        y: Option<i32>,
        #[serde(default)]
        description: Option<String>,
    },
    DoubleClick {
        #[serde(default, deserialize_with = "lenient_coord")]
        x: Option<i32>,
        #[serde(default, deserialize_with = "lenient_coord")]
        y: Option<i32>,
        #[serde(default)]
        description: Option<String>,
    },
    Hover {
        #[serde(default, deserialize_with = "lenient_coord")]
        x: Option<i32>,
        #[serde(default, deserialize_with = "lenient_coord")]
        y: Option<i32>,
        #[serde(default)]
        description: Option<String>,
    },
    Drag {
        #[serde(default, deserialize_with = "lenient_coord")]
        x: Option<i32>,
        #[serde(default, deserialize_with = "lenient_coord")]
        y: Option<i32>,
        #[serde(default, deserialize_with = "lenient_coord")]
        x2: Option<i32>,
        #[serde(default, deserialize_with = "lenient_coord")]
        y2: Option<i32>,
        #[serde(default)]
        description: Option<String>,
    },
    TypeTextAt {
        #[serde(default)]
        text: Option<String>,
        #[serde(default, deserialize_with = "lenient_coord")]
        x: Option<i32>,
        #[serde(default, deserialize_with = "lenient_coord")]
        y: Option<i32>,
        #[serde(default)]
        description: Option<String>,
    },
    Scroll {
        #[serde(default)]
        direction: Option<String>,
        #[serde(default, alias = "amount", deserialize_with = "lenient_coord")]
        distance: Option<i32>,
        #[serde(default, deserialize_with = "lenient_coord")]
        x: Option<i32>,
        #[serde(default, deserialize_with = "lenient_coord")]
        y: Option<i32>,
    },
    Wait {
        #[serde(default, deserialize_with = "lenient_seconds")]
        seconds: Option<f64>,
    },
    WaitForElement {
        #[serde(default)]
        description: Option<String>,
    },
    PressKey {
        #[serde(default)]
        key: Option<String>,
    },
    Hotkey {
        #[serde(default, deserialize_with = "lenient_keys")]
        keys: Vec<String>,
        #[serde(default)]
        description: Option<String>,
    },
    Navigate {
        #[serde(default)]
        url: Option<String>,
    },
    SelectOption {
        #[serde(default)]
        value: Option<String>,
        #[serde(default)]
        description: Option<String>,
        #[serde(default, deserialize_with = "lenient_coord")]
        x: Option<i32>,
        #[serde(default, deserialize_with = "lenient_coord")]
        y: Option<i32>,
    },
    OpenApp {
        #[serde(default, alias = "appName")]
        app_name: Option<String>,
    },
    FocusApp {
        #[serde(default, alias = "appName")]
        app_name: Option<String>,
    },
    /// Any action name outside the known set; only the model can act on it.
    #[serde(skip)]
    Other {
        name: String,
        params: serde_json::Value,
    },
}

const KNOWN_ACTIONS: [&str; 15] = [
    "click_at",
    "right_click",
    "double_click",
    "hover",
    "drag",
    "type_text_at",
    "scroll",
    "wait",
    "wait_for_element",
    "press_key",
    "hotkey",
    "navigate",
    "select_option",
    "open_app",
    "focus_app",
];

impl StepAction {
    pub fn name(&self) -> &str {
        match self {
            Self::ClickAt { .. } => "click_at",
            Self::RightClick { .. } => "right_click",
            Self::DoubleClick { .. } => "double_click",
            Self::Hover { .. } => "hover",
            Self::Drag { .. } => "drag",
            Self::TypeTextAt { .. } => "type_text_at",
            Self::Scroll { .. } => "scroll",
            Self::Wait { .. } => "wait",
            Self::WaitForElement { .. } => "wait_for_element",
            Self::PressKey { .. } => "press_key",
            Self::Hotkey { .. } => "hotkey",
            Self::Navigate { .. } => "navigate",
            Self::SelectOption { .. } => "select_option",
            Self::OpenApp { .. } => "open_app",
            Self::FocusApp { .. } => "focus_app",
            Self::Other { name, .. } => name,
        }
    }

    /// Natural-language target description, when the step carries one.
    pub fn description(&self) -> Option<&str> {
        let description = match self {
            Self::ClickAt { description, .. }
            | Self::RightClick { description, .. }
            | Self::DoubleClick { description, .. }
            | Self::Hover { description, .. }
            | Self::Drag { description, .. }
            | Self::TypeTextAt { description, .. }
            | Self::WaitForElement { description }
            | Self::Hotkey { description, .. }
            | Self::SelectOption { description, .. } => description.as_deref(),
            Self::Other { params, .. } => params.get("description").and_then(|d| d.as_str()),
            _ => None,
        };
        description.filter(|d| !d.trim().is_empty())
    }
}

/// Wire shape of a step as stored by the workflow backend.
#[derive(Debug, Deserialize)]
struct RawStep {
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    action: Option<String>,
    #[serde(default)]
    params: serde_json::Value,
    #[serde(default)]
    context: String,
    #[serde(default)]
    expected_outcome: String,
    #[serde(default)]
    order: u32,
}

/// One unit of workflow intent. Immutable for the duration of a run.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(try_from = "RawStep")]
pub struct Step {
    pub id: Option<String>,
    pub action: StepAction,
    pub context: String,
    pub expected_outcome: String,
    pub order: u32,
}

impl Step {
    pub fn new(action: StepAction) -> Self {
        Self {
            id: None,
            action,
            context: String::new(),
            expected_outcome: String::new(),
            order: 0,
        }
    }

    pub fn with_context(mut self, context: impl Into<String>) -> Self {
        self.context = context.into();
        self
    }

    pub fn with_expected_outcome(mut self, outcome: impl Into<String>) -> Self {
        self.expected_outcome = outcome.into();
        self
    }
}

impl TryFrom<RawStep> for Step {
    type Error = SeeFlowError;

    fn try_from(raw: RawStep) -> Result<Self, Self::Error> {
        let name = raw.action.unwrap_or_else(|| "wait".to_string());
        let params = if raw.params.is_null() {
            serde_json::json!({})
        } else {
            raw.params
        };

        let action = if KNOWN_ACTIONS.contains(&name.as_str()) {
            serde_json::from_value(serde_json::json!({ "action": name, "params": params }))
                .map_err(|e| {
                    SeeFlowError::Workflow(format!("invalid params for step action '{name}': {e}"))
                })?
        } else {
            StepAction::Other { name, params }
        };

        Ok(Self {
            id: raw.id,
            action,
            context: raw.context,
            expected_outcome: raw.expected_outcome,
            order: raw.order,
        })
    }
}

/// Accepts integers, floats and numeric strings; anything else is treated as absent.
fn lenient_coord<'de, D>(deserializer: D) -> Result<Option<i32>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<serde_json::Value>::deserialize(deserializer)?;
    Ok(value.as_ref().and_then(number_from_json).map(|v| v.round() as i32))
}

fn lenient_seconds<'de, D>(deserializer: D) -> Result<Option<f64>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<serde_json::Value>::deserialize(deserializer)?;
    Ok(value.as_ref().and_then(number_from_json))
}

fn number_from_json(value: &serde_json::Value) -> Option<f64> {
    let number = match value {
        serde_json::Value::Number(n) => n.as_f64(),
        serde_json::Value::String(s) => s.trim().parse::<f64>().ok(),
        _ => None,
    };
    number.filter(|v| v.is_finite())
}

/// Accepts `["ctrl", "c"]` or `"ctrl+c"`.
fn lenient_keys<'de, D>(deserializer: D) -> Result<Vec<String>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<serde_json::Value>::deserialize(deserializer)?;
    let keys = match value {
        Some(serde_json::Value::Array(items)) => items
            .into_iter()
            .filter_map(|v| v.as_str().map(str::to_string))
            .collect(),
        Some(serde_json::Value::String(s)) => s.split('+').map(str::to_string).collect(),
        _ => Vec::new(),
    };
    Ok(keys
        .into_iter()
        .map(|k| k.trim().to_string())
        .filter(|k| !k.is_empty())
        .collect())
}
