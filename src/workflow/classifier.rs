use super::types::{Step, StepAction};

/// Returns true when the step's parameters are complete enough to execute without the model.
///
/// `navigate` is never deterministic, even with a URL: only a screenshot can confirm the
/// page actually rendered into the expected state.
pub fn is_deterministic(step: &Step) -> bool {
    match &step.action {
        StepAction::ClickAt { x, y, .. }
        | StepAction::RightClick { x, y, .. }
        | StepAction::DoubleClick { x, y, .. }
        | StepAction::Hover { x, y, .. } => x.is_some() && y.is_some(),
        StepAction::Drag { x, y, x2, y2, .. } => {
            x.is_some() && y.is_some() && x2.is_some() && y2.is_some()
        }
        StepAction::TypeTextAt { text, x, y, .. } => {
            x.is_some() && y.is_some() && text.as_deref().is_some_and(|t| !t.is_empty())
        }
        StepAction::Wait { seconds } => seconds.is_some(),
        StepAction::PressKey { key } => has_text(key),
        StepAction::Scroll { direction, .. } => has_text(direction),
        StepAction::Hotkey { keys, .. } => !keys.is_empty(),
        StepAction::OpenApp { app_name } | StepAction::FocusApp { app_name } => has_text(app_name),
        StepAction::Navigate { .. } => false,
        StepAction::WaitForElement { .. }
        | StepAction::SelectOption { .. }
        | StepAction::Other { .. } => false,
    }
}

fn has_text(value: &Option<String>) -> bool {
    value.as_deref().is_some_and(|v| !v.trim().is_empty())
}
