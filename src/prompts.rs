//! Prompt text for the decision, perception and verification model calls.
//!
//! Everything here is a pure function of its inputs. The action-space blocks are embedded
//! from `prompts/*.txt` at build time.

use crate::workflow::types::{Step, StepAction, WorkflowType};

const DESKTOP_ACTIONS: &str = include_str!("../prompts/desktop_actions.txt");
const BROWSER_ACTIONS: &str = include_str!("../prompts/browser_actions.txt");

/// System prompt for the decision model. The instruction always comes last.
pub fn system_prompt(instruction: &str, workflow_type: WorkflowType) -> String {
    let (environment, actions) = match workflow_type {
        WorkflowType::Desktop => (
            "You are operating a native desktop. OS-level actions such as Hotkey, OpenApp, \
             FocusApp, RightClick and DoubleClick are available.",
            DESKTOP_ACTIONS,
        ),
        WorkflowType::Browser => (
            "You are operating a web browser. Browser-aware actions such as Navigate, \
             SelectOption, Hover and PressKey are available.",
            BROWSER_ACTIONS,
        ),
    };

    let mut prompt = String::with_capacity(4096);
    prompt.push_str(
        "You are SeeFlow, an agent that automates user interfaces. You look at screenshots, \
         reason about what is on screen, and reply with one executable action.\n\n",
    );
    prompt.push_str(environment);
    prompt.push_str("\n\nReason through each turn like this:\n");
    prompt.push_str(
        "- Decomposition: split the goal into sub-tasks and keep track of the overall aim\n\
         - Consistency: stay on the original goal and do not drift into unrelated actions\n\
         - Milestones: say explicitly when an intermediate step is done before moving on\n\
         - Trial and error: predict what an action will do before you commit to it\n\
         - Reflection: after an error, name what went wrong and the corrected plan\n\
         - Recovery: when the previous attempt failed, look at the current screenshot again. \
         The element may have moved, be off-screen, or be hidden behind a dialog. Never repeat \
         the identical action; change the approach.\n\
         - Stuck: only after two or more genuinely different approaches have failed, use \
         CallUser(reason). One failure is never enough.\n\n",
    );
    prompt.push_str(
        "Coordinates are normalised to 0-1000: (0,0) is the top-left corner and (1000,1000) \
         the bottom-right corner.\n\n",
    );
    prompt.push_str(actions.trim_end());
    prompt.push_str("\n\n## Current Instruction\n");
    prompt.push_str(instruction);
    prompt
}

/// Prior-step summary, sent as its own user part. Empty input yields an empty string.
pub fn history_summary_text(summary: &str) -> String {
    if summary.trim().is_empty() {
        return String::new();
    }
    format!("## Prior Steps (summary)\n{summary}")
}

/// Natural-language instruction for one step. Coordinates in the step are hints only.
pub fn step_instruction(step: &Step, index: usize, total: usize) -> String {
    let mut parts = vec![format!("Step {index}/{total}:")];
    let context = step.context.trim();
    if !context.is_empty() {
        parts.push(format!("Context: {context}"));
    }
    let expected = step.expected_outcome.trim();
    if !expected.is_empty() {
        parts.push(format!("Expected outcome: {expected}"));
    }

    let target = |fallback: &str| -> String {
        step.action
            .description()
            .map(str::to_string)
            .unwrap_or_else(|| {
                if context.is_empty() {
                    fallback.to_string()
                } else {
                    context.to_string()
                }
            })
    };
    let hint = |x: &Option<i32>, y: &Option<i32>| -> Option<String> {
        match (x, y) {
            (Some(x), Some(y)) => Some(format!(
                "Approximate location: ({x}, {y}); confirm it visually first."
            )),
            _ => None,
        }
    };

    match &step.action {
        StepAction::Navigate { url } => {
            let url = url.as_deref().filter(|u| !u.trim().is_empty());
            match url {
                Some(url) => parts.push(format!("Go to {url}")),
                None => parts.push("Navigate to the page this step needs".to_string()),
            }
        }
        StepAction::ClickAt { x, y, .. } => {
            parts.push(format!(
                "Click {}. Find it in the screenshot and answer with Click(x, y) in normalised coordinates.",
                target("the element")
            ));
            parts.extend(hint(x, y));
        }
        StepAction::RightClick { x, y, .. } => {
            parts.push(format!("Right-click {} to open its context menu.", target("the element")));
            parts.extend(hint(x, y));
        }
        StepAction::DoubleClick { x, y, .. } => {
            parts.push(format!("Double-click {}.", target("the element")));
            parts.extend(hint(x, y));
        }
        StepAction::Hover { x, y, .. } => {
            parts.push(format!("Hover over {}.", target("the element")));
            parts.extend(hint(x, y));
        }
        StepAction::Drag { x, y, x2, y2, .. } => {
            parts.push(format!("Drag {}.", target("from the source to the destination")));
            if let (Some(x), Some(y), Some(x2), Some(y2)) = (x, y, x2, y2) {
                parts.push(format!(
                    "From about ({x}, {y}) to ({x2}, {y2}); confirm it visually first."
                ));
            }
        }
        StepAction::TypeTextAt { text, .. } => {
            parts.push(format!(
                "Type '{}' into {}.",
                text.as_deref().unwrap_or_default(),
                target("the input field")
            ));
        }
        StepAction::Scroll {
            direction,
            distance,
            ..
        } => {
            parts.push(format!(
                "Scroll {} by {}px",
                direction.as_deref().unwrap_or("down"),
                distance.unwrap_or(300)
            ));
        }
        StepAction::Wait { seconds } => {
            parts.push(format!("Wait {} seconds", seconds.unwrap_or(2.0)));
        }
        StepAction::WaitForElement { .. } => {
            parts.push(format!("Wait for {} to appear on screen", target("the expected element")));
        }
        StepAction::SelectOption { value, .. } => {
            parts.push(format!(
                "Select option '{}' in {}",
                value.as_deref().unwrap_or_default(),
                target("the dropdown")
            ));
        }
        StepAction::PressKey { key } => {
            parts.push(format!("Press the {} key", key.as_deref().unwrap_or("Enter")));
        }
        StepAction::Hotkey { keys, description } => {
            let combo = if keys.is_empty() {
                "unknown".to_string()
            } else {
                keys.join("+")
            };
            match description.as_deref().filter(|d| !d.trim().is_empty()) {
                Some(desc) => parts.push(format!("Press keyboard shortcut {combo} ({desc})")),
                None => parts.push(format!("Press keyboard shortcut {combo}")),
            }
        }
        StepAction::OpenApp { app_name } => {
            parts.push(format!(
                "Launch the application '{}'",
                app_name.as_deref().unwrap_or_default()
            ));
        }
        StepAction::FocusApp { app_name } => {
            parts.push(format!(
                "Bring '{}' to the foreground",
                app_name.as_deref().unwrap_or_default()
            ));
        }
        StepAction::Other { name, params } => {
            parts.push(format!("{name}: {params}"));
        }
    }

    parts.join(" ")
}

/// Scene caption request for the perception model.
pub fn scene_caption_prompt() -> &'static str {
    "Describe this GUI screenshot densely. Cover:\n\
     (a) the overall layout and structure,\n\
     (b) the main regions such as header, sidebar, content area and footer,\n\
     (c) the key interactive elements and where they sit relative to each other,\n\
     (d) any images, icons or badges and what they appear to be for.\n\
     Be thorough, but only describe what is clearly visible."
}

/// Element grounding request. The model must answer with a single JSON object.
pub fn grounding_prompt(description: &str) -> String {
    format!(
        "Find this UI element in the screenshot:\n'{description}'\n\n\
         Answer with one JSON object and nothing else:\n\
         {{\"center_x\": int, \"center_y\": int, \"box_2d\": [y_min, x_min, y_max, x_max], \
         \"label\": string, \"confidence\": \"high\" | \"medium\" | \"low\"}}\n\n\
         All coordinates are normalised 0-1000 with (0,0) at the top-left corner.\n\
         confidence:\n  \
         high: the element is clearly visible and unambiguous\n  \
         medium: probably right, but partly hidden or ambiguous\n  \
         low: the element may not be visible and the coordinates are a guess"
    )
}

/// Before/after comparison prompt. The reply must end with a `VERDICT:` line.
pub fn state_transition_prompt(action: &str, expected_outcome: &str) -> String {
    let mut prompt = String::from(
        "Compare the BEFORE and AFTER screenshots and decide whether the last action worked.\n\n",
    );
    if !action.is_empty() {
        prompt.push_str(&format!("Action taken: {action}\n"));
    }
    if !expected_outcome.is_empty() {
        prompt.push_str(&format!("Expected outcome: {expected_outcome}\n"));
    }
    prompt.push_str(
        "\nReply in exactly this format, with nothing after the VERDICT line:\n\n\
         DESCRIPTION: <one sentence on what changed or did not change>\n\
         VERDICT: success | failed\n\n\
         Use success when the screen changed meaningfully in the intended direction.\n\
         Use failed when the screenshots are identical or the change has nothing to do with the action.\n\
         The VERDICT line is mandatory and must be the final line.",
    );
    prompt
}

/// Strips a leading `thought:` or `reflection:` label from a user-facing reason.
pub fn clean_call_user_reason(text: &str) -> String {
    let trimmed = text.trim();
    for label in ["thought:", "reflection:"] {
        if trimmed.len() >= label.len()
            && trimmed.is_char_boundary(label.len())
            && trimmed[..label.len()].eq_ignore_ascii_case(label)
        {
            return trimmed[label.len()..].trim().to_string();
        }
    }
    trimmed.to_string()
}
