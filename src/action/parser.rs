//! Parses the model's `Thought: ... / Action: Name(args)` output into a typed action.
//!
//! Only the first `Action:` line is considered. Anything the parser cannot map onto the
//! closed action set yields `None`, which the engine treats as a retryable failure.
use std::sync::OnceLock;

use regex::Regex;

use crate::action::types::{
    ActionKind, ParsedAction, Point, ScrollDirection, SelectTarget, MAX_WAIT_SECS, MIN_WAIT_SECS,
};

const THOUGHT_LABELS: [&str; 3] = ["Thought:", "Reflection:", "Action_Summary:"];

fn action_line_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?i)^action:").expect("action line regex"))
}

fn call_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?is)action:\s*(\w+)\s*\((.*?)\)\s*\.?$").expect("action call regex")
    })
}

fn call_loose_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?i)action:\s*(\w+)\s*\((.*?)\)").expect("loose call regex"))
}

fn number_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"-?\d+(?:\.\d+)?").expect("number regex"))
}

fn named_arg_re(name: &'static str) -> &'static Regex {
    static X: OnceLock<Regex> = OnceLock::new();
    static Y: OnceLock<Regex> = OnceLock::new();
    static DIRECTION: OnceLock<Regex> = OnceLock::new();
    static DISTANCE: OnceLock<Regex> = OnceLock::new();
    match name {
        "x" => X.get_or_init(|| Regex::new(r"(?i)\bx\s*=\s*(-?\d+)").expect("x= regex")),
        "y" => Y.get_or_init(|| Regex::new(r"(?i)\by\s*=\s*(-?\d+)").expect("y= regex")),
        "direction" => DIRECTION.get_or_init(|| {
            Regex::new(r#"(?i)\bdirection\s*=\s*["']?(\w+)["']?"#).expect("direction= regex")
        }),
        _ => DISTANCE
            .get_or_init(|| Regex::new(r"(?i)\bdistance\s*=\s*(-?\d+)").expect("distance= regex")),
    }
}

fn thought_fallback_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?i)(?:thought|reflection|action_summary):\s*").expect("thought regex")
    })
}

fn next_action_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?i)\naction:").expect("next action regex"))
}

/// Extracts the action from model output. Returns `None` when no `Action:` line exists,
/// the call syntax is malformed, the action name is unknown, or a navigate has no URL.
pub fn parse_action(text: &str) -> Option<ParsedAction> {
    let line = text
        .lines()
        .map(str::trim)
        .find(|l| action_line_re().is_match(l))?;

    let caps = call_re()
        .captures(line)
        .or_else(|| call_loose_re().captures(line))?;
    let name = caps.get(1)?.as_str().trim().to_lowercase();
    let args = caps.get(2).map(|m| m.as_str().trim()).unwrap_or_default();

    let Some(kind) = ActionKind::from_name(&name) else {
        tracing::debug!(name = %name, "unrecognised action name");
        return None;
    };

    let action = match kind {
        ActionKind::Click => ParsedAction::Click { at: parse_point(args) },
        ActionKind::RightClick => ParsedAction::RightClick { at: parse_point(args) },
        ActionKind::DoubleClick => ParsedAction::DoubleClick { at: parse_point(args) },
        ActionKind::Hover => ParsedAction::Hover { at: parse_point(args) },
        ActionKind::Drag => ParsedAction::Drag {
            path: parse_coords(args, 4).map(|c| (Point::new(c[0], c[1]), Point::new(c[2], c[3]))),
        },
        ActionKind::Scroll => parse_scroll(args),
        ActionKind::Type => ParsedAction::Type {
            content: unquote(args),
        },
        ActionKind::Hotkey => ParsedAction::Hotkey {
            keys: parse_hotkey_keys(args),
        },
        ActionKind::Wait => ParsedAction::Wait {
            seconds: parse_wait_seconds(args),
        },
        ActionKind::PressKey => {
            let key = unquote(args);
            ParsedAction::PressKey {
                key: if key.is_empty() { "enter".into() } else { key },
            }
        }
        ActionKind::Navigate => {
            let url = unquote(args);
            if url.is_empty() {
                tracing::debug!("navigate without url rejected");
                return None;
            }
            ParsedAction::Navigate { url }
        }
        ActionKind::SelectOption => parse_select_option(args),
        ActionKind::WaitForElement => ParsedAction::WaitForElement {
            description: unquote(args),
        },
        ActionKind::OpenApp => ParsedAction::OpenApp {
            app_name: unquote(args),
        },
        ActionKind::FocusApp => ParsedAction::FocusApp {
            app_name: unquote(args),
        },
        ActionKind::Finished => ParsedAction::Finished {
            reason: non_empty(unquote(args)),
        },
        ActionKind::CallUser => ParsedAction::CallUser {
            reason: non_empty(unquote(args)),
        },
    };
    Some(action)
}

/// Returns the reasoning text that precedes the action, or an empty string.
pub fn extract_thought(text: &str) -> String {
    for line in text.lines() {
        let stripped = line.trim();
        for label in THOUGHT_LABELS {
            let matches_label = stripped
                .get(..label.len())
                .is_some_and(|head| head.eq_ignore_ascii_case(label));
            if matches_label {
                return stripped[label.len()..].trim().to_string();
            }
        }
    }

    let Some(m) = thought_fallback_re().find(text) else {
        return String::new();
    };
    let rest = &text[m.end()..];
    let end = next_action_re()
        .find(rest)
        .map(|n| n.start())
        .unwrap_or(rest.len());
    rest[..end].trim().to_string()
}

fn parse_point(args: &str) -> Option<Point> {
    parse_coords(args, 2).map(|c| Point::new(c[0], c[1]))
}

/// First `count` numeric tokens, rounded to integers.
fn parse_coords(args: &str, count: usize) -> Option<Vec<i32>> {
    let values: Vec<i32> = number_re()
        .find_iter(args)
        .take(count)
        .filter_map(|m| m.as_str().parse::<f64>().ok())
        .map(|v| v.round() as i32)
        .collect();
    (values.len() == count).then_some(values)
}

fn parse_int_token(s: &str) -> Option<i32> {
    s.trim()
        .parse::<f64>()
        .ok()
        .filter(|v| v.is_finite())
        .map(|v| v.round() as i32)
}

fn parse_scroll(args: &str) -> ParsedAction {
    let named = |key: &'static str| {
        named_arg_re(key)
            .captures(args)
            .and_then(|c| c.get(1))
            .map(|m| m.as_str().to_string())
    };

    // Named form wins whenever both x= and y= are present.
    if let (Some(x), Some(y)) = (named("x"), named("y")) {
        let at = match (x.parse::<i32>(), y.parse::<i32>()) {
            (Ok(x), Ok(y)) => Some(Point::new(x, y)),
            _ => None,
        };
        let direction = named("direction")
            .and_then(|d| ScrollDirection::parse(&d))
            .unwrap_or(ScrollDirection::Down);
        let distance = named("distance").and_then(|d| d.parse::<i32>().ok());
        return ParsedAction::Scroll {
            at,
            direction,
            distance,
        };
    }

    let parts = split_args(args);
    if parts.len() >= 3 {
        if let (Some(x), Some(y)) = (parse_int_token(&parts[0]), parse_int_token(&parts[1])) {
            return ParsedAction::Scroll {
                at: Some(Point::new(x, y)),
                direction: ScrollDirection::parse(&parts[2]).unwrap_or(ScrollDirection::Down),
                distance: parts.get(3).and_then(|d| parse_int_token(d)),
            };
        }
    }

    ParsedAction::Scroll {
        at: None,
        direction: ScrollDirection::Down,
        distance: None,
    }
}

fn parse_select_option(args: &str) -> ParsedAction {
    let parts = split_args(args);
    if parts.len() >= 3 {
        if let (Some(x), Some(y)) = (parse_int_token(&parts[0]), parse_int_token(&parts[1])) {
            return ParsedAction::SelectOption {
                target: Some(SelectTarget::At {
                    point: Point::new(x, y),
                }),
                value: parts[2].clone(),
            };
        }
    } else if parts.len() == 2 {
        return ParsedAction::SelectOption {
            target: Some(SelectTarget::Selector {
                selector: parts[0].clone(),
            }),
            value: parts[1].clone(),
        };
    }
    ParsedAction::SelectOption {
        target: None,
        value: String::new(),
    }
}

fn parse_hotkey_keys(args: &str) -> Vec<String> {
    args.split(',')
        .map(|p| strip_quotes(p.trim()).to_lowercase())
        .filter(|k| !k.is_empty())
        .map(|k| canonical_key(&k).to_string())
        .collect()
}

fn canonical_key(key: &str) -> &str {
    match key {
        "command" | "meta" => "cmd",
        "control" => "ctrl",
        "option" => "alt",
        other => other,
    }
}

fn parse_wait_seconds(args: &str) -> u32 {
    strip_quotes(args.trim())
        .trim()
        .parse::<f64>()
        .ok()
        .filter(|v| v.is_finite())
        .map(|v| v.round().clamp(MIN_WAIT_SECS as f64, MAX_WAIT_SECS as f64) as u32)
        .unwrap_or(MIN_WAIT_SECS)
}

fn split_args(args: &str) -> Vec<String> {
    args.split(',')
        .map(|p| strip_quotes(p.trim()).to_string())
        .collect()
}

fn strip_quotes(s: &str) -> &str {
    s.trim_matches(|c| c == '"' || c == '\'')
}

/// Quoted arguments lose their outer quotes (escaped quotes are unescaped);
/// anything else is taken verbatim.
fn unquote(args: &str) -> String {
    if args.starts_with('"') || args.starts_with('\'') {
        extract_quoted(args)
    } else {
        args.trim().to_string()
    }
}

fn extract_quoted(s: &str) -> String {
    if s.len() < 2 {
        return s.to_string();
    }
    let quote = match s.chars().next() {
        Some(q @ ('"' | '\'')) => q,
        _ => return s.to_string(),
    };
    match s.rfind(quote) {
        Some(end) if end > 0 => s[1..end].replace(&format!("\\{quote}"), &quote.to_string()),
        _ => s[1..].to_string(),
    }
}

fn non_empty(s: String) -> Option<String> {
    (!s.is_empty()).then_some(s)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_click() {
        assert_eq!(
            parse_action("Action: Click(500, 300)"),
            Some(ParsedAction::Click {
                at: Some(Point::new(500, 300))
            })
        );
    }

    #[test]
    fn rounds_float_coordinates_and_ignores_extras() {
        assert_eq!(
            parse_action("Action: DoubleClick(10.6, 20.2, 99)"),
            Some(ParsedAction::DoubleClick {
                at: Some(Point::new(11, 20))
            })
        );
    }

    #[test]
    fn click_without_coordinates_keeps_action() {
        assert_eq!(
            parse_action("Action: Click()"),
            Some(ParsedAction::Click { at: None })
        );
    }

    #[test]
    fn uses_first_action_line_only() {
        let text = "Thought: I will click the button\n\
                    Action: Click(100, 200)\n\
                    Some explanation follows.\n\
                    Action: Click(900, 900)";
        assert_eq!(
            parse_action(text),
            Some(ParsedAction::Click {
                at: Some(Point::new(100, 200))
            })
        );
    }

    #[test]
    fn action_line_is_case_insensitive_and_tolerates_period() {
        assert_eq!(
            parse_action("ACTION: PressKey(\"tab\")."),
            Some(ParsedAction::PressKey { key: "tab".into() })
        );
    }

    #[test]
    fn named_and_positional_scroll_agree() {
        let expected = Some(ParsedAction::Scroll {
            at: Some(Point::new(400, 600)),
            direction: ScrollDirection::Down,
            distance: Some(300),
        });
        assert_eq!(
            parse_action(r#"Action: Scroll(x=400, y=600, direction="down", distance=300)"#),
            expected
        );
        assert_eq!(parse_action(r#"Action: Scroll(400,600,"down",300)"#), expected);
    }

    #[test]
    fn named_scroll_takes_precedence_over_positional_values() {
        assert_eq!(
            parse_action(r#"Action: Scroll(1, 2, "up", x=400, y=600)"#),
            Some(ParsedAction::Scroll {
                at: Some(Point::new(400, 600)),
                direction: ScrollDirection::Down,
                distance: None,
            })
        );
    }

    #[test]
    fn scroll_direction_defaults_to_down() {
        assert_eq!(
            parse_action("Action: Scroll(x=10, y=20)"),
            Some(ParsedAction::Scroll {
                at: Some(Point::new(10, 20)),
                direction: ScrollDirection::Down,
                distance: None,
            })
        );
    }

    #[test]
    fn empty_navigate_is_rejected() {
        assert_eq!(parse_action("Action: Navigate()"), None);
        assert_eq!(parse_action("Action: Navigate(\"\")"), None);
    }

    #[test]
    fn navigate_unquotes_url() {
        assert_eq!(
            parse_action(r#"Action: Navigate("https://example.com/login")"#),
            Some(ParsedAction::Navigate {
                url: "https://example.com/login".into()
            })
        );
    }

    #[test]
    fn type_unescapes_inner_quotes() {
        assert_eq!(
            parse_action(r#"Action: Type("say \"hi\"")"#),
            Some(ParsedAction::Type {
                content: r#"say "hi""#.into()
            })
        );
        assert_eq!(
            parse_action("Action: Type(hello world)"),
            Some(ParsedAction::Type {
                content: "hello world".into()
            })
        );
    }

    #[test]
    fn hotkey_keys_are_canonicalised() {
        assert_eq!(
            parse_action(r#"Action: Hotkey("Command", "Shift", "T")"#),
            Some(ParsedAction::Hotkey {
                keys: vec!["cmd".into(), "shift".into(), "t".into()]
            })
        );
        assert_eq!(
            parse_action("Action: Hotkey(control, option, meta)"),
            Some(ParsedAction::Hotkey {
                keys: vec!["ctrl".into(), "alt".into(), "cmd".into()]
            })
        );
    }

    #[test]
    fn wait_is_clamped() {
        assert_eq!(
            parse_action("Action: Wait(99)"),
            Some(ParsedAction::Wait { seconds: 30 })
        );
        assert_eq!(
            parse_action("Action: Wait(0)"),
            Some(ParsedAction::Wait { seconds: 1 })
        );
        assert_eq!(
            parse_action("Action: Wait(2.6)"),
            Some(ParsedAction::Wait { seconds: 3 })
        );
        assert_eq!(
            parse_action("Action: Wait(soon)"),
            Some(ParsedAction::Wait { seconds: 1 })
        );
    }

    #[test]
    fn select_option_forms() {
        assert_eq!(
            parse_action(r#"Action: SelectOption(300, 400, "Canada")"#),
            Some(ParsedAction::SelectOption {
                target: Some(SelectTarget::At {
                    point: Point::new(300, 400)
                }),
                value: "Canada".into(),
            })
        );
        assert_eq!(
            parse_action(r##"Action: SelectOption("#country", "Canada")"##),
            Some(ParsedAction::SelectOption {
                target: Some(SelectTarget::Selector {
                    selector: "#country".into()
                }),
                value: "Canada".into(),
            })
        );
    }

    #[test]
    fn drag_needs_four_numbers() {
        assert_eq!(
            parse_action("Action: Drag(1, 2, 3, 4)"),
            Some(ParsedAction::Drag {
                path: Some((Point::new(1, 2), Point::new(3, 4)))
            })
        );
        assert_eq!(
            parse_action("Action: Drag(1, 2, 3)"),
            Some(ParsedAction::Drag { path: None })
        );
    }

    #[test]
    fn terminal_actions_carry_optional_reason() {
        assert_eq!(
            parse_action("Action: Finished()"),
            Some(ParsedAction::Finished { reason: None })
        );
        assert_eq!(
            parse_action(r#"Action: CallUser("login requires a 2FA code")"#),
            Some(ParsedAction::CallUser {
                reason: Some("login requires a 2FA code".into())
            })
        );
    }

    #[test]
    fn app_actions_and_press_key_default() {
        assert_eq!(
            parse_action(r#"Action: OpenApp("Safari")"#),
            Some(ParsedAction::OpenApp {
                app_name: "Safari".into()
            })
        );
        assert_eq!(
            parse_action("Action: PressKey()"),
            Some(ParsedAction::PressKey { key: "enter".into() })
        );
    }

    #[test]
    fn unknown_or_missing_actions_yield_none() {
        assert_eq!(parse_action("Action: Teleport(1, 2)"), None);
        assert_eq!(parse_action("Thought: nothing to do"), None);
        assert_eq!(parse_action("Action: Finished"), None);
        assert_eq!(parse_action(""), None);
    }

    #[test]
    fn extracts_thought_by_line() {
        let text = "Some preamble\nthought: The button is top right.\nAction: Click(900, 40)";
        assert_eq!(extract_thought(text), "The button is top right.");
        assert_eq!(
            extract_thought("Reflection: last click missed\nAction: Wait(1)"),
            "last click missed"
        );
    }

    #[test]
    fn extracts_thought_mid_line_as_fallback() {
        let text = "Okay. Thought: scroll to reveal the form\nmore detail\nAction: Scroll(500, 500, down)";
        assert_eq!(extract_thought(text), "scroll to reveal the form\nmore detail");
        assert_eq!(extract_thought("Action: Click(1, 2)"), "");
    }

    #[test]
    fn thought_and_action_round_trip_past_prose() {
        let cases = [
            ("Click(500, 300)", "click", vec!["500", "300"]),
            ("Type(\"hello\")", "type", vec!["hello"]),
            ("Hotkey(\"ctrl\", \"c\")", "hotkey", vec!["ctrl", "c"]),
            ("Navigate(\"https://a.b\")", "navigate", vec!["https://a.b"]),
        ];
        for (call, name, args) in cases {
            let text = format!(
                "I looked at the screen.\nIt seems fine.\nThought: do the thing\nAction: {call}"
            );
            let thought = extract_thought(&text);
            assert_eq!(thought, "do the thing");
            let rebuilt = format!("Thought: {thought}\nAction: {call}");
            let action = parse_action(&rebuilt).expect("parses");
            assert_eq!(action.kind().name(), name);
            assert_eq!(action.to_string(), format!("{name}({})", args.join(", ")));
        }
    }
}
