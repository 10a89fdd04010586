use async_trait::async_trait;
use enigo::{Axis, Button, Coordinate, Direction, Enigo, Key, Keyboard, Mouse, Settings};
use serde::{Deserialize, Serialize};

use crate::action::types::ScrollDirection;
use crate::errors::{SeeFlowError, SeeFlowResult};

/// Pause between the press/move/release phases of a drag, in ms.
const DRAG_STEP_MS: u64 = 60;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MouseButton {
    Left,
    Right,
}

/// One OS-level input primitive, in physical pixels.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum InputEvent {
    Click {
        x: i32,
        y: i32,
        button: MouseButton,
        count: u32,
    },
    MoveTo {
        x: i32,
        y: i32,
    },
    Drag {
        from: (i32, i32),
        to: (i32, i32),
    },
    /// `steps` wheel notches; pointer is moved to `at` first when given.
    Scroll {
        at: Option<(i32, i32)>,
        direction: ScrollDirection,
        steps: i32,
    },
    Type {
        text: String,
    },
    Key {
        key: String,
    },
    /// Modifiers held in order, last key tapped, then released in reverse.
    Hotkey {
        keys: Vec<String>,
    },
    OpenApp {
        name: String,
    },
    FocusApp {
        name: String,
    },
}

/// OS automation surface. Everything above this trait is platform-independent.
#[async_trait]
pub trait InputDriver: Send + Sync {
    async fn perform(&self, event: InputEvent) -> SeeFlowResult<()>;
}

/// `enigo`-backed driver. A fresh `Enigo` is built per event on a blocking thread,
/// since the handle is neither `Send` nor cheap to keep alive on every platform.
#[derive(Debug, Default, Clone)]
pub struct EnigoDriver;

#[async_trait]
impl InputDriver for EnigoDriver {
    async fn perform(&self, event: InputEvent) -> SeeFlowResult<()> {
        tracing::debug!(event = ?event, "input event");
        match event {
            InputEvent::OpenApp { name } => open_app(&name).await,
            InputEvent::FocusApp { name } => focus_app(&name).await,
            other => tokio::task::spawn_blocking(move || perform_blocking(other))
                .await
                .map_err(|e| SeeFlowError::Executor(format!("input task failed: {e}")))?,
        }
    }
}

fn enigo_err(e: impl std::fmt::Display) -> SeeFlowError {
    SeeFlowError::Executor(format!("enigo: {e}"))
}

fn perform_blocking(event: InputEvent) -> SeeFlowResult<()> {
    let mut enigo = Enigo::new(&Settings::default()).map_err(enigo_err)?;
    match event {
        InputEvent::Click {
            x,
            y,
            button,
            count,
        } => {
            enigo.move_mouse(x, y, Coordinate::Abs).map_err(enigo_err)?;
            let button = match button {
                MouseButton::Left => Button::Left,
                MouseButton::Right => Button::Right,
            };
            for _ in 0..count.max(1) {
                enigo.button(button, Direction::Click).map_err(enigo_err)?;
            }
        }
        InputEvent::MoveTo { x, y } => {
            enigo.move_mouse(x, y, Coordinate::Abs).map_err(enigo_err)?;
        }
        InputEvent::Drag { from, to } => {
            drag(&mut enigo, from, to, std::time::Duration::from_millis(DRAG_STEP_MS))?;
        }
        InputEvent::Scroll {
            at,
            direction,
            steps,
        } => {
            if let Some((x, y)) = at {
                enigo.move_mouse(x, y, Coordinate::Abs).map_err(enigo_err)?;
            }
            // Positive lengths scroll down / right.
            let (length, axis) = match direction {
                ScrollDirection::Down => (steps, Axis::Vertical),
                ScrollDirection::Up => (-steps, Axis::Vertical),
                ScrollDirection::Right => (steps, Axis::Horizontal),
                ScrollDirection::Left => (-steps, Axis::Horizontal),
            };
            enigo.scroll(length, axis).map_err(enigo_err)?;
        }
        InputEvent::Type { text } => {
            enigo.text(&text).map_err(enigo_err)?;
        }
        InputEvent::Key { key } => {
            enigo
                .key(parse_key(&key)?, Direction::Click)
                .map_err(enigo_err)?;
        }
        InputEvent::Hotkey { keys } => {
            let parsed: Vec<Key> = keys.iter().map(|k| parse_key(k)).collect::<SeeFlowResult<_>>()?;
            let Some((last, modifiers)) = parsed.split_last() else {
                return Err(SeeFlowError::Executor("empty hotkey".into()));
            };
            for m in modifiers {
                enigo.key(*m, Direction::Press).map_err(enigo_err)?;
            }
            let tapped = enigo.key(*last, Direction::Click).map_err(enigo_err);
            let mut released = Ok(());
            for m in modifiers.iter().rev() {
                let r = enigo.key(*m, Direction::Release).map_err(enigo_err);
                released = released.and(r);
            }
            tapped.and(released)?;
        }
        InputEvent::OpenApp { .. } | InputEvent::FocusApp { .. } => {
            return Err(SeeFlowError::Executor(
                "application events are not keyboard/mouse input".into(),
            ));
        }
    }
    Ok(())
}

/// The pointer calls a drag needs.
trait Pointer {
    fn move_to(&mut self, x: i32, y: i32) -> SeeFlowResult<()>;
    fn left_button(&mut self, direction: Direction) -> SeeFlowResult<()>;
}

impl Pointer for Enigo {
    fn move_to(&mut self, x: i32, y: i32) -> SeeFlowResult<()> {
        self.move_mouse(x, y, Coordinate::Abs).map_err(enigo_err)
    }

    fn left_button(&mut self, direction: Direction) -> SeeFlowResult<()> {
        self.button(Button::Left, direction).map_err(enigo_err)
    }
}

/// Press at `from`, move through the midpoint to `to`, release. The button is
/// released even when a move fails.
fn drag(
    pointer: &mut impl Pointer,
    from: (i32, i32),
    to: (i32, i32),
    pause: std::time::Duration,
) -> SeeFlowResult<()> {
    pointer.move_to(from.0, from.1)?;
    pointer.left_button(Direction::Press)?;
    std::thread::sleep(pause);
    let mid = ((from.0 + to.0) / 2, (from.1 + to.1) / 2);
    let moved = pointer.move_to(mid.0, mid.1).and_then(|()| {
        std::thread::sleep(pause);
        pointer.move_to(to.0, to.1)
    });
    if moved.is_ok() {
        std::thread::sleep(pause);
    }
    let released = pointer.left_button(Direction::Release);
    moved.and(released)
}

/// Maps a canonical key name to an enigo key. Single characters map to `Key::Unicode`.
pub fn parse_key(name: &str) -> SeeFlowResult<Key> {
    let lower = name.trim().to_lowercase();
    let key = match lower.as_str() {
        "enter" | "return" => Key::Return,
        "tab" => Key::Tab,
        "esc" | "escape" => Key::Escape,
        "backspace" => Key::Backspace,
        "delete" | "del" => Key::Delete,
        "space" | "spacebar" => Key::Space,
        "up" | "arrowup" => Key::UpArrow,
        "down" | "arrowdown" => Key::DownArrow,
        "left" | "arrowleft" => Key::LeftArrow,
        "right" | "arrowright" => Key::RightArrow,
        "home" => Key::Home,
        "end" => Key::End,
        "pageup" => Key::PageUp,
        "pagedown" => Key::PageDown,
        "ctrl" | "control" => Key::Control,
        "shift" => Key::Shift,
        "alt" | "option" => Key::Alt,
        "cmd" | "command" | "meta" | "super" | "win" => Key::Meta,
        "f1" => Key::F1,
        "f2" => Key::F2,
        "f3" => Key::F3,
        "f4" => Key::F4,
        "f5" => Key::F5,
        "f6" => Key::F6,
        "f7" => Key::F7,
        "f8" => Key::F8,
        "f9" => Key::F9,
        "f10" => Key::F10,
        "f11" => Key::F11,
        "f12" => Key::F12,
        other => {
            let mut chars = other.chars();
            match (chars.next(), chars.next()) {
                (Some(c), None) => Key::Unicode(c),
                _ => {
                    return Err(SeeFlowError::Executor(format!("unknown key '{name}'")));
                }
            }
        }
    };
    Ok(key)
}

async fn run_command(program: &str, args: &[&str]) -> SeeFlowResult<()> {
    let status = tokio::process::Command::new(program)
        .args(args)
        .status()
        .await
        .map_err(|e| SeeFlowError::Executor(format!("{program}: {e}")))?;
    if status.success() {
        Ok(())
    } else {
        Err(SeeFlowError::Executor(format!("{program} exited with {status}")))
    }
}

async fn open_app(name: &str) -> SeeFlowResult<()> {
    if name.trim().is_empty() {
        return Err(SeeFlowError::Executor("open_app needs an application name".into()));
    }
    if cfg!(target_os = "macos") {
        run_command("open", &["-a", name]).await
    } else if cfg!(target_os = "windows") {
        run_command("cmd", &["/C", "start", "", name]).await
    } else {
        tokio::process::Command::new(name)
            .spawn()
            .map(|_| ())
            .map_err(|e| SeeFlowError::Executor(format!("launch {name}: {e}")))
    }
}

async fn focus_app(name: &str) -> SeeFlowResult<()> {
    if name.trim().is_empty() {
        return Err(SeeFlowError::Executor("focus_app needs an application name".into()));
    }
    if cfg!(target_os = "macos") {
        let script = format!(
            "tell application \"{}\" to activate",
            name.replace('\\', "\\\\").replace('"', "\\\"")
        );
        run_command("osascript", &["-e", &script]).await
    } else if cfg!(target_os = "windows") {
        let script = format!(
            "(New-Object -ComObject WScript.Shell).AppActivate('{}')",
            name.replace('\'', "''")
        );
        run_command("powershell", &["-NoProfile", "-Command", &script]).await
    } else {
        run_command("wmctrl", &["-a", name]).await
    }
}
