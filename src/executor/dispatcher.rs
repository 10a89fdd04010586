use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use crate::action::types::{ParsedAction, Point, ScrollDirection, SelectTarget};
use crate::config::OperatorConfig;
use crate::errors::{SeeFlowError, SeeFlowResult};
use crate::executor::coordinator::DeviceContext;
use crate::executor::input::{InputDriver, InputEvent, MouseButton};
use crate::perception::screenshot::{self, ScreenSource};

pub const DEFAULT_SCROLL_PX: i32 = 300;
/// Pixels per wheel notch when converting a scroll distance.
pub const PX_PER_SCROLL_STEP: f64 = 100.0;
pub const MAX_SCROLL_STEPS: i32 = 20;

const SELECT_OPEN_DELAY: Duration = Duration::from_millis(300);
const WAIT_FOR_ELEMENT_DELAY: Duration = Duration::from_millis(500);

/// Result of executing one action.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OperatorOutcome {
    Success,
    /// Retryable; carries what went wrong.
    Failure(String),
    /// The model declared the instruction complete.
    Finished,
    /// The model asked for a human.
    CallUser,
}

/// Capture + actuate surface the orchestrator drives.
#[async_trait]
pub trait Operator: Send + Sync {
    /// Screenshot bytes of the given source (monitor index as text), or the default one.
    /// The final error carries an actionable message.
    async fn capture_screen(&self, source_id: Option<&str>) -> SeeFlowResult<Vec<u8>>;

    async fn execute(&self, action: &ParsedAction) -> OperatorOutcome;
}

/// Wheel notches for a pixel distance: `clamp(round(px / 100), 1, 20)`.
pub fn scroll_steps(distance_px: i32) -> i32 {
    ((distance_px.unsigned_abs() as f64 / PX_PER_SCROLL_STEP).round() as i32).clamp(1, MAX_SCROLL_STEPS)
}

/// Operator for the local desktop: an [`InputDriver`] plus a [`ScreenSource`].
pub struct DesktopOperator {
    driver: Arc<dyn InputDriver>,
    screen: Arc<dyn ScreenSource>,
    device: DeviceContext,
    config: OperatorConfig,
}

impl DesktopOperator {
    pub fn new(
        driver: Arc<dyn InputDriver>,
        screen: Arc<dyn ScreenSource>,
        device: DeviceContext,
        config: OperatorConfig,
    ) -> Self {
        Self {
            driver,
            screen,
            device,
            config,
        }
    }

    /// Captures once to learn the monitor geometry, then builds the operator.
    pub async fn connect(
        driver: Arc<dyn InputDriver>,
        screen: Arc<dyn ScreenSource>,
        config: OperatorConfig,
    ) -> SeeFlowResult<Self> {
        let first = screen.capture(config.monitor_index).await?;
        let device = DeviceContext::from_meta(&first.meta);
        tracing::info!(
            width = device.width,
            height = device.height,
            scale = device.scale,
            "desktop operator connected"
        );
        Ok(Self::new(driver, screen, device, config))
    }

    pub fn device(&self) -> DeviceContext {
        self.device
    }

    async fn send(&self, event: InputEvent) -> SeeFlowResult<()> {
        self.driver.perform(event).await
    }

    async fn dispatch(&self, action: &ParsedAction) -> SeeFlowResult<()> {
        let missing = |what: &str| SeeFlowError::Executor(format!("{} requires {what}", action.kind().name()));
        let to_px = |p: Point| self.device.to_physical(p);

        match action {
            ParsedAction::Click { at } | ParsedAction::RightClick { at } | ParsedAction::DoubleClick { at } => {
                let (x, y) = to_px(at.ok_or_else(|| missing("coordinates"))?);
                let (button, count) = match action {
                    ParsedAction::RightClick { .. } => (MouseButton::Right, 1),
                    ParsedAction::DoubleClick { .. } => (MouseButton::Left, 2),
                    _ => (MouseButton::Left, 1),
                };
                self.send(InputEvent::Click { x, y, button, count }).await
            }
            ParsedAction::Hover { at } => {
                let (x, y) = to_px(at.ok_or_else(|| missing("coordinates"))?);
                self.send(InputEvent::MoveTo { x, y }).await
            }
            ParsedAction::Drag { path } => {
                let (from, to) = path.ok_or_else(|| missing("start and end coordinates"))?;
                self.send(InputEvent::Drag {
                    from: to_px(from),
                    to: to_px(to),
                })
                .await
            }
            ParsedAction::Scroll {
                at,
                direction,
                distance,
            } => {
                let at = at.unwrap_or(Point::new(500, 500));
                self.send(InputEvent::Scroll {
                    at: Some(to_px(at)),
                    direction: *direction,
                    steps: scroll_steps(distance.unwrap_or(DEFAULT_SCROLL_PX)),
                })
                .await
            }
            ParsedAction::Type { content } => {
                self.send(InputEvent::Type {
                    text: content.clone(),
                })
                .await
            }
            ParsedAction::Hotkey { keys } => {
                if keys.is_empty() {
                    return Err(missing("at least one key"));
                }
                self.send(InputEvent::Hotkey { keys: keys.clone() }).await
            }
            ParsedAction::Wait { seconds } => {
                tokio::time::sleep(Duration::from_secs(u64::from(*seconds))).await;
                Ok(())
            }
            ParsedAction::PressKey { key } => self.send(InputEvent::Key { key: key.clone() }).await,
            ParsedAction::Navigate { url } => {
                // Address bar, URL, Enter. Works in every mainstream browser.
                let modifier = if cfg!(target_os = "macos") { "cmd" } else { "ctrl" };
                self.send(InputEvent::Hotkey {
                    keys: vec![modifier.to_string(), "l".to_string()],
                })
                .await?;
                self.send(InputEvent::Type { text: url.clone() }).await?;
                self.send(InputEvent::Key {
                    key: "enter".to_string(),
                })
                .await
            }
            ParsedAction::SelectOption { target, value } => {
                if value.is_empty() {
                    return Err(missing("a value"));
                }
                match target {
                    Some(SelectTarget::At { point }) => {
                        let (x, y) = to_px(*point);
                        self.send(InputEvent::Click {
                            x,
                            y,
                            button: MouseButton::Left,
                            count: 1,
                        })
                        .await?;
                        tokio::time::sleep(SELECT_OPEN_DELAY).await;
                        self.send(InputEvent::Type { text: value.clone() }).await?;
                        self.send(InputEvent::Key {
                            key: "enter".to_string(),
                        })
                        .await
                    }
                    Some(SelectTarget::Selector { selector }) => Err(SeeFlowError::Executor(format!(
                        "selector '{selector}' cannot be resolved on the desktop; coordinates are required"
                    ))),
                    None => Err(missing("a dropdown location")),
                }
            }
            ParsedAction::WaitForElement { .. } => {
                // Nothing to poll without a DOM; the next observation decides.
                tokio::time::sleep(WAIT_FOR_ELEMENT_DELAY).await;
                Ok(())
            }
            ParsedAction::OpenApp { app_name } => {
                self.send(InputEvent::OpenApp {
                    name: app_name.clone(),
                })
                .await
            }
            ParsedAction::FocusApp { app_name } => {
                self.send(InputEvent::FocusApp {
                    name: app_name.clone(),
                })
                .await
            }
            ParsedAction::Finished { .. } | ParsedAction::CallUser { .. } => Ok(()),
        }
    }
}

#[async_trait]
impl Operator for DesktopOperator {
    async fn capture_screen(&self, source_id: Option<&str>) -> SeeFlowResult<Vec<u8>> {
        let monitor = match source_id {
            Some(id) => Some(id.trim().parse::<usize>().map_err(|_| {
                SeeFlowError::Capture(format!("invalid screen source '{id}'"))
            })?),
            None => self.config.monitor_index,
        };

        let attempts = self.config.capture_retries.max(1);
        let mut last_error = String::new();
        for attempt in 1..=attempts {
            match self.screen.capture(monitor).await {
                Ok(shot) => return Ok(shot.image_bytes),
                Err(e) => {
                    tracing::warn!(attempt, attempts, error = %e, "screen capture failed");
                    last_error = e.to_string();
                }
            }
            if attempt < attempts {
                tokio::time::sleep(Duration::from_millis(self.config.capture_retry_delay_ms)).await;
            }
        }
        Err(SeeFlowError::Capture(format!(
            "{} (last error: {last_error})",
            screenshot::permission_guidance()
        )))
    }

    async fn execute(&self, action: &ParsedAction) -> OperatorOutcome {
        match action {
            ParsedAction::Finished { .. } => return OperatorOutcome::Finished,
            ParsedAction::CallUser { .. } => return OperatorOutcome::CallUser,
            _ => {}
        }
        match self.dispatch(action).await {
            Ok(()) => OperatorOutcome::Success,
            Err(e) => {
                tracing::warn!(action = %action, error = %e, "operator action failed");
                OperatorOutcome::Failure(e.to_string())
            }
        }
    }
}
