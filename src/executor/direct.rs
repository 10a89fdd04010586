use std::sync::Arc;
use std::time::Duration;

use crate::action::types::{ScrollDirection, MAX_WAIT_SECS, MIN_WAIT_SECS};
use crate::errors::{SeeFlowError, SeeFlowResult};
use crate::executor::coordinator::DeviceContext;
use crate::executor::dispatcher::{scroll_steps, DEFAULT_SCROLL_PX};
use crate::executor::input::{InputDriver, InputEvent, MouseButton};
use crate::workflow::types::{Step, StepAction};

/// Executes fully specified steps without consulting the model.
pub struct DirectExecutor {
    driver: Arc<dyn InputDriver>,
    device: DeviceContext,
}

impl DirectExecutor {
    pub fn new(driver: Arc<dyn InputDriver>, device: DeviceContext) -> Self {
        Self { driver, device }
    }

    /// Runs the step. Returns `false` for unknown actions, missing parameters, and
    /// driver errors; never panics or propagates.
    pub async fn execute(&self, step: &Step) -> bool {
        match self.run(&step.action).await {
            Ok(()) => {
                tracing::debug!(action = step.action.name(), "direct step executed");
                true
            }
            Err(e) => {
                tracing::warn!(action = step.action.name(), error = %e, "direct step failed");
                false
            }
        }
    }

    async fn run(&self, action: &StepAction) -> SeeFlowResult<()> {
        let name = action.name();
        let incomplete = || SeeFlowError::Executor(format!("{name} is missing parameters"));
        let px = |x: &Option<i32>, y: &Option<i32>| match (x, y) {
            (Some(x), Some(y)) => Ok(self.device.step_to_physical(*x, *y)),
            _ => Err(incomplete()),
        };

        let event = match action {
            StepAction::ClickAt { x, y, .. } => {
                let (x, y) = px(x, y)?;
                InputEvent::Click {
                    x,
                    y,
                    button: MouseButton::Left,
                    count: 1,
                }
            }
            StepAction::RightClick { x, y, .. } => {
                let (x, y) = px(x, y)?;
                InputEvent::Click {
                    x,
                    y,
                    button: MouseButton::Right,
                    count: 1,
                }
            }
            StepAction::DoubleClick { x, y, .. } => {
                let (x, y) = px(x, y)?;
                InputEvent::Click {
                    x,
                    y,
                    button: MouseButton::Left,
                    count: 2,
                }
            }
            StepAction::Hover { x, y, .. } => {
                let (x, y) = px(x, y)?;
                InputEvent::MoveTo { x, y }
            }
            StepAction::Drag { x, y, x2, y2, .. } => InputEvent::Drag {
                from: px(x, y)?,
                to: px(x2, y2)?,
            },
            StepAction::TypeTextAt { text, x, y, .. } => {
                let text = text.clone().filter(|t| !t.is_empty()).ok_or_else(incomplete)?;
                let (x, y) = px(x, y)?;
                self.driver
                    .perform(InputEvent::Click {
                        x,
                        y,
                        button: MouseButton::Left,
                        count: 1,
                    })
                    .await?;
                InputEvent::Type { text }
            }
            StepAction::Scroll {
                direction,
                distance,
                x,
                y,
            } => {
                let direction = direction
                    .as_deref()
                    .and_then(ScrollDirection::parse)
                    .ok_or_else(incomplete)?;
                InputEvent::Scroll {
                    at: px(x, y).ok(),
                    direction,
                    steps: scroll_steps(distance.unwrap_or(DEFAULT_SCROLL_PX)),
                }
            }
            StepAction::Wait { seconds } => {
                let secs = seconds.ok_or_else(incomplete)?;
                tokio::time::sleep(wait_duration(secs)).await;
                return Ok(());
            }
            StepAction::PressKey { key } => InputEvent::Key {
                key: key.clone().filter(|k| !k.trim().is_empty()).ok_or_else(incomplete)?,
            },
            StepAction::Hotkey { keys, .. } => {
                if keys.is_empty() {
                    return Err(incomplete());
                }
                InputEvent::Hotkey {
                    keys: keys.iter().map(|k| k.to_lowercase()).collect(),
                }
            }
            StepAction::OpenApp { app_name } => InputEvent::OpenApp {
                name: app_name.clone().filter(|a| !a.trim().is_empty()).ok_or_else(incomplete)?,
            },
            StepAction::FocusApp { app_name } => InputEvent::FocusApp {
                name: app_name.clone().filter(|a| !a.trim().is_empty()).ok_or_else(incomplete)?,
            },
            StepAction::Navigate { .. }
            | StepAction::WaitForElement { .. }
            | StepAction::SelectOption { .. }
            | StepAction::Other { .. } => {
                return Err(SeeFlowError::Executor(format!(
                    "{name} cannot be executed directly"
                )));
            }
        };

        self.driver.perform(event).await
    }
}

/// Recorded wait lengths share the model's bounds.
fn wait_duration(seconds: f64) -> Duration {
    let secs = if seconds.is_finite() {
        seconds.clamp(f64::from(MIN_WAIT_SECS), f64::from(MAX_WAIT_SECS))
    } else {
        f64::from(MIN_WAIT_SECS)
    };
    Duration::from_secs_f64(secs)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::dispatcher::tests::RecordingDriver;

    fn executor(driver: Arc<RecordingDriver>) -> DirectExecutor {
        DirectExecutor::new(driver, DeviceContext::new(2000, 1000))
    }

    #[tokio::test]
    async fn click_at_scales_normalised_coordinates() {
        let driver = Arc::new(RecordingDriver::default());
        let ok = executor(driver.clone())
            .execute(&Step::new(StepAction::ClickAt {
                x: Some(250),
                y: Some(500),
                description: None,
            }))
            .await;
        assert!(ok);
        assert_eq!(
            driver.events.lock().expect("lock").as_slice(),
            &[InputEvent::Click {
                x: 500,
                y: 500,
                button: MouseButton::Left,
                count: 1
            }]
        );
    }

    #[tokio::test]
    async fn scroll_distance_becomes_wheel_steps() {
        let driver = Arc::new(RecordingDriver::default());
        let ok = executor(driver.clone())
            .execute(&Step::new(StepAction::Scroll {
                direction: Some("up".into()),
                distance: Some(5000),
                x: None,
                y: None,
            }))
            .await;
        assert!(ok);
        assert_eq!(
            driver.events.lock().expect("lock").as_slice(),
            &[InputEvent::Scroll {
                at: None,
                direction: ScrollDirection::Up,
                steps: 20
            }]
        );
    }

    #[tokio::test]
    async fn type_text_at_clicks_then_types() {
        let driver = Arc::new(RecordingDriver::default());
        let ok = executor(driver.clone())
            .execute(&Step::new(StepAction::TypeTextAt {
                text: Some("hello".into()),
                x: Some(0),
                y: Some(0),
                description: None,
            }))
            .await;
        assert!(ok);
        let events = driver.events.lock().expect("lock").clone();
        assert_eq!(events.len(), 2);
        assert_eq!(events[1], InputEvent::Type { text: "hello".into() });
    }

    #[tokio::test]
    async fn ineligible_steps_and_driver_errors_return_false() {
        let driver = Arc::new(RecordingDriver::default());
        let exec = executor(driver.clone());
        assert!(!exec.execute(&Step::new(StepAction::Navigate { url: Some("https://a.test".into()) })).await);
        assert!(
            !exec
                .execute(&Step::new(StepAction::Other {
                    name: "api_call".into(),
                    params: serde_json::json!({}),
                }))
                .await
        );
        assert!(driver.events.lock().expect("lock").is_empty());

        let failing = Arc::new(RecordingDriver {
            fail: true,
            ..Default::default()
        });
        assert!(
            !executor(failing)
                .execute(&Step::new(StepAction::PressKey { key: Some("enter".into()) }))
                .await
        );
    }

    #[test]
    fn wait_duration_is_clamped_to_one_through_thirty_seconds() {
        assert_eq!(wait_duration(0.0), Duration::from_secs(1));
        assert_eq!(wait_duration(0.2), Duration::from_secs(1));
        assert_eq!(wait_duration(-4.0), Duration::from_secs(1));
        assert_eq!(wait_duration(f64::NAN), Duration::from_secs(1));
        assert_eq!(wait_duration(2.5), Duration::from_millis(2500));
        assert_eq!(wait_duration(99.0), Duration::from_secs(30));
    }

    #[tokio::test]
    async fn zero_second_wait_still_waits_the_minimum() {
        let driver = Arc::new(RecordingDriver::default());
        let started = std::time::Instant::now();
        let ok = executor(driver.clone())
            .execute(&Step::new(StepAction::Wait { seconds: Some(0.0) }))
            .await;
        assert!(ok);
        assert!(started.elapsed() >= Duration::from_secs(1));
        assert!(driver.events.lock().expect("lock").is_empty());
    }
}
