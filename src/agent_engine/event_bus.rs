use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

pub const DEFAULT_PROGRESS_CAPACITY: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProgressKind {
    StepStarted,
    Attempt,
    StepCompleted,
    Info,
    Warning,
    Error,
}

/// One progress notification for the host. Image bytes are never carried.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgressEvent {
    pub message: String,
    pub step_index: Option<usize>,
    pub thought: Option<String>,
    pub action: Option<String>,
    pub kind: ProgressKind,
}

impl ProgressEvent {
    pub fn new(kind: ProgressKind, message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            step_index: None,
            thought: None,
            action: None,
            kind,
        }
    }

    pub fn at_step(mut self, step_index: usize) -> Self {
        self.step_index = Some(step_index);
        self
    }

    pub fn with_trace(mut self, thought: impl Into<String>, action: impl Into<String>) -> Self {
        self.thought = Some(thought.into());
        self.action = Some(action.into());
        self
    }
}

/// Best-effort sender side of the progress channel.
///
/// Emission never blocks the agent loop: a full or closed channel drops the event
/// and logs it.
#[derive(Debug, Clone, Default)]
pub struct ProgressSink {
    tx: Option<mpsc::Sender<ProgressEvent>>,
}

impl ProgressSink {
    pub fn new(tx: mpsc::Sender<ProgressEvent>) -> Self {
        Self { tx: Some(tx) }
    }

    /// A sink that discards everything.
    pub fn disabled() -> Self {
        Self { tx: None }
    }

    pub fn emit(&self, event: ProgressEvent) {
        let Some(tx) = &self.tx else {
            return;
        };
        if let Err(e) = tx.try_send(event) {
            let reason = match &e {
                mpsc::error::TrySendError::Full(_) => "full",
                mpsc::error::TrySendError::Closed(_) => "closed",
            };
            tracing::debug!(reason, "progress event dropped");
        }
    }
}

/// Bounded progress channel.
pub fn progress_channel(capacity: usize) -> (ProgressSink, mpsc::Receiver<ProgressEvent>) {
    let (tx, rx) = mpsc::channel(capacity.max(1));
    (ProgressSink::new(tx), rx)
}
