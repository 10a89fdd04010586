use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Lifecycle of a single workflow step inside the orchestrator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum StepState {
    Attempting { attempt: u32 },
    Succeeded,
    Escalated { reason: String },
    /// A terminal signal (finished / calluser) ended the whole run.
    Terminated,
}

/// Why one attempt did not succeed. Always absorbed and folded into the next prompt.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AttemptFailure {
    #[error("{0}")]
    Capture(String),
    #[error("{0}")]
    ModelCall(String),
    #[error("{0}")]
    Parse(String),
    #[error("{0}")]
    Operator(String),
    #[error("{0}")]
    Verification(String),
}

/// Model-issued signal that ends the run regardless of remaining steps.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TerminalSignal {
    Finished { reason: Option<String> },
    CallUser { reason: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunErrorKind {
    /// The model asked for a human via `CallUser`.
    AgentRequested,
    /// Retries were exhausted on a step.
    AutomaticEscalation,
    CaptureFailure,
    Cancelled,
    TimedOut,
    Setup,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunError {
    pub kind: RunErrorKind,
    pub reason: String,
}

impl RunError {
    pub fn new(kind: RunErrorKind, reason: impl Into<String>) -> Self {
        Self {
            kind,
            reason: reason.into(),
        }
    }
}

/// Final result of [`AgentEngine::run`](super::engine::AgentEngine::run).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunOutcome {
    pub success: bool,
    pub error: Option<RunError>,
    /// Newline-joined human-readable trace of everything the run reported.
    pub progress_trace: String,
    pub steps_completed: usize,
}

/// Result of one agentic step.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum StepResult {
    Succeeded,
    Signal(TerminalSignal),
    Escalated(RunError),
}
