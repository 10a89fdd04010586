pub mod engine;
pub mod event_bus;
pub mod history;
pub mod loop_control;
pub mod state;
pub mod status;
pub mod verify;

pub use engine::AgentEngine;
pub use event_bus::{
    progress_channel, ProgressEvent, ProgressKind, ProgressSink, DEFAULT_PROGRESS_CAPACITY,
};
pub use history::{build_context, ContextWindow, HistoryEntry, RunHistory};
pub use loop_control::{LoopController, RunSignals, StopReason};
pub use state::{AttemptFailure, RunError, RunErrorKind, RunOutcome, StepState, TerminalSignal};
pub use status::{JsonFileReporter, LogReporter, RunStatus, RunStatusReporter};
pub use verify::{verify_action, Verdict};
