use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;

use crate::action::{extract_thought, parse_action, ActionKind, ParsedAction};
use crate::agent_engine::event_bus::{ProgressEvent, ProgressKind, ProgressSink};
use crate::agent_engine::history::{build_context, HistoryEntry, RunHistory};
use crate::agent_engine::loop_control::{LoopController, RunSignals, StopReason};
use crate::agent_engine::state::{
    AttemptFailure, RunError, RunErrorKind, RunOutcome, StepResult, StepState, TerminalSignal,
};
use crate::agent_engine::status::{LogReporter, RunStatus, RunStatusReporter};
use crate::agent_engine::verify::verify_action;
use crate::config::AgentConfig;
use crate::executor::{DirectExecutor, Operator, OperatorOutcome};
use crate::llm::{generate_with_timeout, GenerateRequest, ModelRoles, Part};
use crate::perception::stability::frame_digest;
use crate::perception::{
    compress_screenshot, ground_element, perceive_scene, zoom_and_reground, CompressedImage,
    Confidence, ElementLocation,
};
use crate::prompts;
use crate::workflow::{is_deterministic, Step, StepAction, WorkflowType};

const DECISION_TEMPERATURE: f64 = 0.0;
const DECISION_MAX_TOKENS: u32 = 256;
const CALL_USER_FALLBACK: &str = "Agent requested user intervention";
const NO_VISIBLE_CHANGE: &str = "Screenshots identical after action — no visible change detected";

/// Settle time after a successful action, per action kind.
fn adaptive_settle_ms(kind: ActionKind) -> u64 {
    match kind {
        ActionKind::Click => 1500,
        ActionKind::RightClick => 400,
        ActionKind::DoubleClick => 1000,
        ActionKind::Hover => 200,
        ActionKind::Type => 100,
        ActionKind::Hotkey => 300,
        ActionKind::Scroll => 300,
        ActionKind::Drag => 400,
        ActionKind::Navigate => 2000,
        ActionKind::PressKey => 1000,
        ActionKind::SelectOption => 500,
        ActionKind::Wait | ActionKind::WaitForElement => 0,
        ActionKind::OpenApp
        | ActionKind::FocusApp
        | ActionKind::Finished
        | ActionKind::CallUser => 500,
    }
}

/// Steps whose outcome does not depend on what is on screen; no scene caption is taken.
fn is_non_visual(action: &StepAction) -> bool {
    matches!(
        action,
        StepAction::Navigate { .. }
            | StepAction::Wait { .. }
            | StepAction::PressKey { .. }
            | StepAction::Hotkey { .. }
            | StepAction::Scroll { .. }
    )
}

async fn sleep_ms(ms: u64) {
    if ms > 0 {
        tokio::time::sleep(Duration::from_millis(ms)).await;
    }
}

fn head(text: &str, max_chars: usize) -> String {
    text.chars().take(max_chars).collect()
}

enum AttemptOutcome {
    Verified {
        thought: String,
        action: String,
        after: Vec<u8>,
    },
    Signal(TerminalSignal),
    /// `trace` holds the thought and action once the reply parsed.
    Failed {
        failure: AttemptFailure,
        trace: Option<(String, String)>,
    },
    /// The operator could not produce a frame even after its own retries.
    CaptureFatal(String),
}

impl AttemptOutcome {
    fn failed(failure: AttemptFailure) -> Self {
        Self::Failed {
            failure,
            trace: None,
        }
    }

    fn failed_after(failure: AttemptFailure, thought: &str, action: &str) -> Self {
        Self::Failed {
            failure,
            trace: Some((thought.to_string(), action.to_string())),
        }
    }
}

struct RunState {
    history: RunHistory,
    trace: Vec<String>,
    steps_completed: usize,
    /// Most recent screenshot, used to prefetch the next step's scene caption.
    last_frame: Option<Vec<u8>>,
}

/// Drives a workflow through Observe → Think → Act → Verify.
pub struct AgentEngine {
    operator: Arc<dyn Operator>,
    roles: ModelRoles,
    direct: DirectExecutor,
    config: AgentConfig,
    workflow_type: WorkflowType,
    progress: ProgressSink,
    reporter: Arc<dyn RunStatusReporter>,
    signals: RunSignals,
    trace_dir: Option<PathBuf>,
}

impl AgentEngine {
    pub fn new(
        operator: Arc<dyn Operator>,
        roles: ModelRoles,
        direct: DirectExecutor,
        config: AgentConfig,
    ) -> Self {
        Self {
            operator,
            roles,
            direct,
            config,
            workflow_type: WorkflowType::default(),
            progress: ProgressSink::disabled(),
            reporter: Arc::new(LogReporter),
            signals: RunSignals::new(),
            trace_dir: None,
        }
    }

    pub fn with_workflow_type(mut self, workflow_type: WorkflowType) -> Self {
        self.workflow_type = workflow_type;
        self
    }

    pub fn with_progress(mut self, progress: ProgressSink) -> Self {
        self.progress = progress;
        self
    }

    pub fn with_reporter(mut self, reporter: Arc<dyn RunStatusReporter>) -> Self {
        self.reporter = reporter;
        self
    }

    pub fn with_signals(mut self, signals: RunSignals) -> Self {
        self.signals = signals;
        self
    }

    /// Enables the JSONL history trace in `dir`.
    pub fn with_trace_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.trace_dir = Some(dir.into());
        self
    }

    /// Handles for cancelling or redirecting this engine's runs.
    pub fn signals(&self) -> RunSignals {
        self.signals.clone()
    }

    /// Runs every step in order. The run status is reported exactly once.
    pub async fn run(&self, steps: &[Step]) -> RunOutcome {
        let controller = LoopController::new(self.signals.clone(), self.config.run_timeout());
        let history = match &self.trace_dir {
            Some(dir) => RunHistory::with_trace_dir(dir),
            None => RunHistory::new(),
        };
        tracing::info!(
            run_id = %history.run_id,
            steps = steps.len(),
            workflow_type = ?self.workflow_type,
            "run started"
        );
        let mut run = RunState {
            history,
            trace: Vec::new(),
            steps_completed: 0,
            last_frame: None,
        };

        let mut prefetch: Option<JoinHandle<String>> = None;
        let result = self
            .run_steps(steps, &controller, &mut run, &mut prefetch)
            .await;
        if let Some(task) = prefetch.take() {
            task.abort();
        }

        tracing::info!(
            run_id = %run.history.run_id,
            success = result.is_ok(),
            steps_completed = run.steps_completed,
            elapsed_ms = controller.elapsed().as_millis() as u64,
            "run finished"
        );
        self.report(&result).await;
        RunOutcome {
            success: result.is_ok(),
            error: result.err(),
            progress_trace: run.trace.join("\n"),
            steps_completed: run.steps_completed,
        }
    }

    async fn report(&self, result: &Result<(), RunError>) {
        let status = match result {
            Ok(()) => RunStatus::Completed,
            Err(e) => match e.kind {
                RunErrorKind::AgentRequested => RunStatus::AwaitingUser {
                    reason: e.reason.clone(),
                    automatic: false,
                },
                RunErrorKind::AutomaticEscalation => RunStatus::AwaitingUser {
                    reason: e.reason.clone(),
                    automatic: true,
                },
                RunErrorKind::Cancelled => RunStatus::Cancelled,
                RunErrorKind::CaptureFailure | RunErrorKind::TimedOut | RunErrorKind::Setup => {
                    RunStatus::Failed {
                        reason: e.reason.clone(),
                    }
                }
            },
        };
        if let Err(e) = self.reporter.report(status).await {
            tracing::error!(error = %e, "run status push failed");
        }
    }

    fn emit(&self, run: &mut RunState, event: ProgressEvent) {
        match event.kind {
            ProgressKind::Error => tracing::error!(step = ?event.step_index, "{}", event.message),
            ProgressKind::Warning => tracing::warn!(step = ?event.step_index, "{}", event.message),
            _ => tracing::debug!(step = ?event.step_index, "{}", event.message),
        }
        run.trace.push(event.message.clone());
        self.progress.emit(event);
    }

    async fn run_steps(
        &self,
        steps: &[Step],
        controller: &LoopController,
        run: &mut RunState,
        prefetch: &mut Option<JoinHandle<String>>,
    ) -> Result<(), RunError> {
        if steps.is_empty() {
            let err = RunError::new(RunErrorKind::Setup, "Workflow has no steps");
            self.emit(run, ProgressEvent::new(ProgressKind::Error, err.reason.clone()));
            return Err(err);
        }

        let total = steps.len();
        for (i, original) in steps.iter().enumerate() {
            let index = i + 1;

            if let Some(stop) = controller.check_boundary() {
                return Err(self.stopped(run, stop));
            }

            let redirected;
            let step = match controller.take_redirect() {
                Some(text) => {
                    self.emit(
                        run,
                        ProgressEvent::new(ProgressKind::Info, format!("Redirect received: {text}"))
                            .at_step(index),
                    );
                    redirected = Step {
                        context: format!("[User redirect]: {text}\n{}", original.context),
                        ..original.clone()
                    };
                    &redirected
                }
                None => original,
            };

            self.emit(
                run,
                ProgressEvent::new(
                    ProgressKind::StepStarted,
                    format!(
                        "Step {index}/{total}: {} - {}",
                        step.action.name(),
                        head(&step.context, 60)
                    ),
                )
                .at_step(index),
            );

            let prefetched = match prefetch.take() {
                Some(task) => task.await.ok().filter(|c| !c.is_empty()),
                None => None,
            };

            let deterministic = is_deterministic(step);
            if deterministic && self.run_direct(step, index, run).await {
                self.emit(
                    run,
                    ProgressEvent::new(
                        ProgressKind::StepCompleted,
                        format!("Step {index} complete (direct)"),
                    )
                    .at_step(index),
                );
            } else {
                if deterministic {
                    self.emit(
                        run,
                        ProgressEvent::new(
                            ProgressKind::Warning,
                            format!(
                                "Direct execution failed after {} attempts for step {index}; falling back to the agent",
                                self.config.direct_retries.max(1)
                            ),
                        )
                        .at_step(index),
                    );
                }
                match self
                    .run_agentic_step(step, index, total, prefetched, run)
                    .await
                {
                    StepResult::Succeeded => {}
                    StepResult::Signal(TerminalSignal::Finished { reason }) => {
                        run.steps_completed += 1;
                        let mut message =
                            format!("Workflow completed at step {index} (agent Finished signal)");
                        if let Some(reason) = reason {
                            message.push_str(&format!(": {reason}"));
                        }
                        self.emit(
                            run,
                            ProgressEvent::new(ProgressKind::StepCompleted, message).at_step(index),
                        );
                        return Ok(());
                    }
                    StepResult::Signal(TerminalSignal::CallUser { reason }) => {
                        self.emit(
                            run,
                            ProgressEvent::new(
                                ProgressKind::Warning,
                                format!("Agent needs user help at step {index}: {reason}"),
                            )
                            .at_step(index),
                        );
                        return Err(RunError::new(RunErrorKind::AgentRequested, reason));
                    }
                    StepResult::Escalated(err) => {
                        self.emit(
                            run,
                            ProgressEvent::new(
                                ProgressKind::Error,
                                format!("Step {index} failed: {}", err.reason),
                            )
                            .at_step(index),
                        );
                        return Err(err);
                    }
                }
            }
            run.steps_completed += 1;

            if let Some(next) = steps.get(i + 1) {
                *prefetch = self.schedule_prefetch(next, run);
                sleep_ms(self.config.inter_step_delay_ms).await;
            }
        }

        self.emit(
            run,
            ProgressEvent::new(ProgressKind::Info, "Workflow completed successfully"),
        );
        Ok(())
    }

    fn stopped(&self, run: &mut RunState, stop: StopReason) -> RunError {
        let (kind, reason) = match stop {
            StopReason::Cancelled => (RunErrorKind::Cancelled, "Run cancelled by user request".to_string()),
            StopReason::TimedOut => (
                RunErrorKind::TimedOut,
                format!("Workflow timed out after {}s", self.config.run_timeout_secs),
            ),
        };
        self.emit(run, ProgressEvent::new(ProgressKind::Warning, reason.clone()));
        RunError::new(kind, reason)
    }

    /// Runs a deterministic step with exponential backoff between tries.
    async fn run_direct(&self, step: &Step, index: usize, run: &mut RunState) -> bool {
        let attempts = self.config.direct_retries.max(1);
        for attempt in 0..attempts {
            if self.direct.execute(step).await {
                sleep_ms(self.config.settle_ms).await;
                self.record_frame(index, run).await;
                return true;
            }
            if attempt + 1 < attempts {
                self.emit(
                    run,
                    ProgressEvent::new(
                        ProgressKind::Warning,
                        format!(
                            "Direct retry {}/{attempts} for step {index} ({})",
                            attempt + 1,
                            step.action.name()
                        ),
                    )
                    .at_step(index),
                );
                sleep_ms(self.config.direct_backoff_ms.saturating_mul(1 << attempt.min(16))).await;
            }
        }
        false
    }

    /// Screenshot after a direct step. Failure here never fails the step.
    async fn record_frame(&self, index: usize, run: &mut RunState) {
        let frame = match self.operator.capture_screen(None).await {
            Ok(frame) => frame,
            Err(e) => {
                tracing::warn!(step = index, error = %e, "post-step capture failed");
                return;
            }
        };
        match compress_screenshot(&frame, self.config.max_image_dim) {
            Ok(image) => run.history.push(HistoryEntry::new(image, "", "", index)),
            Err(e) => tracing::warn!(step = index, error = %e, "post-step screenshot unusable"),
        }
        run.last_frame = Some(frame);
    }

    fn schedule_prefetch(&self, next: &Step, run: &RunState) -> Option<JoinHandle<String>> {
        if !self.config.prefetch_scene
            || is_deterministic(next)
            || (self.config.skip_scene_for_non_visual && is_non_visual(&next.action))
        {
            return None;
        }
        let frame = run.last_frame.as_ref()?;
        let image = match compress_screenshot(frame, self.config.max_image_dim) {
            Ok(image) => image,
            Err(e) => {
                tracing::debug!(error = %e, "scene prefetch skipped");
                return None;
            }
        };
        let binding = self.roles.perception.clone();
        let timeout = self.config.perception_timeout();
        tracing::debug!(next_action = next.action.name(), "scene prefetch started");
        Some(tokio::spawn(async move {
            perceive_scene(&binding, &image, timeout).await
        }))
    }

    async fn run_agentic_step(
        &self,
        step: &Step,
        index: usize,
        total: usize,
        mut prefetched: Option<String>,
        run: &mut RunState,
    ) -> StepResult {
        let max_attempts = self.config.max_retries + 1;
        let mut last_error: Option<AttemptFailure> = None;

        for attempt in 0..max_attempts {
            let state = StepState::Attempting { attempt };
            tracing::debug!(step = index, state = ?state, "step state");
            self.emit(
                run,
                ProgressEvent::new(
                    ProgressKind::Attempt,
                    format!("Step {index} attempt {}/{max_attempts}", attempt + 1),
                )
                .at_step(index),
            );

            let outcome = self
                .attempt(
                    step,
                    index,
                    total,
                    attempt,
                    last_error.as_ref(),
                    prefetched.take(),
                    &run.history,
                )
                .await;

            match outcome {
                AttemptOutcome::Verified {
                    thought,
                    action,
                    after,
                } => {
                    tracing::debug!(step = index, state = ?StepState::Succeeded, "step state");
                    match compress_screenshot(&after, self.config.max_image_dim) {
                        Ok(image) => run
                            .history
                            .push(HistoryEntry::new(image, thought.clone(), action.clone(), index)),
                        Err(e) => tracing::warn!(step = index, error = %e, "after screenshot unusable"),
                    }
                    run.last_frame = Some(after);
                    self.emit(
                        run,
                        ProgressEvent::new(
                            ProgressKind::StepCompleted,
                            format!("Step {index} complete. Thought: {}", head(&thought, 100)),
                        )
                        .at_step(index)
                        .with_trace(thought, action),
                    );
                    return StepResult::Succeeded;
                }
                AttemptOutcome::Signal(signal) => {
                    tracing::debug!(step = index, state = ?StepState::Terminated, "step state");
                    return StepResult::Signal(signal);
                }
                AttemptOutcome::CaptureFatal(message) => {
                    return StepResult::Escalated(RunError::new(
                        RunErrorKind::CaptureFailure,
                        message,
                    ));
                }
                AttemptOutcome::Failed { failure, trace } => {
                    let mut event = ProgressEvent::new(
                        ProgressKind::Warning,
                        format!("Step {index} attempt {} failed: {failure}", attempt + 1),
                    )
                    .at_step(index);
                    if let Some((thought, action)) = trace {
                        event = event.with_trace(thought, action);
                    }
                    self.emit(run, event);
                    if attempt < self.config.max_retries {
                        let delay = match &failure {
                            AttemptFailure::ModelCall(_) => self
                                .config
                                .retry_backoff_ms
                                .saturating_mul(u64::from(attempt) + 1),
                            AttemptFailure::Parse(_) => self.config.parse_retry_delay_ms,
                            _ => 0,
                        };
                        sleep_ms(delay).await;
                    }
                    last_error = Some(failure);
                }
            }
        }

        let reason = format!(
            "Stuck after {max_attempts} attempts — {}",
            last_error
                .map(|e| e.to_string())
                .unwrap_or_else(|| "no clear reason".to_string())
        );
        let state = StepState::Escalated {
            reason: reason.clone(),
        };
        tracing::debug!(step = index, state = ?state, "step state");
        StepResult::Escalated(RunError::new(RunErrorKind::AutomaticEscalation, reason))
    }

    #[allow(clippy::too_many_arguments)]
    async fn attempt(
        &self,
        step: &Step,
        index: usize,
        total: usize,
        attempt: u32,
        last_error: Option<&AttemptFailure>,
        prefetched: Option<String>,
        history: &RunHistory,
    ) -> AttemptOutcome {
        // Observe
        let before = match self.operator.capture_screen(None).await {
            Ok(frame) => frame,
            Err(e) => return AttemptOutcome::CaptureFatal(e.to_string()),
        };
        let current = match compress_screenshot(&before, self.config.max_image_dim) {
            Ok(image) => image,
            Err(e) => {
                return AttemptOutcome::failed(AttemptFailure::Capture(format!(
                    "Screenshot unusable: {e}"
                )))
            }
        };
        let caption = match (attempt, prefetched) {
            (0, Some(caption)) => caption,
            (0, None) => self.scene_caption(step, &current).await,
            _ => String::new(),
        };

        // Think
        let raw = match self
            .decide(step, index, total, attempt, &caption, &current, last_error, history)
            .await
        {
            Ok(raw) => raw,
            Err(failure) => return AttemptOutcome::failed(failure),
        };
        let thought = extract_thought(&raw);
        let Some(parsed) = parse_action(&raw) else {
            return AttemptOutcome::failed(AttemptFailure::Parse(format!(
                "Could not parse action from model output: {}",
                head(&raw, 200)
            )));
        };
        let (action, location) = self.ground(step, index, parsed, &before, &current).await;
        let action_str = action.to_string();

        // Act
        tracing::info!(step = index, attempt, action = %action_str, "executing action");
        match self.operator.execute(&action).await {
            OperatorOutcome::Success => {}
            OperatorOutcome::Finished => {
                let reason = match &action {
                    ParsedAction::Finished { reason } => reason.clone(),
                    _ => None,
                };
                return AttemptOutcome::Signal(TerminalSignal::Finished { reason });
            }
            OperatorOutcome::CallUser => {
                return AttemptOutcome::Signal(TerminalSignal::CallUser {
                    reason: call_user_reason(&action, &thought),
                });
            }
            OperatorOutcome::Failure(message) => {
                return AttemptOutcome::failed_after(
                    AttemptFailure::Operator(format!(
                        "Operator failed for action {action_str}: {message}"
                    )),
                    &thought,
                    &action_str,
                );
            }
        }

        // Verify
        sleep_ms(self.settle_delay(action.kind())).await;
        let mut after = match self.operator.capture_screen(None).await {
            Ok(frame) => frame,
            Err(e) => return AttemptOutcome::CaptureFatal(e.to_string()),
        };

        let exempt = matches!(action.kind(), ActionKind::Wait | ActionKind::WaitForElement);
        if self.config.require_visible_change && !exempt {
            let before_digest = frame_digest(&before);
            if frame_digest(&after) == before_digest {
                tracing::warn!(step = index, attempt, "pixel digest unchanged after action");
                sleep_ms(
                    self.config
                        .unchanged_recheck_ms
                        .saturating_mul(u64::from(attempt) + 1),
                )
                .await;
                match self.operator.capture_screen(None).await {
                    Ok(frame) if frame_digest(&frame) != before_digest => {
                        tracing::info!(step = index, attempt, "change detected after extra wait");
                        after = frame;
                    }
                    Ok(_) => {
                        return AttemptOutcome::failed_after(
                            AttemptFailure::Operator(NO_VISIBLE_CHANGE.to_string()),
                            &thought,
                            &action_str,
                        )
                    }
                    Err(e) => return AttemptOutcome::CaptureFatal(e.to_string()),
                }
            }
        }

        if location
            .as_ref()
            .is_some_and(|l| l.confidence == Confidence::High)
        {
            tracing::info!(step = index, "skipping verification after high-confidence grounding");
        } else {
            let verdict = verify_action(
                &self.roles.verification,
                &before,
                &after,
                &action_str,
                &step.expected_outcome,
                self.config.verify_image_dim,
                self.config.model_timeout(),
            )
            .await;
            tracing::info!(step = index, transition = %head(verdict.description(), 120), "state transition");
            if !verdict.is_success() {
                return AttemptOutcome::failed_after(
                    AttemptFailure::Verification(format!(
                        "Action appeared to have no effect: {}",
                        head(verdict.description(), 200)
                    )),
                    &thought,
                    &action_str,
                );
            }
        }

        AttemptOutcome::Verified {
            thought,
            action: action_str,
            after,
        }
    }

    async fn scene_caption(&self, step: &Step, current: &CompressedImage) -> String {
        if self.config.skip_scene_for_non_visual && is_non_visual(&step.action) {
            return String::new();
        }
        perceive_scene(&self.roles.perception, current, self.config.perception_timeout()).await
    }

    #[allow(clippy::too_many_arguments)]
    async fn decide(
        &self,
        step: &Step,
        index: usize,
        total: usize,
        attempt: u32,
        caption: &str,
        current: &CompressedImage,
        last_error: Option<&AttemptFailure>,
        history: &RunHistory,
    ) -> Result<String, AttemptFailure> {
        let instruction = prompts::step_instruction(step, index, total);
        let system = prompts::system_prompt(&instruction, self.workflow_type);
        let window = build_context(history.entries(), self.config.history_images);

        let mut parts = Vec::with_capacity(window.images.len() + 4);
        let summary = prompts::history_summary_text(&window.summary);
        if !summary.is_empty() {
            parts.push(Part::text(summary));
        }
        for image in window.images {
            parts.push(Part::image(image.bytes, image.mime_type));
        }
        let instruction = if attempt == 0 && !caption.is_empty() {
            format!("[Scene Overview]\n{caption}\n\n{instruction}")
        } else {
            instruction
        };
        parts.push(Part::text(instruction));
        parts.push(Part::image(current.bytes.clone(), current.mime_type.clone()));
        if let Some(err) = last_error {
            parts.push(Part::text(format!("Previous attempt failed: {err}")));
        }

        let request = GenerateRequest {
            model: self.roles.decision.model.clone(),
            system_prompt: Some(system),
            parts,
            temperature: DECISION_TEMPERATURE,
            max_output_tokens: DECISION_MAX_TOKENS,
            json_response: false,
        };
        tracing::debug!(
            step = index,
            attempt,
            images = request.image_count(),
            "decision call"
        );

        match generate_with_timeout(
            self.roles.decision.client.as_ref(),
            request,
            self.config.model_timeout(),
        )
        .await
        {
            Ok(response) if !response.text.trim().is_empty() => Ok(response.text),
            Ok(_) => Err(AttemptFailure::ModelCall("Empty model response".into())),
            Err(e) => Err(AttemptFailure::ModelCall(e.to_string())),
        }
    }

    /// Refines the coordinates of click-shaped actions. Only high or medium
    /// confidence replaces the model's own point.
    async fn ground(
        &self,
        step: &Step,
        index: usize,
        action: ParsedAction,
        raw_frame: &[u8],
        current: &CompressedImage,
    ) -> (ParsedAction, Option<ElementLocation>) {
        let kind = action.kind();
        if !kind.is_grounding_eligible() {
            return (action, None);
        }

        let target = match step.action.description() {
            Some(description) => description.to_string(),
            None if !step.context.trim().is_empty() => step.context.clone(),
            None => kind.name().to_string(),
        };
        let timeout = self.config.perception_timeout();
        let Some(mut location) =
            ground_element(&self.roles.perception, current, &target, timeout).await
        else {
            return (action, None);
        };

        if location.confidence == Confidence::Medium {
            if let Some(refined) = zoom_and_reground(
                &self.roles.perception,
                raw_frame,
                &location,
                &target,
                timeout,
            )
            .await
            {
                tracing::info!(
                    step = index,
                    confidence = ?refined.confidence,
                    x = refined.center_x,
                    y = refined.center_y,
                    "zoom re-grounding applied"
                );
                location = refined;
            }
        }

        if !location.confidence.can_override() {
            tracing::debug!(step = index, "low-confidence grounding ignored");
            return (action, Some(location));
        }
        tracing::info!(
            step = index,
            confidence = ?location.confidence,
            x = location.center_x,
            y = location.center_y,
            "grounding override"
        );
        (action.with_grounded_point(location.center()), Some(location))
    }

    fn settle_delay(&self, kind: ActionKind) -> u64 {
        if self.config.adaptive_settle {
            adaptive_settle_ms(kind)
        } else {
            self.config.settle_ms
        }
    }
}

/// The action's own argument, else the cleaned thought, else a fixed message.
fn call_user_reason(action: &ParsedAction, thought: &str) -> String {
    if let ParsedAction::CallUser {
        reason: Some(reason),
    } = action
    {
        if !reason.trim().is_empty() {
            return reason.trim().to_string();
        }
    }
    let cleaned = prompts::clean_call_user_reason(thought);
    if cleaned.is_empty() {
        CALL_USER_FALLBACK.to_string()
    } else {
        cleaned
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::action::Point;
    use crate::agent_engine::event_bus::progress_channel;
    use crate::errors::{SeeFlowError, SeeFlowResult};
    use crate::executor::coordinator::DeviceContext;
    use crate::executor::dispatcher::tests::RecordingDriver;
    use crate::llm::{GenerateResponse, ModelClient};
    use async_trait::async_trait;
    use std::collections::VecDeque;
    use std::sync::Mutex;

    fn frame(shade: u8) -> Vec<u8> {
        let img = image::RgbImage::from_pixel(32, 32, image::Rgb([shade, 40, 80]));
        let mut out = Vec::new();
        image::DynamicImage::ImageRgb8(img)
            .write_to(&mut std::io::Cursor::new(&mut out), image::ImageFormat::Png)
            .expect("encode");
        out
    }

    #[derive(Default)]
    struct MockOperator {
        captures: Mutex<u32>,
        executed: Mutex<Vec<ParsedAction>>,
        static_frames: bool,
        capture_fails: bool,
        action_fails: bool,
    }

    impl MockOperator {
        fn executed(&self) -> Vec<ParsedAction> {
            self.executed.lock().expect("lock").clone()
        }
    }

    #[async_trait]
    impl Operator for MockOperator {
        async fn capture_screen(&self, _source_id: Option<&str>) -> SeeFlowResult<Vec<u8>> {
            if self.capture_fails {
                return Err(SeeFlowError::Capture("no usable frame; grant screen recording".into()));
            }
            let mut n = self.captures.lock().expect("lock");
            *n += 1;
            Ok(frame(if self.static_frames { 0 } else { (*n % 250) as u8 }))
        }

        async fn execute(&self, action: &ParsedAction) -> OperatorOutcome {
            self.executed.lock().expect("lock").push(action.clone());
            match action {
                ParsedAction::Finished { .. } => OperatorOutcome::Finished,
                ParsedAction::CallUser { .. } => OperatorOutcome::CallUser,
                _ if self.action_fails => OperatorOutcome::Failure("element not found".into()),
                _ => OperatorOutcome::Success,
            }
        }
    }

    /// Answers by request shape: decision calls carry a system prompt, grounding asks
    /// for JSON, verification sends a BEFORE/AFTER pair, anything else is a caption.
    struct RoutedModel {
        decisions: Mutex<VecDeque<String>>,
        grounding: String,
        verdict: String,
        verify_calls: Mutex<u32>,
        decision_prompts: Mutex<Vec<String>>,
        decision_delay: Duration,
    }

    impl RoutedModel {
        fn new(decisions: &[&str]) -> Self {
            Self {
                decisions: Mutex::new(decisions.iter().map(|d| d.to_string()).collect()),
                grounding: "{}".into(),
                verdict: "DESCRIPTION: the dialog opened\nVERDICT: success".into(),
                verify_calls: Mutex::new(0),
                decision_prompts: Mutex::new(Vec::new()),
                decision_delay: Duration::ZERO,
            }
        }
    }

    #[async_trait]
    impl ModelClient for RoutedModel {
        fn name(&self) -> &str {
            "routed"
        }

        async fn generate_content(&self, request: GenerateRequest) -> SeeFlowResult<GenerateResponse> {
            let text = if let Some(system) = request.system_prompt {
                self.decision_prompts.lock().expect("lock").push(system);
                if !self.decision_delay.is_zero() {
                    tokio::time::sleep(self.decision_delay).await;
                }
                let mut queue = self.decisions.lock().expect("lock");
                match queue.len() {
                    0 => return Err(SeeFlowError::ModelProvider("script exhausted".into())),
                    1 => queue[0].clone(),
                    _ => queue.pop_front().unwrap_or_default(),
                }
            } else if request.json_response {
                self.grounding.clone()
            } else if request
                .parts
                .iter()
                .any(|p| matches!(p, Part::Text(t) if t == "BEFORE screenshot:"))
            {
                *self.verify_calls.lock().expect("lock") += 1;
                self.verdict.clone()
            } else {
                "A settings window with a Save button".into()
            };
            Ok(GenerateResponse { text })
        }
    }

    #[derive(Default)]
    struct RecordingReporter {
        statuses: Mutex<Vec<RunStatus>>,
    }

    #[async_trait]
    impl RunStatusReporter for RecordingReporter {
        async fn report(&self, status: RunStatus) -> SeeFlowResult<()> {
            self.statuses.lock().expect("lock").push(status);
            Ok(())
        }
    }

    fn test_config() -> AgentConfig {
        AgentConfig {
            prefetch_scene: false,
            ..AgentConfig::without_delays()
        }
    }

    fn engine(op: Arc<MockOperator>, model: Arc<RoutedModel>) -> AgentEngine {
        let direct = DirectExecutor::new(
            Arc::new(RecordingDriver::default()),
            DeviceContext::new(1000, 1000),
        );
        AgentEngine::new(op, ModelRoles::uniform(model, "test-model"), direct, test_config())
    }

    fn agentic(context: &str) -> Step {
        Step::new(StepAction::ClickAt {
            x: None,
            y: None,
            description: Some("the Save button".into()),
        })
        .with_context(context)
    }

    #[tokio::test]
    async fn retries_are_bounded_then_escalated() {
        let op = Arc::new(MockOperator::default());
        let model = Arc::new(RoutedModel {
            verdict: "DESCRIPTION: nothing happened\nVERDICT: failed".into(),
            ..RoutedModel::new(&["Thought: click save\nAction: click(100, 100)"])
        });
        let reporter = Arc::new(RecordingReporter::default());
        let outcome = engine(op.clone(), model.clone())
            .with_reporter(reporter.clone())
            .run(&[agentic("Save the file")])
            .await;

        assert!(!outcome.success);
        assert_eq!(op.executed().len(), 4);
        assert_eq!(*model.verify_calls.lock().expect("lock"), 4);
        let err = outcome.error.expect("error");
        assert_eq!(err.kind, RunErrorKind::AutomaticEscalation);
        assert!(err
            .reason
            .starts_with("Stuck after 4 attempts — Action appeared to have no effect"));
        assert_eq!(
            reporter.statuses.lock().expect("lock").as_slice(),
            &[RunStatus::AwaitingUser {
                reason: err.reason.clone(),
                automatic: true
            }]
        );
    }

    #[tokio::test]
    async fn operator_failures_are_retried_then_escalated() {
        let op = Arc::new(MockOperator {
            action_fails: true,
            ..Default::default()
        });
        let model = Arc::new(RoutedModel::new(&["Thought: click save\nAction: click(100, 100)"]));
        let (progress, mut events) = progress_channel(64);
        let engine = engine(op.clone(), model.clone()).with_progress(progress);
        let outcome = engine.run(&[agentic("Save the file")]).await;
        drop(engine);

        assert!(!outcome.success);
        assert_eq!(op.executed().len(), 4);
        assert_eq!(model.decision_prompts.lock().expect("lock").len(), 4);
        assert_eq!(*model.verify_calls.lock().expect("lock"), 0);
        let err = outcome.error.expect("error");
        assert_eq!(err.kind, RunErrorKind::AutomaticEscalation);
        assert!(err.reason.starts_with(
            "Stuck after 4 attempts — Operator failed for action click(100, 100): element not found"
        ));

        let mut failed = Vec::new();
        while let Some(event) = events.recv().await {
            if event.kind == ProgressKind::Warning && event.message.contains("failed:") {
                failed.push(event);
            }
        }
        assert_eq!(failed.len(), 4);
        for event in &failed {
            assert_eq!(event.thought.as_deref(), Some("click save"));
            assert_eq!(event.action.as_deref(), Some("click(100, 100)"));
        }
    }

    #[tokio::test]
    async fn failed_parse_events_carry_no_trace() {
        let op = Arc::new(MockOperator::default());
        let model = Arc::new(RoutedModel::new(&["no idea"]));
        let (progress, mut events) = progress_channel(64);
        let engine = engine(op.clone(), model).with_progress(progress);
        let outcome = engine.run(&[agentic("Save the file")]).await;
        drop(engine);

        assert_eq!(outcome.error.expect("error").kind, RunErrorKind::AutomaticEscalation);
        assert!(op.executed().is_empty());
        while let Some(event) = events.recv().await {
            if event.kind == ProgressKind::Warning {
                assert!(event.action.is_none());
            }
        }
    }

    #[tokio::test]
    async fn slow_decision_calls_time_out_and_are_retried() {
        let op = Arc::new(MockOperator::default());
        let model = Arc::new(RoutedModel {
            decision_delay: Duration::from_millis(300),
            ..RoutedModel::new(&["Thought: save\nAction: click(100, 200)"])
        });
        let config = AgentConfig {
            model_timeout_ms: 20,
            ..test_config()
        };
        let direct = DirectExecutor::new(
            Arc::new(RecordingDriver::default()),
            DeviceContext::new(1000, 1000),
        );
        let outcome = AgentEngine::new(
            op.clone(),
            ModelRoles::uniform(model.clone(), "test-model"),
            direct,
            config,
        )
        .run(&[agentic("Save the file")])
        .await;

        assert!(!outcome.success);
        assert_eq!(model.decision_prompts.lock().expect("lock").len(), 4);
        assert!(op.executed().is_empty());
        let err = outcome.error.expect("error");
        assert_eq!(err.kind, RunErrorKind::AutomaticEscalation);
        assert!(err.reason.contains("Timed out after 20 ms"), "{}", err.reason);
    }

    #[tokio::test]
    async fn failed_direct_step_falls_back_to_the_agent() {
        let op = Arc::new(MockOperator::default());
        let model = Arc::new(RoutedModel::new(&["Thought: the button is there\nAction: click(500, 500)"]));
        let driver = Arc::new(RecordingDriver {
            fail: true,
            ..Default::default()
        });
        let engine = AgentEngine::new(
            op.clone(),
            ModelRoles::uniform(model.clone(), "test-model"),
            DirectExecutor::new(driver.clone(), DeviceContext::new(1000, 1000)),
            test_config(),
        );
        let step = Step::new(StepAction::ClickAt {
            x: Some(500),
            y: Some(500),
            description: None,
        })
        .with_context("Press Save");
        let outcome = engine.run(&[step]).await;

        assert!(outcome.success);
        assert_eq!(outcome.steps_completed, 1);
        assert_eq!(driver.events.lock().expect("lock").len(), 3);
        assert_eq!(model.decision_prompts.lock().expect("lock").len(), 1);
        assert_eq!(
            op.executed(),
            vec![ParsedAction::Click {
                at: Some(Point::new(500, 500))
            }]
        );
        assert!(outcome.progress_trace.contains("falling back to the agent"));
        assert!(!outcome.progress_trace.contains("complete (direct)"));
    }

    #[tokio::test]
    async fn finished_on_second_attempt_ends_the_run() {
        let op = Arc::new(MockOperator::default());
        let model = Arc::new(RoutedModel::new(&[
            "I am not sure what to do here.",
            "Thought: already saved\nAction: finished()",
        ]));
        let outcome = engine(op.clone(), model)
            .run(&[agentic("Save the file"), agentic("Close the dialog")])
            .await;

        assert!(outcome.success);
        assert!(outcome.error.is_none());
        assert_eq!(outcome.steps_completed, 1);
        assert_eq!(op.executed(), vec![ParsedAction::Finished { reason: None }]);
        assert!(outcome
            .progress_trace
            .contains("Could not parse action from model output: I am not sure"));
        assert!(!outcome.progress_trace.contains("Step 2/2"));
    }

    #[tokio::test]
    async fn low_confidence_grounding_keeps_model_coordinates() {
        let op = Arc::new(MockOperator::default());
        let model = Arc::new(RoutedModel {
            grounding: r#"{"center_x": 900, "center_y": 900, "confidence": "low"}"#.into(),
            ..RoutedModel::new(&["Thought: save\nAction: click(100, 200)"])
        });
        let outcome = engine(op.clone(), model.clone())
            .run(&[agentic("Save the file")])
            .await;

        assert!(outcome.success);
        assert_eq!(
            op.executed(),
            vec![ParsedAction::Click {
                at: Some(Point::new(100, 200))
            }]
        );
        assert_eq!(*model.verify_calls.lock().expect("lock"), 1);
    }

    #[tokio::test]
    async fn high_confidence_grounding_overrides_and_skips_verification() {
        let op = Arc::new(MockOperator::default());
        let model = Arc::new(RoutedModel {
            grounding: r#"{"center_x": 900, "center_y": 850, "box_2d": [830, 880, 870, 920], "confidence": "high"}"#
                .into(),
            ..RoutedModel::new(&["Thought: save\nAction: click(100, 200)"])
        });
        let outcome = engine(op.clone(), model.clone())
            .run(&[agentic("Save the file")])
            .await;

        assert!(outcome.success);
        assert_eq!(
            op.executed(),
            vec![ParsedAction::Click {
                at: Some(Point::new(900, 850))
            }]
        );
        assert_eq!(*model.verify_calls.lock().expect("lock"), 0);
    }

    #[tokio::test]
    async fn missing_verdict_counts_as_success() {
        let op = Arc::new(MockOperator::default());
        let model = Arc::new(RoutedModel {
            verdict: "The page looks different now.".into(),
            ..RoutedModel::new(&["Thought: save\nAction: click(100, 200)"])
        });
        let outcome = engine(op.clone(), model).run(&[agentic("Save the file")]).await;
        assert!(outcome.success);
        assert_eq!(op.executed().len(), 1);
    }

    #[tokio::test]
    async fn identical_frames_fail_the_attempt() {
        let op = Arc::new(MockOperator {
            static_frames: true,
            ..Default::default()
        });
        let model = Arc::new(RoutedModel::new(&["Thought: save\nAction: click(100, 200)"]));
        let outcome = engine(op.clone(), model.clone())
            .run(&[agentic("Save the file")])
            .await;
        let err = outcome.error.expect("error");
        assert_eq!(err.kind, RunErrorKind::AutomaticEscalation);
        assert!(err.reason.contains("no visible change detected"));
        assert_eq!(*model.verify_calls.lock().expect("lock"), 0);
    }

    #[tokio::test]
    async fn wait_is_exempt_from_the_visible_change_check() {
        let op = Arc::new(MockOperator {
            static_frames: true,
            ..Default::default()
        });
        let model = Arc::new(RoutedModel::new(&["Thought: page loading\nAction: wait(1)"]));
        let outcome = engine(op.clone(), model).run(&[agentic("Wait for the page")]).await;
        assert!(outcome.success);
        assert_eq!(op.executed(), vec![ParsedAction::Wait { seconds: 1 }]);
    }

    #[tokio::test]
    async fn call_user_ends_run_with_agent_reason() {
        let op = Arc::new(MockOperator::default());
        let model = Arc::new(RoutedModel::new(&[
            "Thought: I need the one-time code from the user\nAction: calluser()",
        ]));
        let reporter = Arc::new(RecordingReporter::default());
        let outcome = engine(op, model)
            .with_reporter(reporter.clone())
            .run(&[agentic("Log in"), agentic("Open settings")])
            .await;
        let err = outcome.error.expect("error");
        assert_eq!(err.kind, RunErrorKind::AgentRequested);
        assert_eq!(err.reason, "I need the one-time code from the user");
        assert_eq!(reporter.statuses.lock().expect("lock").len(), 1);
    }

    #[tokio::test]
    async fn capture_failure_ends_the_run() {
        let op = Arc::new(MockOperator {
            capture_fails: true,
            ..Default::default()
        });
        let model = Arc::new(RoutedModel::new(&["Action: click(1, 1)"]));
        let reporter = Arc::new(RecordingReporter::default());
        let outcome = engine(op.clone(), model)
            .with_reporter(reporter.clone())
            .run(&[agentic("Save the file")])
            .await;
        let err = outcome.error.expect("error");
        assert_eq!(err.kind, RunErrorKind::CaptureFailure);
        assert!(err.reason.contains("grant screen recording"));
        assert!(op.executed().is_empty());
        assert!(matches!(
            reporter.statuses.lock().expect("lock").as_slice(),
            [RunStatus::Failed { .. }]
        ));
    }

    #[tokio::test]
    async fn cancelled_before_start_runs_nothing() {
        let op = Arc::new(MockOperator::default());
        let model = Arc::new(RoutedModel::new(&["Action: click(1, 1)"]));
        let reporter = Arc::new(RecordingReporter::default());
        let engine = engine(op.clone(), model).with_reporter(reporter.clone());
        engine.signals().cancel();
        let outcome = engine.run(&[agentic("Save the file")]).await;

        assert_eq!(outcome.error.expect("error").kind, RunErrorKind::Cancelled);
        assert!(op.executed().is_empty());
        assert_eq!(
            reporter.statuses.lock().expect("lock").as_slice(),
            &[RunStatus::Cancelled]
        );
    }

    #[tokio::test]
    async fn redirect_is_prepended_to_step_context() {
        let op = Arc::new(MockOperator::default());
        let model = Arc::new(RoutedModel::new(&["Thought: ok\nAction: click(10, 10)"]));
        let engine = engine(op, model.clone());
        engine.signals().redirect("use the toolbar icon instead");
        let outcome = engine.run(&[agentic("Save the file")]).await;

        assert!(outcome.success);
        let prompts = model.decision_prompts.lock().expect("lock");
        assert!(prompts[0].contains("[User redirect]: use the toolbar icon instead\nSave the file"));
    }

    #[tokio::test]
    async fn deterministic_step_skips_the_model() {
        let op = Arc::new(MockOperator::default());
        let model = Arc::new(RoutedModel::new(&[]));
        let step = Step::new(StepAction::ClickAt {
            x: Some(500),
            y: Some(500),
            description: None,
        });
        let outcome = engine(op.clone(), model.clone()).run(&[step]).await;

        assert!(outcome.success);
        assert_eq!(outcome.steps_completed, 1);
        assert!(op.executed().is_empty());
        assert!(model.decision_prompts.lock().expect("lock").is_empty());
        assert!(outcome.progress_trace.contains("Step 1 complete (direct)"));
    }

    #[tokio::test]
    async fn empty_workflow_is_a_setup_error() {
        let op = Arc::new(MockOperator::default());
        let model = Arc::new(RoutedModel::new(&[]));
        let outcome = engine(op, model).run(&[]).await;
        assert_eq!(outcome.error.expect("error").kind, RunErrorKind::Setup);
    }

    #[test]
    fn call_user_reason_prefers_argument_then_thought() {
        let with_arg = ParsedAction::CallUser {
            reason: Some("Captcha on screen".into()),
        };
        assert_eq!(call_user_reason(&with_arg, "Thought: x"), "Captcha on screen");
        let bare = ParsedAction::CallUser { reason: None };
        assert_eq!(call_user_reason(&bare, "Reflection: login wall"), "login wall");
        assert_eq!(call_user_reason(&bare, ""), CALL_USER_FALLBACK);
    }
}
