use std::io::Write;
use std::path::{Path, PathBuf};

use serde::Serialize;

use crate::errors::SeeFlowResult;
use crate::perception::compress::CompressedImage;

const SUMMARY_THOUGHT_CHARS: usize = 200;
const SUMMARY_ACTION_CHARS: usize = 80;

/// One completed step as the model will see it in later prompts.
#[derive(Debug, Clone, PartialEq)]
pub struct HistoryEntry {
    pub screenshot: CompressedImage,
    pub thought: String,
    pub action: String,
    pub step_index: usize,
    pub ts: i64,
}

impl HistoryEntry {
    pub fn new(
        screenshot: CompressedImage,
        thought: impl Into<String>,
        action: impl Into<String>,
        step_index: usize,
    ) -> Self {
        Self {
            screenshot,
            thought: thought.into(),
            action: action.into(),
            step_index,
            ts: chrono::Utc::now().timestamp_millis(),
        }
    }
}

/// JSONL line written per entry; image bytes are left out.
#[derive(Serialize)]
struct TraceLine<'a> {
    run_id: &'a str,
    ts: i64,
    step_index: usize,
    thought: &'a str,
    action: &'a str,
    mime_type: &'a str,
    image_bytes: usize,
}

/// Append-only history of one run.
pub struct RunHistory {
    pub run_id: String,
    entries: Vec<HistoryEntry>,
    trace_path: Option<PathBuf>,
}

impl RunHistory {
    /// In-memory history only.
    pub fn new() -> Self {
        Self {
            run_id: uuid::Uuid::new_v4().to_string(),
            entries: Vec::new(),
            trace_path: None,
        }
    }

    /// History that also appends every entry to `<dir>/run_<id>.jsonl`.
    pub fn with_trace_dir(dir: &Path) -> Self {
        let mut history = Self::new();
        if let Err(e) = std::fs::create_dir_all(dir) {
            tracing::warn!(dir = %dir.display(), error = %e, "trace dir unavailable; tracing disabled");
            return history;
        }
        history.trace_path = Some(dir.join(format!("run_{}.jsonl", history.run_id)));
        history
    }

    pub fn entries(&self) -> &[HistoryEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn trace_path(&self) -> Option<&Path> {
        self.trace_path.as_deref()
    }

    pub fn push(&mut self, entry: HistoryEntry) {
        self.entries.push(entry);
        if let Err(e) = self.flush() {
            tracing::warn!(error = %e, "history trace flush failed");
        }
    }

    /// Append the latest entry to the JSONL trace file.
    fn flush(&self) -> SeeFlowResult<()> {
        let (Some(path), Some(last)) = (&self.trace_path, self.entries.last()) else {
            return Ok(());
        };
        let line = serde_json::to_string(&TraceLine {
            run_id: &self.run_id,
            ts: last.ts,
            step_index: last.step_index,
            thought: &last.thought,
            action: &last.action,
            mime_type: &last.screenshot.mime_type,
            image_bytes: last.screenshot.bytes.len(),
        })?;
        let mut file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)?;
        writeln!(file, "{line}")?;
        tracing::debug!(path = %path.display(), "history entry flushed");
        Ok(())
    }
}

impl Default for RunHistory {
    fn default() -> Self {
        Self::new()
    }
}

/// Images and text summary sent alongside the current screenshot.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ContextWindow {
    pub images: Vec<CompressedImage>,
    pub summary: String,
}

/// Keeps the last `n` screenshots as images and flattens everything older into
/// one summary line per step.
pub fn build_context(history: &[HistoryEntry], n: usize) -> ContextWindow {
    let split = history.len().saturating_sub(n);
    let (older, recent) = history.split_at(split);

    let summary = older
        .iter()
        .enumerate()
        .filter(|(_, e)| !(e.thought.is_empty() && e.action.is_empty()))
        .map(|(i, e)| {
            format!(
                "Step {}: Thought: {}... Action: {}",
                i + 1,
                truncate(&e.thought, SUMMARY_THOUGHT_CHARS),
                truncate(&e.action, SUMMARY_ACTION_CHARS)
            )
        })
        .collect::<Vec<_>>()
        .join("\n");

    ContextWindow {
        images: recent.iter().map(|e| e.screenshot.clone()).collect(),
        summary,
    }
}

fn truncate(s: &str, max_chars: usize) -> String {
    s.chars().take(max_chars).collect()
}
