// Run-level stop conditions, checked only at step boundaries.
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

/// Host-side handles into a running engine. Cloning shares the same flags.
#[derive(Debug, Clone, Default)]
pub struct RunSignals {
    cancel: Arc<AtomicBool>,
    redirect: Arc<Mutex<Option<String>>>,
}

impl RunSignals {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.cancel.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.load(Ordering::SeqCst)
    }

    /// Queues an instruction to prepend to the next step's context. A later call
    /// replaces an earlier one that has not been consumed yet.
    pub fn redirect(&self, text: impl Into<String>) {
        let text = text.into();
        match self.redirect.lock() {
            Ok(mut slot) => *slot = Some(text),
            Err(poisoned) => *poisoned.into_inner() = Some(text),
        }
    }

    fn take_redirect(&self) -> Option<String> {
        let taken = match self.redirect.lock() {
            Ok(mut slot) => slot.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        };
        taken.filter(|t| !t.trim().is_empty())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    Cancelled,
    TimedOut,
}

pub struct LoopController {
    signals: RunSignals,
    started: Instant,
    run_timeout: Duration,
}

impl LoopController {
    pub fn new(signals: RunSignals, run_timeout: Duration) -> Self {
        Self {
            signals,
            started: Instant::now(),
            run_timeout,
        }
    }

    /// Cancellation wins over the timeout.
    pub fn check_boundary(&self) -> Option<StopReason> {
        if self.signals.is_cancelled() {
            return Some(StopReason::Cancelled);
        }
        if self.started.elapsed() >= self.run_timeout {
            return Some(StopReason::TimedOut);
        }
        None
    }

    pub fn take_redirect(&self) -> Option<String> {
        self.signals.take_redirect()
    }

    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }
}
