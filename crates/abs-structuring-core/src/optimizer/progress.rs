//! Per-run progress reporting and cancellation.
//!
//! Every optimisation run owns a [`ProgressTracker`] wrapping a caller-supplied
//! [`ProgressObserver`]; nothing here is shared between runs.

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::Sender;
use std::sync::Arc;
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Initializing,
    /// Deterministic grid search
    Searching,
    /// Genetic evolution
    Evolving,
    Finalizing,
    Complete,
    Error,
}

impl Phase {
    fn rank(&self) -> u8 {
        match self {
            Phase::Initializing => 0,
            Phase::Searching | Phase::Evolving => 1,
            Phase::Finalizing => 2,
            Phase::Complete | Phase::Error => 3,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Phase::Complete | Phase::Error)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgressUpdate {
    pub phase: Phase,
    /// 0-100; only terminal phases report 100
    pub percent: u8,
    pub message: String,
    pub elapsed_ms: u64,
}

/// Receives progress updates from a single run.
pub trait ProgressObserver {
    fn on_progress(&mut self, update: &ProgressUpdate);
}

/// Discards every update.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopProgress;

impl ProgressObserver for NoopProgress {
    fn on_progress(&mut self, _update: &ProgressUpdate) {}
}

/// Forwards updates over an mpsc channel, typically to a UI thread.
/// A dropped receiver is ignored.
#[derive(Debug, Clone)]
pub struct ChannelProgress {
    sender: Sender<ProgressUpdate>,
}

impl ChannelProgress {
    pub fn new(sender: Sender<ProgressUpdate>) -> Self {
        Self { sender }
    }
}

impl ProgressObserver for ChannelProgress {
    fn on_progress(&mut self, update: &ProgressUpdate) {
        let _ = self.sender.send(update.clone());
    }
}

/// Keeps every update in memory.
#[derive(Debug, Default, Clone)]
pub struct RecordingProgress {
    pub updates: Vec<ProgressUpdate>,
}

impl RecordingProgress {
    /// Distinct phases in the order they were entered.
    pub fn phases(&self) -> Vec<Phase> {
        let mut out: Vec<Phase> = Vec::new();
        for u in &self.updates {
            if out.last() != Some(&u.phase) {
                out.push(u.phase);
            }
        }
        out
    }

    pub fn last(&self) -> Option<&ProgressUpdate> {
        self.updates.last()
    }
}

impl ProgressObserver for RecordingProgress {
    fn on_progress(&mut self, update: &ProgressUpdate) {
        self.updates.push(update.clone());
    }
}

/// Phase machine Initializing -> Searching/Evolving -> Finalizing ->
/// Complete | Error. Backward moves and moves out of a terminal phase are
/// dropped; percent never decreases.
pub struct ProgressTracker<'a> {
    observer: &'a mut dyn ProgressObserver,
    phase: Phase,
    percent: u8,
    started: Instant,
}

impl<'a> ProgressTracker<'a> {
    pub fn new(observer: &'a mut dyn ProgressObserver) -> Self {
        Self {
            observer,
            phase: Phase::Initializing,
            percent: 0,
            started: Instant::now(),
        }
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn percent(&self) -> u8 {
        self.percent
    }

    /// Report within the current phase.
    pub fn report(&mut self, percent: u8, message: impl Into<String>) {
        let phase = self.phase;
        self.advance(phase, percent, message);
    }

    /// Move to `phase` (or stay) and report. Returns false when the
    /// transition is not allowed.
    pub fn advance(&mut self, phase: Phase, percent: u8, message: impl Into<String>) -> bool {
        if self.phase.is_terminal() || phase.rank() < self.phase.rank() {
            tracing::warn!(from = ?self.phase, to = ?phase, "ignored progress transition");
            return false;
        }
        let percent = if phase.is_terminal() {
            100
        } else {
            percent.min(99).max(self.percent)
        };
        self.phase = phase;
        self.percent = percent;
        let update = ProgressUpdate {
            phase,
            percent,
            message: message.into(),
            elapsed_ms: self.started.elapsed().as_millis() as u64,
        };
        tracing::info!(
            phase = ?update.phase,
            percent = update.percent,
            elapsed_ms = update.elapsed_ms,
            "{}",
            update.message
        );
        self.observer.on_progress(&update);
        true
    }

    pub fn complete(&mut self, message: impl Into<String>) {
        self.advance(Phase::Complete, 100, message);
    }

    pub fn fail(&mut self, message: impl Into<String>) {
        self.advance(Phase::Error, 100, message);
    }
}

/// Cancellation flag and deadline, checked between maturity tuples and
/// between generations.
#[derive(Debug, Clone, Default)]
pub struct RunControl {
    pub cancel: Option<Arc<AtomicBool>>,
    pub deadline: Option<Instant>,
}

impl RunControl {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_cancel_flag(mut self, flag: Arc<AtomicBool>) -> Self {
        self.cancel = Some(flag);
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.deadline = Some(Instant::now() + timeout);
        self
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel
            .as_ref()
            .map_or(false, |f| f.load(Ordering::Relaxed))
    }

    pub fn is_expired(&self) -> bool {
        self.deadline.map_or(false, |d| Instant::now() >= d)
    }

    pub fn should_stop(&self) -> bool {
        self.is_cancelled() || self.is_expired()
    }
}
