//! Progress events streamed to the submitting caller
//!
//! Every pipeline transition becomes exactly one [`ProgressEvent`] pushed onto
//! an ordered channel. A [`RunReporter`] scopes events to one run and is
//! consumed by its terminal event, so a run cannot report twice.

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventStatus {
    Info,
    Error,
    Complete,
}

impl EventStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, EventStatus::Error | EventStatus::Complete)
    }
}

/// One entry of the caller-visible stream
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProgressEvent {
    pub id: String,
    pub filename: String,
    pub status: EventStatus,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub step: Option<u8>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub clone_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub results_path: Option<String>,
}

/// How a run ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Terminal {
    Complete { results_path: String },
    Error { message: String },
}

/// Pushes events onto the caller's stream without coalescing
#[derive(Debug, Clone)]
pub struct EventEmitter {
    tx: mpsc::UnboundedSender<ProgressEvent>,
}

impl EventEmitter {
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<ProgressEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    /// Returns `false` once nobody is listening; the run carries on regardless
    pub fn emit(&self, event: ProgressEvent) -> bool {
        debug!(
            id = %event.id,
            step = ?event.step,
            status = ?event.status,
            "{}",
            event.message
        );
        self.tx.send(event).is_ok()
    }

    pub fn for_run(&self, run_id: impl Into<String>, filename: impl Into<String>) -> RunReporter {
        RunReporter {
            emitter: self.clone(),
            id: run_id.into(),
            filename: filename.into(),
            clone_name: None,
            last_step: None,
            listening: true,
        }
    }
}

/// Event handle for a single run
#[derive(Debug)]
pub struct RunReporter {
    emitter: EventEmitter,
    id: String,
    filename: String,
    clone_name: Option<String>,
    last_step: Option<u8>,
    listening: bool,
}

impl RunReporter {
    /// Attach the sandbox name to the terminal event
    pub fn set_clone_name(&mut self, clone_name: impl Into<String>) {
        self.clone_name = Some(clone_name.into());
    }

    /// Advisory progress for `step`; steps must strictly increase within a run
    pub fn info(&mut self, step: u8, message: impl Into<String>) {
        if let Some(last) = self.last_step {
            if step <= last {
                warn!(id = %self.id, "Step {} reported after step {}", step, last);
                debug_assert!(step > last, "steps must strictly increase");
            }
        }
        self.last_step = Some(step);

        let event = ProgressEvent {
            id: self.id.clone(),
            filename: self.filename.clone(),
            status: EventStatus::Info,
            message: message.into(),
            step: Some(step),
            clone_name: None,
            results_path: None,
        };
        self.send(event);
    }

    /// Terminal event for a sample that never became a run
    pub fn reject(self, message: impl Into<String>) {
        self.finish(Terminal::Error {
            message: message.into(),
        });
    }

    pub fn finish(mut self, terminal: Terminal) {
        let (status, message, results_path) = match terminal {
            Terminal::Complete { results_path } => (
                EventStatus::Complete,
                "Analysis successful!".to_string(),
                Some(results_path),
            ),
            Terminal::Error { message } => (EventStatus::Error, message, None),
        };

        let event = ProgressEvent {
            id: self.id.clone(),
            filename: self.filename.clone(),
            status,
            message,
            step: None,
            clone_name: self.clone_name.take(),
            results_path,
        };
        self.send(event);
    }

    // Logged once per run; later events are still built and dropped
    fn send(&mut self, event: ProgressEvent) {
        if !self.emitter.emit(event) && self.listening {
            self.listening = false;
            debug!(id = %self.id, "Caller stopped listening; run continues");
        }
    }
}
