use std::fmt;

use tokio::sync::mpsc;
use tracing::{info, warn};

use crate::apply::ApplyStage;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProgressLevel {
    Info,
    Warn,
}

/// One line of apply progress.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProgressEvent {
    pub stage: ApplyStage,
    pub level: ProgressLevel,
    pub message: String,
}

impl fmt::Display for ProgressEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.level {
            ProgressLevel::Info => write!(f, "[{}] {}", self.stage, self.message),
            ProgressLevel::Warn => write!(f, "[{}] warning: {}", self.stage, self.message),
        }
    }
}

/// Where the reconciler reports progress. Every event is also logged, so a
/// sink without a listener still leaves a trace.
#[derive(Debug, Clone, Default)]
pub struct ProgressSink {
    tx: Option<mpsc::UnboundedSender<ProgressEvent>>,
}

impl ProgressSink {
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<ProgressEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx: Some(tx) }, rx)
    }

    /// Logs only.
    pub fn detached() -> Self {
        Self::default()
    }

    pub fn info(&self, stage: ApplyStage, message: impl Into<String>) {
        self.emit(ProgressEvent {
            stage,
            level: ProgressLevel::Info,
            message: message.into(),
        });
    }

    pub fn warn(&self, stage: ApplyStage, message: impl Into<String>) {
        self.emit(ProgressEvent {
            stage,
            level: ProgressLevel::Warn,
            message: message.into(),
        });
    }

    fn emit(&self, event: ProgressEvent) {
        match event.level {
            ProgressLevel::Info => info!(stage = %event.stage, "{}", event.message),
            ProgressLevel::Warn => warn!(stage = %event.stage, "{}", event.message),
        }
        if let Some(tx) = &self.tx {
            // A closed receiver means the client went away; the apply carries on.
            let _ = tx.send(event);
        }
    }
}
