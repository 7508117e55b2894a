//! Typed event stream for callers watching a clean run.
//!
//! Every finding the cleaner logs is also published here, together with
//! merge lifecycle and progress events:
//! - `clean:log`: an info/warn/error finding about one file
//! - `merge:*`: start, periodic progress, completion and failure of a merge

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::{error, info, warn};

/// Maximum number of queued events per subscriber
const EVENT_CAPACITY: usize = 1000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Info,
    Warn,
    Error,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload")]
pub enum CleanEvent {
    #[serde(rename = "clean:log")]
    Log {
        level: LogLevel,
        message: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        path: Option<String>,
    },

    #[serde(rename = "merge:started")]
    MergeStarted {
        ancestor: String,
        children: Vec<String>,
    },

    #[serde(rename = "merge:progress")]
    MergeProgress {
        ancestor: String,
        done: u64,
        total: u64,
        percent: f64,
    },

    #[serde(rename = "merge:completed")]
    MergeCompleted {
        target: String,
        merged_size: u64,
        duration_secs: u64,
    },

    #[serde(rename = "merge:failed")]
    MergeFailed { ancestor: String, error: String },
}

/// Fan-out point for [`CleanEvent`]s. Events sent with no subscriber are
/// dropped; slow subscribers lose the oldest events.
#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<CleanEvent>,
}

impl EventBus {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(EVENT_CAPACITY);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<CleanEvent> {
        self.tx.subscribe()
    }

    pub fn emit(&self, event: CleanEvent) {
        let _ = self.tx.send(event);
    }

    /// Log a finding and publish it.
    pub fn log(&self, level: LogLevel, message: &str, path: Option<&str>) {
        let shown = path.unwrap_or("-");
        match level {
            LogLevel::Info => info!(path = %shown, "{}", message),
            LogLevel::Warn => warn!(path = %shown, "{}", message),
            LogLevel::Error => error!(path = %shown, "{}", message),
        }

        self.emit(CleanEvent::Log {
            level,
            message: message.to_string(),
            path: path.map(str::to_string),
        });
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

pub(crate) fn percent(done: u64, total: u64) -> f64 {
    if total > 0 {
        ((done as f64 / total as f64) * 100.0).min(100.0)
    } else {
        0.0
    }
}
