//! Collaborator seams — lifecycle notifications and live output.
//!
//! Front ends (chat bots, TUIs) plug in here. The engine only ever calls
//! these interfaces best-effort: a sink that fails or blocks cannot affect
//! task execution.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;

use async_trait::async_trait;
use serde::Serialize;

/// Task lifecycle events, with enough structured data to render a
/// user-facing message.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum TaskEvent {
    Started {
        id: String,
        requirement: String,
    },
    Completed {
        id: String,
        requirement: String,
        /// Attempts used, counting the successful one.
        total_attempts: u32,
        max_retries: u32,
        summary: String,
    },
    Retrying {
        id: String,
        current_retry: u32,
        max_retries: u32,
        reason: Option<String>,
    },
    Failed {
        id: String,
        requirement: String,
        total_attempts: u32,
        max_retries: u32,
        summary: String,
    },
}

impl TaskEvent {
    /// The ID of the task this event concerns.
    pub fn task_id(&self) -> &str {
        match self {
            TaskEvent::Started { id, .. }
            | TaskEvent::Completed { id, .. }
            | TaskEvent::Retrying { id, .. }
            | TaskEvent::Failed { id, .. } => id,
        }
    }
}

/// Receiver of task lifecycle events.
///
/// Errors are logged and swallowed by the engine; delivery is best-effort.
#[async_trait]
pub trait NotificationSink: Send + Sync {
    async fn notify(&self, event: TaskEvent) -> anyhow::Result<()>;
}

/// Receiver of live agent output, line by line. Purely observational.
pub trait OutputSink: Send + Sync {
    fn on_line(&self, task_id: &str, line: &str);
}

/// Default sink that records events in the log.
pub struct LogSink;

#[async_trait]
impl NotificationSink for LogSink {
    async fn notify(&self, event: TaskEvent) -> anyhow::Result<()> {
        match &event {
            TaskEvent::Started { id, requirement } => {
                tracing::info!(task_id = %id, requirement = %head(requirement), "task started");
            }
            TaskEvent::Completed {
                id,
                total_attempts,
                max_retries,
                ..
            } => {
                tracing::info!(
                    task_id = %id,
                    attempts = %format!("{total_attempts}/{max_retries}"),
                    "task completed"
                );
            }
            TaskEvent::Retrying {
                id,
                current_retry,
                max_retries,
                reason,
            } => {
                tracing::info!(
                    task_id = %id,
                    retry = %format!("{current_retry}/{max_retries}"),
                    reason = reason.as_deref().unwrap_or("-"),
                    "task retrying"
                );
            }
            TaskEvent::Failed {
                id,
                total_attempts,
                max_retries,
                ..
            } => {
                tracing::info!(
                    task_id = %id,
                    attempts = %format!("{total_attempts}/{max_retries}"),
                    "task failed"
                );
            }
        }
        Ok(())
    }
}

fn head(text: &str) -> String {
    text.chars().take(80).collect()
}

/// Lines retained per task by [`OutputBuffer`].
const TAIL_LINES: usize = 20;

/// Keeps the most recent output lines per task, for progress UIs that poll
/// rather than stream.
#[derive(Default)]
pub struct OutputBuffer {
    lines: Mutex<HashMap<String, VecDeque<String>>>,
}

impl OutputBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Most recent lines for a task, oldest first.
    pub fn tail(&self, task_id: &str) -> Vec<String> {
        self.lines
            .lock()
            .map(|map| {
                map.get(task_id)
                    .map(|lines| lines.iter().cloned().collect())
                    .unwrap_or_default()
            })
            .unwrap_or_default()
    }

    /// Drop the buffer for a finished task.
    pub fn clear(&self, task_id: &str) {
        if let Ok(mut map) = self.lines.lock() {
            map.remove(task_id);
        }
    }
}

impl OutputSink for OutputBuffer {
    fn on_line(&self, task_id: &str, line: &str) {
        let Ok(mut map) = self.lines.lock() else {
            return;
        };
        let lines = map.entry(task_id.to_string()).or_default();
        lines.push_back(line.to_string());
        while lines.len() > TAIL_LINES {
            lines.pop_front();
        }
    }
}
