//! Task data model — records, enums, and index documents.
//!
//! On-disk field names are camelCase; every record is a standalone JSON
//! file and every index a single JSON document, so the store stays
//! inspectable with nothing but a text editor.

use std::path::PathBuf;

use chrono::{DateTime, Utc};
use rand::Rng;
use serde::{Deserialize, Serialize};

/// Lifecycle status of a queued task.
///
/// Terminal outcomes are not statuses: a finished task leaves the pending
/// store entirely and becomes a [`TerminalRecord`] in the completed or
/// failed store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum TaskStatus {
    Ready,
    InProgress,
}

/// Task priority. Serialized as its numeric value (1 = low … 4 = urgent).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(into = "u8", try_from = "u8")]
pub enum Priority {
    Low = 1,
    Normal = 2,
    High = 3,
    Urgent = 4,
}

impl Default for Priority {
    fn default() -> Self {
        Priority::Normal
    }
}

impl From<Priority> for u8 {
    fn from(p: Priority) -> Self {
        p as u8
    }
}

impl TryFrom<u8> for Priority {
    type Error = String;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(Priority::Low),
            2 => Ok(Priority::Normal),
            3 => Ok(Priority::High),
            4 => Ok(Priority::Urgent),
            other => Err(format!("invalid priority {other}, expected 1..=4")),
        }
    }
}

/// One unit of queued work.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Task {
    /// Date-based ID, lexically sortable by creation time.
    pub id: String,
    /// Free-text description of the work.
    pub requirement: String,
    /// Optional completion criteria. Absent means fire-and-forget.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completion_criteria: Option<String>,
    /// Total attempts allowed, including the first.
    pub max_retries: u32,
    /// Failed attempts so far. Invariant: `current_retry <= max_retries`.
    pub current_retry: u32,
    pub status: TaskStatus,
    #[serde(default)]
    pub priority: Priority,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    /// Directory the agent process runs in.
    pub working_directory: PathBuf,
}

/// Terminal snapshot of a task, written exactly once into the completed or
/// failed store.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TerminalRecord {
    pub id: String,
    pub requirement: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completion_criteria: Option<String>,
    pub max_retries: u32,
    /// Attempts actually used.
    pub total_retries: u32,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: DateTime<Utc>,
    pub summary: String,
}

/// Pending-index projection of a task, enough to order and select without
/// loading every task file.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IndexEntry {
    pub id: String,
    /// Path of the task file, relative to the data directory.
    pub file: String,
    pub status: TaskStatus,
    #[serde(default)]
    pub priority: Priority,
    pub created_at: DateTime<Utc>,
}

/// The pending index document (`tasks.json`).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PendingIndex {
    pub last_updated: DateTime<Utc>,
    pub tasks: Vec<IndexEntry>,
}

impl PendingIndex {
    pub fn empty() -> Self {
        Self {
            last_updated: Utc::now(),
            tasks: Vec::new(),
        }
    }
}

/// Entry in a terminal index (`completed.json` / `failed.json`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TerminalEntry {
    pub id: String,
    pub file: String,
}

/// A terminal index document.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TerminalIndex {
    pub tasks: Vec<TerminalEntry>,
}

/// Generate a date-based task ID: `YYYYMMDD-HHMMSS-NNN`.
///
/// The embedded timestamp makes IDs sort by creation time; the random
/// suffix disambiguates tasks created within the same second.
pub fn generate_task_id(now: DateTime<Utc>) -> String {
    let suffix: u16 = rand::thread_rng().gen_range(0..1000);
    format!("{}-{suffix:03}", now.format("%Y%m%d-%H%M%S"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn priority_serializes_as_number() {
        assert_eq!(serde_json::to_string(&Priority::Urgent).unwrap(), "4");
        let parsed: Priority = serde_json::from_str("1").unwrap();
        assert_eq!(parsed, Priority::Low);
    }

    #[test]
    fn priority_rejects_out_of_range() {
        assert!(serde_json::from_str::<Priority>("0").is_err());
        assert!(serde_json::from_str::<Priority>("5").is_err());
    }

    #[test]
    fn priority_ordering() {
        assert!(Priority::Urgent > Priority::High);
        assert!(Priority::High > Priority::Normal);
        assert!(Priority::Normal > Priority::Low);
    }

    #[test]
    fn status_serde_camel_case() {
        assert_eq!(
            serde_json::to_string(&TaskStatus::InProgress).unwrap(),
            "\"inProgress\""
        );
        let parsed: TaskStatus = serde_json::from_str("\"ready\"").unwrap();
        assert_eq!(parsed, TaskStatus::Ready);
    }

    #[test]
    fn task_serde_round_trip() {
        let task = Task {
            id: "20260101-120000-042".to_string(),
            requirement: "fix the build".to_string(),
            completion_criteria: Some("cargo test passes".to_string()),
            max_retries: 3,
            current_retry: 0,
            status: TaskStatus::Ready,
            priority: Priority::High,
            created_at: Utc::now(),
            started_at: None,
            working_directory: PathBuf::from("/tmp/project"),
        };
        let json = serde_json::to_string(&task).unwrap();
        assert!(json.contains("\"completionCriteria\""));
        assert!(json.contains("\"maxRetries\""));
        assert!(json.contains("\"priority\":3"));

        let parsed: Task = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.id, task.id);
        assert_eq!(parsed.priority, Priority::High);
        assert_eq!(parsed.status, TaskStatus::Ready);
    }

    #[test]
    fn task_without_criteria_omits_field() {
        let task = Task {
            id: "x".to_string(),
            requirement: "r".to_string(),
            completion_criteria: None,
            max_retries: 1,
            current_retry: 0,
            status: TaskStatus::Ready,
            priority: Priority::default(),
            created_at: Utc::now(),
            started_at: None,
            working_directory: PathBuf::from("."),
        };
        let json = serde_json::to_string(&task).unwrap();
        assert!(!json.contains("completionCriteria"));
    }

    #[test]
    fn id_embeds_timestamp_and_sorts() {
        let earlier = Utc.with_ymd_and_hms(2026, 1, 2, 3, 4, 5).unwrap();
        let later = Utc.with_ymd_and_hms(2026, 1, 2, 3, 4, 6).unwrap();
        let a = generate_task_id(earlier);
        let b = generate_task_id(later);
        assert!(a.starts_with("20260102-030405-"));
        assert!(a < b);
        assert_eq!(a.len(), "20260102-030405-123".len());
    }
}
