//! Task repository — CRUD over task records plus the pending, completed,
//! and failed indexes.
//!
//! The repository exclusively owns all reads and writes under its data
//! directory. Every mutation goes through the atomic writer, and every
//! read-modify-write of an index file is serialized behind that store's
//! mutex, so concurrent pipelines cannot lose index updates.

use std::path::{Path, PathBuf};

use chrono::Utc;
use tokio::sync::Mutex;
use tracing::warn;

use crate::error::StoreError;
use crate::store::atomic;
use crate::store::model::{
    generate_task_id, IndexEntry, PendingIndex, Priority, Task, TaskStatus, TerminalEntry,
    TerminalIndex, TerminalRecord,
};

/// Characters of a terminal record's summary that are kept.
const SUMMARY_LIMIT: usize = 300;

/// Fixed reason recorded when a user cancels a task.
const CANCELLED_REASON: &str = "cancelled by user";

/// Which terminal store a finished task lands in.
#[derive(Debug, Clone, Copy)]
enum Outcome {
    Completed,
    Failed,
}

impl Outcome {
    fn dir(self) -> &'static str {
        match self {
            Outcome::Completed => "completed",
            Outcome::Failed => "failed",
        }
    }
}

/// Result of bumping a task's retry counter.
#[derive(Debug, Clone)]
pub struct RetryOutcome {
    pub task: Task,
    /// Whether another attempt is allowed. When false the task is left
    /// `inProgress` for the caller to finalize as failed.
    pub can_retry: bool,
}

/// File-backed task repository rooted at a data directory.
pub struct TaskRepository {
    data_dir: PathBuf,
    pending_lock: Mutex<()>,
    completed_lock: Mutex<()>,
    failed_lock: Mutex<()>,
}

impl TaskRepository {
    pub fn new(data_dir: PathBuf) -> Self {
        Self {
            data_dir,
            pending_lock: Mutex::new(()),
            completed_lock: Mutex::new(()),
            failed_lock: Mutex::new(()),
        }
    }

    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    /// Create the directory layout and empty indexes on first run.
    /// Existing files are left untouched.
    pub async fn ensure_layout(&self) -> Result<(), StoreError> {
        for sub in ["tasks", "completed", "failed"] {
            tokio::fs::create_dir_all(self.data_dir.join(sub)).await?;
        }
        let pending = self.data_dir.join("tasks.json");
        if !pending.exists() {
            atomic::write_json(&pending, &PendingIndex::empty()).await?;
        }
        for name in ["completed.json", "failed.json"] {
            let path = self.data_dir.join(name);
            if !path.exists() {
                atomic::write_json(&path, &TerminalIndex::default()).await?;
            }
        }
        Ok(())
    }

    // ── paths ────────────────────────────────────────────────────────────

    fn task_path(&self, id: &str) -> PathBuf {
        self.data_dir.join("tasks").join(format!("{id}.json"))
    }

    fn pending_index_path(&self) -> PathBuf {
        self.data_dir.join("tasks.json")
    }

    fn terminal_index_path(&self, outcome: Outcome) -> PathBuf {
        self.data_dir.join(format!("{}.json", outcome.dir()))
    }

    fn terminal_record_path(&self, outcome: Outcome, id: &str) -> PathBuf {
        self.data_dir.join(outcome.dir()).join(format!("{id}.json"))
    }

    fn terminal_lock(&self, outcome: Outcome) -> &Mutex<()> {
        match outcome {
            Outcome::Completed => &self.completed_lock,
            Outcome::Failed => &self.failed_lock,
        }
    }

    // ── index documents ──────────────────────────────────────────────────

    async fn load_pending_index(&self) -> Result<PendingIndex, StoreError> {
        match tokio::fs::read(self.pending_index_path()).await {
            Ok(bytes) => Ok(serde_json::from_slice(&bytes)?),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(PendingIndex::empty()),
            Err(e) => Err(StoreError::Io(e)),
        }
    }

    async fn save_pending_index(&self, mut index: PendingIndex) -> Result<(), StoreError> {
        index.last_updated = Utc::now();
        atomic::write_json(&self.pending_index_path(), &index).await
    }

    async fn load_terminal_index(&self, outcome: Outcome) -> Result<TerminalIndex, StoreError> {
        match tokio::fs::read(self.terminal_index_path(outcome)).await {
            Ok(bytes) => Ok(serde_json::from_slice(&bytes)?),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(TerminalIndex::default()),
            Err(e) => Err(StoreError::Io(e)),
        }
    }

    // ── task records ─────────────────────────────────────────────────────

    /// Create a new task and append it to the pending index.
    pub async fn create_task(
        &self,
        requirement: &str,
        completion_criteria: Option<String>,
        max_retries: u32,
        working_directory: PathBuf,
        priority: Priority,
    ) -> Result<Task, StoreError> {
        let _guard = self.pending_lock.lock().await;

        let now = Utc::now();
        let task = Task {
            id: generate_task_id(now),
            requirement: requirement.to_string(),
            completion_criteria,
            max_retries: max_retries.max(1),
            current_retry: 0,
            status: TaskStatus::Ready,
            priority,
            created_at: now,
            started_at: None,
            working_directory,
        };

        atomic::write_json(&self.task_path(&task.id), &task).await?;

        let mut index = self.load_pending_index().await?;
        index.tasks.push(IndexEntry {
            id: task.id.clone(),
            file: format!("tasks/{}.json", task.id),
            status: TaskStatus::Ready,
            priority,
            created_at: now,
        });
        self.save_pending_index(index).await?;

        Ok(task)
    }

    /// Load a task record by ID.
    pub async fn load_task(&self, id: &str) -> Result<Task, StoreError> {
        match tokio::fs::read(self.task_path(id)).await {
            Ok(bytes) => Ok(serde_json::from_slice(&bytes)?),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(StoreError::NotFound { id: id.to_string() })
            }
            Err(e) => Err(StoreError::Io(e)),
        }
    }

    async fn save_task(&self, task: &Task) -> Result<(), StoreError> {
        atomic::write_json(&self.task_path(&task.id), task).await
    }

    /// Ready index entries in dispatch order: higher priority first, then
    /// older `createdAt`, then ID as a final deterministic tiebreaker.
    fn ordered_ready(index: &PendingIndex) -> Vec<&IndexEntry> {
        let mut ready: Vec<&IndexEntry> = index
            .tasks
            .iter()
            .filter(|e| e.status == TaskStatus::Ready)
            .collect();
        ready.sort_by(|a, b| {
            b.priority
                .cmp(&a.priority)
                .then_with(|| a.created_at.cmp(&b.created_at))
                .then_with(|| a.id.cmp(&b.id))
        });
        ready
    }

    /// The next ready task in dispatch order, without mutating anything.
    pub async fn get_next_task(&self) -> Result<Option<Task>, StoreError> {
        Ok(self.get_next_tasks(1).await?.into_iter().next())
    }

    /// Up to `n` ready tasks in dispatch order. Never returns the same task
    /// twice within one call.
    pub async fn get_next_tasks(&self, n: usize) -> Result<Vec<Task>, StoreError> {
        let index = self.load_pending_index().await?;
        let mut tasks = Vec::new();
        for entry in Self::ordered_ready(&index) {
            if tasks.len() == n {
                break;
            }
            match self.load_task(&entry.id).await {
                Ok(task) => tasks.push(task),
                Err(e) if e.is_missing() => {
                    warn!(task_id = %entry.id, "pending index references missing task file");
                }
                Err(e) => return Err(e),
            }
        }
        Ok(tasks)
    }

    /// Mark a task in-progress and stamp its start time.
    pub async fn start_task(&self, id: &str) -> Result<Task, StoreError> {
        let _guard = self.pending_lock.lock().await;

        let mut task = self.load_task(id).await?;
        task.status = TaskStatus::InProgress;
        task.started_at = Some(Utc::now());
        self.save_task(&task).await?;

        let mut index = self.load_pending_index().await?;
        if let Some(entry) = index.tasks.iter_mut().find(|e| e.id == id) {
            entry.status = TaskStatus::InProgress;
        }
        self.save_pending_index(index).await?;

        Ok(task)
    }

    /// Bump the retry counter after a failed attempt.
    ///
    /// While attempts remain, the task goes back to `ready` for the next
    /// pickup. Once exhausted, the incremented record is persisted as-is
    /// (still `inProgress`) and the caller finalizes it as failed.
    pub async fn increment_retry(&self, id: &str) -> Result<RetryOutcome, StoreError> {
        let _guard = self.pending_lock.lock().await;

        let mut task = self.load_task(id).await?;
        task.current_retry += 1;
        let can_retry = task.current_retry < task.max_retries;

        if can_retry {
            task.status = TaskStatus::Ready;
            task.started_at = None;
            self.save_task(&task).await?;

            let mut index = self.load_pending_index().await?;
            if let Some(entry) = index.tasks.iter_mut().find(|e| e.id == id) {
                entry.status = TaskStatus::Ready;
            }
            self.save_pending_index(index).await?;
        } else {
            self.save_task(&task).await?;
        }

        Ok(RetryOutcome { task, can_retry })
    }

    /// Record a task as completed and drop it from the pending store.
    pub async fn complete_task(&self, id: &str, summary: &str) -> Result<(), StoreError> {
        self.finalize(id, summary, Outcome::Completed).await
    }

    /// Record a task as failed and drop it from the pending store.
    pub async fn fail_task(&self, id: &str, summary: &str) -> Result<(), StoreError> {
        self.finalize(id, summary, Outcome::Failed).await
    }

    /// Fail a task with the fixed user-cancellation reason.
    pub async fn cancel_task(&self, id: &str) -> Result<(), StoreError> {
        self.fail_task(id, CANCELLED_REASON).await
    }

    async fn finalize(&self, id: &str, summary: &str, outcome: Outcome) -> Result<(), StoreError> {
        let task = self.load_task(id).await?;

        let record = TerminalRecord {
            id: task.id.clone(),
            requirement: task.requirement,
            completion_criteria: task.completion_criteria,
            max_retries: task.max_retries,
            total_retries: task.current_retry,
            created_at: task.created_at,
            started_at: task.started_at,
            finished_at: Utc::now(),
            summary: truncate_summary(summary),
        };
        atomic::write_json(&self.terminal_record_path(outcome, id), &record).await?;

        {
            let _guard = self.terminal_lock(outcome).lock().await;
            let mut index = self.load_terminal_index(outcome).await?;
            index.tasks.push(TerminalEntry {
                id: id.to_string(),
                file: format!("{}/{id}.json", outcome.dir()),
            });
            atomic::write_json(&self.terminal_index_path(outcome), &index).await?;
        }

        self.remove_from_pending(id).await
    }

    async fn remove_from_pending(&self, id: &str) -> Result<(), StoreError> {
        let _guard = self.pending_lock.lock().await;

        let mut index = self.load_pending_index().await?;
        index.tasks.retain(|e| e.id != id);
        self.save_pending_index(index).await?;

        // The index no longer references the file, so a leftover is harmless.
        let _ = tokio::fs::remove_file(self.task_path(id)).await;
        Ok(())
    }

    // ── listings ─────────────────────────────────────────────────────────

    /// All tasks still in the pending store, ready or in-progress.
    /// Entries whose file has gone missing are logged and skipped.
    pub async fn get_all_pending_tasks(&self) -> Result<Vec<Task>, StoreError> {
        let index = self.load_pending_index().await?;
        let mut tasks = Vec::new();
        for entry in &index.tasks {
            match self.load_task(&entry.id).await {
                Ok(task) => tasks.push(task),
                Err(e) if e.is_missing() => {
                    warn!(task_id = %entry.id, "pending task file missing, skipping");
                }
                Err(e) => return Err(e),
            }
        }
        Ok(tasks)
    }

    pub async fn get_completed_tasks(&self) -> Result<Vec<TerminalRecord>, StoreError> {
        self.terminal_records(Outcome::Completed).await
    }

    pub async fn get_failed_tasks(&self) -> Result<Vec<TerminalRecord>, StoreError> {
        self.terminal_records(Outcome::Failed).await
    }

    async fn terminal_records(&self, outcome: Outcome) -> Result<Vec<TerminalRecord>, StoreError> {
        let index = self.load_terminal_index(outcome).await?;
        let mut records = Vec::new();
        for entry in &index.tasks {
            match self.load_terminal_record(outcome, entry).await {
                Ok(record) => records.push(record),
                Err(e) if e.is_missing() => {
                    warn!(file = %entry.file, "terminal record file missing, skipping");
                }
                Err(e) => return Err(e),
            }
        }
        Ok(records)
    }

    async fn load_terminal_record(
        &self,
        outcome: Outcome,
        entry: &TerminalEntry,
    ) -> Result<TerminalRecord, StoreError> {
        let path = self.terminal_record_path(outcome, &entry.id);
        match tokio::fs::read(&path).await {
            Ok(bytes) => Ok(serde_json::from_slice(&bytes)?),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Err(StoreError::Inconsistent {
                file: entry.file.clone(),
            }),
            Err(e) => Err(StoreError::Io(e)),
        }
    }

    // ── maintenance ──────────────────────────────────────────────────────

    /// Reset tasks left `inProgress` by an unclean shutdown back to `ready`.
    ///
    /// Must run once at startup, before any execution loop, so orphaned
    /// tasks become eligible for pickup again. Returns the orphan count.
    pub async fn cleanup_orphan_tasks(&self) -> Result<usize, StoreError> {
        let _guard = self.pending_lock.lock().await;

        let mut index = self.load_pending_index().await?;
        let mut cleaned = 0;
        for entry in index.tasks.iter_mut() {
            if entry.status != TaskStatus::InProgress {
                continue;
            }
            match self.load_task(&entry.id).await {
                Ok(mut task) => {
                    task.status = TaskStatus::Ready;
                    task.started_at = None;
                    self.save_task(&task).await?;
                    entry.status = TaskStatus::Ready;
                    cleaned += 1;
                }
                Err(e) if e.is_missing() => {
                    warn!(task_id = %entry.id, "orphaned index entry has no task file");
                }
                Err(e) => return Err(e),
            }
        }

        if cleaned > 0 {
            self.save_pending_index(index).await?;
        }
        Ok(cleaned)
    }

    /// Destructive wipe of all three stores back to empty indexes.
    /// Only for explicit operator action.
    pub async fn reset_all_data(&self) -> Result<(), StoreError> {
        let _pending = self.pending_lock.lock().await;
        let _completed = self.completed_lock.lock().await;
        let _failed = self.failed_lock.lock().await;

        for sub in ["tasks", "completed", "failed"] {
            let dir = self.data_dir.join(sub);
            let mut entries = match tokio::fs::read_dir(&dir).await {
                Ok(entries) => entries,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
                Err(e) => return Err(StoreError::Io(e)),
            };
            while let Some(entry) = entries.next_entry().await? {
                if entry.path().extension().and_then(|e| e.to_str()) == Some("json") {
                    let _ = tokio::fs::remove_file(entry.path()).await;
                }
            }
        }

        atomic::write_json(&self.pending_index_path(), &PendingIndex::empty()).await?;
        atomic::write_json(
            &self.terminal_index_path(Outcome::Completed),
            &TerminalIndex::default(),
        )
        .await?;
        atomic::write_json(
            &self.terminal_index_path(Outcome::Failed),
            &TerminalIndex::default(),
        )
        .await
    }
}

/// Keep the first `SUMMARY_LIMIT` characters of a summary.
fn truncate_summary(summary: &str) -> String {
    summary.chars().take(SUMMARY_LIMIT).collect()
}
