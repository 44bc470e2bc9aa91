//! Execution drivers — a sequential loop and a bounded-parallel pool over
//! the same per-task pipeline.
//!
//! Task selection order is deterministic in both modes (priority, then
//! age); completion order in parallel mode is not. Stopping the engine
//! stops new pickups but lets in-flight runs finish or time out naturally.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use tokio::sync::Mutex;
use tokio::task::JoinSet;
use tracing::{info, warn};

use crate::engine::pipeline::{process_one_task, EngineDeps};
use crate::runner::CancelHandle;

/// Sleep between polls when no task is ready.
const IDLE_SLEEP: Duration = Duration::from_secs(5);
/// Pause after each task in sequential mode.
const INTER_TASK_PAUSE: Duration = Duration::from_secs(2);

/// Drives task execution against a repository.
///
/// Shared behind an `Arc` so front ends can call [`stop`](Self::stop),
/// [`cancel`](Self::cancel), and [`running_task_ids`](Self::running_task_ids)
/// while one `run` loop is active. Only a single `run` loop may be active
/// at a time.
pub struct ExecutionEngine {
    deps: EngineDeps,
    running: AtomicBool,
    /// In-flight task IDs with their cancel handles. Only the driver loop
    /// inserts and removes entries; everyone else just reads or cancels.
    in_flight: Mutex<HashMap<String, CancelHandle>>,
}

impl ExecutionEngine {
    pub fn new(deps: EngineDeps) -> Self {
        Self {
            deps,
            running: AtomicBool::new(false),
            in_flight: Mutex::new(HashMap::new()),
        }
    }

    /// Stop picking up new tasks. In-flight runs are not killed.
    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// IDs of tasks currently being executed.
    pub async fn running_task_ids(&self) -> Vec<String> {
        self.in_flight.lock().await.keys().cloned().collect()
    }

    /// Kill one in-flight run. Returns false if the task is not running.
    /// Other concurrent tasks are unaffected.
    pub async fn cancel(&self, task_id: &str) -> bool {
        match self.in_flight.lock().await.get(task_id) {
            Some(handle) => {
                handle.cancel();
                true
            }
            None => false,
        }
    }

    /// Run the driver loop until [`stop`](Self::stop) is called.
    pub async fn run(&self) {
        self.running.store(true, Ordering::SeqCst);
        if self.deps.config.parallel_execution {
            let slots = self.deps.config.effective_max_parallel();
            info!(max_parallel = slots, "engine started in parallel mode");
            self.run_parallel(slots).await;
        } else {
            info!("engine started in sequential mode");
            self.run_sequential().await;
        }
        info!("engine stopped");
    }

    async fn run_sequential(&self) {
        while self.is_running() {
            match self.deps.repository.get_next_task().await {
                Ok(Some(task)) => {
                    let id = task.id.clone();
                    let cancel = CancelHandle::new();
                    self.in_flight.lock().await.insert(id.clone(), cancel.clone());
                    process_one_task(&self.deps, task, cancel).await;
                    self.in_flight.lock().await.remove(&id);
                    tokio::time::sleep(INTER_TASK_PAUSE).await;
                }
                Ok(None) => tokio::time::sleep(IDLE_SLEEP).await,
                Err(e) => {
                    warn!(error = %e, "failed to select next task");
                    tokio::time::sleep(IDLE_SLEEP).await;
                }
            }
        }
    }

    async fn run_parallel(&self, slots: usize) {
        let mut pool: JoinSet<String> = JoinSet::new();
        let mut ticker = tokio::time::interval(IDLE_SLEEP);

        loop {
            // Wake on the poll tick or as soon as any task finishes, so
            // freed slots refill without waiting out the interval.
            tokio::select! {
                _ = ticker.tick() => {}
                Some(finished) = pool.join_next(), if !pool.is_empty() => {
                    self.reap(finished).await;
                }
            }

            while let Some(finished) = pool.try_join_next() {
                self.reap(finished).await;
            }

            if !self.is_running() {
                break;
            }

            let capacity = slots.saturating_sub(pool.len());
            if capacity == 0 {
                continue;
            }

            let batch = match self.deps.repository.get_next_tasks(capacity).await {
                Ok(batch) => batch,
                Err(e) => {
                    warn!(error = %e, "failed to select next tasks");
                    continue;
                }
            };

            for task in batch {
                let mut in_flight = self.in_flight.lock().await;
                if in_flight.contains_key(&task.id) {
                    // Already dispatched (e.g. selected again before its
                    // pipeline marked it in-progress).
                    continue;
                }
                let cancel = CancelHandle::new();
                in_flight.insert(task.id.clone(), cancel.clone());
                drop(in_flight);

                let deps = self.deps.clone();
                pool.spawn(async move {
                    let id = task.id.clone();
                    process_one_task(&deps, task, cancel).await;
                    id
                });
            }
        }

        // Graceful shutdown: wait for in-flight tasks.
        while let Some(finished) = pool.join_next().await {
            self.reap(finished).await;
        }
    }

    async fn reap(&self, finished: Result<String, tokio::task::JoinError>) {
        match finished {
            Ok(id) => {
                self.in_flight.lock().await.remove(&id);
            }
            Err(e) => warn!(error = %e, "task worker panicked"),
        }
    }
}
