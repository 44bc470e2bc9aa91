//! Per-task pipeline — one attempt from pickup to persisted outcome.
//!
//! Everything that can go wrong inside an attempt is converted into a
//! failed-task record; nothing propagates out of [`process_one_task`].
//! A single task crashing must never take down the driver loop.

use std::sync::Arc;

use futures::future::join_all;
use tracing::{error, warn};

use crate::classify::{classify, COMPLETION_MARKER, FAILURE_MARKER};
use crate::config::Config;
use crate::error::ProcessError;
use crate::notify::{NotificationSink, OutputSink, TaskEvent};
use crate::runner::{self, AgentInvocation, CancelHandle, LineObserver};
use crate::store::{Task, TaskRepository};

/// Shared dependencies for task execution.
#[derive(Clone)]
pub struct EngineDeps {
    pub repository: Arc<TaskRepository>,
    pub config: Config,
    pub sinks: Vec<Arc<dyn NotificationSink>>,
    pub output: Option<Arc<dyn OutputSink>>,
}

/// What one agent run amounted to, before bookkeeping.
struct AttemptOutcome {
    success: bool,
    cancelled: bool,
    output: String,
    reason: Option<String>,
}

/// Run one task attempt end to end: mark in-progress, run the agent,
/// classify, then complete, requeue, or fail.
pub(crate) async fn process_one_task(deps: &EngineDeps, task: Task, cancel: CancelHandle) {
    let id = task.id.clone();
    if let Err(e) = run_pipeline(deps, task, cancel).await {
        warn!(task_id = %id, error = %e, "task pipeline error, recording failure");
        if let Err(persist) = deps
            .repository
            .fail_task(&id, &format!("internal error: {e}"))
            .await
        {
            error!(task_id = %id, error = %persist, "could not persist task failure");
        }
    }
}

async fn run_pipeline(
    deps: &EngineDeps,
    task: Task,
    cancel: CancelHandle,
) -> crate::error::Result<()> {
    deps.repository.start_task(&task.id).await?;
    notify_all(
        deps,
        TaskEvent::Started {
            id: task.id.clone(),
            requirement: task.requirement.clone(),
        },
    )
    .await;

    let attempt = execute_attempt(deps, &task, &cancel).await;

    if attempt.cancelled {
        // A user kill is final; requeueing work the user just stopped
        // would contradict the cancel request.
        deps.repository.cancel_task(&task.id).await?;
        notify_all(
            deps,
            TaskEvent::Failed {
                id: task.id.clone(),
                requirement: task.requirement.clone(),
                total_attempts: task.current_retry,
                max_retries: task.max_retries,
                summary: "cancelled by user".to_string(),
            },
        )
        .await;
        return Ok(());
    }

    if attempt.success {
        let summary = summarize(&attempt.output, true, None);
        deps.repository.complete_task(&task.id, &summary).await?;
        notify_all(
            deps,
            TaskEvent::Completed {
                id: task.id.clone(),
                requirement: task.requirement.clone(),
                total_attempts: task.current_retry + 1,
                max_retries: task.max_retries,
                summary,
            },
        )
        .await;
        return Ok(());
    }

    let retry = deps.repository.increment_retry(&task.id).await?;
    if retry.can_retry {
        // Left `ready` for the next pickup; the driver's pacing provides
        // the backoff, not a blocking re-run here.
        notify_all(
            deps,
            TaskEvent::Retrying {
                id: task.id.clone(),
                current_retry: retry.task.current_retry,
                max_retries: task.max_retries,
                reason: attempt.reason,
            },
        )
        .await;
    } else {
        let summary = summarize(&attempt.output, false, attempt.reason.as_deref());
        deps.repository.fail_task(&task.id, &summary).await?;
        notify_all(
            deps,
            TaskEvent::Failed {
                id: task.id.clone(),
                requirement: task.requirement.clone(),
                total_attempts: retry.task.current_retry,
                max_retries: task.max_retries,
                summary,
            },
        )
        .await;
    }
    Ok(())
}

/// Launch the agent and interpret what came back. Infallible by design:
/// every process error becomes a failed attempt.
async fn execute_attempt(deps: &EngineDeps, task: &Task, cancel: &CancelHandle) -> AttemptOutcome {
    let agent = deps.config.agent_command();
    let invocation = AgentInvocation {
        command: agent.command,
        args: agent.args,
        working_dir: task.working_directory.clone(),
        stdin: build_prompt(task),
        timeout: deps.config.task_timeout(),
    };

    let observer: Option<LineObserver> = deps.output.as_ref().map(|sink| {
        let sink = Arc::clone(sink);
        let task_id = task.id.clone();
        Arc::new(move |line: &str| sink.on_line(&task_id, line)) as LineObserver
    });

    match runner::run_agent(&invocation, cancel, observer).await {
        Ok(outcome) => {
            if outcome.exit_code != 0 {
                // A non-zero exit is authoritative; the transcript is not
                // consulted.
                let reason = runner::exit_code_reason(outcome.exit_code);
                AttemptOutcome {
                    success: false,
                    cancelled: false,
                    output: outcome.output,
                    reason: Some(reason),
                }
            } else {
                let verdict = classify(&outcome.output, task.max_retries > 1);
                AttemptOutcome {
                    success: verdict.success,
                    cancelled: false,
                    output: outcome.output,
                    reason: verdict.reason,
                }
            }
        }
        Err(ProcessError::Cancelled) => AttemptOutcome {
            success: false,
            cancelled: true,
            output: String::new(),
            reason: Some("cancelled".to_string()),
        },
        Err(e) => AttemptOutcome {
            success: false,
            cancelled: false,
            output: e.to_string(),
            reason: Some(e.to_string()),
        },
    }
}

/// The prompt handed to the agent on stdin. Embeds the requirement, the
/// completion criteria, and the instruction to end with an explicit
/// completion or failure marker.
pub(crate) fn build_prompt(task: &Task) -> String {
    format!(
        "# Task request\n\
         \n\
         ## Requirement\n\
         {requirement}\n\
         \n\
         ## Completion criteria\n\
         {criteria}\n\
         \n\
         ## Instructions\n\
         - Carry out the requirement above and satisfy the completion criteria.\n\
         - When the work is done, verify that the completion criteria are met.\n\
         - If the criteria cannot be met, explain why.\n\
         \n\
         ## Completion signal (important!)\n\
         - If all work is done and the completion criteria are met, print exactly:\n\
         \x20 {completion}\n\
         - If the work cannot be completed or the criteria are not met, print the\n\
         \x20 failure signal followed by the reason:\n\
         \x20 {failure}\n\
         \x20 Reason: [specific reason]\n",
        requirement = task.requirement,
        criteria = task.completion_criteria.as_deref().unwrap_or("None"),
        completion = COMPLETION_MARKER,
        failure = FAILURE_MARKER,
    )
}

/// Human-readable outcome summary: the failure reason (if any) plus the
/// last few non-empty lines of the transcript.
pub(crate) fn summarize(output: &str, success: bool, reason: Option<&str>) -> String {
    let lines: Vec<&str> = output.lines().filter(|l| !l.trim().is_empty()).collect();
    let start = lines.len().saturating_sub(5);
    let tail = lines[start..].join("\n");

    if success {
        format!("Task complete. {}", truncate_chars(&tail, 250))
    } else {
        match reason {
            Some(r) => format!("Task failed.\nReason: {r}\n{}", truncate_chars(&tail, 200)),
            None => format!("Task failed.\n{}", truncate_chars(&tail, 200)),
        }
    }
}

async fn notify_all(deps: &EngineDeps, event: TaskEvent) {
    let sends = deps.sinks.iter().map(|sink| {
        let event = event.clone();
        async move { sink.notify(event).await }
    });
    for result in join_all(sends).await {
        if let Err(e) = result {
            warn!(error = %e, "notification sink failed");
        }
    }
}

fn truncate_chars(text: &str, limit: usize) -> String {
    text.chars().take(limit).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    use crate::store::Priority;

    fn sample_task(criteria: Option<&str>) -> Task {
        Task {
            id: "20260101-000000-000".to_string(),
            requirement: "paint the shed".to_string(),
            completion_criteria: criteria.map(String::from),
            max_retries: 2,
            current_retry: 0,
            status: crate::store::TaskStatus::Ready,
            priority: Priority::Normal,
            created_at: chrono::Utc::now(),
            started_at: None,
            working_directory: PathBuf::from("."),
        }
    }

    fn deps_with_agent(repo: Arc<TaskRepository>, agent: &str) -> EngineDeps {
        EngineDeps {
            repository: repo,
            config: Config {
                agent_command: Some(agent.to_string()),
                ..Config::default()
            },
            sinks: Vec::new(),
            output: None,
        }
    }

    #[test]
    fn prompt_embeds_requirement_and_markers() {
        let prompt = build_prompt(&sample_task(Some("shed is green")));
        assert!(prompt.contains("paint the shed"));
        assert!(prompt.contains("shed is green"));
        assert!(prompt.contains(COMPLETION_MARKER));
        assert!(prompt.contains(FAILURE_MARKER));
    }

    #[test]
    fn prompt_without_criteria_says_none() {
        let prompt = build_prompt(&sample_task(None));
        assert!(prompt.contains("## Completion criteria\nNone\n"));
    }

    #[test]
    fn summarize_keeps_last_lines() {
        let output = "one\n\ntwo\nthree\nfour\nfive\nsix\n";
        let summary = summarize(output, true, None);
        assert!(summary.starts_with("Task complete."));
        assert!(summary.contains("six"));
        assert!(!summary.contains("one"));
    }

    #[test]
    fn summarize_failure_carries_reason() {
        let summary = summarize("output", false, Some("tests red"));
        assert!(summary.starts_with("Task failed."));
        assert!(summary.contains("Reason: tests red"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn successful_attempt_lands_in_completed_store() {
        let dir = tempfile::tempdir().unwrap();
        let repo = Arc::new(TaskRepository::new(dir.path().to_path_buf()));
        repo.ensure_layout().await.unwrap();
        // `true` prints nothing and exits 0; a single-attempt task is
        // classified leniently, so that counts as success.
        let deps = deps_with_agent(Arc::clone(&repo), "/bin/sh -c true");

        let task = repo
            .create_task("noop", None, 1, PathBuf::from("."), Priority::Normal)
            .await
            .unwrap();
        process_one_task(&deps, task.clone(), CancelHandle::new()).await;

        assert_eq!(repo.get_completed_tasks().await.unwrap().len(), 1);
        assert!(repo.get_all_pending_tasks().await.unwrap().is_empty());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn nonzero_exit_fails_single_attempt_task() {
        let dir = tempfile::tempdir().unwrap();
        let repo = Arc::new(TaskRepository::new(dir.path().to_path_buf()));
        repo.ensure_layout().await.unwrap();
        let deps = deps_with_agent(Arc::clone(&repo), "/bin/sh -c false");

        let task = repo
            .create_task("doomed", None, 1, PathBuf::from("."), Priority::Normal)
            .await
            .unwrap();
        process_one_task(&deps, task.clone(), CancelHandle::new()).await;

        let failed = repo.get_failed_tasks().await.unwrap();
        assert_eq!(failed.len(), 1);
        assert!(failed[0].summary.contains("exit code 1"));
        assert_eq!(failed[0].total_retries, 1);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn failed_attempt_with_retries_left_requeues() {
        let dir = tempfile::tempdir().unwrap();
        let repo = Arc::new(TaskRepository::new(dir.path().to_path_buf()));
        repo.ensure_layout().await.unwrap();
        let deps = deps_with_agent(Arc::clone(&repo), "/bin/sh -c false");

        let task = repo
            .create_task("flaky", None, 3, PathBuf::from("."), Priority::Normal)
            .await
            .unwrap();
        process_one_task(&deps, task.clone(), CancelHandle::new()).await;

        let requeued = repo.load_task(&task.id).await.unwrap();
        assert_eq!(requeued.status, crate::store::TaskStatus::Ready);
        assert_eq!(requeued.current_retry, 1);
        assert!(requeued.started_at.is_none());
        assert!(repo.get_failed_tasks().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn spawn_failure_never_escapes_the_pipeline() {
        let dir = tempfile::tempdir().unwrap();
        let repo = Arc::new(TaskRepository::new(dir.path().to_path_buf()));
        repo.ensure_layout().await.unwrap();
        let deps = deps_with_agent(Arc::clone(&repo), "/definitely/not/here");

        let task = repo
            .create_task("unspawnable", None, 1, PathBuf::from("."), Priority::Normal)
            .await
            .unwrap();
        process_one_task(&deps, task.clone(), CancelHandle::new()).await;

        let failed = repo.get_failed_tasks().await.unwrap();
        assert_eq!(failed.len(), 1);
        assert!(failed[0].summary.contains("Failed to spawn"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn cancelled_attempt_is_final() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let repo = Arc::new(TaskRepository::new(dir.path().to_path_buf()));
        repo.ensure_layout().await.unwrap();

        let script = dir.path().join("slow-agent.sh");
        std::fs::write(&script, "#!/bin/sh\nsleep 30\n").unwrap();
        std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755)).unwrap();
        let deps = deps_with_agent(Arc::clone(&repo), &script.display().to_string());

        let task = repo
            .create_task("stuck", None, 5, PathBuf::from("."), Priority::Normal)
            .await
            .unwrap();

        let cancel = CancelHandle::new();
        let canceller = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(std::time::Duration::from_millis(100)).await;
            canceller.cancel();
        });
        process_one_task(&deps, task.clone(), cancel).await;

        let failed = repo.get_failed_tasks().await.unwrap();
        assert_eq!(failed.len(), 1);
        assert_eq!(failed[0].summary, "cancelled by user");
    }
}
