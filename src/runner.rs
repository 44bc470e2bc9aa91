//! Agent process supervision — spawn, stream capture, timeout, cancellation.
//!
//! One run = one spawned agent process. The prompt goes in on stdin, stdout
//! and stderr are pumped line-by-line into a single combined transcript
//! (each stream's own ordering is preserved; interleaving between the two
//! is best-effort), and every line is also forwarded to an observer for
//! live progress display.

use std::path::PathBuf;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWriteExt, BufReader};
use tokio::process::Command;
use tokio::sync::Notify;

use crate::error::ProcessError;

/// Observer invoked with every output line as it arrives. Purely a side
/// channel for progress UIs; the returned transcript is authoritative.
pub type LineObserver = Arc<dyn Fn(&str) + Send + Sync>;

/// Everything needed to launch one agent attempt.
#[derive(Debug, Clone)]
pub struct AgentInvocation {
    pub command: String,
    pub args: Vec<String>,
    pub working_dir: PathBuf,
    /// Prompt written to the process's stdin, which is then closed.
    pub stdin: String,
    pub timeout: Duration,
}

/// Result of a run that produced an exit status.
#[derive(Debug, Clone)]
pub struct RunOutcome {
    pub exit_code: i32,
    /// Combined stdout + stderr transcript.
    pub output: String,
}

/// Handle for terminating an in-flight run from outside.
///
/// Cloneable; cancelling before the run starts waiting still takes effect.
#[derive(Debug, Clone, Default)]
pub struct CancelHandle {
    inner: Arc<CancelInner>,
}

#[derive(Debug, Default)]
struct CancelInner {
    cancelled: AtomicBool,
    notify: Notify,
}

impl CancelHandle {
    pub fn new() -> Self {
        Self::default()
    }

    /// Request termination of the associated run.
    pub fn cancel(&self) {
        self.inner.cancelled.store(true, Ordering::SeqCst);
        self.inner.notify.notify_waiters();
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.cancelled.load(Ordering::SeqCst)
    }

    /// Resolve once [`cancel`](Self::cancel) has been called.
    pub async fn cancelled(&self) {
        // Create the future before checking the flag so a cancel between
        // the check and the await cannot be missed.
        let notified = self.inner.notify.notified();
        if self.is_cancelled() {
            return;
        }
        notified.await;
    }
}

/// Run the agent once and capture its combined output.
///
/// The timeout and external cancellation both kill the process; timeout
/// surfaces as [`ProcessError::Timeout`], cancellation as
/// [`ProcessError::Cancelled`]. The caller turns either into a task
/// failure with an appropriate reason.
pub async fn run_agent(
    invocation: &AgentInvocation,
    cancel: &CancelHandle,
    observer: Option<LineObserver>,
) -> Result<RunOutcome, ProcessError> {
    let mut child = Command::new(&invocation.command)
        .args(&invocation.args)
        .current_dir(&invocation.working_dir)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .map_err(|e| ProcessError::Spawn {
            command: invocation.command.clone(),
            source: e,
        })?;

    // Written from a separate task so a full pipe can never stall the
    // timeout clock below; an agent that exits without reading is fine.
    if let Some(mut stdin) = child.stdin.take() {
        let payload = invocation.stdin.clone();
        tokio::spawn(async move {
            let _ = stdin.write_all(payload.as_bytes()).await;
            let _ = stdin.shutdown().await;
        });
    }

    let transcript = Arc::new(Mutex::new(String::new()));
    let mut pumps = Vec::new();
    if let Some(stdout) = child.stdout.take() {
        pumps.push(tokio::spawn(pump_lines(
            stdout,
            Arc::clone(&transcript),
            observer.clone(),
        )));
    }
    if let Some(stderr) = child.stderr.take() {
        pumps.push(tokio::spawn(pump_lines(
            stderr,
            Arc::clone(&transcript),
            observer,
        )));
    }

    let timeout_minutes = invocation.timeout.as_secs() / 60;

    // The wait future borrows the child, so it is scoped off before any
    // kill below.
    enum RunEnd {
        Exited(std::io::Result<std::process::ExitStatus>),
        TimedOut,
        Cancelled,
    }

    let end = {
        let wait = child.wait();
        tokio::pin!(wait);
        tokio::select! {
            waited = tokio::time::timeout(invocation.timeout, &mut wait) => match waited {
                Ok(status) => RunEnd::Exited(status),
                Err(_) => RunEnd::TimedOut,
            },
            _ = cancel.cancelled() => RunEnd::Cancelled,
        }
    };

    let status = match end {
        RunEnd::Exited(status) => status?,
        RunEnd::TimedOut => {
            let _ = child.kill().await;
            return Err(ProcessError::Timeout {
                minutes: timeout_minutes,
            });
        }
        RunEnd::Cancelled => {
            let _ = child.kill().await;
            return Err(ProcessError::Cancelled);
        }
    };

    // Drain the pumps so the transcript is complete before returning.
    for pump in pumps {
        let _ = pump.await;
    }

    let output = transcript
        .lock()
        .map(|t| t.clone())
        .unwrap_or_default();

    Ok(RunOutcome {
        exit_code: status.code().unwrap_or(-1),
        output,
    })
}

/// Read one stream line-by-line into the shared transcript, forwarding
/// each line to the observer.
async fn pump_lines<R: AsyncRead + Unpin>(
    stream: R,
    transcript: Arc<Mutex<String>>,
    observer: Option<LineObserver>,
) {
    let mut lines = BufReader::new(stream).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        if let Ok(mut t) = transcript.lock() {
            t.push_str(&line);
            t.push('\n');
        }
        if let Some(ref observe) = observer {
            observe(&line);
        }
    }
}

/// Advisory human-readable reason for a non-zero exit code.
pub fn exit_code_reason(code: i32) -> String {
    match code {
        126 => "permission denied (exit code 126)".to_string(),
        127 => "command not found (exit code 127)".to_string(),
        130 => "interrupted (exit code 130)".to_string(),
        137 => "killed (exit code 137)".to_string(),
        143 => "terminated (exit code 143)".to_string(),
        n => format!("exit code {n}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sh(script: &str, timeout: Duration) -> AgentInvocation {
        AgentInvocation {
            command: "/bin/sh".to_string(),
            args: vec!["-c".to_string(), script.to_string()],
            working_dir: PathBuf::from("."),
            stdin: String::new(),
            timeout,
        }
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn captures_stdout_and_exit_code() {
        let invocation = sh("echo hello", Duration::from_secs(5));
        let outcome = run_agent(&invocation, &CancelHandle::new(), None)
            .await
            .unwrap();
        assert_eq!(outcome.exit_code, 0);
        assert!(outcome.output.contains("hello"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn captures_stderr_too() {
        let invocation = sh("echo oops >&2; exit 3", Duration::from_secs(5));
        let outcome = run_agent(&invocation, &CancelHandle::new(), None)
            .await
            .unwrap();
        assert_eq!(outcome.exit_code, 3);
        assert!(outcome.output.contains("oops"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn stdin_payload_reaches_the_process() {
        let mut invocation = sh("cat", Duration::from_secs(5));
        invocation.stdin = "payload from stdin".to_string();
        let outcome = run_agent(&invocation, &CancelHandle::new(), None)
            .await
            .unwrap();
        assert!(outcome.output.contains("payload from stdin"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn observer_sees_each_line() {
        let seen: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let observer: LineObserver = Arc::new(move |line| {
            sink.lock().unwrap().push(line.to_string());
        });

        let invocation = sh("echo one; echo two", Duration::from_secs(5));
        run_agent(&invocation, &CancelHandle::new(), Some(observer))
            .await
            .unwrap();

        let seen = seen.lock().unwrap();
        assert_eq!(seen.as_slice(), ["one", "two"]);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn timeout_kills_the_process() {
        let invocation = sh("sleep 30", Duration::from_millis(200));
        let err = run_agent(&invocation, &CancelHandle::new(), None)
            .await
            .unwrap_err();
        assert!(matches!(err, ProcessError::Timeout { .. }));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn cancel_resolves_the_run_promptly() {
        let cancel = CancelHandle::new();
        let canceller = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            canceller.cancel();
        });

        let invocation = sh("sleep 30", Duration::from_secs(60));
        let start = std::time::Instant::now();
        let err = run_agent(&invocation, &cancel, None).await.unwrap_err();
        assert!(matches!(err, ProcessError::Cancelled));
        assert!(start.elapsed() < Duration::from_secs(5));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn cancel_before_run_takes_effect() {
        let cancel = CancelHandle::new();
        cancel.cancel();
        let invocation = sh("sleep 30", Duration::from_secs(60));
        let err = run_agent(&invocation, &cancel, None).await.unwrap_err();
        assert!(matches!(err, ProcessError::Cancelled));
    }

    #[tokio::test]
    async fn spawn_failure_is_reported() {
        let invocation = AgentInvocation {
            command: "/definitely/not/a/command".to_string(),
            args: vec![],
            working_dir: PathBuf::from("."),
            stdin: String::new(),
            timeout: Duration::from_secs(5),
        };
        let err = run_agent(&invocation, &CancelHandle::new(), None)
            .await
            .unwrap_err();
        assert!(matches!(err, ProcessError::Spawn { .. }));
    }

    #[test]
    fn exit_code_reasons() {
        assert!(exit_code_reason(127).contains("not found"));
        assert!(exit_code_reason(126).contains("permission"));
        assert!(exit_code_reason(137).contains("killed"));
        assert_eq!(exit_code_reason(42), "exit code 42");
    }
}
