//! Result classification — marker detection with a heuristic fallback.
//!
//! The agent is instructed to end its output with an explicit completion or
//! failure marker. When it does, the marker is authoritative. When it does
//! not, only the tail of the output is inspected, since the conclusion of a
//! long transcript lives near the end.
//!
//! Tie-break policy (LAST-SUCCESS-WINS): when the tail contains both a
//! failure pattern and a success indicator, success wins only if the last
//! success indicator occurs after the first failure match. A transient
//! error followed by "all tests passed" is a success; a success message
//! followed by a fresh error is not.

use std::sync::LazyLock;

use regex::Regex;

/// Sentinel the agent emits to signal it met the completion criteria.
pub const COMPLETION_MARKER: &str = "<promise>COMPLETE</promise>";
/// Sentinel the agent emits to signal it could not.
pub const FAILURE_MARKER: &str = "<promise>FAILED</promise>";

/// Bytes of output tail inspected by the heuristic fallback.
const TAIL_WINDOW: usize = 2000;

/// Patterns that indicate a hard failure. Evaluated in order; the first
/// match decides, and its capture group supplies the reason.
static CRITICAL_PATTERNS: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    [
        r"(?i)error:\s*(.{0,100})",
        r"(?i)fatal:\s*(.{0,100})",
        r"(?i)exception:\s*(.{0,100})",
        r"(?i)panic:\s*(.{0,100})",
        r"(?i)failed to\s+(.{0,50})",
        r"(?i)could not\s+(.{0,50})",
        r"(?i)unable to\s+(.{0,50})",
    ]
    .iter()
    .map(|p| Regex::new(p).expect("static pattern"))
    .collect()
});

/// Phrases that indicate the agent believes it succeeded.
static SUCCESS_INDICATORS: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)completed successfully|all tests passed|build succeeded|successfully")
        .expect("static pattern")
});

/// Reason extraction after the failure marker: up to 200 characters on the
/// same line, behind an optional "Reason:" label.
static MARKER_REASON: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)<promise>FAILED</promise>\s*(?:reason:)?\s*(.{1,200})")
        .expect("static pattern")
});

/// Generic error-message patterns used when the failure marker carries no
/// inline reason.
static GENERIC_REASONS: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    [r"(?i)error:\s*(.{1,150})", r"(?i)failed:\s*(.{1,150})"]
        .iter()
        .map(|p| Regex::new(p).expect("static pattern"))
        .collect()
});

/// Outcome of classifying one attempt's output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Verdict {
    pub success: bool,
    pub reason: Option<String>,
}

impl Verdict {
    fn success() -> Self {
        Self {
            success: true,
            reason: None,
        }
    }

    fn failure(reason: impl Into<String>) -> Self {
        Self {
            success: false,
            reason: Some(reason.into()),
        }
    }
}

/// Classify raw agent output into a success/failure verdict.
///
/// `strict` requires an explicit marker for success and is used for tasks
/// that allow more than one attempt; without it an ambiguous transcript
/// would complete a retryable task by default. Single-attempt tasks keep
/// the permissive default.
///
/// Pure and deterministic: no I/O, no randomness.
pub fn classify(output: &str, strict: bool) -> Verdict {
    let has_completion = output.contains(COMPLETION_MARKER);
    let has_failure = output.contains(FAILURE_MARKER);

    if has_completion && !has_failure {
        return Verdict::success();
    }
    if has_failure {
        return Verdict::failure(extract_failure_reason(output));
    }

    // No markers: heuristic pass over the tail only.
    let tail = output_tail(output, TAIL_WINDOW);
    let last_success = SUCCESS_INDICATORS.find_iter(tail).last().map(|m| m.start());

    for pattern in CRITICAL_PATTERNS.iter() {
        let Some(caps) = pattern.captures(tail) else {
            continue;
        };
        let failure_start = caps.get(0).map(|m| m.start()).unwrap_or(0);
        if let Some(success_start) = last_success {
            if success_start > failure_start {
                return Verdict::success();
            }
        }
        let reason = caps
            .get(1)
            .map(|m| m.as_str().trim().to_string())
            .filter(|r| !r.is_empty())
            .unwrap_or_else(|| "error detected in output".to_string());
        return Verdict::failure(reason);
    }

    if last_success.is_some() {
        return Verdict::success();
    }

    if strict {
        Verdict::failure("no completion signal")
    } else {
        Verdict::success()
    }
}

/// Extract a human-readable reason from output containing the failure
/// marker. Falls back to generic error patterns, then "unknown error".
fn extract_failure_reason(output: &str) -> String {
    if let Some(caps) = MARKER_REASON.captures(output) {
        if let Some(m) = caps.get(1) {
            let reason = m.as_str().trim();
            if !reason.is_empty() {
                return reason.to_string();
            }
        }
    }

    for pattern in GENERIC_REASONS.iter() {
        if let Some(caps) = pattern.captures(output) {
            if let Some(m) = caps.get(1) {
                return m.as_str().trim().to_string();
            }
        }
    }

    "unknown error".to_string()
}

/// Last `max_bytes` of `output`, snapped back to a char boundary.
fn output_tail(output: &str, max_bytes: usize) -> &str {
    if output.len() <= max_bytes {
        return output;
    }
    let mut start = output.len() - max_bytes;
    while start < output.len() && !output.is_char_boundary(start) {
        start += 1;
    }
    &output[start..]
}
