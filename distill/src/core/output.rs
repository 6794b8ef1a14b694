//! Execution outcomes and the text the supervisor sees for them.

use std::collections::BTreeMap;
use std::time::Duration;

/// Placeholder shown when a code unit printed nothing.
pub const NO_OUTPUT: &str = "(no output)";

/// Prefix placed before captured diagnostics.
pub const STDERR_MARKER: &str = "[stderr]\n";

/// How a single code-unit execution ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExecStatus {
    /// Ran to completion.
    Normal,
    /// Invoked the termination capability with this payload.
    Terminated { answer: String },
    /// Raised an uncaught error; the trace is already in `stderr`.
    Faulted { error: String },
}

/// Result of executing one code unit against the persistent namespace.
#[derive(Debug, Clone, PartialEq)]
pub struct ExecOutcome {
    /// Full captured standard output (never truncated here).
    pub stdout: String,
    /// Full captured diagnostics, including any error trace.
    pub stderr: String,
    pub elapsed: Duration,
    /// Previews of every non-private namespace binding after execution.
    pub variables: BTreeMap<String, String>,
    pub status: ExecStatus,
}

impl ExecOutcome {
    pub fn final_answer(&self) -> Option<&str> {
        match &self.status {
            ExecStatus::Terminated { answer } => Some(answer),
            _ => None,
        }
    }
}

/// Marker appended after a truncated prefix. Its exact text is part of the
/// supervisor conversation.
pub fn truncation_marker(limit: usize) -> String {
    format!("\n... [truncated to {limit} chars]")
}

/// Cut `text` to `limit` characters and append the truncation marker.
///
/// Text that already has the shape produced by this function for the same
/// limit is returned unchanged.
pub fn truncate_text(text: &str, limit: usize) -> String {
    if text.chars().count() <= limit {
        return text.to_string();
    }
    let marker = truncation_marker(limit);
    if text
        .strip_suffix(marker.as_str())
        .is_some_and(|head| head.chars().count() == limit)
    {
        return text.to_string();
    }
    let prefix: String = text.chars().take(limit).collect();
    format!("{prefix}{marker}")
}

/// Combine stdout and stderr the way they are surfaced to the supervisor.
pub fn combine_streams(stdout: &str, stderr: &str) -> String {
    let mut parts = Vec::with_capacity(2);
    if !stdout.is_empty() {
        parts.push(stdout.to_string());
    }
    if !stderr.is_empty() {
        parts.push(format!("{STDERR_MARKER}{stderr}"));
    }
    if parts.is_empty() {
        NO_OUTPUT.to_string()
    } else {
        parts.join("\n")
    }
}

/// Combined, truncated output of one execution.
pub fn truncate_output(outcome: &ExecOutcome, limit: usize) -> String {
    truncate_text(&combine_streams(&outcome.stdout, &outcome.stderr), limit)
}

/// Per-block entry folded into the next user turn.
pub fn render_block(code: &str, output: &str) -> String {
    format!("Code:\n```python\n{code}```\nOutput:\n{output}")
}
