//! Human-readable run summaries and process exit codes.

use std::fmt::Write;

use crate::orchestrator;
use crate::types::{Run, RunState};

/// Longest failure message shown per stack.
const MAX_CAUSE_LEN: usize = 512;

/// Exit code for configuration, planning and ledger errors.
pub const EXIT_ERROR: i32 = 3;

/// Process exit code for a finished run.
///
/// - 0: succeeded
/// - 1: failed, every deployed stack rolled back
/// - 2: rollback or teardown incomplete; manual intervention needed
pub fn exit_code(run: &Run) -> i32 {
    match run.state {
        RunState::Succeeded => 0,
        RunState::FailedRolledBack => 1,
        RunState::FailedRollbackIncomplete | RunState::TeardownIncomplete => 2,
        RunState::InProgress => EXIT_ERROR,
    }
}

/// Exit code for the result of a deploy or teardown.
///
/// An abandoned run could not be journaled. That is a ledger error, so it
/// exits with [`EXIT_ERROR`] whatever state the run was left in.
pub fn outcome_exit_code(outcome: &orchestrator::Result<Run>) -> i32 {
    match outcome {
        Ok(run) => exit_code(run),
        Err(_) => EXIT_ERROR,
    }
}

/// Renders a run as plain text.
///
/// ```text
/// run 20240101T000000Z-1a2b3c4d (deploy, bundle b42): FAILED_ROLLBACK_INCOMPLETE
///   network  shop-network  ROLLBACK_FAILED  backend reported DELETE_FAILED
///   app      staging-app   DEPLOY_FAILED    timed out after 3600s
///
/// manual intervention required:
///   network (shop-network)
///   app (staging-app)
/// ```
pub fn format_run(run: &Run) -> String {
    let mut out = String::new();

    let _ = write!(out, "run {} ({}", run.id, run.kind);
    if let Some(bundle) = &run.bundle {
        let _ = write!(out, ", bundle {}", bundle);
    }
    let _ = writeln!(out, "): {}", run.state);
    if run.aborted {
        let _ = writeln!(out, "  aborted by operator");
    }
    if let Some(failed) = &run.failed_stack {
        let _ = writeln!(out, "  stopped at {}", failed);
    }

    let name_width = run
        .records
        .iter()
        .map(|r| r.stack.as_str().len())
        .max()
        .unwrap_or(0);
    let physical_width = run
        .records
        .iter()
        .map(|r| r.stack_name.len())
        .max()
        .unwrap_or(0);

    for record in &run.records {
        let _ = write!(
            out,
            "  {:<nw$}  {:<pw$}  {:<15}",
            record.stack.as_str(),
            record.stack_name,
            record.state.name(),
            nw = name_width,
            pw = physical_width,
        );
        if let Some(cause) = &record.last_error {
            let _ = write!(out, "  {}", truncate_with_suffix(&cause.to_string(), MAX_CAUSE_LEN));
        }
        out.truncate(out.trim_end().len());
        out.push('\n');
    }

    let inconsistent = run.inconsistent_stacks();
    if !inconsistent.is_empty() {
        let _ = writeln!(out, "\nmanual intervention required:");
        for name in &inconsistent {
            match run.record(name) {
                Some(record) => {
                    let _ = writeln!(out, "  {} ({})", name, record.stack_name);
                }
                None => {
                    let _ = writeln!(out, "  {}", name);
                }
            }
        }
    }
    out
}

/// Truncates a string to `max_len` bytes with a "... [truncated]" suffix.
fn truncate_with_suffix(s: &str, max_len: usize) -> String {
    const SUFFIX: &str = "... [truncated]";

    if s.len() <= max_len {
        return s.to_string();
    }

    let mut end = max_len.saturating_sub(SUFFIX.len());
    while end > 0 && !s.is_char_boundary(end) {
        end -= 1;
    }

    format!("{}{}", &s[..end], SUFFIX)
}
