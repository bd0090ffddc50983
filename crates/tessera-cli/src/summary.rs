//! Final run summary and exit codes

use std::fmt::Write;
use tessera_engine::{IngestSummary, RunOutcome};

/// Human-readable summary printed when a run ends
pub fn render_summary(summary: &IngestSummary) -> String {
    let mut out = String::new();
    let stats = &summary.stats;
    let _ = writeln!(out, "Ingest job {}: {}", summary.job_id, summary.status);
    let _ = writeln!(out, "  Uploaded:  {} of {}", stats.uploaded, summary.expected);
    let _ = writeln!(out, "  Skipped:   {}", stats.skipped);
    let _ = writeln!(out, "  Retried:   {}", stats.retries);
    let _ = writeln!(out, "  Elapsed:   {:.1} minutes", summary.elapsed.as_secs_f64() / 60.0);
    let _ = write!(out, "  {}", outcome_line(summary));
    out
}

fn outcome_line(summary: &IngestSummary) -> String {
    match &summary.outcome {
        RunOutcome::Completed => "Upload complete.".to_string(),
        RunOutcome::Cancelled => "Job was cancelled.".to_string(),
        RunOutcome::Failed { reason } => format!("Job failed: {reason}"),
        RunOutcome::Drained => format!(
            "Queue drained. Run 'tessera --job-id {} --complete' once every client has finished.",
            summary.job_id
        ),
        RunOutcome::Uncovered { uploaded, expected } => format!(
            "Queue drained but only {uploaded} of {expected} units were recorded. Resume with --job-id {}.",
            summary.job_id
        ),
        RunOutcome::Interrupted => format!(
            "Stopped. Resume by providing ingest job id '{}' to the client.",
            summary.job_id
        ),
    }
}

/// Process exit code for a finished run
pub fn exit_code(summary: &IngestSummary) -> i32 {
    if summary.is_success() {
        0
    } else {
        1
    }
}
