//! Progress bar fed from the engine's progress reports

use indicatif::{ProgressBar, ProgressStyle};
use tessera_engine::ProgressReport;
use tokio::sync::watch;
use tokio::task::JoinHandle;

/// Create a progress bar counting processed work units
pub fn create_upload_progress(total: u64) -> ProgressBar {
    let pb = ProgressBar::new(total);
    let style = ProgressStyle::default_bar()
        .template("{msg}\n{spinner:.green} [{elapsed_precise}] [{wide_bar:.cyan/blue}] {pos}/{len} units")
        .map(|s| s.progress_chars("#>-"))
        .unwrap_or_else(|_| ProgressStyle::default_bar());
    pb.set_style(style);
    pb.set_message("Uploading");
    pb
}

/// Message shown above the bar for one report
pub fn progress_message(report: &ProgressReport) -> String {
    let minutes = report.elapsed.as_secs_f64() / 60.0;
    match report.rate_per_minute {
        _ if report.remaining == 0 => {
            "Waiting to ensure all upload tasks have been processed".to_string()
        },
        Some(rate) => format!(
            "~{} remaining, {:.1} units/min, {:.1} min elapsed",
            report.remaining, rate, minutes
        ),
        None => format!("~{} remaining, {:.1} min elapsed", report.remaining, minutes),
    }
}

/// Mirrors progress reports onto a bar until finished
pub struct ProgressDisplay {
    bar: ProgressBar,
    task: JoinHandle<()>,
}

impl ProgressDisplay {
    pub fn spawn(mut reports: watch::Receiver<Option<ProgressReport>>, total: u64) -> Self {
        let bar = create_upload_progress(total);
        let task = {
            let bar = bar.clone();
            tokio::spawn(async move {
                while reports.changed().await.is_ok() {
                    let Some(report) = reports.borrow_and_update().clone() else {
                        continue;
                    };
                    bar.set_position(report.expected.saturating_sub(report.remaining));
                    bar.set_message(progress_message(&report));
                }
            })
        };
        Self { bar, task }
    }

    pub fn finish(self) {
        self.task.abort();
        self.bar.finish_and_clear();
    }
}
