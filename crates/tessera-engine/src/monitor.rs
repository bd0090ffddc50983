//! Periodic progress reporting and proactive credential renewal

use crate::controller::JobController;
use crate::credentials::CredentialManager;
use crate::error::Result;
use crate::pool::{PoolStats, StatsSnapshot};
use crate::queue::QueueClient;
use crate::settings::EngineSettings;
use serde::Serialize;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Depth samples kept for the rate estimate
const RATE_WINDOW: usize = 6;

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ProgressReport {
    pub expected: u64,
    /// Approximate items still queued
    pub remaining: u64,
    /// Units per minute over the recent window
    pub rate_per_minute: Option<f64>,
    pub elapsed: Duration,
    pub stats: StatsSnapshot,
}

/// Sliding window of (time, remaining) samples
#[derive(Debug, Default)]
pub struct RateWindow {
    samples: VecDeque<(Instant, u64)>,
}

impl RateWindow {
    pub fn push(&mut self, at: Instant, remaining: u64) {
        if self.samples.len() == RATE_WINDOW {
            self.samples.pop_front();
        }
        self.samples.push_back((at, remaining));
    }

    /// Units drained per minute between the oldest and newest sample
    pub fn per_minute(&self) -> Option<f64> {
        let (first_at, first) = *self.samples.front()?;
        let (last_at, last) = *self.samples.back()?;
        let minutes = last_at.duration_since(first_at).as_secs_f64() / 60.0;
        if minutes <= 0.0 {
            return None;
        }
        Some(first.saturating_sub(last) as f64 / minutes)
    }
}

pub struct ProgressMonitor {
    queue: QueueClient,
    credentials: Arc<CredentialManager>,
    controller: Arc<JobController>,
    stats: Arc<PoolStats>,
    expected: u64,
    interval: Duration,
    renewal_margin: Duration,
    progress: Arc<watch::Sender<Option<ProgressReport>>>,
}

impl ProgressMonitor {
    pub fn new(
        queue: QueueClient,
        credentials: Arc<CredentialManager>,
        controller: Arc<JobController>,
        stats: Arc<PoolStats>,
        expected: u64,
        settings: &EngineSettings,
        progress: Arc<watch::Sender<Option<ProgressReport>>>,
    ) -> Self {
        Self {
            queue,
            credentials,
            controller,
            stats,
            expected,
            interval: settings.progress_interval,
            renewal_margin: settings.renewal_margin,
            progress,
        }
    }

    /// Report until `stop` fires. Failing to renew credentials fails the job.
    pub async fn run(self, stop: CancellationToken) -> Result<()> {
        let started = Instant::now();
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut window = RateWindow::default();

        loop {
            tokio::select! {
                biased;
                _ = stop.cancelled() => return Ok(()),
                _ = ticker.tick() => {},
            }

            if let Err(e) = self.credentials.refresh_if_expiring(self.renewal_margin).await {
                self.controller.fail(&e).await;
                return Err(e);
            }

            let remaining = match self.queue.approximate_depth().await {
                Ok(depth) => depth,
                Err(e) => {
                    warn!(error = %e, "Could not sample queue depth for progress");
                    continue;
                },
            };
            let now = Instant::now();
            window.push(now, remaining);

            let report = ProgressReport {
                expected: self.expected,
                remaining,
                rate_per_minute: window.per_minute(),
                elapsed: now.duration_since(started),
                stats: self.stats.snapshot(),
            };
            match report.rate_per_minute {
                _ if remaining == 0 => {
                    info!("Waiting to ensure all upload tasks have been processed")
                },
                Some(rate) => info!(
                    rate_per_minute = rate,
                    remaining = remaining,
                    expected = self.expected,
                    elapsed_secs = report.elapsed.as_secs(),
                    "Upload progress"
                ),
                None => info!(
                    remaining = remaining,
                    expected = self.expected,
                    elapsed_secs = report.elapsed.as_secs(),
                    "Upload progress"
                ),
            }
            self.progress.send_replace(Some(report));
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_rate_over_window() {
        let mut window = RateWindow::default();
        let start = Instant::now();
        assert!(window.per_minute().is_none());
        window.push(start, 600);
        assert!(window.per_minute().is_none());
        window.push(start + Duration::from_secs(60), 540);
        window.push(start + Duration::from_secs(120), 480);
        assert_eq!(window.per_minute(), Some(60.0));
    }

    #[tokio::test(start_paused = true)]
    async fn test_window_drops_oldest() {
        let mut window = RateWindow::default();
        let start = Instant::now();
        window.push(start, 10_000);
        for i in 1..=RATE_WINDOW as u64 {
            window.push(start + Duration::from_secs(60 * i), 1000 - 10 * i);
        }
        // The 10_000 sample has left the window
        let rate = window.per_minute().unwrap();
        assert!((rate - 10.0).abs() < 1e-9);
    }

    #[tokio::test(start_paused = true)]
    async fn test_rising_depth_reads_as_zero_rate() {
        let mut window = RateWindow::default();
        let start = Instant::now();
        window.push(start, 10);
        window.push(start + Duration::from_secs(30), 50);
        assert_eq!(window.per_minute(), Some(0.0));
    }
}
