//! Periodic deletion of points older than the retention horizon.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, SecondsFormat, Utc};
use tokio_util::sync::CancellationToken;

use crate::export::health::HealthMetrics;
use crate::model::epoch_millis;
use crate::store::supervisor::FailureReporter;
use crate::store::{RetentionReport, Storage, Store};

pub struct RetentionTask {
    store: Arc<Storage>,
    horizon: Duration,
    interval: Duration,
    reporter: FailureReporter,
    health: Option<Arc<HealthMetrics>>,
}

impl RetentionTask {
    pub fn new(
        store: Arc<Storage>,
        horizon: Duration,
        interval: Duration,
        reporter: FailureReporter,
        health: Option<Arc<HealthMetrics>>,
    ) -> Self {
        Self {
            store,
            horizon,
            interval,
            reporter,
            health,
        }
    }

    /// Deletes points older than `now - horizon`.
    pub async fn run_once(&self, now: i64) -> Result<RetentionReport> {
        let cutoff = now - self.horizon.as_millis() as i64;

        let report = self
            .store
            .delete_older_than(cutoff)
            .await
            .with_context(|| format!("deleting pings older than {}", format_cutoff(cutoff)))?;

        tracing::info!(
            cutoff = %format_cutoff(cutoff),
            deleted = ?report.deleted,
            elapsed_ms = report.elapsed.as_millis() as u64,
            "deleted old pings",
        );

        if let Some(ref h) = self.health {
            h.retention_runs.inc();
            h.retention_duration.observe(report.elapsed.as_secs_f64());
        }

        Ok(report)
    }

    /// Repeats [`Self::run_once`] every interval until cancelled.
    ///
    /// The first sweep runs one interval from now; startup runs its own.
    /// A zero interval returns immediately.
    pub async fn run(self, cancel: CancellationToken) {
        if self.interval.is_zero() {
            tracing::info!("periodic retention disabled");
            return;
        }

        let start = tokio::time::Instant::now() + self.interval;
        let mut ticker = tokio::time::interval_at(start, self.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = ticker.tick() => {
                    if let Err(e) = self.run_once(epoch_millis()).await {
                        self.reporter.report("delete_older_than", None, e);
                    }
                }
            }
        }
    }
}

/// Renders an epoch-ms cutoff as RFC 3339.
fn format_cutoff(millis: i64) -> String {
    DateTime::<Utc>::from_timestamp_millis(millis)
        .map(|dt| dt.to_rfc3339_opts(SecondsFormat::Secs, true))
        .unwrap_or_else(|| millis.to_string())
}
