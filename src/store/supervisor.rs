//! Detached storage writes and the policy applied to their failures.
//!
//! The polling loop never awaits a write. [`PointWriter`] spawns each one on
//! a [`TaskTracker`] and forwards failures to the [`Supervisor`], which
//! either logs them or cancels the application.

use std::sync::Arc;

use anyhow::{anyhow, Result};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use super::{Storage, Store};
use crate::config::ErrorPolicy;
use crate::export::health::HealthMetrics;
use crate::model::{PingPoint, PlayerRecord};

/// A storage operation that failed off the polling path.
#[derive(Debug)]
pub struct StorageFailure {
    pub operation: &'static str,
    pub server: Option<String>,
    pub error: anyhow::Error,
}

/// Sending half of the failure channel.
#[derive(Debug, Clone)]
pub struct FailureReporter {
    tx: mpsc::UnboundedSender<StorageFailure>,
}

impl FailureReporter {
    pub fn report(&self, operation: &'static str, server: Option<String>, error: anyhow::Error) {
        let failure = StorageFailure {
            operation,
            server,
            error,
        };

        if let Err(mpsc::error::SendError(failure)) = self.tx.send(failure) {
            tracing::error!(
                operation = failure.operation,
                error = %failure.error,
                "storage failure after supervisor stopped",
            );
        }
    }
}

/// Creates a connected reporter and supervisor.
pub fn failure_channel(
    policy: ErrorPolicy,
    cancel: CancellationToken,
    health: Option<Arc<HealthMetrics>>,
) -> (FailureReporter, Supervisor) {
    let (tx, rx) = mpsc::unbounded_channel();
    (
        FailureReporter { tx },
        Supervisor {
            rx,
            policy,
            cancel,
            health,
        },
    )
}

/// Applies the configured [`ErrorPolicy`] to reported failures.
pub struct Supervisor {
    rx: mpsc::UnboundedReceiver<StorageFailure>,
    policy: ErrorPolicy,
    cancel: CancellationToken,
    health: Option<Arc<HealthMetrics>>,
}

impl Supervisor {
    /// Runs until `shutdown` fires or every reporter is dropped.
    ///
    /// Under [`ErrorPolicy::Fatal`] the first failure cancels the
    /// application token and is returned as the error.
    pub async fn run(mut self, shutdown: CancellationToken) -> Result<()> {
        loop {
            tokio::select! {
                biased;

                failure = self.rx.recv() => match failure {
                    Some(failure) => self.handle(failure)?,
                    None => return Ok(()),
                },

                _ = shutdown.cancelled() => {
                    while let Ok(failure) = self.rx.try_recv() {
                        self.handle(failure)?;
                    }
                    return Ok(());
                }
            }
        }
    }

    fn handle(&self, failure: StorageFailure) -> Result<()> {
        if let Some(ref h) = self.health {
            h.storage_errors
                .with_label_values(&[failure.operation])
                .inc();
        }

        let server = failure.server.as_deref().unwrap_or("-");

        match self.policy {
            ErrorPolicy::Log => {
                tracing::warn!(
                    operation = failure.operation,
                    server,
                    error = %failure.error,
                    "storage operation failed",
                );
                Ok(())
            }
            ErrorPolicy::Fatal => {
                tracing::error!(
                    operation = failure.operation,
                    server,
                    error = %failure.error,
                    "storage operation failed, shutting down",
                );
                self.cancel.cancel();
                Err(anyhow!(
                    "storage {} failed for {server}: {:#}",
                    failure.operation,
                    failure.error
                ))
            }
        }
    }
}

/// Spawns storage writes without blocking the caller.
#[derive(Clone)]
pub struct PointWriter {
    store: Arc<Storage>,
    tracker: TaskTracker,
    reporter: FailureReporter,
    health: Option<Arc<HealthMetrics>>,
}

impl PointWriter {
    pub fn new(
        store: Arc<Storage>,
        reporter: FailureReporter,
        health: Option<Arc<HealthMetrics>>,
    ) -> Self {
        Self {
            store,
            tracker: TaskTracker::new(),
            reporter,
            health,
        }
    }

    /// Appends `point` in the background.
    pub fn submit_point(&self, point: PingPoint) {
        let store = Arc::clone(&self.store);
        let reporter = self.reporter.clone();
        let health = self.health.clone();

        self.tracker.spawn(async move {
            match store.insert_point(&point).await {
                Ok(()) => {
                    if let Some(ref h) = health {
                        h.points_written.inc();
                    }
                }
                Err(e) => reporter.report("insert_point", Some(point.server_address), e),
            }
        });
    }

    /// Persists a new record for `address` in the background.
    pub fn submit_record(&self, address: String, record: PlayerRecord) {
        let store = Arc::clone(&self.store);
        let reporter = self.reporter.clone();

        self.tracker.spawn(async move {
            if let Err(e) = store.upsert_record(&address, record).await {
                reporter.report("upsert_record", Some(address), e);
            }
        });
    }

    /// Writes still in flight.
    pub fn pending(&self) -> usize {
        self.tracker.len()
    }

    /// Waits for every write submitted so far.
    pub async fn flush(&self) {
        self.tracker.close();
        self.tracker.wait().await;
        self.tracker.reopen();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;

    async fn open_storage() -> Arc<Storage> {
        let storage = Storage::Memory(MemoryStore::new());
        storage.initialize().await.expect("initialize");
        storage.ensure_schema().await.expect("schema");
        Arc::new(storage)
    }

    #[tokio::test]
    async fn test_writes_are_flushed() {
        let storage = open_storage().await;
        let (reporter, _supervisor) =
            failure_channel(ErrorPolicy::Fatal, CancellationToken::new(), None);
        let writer = PointWriter::new(Arc::clone(&storage), reporter, None);

        for ts in 0..10 {
            writer.submit_point(PingPoint::new(ts, "a", Some(1)));
        }
        writer.submit_record("a".to_string(), PlayerRecord::new(1, 0));
        writer.flush().await;

        assert_eq!(writer.pending(), 0);
        assert_eq!(storage.get_recent_points(0, 10).await.expect("scan").len(), 10);
        assert_eq!(
            storage.get_record("a").await.expect("get"),
            Some(PlayerRecord::new(1, 0))
        );

        // Still usable after a flush.
        writer.submit_point(PingPoint::new(11, "a", None));
        writer.flush().await;
        assert_eq!(storage.get_recent_points(0, 11).await.expect("scan").len(), 11);
    }

    #[tokio::test]
    async fn test_fatal_policy_cancels_application() {
        let storage = open_storage().await;
        storage.close().await.expect("close");

        let cancel = CancellationToken::new();
        let health = Arc::new(HealthMetrics::new(":0").expect("metrics"));
        let (reporter, supervisor) =
            failure_channel(ErrorPolicy::Fatal, cancel.clone(), Some(Arc::clone(&health)));
        let writer = PointWriter::new(storage, reporter, None);

        writer.submit_point(PingPoint::new(1, "a", Some(1)));
        writer.flush().await;

        let err = supervisor
            .run(CancellationToken::new())
            .await
            .expect_err("fatal failure");
        assert!(err.to_string().contains("insert_point"));
        assert!(cancel.is_cancelled());
        assert_eq!(
            health
                .storage_errors
                .with_label_values(&["insert_point"])
                .get(),
            1.0
        );
    }

    #[tokio::test]
    async fn test_log_policy_keeps_running() {
        let storage = open_storage().await;
        storage.close().await.expect("close");

        let cancel = CancellationToken::new();
        let (reporter, supervisor) = failure_channel(ErrorPolicy::Log, cancel.clone(), None);
        let writer = PointWriter::new(storage, reporter, None);

        writer.submit_record("a".to_string(), PlayerRecord::new(1, 1));
        writer.flush().await;

        let shutdown = CancellationToken::new();
        shutdown.cancel();
        supervisor.run(shutdown).await.expect("log policy");
        assert!(!cancel.is_cancelled());
    }
}
