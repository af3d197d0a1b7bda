//! Single-flight polling rounds.
//!
//! Every `rates.ping_all` the scheduler pings all registered servers under one
//! shared timestamp, records the results and emits a single `updateServers`
//! broadcast. A tick that arrives while a round is still running is rejected
//! with [`RoundError::RoundInFlight`].

pub mod retention;

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::Serialize;
use thiserror::Error;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use crate::broadcast::{Broadcaster, UPDATE_SERVERS};
use crate::config::{Config, PollStrategy};
use crate::export::health::HealthMetrics;
use crate::model::{clamp_player_count_for, epoch_millis, to_seconds, PingPayload, PingPoint};
use crate::ping::{sanitize_favicon, PingError, PingResponse, PingTarget, Pinger};
use crate::registration::{ServerRegistry, ServerUpdate};
use crate::store::supervisor::PointWriter;
use crate::time::TimeAxis;

#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum RoundError {
    #[error(
        "started re-pinging servers before the last round finished, rates.ping_all may be too short"
    )]
    RoundInFlight,
}

/// Held for the lifetime of a round; releases the gate on drop.
#[derive(Debug)]
pub struct RoundGuard {
    gate: Arc<AtomicBool>,
}

impl Drop for RoundGuard {
    fn drop(&mut self) {
        self.gate.store(false, Ordering::Release);
    }
}

/// Scheduler knobs taken from [`Config`].
#[derive(Debug, Clone)]
pub struct SchedulerSettings {
    pub ping_all: Duration,
    pub connect_timeout: Duration,
    /// Outer bound on one ping, enforced by the scheduler.
    pub ping_deadline: Duration,
    pub strategy: PollStrategy,
    pub max_concurrency: usize,
    pub log_to_database: bool,
    pub log_failed_pings: bool,
}

impl SchedulerSettings {
    pub fn from_config(cfg: &Config) -> Self {
        Self {
            ping_all: cfg.rates.ping_all,
            connect_timeout: cfg.rates.connect_timeout,
            ping_deadline: cfg.ping_deadline(),
            strategy: cfg.scheduler.strategy,
            max_concurrency: cfg.scheduler.max_concurrency,
            log_to_database: cfg.storage.log_to_database,
            log_failed_pings: cfg.log_failed_pings,
        }
    }
}

/// Body of the `updateServers` broadcast.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RoundBroadcast {
    /// Epoch seconds.
    pub timestamp: i64,
    pub update_history_graph: bool,
    /// Keyed by server id.
    pub updates: BTreeMap<usize, ServerUpdate>,
}

/// What one round did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoundSummary {
    /// Epoch milliseconds shared by every point of the round.
    pub timestamp: i64,
    pub update_history_graph: bool,
    pub servers: usize,
    pub failures: usize,
    pub elapsed: Duration,
}

pub struct Scheduler<P, B> {
    settings: SchedulerSettings,
    registry: Arc<ServerRegistry>,
    pinger: Arc<P>,
    broadcaster: Arc<B>,
    axis: parking_lot::Mutex<TimeAxis>,
    writer: Option<PointWriter>,
    health: Option<Arc<HealthMetrics>>,
    gate: Arc<AtomicBool>,
}

impl<P, B> Scheduler<P, B>
where
    P: Pinger + 'static,
    B: Broadcaster + 'static,
{
    pub fn new(
        settings: SchedulerSettings,
        registry: Arc<ServerRegistry>,
        axis: TimeAxis,
        pinger: Arc<P>,
        broadcaster: Arc<B>,
    ) -> Self {
        Self {
            settings,
            registry,
            pinger,
            broadcaster,
            axis: parking_lot::Mutex::new(axis),
            writer: None,
            health: None,
            gate: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Persists points and new records through `writer` when database
    /// logging is enabled.
    pub fn with_writer(mut self, writer: PointWriter) -> Self {
        self.writer = Some(writer);
        self
    }

    pub fn with_health(mut self, health: Arc<HealthMetrics>) -> Self {
        self.health = Some(health);
        self
    }

    /// Whether a round is running.
    pub fn is_running(&self) -> bool {
        self.gate.load(Ordering::Acquire)
    }

    /// Copy of the shared time axis.
    pub fn axis_points(&self) -> Vec<i64> {
        self.axis.lock().points().to_vec()
    }

    /// Claims the round gate.
    pub fn try_begin(&self) -> Result<RoundGuard, RoundError> {
        self.gate
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .map_err(|_| RoundError::RoundInFlight)?;

        Ok(RoundGuard {
            gate: Arc::clone(&self.gate),
        })
    }

    /// Runs one round at `now` (epoch ms), or fails if one is in flight.
    pub async fn run_round(&self, now: i64) -> Result<RoundSummary, RoundError> {
        let guard = self.try_begin()?;
        Ok(self.execute_round(guard, now).await)
    }

    /// Ticks every `ping_all` until `cancel` fires, then waits for the
    /// running round.
    pub async fn run(self: Arc<Self>, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(self.settings.ping_all);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        let rounds = TaskTracker::new();

        tracing::info!(
            servers = self.registry.len(),
            interval = ?self.settings.ping_all,
            strategy = ?self.settings.strategy,
            "scheduler started",
        );

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    match self.try_begin() {
                        Ok(guard) => {
                            let this = Arc::clone(&self);
                            rounds.spawn(async move {
                                this.execute_round(guard, epoch_millis()).await;
                            });
                        }
                        Err(e) => {
                            tracing::warn!(error = %e, "skipping tick");
                            if let Some(ref h) = self.health {
                                h.rounds_rejected.inc();
                            }
                        }
                    }
                }
            }
        }

        rounds.close();
        rounds.wait().await;

        tracing::info!("scheduler stopped");
    }

    async fn execute_round(&self, _guard: RoundGuard, now: i64) -> RoundSummary {
        let started = Instant::now();
        let stamp = self.axis.lock().new_point_timestamp(now);
        let targets = self.registry.targets();

        let results = match self.settings.strategy {
            PollStrategy::Sequential => self.ping_sequential(&targets).await,
            PollStrategy::Parallel => self.ping_parallel(&targets).await,
        };

        let mut updates = BTreeMap::new();
        let mut failures = 0;

        for (server_id, (target, result)) in targets.iter().zip(results).enumerate() {
            let (payload, error) = match result {
                Ok(response) => (Some(self.to_payload(&target.address, response)), None),
                Err(e) => {
                    failures += 1;
                    self.record_failure(&target.address, &e);
                    (None, Some(e))
                }
            };

            if self.settings.log_to_database {
                if let Some(ref writer) = self.writer {
                    writer.submit_point(PingPoint::new(
                        stamp.timestamp,
                        target.address.as_str(),
                        payload.as_ref().map(|p| p.player_count),
                    ));
                }
            }

            let Some(registration) = self.registry.get(server_id) else {
                continue;
            };

            let (update, new_record) = {
                let mut registration = registration.lock();
                let update = registration.handle_ping(
                    stamp.timestamp,
                    payload.as_ref(),
                    error.as_ref(),
                    stamp.update_history_graph,
                );
                let new_record = update.record.map(|_| registration.record());
                (update, new_record)
            };

            if let (true, Some(writer), Some(record)) =
                (self.settings.log_to_database, self.writer.as_ref(), new_record)
            {
                writer.submit_record(target.address.clone(), record);
            }

            updates.insert(server_id, update);
        }

        let body = RoundBroadcast {
            timestamp: to_seconds(stamp.timestamp),
            update_history_graph: stamp.update_history_graph,
            updates,
        };

        match serde_json::to_value(&body) {
            Ok(payload) => self.broadcaster.broadcast(UPDATE_SERVERS, payload),
            Err(e) => tracing::error!(error = %e, "encoding round broadcast"),
        }

        let elapsed = started.elapsed();

        if let Some(ref h) = self.health {
            h.rounds_total.inc();
            h.round_duration.observe(elapsed.as_secs_f64());
        }

        tracing::debug!(
            timestamp = stamp.timestamp,
            servers = targets.len(),
            failures,
            update_history_graph = stamp.update_history_graph,
            elapsed_ms = elapsed.as_millis() as u64,
            "round complete",
        );

        RoundSummary {
            timestamp: stamp.timestamp,
            update_history_graph: stamp.update_history_graph,
            servers: targets.len(),
            failures,
            elapsed,
        }
    }

    async fn ping_sequential(
        &self,
        targets: &[PingTarget],
    ) -> Vec<Result<PingResponse, PingError>> {
        let mut results = Vec::with_capacity(targets.len());
        for target in targets {
            results.push(
                ping_with_deadline(
                    self.pinger.as_ref(),
                    target,
                    self.settings.connect_timeout,
                    self.settings.ping_deadline,
                )
                .await,
            );
        }
        results
    }

    async fn ping_parallel(&self, targets: &[PingTarget]) -> Vec<Result<PingResponse, PingError>> {
        let permits = Arc::new(Semaphore::new(self.settings.max_concurrency.max(1)));
        let mut tasks = JoinSet::new();

        for (idx, target) in targets.iter().cloned().enumerate() {
            let pinger = Arc::clone(&self.pinger);
            let permits = Arc::clone(&permits);
            let timeout = self.settings.connect_timeout;
            let deadline = self.settings.ping_deadline;

            tasks.spawn(async move {
                let result = match permits.acquire_owned().await {
                    Ok(_permit) => {
                        ping_with_deadline(pinger.as_ref(), &target, timeout, deadline).await
                    }
                    Err(e) => Err(PingError::Aborted(e.to_string())),
                };
                (idx, result)
            });
        }

        let mut slots: Vec<Option<Result<PingResponse, PingError>>> =
            targets.iter().map(|_| None).collect();

        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((idx, result)) => {
                    if let Some(slot) = slots.get_mut(idx) {
                        *slot = Some(result);
                    }
                }
                Err(e) => tracing::error!(error = %e, "ping task failed"),
            }
        }

        slots
            .into_iter()
            .map(|slot| slot.unwrap_or_else(|| Err(PingError::Aborted("no result".to_string()))))
            .collect()
    }

    fn to_payload(&self, address: &str, response: PingResponse) -> PingPayload {
        let clamped = clamp_player_count_for(address, response.player_count);

        if let Some(ref h) = self.health {
            if clamped.flagged {
                h.player_counts_clamped.inc();
            }
            h.player_count
                .with_label_values(&[address])
                .set(f64::from(clamped.value));
        }

        PingPayload {
            player_count: clamped.value,
            protocol_version: response.protocol_version,
            favicon: sanitize_favicon(response.favicon),
        }
    }

    fn record_failure(&self, address: &str, error: &PingError) {
        if self.settings.log_failed_pings {
            tracing::error!(server = %address, error = %error, "failed to ping server");
        } else {
            tracing::debug!(server = %address, error = %error, "failed to ping server");
        }

        if let Some(ref h) = self.health {
            h.ping_failures.with_label_values(&[address]).inc();
        }
    }
}

/// Pings `target`, bounding the call by `deadline` even if the pinger
/// ignores `timeout`.
pub async fn ping_with_deadline<P: Pinger + ?Sized>(
    pinger: &P,
    target: &PingTarget,
    timeout: Duration,
    deadline: Duration,
) -> Result<PingResponse, PingError> {
    match tokio::time::timeout(deadline, pinger.ping(target, timeout)).await {
        Ok(result) => result,
        Err(_) => Err(PingError::DeadlineExceeded(deadline)),
    }
}
