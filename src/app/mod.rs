use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{error, info, warn};

use crate::broadcast::{ChannelBroadcaster, Message};
use crate::config::Config;
use crate::export::health::HealthMetrics;
use crate::graph;
use crate::model::epoch_millis;
use crate::ping::{Pinger, ProtocolPinger};
use crate::registration::ServerRegistry;
use crate::scheduler::retention::RetentionTask;
use crate::scheduler::{Scheduler, SchedulerSettings};
use crate::store::records;
use crate::store::supervisor::{failure_channel, PointWriter};
use crate::store::{Storage, Store};
use crate::time::TimeAxis;

/// Buffered broadcast messages per subscriber.
const BROADCAST_CAPACITY: usize = 64;

/// App wires storage, registrations, the scheduler and retention together.
pub struct App<P = ProtocolPinger> {
    cfg: Config,
    health: Arc<HealthMetrics>,
    pinger: Arc<P>,
    broadcaster: Arc<ChannelBroadcaster>,
    registry: Arc<ServerRegistry>,
    store: Option<Arc<Storage>>,
    writer: Option<PointWriter>,
    scheduler: Option<Arc<Scheduler<P, ChannelBroadcaster>>>,
    supervisor: Option<JoinHandle<Result<()>>>,
    supervisor_shutdown: CancellationToken,
    tasks: TaskTracker,
    cancel: CancellationToken,
}

impl App<ProtocolPinger> {
    /// Creates an app that pings servers over the network.
    pub fn new(cfg: Config) -> Result<Self> {
        Self::with_pinger(cfg, ProtocolPinger)
    }
}

impl<P: Pinger + 'static> App<P> {
    pub fn with_pinger(cfg: Config, pinger: P) -> Result<Self> {
        let health =
            Arc::new(HealthMetrics::new(&cfg.health.addr).context("creating health metrics")?);
        let registry = Arc::new(ServerRegistry::from_config(&cfg));

        Ok(Self {
            cfg,
            health,
            pinger: Arc::new(pinger),
            broadcaster: Arc::new(ChannelBroadcaster::new(BROADCAST_CAPACITY)),
            registry,
            store: None,
            writer: None,
            scheduler: None,
            supervisor: None,
            supervisor_shutdown: CancellationToken::new(),
            tasks: TaskTracker::new(),
            cancel: CancellationToken::new(),
        })
    }

    /// Uses `storage` instead of building one from the config.
    pub fn with_storage(mut self, storage: Storage) -> Self {
        self.store = Some(Arc::new(storage));
        self
    }

    /// Token cancelled on shutdown, including after a fatal storage failure.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Message> {
        self.broadcaster.subscribe()
    }

    pub fn registry(&self) -> Arc<ServerRegistry> {
        Arc::clone(&self.registry)
    }

    pub fn storage(&self) -> Option<Arc<Storage>> {
        self.store.clone()
    }

    pub fn scheduler(&self) -> Option<Arc<Scheduler<P, ChannelBroadcaster>>> {
        self.scheduler.clone()
    }

    pub fn health(&self) -> Arc<HealthMetrics> {
        Arc::clone(&self.health)
    }

    /// Starts every component and the polling loop.
    pub async fn start(&mut self) -> Result<()> {
        // 0. Health server first so probes respond during startup.
        self.health
            .start()
            .await
            .context("starting health metrics server")?;

        let mut axis = TimeAxis::new(self.cfg.graph.duration, self.cfg.graph.interval);

        // 1. Storage: connect, schema, records, graph, retention.
        if self.cfg.storage.log_to_database {
            let store = match self.store.take() {
                Some(store) => store,
                None => Arc::new(Storage::from_config(&self.cfg.storage)),
            };

            store
                .initialize()
                .await
                .with_context(|| format!("initializing {} storage", store.name()))?;
            self.health.storage_connected.set(1.0);

            store.ensure_schema().await.context("ensuring storage schema")?;

            records::load_records(Arc::clone(&store), Arc::clone(&self.registry))
                .await
                .context("loading player records")?;

            graph::load_graph_points(
                store.as_ref(),
                &self.registry,
                &mut axis,
                self.cfg.graph.duration,
                epoch_millis(),
            )
            .await
            .context("loading graph points")?;

            let (reporter, supervisor) = failure_channel(
                self.cfg.storage.on_error,
                self.cancel.clone(),
                Some(Arc::clone(&self.health)),
            );

            let retention = RetentionTask::new(
                Arc::clone(&store),
                self.cfg.retention_horizon(),
                self.cfg.storage.retention.cleanup_interval,
                reporter.clone(),
                Some(Arc::clone(&self.health)),
            );
            retention
                .run_once(epoch_millis())
                .await
                .context("initial retention sweep")?;
            self.tasks.spawn(retention.run(self.cancel.child_token()));

            let shutdown = self.supervisor_shutdown.clone();
            self.supervisor = Some(tokio::spawn(supervisor.run(shutdown)));

            self.writer = Some(PointWriter::new(
                Arc::clone(&store),
                reporter,
                Some(Arc::clone(&self.health)),
            ));
            self.store = Some(store);
        } else {
            self.store = None;
            info!("database logging disabled, history starts empty");
        }

        // 2. Sanity check the polling rate.
        let worst_case = self.cfg.worst_case_round();
        if worst_case > self.cfg.rates.ping_all {
            warn!(
                worst_case = ?worst_case,
                ping_all = ?self.cfg.rates.ping_all,
                servers = self.registry.len(),
                "a round can outlast rates.ping_all, overlapping ticks will be skipped",
            );
        }

        // 3. Scheduler.
        let mut scheduler = Scheduler::new(
            SchedulerSettings::from_config(&self.cfg),
            Arc::clone(&self.registry),
            axis,
            Arc::clone(&self.pinger),
            Arc::clone(&self.broadcaster),
        )
        .with_health(Arc::clone(&self.health));

        if let Some(ref writer) = self.writer {
            scheduler = scheduler.with_writer(writer.clone());
        }

        let scheduler = Arc::new(scheduler);
        self.tasks
            .spawn(Arc::clone(&scheduler).run(self.cancel.child_token()));
        self.scheduler = Some(scheduler);

        info!(servers = self.registry.len(), "pingtrack started");

        Ok(())
    }

    /// Stops polling, drains writes and releases storage.
    ///
    /// Returns the fatal storage failure, if one ended the run.
    pub async fn stop(&mut self) -> Result<()> {
        self.cancel.cancel();

        self.tasks.close();
        self.tasks.wait().await;

        if let Some(ref writer) = self.writer {
            writer.flush().await;
        }

        let mut outcome = Ok(());

        self.supervisor_shutdown.cancel();
        if let Some(supervisor) = self.supervisor.take() {
            outcome = supervisor.await.context("storage supervisor panicked")?;
        }

        if let Some(store) = self.store.take() {
            if let Err(e) = store.close().await {
                error!(error = %e, "error closing storage");
            }
            self.health.storage_connected.set(0.0);
        }

        self.health.stop().await?;

        info!("pingtrack stopped");

        outcome
    }
}
