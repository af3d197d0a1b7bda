use std::collections::HashMap;
use std::time::Duration;

use pingtrack::app::App;
use pingtrack::config::{Config, PollStrategy, ServerConfig, StorageBackend};
use pingtrack::model::{epoch_millis, PingPoint, PlayerRecord};
use pingtrack::ping::{PingError, PingResponse, PingTarget, Pinger, ServerKind};
use pingtrack::store::{MemoryStore, Storage, Store};

/// Pinger with canned answers; `None` simulates a timeout.
struct CannedPinger {
    answers: HashMap<String, Option<i64>>,
}

impl Pinger for CannedPinger {
    async fn ping(
        &self,
        target: &PingTarget,
        timeout: Duration,
    ) -> Result<PingResponse, PingError> {
        match self.answers.get(&target.address).copied().flatten() {
            Some(player_count) => Ok(PingResponse {
                player_count,
                protocol_version: Some(765),
                favicon: Some("data:image/png;base64,AAAA".to_string()),
            }),
            None => Err(PingError::Timeout(timeout)),
        }
    }
}

fn server(name: &str, address: &str) -> ServerConfig {
    ServerConfig {
        name: name.to_string(),
        address: address.to_string(),
        port: None,
        kind: ServerKind::Java,
    }
}

fn config(strategy: PollStrategy) -> Config {
    let mut cfg = Config::default();
    cfg.servers = vec![server("X", "x.example"), server("Y", "y.example")];
    cfg.rates.ping_all = Duration::from_secs(3600);
    cfg.scheduler.strategy = strategy;
    cfg.storage.backend = StorageBackend::Memory;
    cfg.storage.log_to_database = true;
    cfg.health.addr = "127.0.0.1:0".to_string();
    cfg
}

fn pinger() -> CannedPinger {
    CannedPinger {
        answers: HashMap::from([
            ("x.example".to_string(), None),
            ("y.example".to_string(), Some(42)),
        ]),
    }
}

#[tokio::test]
async fn test_round_broadcasts_failure_and_success_together() {
    for strategy in [PollStrategy::Sequential, PollStrategy::Parallel] {
        let mut app = App::with_pinger(config(strategy), pinger()).expect("app");
        let mut rx = app.subscribe();
        app.start().await.expect("start");

        let msg = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("broadcast in time")
            .expect("broadcast");

        assert_eq!(msg.event, "updateServers");
        assert_eq!(msg.payload["updateHistoryGraph"], true);
        let updates = msg.payload["updates"].as_object().expect("updates");
        assert_eq!(updates.len(), 2);
        assert!(updates["0"]["playerCount"].is_null());
        assert!(updates["0"]["error"].is_string());
        assert_eq!(updates["1"]["playerCount"], 42);
        assert_eq!(updates["1"]["record"]["playerCount"], 42);
        assert_eq!(updates["1"]["protocolVersion"], 765);

        let storage = app.storage().expect("storage in use");
        let registry = app.registry();
        app.stop().await.expect("stop");

        // Both servers got a point under the round's shared timestamp.
        let Storage::Memory(ref memory) = *storage else {
            panic!("memory backend expected");
        };
        assert_eq!(memory.point_count(), 2);

        let y = registry.find_by_address("y.example").expect("y").lock();
        assert_eq!(y.record().player_count, Some(42));
        let x = registry.find_by_address("x.example").expect("x").lock();
        assert_eq!(x.record(), PlayerRecord::empty());
    }
}

#[tokio::test]
async fn test_disabled_database_logging_skips_storage() {
    let mut cfg = config(PollStrategy::Sequential);
    cfg.storage.log_to_database = false;

    let mut app = App::with_pinger(cfg, pinger()).expect("app");
    let mut rx = app.subscribe();
    app.start().await.expect("start");

    tokio::time::timeout(Duration::from_secs(5), rx.recv())
        .await
        .expect("broadcast in time")
        .expect("broadcast");

    assert!(app.storage().is_none());
    app.stop().await.expect("stop");
}

#[tokio::test]
async fn test_metrics_count_rounds_and_failures() {
    let mut app = App::with_pinger(config(PollStrategy::Sequential), pinger()).expect("app");
    let mut rx = app.subscribe();
    app.start().await.expect("start");

    tokio::time::timeout(Duration::from_secs(5), rx.recv())
        .await
        .expect("broadcast in time")
        .expect("broadcast");

    let health = app.health();
    app.stop().await.expect("stop");

    assert_eq!(health.rounds_total.get(), 1.0);
    assert_eq!(
        health.ping_failures.with_label_values(&["x.example"]).get(),
        1.0
    );
    assert_eq!(health.points_written.get(), 2.0);
}

#[tokio::test]
async fn test_startup_retention_runs_with_zero_cleanup_interval() {
    let now = epoch_millis();
    let day = 86_400_000;

    let memory = MemoryStore::new();
    memory.initialize().await.expect("initialize");
    memory.ensure_schema().await.expect("schema");
    for point in [
        PingPoint::new(now - 3 * day, "x.example", Some(3)),
        PingPoint::new(now - 2 * day, "y.example", Some(9)),
        PingPoint::new(now - 60_000, "y.example", Some(4)),
    ] {
        memory.insert_point(&point).await.expect("seed");
    }

    let mut cfg = config(PollStrategy::Sequential);
    cfg.storage.retention.cleanup_interval = Duration::ZERO;
    let horizon = cfg.retention_horizon().as_millis() as i64;

    let mut app = App::with_pinger(cfg, pinger())
        .expect("app")
        .with_storage(Storage::Memory(memory));
    app.start().await.expect("start");

    let storage = app.storage().expect("storage in use");
    let remaining = storage
        .get_recent_points(i64::MIN, i64::MAX)
        .await
        .expect("scan");
    assert!(remaining.iter().all(|p| p.timestamp >= now - horizon));
    assert!(remaining.contains(&PingPoint::new(now - 60_000, "y.example", Some(4))));

    let health = app.health();
    app.stop().await.expect("stop");
    assert_eq!(health.retention_runs.get(), 1.0);
}
