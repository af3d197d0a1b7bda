//! Per-server in-memory state.
//!
//! A [`ServerRegistration`] owns the recent points, the history graph buffer,
//! the graph peak and the player-count record of one server. The scheduler
//! feeds it one ping result per round and relays the returned
//! [`ServerUpdate`]; graph assembly feeds it stored points at startup.

use std::collections::{HashMap, VecDeque};
use std::time::Duration;

use parking_lot::Mutex;
use serde::Serialize;

use crate::config::Config;
use crate::model::{to_seconds, PingPayload, PlayerRecord};
use crate::ping::{PingError, PingTarget};

/// Highest point currently in the history graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GraphPeak {
    pub player_count: u32,
    /// Epoch seconds.
    pub timestamp: i64,
}

/// Record as sent to clients.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RecordView {
    pub player_count: Option<u32>,
    /// Epoch seconds.
    pub timestamp: Option<i64>,
}

impl From<PlayerRecord> for RecordView {
    fn from(record: PlayerRecord) -> Self {
        Self {
            player_count: record.player_count,
            timestamp: record.timestamp.map(to_seconds),
        }
    }
}

/// What changed for one server in one round.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerUpdate {
    /// `None` when the ping failed.
    pub player_count: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub favicon: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub protocol_version: Option<i32>,
    /// Set only when a new all-time peak was observed this round.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub record: Option<RecordView>,
    /// Set only when the graph peak moved.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub graph_peak: Option<GraphPeak>,
}

impl ServerUpdate {
    pub fn is_failure(&self) -> bool {
        self.player_count.is_none()
    }
}

#[derive(Debug)]
pub struct ServerRegistration {
    server_id: usize,
    name: String,
    target: PingTarget,
    recent: VecDeque<(i64, Option<u32>)>,
    recent_capacity: usize,
    graph_timestamps: Vec<i64>,
    graph_counts: Vec<Option<u32>>,
    graph_duration_ms: i64,
    graph_peak: Option<GraphPeak>,
    record: PlayerRecord,
    favicon: Option<String>,
    protocol_version: Option<i32>,
}

impl ServerRegistration {
    pub fn new(
        server_id: usize,
        name: impl Into<String>,
        target: PingTarget,
        graph_duration: Duration,
        recent_capacity: usize,
    ) -> Self {
        Self {
            server_id,
            name: name.into(),
            target,
            recent: VecDeque::with_capacity(recent_capacity),
            recent_capacity: recent_capacity.max(1),
            graph_timestamps: Vec::new(),
            graph_counts: Vec::new(),
            graph_duration_ms: graph_duration.as_millis() as i64,
            graph_peak: None,
            record: PlayerRecord::empty(),
            favicon: None,
            protocol_version: None,
        }
    }

    pub fn server_id(&self) -> usize {
        self.server_id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn address(&self) -> &str {
        &self.target.address
    }

    pub fn target(&self) -> &PingTarget {
        &self.target
    }

    pub fn record(&self) -> PlayerRecord {
        self.record
    }

    pub fn set_record(&mut self, record: PlayerRecord) {
        self.record = record;
    }

    pub fn graph_peak(&self) -> Option<GraphPeak> {
        self.graph_peak
    }

    pub fn graph_timestamps(&self) -> &[i64] {
        &self.graph_timestamps
    }

    pub fn graph_counts(&self) -> &[Option<u32>] {
        &self.graph_counts
    }

    pub fn recent(&self) -> impl Iterator<Item = &(i64, Option<u32>)> {
        self.recent.iter()
    }

    /// Applies one round's result and reports what changed.
    pub fn handle_ping(
        &mut self,
        timestamp: i64,
        payload: Option<&PingPayload>,
        error: Option<&PingError>,
        update_history_graph: bool,
    ) -> ServerUpdate {
        let player_count = payload.map(|p| p.player_count);

        if self.recent.len() == self.recent_capacity {
            self.recent.pop_front();
        }
        self.recent.push_back((timestamp, player_count));

        let mut update = ServerUpdate {
            player_count,
            error: error.map(|e| e.to_string()),
            favicon: None,
            protocol_version: None,
            record: None,
            graph_peak: None,
        };

        if let Some(payload) = payload {
            if payload.favicon.is_some() && payload.favicon != self.favicon {
                self.favicon = payload.favicon.clone();
                update.favicon = payload.favicon.clone();
            }

            if payload.protocol_version.is_some()
                && payload.protocol_version != self.protocol_version
            {
                self.protocol_version = payload.protocol_version;
                update.protocol_version = payload.protocol_version;
            }

            if self.record.is_beaten_by(payload.player_count) {
                self.record = PlayerRecord::new(payload.player_count, timestamp);
                update.record = Some(self.record.into());
            }
        } else if error.is_none() {
            update.error = Some("no response".to_string());
        }

        if update_history_graph {
            self.graph_timestamps.push(timestamp);
            self.graph_counts.push(player_count);
            self.cull_graph(timestamp - self.graph_duration_ms);

            let peak = self.find_graph_peak();
            if peak != self.graph_peak {
                self.graph_peak = peak;
                update.graph_peak = peak;
            }
        }

        update
    }

    /// Loads stored graph points, keeping only those at or after `start_time`.
    pub fn load_graph_points(
        &mut self,
        start_time: i64,
        timestamps: &[i64],
        player_counts: &[Option<u32>],
    ) {
        let (ts, counts): (Vec<i64>, Vec<Option<u32>>) = timestamps
            .iter()
            .zip(player_counts)
            .filter(|(ts, _)| **ts >= start_time)
            .map(|(ts, count)| (*ts, *count))
            .unzip();

        self.graph_timestamps = ts;
        self.graph_counts = counts;
        self.graph_peak = self.find_graph_peak();
    }

    fn cull_graph(&mut self, oldest: i64) {
        let keep_from = self.graph_timestamps.partition_point(|ts| *ts < oldest);
        if keep_from > 0 {
            self.graph_timestamps.drain(..keep_from);
            self.graph_counts.drain(..keep_from);
        }
    }

    /// Highest count in the graph; the earliest point wins ties.
    fn find_graph_peak(&self) -> Option<GraphPeak> {
        let mut peak: Option<GraphPeak> = None;
        for (ts, count) in self.graph_timestamps.iter().zip(&self.graph_counts) {
            let Some(count) = *count else {
                continue;
            };
            if peak.map_or(true, |p| count > p.player_count) {
                peak = Some(GraphPeak {
                    player_count: count,
                    timestamp: to_seconds(*ts),
                });
            }
        }
        peak
    }
}

/// Every registered server in configured polling order.
#[derive(Debug)]
pub struct ServerRegistry {
    servers: Vec<Mutex<ServerRegistration>>,
    by_address: HashMap<String, usize>,
}

impl ServerRegistry {
    pub fn new(registrations: Vec<ServerRegistration>) -> Self {
        let by_address = registrations
            .iter()
            .enumerate()
            .map(|(idx, r)| (r.address().to_string(), idx))
            .collect();

        Self {
            servers: registrations.into_iter().map(Mutex::new).collect(),
            by_address,
        }
    }

    /// Builds registrations from the configured server list.
    pub fn from_config(cfg: &Config) -> Self {
        let registrations = cfg
            .servers
            .iter()
            .enumerate()
            .map(|(id, server)| {
                ServerRegistration::new(
                    id,
                    server.name.clone(),
                    server.target(),
                    cfg.graph.duration,
                    cfg.graph.recent_points,
                )
            })
            .collect();

        Self::new(registrations)
    }

    pub fn len(&self) -> usize {
        self.servers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.servers.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Mutex<ServerRegistration>> {
        self.servers.iter()
    }

    pub fn get(&self, server_id: usize) -> Option<&Mutex<ServerRegistration>> {
        self.servers.get(server_id)
    }

    pub fn find_by_address(&self, address: &str) -> Option<&Mutex<ServerRegistration>> {
        self.by_address
            .get(address)
            .and_then(|idx| self.servers.get(*idx))
    }

    /// Addresses in polling order.
    pub fn addresses(&self) -> Vec<String> {
        self.servers
            .iter()
            .map(|s| s.lock().address().to_string())
            .collect()
    }

    /// Ping targets in polling order.
    pub fn targets(&self) -> Vec<PingTarget> {
        self.servers
            .iter()
            .map(|s| s.lock().target().clone())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ping::ServerKind;

    fn registration() -> ServerRegistration {
        ServerRegistration::new(
            0,
            "Test",
            PingTarget {
                address: "mc.example".to_string(),
                port: 25565,
                kind: ServerKind::Java,
            },
            Duration::from_secs(60),
            3,
        )
    }

    fn payload(count: u32) -> PingPayload {
        PingPayload {
            player_count: count,
            protocol_version: None,
            favicon: None,
        }
    }

    #[test]
    fn test_handle_ping_success_sets_record() {
        let mut reg = registration();
        let update = reg.handle_ping(5_000, Some(&payload(10)), None, false);

        assert_eq!(update.player_count, Some(10));
        assert_eq!(update.error, None);
        assert_eq!(
            update.record,
            Some(RecordView {
                player_count: Some(10),
                timestamp: Some(5)
            })
        );
        assert_eq!(reg.record(), PlayerRecord::new(10, 5_000));

        let update = reg.handle_ping(6_000, Some(&payload(9)), None, false);
        assert_eq!(update.record, None);
    }

    #[test]
    fn test_handle_ping_failure() {
        let mut reg = registration();
        let err = PingError::Timeout(Duration::from_millis(10));
        let update = reg.handle_ping(5_000, None, Some(&err), true);

        assert!(update.is_failure());
        assert_eq!(update.error.as_deref(), Some("timed out after 10ms"));
        assert_eq!(reg.graph_counts(), &[None]);
        assert_eq!(update.graph_peak, None);
        assert_eq!(reg.record(), PlayerRecord::empty());
    }

    #[test]
    fn test_recent_points_are_bounded() {
        let mut reg = registration();
        for i in 0..5 {
            reg.handle_ping(i, Some(&payload(i as u32)), None, false);
        }
        let recent: Vec<i64> = reg.recent().map(|(ts, _)| *ts).collect();
        assert_eq!(recent, vec![2, 3, 4]);
    }

    #[test]
    fn test_graph_culls_and_tracks_peak() {
        let mut reg = registration();
        let update = reg.handle_ping(0, Some(&payload(50)), None, true);
        assert_eq!(
            update.graph_peak,
            Some(GraphPeak {
                player_count: 50,
                timestamp: 0
            })
        );

        reg.handle_ping(30_000, Some(&payload(20)), None, true);
        // 0 falls out of the 60s window at 61s, peak moves to 20.
        let update = reg.handle_ping(61_000, Some(&payload(10)), None, true);
        assert_eq!(reg.graph_timestamps(), &[30_000, 61_000]);
        assert_eq!(
            update.graph_peak,
            Some(GraphPeak {
                player_count: 20,
                timestamp: 30
            })
        );
    }

    #[test]
    fn test_favicon_and_version_reported_on_change_only() {
        let mut reg = registration();
        let p = PingPayload {
            player_count: 1,
            protocol_version: Some(765),
            favicon: Some("data:image/png;base64,AA".to_string()),
        };
        let first = reg.handle_ping(1, Some(&p), None, false);
        assert_eq!(first.protocol_version, Some(765));
        assert!(first.favicon.is_some());

        let second = reg.handle_ping(2, Some(&p), None, false);
        assert_eq!(second.protocol_version, None);
        assert_eq!(second.favicon, None);
    }

    #[test]
    fn test_load_graph_points_culls_before_start() {
        let mut reg = registration();
        reg.load_graph_points(150, &[100, 200, 300], &[Some(9), Some(4), None]);
        assert_eq!(reg.graph_timestamps(), &[200, 300]);
        assert_eq!(reg.graph_counts(), &[Some(4), None]);
        assert_eq!(reg.graph_peak().map(|p| p.player_count), Some(4));
    }

    #[test]
    fn test_update_serializes_camel_case_without_empty_fields() {
        let update = ServerUpdate {
            player_count: Some(3),
            error: None,
            favicon: None,
            protocol_version: None,
            record: Some(RecordView {
                player_count: Some(3),
                timestamp: Some(10),
            }),
            graph_peak: None,
        };
        let json = serde_json::to_value(&update).expect("serializable");
        assert_eq!(
            json,
            serde_json::json!({
                "playerCount": 3,
                "record": { "playerCount": 3, "timestamp": 10 }
            })
        );
    }

    #[test]
    fn test_registry_lookup_by_address() {
        let registry = ServerRegistry::new(vec![registration()]);
        assert_eq!(registry.len(), 1);
        assert!(registry.find_by_address("mc.example").is_some());
        assert!(registry.find_by_address("other").is_none());
        assert_eq!(registry.addresses(), vec!["mc.example".to_string()]);
    }
}
