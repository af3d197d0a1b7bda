//! Startup graph assembly from stored points.

use std::collections::{HashMap, HashSet};
use std::time::Duration;

use anyhow::{Context, Result};

use crate::model::PingPoint;
use crate::registration::ServerRegistry;
use crate::store::Store;
use crate::time::TimeAxis;

/// One server's points, in timestamp order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Series {
    pub server_address: String,
    pub timestamps: Vec<i64>,
    pub player_counts: Vec<Option<u32>>,
}

/// Per-server series plus the axis they share.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AssembledGraph {
    pub start: i64,
    /// In first-appearance order of addresses.
    pub series: Vec<Series>,
    /// Sorted distinct union of every series' timestamps.
    pub axis: Vec<i64>,
}

impl AssembledGraph {
    pub fn series_for(&self, address: &str) -> Option<&Series> {
        self.series.iter().find(|s| s.server_address == address)
    }

    /// Keeps at most one axis point per `interval_ms`, walking forward from
    /// the earliest, and drops series points that fall off the axis.
    ///
    /// Rounds run more often than history points are taken, so stored rows
    /// are denser than the live graph.
    pub fn thin(&mut self, interval_ms: i64) {
        if interval_ms <= 0 {
            return;
        }

        let mut kept: Vec<i64> = Vec::with_capacity(self.axis.len());
        for ts in &self.axis {
            match kept.last() {
                Some(last) if ts - last < interval_ms => {}
                _ => kept.push(*ts),
            }
        }

        if kept.len() == self.axis.len() {
            return;
        }

        let keep: HashSet<i64> = kept.iter().copied().collect();
        for series in &mut self.series {
            let (timestamps, player_counts) = series
                .timestamps
                .iter()
                .zip(&series.player_counts)
                .filter(|(ts, _)| keep.contains(ts))
                .map(|(ts, count)| (*ts, *count))
                .unzip();
            series.timestamps = timestamps;
            series.player_counts = player_counts;
        }
        self.axis = kept;
    }
}

/// Partitions `points` by address and builds the shared axis.
pub fn assemble(start: i64, mut points: Vec<PingPoint>) -> AssembledGraph {
    // Stable so rows with equal timestamps keep their scan order.
    points.sort_by_key(|p| p.timestamp);

    let mut series: Vec<Series> = Vec::new();
    let mut index: HashMap<String, usize> = HashMap::new();

    for point in points {
        let idx = match index.get(&point.server_address) {
            Some(idx) => *idx,
            None => {
                let idx = series.len();
                index.insert(point.server_address.clone(), idx);
                series.push(Series {
                    server_address: point.server_address,
                    ..Default::default()
                });
                idx
            }
        };

        let entry = &mut series[idx];
        entry.timestamps.push(point.timestamp);
        entry.player_counts.push(point.player_count);
    }

    let mut axis: Vec<i64> = series
        .iter()
        .flat_map(|s| s.timestamps.iter().copied())
        .collect();
    axis.sort_unstable();
    axis.dedup();

    AssembledGraph {
        start,
        series,
        axis,
    }
}

/// Loads the trailing `duration` of points into the registrations and axis.
///
/// The loaded graph is thinned to the axis' history interval. Points for
/// unknown addresses are ignored. An empty scan leaves the axis untouched.
pub async fn load_graph_points<S: Store>(
    store: &S,
    registry: &ServerRegistry,
    axis: &mut TimeAxis,
    duration: Duration,
    now: i64,
) -> Result<AssembledGraph> {
    let start = now - duration.as_millis() as i64;

    let points = store
        .get_recent_points(start, now)
        .await
        .context("loading recent points")?;
    let rows = points.len();

    let mut graph = assemble(start, points);
    graph.thin(axis.interval_ms());

    for series in &graph.series {
        let Some(registration) = registry.find_by_address(&series.server_address) else {
            tracing::debug!(server = %series.server_address, "skipping points for unknown server");
            continue;
        };

        registration
            .lock()
            .load_graph_points(start, &series.timestamps, &series.player_counts);

        if series.timestamps != graph.axis {
            tracing::warn!(
                server = %series.server_address,
                points = series.timestamps.len(),
                axis = graph.axis.len(),
                "stored series does not match the shared time axis",
            );
        }
    }

    if !graph.axis.is_empty() {
        axis.load_graph_points(start, &graph.axis);
    }

    tracing::info!(
        rows,
        servers = graph.series.len(),
        axis = graph.axis.len(),
        "graph points loaded",
    );

    Ok(graph)
}
