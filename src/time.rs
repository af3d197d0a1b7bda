//! Shared time axis for history graphs.
//!
//! Every round is stamped once here; the same timestamp is written for every
//! server polled in that round, which is what keeps per-server graph series
//! aligned with this axis.

use std::time::Duration;

/// Timestamp handed out for one round.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RoundStamp {
    /// Epoch milliseconds shared by every server in the round.
    pub timestamp: i64,
    /// Whether this round also appends a point to the history graph.
    pub update_history_graph: bool,
}

/// Authoritative axis of history-graph timestamps.
#[derive(Debug, Clone)]
pub struct TimeAxis {
    points: Vec<i64>,
    graph_duration_ms: i64,
    graph_interval_ms: i64,
}

impl TimeAxis {
    pub fn new(graph_duration: Duration, graph_interval: Duration) -> Self {
        Self {
            points: Vec::new(),
            graph_duration_ms: graph_duration.as_millis() as i64,
            graph_interval_ms: graph_interval.as_millis() as i64,
        }
    }

    /// Stamps a new round at `now`.
    ///
    /// A history point is added when the axis is empty or when at least one
    /// graph interval has passed since the last point.
    pub fn new_point_timestamp(&mut self, now: i64) -> RoundStamp {
        let update_history_graph = match self.points.last() {
            Some(last) => now - last >= self.graph_interval_ms,
            None => true,
        };

        if update_history_graph {
            self.points.push(now);
            self.cull(now - self.graph_duration_ms);
        }

        RoundStamp {
            timestamp: now,
            update_history_graph,
        }
    }

    /// Replaces the axis with stored timestamps, dropping anything before `start_time`.
    pub fn load_graph_points(&mut self, start_time: i64, timestamps: &[i64]) {
        self.points = timestamps
            .iter()
            .copied()
            .filter(|ts| *ts >= start_time)
            .collect();
    }

    pub fn interval_ms(&self) -> i64 {
        self.graph_interval_ms
    }

    fn cull(&mut self, oldest: i64) {
        let keep_from = self.points.partition_point(|ts| *ts < oldest);
        if keep_from > 0 {
            self.points.drain(..keep_from);
        }
    }

    pub fn points(&self) -> &[i64] {
        &self.points
    }

    pub fn len(&self) -> usize {
        self.points.len()
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }
}
