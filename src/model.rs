use std::time::{SystemTime, UNIX_EPOCH};

use serde::Serialize;
use tracing::warn;

/// Upper bound for a reported player count.
///
/// Values above this are treated as garbage: they are recorded as `0` and
/// flagged, never stored as-is.
pub const MAX_PLAYER_COUNT: i64 = 250_000;

/// One polling sample for one server in one round.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PingPoint {
    /// Epoch milliseconds, shared by every server polled in the same round.
    pub timestamp: i64,
    pub server_address: String,
    /// `None` encodes a failed poll.
    pub player_count: Option<u32>,
}

impl PingPoint {
    pub fn new(
        timestamp: i64,
        server_address: impl Into<String>,
        player_count: Option<u32>,
    ) -> Self {
        Self {
            timestamp,
            server_address: server_address.into(),
            player_count,
        }
    }
}

/// Historical peak observation for one server.
///
/// Both fields are `None` for the explicit "no data yet" state.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PlayerRecord {
    pub player_count: Option<u32>,
    /// Epoch milliseconds.
    pub timestamp: Option<i64>,
}

impl PlayerRecord {
    pub fn new(player_count: u32, timestamp: i64) -> Self {
        Self {
            player_count: Some(player_count),
            timestamp: Some(timestamp),
        }
    }

    /// The "no data yet" record.
    pub const fn empty() -> Self {
        Self {
            player_count: None,
            timestamp: None,
        }
    }

    /// Whether `player_count` beats this record.
    pub fn is_beaten_by(&self, player_count: u32) -> bool {
        match self.player_count {
            Some(current) => player_count > current,
            None => true,
        }
    }
}

/// Successful ping outcome after clamping and favicon filtering.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PingPayload {
    pub player_count: u32,
    pub protocol_version: Option<i32>,
    pub favicon: Option<String>,
}

/// Result of clamping a raw player count.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClampedCount {
    pub value: u32,
    /// Raw value was outside `[0, MAX_PLAYER_COUNT]` and got replaced by `0`.
    pub flagged: bool,
}

/// Clamps a raw player count into `[0, MAX_PLAYER_COUNT]`.
///
/// Out-of-range values become `0` rather than the nearest bound.
pub fn clamp_player_count(raw: i64) -> ClampedCount {
    if (0..=MAX_PLAYER_COUNT).contains(&raw) {
        ClampedCount {
            value: raw as u32,
            flagged: false,
        }
    } else {
        ClampedCount {
            value: 0,
            flagged: true,
        }
    }
}

/// Clamps and logs a warning for flagged values.
pub fn clamp_player_count_for(server: &str, raw: i64) -> ClampedCount {
    let clamped = clamp_player_count(raw);
    if clamped.flagged {
        if raw < 0 {
            warn!(server, raw, "invalid negative player count, recording 0");
        } else {
            warn!(
                server,
                raw,
                max = MAX_PLAYER_COUNT,
                "player count above maximum, recording 0",
            );
        }
    }
    clamped
}

/// Current wall clock as epoch milliseconds.
pub fn epoch_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

/// Converts epoch milliseconds to whole epoch seconds.
pub fn to_seconds(millis: i64) -> i64 {
    millis.div_euclid(1000)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_clamp_in_range_is_identity() {
        for raw in [0, 1, 42, 249_999, MAX_PLAYER_COUNT] {
            let c = clamp_player_count(raw);
            assert_eq!(i64::from(c.value), raw);
            assert!(!c.flagged);
        }
    }

    #[test]
    fn test_clamp_out_of_range_is_zero_and_flagged() {
        for raw in [-1, -250_000, MAX_PLAYER_COUNT + 1, i64::from(u32::MAX), i64::MAX] {
            let c = clamp_player_count(raw);
            assert_eq!(c.value, 0, "raw={raw}");
            assert!(c.flagged, "raw={raw}");
        }
    }

    #[test]
    fn test_clamp_always_within_bounds() {
        let mut raw = i64::MIN;
        while raw < i64::MAX - (i64::MAX / 7) {
            let c = clamp_player_count(raw);
            assert!(i64::from(c.value) <= MAX_PLAYER_COUNT);
            raw += i64::MAX / 7;
        }
    }

    #[test]
    fn test_record_is_beaten_by() {
        assert!(PlayerRecord::empty().is_beaten_by(0));
        let record = PlayerRecord::new(10, 1_000);
        assert!(record.is_beaten_by(11));
        assert!(!record.is_beaten_by(10));
        assert!(!record.is_beaten_by(3));
    }

    #[test]
    fn test_to_seconds() {
        assert_eq!(to_seconds(0), 0);
        assert_eq!(to_seconds(1_999), 1);
        assert_eq!(to_seconds(1_700_000_000_123), 1_700_000_000);
    }
}
