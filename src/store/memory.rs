use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;

use anyhow::{bail, Result};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::RwLock;

use super::{RetentionReport, Store};
use crate::model::{PingPoint, PlayerRecord};

/// Process-local provider. Nothing survives a restart.
#[derive(Debug, Default)]
pub struct MemoryStore {
    points: RwLock<Vec<PingPoint>>,
    records: DashMap<String, PlayerRecord>,
    schema_ready: AtomicBool,
    open: AtomicBool,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored points.
    pub fn point_count(&self) -> usize {
        self.points.read().len()
    }

    fn check_open(&self) -> Result<()> {
        if !self.open.load(Ordering::Acquire) {
            bail!("memory store is not open");
        }
        Ok(())
    }
}

impl Store for MemoryStore {
    fn name(&self) -> &'static str {
        "memory"
    }

    async fn initialize(&self) -> Result<()> {
        self.open.store(true, Ordering::Release);
        tracing::info!("memory store opened");
        Ok(())
    }

    async fn ensure_schema(&self) -> Result<()> {
        self.check_open()?;
        if self.schema_ready.swap(true, Ordering::AcqRel) {
            tracing::debug!("memory schema already present");
        }
        Ok(())
    }

    async fn insert_point(&self, point: &PingPoint) -> Result<()> {
        self.check_open()?;
        self.points.write().push(point.clone());
        Ok(())
    }

    async fn get_recent_points(&self, start: i64, end: i64) -> Result<Vec<PingPoint>> {
        self.check_open()?;
        Ok(self
            .points
            .read()
            .iter()
            .filter(|p| p.timestamp >= start && p.timestamp <= end)
            .cloned()
            .collect())
    }

    async fn get_record(&self, address: &str) -> Result<Option<PlayerRecord>> {
        self.check_open()?;
        Ok(self.records.get(address).map(|r| *r))
    }

    async fn get_legacy_record(&self, address: &str) -> Result<Option<PlayerRecord>> {
        self.check_open()?;

        let points = self.points.read();
        let best = points
            .iter()
            .filter(|p| p.server_address == address)
            .filter_map(|p| p.player_count.map(|count| (count, p.timestamp)))
            .fold(None::<(u32, i64)>, |best, (count, ts)| match best {
                Some((b_count, b_ts)) if count < b_count || (count == b_count && ts >= b_ts) => {
                    best
                }
                _ => Some((count, ts)),
            });

        Ok(best.map(|(count, ts)| PlayerRecord::new(count, ts)))
    }

    async fn insert_record_if_absent(&self, address: &str, record: PlayerRecord) -> Result<bool> {
        self.check_open()?;
        match self.records.entry(address.to_string()) {
            Entry::Occupied(_) => Ok(false),
            Entry::Vacant(slot) => {
                slot.insert(record);
                Ok(true)
            }
        }
    }

    async fn upsert_record(&self, address: &str, record: PlayerRecord) -> Result<()> {
        self.check_open()?;
        self.records.insert(address.to_string(), record);
        Ok(())
    }

    async fn delete_older_than(&self, cutoff: i64) -> Result<RetentionReport> {
        self.check_open()?;
        let started = Instant::now();

        let mut points = self.points.write();
        let before = points.len();
        points.retain(|p| p.timestamp >= cutoff);
        let deleted = (before - points.len()) as u64;

        Ok(RetentionReport {
            deleted: Some(deleted),
            elapsed: started.elapsed(),
        })
    }

    async fn close(&self) -> Result<()> {
        if self.open.swap(false, Ordering::AcqRel) {
            tracing::info!("memory store closed");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn open_store() -> MemoryStore {
        let store = MemoryStore::new();
        store.initialize().await.expect("initialize");
        store.ensure_schema().await.expect("schema");
        store
    }

    #[tokio::test]
    async fn test_operations_fail_before_initialize() {
        let store = MemoryStore::new();
        assert!(store.get_record("a").await.is_err());
        assert!(store
            .insert_point(&PingPoint::new(1, "a", Some(1)))
            .await
            .is_err());
    }

    #[tokio::test]
    async fn test_ensure_schema_twice() {
        let store = open_store().await;
        store.ensure_schema().await.expect("second ensure_schema");
    }

    #[tokio::test]
    async fn test_legacy_record_prefers_earliest_on_tie() {
        let store = open_store().await;
        for (ts, count) in [(30, Some(9)), (10, Some(9)), (20, None), (40, Some(3))] {
            store
                .insert_point(&PingPoint::new(ts, "a", count))
                .await
                .expect("insert");
        }
        store
            .insert_point(&PingPoint::new(5, "b", Some(100)))
            .await
            .expect("insert");

        let record = store.get_legacy_record("a").await.expect("legacy");
        assert_eq!(record, Some(PlayerRecord::new(9, 10)));
    }

    #[tokio::test]
    async fn test_legacy_record_absent_when_only_failures() {
        let store = open_store().await;
        store
            .insert_point(&PingPoint::new(1, "a", None))
            .await
            .expect("insert");
        assert_eq!(store.get_legacy_record("a").await.expect("legacy"), None);
        assert_eq!(store.get_legacy_record("zzz").await.expect("legacy"), None);
    }

    #[tokio::test]
    async fn test_insert_record_if_absent() {
        let store = open_store().await;
        let first = PlayerRecord::new(5, 1);
        assert!(store.insert_record_if_absent("a", first).await.expect("insert"));
        assert!(!store
            .insert_record_if_absent("a", PlayerRecord::new(50, 2))
            .await
            .expect("insert"));
        assert_eq!(store.get_record("a").await.expect("get"), Some(first));

        store
            .upsert_record("a", PlayerRecord::new(50, 2))
            .await
            .expect("upsert");
        assert_eq!(
            store.get_record("a").await.expect("get"),
            Some(PlayerRecord::new(50, 2))
        );
    }

    #[tokio::test]
    async fn test_close_is_idempotent() {
        let store = open_store().await;
        store.close().await.expect("close");
        store.close().await.expect("close again");
        assert!(store.get_recent_points(0, 1).await.is_err());
    }
}
