//! Persistence contract and its providers.

pub mod clickhouse;
pub mod memory;
pub mod records;
pub mod supervisor;

use std::future::Future;
use std::time::Duration;

use anyhow::Result;

use crate::config::{StorageBackend, StorageConfig};
use crate::model::{PingPoint, PlayerRecord};

pub use clickhouse::ClickHouseStore;
pub use memory::MemoryStore;

/// Outcome of one retention sweep.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetentionReport {
    /// Rows removed, when the provider can tell.
    pub deleted: Option<u64>,
    pub elapsed: Duration,
}

/// Operations every storage provider supports.
///
/// All methods take `&self`; providers handle their own pooling and locking
/// so a single handle can be shared across tasks.
pub trait Store: Send + Sync {
    /// Provider name for logging.
    fn name(&self) -> &'static str;

    /// Opens the connection or session.
    fn initialize(&self) -> impl Future<Output = Result<()>> + Send;

    /// Creates the point and record tables if missing. Safe to repeat.
    fn ensure_schema(&self) -> impl Future<Output = Result<()>> + Send;

    /// Appends one ping point.
    fn insert_point(&self, point: &PingPoint) -> impl Future<Output = Result<()>> + Send;

    /// Points with `start <= timestamp <= end`, in no particular order.
    fn get_recent_points(
        &self,
        start: i64,
        end: i64,
    ) -> impl Future<Output = Result<Vec<PingPoint>>> + Send;

    /// Stored record for `address`, if any.
    fn get_record(
        &self,
        address: &str,
    ) -> impl Future<Output = Result<Option<PlayerRecord>>> + Send;

    /// Peak computed from the point table: highest count, earliest timestamp
    /// on ties. `None` when no successful point exists.
    fn get_legacy_record(
        &self,
        address: &str,
    ) -> impl Future<Output = Result<Option<PlayerRecord>>> + Send;

    /// Stores `record` unless one already exists. Returns whether it inserted.
    fn insert_record_if_absent(
        &self,
        address: &str,
        record: PlayerRecord,
    ) -> impl Future<Output = Result<bool>> + Send;

    /// Creates or overwrites the record for `address`.
    fn upsert_record(
        &self,
        address: &str,
        record: PlayerRecord,
    ) -> impl Future<Output = Result<()>> + Send;

    /// Deletes points with `timestamp < cutoff`.
    fn delete_older_than(&self, cutoff: i64)
        -> impl Future<Output = Result<RetentionReport>> + Send;

    /// Releases resources. Safe to call more than once.
    fn close(&self) -> impl Future<Output = Result<()>> + Send;
}

/// Provider selected by configuration.
pub enum Storage {
    ClickHouse(ClickHouseStore),
    Memory(MemoryStore),
}

impl Storage {
    /// Builds the configured provider. Nothing is opened yet.
    pub fn from_config(cfg: &StorageConfig) -> Self {
        match cfg.backend {
            StorageBackend::Clickhouse => {
                Self::ClickHouse(ClickHouseStore::new(cfg.clickhouse.clone()))
            }
            StorageBackend::Memory => Self::Memory(MemoryStore::new()),
        }
    }
}

impl Store for Storage {
    fn name(&self) -> &'static str {
        match self {
            Self::ClickHouse(s) => s.name(),
            Self::Memory(s) => s.name(),
        }
    }

    async fn initialize(&self) -> Result<()> {
        match self {
            Self::ClickHouse(s) => s.initialize().await,
            Self::Memory(s) => s.initialize().await,
        }
    }

    async fn ensure_schema(&self) -> Result<()> {
        match self {
            Self::ClickHouse(s) => s.ensure_schema().await,
            Self::Memory(s) => s.ensure_schema().await,
        }
    }

    async fn insert_point(&self, point: &PingPoint) -> Result<()> {
        match self {
            Self::ClickHouse(s) => s.insert_point(point).await,
            Self::Memory(s) => s.insert_point(point).await,
        }
    }

    async fn get_recent_points(&self, start: i64, end: i64) -> Result<Vec<PingPoint>> {
        match self {
            Self::ClickHouse(s) => s.get_recent_points(start, end).await,
            Self::Memory(s) => s.get_recent_points(start, end).await,
        }
    }

    async fn get_record(&self, address: &str) -> Result<Option<PlayerRecord>> {
        match self {
            Self::ClickHouse(s) => s.get_record(address).await,
            Self::Memory(s) => s.get_record(address).await,
        }
    }

    async fn get_legacy_record(&self, address: &str) -> Result<Option<PlayerRecord>> {
        match self {
            Self::ClickHouse(s) => s.get_legacy_record(address).await,
            Self::Memory(s) => s.get_legacy_record(address).await,
        }
    }

    async fn insert_record_if_absent(&self, address: &str, record: PlayerRecord) -> Result<bool> {
        match self {
            Self::ClickHouse(s) => s.insert_record_if_absent(address, record).await,
            Self::Memory(s) => s.insert_record_if_absent(address, record).await,
        }
    }

    async fn upsert_record(&self, address: &str, record: PlayerRecord) -> Result<()> {
        match self {
            Self::ClickHouse(s) => s.upsert_record(address, record).await,
            Self::Memory(s) => s.upsert_record(address, record).await,
        }
    }

    async fn delete_older_than(&self, cutoff: i64) -> Result<RetentionReport> {
        match self {
            Self::ClickHouse(s) => s.delete_older_than(cutoff).await,
            Self::Memory(s) => s.delete_older_than(cutoff).await,
        }
    }

    async fn close(&self) -> Result<()> {
        match self {
            Self::ClickHouse(s) => s.close().await,
            Self::Memory(s) => s.close().await,
        }
    }
}
