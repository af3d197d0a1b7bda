use std::time::Instant;

use anyhow::{Context, Result};
use clickhouse_rs::Pool;
use parking_lot::Mutex;

use super::{RetentionReport, Store};
use crate::config::ClickHouseConfig;
use crate::migrate::ClickHouseSchema;
use crate::model::{PingPoint, PlayerRecord};

/// ClickHouse provider over the native TCP protocol.
///
/// Records live in a `ReplacingMergeTree(version)` table read with `FINAL`.
/// Records migrated from the point table are written with version 0; upserts
/// use the record's own timestamp, so a newer peak always replaces an older one.
pub struct ClickHouseStore {
    cfg: ClickHouseConfig,
    pool: Mutex<Option<Pool>>,
}

impl ClickHouseStore {
    pub fn new(cfg: ClickHouseConfig) -> Self {
        Self {
            cfg,
            pool: Mutex::new(None),
        }
    }

    /// Returns the connection pool, if initialized.
    pub fn pool(&self) -> Option<Pool> {
        self.pool.lock().clone()
    }

    fn require_pool(&self) -> Result<Pool> {
        self.pool().context("ClickHouse store is not initialized")
    }

    async fn execute(&self, sql: &str, what: &'static str) -> Result<()> {
        let pool = self.require_pool()?;
        let mut handle = pool
            .get_handle()
            .await
            .with_context(|| format!("getting ClickHouse handle for {what}"))?;

        handle
            .execute(sql)
            .await
            .with_context(|| format!("executing {what}"))?;

        Ok(())
    }

    async fn query_record(&self, sql: &str, what: &'static str) -> Result<Option<PlayerRecord>> {
        let pool = self.require_pool()?;
        let mut handle = pool
            .get_handle()
            .await
            .with_context(|| format!("getting ClickHouse handle for {what}"))?;

        let block = handle
            .query(sql)
            .fetch_all()
            .await
            .with_context(|| format!("querying {what}"))?;

        let Some(row) = block.rows().next() else {
            return Ok(None);
        };

        let player_count: Option<i32> = row.get("player_count").context("reading player_count")?;
        let timestamp: Option<i64> = row.get("timestamp").context("reading timestamp")?;

        Ok(Some(PlayerRecord {
            player_count: player_count.and_then(|c| u32::try_from(c).ok()),
            timestamp,
        }))
    }

    async fn insert_record(&self, address: &str, record: PlayerRecord, version: u64) -> Result<()> {
        let sql = format!(
            "INSERT INTO players_record (server_address, player_count, timestamp, version) \
             VALUES ('{}', {}, {}, {version})",
            escape_sql(address),
            sql_nullable(record.player_count),
            sql_nullable(record.timestamp),
        );

        self.execute(&sql, "record insert").await
    }
}

impl Store for ClickHouseStore {
    fn name(&self) -> &'static str {
        "clickhouse"
    }

    async fn initialize(&self) -> Result<()> {
        let pool = Pool::new(self.cfg.dsn());

        let mut handle = pool
            .get_handle()
            .await
            .context("opening ClickHouse connection")?;

        handle.ping().await.context("pinging ClickHouse")?;

        tracing::info!(
            endpoint = %self.cfg.endpoint,
            database = %self.cfg.database,
            "ClickHouse store connected",
        );

        *self.pool.lock() = Some(pool);

        Ok(())
    }

    async fn ensure_schema(&self) -> Result<()> {
        let pool = self.require_pool()?;
        ClickHouseSchema::new(pool)
            .up()
            .await
            .context("preparing ClickHouse schema")
    }

    async fn insert_point(&self, point: &PingPoint) -> Result<()> {
        let sql = format!(
            "INSERT INTO pings (timestamp, server_address, player_count) VALUES ({}, '{}', {})",
            point.timestamp,
            escape_sql(&point.server_address),
            sql_nullable(point.player_count),
        );

        self.execute(&sql, "ping insert").await
    }

    async fn get_recent_points(&self, start: i64, end: i64) -> Result<Vec<PingPoint>> {
        let pool = self.require_pool()?;
        let mut handle = pool
            .get_handle()
            .await
            .context("getting ClickHouse handle for range scan")?;

        let sql = format!(
            "SELECT timestamp, server_address, player_count FROM pings \
             WHERE timestamp >= {start} AND timestamp <= {end}"
        );

        let block = handle
            .query(sql.as_str())
            .fetch_all()
            .await
            .context("querying recent pings")?;

        let mut points = Vec::with_capacity(block.row_count());
        for row in block.rows() {
            let timestamp: i64 = row.get("timestamp").context("reading timestamp")?;
            let server_address: String =
                row.get("server_address").context("reading server_address")?;
            let player_count: Option<i32> =
                row.get("player_count").context("reading player_count")?;

            points.push(PingPoint {
                timestamp,
                server_address,
                player_count: player_count.and_then(|c| u32::try_from(c).ok()),
            });
        }

        Ok(points)
    }

    async fn get_record(&self, address: &str) -> Result<Option<PlayerRecord>> {
        let sql = format!(
            "SELECT player_count, timestamp FROM players_record FINAL \
             WHERE server_address = '{}' LIMIT 1",
            escape_sql(address),
        );

        self.query_record(&sql, "record lookup").await
    }

    async fn get_legacy_record(&self, address: &str) -> Result<Option<PlayerRecord>> {
        let sql = format!(
            "SELECT player_count, toNullable(timestamp) AS timestamp FROM pings \
             WHERE server_address = '{}' AND player_count IS NOT NULL \
             ORDER BY player_count DESC, timestamp ASC LIMIT 1",
            escape_sql(address),
        );

        self.query_record(&sql, "legacy record lookup").await
    }

    async fn insert_record_if_absent(&self, address: &str, record: PlayerRecord) -> Result<bool> {
        if self.get_record(address).await?.is_some() {
            return Ok(false);
        }

        self.insert_record(address, record, 0).await?;

        // Concurrent version-0 inserts collapse to one row; report whether
        // ours is the one that stands.
        let stored = self.get_record(address).await?;
        Ok(stored == Some(record))
    }

    async fn upsert_record(&self, address: &str, record: PlayerRecord) -> Result<()> {
        self.insert_record(address, record, record_version(&record))
            .await
    }

    async fn delete_older_than(&self, cutoff: i64) -> Result<RetentionReport> {
        let started = Instant::now();

        let sql = format!("DELETE FROM pings WHERE timestamp < {cutoff}");
        self.execute(&sql, "retention delete").await?;

        Ok(RetentionReport {
            deleted: None,
            elapsed: started.elapsed(),
        })
    }

    async fn close(&self) -> Result<()> {
        if self.pool.lock().take().is_some() {
            tracing::info!("ClickHouse store closed");
        }
        Ok(())
    }
}

/// Replacing version for an upserted record. Migrated rows use 0.
fn record_version(record: &PlayerRecord) -> u64 {
    record.timestamp.map_or(1, |ts| ts.max(1) as u64)
}

fn escape_sql(s: &str) -> String {
    s.replace('\\', "\\\\").replace('\'', "\\'")
}

fn sql_nullable<T: std::fmt::Display>(value: Option<T>) -> String {
    match value {
        Some(v) => v.to_string(),
        None => "NULL".to_string(),
    }
}
