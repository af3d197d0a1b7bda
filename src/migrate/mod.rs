//! Versioned ClickHouse schema for the `pings` and `players_record` tables.
//!
//! Applied versions are appended to `pingtrack_schema`; the row with the
//! highest `seq` is the current state. A step is recorded dirty before its
//! statements run and clean afterwards, so an interrupted step stays visible.

use anyhow::{Context, Result};
use clickhouse_rs::Pool;
use thiserror::Error;

#[derive(Debug)]
struct SchemaStep {
    version: u32,
    name: &'static str,
    up: &'static str,
    down: &'static str,
}

static STEPS: &[SchemaStep] = &[
    SchemaStep {
        version: 1,
        name: "ping and record tables",
        up: include_str!("sql/001_init.up.sql"),
        down: include_str!("sql/001_init.down.sql"),
    },
    SchemaStep {
        version: 2,
        name: "server address index",
        up: include_str!("sql/002_server_index.up.sql"),
        down: include_str!("sql/002_server_index.down.sql"),
    },
];

/// Columns the store reads or writes, per table.
const REQUIRED_COLUMNS: &[(&str, &[&str])] = &[
    ("pings", &["timestamp", "server_address", "player_count"]),
    (
        "players_record",
        &["server_address", "player_count", "timestamp", "version"],
    ),
];

#[derive(Debug, Error, PartialEq, Eq)]
pub enum SchemaError {
    #[error("schema version {0} was left dirty by an interrupted migration")]
    Dirty(u32),

    #[error("schema version {found} is newer than this build supports ({latest})")]
    Ahead { found: u32, latest: u32 },

    #[error("schema is missing columns: {}", .0.join(", "))]
    MissingColumns(Vec<String>),
}

/// Current schema version as read from the ledger.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MigrationStatus {
    pub version: u32,
    pub dirty: bool,
    pub latest: u32,
}

impl MigrationStatus {
    fn fresh() -> Self {
        Self {
            version: 0,
            dirty: false,
            latest: latest_version(),
        }
    }

    pub fn pending(&self) -> usize {
        STEPS.iter().filter(|s| s.version > self.version).count()
    }

    fn check(&self) -> Result<(), SchemaError> {
        if self.dirty {
            return Err(SchemaError::Dirty(self.version));
        }
        if self.version > self.latest {
            return Err(SchemaError::Ahead {
                found: self.version,
                latest: self.latest,
            });
        }
        Ok(())
    }

    /// Steps still to apply, in version order.
    fn plan_up(&self) -> Result<Vec<&'static SchemaStep>, SchemaError> {
        self.check()?;
        Ok(STEPS.iter().filter(|s| s.version > self.version).collect())
    }

    /// The step to revert and the version left behind, or `None` at version 0.
    fn plan_down(&self) -> Result<Option<(&'static SchemaStep, u32)>, SchemaError> {
        self.check()?;
        let Some(step) = STEPS.iter().find(|s| s.version == self.version) else {
            return Ok(None);
        };
        let previous = STEPS
            .iter()
            .map(|s| s.version)
            .filter(|v| *v < step.version)
            .max()
            .unwrap_or(0);
        Ok(Some((step, previous)))
    }
}

/// Highest version this build knows about.
pub fn latest_version() -> u32 {
    STEPS.last().map_or(0, |s| s.version)
}

/// Applies and reverts schema steps against one ClickHouse database.
pub struct ClickHouseSchema {
    pool: Pool,
}

impl ClickHouseSchema {
    pub fn new(pool: Pool) -> Self {
        Self { pool }
    }

    /// Brings the schema to the latest version and checks the table shapes.
    pub async fn up(&self) -> Result<()> {
        let (mut seq, status) = self.read_ledger().await?;
        let plan = status.plan_up()?;

        if plan.is_empty() {
            tracing::debug!(version = status.version, "schema up to date");
        }

        for step in plan {
            tracing::info!(version = step.version, step = step.name, "applying schema step");
            seq += 1;
            self.append(seq, step.version, true).await?;
            self.run(step.up)
                .await
                .with_context(|| format!("applying schema version {}", step.version))?;
            seq += 1;
            self.append(seq, step.version, false).await?;
        }

        self.verify().await
    }

    /// Reverts the most recent step.
    pub async fn down(&self) -> Result<()> {
        let (seq, status) = self.read_ledger().await?;
        let Some((step, previous)) = status.plan_down()? else {
            tracing::info!("schema already at version 0");
            return Ok(());
        };

        tracing::info!(version = step.version, step = step.name, "reverting schema step");
        self.append(seq + 1, step.version, true).await?;
        self.run(step.down)
            .await
            .with_context(|| format!("reverting schema version {}", step.version))?;
        self.append(seq + 2, previous, false).await?;

        Ok(())
    }

    pub async fn status(&self) -> Result<MigrationStatus> {
        Ok(self.read_ledger().await?.1)
    }

    /// Fails when a table the store relies on lacks one of its columns.
    pub async fn verify(&self) -> Result<()> {
        let mut handle = self
            .pool
            .get_handle()
            .await
            .context("getting ClickHouse handle for schema check")?;

        let block = handle
            .query(
                "SELECT table, name FROM system.columns \
                 WHERE database = currentDatabase() AND table IN ('pings', 'players_record')",
            )
            .fetch_all()
            .await
            .context("reading table columns")?;

        let mut found = Vec::with_capacity(block.row_count());
        for row in block.rows() {
            let table: String = row.get("table").context("reading table name")?;
            let column: String = row.get("name").context("reading column name")?;
            found.push((table, column));
        }

        let missing = missing_columns(&found);
        if !missing.is_empty() {
            return Err(SchemaError::MissingColumns(missing).into());
        }
        Ok(())
    }

    async fn read_ledger(&self) -> Result<(u64, MigrationStatus)> {
        let mut handle = self
            .pool
            .get_handle()
            .await
            .context("getting ClickHouse handle for schema ledger")?;

        handle
            .execute(
                "CREATE TABLE IF NOT EXISTS pingtrack_schema (\
                 seq UInt64, version UInt32, dirty UInt8\
                 ) ENGINE = MergeTree ORDER BY seq",
            )
            .await
            .context("creating pingtrack_schema")?;

        let block = handle
            .query("SELECT seq, version, dirty FROM pingtrack_schema ORDER BY seq DESC LIMIT 1")
            .fetch_all()
            .await
            .context("reading pingtrack_schema")?;

        let Some(row) = block.rows().next() else {
            return Ok((0, MigrationStatus::fresh()));
        };

        let seq: u64 = row.get("seq").context("reading seq")?;
        let version: u32 = row.get("version").context("reading version")?;
        let dirty: u8 = row.get("dirty").context("reading dirty")?;

        Ok((
            seq,
            MigrationStatus {
                version,
                dirty: dirty != 0,
                ..MigrationStatus::fresh()
            },
        ))
    }

    async fn append(&self, seq: u64, version: u32, dirty: bool) -> Result<()> {
        let mut handle = self
            .pool
            .get_handle()
            .await
            .context("getting ClickHouse handle for schema ledger")?;

        let sql = format!(
            "INSERT INTO pingtrack_schema (seq, version, dirty) VALUES ({seq}, {version}, {})",
            u8::from(dirty)
        );
        handle
            .execute(sql.as_str())
            .await
            .context("appending to pingtrack_schema")?;
        Ok(())
    }

    async fn run(&self, sql: &str) -> Result<()> {
        let mut handle = self
            .pool
            .get_handle()
            .await
            .context("getting ClickHouse handle for schema step")?;

        for statement in statements(sql) {
            handle.execute(statement).await?;
        }
        Ok(())
    }
}

/// Statements in a schema file, with comment-only chunks dropped.
fn statements(sql: &str) -> impl Iterator<Item = &str> {
    sql.split(';').map(str::trim).filter(|chunk| {
        chunk
            .lines()
            .map(str::trim)
            .any(|line| !line.is_empty() && !line.starts_with("--"))
    })
}

/// `table.column` names from [`REQUIRED_COLUMNS`] absent in `found`.
fn missing_columns(found: &[(String, String)]) -> Vec<String> {
    REQUIRED_COLUMNS
        .iter()
        .flat_map(|(table, columns)| columns.iter().map(move |c| (*table, *c)))
        .filter(|(table, column)| !found.iter().any(|(t, c)| t == table && c == column))
        .map(|(table, column)| format!("{table}.{column}"))
        .collect()
}
