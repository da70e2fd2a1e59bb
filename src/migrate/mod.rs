use anyhow::{bail, Context, Result};
use clickhouse_rs::Pool;

/// One embedded schema step.
struct Migration {
    version: u32,
    name: &'static str,
    up: &'static str,
    down: &'static str,
}

/// Ordered by version.
static MIGRATIONS: &[Migration] = &[Migration {
    version: 1,
    name: "counter_ticks",
    up: include_str!("sql/001_counter_ticks.up.sql"),
    down: include_str!("sql/001_counter_ticks.down.sql"),
}];

const TRACKING_TABLE: &str = "schema_migrations";

/// Applied schema version as recorded in the tracking table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MigrationStatus {
    pub version: u32,
    /// Set while a step is running; a crashed step leaves it set.
    pub dirty: bool,
}

impl MigrationStatus {
    /// Highest version shipped with this binary.
    pub fn latest() -> u32 {
        MIGRATIONS.last().map(|m| m.version).unwrap_or(0)
    }

    pub fn is_current(&self) -> bool {
        !self.dirty && self.version == Self::latest()
    }
}

/// Applies the embedded schema to ClickHouse and tracks the applied
/// version in `schema_migrations`.
pub struct ClickHouseMigrator {
    pool: Pool,
}

impl ClickHouseMigrator {
    pub fn new(pool: Pool) -> Self {
        Self { pool }
    }

    /// Applies every step newer than the recorded version.
    pub async fn up(&self) -> Result<MigrationStatus> {
        let status = self.status().await?;
        if status.dirty {
            bail!(
                "schema version {} is dirty, fix it by hand before migrating",
                status.version
            );
        }

        let pending: Vec<&Migration> = MIGRATIONS
            .iter()
            .filter(|m| m.version > status.version)
            .collect();

        if pending.is_empty() {
            tracing::info!(version = status.version, "schema is up to date");
            return Ok(status);
        }

        for m in pending {
            tracing::info!(version = m.version, name = m.name, "applying migration");
            self.record(m.version, true).await?;
            self.run_script(m.up)
                .await
                .with_context(|| format!("applying migration {} ({})", m.version, m.name))?;
            self.record(m.version, false).await?;
        }

        let status = self.status().await?;
        tracing::info!(version = status.version, "migrations applied");
        Ok(status)
    }

    /// Reverts the most recent step.
    pub async fn down(&self) -> Result<MigrationStatus> {
        let status = self.status().await?;
        if status.version == 0 {
            tracing::info!("nothing to roll back");
            return Ok(status);
        }

        let m = MIGRATIONS
            .iter()
            .find(|m| m.version == status.version)
            .with_context(|| format!("unknown schema version {}", status.version))?;

        tracing::info!(version = m.version, name = m.name, "rolling back migration");
        self.record(m.version, true).await?;
        self.run_script(m.down)
            .await
            .with_context(|| format!("rolling back migration {} ({})", m.version, m.name))?;

        let previous = previous_version(m.version);
        if previous == 0 {
            self.clear().await?;
        } else {
            self.record(previous, false).await?;
        }

        self.status().await
    }

    pub async fn status(&self) -> Result<MigrationStatus> {
        let mut handle = self
            .pool
            .get_handle()
            .await
            .context("getting ClickHouse handle for migration status")?;

        handle
            .execute(format!(
                "CREATE TABLE IF NOT EXISTS {TRACKING_TABLE} (
                    version Int64,
                    dirty UInt8,
                    sequence UInt64
                ) ENGINE = TinyLog"
            ))
            .await
            .context("creating schema_migrations")?;

        let block = handle
            .query(format!(
                "SELECT version, dirty FROM {TRACKING_TABLE} ORDER BY sequence DESC LIMIT 1"
            ))
            .fetch_all()
            .await
            .context("reading schema version")?;

        let Some(row) = block.rows().next() else {
            return Ok(MigrationStatus {
                version: 0,
                dirty: false,
            });
        };

        let version: i64 = row.get("version").context("reading version column")?;
        let dirty: u8 = row.get("dirty").context("reading dirty column")?;
        Ok(MigrationStatus {
            version: u32::try_from(version).context("schema version out of range")?,
            dirty: dirty != 0,
        })
    }

    async fn record(&self, version: u32, dirty: bool) -> Result<()> {
        self.clear().await?;

        let mut handle = self
            .pool
            .get_handle()
            .await
            .context("getting ClickHouse handle for version update")?;
        handle
            .execute(format!(
                "INSERT INTO {TRACKING_TABLE} (version, dirty, sequence) VALUES ({version}, {}, 1)",
                u8::from(dirty)
            ))
            .await
            .context("recording schema version")?;
        Ok(())
    }

    async fn clear(&self) -> Result<()> {
        let mut handle = self
            .pool
            .get_handle()
            .await
            .context("getting ClickHouse handle for version update")?;
        handle
            .execute(format!("TRUNCATE TABLE {TRACKING_TABLE}"))
            .await
            .context("truncating schema_migrations")?;
        Ok(())
    }

    async fn run_script(&self, script: &str) -> Result<()> {
        let mut handle = self
            .pool
            .get_handle()
            .await
            .context("getting ClickHouse handle for migration script")?;

        for stmt in statements(script) {
            let head: String = stmt.chars().take(60).collect();
            handle
                .execute(stmt.as_str())
                .await
                .with_context(|| format!("executing `{head}...`"))?;
        }
        Ok(())
    }
}

fn previous_version(version: u32) -> u32 {
    MIGRATIONS
        .iter()
        .map(|m| m.version)
        .filter(|v| *v < version)
        .max()
        .unwrap_or(0)
}

/// Splits a script on `;`, dropping `--` comment lines and blank statements.
fn statements(script: &str) -> Vec<String> {
    let stripped: String = script
        .lines()
        .filter(|line| !line.trim_start().starts_with("--"))
        .collect::<Vec<_>>()
        .join("\n");

    stripped
        .split(';')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}
