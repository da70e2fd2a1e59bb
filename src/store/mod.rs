//! Durable tick storage behind the collector.

pub mod clickhouse;
pub mod memory;

use std::sync::Arc;

use anyhow::Result;

use crate::config::StoreConfig;
use crate::export::health::HealthMetrics;
use crate::table::{CounterKey, Tick};

pub use self::clickhouse::ClickHouseStore;
pub use self::memory::MemoryStore;

/// Upsert-by-timestamp tick storage.
///
/// Both backends are idempotent per `(key, timestamp)`: writing the same
/// bucket again replaces it.
pub enum Store {
    ClickHouse(ClickHouseStore),
    Memory(MemoryStore),
}

impl Store {
    /// Opens the configured backend.
    pub async fn open(cfg: &StoreConfig, health: Option<Arc<HealthMetrics>>) -> Result<Self> {
        match cfg {
            StoreConfig::Memory => {
                tracing::warn!("using in-memory store, history is lost on restart");
                Ok(Self::Memory(MemoryStore::new()))
            }
            StoreConfig::Clickhouse(ch) => {
                Ok(Self::ClickHouse(ClickHouseStore::connect(ch, health).await?))
            }
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::ClickHouse(_) => "clickhouse",
            Self::Memory(_) => "memory",
        }
    }

    /// Writes `rows` for `key`, replacing rows at the same timestamps.
    pub async fn upsert(&self, key: CounterKey, rows: &[Tick]) -> Result<()> {
        match self {
            Self::ClickHouse(s) => s.upsert(key, rows).await,
            Self::Memory(s) => s.upsert(key, rows),
        }
    }

    /// Rows with `from <= time <= to`, ascending by time.
    pub async fn query(&self, key: CounterKey, from: i64, to: i64) -> Result<Vec<Tick>> {
        match self {
            Self::ClickHouse(s) => s.query(key, from, to).await,
            Self::Memory(s) => Ok(s.query(key, from, to)),
        }
    }
}
