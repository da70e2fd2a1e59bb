use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU32, Ordering};

use anyhow::{bail, Result};
use parking_lot::RwLock;

use crate::table::{CounterKey, Tick};

/// Process-local store keyed by `(key, timestamp)`.
///
/// Used for tests and single-node setups where losing history on restart is
/// acceptable.
#[derive(Debug, Default)]
pub struct MemoryStore {
    rows: RwLock<HashMap<CounterKey, BTreeMap<i64, Tick>>>,
    failures: AtomicU32,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes the next `n` upserts fail without writing anything.
    pub fn fail_next_upserts(&self, n: u32) {
        self.failures.store(n, Ordering::SeqCst);
    }

    /// Replaces any existing row at the same `(key, timestamp)`.
    pub fn upsert(&self, key: CounterKey, rows: &[Tick]) -> Result<()> {
        if self
            .failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            bail!("memory store: injected upsert failure for key {key}");
        }

        let mut all = self.rows.write();
        let series = all.entry(key).or_default();
        for row in rows {
            series.insert(row.time, *row);
        }
        Ok(())
    }

    /// Rows with `from <= time <= to`, ascending.
    pub fn query(&self, key: CounterKey, from: i64, to: i64) -> Vec<Tick> {
        if from > to {
            return Vec::new();
        }
        self.rows
            .read()
            .get(&key)
            .map(|series| series.range(from..=to).map(|(_, t)| *t).collect())
            .unwrap_or_default()
    }

    /// Total stored rows across keys.
    pub fn row_count(&self) -> usize {
        self.rows.read().values().map(BTreeMap::len).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tick(time: i64, sum: i64, count: u64) -> Tick {
        Tick { time, sum, count }
    }

    #[test]
    fn test_upsert_last_write_wins() {
        let store = MemoryStore::new();
        store.upsert(1, &[tick(10, 1, 1), tick(20, 2, 1)]).expect("upsert");
        store.upsert(1, &[tick(20, 9, 3)]).expect("upsert");

        assert_eq!(store.query(1, 0, 100), vec![tick(10, 1, 1), tick(20, 9, 3)]);
        assert_eq!(store.row_count(), 2);
    }

    #[test]
    fn test_query_is_inclusive_and_per_key() {
        let store = MemoryStore::new();
        store.upsert(1, &[tick(10, 1, 1), tick(20, 2, 1), tick(30, 3, 1)]).expect("upsert");
        store.upsert(2, &[tick(20, 5, 1)]).expect("upsert");

        assert_eq!(store.query(1, 20, 30).len(), 2);
        assert_eq!(store.query(2, 0, 100), vec![tick(20, 5, 1)]);
        assert!(store.query(3, 0, 100).is_empty());
        assert!(store.query(1, 30, 20).is_empty());
    }

    #[test]
    fn test_injected_failures_write_nothing() {
        let store = MemoryStore::new();
        store.fail_next_upserts(2);

        assert!(store.upsert(1, &[tick(10, 1, 1)]).is_err());
        assert!(store.upsert(1, &[tick(10, 1, 1)]).is_err());
        assert_eq!(store.row_count(), 0);

        store.upsert(1, &[tick(10, 1, 1)]).expect("upsert");
        assert_eq!(store.row_count(), 1);
    }
}
