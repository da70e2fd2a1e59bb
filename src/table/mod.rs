use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Opaque, caller-defined metric stream identifier.
pub type CounterKey = u32;

/// One aligned-time aggregate.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Tick {
    /// Bucket start in Unix seconds, always a multiple of the alignment.
    pub time: i64,
    pub sum: i64,
    pub count: u64,
}

impl Tick {
    pub fn empty(time: i64) -> Self {
        Self {
            time,
            sum: 0,
            count: 0,
        }
    }

    /// A tick carries information only once something was counted into it.
    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    /// Adds another tick's aggregate into this one. The timestamp is kept.
    pub fn absorb(&mut self, other: &Tick) {
        self.sum = self.sum.saturating_add(other.sum);
        self.count = self.count.saturating_add(other.count);
    }
}

/// Result of recording a single value into a [`BucketTable`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Record {
    /// Added to the key's current bucket.
    Merged,
    /// Opened a new bucket for the key.
    Appended,
    /// The key already holds a bucket newer than `now`; the value was dropped.
    Stale,
}

/// Sparse per-key tick lists, appended in time order.
///
/// The agent owns exactly one of these behind its lock and swaps it out on
/// every flush.
#[derive(Debug, Default)]
pub struct BucketTable {
    series: BTreeMap<CounterKey, Vec<Tick>>,
    ticks_per_key: usize,
}

impl BucketTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a table whose per-key lists pre-allocate `ticks_per_key` slots.
    pub fn with_ticks_per_key(ticks_per_key: usize) -> Self {
        Self {
            series: BTreeMap::new(),
            ticks_per_key,
        }
    }

    /// Records `value` for `key` in the bucket starting at `now`, which the
    /// caller has already aligned.
    pub fn record(&mut self, key: CounterKey, now: i64, value: i64) -> Record {
        let ticks = self
            .series
            .entry(key)
            .or_insert_with(|| Vec::with_capacity(self.ticks_per_key));

        match ticks.last_mut() {
            Some(last) if last.time == now => {
                last.absorb(&Tick {
                    time: now,
                    sum: value,
                    count: 1,
                });
                Record::Merged
            }
            Some(last) if last.time > now => Record::Stale,
            _ => {
                ticks.push(Tick {
                    time: now,
                    sum: value,
                    count: 1,
                });
                Record::Appended
            }
        }
    }

    pub fn is_empty(&self) -> bool {
        self.series.is_empty()
    }

    /// Number of distinct keys.
    pub fn len(&self) -> usize {
        self.series.len()
    }

    pub fn get(&self, key: CounterKey) -> Option<&[Tick]> {
        self.series.get(&key).map(Vec::as_slice)
    }

    /// Consumes the table into a transmittable snapshot.
    pub fn into_snapshot(self) -> Snapshot {
        Snapshot {
            table: self.series,
        }
    }
}

/// One agent flush worth of data, as sent to the collector.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Snapshot {
    pub table: BTreeMap<CounterKey, Vec<Tick>>,
}

impl Snapshot {
    pub fn is_empty(&self) -> bool {
        self.table.values().all(Vec::is_empty)
    }

    /// Total ticks across all keys.
    pub fn tick_count(&self) -> usize {
        self.table.values().map(Vec::len).sum()
    }
}

/// Earliest and latest timestamps of a tick list, or `None` when it is empty.
///
/// Lists produced by an agent are already ordered; lists received from the
/// network are not trusted to be.
pub fn series_bounds(ticks: &[Tick]) -> Option<(i64, i64)> {
    let first = ticks.first()?.time;
    Some(
        ticks
            .iter()
            .fold((first, first), |(lo, hi), t| (lo.min(t.time), hi.max(t.time))),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_same_bucket_merges() {
        let mut table = BucketTable::new();
        assert_eq!(table.record(100, 1_000, 5), Record::Appended);
        assert_eq!(table.record(100, 1_000, 5), Record::Merged);

        assert_eq!(
            table.get(100),
            Some(
                [Tick {
                    time: 1_000,
                    sum: 10,
                    count: 2
                }]
                .as_slice()
            )
        );
    }

    #[test]
    fn test_record_new_bucket_appends() {
        let mut table = BucketTable::with_ticks_per_key(4);
        table.record(7, 1_000, 1);
        table.record(7, 1_010, -3);

        let ticks = table.get(7).expect("key present");
        assert_eq!(ticks.len(), 2);
        assert_eq!(ticks[1], Tick {
            time: 1_010,
            sum: -3,
            count: 1
        });
    }

    #[test]
    fn test_record_backwards_clock_is_dropped() {
        let mut table = BucketTable::new();
        table.record(7, 1_010, 1);
        assert_eq!(table.record(7, 1_000, 99), Record::Stale);

        let ticks = table.get(7).expect("key present");
        assert_eq!(ticks.len(), 1);
        assert_eq!(ticks[0].sum, 1);
    }

    #[test]
    fn test_record_saturates_instead_of_overflowing() {
        let mut table = BucketTable::new();
        table.record(1, 0, i64::MAX);
        table.record(1, 0, 1);
        assert_eq!(table.get(1).expect("key present")[0].sum, i64::MAX);
    }

    #[test]
    fn test_into_snapshot_keeps_all_keys() {
        let mut table = BucketTable::new();
        table.record(1, 0, 1);
        table.record(2, 0, 2);
        table.record(2, 10, 3);
        assert_eq!(table.len(), 2);

        let snapshot = table.into_snapshot();
        assert!(!snapshot.is_empty());
        assert_eq!(snapshot.tick_count(), 3);
    }

    #[test]
    fn test_snapshot_json_shape() {
        let mut table = BucketTable::new();
        table.record(42, 1_000, 5);
        let json = serde_json::to_string(&table.into_snapshot()).expect("serialize");
        assert_eq!(
            json,
            r#"{"table":{"42":[{"time":1000,"sum":5,"count":1}]}}"#
        );

        let back: Snapshot = serde_json::from_str(&json).expect("deserialize");
        assert_eq!(back.table[&42][0].count, 1);
    }

    #[test]
    fn test_series_bounds_unordered() {
        let ticks = [Tick::empty(30), Tick::empty(10), Tick::empty(20)];
        assert_eq!(series_bounds(&ticks), Some((10, 30)));
        assert_eq!(series_bounds(&[]), None);
    }
}
