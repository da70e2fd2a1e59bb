use std::sync::Arc;
use std::time::Instant;

use serde::Serialize;

use super::Collector;
use crate::clock::{self, Alignment};
use crate::config::QueryConfig;
use crate::store::Store;
use crate::table::{CounterKey, Tick};

/// Reasons a range query cannot be answered.
#[derive(Debug, thiserror::Error)]
pub enum QueryError {
    #[error("invalid range: begin={begin}, end={end}")]
    InvalidRange { begin: i64, end: i64 },
    #[error("alignment {align}s is not a multiple of the base alignment {base}s")]
    InvalidAlignment { align: i64, base: i64 },
    #[error("range covers {points} buckets, limit is {limit}")]
    TooManyPoints { points: usize, limit: usize },
    #[error("loading stored buckets failed")]
    Store(#[source] anyhow::Error),
}

impl QueryError {
    /// Numeric code returned in the chart response envelope.
    pub fn code(&self) -> i32 {
        match self {
            Self::InvalidRange { .. } => 14,
            Self::Store(_) => 15,
            Self::InvalidAlignment { .. } => 16,
            Self::TooManyPoints { .. } => 17,
        }
    }
}

/// One output bucket.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct Point {
    #[serde(rename = "s")]
    pub sum: i64,
    #[serde(rename = "c")]
    pub count: u64,
}

impl From<Tick> for Point {
    fn from(t: Tick) -> Self {
        Self {
            sum: t.sum,
            count: t.count,
        }
    }
}

/// A range request. Unset bounds fall back to the engine defaults.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RangeQuery {
    pub key: CounterKey,
    pub begin: Option<i64>,
    pub end: Option<i64>,
    pub align: Option<i64>,
}

/// Query result. `points[i]` is the bucket at `begin + i * alignment`, and
/// the series covers `[begin, end)`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Series {
    pub key: CounterKey,
    pub begin: i64,
    pub end: i64,
    pub alignment: i64,
    pub points: Vec<Point>,
}

/// Answers range queries from the durable store plus the live windows.
pub struct QueryEngine {
    collector: Arc<Collector>,
    store: Arc<Store>,
    end_offset: i64,
    max_points: usize,
}

impl QueryEngine {
    pub fn new(collector: Arc<Collector>, store: Arc<Store>, cfg: &QueryConfig) -> Self {
        Self {
            collector,
            store,
            end_offset: cfg.end_offset.as_secs() as i64,
            max_points: cfg.max_points,
        }
    }

    pub fn base_alignment(&self) -> Alignment {
        self.collector.layout().alignment
    }

    pub async fn get_range(&self, q: &RangeQuery) -> Result<Series, QueryError> {
        let started = Instant::now();
        let result = self.run(q).await;

        if let Some(h) = &self.collector.health {
            let status = if result.is_ok() { "ok" } else { "error" };
            h.queries.with_label_values(&[status]).inc();
            h.query_duration.observe(started.elapsed().as_secs_f64());
        }

        result
    }

    async fn run(&self, q: &RangeQuery) -> Result<Series, QueryError> {
        let base = self.base_alignment();
        let now = self.collector.clock().now();

        let begin = q.begin.unwrap_or_else(|| clock::start_of_day(now));
        let end = q.end.unwrap_or(now - self.end_offset);
        if begin < 0 || end < begin {
            return Err(QueryError::InvalidRange { begin, end });
        }

        let out = resolve_alignment(base, q.align)?;

        let begin = base.floor(begin);
        let end = base.floor(end);
        let len = (base.buckets_between(begin, end) + 1) as usize;
        if len > self.max_points {
            return Err(QueryError::TooManyPoints {
                points: len,
                limit: self.max_points,
            });
        }

        let mut dense = vec![Tick::default(); len];
        let rows = self
            .store
            .query(q.key, begin, end)
            .await
            .map_err(QueryError::Store)?;
        for row in rows {
            if row.time < begin || row.time > end {
                continue;
            }
            let j = base.buckets_between(begin, row.time) as usize;
            if let Some(slot) = dense.get_mut(j) {
                *slot = row;
            }
        }

        self.collector.overlay(q.key, begin, end, &mut dense);

        let points: Vec<Point> = dense.into_iter().map(Point::from).collect();
        let (begin, points) = rebin(&points, begin, base, out);
        let end = begin + points.len() as i64 * out;

        tracing::trace!(key = q.key, begin, end, alignment = out, "range query served");

        Ok(Series {
            key: q.key,
            begin,
            end,
            alignment: out,
            points,
        })
    }
}

/// Output alignment for a requested `align`: unset or finer than the base
/// means the base; anything else must be a multiple of it.
pub fn resolve_alignment(base: Alignment, align: Option<i64>) -> Result<i64, QueryError> {
    match align {
        None => Ok(base.secs()),
        Some(a) if a <= base.secs() => Ok(base.secs()),
        Some(a) if base.is_multiple(a) => Ok(a),
        Some(a) => Err(QueryError::InvalidAlignment {
            align: a,
            base: base.secs(),
        }),
    }
}

/// Regroups `points` (base-aligned from `begin`) into buckets of `out`
/// seconds, each starting at `floor(ts / out) * out`.
///
/// Returns the first output bucket start and the regrouped points. When
/// `out` equals the base alignment the input is returned unchanged.
pub fn rebin(points: &[Point], begin: i64, base: Alignment, out: i64) -> (i64, Vec<Point>) {
    if out == base.secs() || points.is_empty() {
        return (begin, points.to_vec());
    }

    let first = begin.div_euclid(out) * out;
    let last_ts = begin + (points.len() as i64 - 1) * base.secs();
    let len = (last_ts.div_euclid(out) * out - first) / out + 1;

    let mut binned = vec![Point::default(); len as usize];
    for (i, p) in points.iter().enumerate() {
        let ts = begin + i as i64 * base.secs();
        let j = ((ts.div_euclid(out) * out - first) / out) as usize;
        binned[j].sum = binned[j].sum.saturating_add(p.sum);
        binned[j].count = binned[j].count.saturating_add(p.count);
    }

    (first, binned)
}
