//! Central window cache: merges agent snapshots, evicts aged-out buckets to
//! the durable store, and serves range queries.

pub mod http;
pub mod query;
pub mod window;

use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{anyhow, Result};
use parking_lot::RwLock;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::clock::Clock;
use crate::config::CollectorConfig;
use crate::export::health::HealthMetrics;
use crate::store::Store;
use crate::table::{series_bounds, CounterKey, Snapshot, Tick};

use self::window::{Window, WindowLayout};

/// Work items for the merge worker. All window mutations go through here so
/// they are applied one at a time.
#[derive(Debug)]
pub enum Request {
    /// Merge one agent snapshot.
    SubmitTable(Snapshot),
    /// Persist the pending buckets of windows idle for at least this long.
    SweepIdle(Duration),
}

/// Buckets handed to the store after leaving a window's unsaved range.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Eviction {
    pub key: CounterKey,
    pub rows: Vec<Tick>,
}

/// What one snapshot merge did.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct MergeReport {
    pub created: usize,
    pub merged: usize,
    pub reanchored: usize,
    pub evictions: Vec<Eviction>,
}

/// Owner of every per-key window.
///
/// Mutation happens only through the merge methods, which take the write lock
/// once per call; readers take the read lock and never see a half-applied
/// snapshot.
pub struct Collector {
    layout: WindowLayout,
    clock: Clock,
    windows: RwLock<HashMap<CounterKey, Window>>,
    health: Option<Arc<HealthMetrics>>,
}

impl Collector {
    pub fn new(layout: WindowLayout, clock: Clock, health: Option<Arc<HealthMetrics>>) -> Self {
        Self {
            layout,
            clock,
            windows: RwLock::new(HashMap::new()),
            health,
        }
    }

    pub fn layout(&self) -> &WindowLayout {
        &self.layout
    }

    pub fn clock(&self) -> &Clock {
        &self.clock
    }

    /// Number of keys with a window.
    pub fn len(&self) -> usize {
        self.windows.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.windows.read().is_empty()
    }

    /// Copy of the window for `key`, if any.
    pub fn window(&self, key: CounterKey) -> Option<Window> {
        self.windows.read().get(&key).cloned()
    }

    /// Applies a snapshot to the window cache.
    ///
    /// Per key: creates a window on first sighting, merges in place when the
    /// newest tick fits, and otherwise evicts the unsaved range and
    /// re-anchors on the current time before merging.
    pub fn merge_snapshot(&self, snapshot: &Snapshot) -> MergeReport {
        let started = Instant::now();
        let now = self.clock.now();
        let layout = self.layout;
        let mut report = MergeReport::default();

        let mut windows = self.windows.write();
        for (&key, ticks) in &snapshot.table {
            let Some(bounds) = series_bounds(ticks) else {
                continue;
            };

            match windows.entry(key) {
                Entry::Vacant(slot) => {
                    slot.insert(Window::create(&layout, now, ticks, bounds));
                    report.created += 1;
                }
                Entry::Occupied(mut slot) => {
                    let window = slot.get_mut();
                    if window.fits(&layout, bounds.1) {
                        window.merge(&layout, now, ticks, bounds);
                        report.merged += 1;
                        continue;
                    }

                    let rows = window.take_unsaved();
                    let mut next = window.reanchor(&layout, now);
                    tracing::debug!(
                        key,
                        old_base = window.base(),
                        new_base = next.base(),
                        evicted = rows.len(),
                        "re-anchoring window",
                    );
                    next.merge(&layout, now, ticks, bounds);
                    *window = next;
                    report.reanchored += 1;

                    if !rows.is_empty() {
                        report.evictions.push(Eviction { key, rows });
                    }
                }
            }
        }
        let tracked = windows.len();
        drop(windows);

        if let Some(h) = &self.health {
            h.snapshots_merged.inc();
            h.reanchors.inc_by(report.reanchored as f64);
            h.windows_tracked.set(tracked as f64);
            h.merge_duration.observe(started.elapsed().as_secs_f64());
        }

        report
    }

    /// Makes every window idle for at least `idle_after` durable, returning
    /// the buckets to persist.
    pub fn sweep_idle(&self, idle_after: Duration) -> Vec<Eviction> {
        let cutoff = self.clock.now() - idle_after.as_secs() as i64;
        let evictions = self.evict_where(|w| w.touched_at() <= cutoff);

        if let Some(h) = &self.health {
            h.idle_flushes.inc_by(evictions.len() as f64);
        }

        evictions
    }

    /// Makes every window durable, returning all pending buckets.
    pub fn drain(&self) -> Vec<Eviction> {
        self.evict_where(|_| true)
    }

    fn evict_where(&self, pred: impl Fn(&Window) -> bool) -> Vec<Eviction> {
        let mut windows = self.windows.write();
        let mut evictions = Vec::new();
        for (&key, window) in windows.iter_mut() {
            if window.unsaved().is_none() || !pred(window) {
                continue;
            }
            let rows = window.take_unsaved();
            if !rows.is_empty() {
                evictions.push(Eviction { key, rows });
            }
        }
        evictions.sort_by_key(|e| e.key);
        evictions
    }

    /// Adds the unsaved buckets of `key`'s window in `[begin, end]` into
    /// `points` (one point per alignment step from `begin`).
    pub fn overlay(&self, key: CounterKey, begin: i64, end: i64, points: &mut [Tick]) {
        if let Some(window) = self.windows.read().get(&key) {
            window.overlay_unsaved(&self.layout, begin, end, points);
        }
    }
}

/// Sending side of the merge queue.
#[derive(Debug, Clone)]
pub struct CollectorHandle {
    tx: mpsc::Sender<Request>,
}

impl CollectorHandle {
    /// Queues a snapshot, waiting for room when the merge worker lags.
    pub async fn submit(&self, snapshot: Snapshot) -> Result<()> {
        self.send(Request::SubmitTable(snapshot)).await
    }

    pub async fn sweep_idle(&self, idle_after: Duration) -> Result<()> {
        self.send(Request::SweepIdle(idle_after)).await
    }

    async fn send(&self, req: Request) -> Result<()> {
        self.tx
            .send(req)
            .await
            .map_err(|_| anyhow!("collector merge queue closed"))
    }
}

/// Tuning for the background workers.
#[derive(Debug, Clone)]
pub struct ServiceOptions {
    pub queue_size: usize,
    pub persist_queue_size: usize,
    pub persist_retries: u32,
    pub persist_retry_delay: Duration,
    pub idle_flush_after: Option<Duration>,
    pub idle_sweep_interval: Duration,
}

impl From<&CollectorConfig> for ServiceOptions {
    fn from(cfg: &CollectorConfig) -> Self {
        Self {
            queue_size: cfg.queue_size,
            persist_queue_size: cfg.persist_queue_size,
            persist_retries: cfg.persist_retries,
            persist_retry_delay: cfg.persist_retry_delay,
            idle_flush_after: cfg.idle_flush_after,
            idle_sweep_interval: cfg.idle_sweep_interval,
        }
    }
}

/// Starts the merge worker, the persist worker and (when enabled) the idle
/// sweep ticker.
///
/// The returned task completes after `ctx` is cancelled, every window has
/// been drained and the persist worker has written what it could.
pub fn spawn(
    collector: Arc<Collector>,
    store: Arc<Store>,
    opts: ServiceOptions,
    ctx: CancellationToken,
) -> (CollectorHandle, JoinHandle<()>) {
    let (tx, rx) = mpsc::channel(opts.queue_size.max(1));
    let (persist_tx, persist_rx) = mpsc::channel(opts.persist_queue_size.max(1));
    let handle = CollectorHandle { tx };

    let persist = tokio::spawn(persist_loop(
        store,
        persist_rx,
        opts.persist_retries,
        opts.persist_retry_delay,
        collector.health.clone(),
    ));

    let sweeper = opts.idle_flush_after.map(|idle_after| {
        tokio::spawn(sweep_loop(
            handle.clone(),
            idle_after,
            opts.idle_sweep_interval,
            ctx.clone(),
        ))
    });

    let task = tokio::spawn(async move {
        merge_loop(&collector, rx, &persist_tx, ctx).await;

        let drained = collector.drain();
        if !drained.is_empty() {
            tracing::info!(windows = drained.len(), "draining pending buckets");
        }
        for eviction in drained {
            queue_eviction(&persist_tx, eviction, collector.health.as_deref()).await;
        }
        drop(persist_tx);

        if let Some(sweeper) = sweeper {
            let _ = sweeper.await;
        }
        if let Err(e) = persist.await {
            tracing::error!(error = %e, "persist worker panicked");
        }
        tracing::info!("collector stopped");
    });

    (handle, task)
}

async fn merge_loop(
    collector: &Collector,
    mut rx: mpsc::Receiver<Request>,
    persist_tx: &mpsc::Sender<Eviction>,
    ctx: CancellationToken,
) {
    loop {
        let req = tokio::select! {
            biased;
            _ = ctx.cancelled() => break,
            req = rx.recv() => match req {
                Some(req) => req,
                None => break,
            },
        };

        let evictions = match req {
            Request::SubmitTable(snapshot) => {
                let report = collector.merge_snapshot(&snapshot);
                tracing::debug!(
                    keys = snapshot.table.len(),
                    created = report.created,
                    merged = report.merged,
                    reanchored = report.reanchored,
                    "merged snapshot",
                );
                report.evictions
            }
            Request::SweepIdle(idle_after) => {
                let evictions = collector.sweep_idle(idle_after);
                if !evictions.is_empty() {
                    tracing::debug!(windows = evictions.len(), "idle windows flushed");
                }
                evictions
            }
        };

        for eviction in evictions {
            queue_eviction(persist_tx, eviction, collector.health.as_deref()).await;
        }
    }

    // Apply snapshots that were already accepted before shutting down.
    rx.close();
    while let Some(req) = rx.recv().await {
        if let Request::SubmitTable(snapshot) = req {
            for eviction in collector.merge_snapshot(&snapshot).evictions {
                queue_eviction(persist_tx, eviction, collector.health.as_deref()).await;
            }
        }
    }
}

async fn queue_eviction(
    persist_tx: &mpsc::Sender<Eviction>,
    eviction: Eviction,
    health: Option<&HealthMetrics>,
) {
    let key = eviction.key;
    if persist_tx.send(eviction).await.is_err() {
        tracing::error!(key, "persist worker gone, dropping evicted buckets");
        if let Some(h) = health {
            h.persist_errors.inc();
        }
        return;
    }
    if let Some(h) = health {
        h.persist_queue_length
            .set((persist_tx.max_capacity() - persist_tx.capacity()) as f64);
    }
}

async fn persist_loop(
    store: Arc<Store>,
    mut rx: mpsc::Receiver<Eviction>,
    retries: u32,
    retry_delay: Duration,
    health: Option<Arc<HealthMetrics>>,
) {
    while let Some(eviction) = rx.recv().await {
        if let Some(h) = &health {
            h.persist_queue_length.set(rx.len() as f64);
        }
        persist_with_retry(&store, &eviction, retries, retry_delay, health.as_deref()).await;
    }
    tracing::debug!("persist worker stopped");
}

/// Writes one eviction, retrying up to `retries` extra times.
/// Returns whether the rows reached the store.
pub async fn persist_with_retry(
    store: &Store,
    eviction: &Eviction,
    retries: u32,
    retry_delay: Duration,
    health: Option<&HealthMetrics>,
) -> bool {
    let mut attempt = 0u32;
    loop {
        match store.upsert(eviction.key, &eviction.rows).await {
            Ok(()) => {
                if let Some(h) = health {
                    h.rows_persisted.inc_by(eviction.rows.len() as f64);
                }
                return true;
            }
            Err(e) if attempt < retries => {
                attempt += 1;
                tracing::warn!(
                    key = eviction.key,
                    attempt,
                    error = %e,
                    "persist failed, retrying",
                );
                tokio::time::sleep(retry_delay).await;
            }
            Err(e) => {
                tracing::error!(
                    key = eviction.key,
                    rows = eviction.rows.len(),
                    error = %e,
                    "persist failed, dropping rows",
                );
                if let Some(h) = health {
                    h.persist_errors.inc();
                }
                return false;
            }
        }
    }
}

async fn sweep_loop(
    handle: CollectorHandle,
    idle_after: Duration,
    every: Duration,
    ctx: CancellationToken,
) {
    let mut interval = tokio::time::interval(every);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    interval.tick().await;

    loop {
        tokio::select! {
            _ = ctx.cancelled() => break,
            _ = interval.tick() => {
                if handle.sweep_idle(idle_after).await.is_err() {
                    break;
                }
            }
        }
    }
}
