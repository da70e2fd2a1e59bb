pub mod uplink;

use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Result;
use parking_lot::Mutex;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::clock::{Alignment, Clock};
use crate::config::AgentConfig;
use crate::export::health::HealthMetrics;
use crate::table::{BucketTable, CounterKey, Record, Snapshot};
use crate::transport::{self, Command, ListenConfig, Listener, RECV_BUFFER_LEN};

pub use uplink::{HttpUplink, Uplink};

/// Local aggregator: folds submissions into aligned buckets and ships the
/// table to the collector every flush interval.
pub struct Agent {
    listen: ListenConfig,
    flush_interval: Duration,
    queue_size: usize,
    alignment: Alignment,
    clock: Clock,
    ticks_per_key: usize,
    table: Mutex<BucketTable>,
    health: Option<Arc<HealthMetrics>>,
}

impl Agent {
    pub fn new(
        cfg: &AgentConfig,
        alignment: Alignment,
        clock: Clock,
        health: Option<Arc<HealthMetrics>>,
    ) -> Self {
        // A flush interval spans this many buckets; leave room for one more
        // in case the swap lands late.
        let ticks_per_key = (cfg.flush_interval.as_secs() as i64 / alignment.secs())
            .max(1) as usize
            * 2;

        Self {
            listen: cfg.listen.clone(),
            flush_interval: cfg.flush_interval,
            queue_size: cfg.queue_size.max(1),
            alignment,
            clock,
            ticks_per_key,
            table: Mutex::new(BucketTable::with_ticks_per_key(ticks_per_key)),
            health,
        }
    }

    /// Adds one value to the key's bucket for the current aligned second.
    pub fn ingest(&self, key: CounterKey, value: i64) -> Record {
        let now = self.alignment.floor(self.clock.now());

        let (record, keys) = {
            let mut table = self.table.lock();
            let record = table.record(key, now, value);
            (record, table.len())
        };

        if record == Record::Stale {
            debug!(key, now, "dropping event older than the key's last bucket");
        }

        if let Some(h) = &self.health {
            h.events_received.inc();
            h.table_keys.set(keys as f64);
            if record == Record::Stale {
                h.events_dropped.with_label_values(&["clock_skew"]).inc();
            }
        }

        record
    }

    /// Decodes one datagram and ingests it. Malformed input is dropped.
    pub fn handle_datagram(&self, buf: &[u8]) {
        match transport::decode(buf) {
            Ok(Command::Add { key, value }) => {
                self.ingest(key, value);
            }
            Err(e) => {
                debug!(error = %e, len = buf.len(), "dropping malformed datagram");
                if let Some(h) = &self.health {
                    h.malformed_datagrams.with_label_values(&[e.kind()]).inc();
                }
            }
        }
    }

    /// Swaps in a fresh table and returns the old one, unless it was empty.
    pub fn flush(&self) -> Option<Snapshot> {
        let fresh = BucketTable::with_ticks_per_key(self.ticks_per_key);
        let detached = std::mem::replace(&mut *self.table.lock(), fresh);

        if let Some(h) = &self.health {
            h.table_keys.set(0.0);
        }

        if detached.is_empty() {
            return None;
        }

        if let Some(h) = &self.health {
            h.snapshots_flushed.inc();
        }

        let snapshot = detached.into_snapshot();
        debug!(
            keys = snapshot.table.len(),
            ticks = snapshot.tick_count(),
            "flushed bucket table",
        );
        Some(snapshot)
    }

    /// Number of keys waiting for the next flush.
    pub fn pending_keys(&self) -> usize {
        self.table.lock().len()
    }

    /// Receives submissions until `ctx` is cancelled, flushing on every
    /// interval. A final flush is transmitted before returning.
    pub async fn run(self: Arc<Self>, uplink: Uplink, ctx: CancellationToken) -> Result<()> {
        let listener = Listener::bind(&self.listen).await?;

        info!(
            listen = %listener.local_addr(),
            uplink = uplink.name(),
            flush_interval = ?self.flush_interval,
            alignment = self.alignment.secs(),
            "agent listening",
        );

        let (tx, rx) = mpsc::channel(self.queue_size);
        let transmitter = spawn_transmitter(rx, uplink, self.health.clone());

        let mut ticker = tokio::time::interval(self.flush_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        // The first tick fires immediately.
        ticker.tick().await;

        let mut buf = [0u8; RECV_BUFFER_LEN];

        loop {
            tokio::select! {
                _ = ctx.cancelled() => break,
                _ = ticker.tick() => self.enqueue_flush(&tx),
                res = listener.recv(&mut buf) => match res {
                    Ok(n) => self.handle_datagram(&buf[..n]),
                    Err(e) => warn!(error = %e, "receiving datagram failed"),
                },
            }
        }

        self.enqueue_flush(&tx);
        drop(tx);

        if let Err(e) = transmitter.await {
            error!(error = %e, "transmit task failed");
        }

        info!("agent stopped");

        Ok(())
    }

    fn enqueue_flush(&self, tx: &mpsc::Sender<Snapshot>) {
        let Some(snapshot) = self.flush() else {
            return;
        };

        match tx.try_send(snapshot) {
            Ok(()) => {}
            Err(TrySendError::Full(snapshot)) => {
                let events: u64 = snapshot.table.values().flatten().map(|t| t.count).sum();
                warn!(
                    keys = snapshot.table.len(),
                    events, "transmit queue full, dropping snapshot",
                );
                if let Some(h) = &self.health {
                    h.events_dropped
                        .with_label_values(&["queue_full"])
                        .inc_by(events as f64);
                }
            }
            Err(TrySendError::Closed(_)) => {
                error!("transmit queue closed, dropping snapshot");
            }
        }
    }
}

fn spawn_transmitter(
    mut rx: mpsc::Receiver<Snapshot>,
    uplink: Uplink,
    health: Option<Arc<HealthMetrics>>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(snapshot) = rx.recv().await {
            let keys = snapshot.table.len();
            let started = Instant::now();

            match uplink.send(snapshot).await {
                Ok(()) => {
                    if let Some(h) = &health {
                        h.snapshots_sent.inc();
                    }
                }
                Err(e) => {
                    error!(error = ?e, keys, "snapshot transmission failed, dropping");
                    if let Some(h) = &health {
                        h.transmit_errors.inc();
                    }
                }
            }

            if let Some(h) = &health {
                h.transmit_duration.observe(started.elapsed().as_secs_f64());
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::table::Tick;

    const T: i64 = 1_700_000_000;

    fn agent(clock: Clock) -> Agent {
        let cfg = AgentConfig {
            flush_interval: Duration::from_secs(10),
            ..AgentConfig::default()
        };
        let alignment = Alignment::from_secs(10).expect("alignment");
        let health = Arc::new(HealthMetrics::new(":0").expect("health"));
        Agent::new(&cfg, alignment, clock, Some(health))
    }

    #[test]
    fn test_ingest_merges_within_bucket() {
        let clock = Clock::manual(T + 3);
        let agent = agent(clock.clone());

        assert_eq!(agent.ingest(100, 5), Record::Appended);
        clock.advance(Duration::from_secs(4));
        assert_eq!(agent.ingest(100, 5), Record::Merged);

        let snapshot = agent.flush().expect("snapshot");
        assert_eq!(
            snapshot.table.get(&100).cloned(),
            Some(vec![Tick {
                time: T,
                sum: 10,
                count: 2,
            }])
        );
    }

    #[test]
    fn test_ingest_appends_next_bucket() {
        let clock = Clock::manual(T);
        let agent = agent(clock.clone());

        agent.ingest(1, 1);
        clock.advance(Duration::from_secs(10));
        assert_eq!(agent.ingest(1, 2), Record::Appended);

        let snapshot = agent.flush().expect("snapshot");
        let times: Vec<i64> = snapshot.table[&1].iter().map(|t| t.time).collect();
        assert_eq!(times, vec![T, T + 10]);
    }

    #[test]
    fn test_ingest_drops_when_clock_moves_back() {
        let clock = Clock::manual(T + 10);
        let agent = agent(clock.clone());

        agent.ingest(1, 1);
        clock.set(T);
        assert_eq!(agent.ingest(1, 1), Record::Stale);

        let h = agent.health.as_ref().expect("health");
        assert_eq!(h.events_received.get(), 2.0);
        assert_eq!(
            h.events_dropped.with_label_values(&["clock_skew"]).get(),
            1.0
        );

        let snapshot = agent.flush().expect("snapshot");
        assert_eq!(snapshot.table[&1].len(), 1);
        assert_eq!(snapshot.table[&1][0].count, 1);
    }

    #[test]
    fn test_full_transmit_queue_counts_dropped_events() {
        let agent = agent(Clock::manual(T));
        let (tx, mut rx) = mpsc::channel(1);

        agent.ingest(1, 1);
        agent.enqueue_flush(&tx);
        agent.ingest(1, 1);
        agent.ingest(2, 1);
        agent.enqueue_flush(&tx);

        let h = agent.health.as_ref().expect("health");
        assert_eq!(
            h.events_dropped.with_label_values(&["queue_full"]).get(),
            2.0
        );
        assert_eq!(rx.try_recv().expect("queued").table.len(), 1);
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_flush_empty_table_yields_nothing() {
        let agent = agent(Clock::manual(T));
        assert!(agent.flush().is_none());

        agent.ingest(3, 1);
        assert_eq!(agent.pending_keys(), 1);
        assert!(agent.flush().is_some());
        assert_eq!(agent.pending_keys(), 0);
        assert!(agent.flush().is_none());
    }

    #[test]
    fn test_handle_datagram_ignores_malformed() {
        let agent = agent(Clock::manual(T));

        agent.handle_datagram(&[0u8; 8]);
        agent.handle_datagram(&[0u8; 20]);
        let mut unknown = transport::encode(&Command::Add { key: 1, value: 1 });
        unknown[3] = 9;
        agent.handle_datagram(&unknown);
        assert_eq!(agent.pending_keys(), 0);

        let h = agent.health.as_ref().expect("health");
        assert_eq!(
            h.malformed_datagrams.with_label_values(&["truncated"]).get(),
            1.0
        );

        agent.handle_datagram(&transport::encode(&Command::Add { key: 42, value: -3 }));
        let snapshot = agent.flush().expect("snapshot");
        assert_eq!(snapshot.table[&42][0].sum, -3);
    }

    #[test]
    fn test_ticks_per_key_capacity() {
        let cfg = AgentConfig {
            flush_interval: Duration::from_secs(60),
            ..AgentConfig::default()
        };
        let alignment = Alignment::from_secs(10).expect("alignment");
        let agent = Agent::new(&cfg, alignment, Clock::manual(T), None);
        assert_eq!(agent.ticks_per_key, 12);
    }
}
