//! Two-tier time-series counter aggregation.
//!
//! Agents accept `add(key, value)` datagrams from local producers, fold them
//! into per-key aligned buckets, and periodically ship a snapshot upstream.
//! The collector merges snapshots into a sliding window per key, persists
//! buckets that slide out of the window, and answers range queries that
//! stitch persisted history with the live window.

pub mod agent;
pub mod clock;
pub mod codec;
pub mod collector;
pub mod config;
pub mod export;
pub mod migrate;
pub mod store;
pub mod table;
pub mod transport;
