use std::path::Path;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde::Deserialize;

use crate::clock::Alignment;
use crate::codec::{Pipeline, Transform};
use crate::collector::window::WindowLayout;
use crate::transport::ListenConfig;

/// Top-level configuration shared by every `tallyd` role.
#[derive(Debug, Deserialize)]
pub struct Config {
    /// Logging verbosity (debug, info, warn, error). Default: "info".
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Bucket width. Must be a whole number of seconds and identical on
    /// agents and collector. Default: 10s.
    #[serde(default = "default_alignment", with = "humantime_serde")]
    pub alignment: Duration,

    /// Local aggregator configuration.
    #[serde(default)]
    pub agent: AgentConfig,

    /// Window cache, ingress and query configuration.
    #[serde(default)]
    pub collector: CollectorConfig,

    /// Durable store backend.
    #[serde(default)]
    pub store: StoreConfig,

    /// Prometheus health metrics server configuration.
    #[serde(default)]
    pub health: HealthConfig,
}

/// Local aggregator configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct AgentConfig {
    /// Socket producers send datagrams to.
    #[serde(default)]
    pub listen: ListenConfig,

    /// How often the bucket table is swapped and shipped. Default: 10s.
    #[serde(default = "default_flush_interval", with = "humantime_serde")]
    pub flush_interval: Duration,

    /// Snapshots waiting for transmission before new ones are dropped.
    /// Default: 16.
    #[serde(default = "default_agent_queue_size")]
    pub queue_size: usize,

    /// Collector connection.
    #[serde(default)]
    pub uplink: UplinkConfig,
}

/// Agent-to-collector HTTP connection.
#[derive(Debug, Clone, Deserialize)]
pub struct UplinkConfig {
    /// Collector base URL, e.g. "http://collector:8100".
    #[serde(default)]
    pub endpoint: String,

    /// Per-request timeout. Default: 10s.
    #[serde(default = "default_uplink_timeout", with = "humantime_serde")]
    pub timeout: Duration,

    /// Body transforms, applied in order. Must match `collector.codec`.
    #[serde(default)]
    pub codec: Vec<Transform>,
}

/// Collector configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct CollectorConfig {
    /// HTTP listen address for snapshot ingress and chart queries.
    /// Default: ":8100".
    #[serde(default = "default_collector_addr")]
    pub listen_addr: String,

    /// Buckets kept before the current one. Default: 20.
    #[serde(default = "default_left_span")]
    pub left_span: usize,

    /// Buckets kept from the current one onward. Default: 10.
    #[serde(default = "default_right_span")]
    pub right_span: usize,

    /// Snapshots waiting for the merge worker. Default: 128.
    #[serde(default = "default_merge_queue_size")]
    pub queue_size: usize,

    /// Evictions waiting for the persist worker. Default: 1024.
    #[serde(default = "default_persist_queue_size")]
    pub persist_queue_size: usize,

    /// Extra attempts for a failed persist batch. Default: 0.
    #[serde(default)]
    pub persist_retries: u32,

    /// Pause between persist attempts. Default: 1s.
    #[serde(default = "default_persist_retry_delay", with = "humantime_serde")]
    pub persist_retry_delay: Duration,

    /// Persist a window's pending buckets once it has not been merged into
    /// for this long. Disabled when unset.
    #[serde(default, with = "humantime_serde")]
    pub idle_flush_after: Option<Duration>,

    /// How often the idle sweep runs when enabled. Default: 30s.
    #[serde(default = "default_idle_sweep_interval", with = "humantime_serde")]
    pub idle_sweep_interval: Duration,

    /// Body transforms expected on ingress. Must match `agent.uplink.codec`.
    #[serde(default)]
    pub codec: Vec<Transform>,

    /// Largest body any decode stage may produce. Default: 16 MiB.
    #[serde(default = "default_max_decoded_bytes")]
    pub max_decoded_bytes: usize,

    /// Chart query behaviour.
    #[serde(default)]
    pub query: QueryConfig,
}

/// Chart query configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct QueryConfig {
    /// Default `end` is now minus this. Default: 20s.
    #[serde(default = "default_end_offset", with = "humantime_serde")]
    pub end_offset: Duration,

    /// Largest base-alignment span a single query may cover.
    /// Default: 100000.
    #[serde(default = "default_max_points")]
    pub max_points: usize,
}

/// Durable store backend.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum StoreConfig {
    #[default]
    Memory,
    Clickhouse(ClickHouseConfig),
}

/// ClickHouse connection configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct ClickHouseConfig {
    /// ClickHouse native protocol address (host:port).
    #[serde(default)]
    pub endpoint: String,

    /// Target database name. Default: "default".
    #[serde(default = "default_database")]
    pub database: String,

    /// ClickHouse username.
    #[serde(default)]
    pub username: String,

    /// ClickHouse password.
    #[serde(default)]
    pub password: String,

    /// Minimum pooled connections. Default: 2.
    #[serde(default = "default_pool_min")]
    pub pool_min: usize,

    /// Maximum pooled connections. Default: 5.
    #[serde(default = "default_pool_max")]
    pub pool_max: usize,

    /// Schema migration configuration.
    #[serde(default)]
    pub migrations: MigrationsConfig,
}

/// Schema migration behavior configuration.
#[derive(Debug, Default, Clone, Deserialize)]
pub struct MigrationsConfig {
    /// Run migrations on startup. Default: false.
    #[serde(default)]
    pub enabled: bool,
}

/// Prometheus health metrics server configuration.
#[derive(Debug, Deserialize)]
pub struct HealthConfig {
    /// Listen address. Default: ":9090".
    #[serde(default = "default_health_addr")]
    pub addr: String,
}

// --- Default value functions ---

fn default_log_level() -> String {
    "info".to_string()
}

fn default_alignment() -> Duration {
    Duration::from_secs(10)
}

fn default_flush_interval() -> Duration {
    Duration::from_secs(10)
}

fn default_agent_queue_size() -> usize {
    16
}

fn default_uplink_timeout() -> Duration {
    Duration::from_secs(10)
}

fn default_collector_addr() -> String {
    ":8100".to_string()
}

fn default_left_span() -> usize {
    20
}

fn default_right_span() -> usize {
    10
}

fn default_merge_queue_size() -> usize {
    128
}

fn default_persist_queue_size() -> usize {
    1024
}

fn default_persist_retry_delay() -> Duration {
    Duration::from_secs(1)
}

fn default_max_decoded_bytes() -> usize {
    16 << 20
}

fn default_idle_sweep_interval() -> Duration {
    Duration::from_secs(30)
}

fn default_end_offset() -> Duration {
    Duration::from_secs(20)
}

fn default_max_points() -> usize {
    100_000
}

fn default_database() -> String {
    "default".to_string()
}

fn default_pool_min() -> usize {
    2
}

fn default_pool_max() -> usize {
    5
}

fn default_health_addr() -> String {
    ":9090".to_string()
}

// --- Default trait impls ---

impl Default for Config {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            alignment: default_alignment(),
            agent: AgentConfig::default(),
            collector: CollectorConfig::default(),
            store: StoreConfig::default(),
            health: HealthConfig::default(),
        }
    }
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            listen: ListenConfig::default(),
            flush_interval: default_flush_interval(),
            queue_size: default_agent_queue_size(),
            uplink: UplinkConfig::default(),
        }
    }
}

impl Default for UplinkConfig {
    fn default() -> Self {
        Self {
            endpoint: String::new(),
            timeout: default_uplink_timeout(),
            codec: Vec::new(),
        }
    }
}

impl Default for CollectorConfig {
    fn default() -> Self {
        Self {
            listen_addr: default_collector_addr(),
            left_span: default_left_span(),
            right_span: default_right_span(),
            queue_size: default_merge_queue_size(),
            persist_queue_size: default_persist_queue_size(),
            persist_retries: 0,
            persist_retry_delay: default_persist_retry_delay(),
            idle_flush_after: None,
            idle_sweep_interval: default_idle_sweep_interval(),
            codec: Vec::new(),
            max_decoded_bytes: default_max_decoded_bytes(),
            query: QueryConfig::default(),
        }
    }
}

impl Default for QueryConfig {
    fn default() -> Self {
        Self {
            end_offset: default_end_offset(),
            max_points: default_max_points(),
        }
    }
}

impl Default for ClickHouseConfig {
    fn default() -> Self {
        Self {
            endpoint: String::new(),
            database: default_database(),
            username: String::new(),
            password: String::new(),
            pool_min: default_pool_min(),
            pool_max: default_pool_max(),
            migrations: MigrationsConfig::default(),
        }
    }
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            addr: default_health_addr(),
        }
    }
}

// --- Validation and loading ---

impl Config {
    /// Load configuration from a YAML file.
    pub fn load(path: &Path) -> Result<Self> {
        let data = std::fs::read_to_string(path)
            .with_context(|| format!("reading config file {}", path.display()))?;

        let cfg: Config = serde_yaml::from_str(&data)
            .with_context(|| format!("parsing config file {}", path.display()))?;

        cfg.validate()?;

        Ok(cfg)
    }

    /// Validate the configuration for required fields and consistency.
    pub fn validate(&self) -> Result<()> {
        self.alignment().context("invalid alignment")?;

        if self.agent.flush_interval.is_zero() {
            bail!("agent.flush_interval must be positive");
        }
        if self.agent.queue_size == 0 {
            bail!("agent.queue_size must be positive");
        }
        if self.agent.uplink.timeout.is_zero() {
            bail!("agent.uplink.timeout must be positive");
        }

        if self.collector.left_span == 0 {
            bail!("collector.left_span must be positive");
        }
        if self.collector.right_span == 0 {
            bail!("collector.right_span must be positive");
        }
        if self.collector.queue_size == 0 {
            bail!("collector.queue_size must be positive");
        }
        if self.collector.persist_queue_size == 0 {
            bail!("collector.persist_queue_size must be positive");
        }
        if self.collector.max_decoded_bytes == 0 {
            bail!("collector.max_decoded_bytes must be positive");
        }
        if self.collector.query.max_points == 0 {
            bail!("collector.query.max_points must be positive");
        }
        if let Some(idle) = self.collector.idle_flush_after {
            if idle.is_zero() {
                bail!("collector.idle_flush_after must be positive when set");
            }
            if idle.subsec_nanos() != 0 {
                bail!("collector.idle_flush_after must be a whole number of seconds");
            }
            if self.collector.idle_sweep_interval.is_zero() {
                bail!("collector.idle_sweep_interval must be positive");
            }
        }
        if self.collector.query.end_offset.subsec_nanos() != 0 {
            bail!("collector.query.end_offset must be a whole number of seconds");
        }

        if let StoreConfig::Clickhouse(ch) = &self.store {
            if ch.endpoint.is_empty() {
                bail!("store.endpoint is required for the clickhouse store");
            }
            if ch.pool_min == 0 || ch.pool_min > ch.pool_max {
                bail!(
                    "store pool bounds invalid: pool_min={} pool_max={}",
                    ch.pool_min,
                    ch.pool_max
                );
            }
        }

        Ok(())
    }

    /// Checks the settings only the agent role needs.
    pub fn validate_agent(&self) -> Result<()> {
        if self.agent.uplink.endpoint.is_empty() {
            bail!("agent.uplink.endpoint is required");
        }
        if !self.agent.uplink.endpoint.starts_with("http://")
            && !self.agent.uplink.endpoint.starts_with("https://")
        {
            bail!(
                "agent.uplink.endpoint must be an http(s) URL: {}",
                self.agent.uplink.endpoint
            );
        }
        Ok(())
    }

    pub fn alignment(&self) -> Result<Alignment> {
        Alignment::from_duration(self.alignment)
    }

    /// Window shape derived from the alignment and collector spans.
    pub fn window_layout(&self) -> Result<WindowLayout> {
        Ok(WindowLayout {
            alignment: self.alignment()?,
            left_span: self.collector.left_span,
            right_span: self.collector.right_span,
        })
    }
}

impl UplinkConfig {
    pub fn pipeline(&self) -> Pipeline {
        Pipeline::new(self.codec.clone())
    }
}

impl CollectorConfig {
    /// Ingress pipeline, capped at `max_decoded_bytes`.
    pub fn pipeline(&self) -> Pipeline {
        Pipeline::new(self.codec.clone()).with_max_decoded(self.max_decoded_bytes)
    }
}
