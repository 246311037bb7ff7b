use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde::Deserialize;

use crate::sink::aggregated::rdb::dialect::DatabaseUrl;
use crate::sink::aggregated::rdb::layout::RowLayout;

/// Smallest aggregation interval in seconds; intervals are whole minutes.
pub const MIN_AGGREGATE_INTERVAL_SECS: i64 = 60;

/// Top-level configuration for the metricsense agent.
#[derive(Debug, Deserialize)]
pub struct Config {
    /// Logging verbosity (debug, info, warn, error). Default: "info".
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Record input configuration.
    #[serde(default)]
    pub input: InputConfig,

    /// Record normalization configuration.
    #[serde(default)]
    pub normalize: NormalizeConfig,

    /// Aggregation window and flush configuration.
    #[serde(default)]
    pub aggregation: AggregationConfig,

    /// Storage backend. Required.
    pub backend: BackendConfig,

    /// Prometheus health metrics server configuration.
    #[serde(default)]
    pub health: HealthConfig,
}

/// Record input configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct InputConfig {
    /// Newline-delimited JSON file to read. Reads stdin when absent.
    #[serde(default)]
    pub path: Option<PathBuf>,

    /// Capacity of the channel between the reader and the sink. Default: 65536.
    #[serde(default = "default_channel_capacity")]
    pub channel_capacity: usize,
}

/// Record normalization configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct NormalizeConfig {
    /// Record field holding the metric value. Default: "value".
    #[serde(default = "default_value_key")]
    pub value_key: String,

    /// Record field holding the update mode. Default: "update_mode".
    #[serde(default = "default_update_mode_key")]
    pub update_mode_key: String,

    /// Which record fields become segments.
    #[serde(default)]
    pub segmentation: SegmentationConfig,

    /// Prefix stripped from tags (only when followed by "." or end of tag).
    #[serde(default)]
    pub remove_tag_prefix: Option<String>,

    /// Prefix prepended to tags as "<prefix>.".
    #[serde(default)]
    pub add_tag_prefix: Option<String>,
}

/// Segment extraction configuration.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct SegmentationConfig {
    /// Extraction mode.
    #[serde(default)]
    pub mode: SegmentationMode,

    /// Fields to extract in `include` mode, in order.
    #[serde(default)]
    pub keys: Vec<String>,

    /// Fields never used as segments, applied after extraction.
    #[serde(default)]
    pub exclude: Vec<String>,
}

/// Segment extraction modes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SegmentationMode {
    /// No segments; every record aggregates into its simple counter.
    #[default]
    None,
    /// Only the listed keys.
    Include,
    /// Every remaining record field.
    All,
}

/// Aggregation window and flush configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct AggregationConfig {
    /// Time bucket width. Rounded down to whole minutes, minimum 60s. Default: 60s.
    #[serde(default = "default_aggregate_interval", with = "humantime_serde")]
    pub aggregate_interval: Duration,

    /// How often buffered events are aggregated and written. Default: 60s.
    #[serde(default = "default_flush_interval", with = "humantime_serde")]
    pub flush_interval: Duration,

    /// Events kept for redelivery after failed writes before new events are
    /// dropped. Default: 1000000.
    #[serde(default = "default_max_buffered_events")]
    pub max_buffered_events: usize,

    /// Failed flushes in a row after which the retained events are
    /// discarded. Default: 5.
    #[serde(default = "default_max_redelivery_attempts")]
    pub max_redelivery_attempts: u32,
}

/// Storage backend selection.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BackendConfig {
    /// Relational time-series row store.
    Rdb(RdbConfig),
    /// Push-gauge HTTP API (Datadog series endpoint).
    Datadog(DatadogConfig),
    /// Key/value metrics HTTP API (Librato metrics endpoint).
    Librato(LibratoConfig),
    /// Print aggregate rows to stdout.
    Stdout,
}

impl BackendConfig {
    /// Returns the backend name for logging.
    pub const fn name(&self) -> &'static str {
        match self {
            Self::Rdb(_) => "rdb",
            Self::Datadog(_) => "datadog",
            Self::Librato(_) => "librato",
            Self::Stdout => "stdout",
        }
    }
}

/// Relational row store configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct RdbConfig {
    /// Database URL: "sqlite://<path>" or "postgres://...".
    pub rdb_url: String,

    /// Prefix of the three table names. Default: "metricsense".
    #[serde(default = "default_rdb_table_prefix")]
    pub rdb_table_prefix: String,

    /// Row addressing scheme. Default: daily.
    #[serde(default)]
    pub row_layout: RowLayout,
}

/// Datadog series API configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct DatadogConfig {
    /// API key. Required.
    #[serde(default)]
    pub api_key: String,

    /// Application key.
    #[serde(default)]
    pub app_key: String,

    /// Host name attached to every series.
    #[serde(default)]
    pub host: Option<String>,

    /// Tags attached to every series.
    #[serde(default)]
    pub tags: Vec<String>,

    /// Rows per request. Default: 200.
    #[serde(default = "default_datadog_batch_size")]
    pub batch_size: usize,

    /// API base URL. Default: "https://api.datadoghq.com".
    #[serde(default = "default_datadog_endpoint")]
    pub endpoint: String,

    /// Request body compression (none, gzip, zlib). Default: none.
    #[serde(default = "default_compression")]
    pub compression: String,

    /// Request timeout. Default: 30s.
    #[serde(default = "default_http_timeout", with = "humantime_serde")]
    pub timeout: Duration,
}

/// Librato metrics API configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct LibratoConfig {
    /// Account user (email). Required.
    #[serde(default)]
    pub user: String,

    /// API token. Required.
    #[serde(default)]
    pub token: String,

    /// API base URL. Default: "https://metrics-api.librato.com".
    #[serde(default = "default_librato_endpoint")]
    pub endpoint: String,

    /// Request timeout. Default: 30s.
    #[serde(default = "default_http_timeout", with = "humantime_serde")]
    pub timeout: Duration,
}

/// Prometheus health metrics server configuration.
#[derive(Debug, Deserialize)]
pub struct HealthConfig {
    /// Listen address. Empty disables the server. Default: ":9090".
    #[serde(default = "default_health_addr")]
    pub addr: String,
}

// --- Default value functions ---

fn default_log_level() -> String {
    "info".to_string()
}

fn default_channel_capacity() -> usize {
    65_536
}

fn default_value_key() -> String {
    "value".to_string()
}

fn default_update_mode_key() -> String {
    "update_mode".to_string()
}

fn default_aggregate_interval() -> Duration {
    Duration::from_secs(60)
}

fn default_flush_interval() -> Duration {
    Duration::from_secs(60)
}

fn default_max_buffered_events() -> usize {
    1_000_000
}

fn default_max_redelivery_attempts() -> u32 {
    5
}

fn default_rdb_table_prefix() -> String {
    "metricsense".to_string()
}

fn default_datadog_batch_size() -> usize {
    200
}

fn default_datadog_endpoint() -> String {
    "https://api.datadoghq.com".to_string()
}

fn default_librato_endpoint() -> String {
    "https://metrics-api.librato.com".to_string()
}

fn default_compression() -> String {
    "none".to_string()
}

fn default_http_timeout() -> Duration {
    Duration::from_secs(30)
}

fn default_health_addr() -> String {
    ":9090".to_string()
}

// --- Default trait impls ---

impl Default for Config {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            input: InputConfig::default(),
            normalize: NormalizeConfig::default(),
            aggregation: AggregationConfig::default(),
            backend: BackendConfig::Stdout,
            health: HealthConfig::default(),
        }
    }
}

impl Default for InputConfig {
    fn default() -> Self {
        Self {
            path: None,
            channel_capacity: default_channel_capacity(),
        }
    }
}

impl Default for NormalizeConfig {
    fn default() -> Self {
        Self {
            value_key: default_value_key(),
            update_mode_key: default_update_mode_key(),
            segmentation: SegmentationConfig::default(),
            remove_tag_prefix: None,
            add_tag_prefix: None,
        }
    }
}

impl Default for AggregationConfig {
    fn default() -> Self {
        Self {
            aggregate_interval: default_aggregate_interval(),
            flush_interval: default_flush_interval(),
            max_buffered_events: default_max_buffered_events(),
            max_redelivery_attempts: default_max_redelivery_attempts(),
        }
    }
}

impl Default for DatadogConfig {
    fn default() -> Self {
        Self {
            api_key: String::new(),
            app_key: String::new(),
            host: None,
            tags: Vec::new(),
            batch_size: default_datadog_batch_size(),
            endpoint: default_datadog_endpoint(),
            compression: default_compression(),
            timeout: default_http_timeout(),
        }
    }
}

impl Default for LibratoConfig {
    fn default() -> Self {
        Self {
            user: String::new(),
            token: String::new(),
            endpoint: default_librato_endpoint(),
            timeout: default_http_timeout(),
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
    /// Load configuration from a YAML file and validate it.
    pub fn load(path: &Path) -> Result<Self> {
        let data = std::fs::read_to_string(path)
            .with_context(|| format!("reading config file {}", path.display()))?;

        let cfg: Config = serde_yaml::from_str(&data)
            .with_context(|| format!("parsing config file {}", path.display()))?;

        cfg.validate()?;

        Ok(cfg)
    }

    /// Check the configuration for values that cannot work at runtime.
    pub fn validate(&self) -> Result<()> {
        if self.input.channel_capacity == 0 {
            bail!("input.channel_capacity must be positive");
        }

        if self.normalize.value_key.is_empty() {
            bail!("normalize.value_key must not be empty");
        }

        if self.normalize.update_mode_key.is_empty() {
            bail!("normalize.update_mode_key must not be empty");
        }

        let seg = &self.normalize.segmentation;
        if seg.mode == SegmentationMode::Include && seg.keys.is_empty() {
            bail!("normalize.segmentation.keys is required in include mode");
        }

        if self.aggregation.aggregate_interval.is_zero() {
            bail!("aggregation.aggregate_interval must be positive");
        }

        if self.aggregation.flush_interval.is_zero() {
            bail!("aggregation.flush_interval must be positive");
        }

        if self.aggregation.max_buffered_events == 0 {
            bail!("aggregation.max_buffered_events must be positive");
        }

        if self.aggregation.max_redelivery_attempts == 0 {
            bail!("aggregation.max_redelivery_attempts must be positive");
        }

        match &self.backend {
            BackendConfig::Rdb(rdb) => {
                DatabaseUrl::parse(&rdb.rdb_url).context("backend.rdb_url")?;

                if rdb.rdb_table_prefix.is_empty() {
                    bail!("backend.rdb_table_prefix must not be empty");
                }

                if !rdb
                    .rdb_table_prefix
                    .chars()
                    .all(|c| c.is_ascii_alphanumeric() || c == '_')
                {
                    bail!(
                        "backend.rdb_table_prefix may only contain [A-Za-z0-9_]: {}",
                        rdb.rdb_table_prefix
                    );
                }
            }
            BackendConfig::Datadog(dd) => {
                if dd.api_key.is_empty() {
                    bail!("backend.api_key is required for the datadog backend");
                }

                if dd.batch_size == 0 {
                    bail!("backend.batch_size must be positive");
                }

                if !matches!(dd.compression.as_str(), "none" | "gzip" | "zlib") {
                    bail!("unsupported backend.compression: {}", dd.compression);
                }
            }
            BackendConfig::Librato(librato) => {
                if librato.user.is_empty() || librato.token.is_empty() {
                    bail!("backend.user and backend.token are required for the librato backend");
                }
            }
            BackendConfig::Stdout => {}
        }

        Ok(())
    }
}

impl AggregationConfig {
    /// Bucket width in seconds: whole minutes, at least one.
    pub fn aggregate_interval_secs(&self) -> i64 {
        let secs = i64::try_from(self.aggregate_interval.as_secs()).unwrap_or(i64::MAX);
        let rounded = secs - secs % MIN_AGGREGATE_INTERVAL_SECS;
        rounded.max(MIN_AGGREGATE_INTERVAL_SECS)
    }

    /// Whole minutes in a bucket `interval_secs` wide, at least one. Sums
    /// are divided by it to report per-minute values.
    pub fn minutes_in(interval_secs: i64) -> i64 {
        (interval_secs / MIN_AGGREGATE_INTERVAL_SECS).max(1)
    }
}
