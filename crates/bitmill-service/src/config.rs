use std::collections::BTreeMap;
use std::env;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use sentry::types::Dsn;
use serde::{Deserialize, Deserializer, de};
use tracing::level_filters::LevelFilter;

use crate::executor::{PanicStrategy, RejectionPolicy};

/// Controls the log format
#[derive(Clone, Copy, Debug, Eq, PartialEq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Auto detect (pretty for tty, simplified for other)
    Auto,
    /// With colors
    Pretty,
    /// Simplified log output
    Simplified,
    /// Dump out JSON lines
    Json,
}

/// Controls the logging system.
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct Logging {
    /// The log level for bitmill.
    #[serde(deserialize_with = "deserialize_level_filter")]
    pub level: LevelFilter,
    /// Controls the log format.
    pub format: LogFormat,
    /// When set to true, backtraces are forced on.
    pub enable_backtraces: bool,
}

impl Default for Logging {
    fn default() -> Self {
        Logging {
            level: LevelFilter::INFO,
            format: LogFormat::Auto,
            enable_backtraces: true,
        }
    }
}

/// Control the metrics.
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct Metrics {
    /// host/port of statsd instance
    pub statsd: Option<String>,
    /// The prefix that should be added to all metrics.
    pub prefix: String,
    /// A tag name to report the hostname to, for each metric. Defaults to not sending such a tag.
    pub hostname_tag: Option<String>,
    /// A map containing custom tags and their values.
    ///
    /// These tags will be appended to every metric.
    pub custom_tags: BTreeMap<String, String>,
}

impl Default for Metrics {
    fn default() -> Self {
        Metrics {
            statsd: env::var("STATSD_SERVER").ok(),
            prefix: "bitmill".into(),
            hostname_tag: None,
            custom_tags: BTreeMap::new(),
        }
    }
}

/// Sizing of the in-memory LRU of released resources.
#[derive(Debug, Clone, Copy, Deserialize, PartialEq)]
#[serde(default)]
pub struct MemoryCacheConfig {
    /// Capacity (in bytes) of the memory cache.
    ///
    /// Defaults to `64 MiB`.
    pub max_size: u64,

    /// A multiplier applied to `max_size`, can be adjusted at runtime.
    pub size_multiplier: f32,
}

impl Default for MemoryCacheConfig {
    fn default() -> Self {
        Self {
            max_size: 64 * 1024 * 1024,
            size_multiplier: 1.0,
        }
    }
}

/// Sizing of the journaled disk cache.
#[derive(Debug, Clone, Copy, Deserialize, Eq, PartialEq)]
#[serde(default)]
pub struct DiskCacheConfig {
    /// Capacity (in bytes) of the disk cache.
    ///
    /// Defaults to `250 MiB`.
    pub max_size: u64,

    /// The version recorded in the journal header.
    ///
    /// Bumping this invalidates all existing entries.
    pub app_version: u32,
}

impl Default for DiskCacheConfig {
    fn default() -> Self {
        Self {
            max_size: 250 * 1024 * 1024,
            app_version: 1,
        }
    }
}

#[derive(Debug, Clone, Copy, Deserialize, Eq, PartialEq)]
#[serde(default)]
pub struct BitmapPoolConfig {
    /// Capacity (in bytes) of reusable bitmap memory.
    ///
    /// Defaults to `32 MiB`. A value of `0` disables pooling.
    pub max_size: u64,
}

impl Default for BitmapPoolConfig {
    fn default() -> Self {
        Self {
            max_size: 32 * 1024 * 1024,
        }
    }
}

#[derive(Clone, Debug, Deserialize, Default)]
#[serde(default)]
pub struct CacheConfigs {
    /// Configuration of the memory cache.
    pub memory: MemoryCacheConfig,
    /// Configuration of the disk cache.
    pub disk: DiskCacheConfig,
    /// Configuration of the bitmap pool.
    pub bitmap_pool: BitmapPoolConfig,
}

/// Configuration of a single prioritized thread pool.
#[derive(Debug, Clone, Copy, Deserialize, Eq, PartialEq)]
#[serde(default)]
pub struct ExecutorConfig {
    /// Number of worker threads.
    pub threads: usize,
    /// Maximum number of queued, not yet running tasks.
    pub queue_capacity: usize,
    /// What to do with tasks that do not fit into the queue.
    pub rejection: RejectionPolicy,
    /// What to do with tasks that panic.
    pub panic: PanicStrategy,
    /// How long a `shutdown` waits for workers to drain the queue.
    #[serde(with = "humantime_serde")]
    pub shutdown_timeout: Duration,
}

impl ExecutorConfig {
    fn with_threads(threads: usize) -> Self {
        Self {
            threads,
            ..Default::default()
        }
    }
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            threads: 1,
            queue_capacity: 1024,
            rejection: RejectionPolicy::CallerRuns,
            panic: PanicStrategy::Log,
            shutdown_timeout: Duration::from_secs(10),
        }
    }
}

#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct ExecutorConfigs {
    /// The pool reading from and writing to the disk cache.
    pub disk_cache: ExecutorConfig,
    /// The pool fetching and decoding source data.
    pub source: ExecutorConfig,
    /// The pool decoding animation frames.
    pub animation: ExecutorConfig,
}

impl Default for ExecutorConfigs {
    fn default() -> Self {
        let cpus = std::thread::available_parallelism().map_or(1, |n| n.get());
        Self {
            disk_cache: ExecutorConfig::with_threads(1),
            source: ExecutorConfig::with_threads(cpus.min(4)),
            animation: ExecutorConfig::with_threads(if cpus >= 4 { 2 } else { 1 }),
        }
    }
}

/// The bitmill configuration, usually read from a YAML file.
#[derive(Clone, Debug, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    /// Which directory to use for the disk cache. Default is not to cache on disk.
    pub cache_dir: Option<PathBuf>,

    /// Configuration for internal logging.
    pub logging: Logging,

    /// Configuration for reporting metrics to a statsd instance.
    pub metrics: Metrics,

    /// DSN to report internal errors to
    pub sentry_dsn: Option<Dsn>,

    /// Sizing of all the caches.
    pub caches: CacheConfigs,

    /// Sizing of the thread pools.
    pub executors: ExecutorConfigs,
}

impl Config {
    pub fn get(path: Option<&Path>) -> Result<Self> {
        match path {
            Some(path) => Self::from_reader(
                fs::File::open(path).context("failed to open configuration file")?,
            ),
            None => Ok(Config::default()),
        }
    }

    pub fn from_reader(mut reader: impl std::io::Read) -> Result<Self> {
        let mut config = String::new();
        reader
            .read_to_string(&mut config)
            .context("failed reading config file")?;
        // check for empty files explicitly
        if config.trim().is_empty() {
            anyhow::bail!("config file empty");
        }
        serde_yaml::from_str(&config).context("failed to parse config YAML")
    }
}

#[derive(Debug)]
struct LevelFilterVisitor;

impl de::Visitor<'_> for LevelFilterVisitor {
    type Value = LevelFilter;

    fn expecting(&self, formatter: &mut fmt::Formatter) -> std::fmt::Result {
        write!(
            formatter,
            r#"one of the strings "off", "error", "warn", "info", "debug", or "trace""#
        )
    }

    fn visit_str<E>(self, v: &str) -> Result<Self::Value, E>
    where
        E: de::Error,
    {
        match v {
            "off" => Ok(LevelFilter::OFF),
            "error" => Ok(LevelFilter::ERROR),
            "warn" => Ok(LevelFilter::WARN),
            "info" => Ok(LevelFilter::INFO),
            "debug" => Ok(LevelFilter::DEBUG),
            "trace" => Ok(LevelFilter::TRACE),
            _ => Err(de::Error::unknown_variant(
                v,
                &["off", "error", "warn", "info", "debug", "trace"],
            )),
        }
    }
}

fn deserialize_level_filter<'de, D: Deserializer<'de>>(
    deserializer: D,
) -> Result<LevelFilter, D::Error> {
    deserializer.deserialize_str(LevelFilterVisitor)
}
