//! Shard configuration.
//!
//! Values come from (highest priority first): builder calls,
//! `SHARDWIRE_*` environment variables (via [`ShardConfig::from_env`]),
//! then the constants in [`defaults`].
//!
//! | Variable | Default |
//! |----------|---------|
//! | `SHARDWIRE_HEARTBEAT_MS` | 1000 |
//! | `SHARDWIRE_MAX_DRAIN_PASSES` | 8 |
//! | `SHARDWIRE_SHUTDOWN_TIMEOUT_MS` | 5000 |
//! | `SHARDWIRE_WRITE_POOL_CAPACITY` | 1024 |
//! | `SHARDWIRE_DISPATCH` | `inline` (`background`, `logged`) |
//! | `SHARDWIRE_BACKGROUND_THREADS` | 2 |
//! | `SHARDWIRE_DRIVER` | `platform` (`portable`) |
//!
//! Pool geometry is read by [`PoolConfig::from_env`].

pub mod defaults;

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use shardwire_buffer::PoolConfig;
use shardwire_core::env::{env_get, env_get_ms};
use shardwire_core::{ConfigError, ConfigResult};

/// How a shard runs user callbacks handed to
/// [`ShardContext::dispatch`](crate::ShardContext::dispatch).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DispatchMode {
    /// On the shard thread, immediately.
    #[default]
    Inline,
    /// On a small worker pool.
    Background,
    /// On the worker pool, with panics caught and logged.
    BackgroundLogged,
}

impl FromStr for DispatchMode {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "inline" => Ok(DispatchMode::Inline),
            "background" => Ok(DispatchMode::Background),
            "logged" | "background-logged" => Ok(DispatchMode::BackgroundLogged),
            other => Err(ConfigError::UnknownVariant {
                kind: "dispatch mode",
                value: other.to_string(),
            }),
        }
    }
}

impl fmt::Display for DispatchMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            DispatchMode::Inline => "inline",
            DispatchMode::Background => "background",
            DispatchMode::BackgroundLogged => "logged",
        })
    }
}

/// Which event loop a shard runs on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DriverKind {
    /// epoll + eventfd on Linux, portable elsewhere.
    #[default]
    Platform,
    /// Mutex/condvar loop, any OS.
    Portable,
}

impl FromStr for DriverKind {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "platform" | "epoll" => Ok(DriverKind::Platform),
            "portable" | "condvar" => Ok(DriverKind::Portable),
            other => Err(ConfigError::UnknownVariant {
                kind: "driver",
                value: other.to_string(),
            }),
        }
    }
}

impl fmt::Display for DriverKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            DriverKind::Platform => "platform",
            DriverKind::Portable => "portable",
        })
    }
}

#[derive(Debug, Clone)]
pub struct ShardConfig {
    pub heartbeat: Duration,
    pub max_drain_passes: usize,
    pub shutdown_timeout: Duration,
    pub write_pool_capacity: usize,
    pub dispatch: DispatchMode,
    pub background_threads: usize,
    pub driver: DriverKind,
    pub pool: PoolConfig,
}

impl Default for ShardConfig {
    fn default() -> Self {
        Self {
            heartbeat: defaults::HEARTBEAT,
            max_drain_passes: defaults::MAX_DRAIN_PASSES,
            shutdown_timeout: defaults::SHUTDOWN_TIMEOUT,
            write_pool_capacity: defaults::WRITE_POOL_CAPACITY,
            dispatch: DispatchMode::default(),
            background_threads: defaults::BACKGROUND_THREADS,
            driver: DriverKind::default(),
            pool: PoolConfig::default(),
        }
    }
}

impl ShardConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Defaults overridden by `SHARDWIRE_*` environment variables.
    pub fn from_env() -> Self {
        Self {
            heartbeat: env_get_ms("SHARDWIRE_HEARTBEAT_MS", defaults::HEARTBEAT),
            max_drain_passes: env_get("SHARDWIRE_MAX_DRAIN_PASSES", defaults::MAX_DRAIN_PASSES),
            shutdown_timeout: env_get_ms("SHARDWIRE_SHUTDOWN_TIMEOUT_MS", defaults::SHUTDOWN_TIMEOUT),
            write_pool_capacity: env_get("SHARDWIRE_WRITE_POOL_CAPACITY", defaults::WRITE_POOL_CAPACITY),
            dispatch: env_get("SHARDWIRE_DISPATCH", DispatchMode::default()),
            background_threads: env_get("SHARDWIRE_BACKGROUND_THREADS", defaults::BACKGROUND_THREADS),
            driver: env_get("SHARDWIRE_DRIVER", DriverKind::default()),
            pool: PoolConfig::from_env(),
        }
    }

    // ── Builder methods ──

    pub fn heartbeat(mut self, interval: Duration) -> Self {
        self.heartbeat = interval;
        self
    }

    pub fn max_drain_passes(mut self, passes: usize) -> Self {
        self.max_drain_passes = passes;
        self
    }

    pub fn shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout = timeout;
        self
    }

    pub fn write_pool_capacity(mut self, capacity: usize) -> Self {
        self.write_pool_capacity = capacity;
        self
    }

    pub fn dispatch(mut self, mode: DispatchMode) -> Self {
        self.dispatch = mode;
        self
    }

    pub fn background_threads(mut self, threads: usize) -> Self {
        self.background_threads = threads;
        self
    }

    pub fn driver(mut self, driver: DriverKind) -> Self {
        self.driver = driver;
        self
    }

    pub fn pool(mut self, pool: PoolConfig) -> Self {
        self.pool = pool;
        self
    }

    pub fn validate(&self) -> ConfigResult<()> {
        if self.heartbeat.is_zero() {
            return Err(ConfigError::invalid("heartbeat", "must be > 0"));
        }
        if self.max_drain_passes == 0 {
            return Err(ConfigError::invalid("max_drain_passes", "must be > 0"));
        }
        if self.write_pool_capacity == 0 {
            return Err(ConfigError::invalid("write_pool_capacity", "must be > 0"));
        }
        if self.dispatch != DispatchMode::Inline && !(1..=64).contains(&self.background_threads) {
            return Err(ConfigError::invalid("background_threads", "must be in 1..=64"));
        }
        self.pool.validate()
    }

    pub fn print(&self) {
        eprintln!("Shardwire Configuration:");
        eprintln!("  heartbeat:              {:?}", self.heartbeat);
        eprintln!("  max_drain_passes:       {}", self.max_drain_passes);
        eprintln!("  shutdown_timeout:       {:?}", self.shutdown_timeout);
        eprintln!("  write_pool_capacity:    {}", self.write_pool_capacity);
        eprintln!("  dispatch:               {}", self.dispatch);
        eprintln!("  background_threads:     {}", self.background_threads);
        eprintln!("  driver:                 {}", self.driver);
        eprintln!("  block_stride:           {}", self.pool.block_stride);
        eprintln!("  block_length:           {}", self.pool.block_length());
        eprintln!("  blocks_per_slab:        {}", self.pool.blocks_per_slab);
    }
}
