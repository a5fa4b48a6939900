//! # shardwire-core
//!
//! Platform-agnostic building blocks shared by the shardwire crates.
//!
//! This crate has no I/O of its own. It defines the seams the runtime
//! plugs into:
//!
//! - [`EventLoop`] / [`LoopWaker`] / [`LoopHandler`]: the OS loop a
//!   shard thread runs on, and the callbacks it drives
//! - [`Connection`]: a per-shard resource that takes part in heartbeat
//!   ticks and staged shutdown
//! - [`ConfigError`]: validation failures for pool and shard configuration
//! - [`env`]: `SHARDWIRE_*` environment parsing helpers
//!
//! ```text
//!  ┌──────────────┐    wake()    ┌───────────────┐   on_wake()     ┌──────────────┐
//!  │ any thread   │ ───────────▶ │  EventLoop    │ ──────────────▶ │ LoopHandler  │
//!  │ (post work)  │  LoopWaker   │ (epoll/condv) │  on_heartbeat() │ (shard loop) │
//!  └──────────────┘              └───────────────┘                 └──────────────┘
//! ```

pub mod connection;
pub mod env;
pub mod error;
pub mod event_loop;

pub use connection::Connection;
pub use error::{ConfigError, ConfigResult};
pub use event_loop::{EventLoop, LoopControl, LoopHandler, LoopWaker};

/// Cache line size used for slab alignment.
pub const CACHE_LINE_SIZE: usize = 64;

/// Identifier of one reactor shard within a group.
pub type ShardId = usize;
