//! # shardwire-runtime
//!
//! Reactor shards. Each shard is one OS thread running an event loop that
//! owns a buffer pool, a write request pool and a set of connections.
//! Other threads hand it work through a double-buffered queue and a wake
//! signal.
//!
//! ```text
//!   producer threads                          shard thread
//!  ┌────────────────┐   post()   ┌──────────┐  swap  ┌──────────┐
//!  │ post / post_   │ ─────────▶ │  adding  │ ◀────▶ │ running  │──▶ run items
//!  │ async / queue_ │   + wake   │ (mutex)  │        │ (owned)  │    in order
//!  │ close          │            └──────────┘        └──────────┘
//!  └────────────────┘
//!                         heartbeat ──▶ refresh clock, tick connections
//! ```
//!
//! Stopping escalates in three bounded phases: graceful close, abort,
//! immediate exit. See [`ReactorThread::stop`].

pub mod completion;
pub mod config;
pub mod context;
pub mod dispatch;
pub mod driver;
pub mod error;
pub mod group;
pub mod reactor;
pub mod write_pool;

pub use completion::Completion;
pub use config::{DispatchMode, DriverKind, ShardConfig};
pub use context::ShardContext;
pub use dispatch::{BackgroundDispatcher, Dispatcher, InlineDispatcher, LoggingDispatcher};
pub use error::{Result, ShardError};
pub use group::ShardGroup;
pub use reactor::{ReactorThread, ShardState};
pub use write_pool::{WriteRequest, WriteRequestPool};
