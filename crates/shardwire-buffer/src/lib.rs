//! # shardwire-buffer
//!
//! Pooled memory for a network transport.
//!
//! Memory is carved from large slabs into fixed-size [`Block`]s. Blocks are
//! linked into chains that hold in-flight request and response bytes, and a
//! [`Cursor`] walks a chain as if it were one contiguous stream.
//!
//! ```text
//!  Slab (128 KiB, one mmap)
//!  ┌────────┬────────┬────────┬─────┬────────┐
//!  │ block0 │ block1 │ block2 │ ... │ block31│     each: 4032 usable + 64 guard
//!  └────────┴────────┴────────┴─────┴────────┘
//!
//!  Chain:   [start..end) ──next──▶ [start..end) ──next──▶ [start..end)
//!              ▲ cursor(block, index)
//! ```
//!
//! Leasing and returning are lock-free (free list is a `SegQueue`); only
//! slab allocation takes a lock. Blocks return themselves to their pool
//! when the owning [`PooledBlock`] is dropped, from any thread.

mod block;
mod chain;
pub mod config;
mod cursor;
mod error;
mod pool;
pub mod scan;
mod slab;
pub mod tokens;

pub use block::{Block, PooledBlock};
pub use chain::BlockChain;
pub use config::PoolConfig;
pub use cursor::{Cursor, Segments};
pub use error::{BufferError, Result};
pub use pool::{BufferPool, PoolStats};
pub use scan::{Needles, ScanMode};
pub use tokens::{known_method, known_version, HttpMethod, HttpVersion};
