use shardwire_core::ConfigError;
use thiserror::Error;

/// Errors from the block pool and cursor operations.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BufferError {
    #[error("buffer pool has been disposed")]
    PoolDisposed,

    #[error("block does not belong to this pool")]
    ForeignBlock,

    #[error("slab allocation of {len} bytes failed (errno {errno})")]
    SlabAllocation { len: usize, errno: i32 },

    #[error("slab of {slab_len} bytes cannot hold a {block_len} byte block")]
    SlabTooSmall { slab_len: usize, block_len: usize },

    #[error("requested {requested} bytes but only {available} remain in the chain")]
    OutOfRange { requested: usize, available: usize },

    #[error("cursor is not reachable from this position")]
    Unreachable,

    #[error("writes must start at the end of the last block in the chain")]
    NotAtTail,

    #[error("another writer is appending to this block")]
    WriterBusy,

    #[error(transparent)]
    Config(#[from] ConfigError),
}

pub type Result<T> = std::result::Result<T, BufferError>;
