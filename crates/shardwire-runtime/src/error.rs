use shardwire_buffer::BufferError;
use shardwire_core::{ConfigError, ShardId};
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ShardError {
    #[error("shard {shard} failed to start: {reason}")]
    StartFailed { shard: ShardId, reason: String },

    #[error("shard {0} was already started")]
    AlreadyStarted(ShardId),

    #[error("work item panicked: {0}")]
    WorkPanicked(String),

    #[error("work item was dropped before it produced a result")]
    Abandoned,

    #[error("timed out waiting for a result")]
    Timeout,

    #[error("shard {shard} event loop failed: {reason}")]
    LoopFailed { shard: ShardId, reason: String },

    #[error("shard {0} did not stop within the shutdown budget")]
    StopTimedOut(ShardId),

    #[error("write request pool is disposed")]
    WritePoolDisposed,

    #[error("write request belongs to shard {owner}, not shard {shard}")]
    ForeignWriteRequest { owner: ShardId, shard: ShardId },

    #[error(transparent)]
    Buffer(#[from] BufferError),

    #[error(transparent)]
    Config(#[from] ConfigError),
}

pub type Result<T> = std::result::Result<T, ShardError>;

/// Best-effort text of a panic payload.
pub(crate) fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&'static str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}
