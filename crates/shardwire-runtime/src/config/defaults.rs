//! Default values for [`ShardConfig`](super::ShardConfig).

use std::time::Duration;

/// Clock refresh and connection tick interval.
pub const HEARTBEAT: Duration = Duration::from_secs(1);

/// Work-queue drain passes per wake before yielding back to the loop.
pub const MAX_DRAIN_PASSES: usize = 8;

/// Total budget for `stop`, split evenly over the three phases.
pub const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);

/// Write requests kept for reuse per shard.
pub const WRITE_POOL_CAPACITY: usize = 1024;

/// Worker threads for background dispatch.
pub const BACKGROUND_THREADS: usize = 2;
