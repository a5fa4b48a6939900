//! A fixed set of shards started and stopped together.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread;
use std::time::Duration;

use tracing::{error, info};

use crate::config::ShardConfig;
use crate::error::{Result, ShardError};
use crate::reactor::ReactorThread;

pub struct ShardGroup {
    shards: Vec<ReactorThread>,
    next: AtomicUsize,
}

impl ShardGroup {
    /// Start `count` shards (at least one). If any fails to start, the
    /// ones already running are stopped and the failure is returned.
    pub fn start(config: &ShardConfig, count: usize) -> Result<Self> {
        config.validate()?;
        let count = count.max(1);
        let mut shards: Vec<ReactorThread> = Vec::with_capacity(count);

        for id in 0..count {
            let shard = ReactorThread::new(id, config.clone());
            if let Err(e) = shard.start().wait() {
                error!(shard = id, error = %e, "shard failed to start, stopping group");
                for started in &shards {
                    let _ = started.stop(config.shutdown_timeout);
                }
                return Err(e);
            }
            shards.push(shard);
        }

        info!(shards = count, "shard group started");
        Ok(Self {
            shards,
            next: AtomicUsize::new(0),
        })
    }

    pub fn len(&self) -> usize {
        self.shards.len()
    }

    pub fn is_empty(&self) -> bool {
        self.shards.is_empty()
    }

    pub fn shards(&self) -> &[ReactorThread] {
        &self.shards
    }

    pub fn shard(&self, id: usize) -> Option<&ReactorThread> {
        self.shards.get(id)
    }

    /// Round-robin pick, for spreading new connections.
    pub fn next(&self) -> &ReactorThread {
        let i = self.next.fetch_add(1, Ordering::Relaxed) % self.shards.len();
        &self.shards[i]
    }

    /// Stop every shard in parallel. Returns the first error seen.
    pub fn stop(&self, timeout: Duration) -> Result<()> {
        let results: Vec<Result<()>> = thread::scope(|scope| {
            let handles: Vec<_> = self
                .shards
                .iter()
                .map(|shard| scope.spawn(move || shard.stop(timeout)))
                .collect();
            handles
                .into_iter()
                .map(|h| {
                    h.join().unwrap_or_else(|_| {
                        Err(ShardError::LoopFailed {
                            shard: usize::MAX,
                            reason: "stop thread panicked".into(),
                        })
                    })
                })
                .collect()
        });

        let failed = results.iter().filter(|r| r.is_err()).count();
        info!(shards = self.shards.len(), failed, "shard group stopped");
        results.into_iter().find(|r| r.is_err()).unwrap_or(Ok(()))
    }
}
