//! State owned by a shard's loop thread.

use std::fmt;
use std::sync::Arc;
use std::time::Instant;

use shardwire_buffer::BufferPool;
use shardwire_core::{Connection, ShardId};
use tracing::{debug, trace};

use crate::dispatch::Dispatcher;
use crate::reactor::ShardShared;
use crate::write_pool::WriteRequestPool;

/// Everything a work item can touch on its shard.
///
/// Only ever borrowed mutably by the loop thread, so nothing here needs
/// synchronization.
pub struct ShardContext {
    id: ShardId,
    now: Instant,
    pool: BufferPool,
    write_requests: WriteRequestPool,
    connections: Vec<Box<dyn Connection>>,
    dispatcher: Arc<dyn Dispatcher>,
    shared: Arc<ShardShared>,
    stopping: bool,
}

impl ShardContext {
    pub(crate) fn new(
        shared: Arc<ShardShared>,
        pool: BufferPool,
        write_requests: WriteRequestPool,
        dispatcher: Arc<dyn Dispatcher>,
    ) -> Self {
        Self {
            id: shared.id(),
            now: Instant::now(),
            pool,
            write_requests,
            connections: Vec::new(),
            dispatcher,
            shared,
            stopping: false,
        }
    }

    #[inline]
    pub fn shard_id(&self) -> ShardId {
        self.id
    }

    /// Clock cached at the last heartbeat (or shard start).
    #[inline]
    pub fn now(&self) -> Instant {
        self.now
    }

    #[inline]
    pub fn pool(&self) -> &BufferPool {
        &self.pool
    }

    #[inline]
    pub fn write_requests(&mut self) -> &mut WriteRequestPool {
        &mut self.write_requests
    }

    /// True once a stop has been requested.
    #[inline]
    pub fn is_stopping(&self) -> bool {
        self.stopping
    }

    /// Take ownership of a connection. It will receive heartbeats and
    /// shutdown notifications until it reports closed.
    pub fn register(&mut self, mut connection: Box<dyn Connection>) {
        trace!(shard = self.id, conn = connection.id(), "connection registered");
        if self.stopping {
            // Late arrival during shutdown: close it right away.
            connection.request_close();
            if connection.is_closed() {
                return;
            }
        }
        self.connections.push(connection);
    }

    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    /// Visit every live connection.
    pub fn walk(&mut self, mut f: impl FnMut(&mut dyn Connection)) {
        for connection in self.connections.iter_mut() {
            f(connection.as_mut());
        }
    }

    /// Hand a callback to the configured dispatch strategy.
    pub fn dispatch(&self, task: impl FnOnce() + Send + 'static) {
        self.dispatcher.dispatch(Box::new(task));
    }

    pub fn dispatcher_name(&self) -> &'static str {
        self.dispatcher.name()
    }

    /// Queue work behind everything already queued on this shard.
    pub fn defer(&self, work: impl FnOnce(&mut ShardContext) + Send + 'static) {
        self.shared.enqueue(Box::new(work));
    }

    pub(crate) fn tick(&mut self, now: Instant) {
        self.now = now;
        for connection in self.connections.iter_mut() {
            connection.on_heartbeat(now);
        }
        self.prune();
    }

    pub(crate) fn prune(&mut self) {
        let before = self.connections.len();
        self.connections.retain(|c| !c.is_closed());
        let closed = before - self.connections.len();
        if closed > 0 {
            trace!(shard = self.id, closed, "pruned closed connections");
        }
    }

    pub(crate) fn begin_graceful_close(&mut self) {
        self.stopping = true;
        debug!(shard = self.id, connections = self.connections.len(), "closing connections");
        for connection in self.connections.iter_mut() {
            connection.request_close();
        }
        self.prune();
    }

    pub(crate) fn abort_connections(&mut self) {
        self.stopping = true;
        debug!(shard = self.id, connections = self.connections.len(), "aborting connections");
        for connection in self.connections.iter_mut() {
            connection.abort();
        }
        self.prune();
    }

    /// Ready to leave the loop: stop requested and nothing left open.
    pub(crate) fn is_drained(&self) -> bool {
        self.stopping && self.connections.is_empty()
    }

    pub(crate) fn teardown(&mut self) {
        let abandoned = self.connections.len();
        for connection in self.connections.iter_mut() {
            connection.abort();
        }
        self.connections.clear();
        self.write_requests.dispose();
        self.pool.dispose();
        debug!(shard = self.id, abandoned, "shard context torn down");
    }
}

impl fmt::Debug for ShardContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ShardContext")
            .field("id", &self.id)
            .field("connections", &self.connections.len())
            .field("dispatcher", &self.dispatcher.name())
            .field("stopping", &self.stopping)
            .finish()
    }
}
