//! Per-shard connection trait.

use std::time::Instant;

/// A resource registered with a shard.
///
/// Connections are owned by the shard's loop thread and are only ever
/// touched from it. During shutdown the shard first calls
/// [`request_close`](Connection::request_close) on every connection, then
/// [`abort`](Connection::abort) on whatever is still open.
pub trait Connection: Send {
    /// Stable id, used in logs.
    fn id(&self) -> u64;

    /// Called once per heartbeat with the shard's cached clock.
    fn on_heartbeat(&mut self, now: Instant);

    /// Begin a graceful close. May complete later.
    fn request_close(&mut self);

    /// Tear down immediately.
    fn abort(&mut self);

    /// True once the connection has released everything it holds.
    fn is_closed(&self) -> bool;
}
