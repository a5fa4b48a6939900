//! Event loop abstraction.
//!
//! A shard thread owns exactly one [`EventLoop`]. The loop sleeps until
//! either its [`LoopWaker`] is signalled or the heartbeat interval elapses,
//! and reports each event to a [`LoopHandler`].
//!
//! # Contract
//!
//! - `run` calls [`LoopHandler::on_wake`] once on entry, before waiting,
//!   so work queued before the loop started is not stranded.
//! - Wakes are coalescing: any number of `wake()` calls made before the
//!   loop next observes the signal produce at least one `on_wake`.
//! - A `wake()` issued while `on_wake` is running produces another
//!   `on_wake` after it returns.
//! - `run` returns `Ok(())` as soon as a callback returns
//!   [`LoopControl::Stop`].

use std::io;
use std::sync::Arc;
use std::time::Duration;

/// Cross-thread wake signal for an event loop.
pub trait LoopWaker: Send + Sync {
    /// Signal the loop. Never blocks.
    fn wake(&self) -> io::Result<()>;
}

/// What the loop should do after a callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopControl {
    Continue,
    Stop,
}

/// Callbacks driven by an event loop, always on the loop's own thread.
pub trait LoopHandler {
    /// The waker fired (or the loop just started).
    fn on_wake(&mut self) -> LoopControl;

    /// The heartbeat interval elapsed.
    fn on_heartbeat(&mut self) -> LoopControl;
}

/// An OS-level event loop.
pub trait EventLoop: Send {
    /// Short name for logs ("epoll", "portable", ...).
    fn name(&self) -> &'static str;

    /// A waker that may be cloned to any thread and outlive the loop.
    fn waker(&self) -> Arc<dyn LoopWaker>;

    /// Block the calling thread until a handler callback asks to stop.
    fn run(&mut self, heartbeat: Duration, handler: &mut dyn LoopHandler) -> io::Result<()>;
}
