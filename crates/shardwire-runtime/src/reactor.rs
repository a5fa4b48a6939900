//! Reactor shard: one event loop thread and its cross-thread queues.
//!
//! # Work queues
//!
//! Producers push into `adding` under a short lock and wake the loop.
//! On each wake the loop swaps `adding` with its private `running` vector
//! and runs the items without holding the lock, so producers never wait
//! on user code. Up to `max_drain_passes` swaps happen per wake, which
//! absorbs work that completing items enqueue.
//!
//! # Shutdown
//!
//! ```text
//!   stop(timeout), step = timeout / 3
//!
//!   StopRequested      close connections gracefully, exit when idle
//!        │ step elapsed
//!   StoppingRude       abort remaining connections
//!        │ step elapsed
//!   StoppingImmediate  break out of the loop, abandon queued work
//!        │ step elapsed
//!   StopTimedOut       logged, thread left detached
//! ```
//!
//! Work that panics with nobody waiting on it is fatal: the loop exits
//! and `stop` reports the panic. Work posted with `post_async` panics
//! into its own completion handle and the loop carries on.

use std::fmt;
use std::io;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::{Arc, OnceLock};
use std::thread;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use shardwire_buffer::BufferPool;
use shardwire_core::{Connection, EventLoop, LoopControl, LoopHandler, LoopWaker, ShardId};
use tracing::{debug, error, info, warn};

use crate::completion::{Completion, Resolver};
use crate::config::ShardConfig;
use crate::context::ShardContext;
use crate::dispatch;
use crate::driver;
use crate::error::{panic_message, Result, ShardError};
use crate::write_pool::WriteRequestPool;

/// Work for the loop thread.
pub type Job = Box<dyn FnOnce(&mut ShardContext) + Send + 'static>;

type CloseJob = Box<dyn FnOnce() + Send + 'static>;

type DriverFactory = Box<dyn FnOnce() -> io::Result<Box<dyn EventLoop>> + Send + 'static>;

/// Lifecycle of a shard. Only ever moves forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum ShardState {
    Created = 0,
    Running = 1,
    StopRequested = 2,
    StoppingRude = 3,
    StoppingImmediate = 4,
    Stopped = 5,
}

impl ShardState {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => ShardState::Created,
            1 => ShardState::Running,
            2 => ShardState::StopRequested,
            3 => ShardState::StoppingRude,
            4 => ShardState::StoppingImmediate,
            _ => ShardState::Stopped,
        }
    }
}

impl fmt::Display for ShardState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ShardState::Created => "created",
            ShardState::Running => "running",
            ShardState::StopRequested => "stop-requested",
            ShardState::StoppingRude => "stopping-rude",
            ShardState::StoppingImmediate => "stopping-immediate",
            ShardState::Stopped => "stopped",
        };
        f.write_str(s)
    }
}

/// State shared between a shard's handle, producers and the loop thread.
pub(crate) struct ShardShared {
    id: ShardId,
    state: AtomicU8,
    work: Mutex<Vec<Job>>,
    close: Mutex<Vec<CloseJob>>,
    waker: OnceLock<Arc<dyn LoopWaker>>,
    stop_immediate: AtomicBool,
    fatal: Mutex<Option<ShardError>>,
    exited: Mutex<bool>,
    exited_cond: Condvar,
}

impl ShardShared {
    fn new(id: ShardId) -> Self {
        Self {
            id,
            state: AtomicU8::new(ShardState::Created as u8),
            work: Mutex::new(Vec::new()),
            close: Mutex::new(Vec::new()),
            waker: OnceLock::new(),
            stop_immediate: AtomicBool::new(false),
            fatal: Mutex::new(None),
            exited: Mutex::new(false),
            exited_cond: Condvar::new(),
        }
    }

    #[inline]
    pub(crate) fn id(&self) -> ShardId {
        self.id
    }

    #[inline]
    fn state(&self) -> ShardState {
        ShardState::from_u8(self.state.load(Ordering::Acquire))
    }

    /// Advance to `state` unless already past it.
    fn advance(&self, state: ShardState) {
        self.state.fetch_max(state as u8, Ordering::AcqRel);
    }

    /// Queue work and wake the loop. Work offered after the shard stopped
    /// is dropped, which abandons any completion it carries.
    pub(crate) fn enqueue(&self, job: Job) -> bool {
        {
            let mut adding = self.work.lock();
            if self.state() == ShardState::Stopped {
                return false;
            }
            adding.push(job);
        }
        self.wake();
        true
    }

    fn enqueue_close(&self, job: CloseJob) -> bool {
        {
            let mut adding = self.close.lock();
            if self.state() == ShardState::Stopped {
                return false;
            }
            adding.push(job);
        }
        self.wake();
        true
    }

    fn wake(&self) {
        if let Some(waker) = self.waker.get() {
            if let Err(e) = waker.wake() {
                warn!(shard = self.id, error = %e, "failed to wake shard loop");
            }
        }
    }

    #[inline]
    fn stop_immediate(&self) -> bool {
        self.stop_immediate.load(Ordering::Acquire)
    }

    fn record_fatal(&self, err: ShardError) {
        let mut fatal = self.fatal.lock();
        if fatal.is_none() {
            *fatal = Some(err);
        }
    }

    fn fatal_error(&self) -> Option<ShardError> {
        self.fatal.lock().clone()
    }

    /// Mark the shard stopped, abandon anything still queued and release
    /// waiters. Returns the number of abandoned items.
    fn finish(&self) -> usize {
        let work = {
            let mut adding = self.work.lock();
            self.advance(ShardState::Stopped);
            std::mem::take(&mut *adding)
        };
        let close = std::mem::take(&mut *self.close.lock());
        let abandoned = work.len() + close.len();
        drop(work);
        drop(close);

        let mut exited = self.exited.lock();
        *exited = true;
        self.exited_cond.notify_all();
        abandoned
    }

    fn has_exited(&self) -> bool {
        *self.exited.lock()
    }

    fn wait_exited(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut exited = self.exited.lock();
        while !*exited {
            if self.exited_cond.wait_until(&mut exited, deadline).timed_out() {
                break;
            }
        }
        *exited
    }
}

/// The loop thread's side of a shard.
struct ShardLoop {
    shared: Arc<ShardShared>,
    ctx: ShardContext,
    running: Vec<Job>,
    closing: Vec<CloseJob>,
    max_passes: usize,
}

impl ShardLoop {
    /// One swap-and-run pass over the work queue.
    fn drain_work(&mut self) -> Result<bool> {
        std::mem::swap(&mut *self.shared.work.lock(), &mut self.running);
        if self.running.is_empty() {
            return Ok(false);
        }
        for job in self.running.drain(..) {
            if self.shared.stop_immediate() {
                break;
            }
            if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(|| job(&mut self.ctx))) {
                let reason = panic_message(&*payload);
                error!(shard = self.shared.id, %reason, "work item panicked");
                return Err(ShardError::WorkPanicked(reason));
            }
        }
        Ok(true)
    }

    /// One swap-and-run pass over the close queue.
    fn drain_close(&mut self) -> Result<bool> {
        std::mem::swap(&mut *self.shared.close.lock(), &mut self.closing);
        if self.closing.is_empty() {
            return Ok(false);
        }
        for job in self.closing.drain(..) {
            if self.shared.stop_immediate() {
                break;
            }
            if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(job)) {
                let reason = panic_message(&*payload);
                error!(shard = self.shared.id, %reason, "close callback panicked");
                return Err(ShardError::WorkPanicked(reason));
            }
        }
        Ok(true)
    }

    fn fail(&mut self, err: ShardError) -> LoopControl {
        self.shared.record_fatal(err);
        LoopControl::Stop
    }

    fn settle(&mut self) -> LoopControl {
        if self.shared.stop_immediate() {
            return LoopControl::Stop;
        }
        self.ctx.prune();
        if self.ctx.is_drained() {
            debug!(shard = self.shared.id, "shard idle after stop request");
            return LoopControl::Stop;
        }
        LoopControl::Continue
    }
}

impl LoopHandler for ShardLoop {
    fn on_wake(&mut self) -> LoopControl {
        for _ in 0..self.max_passes {
            if self.shared.stop_immediate() {
                return LoopControl::Stop;
            }
            let ran_work = match self.drain_work() {
                Ok(ran) => ran,
                Err(e) => return self.fail(e),
            };
            let ran_close = match self.drain_close() {
                Ok(ran) => ran,
                Err(e) => return self.fail(e),
            };
            if !ran_work && !ran_close {
                break;
            }
        }
        self.settle()
    }

    fn on_heartbeat(&mut self) -> LoopControl {
        if self.shared.stop_immediate() {
            return LoopControl::Stop;
        }
        let now = Instant::now();
        if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(|| self.ctx.tick(now))) {
            let reason = panic_message(&*payload);
            error!(shard = self.shared.id, %reason, "connection heartbeat panicked");
            return self.fail(ShardError::WorkPanicked(reason));
        }
        self.settle()
    }
}

fn shard_main(shared: Arc<ShardShared>, config: ShardConfig, factory: DriverFactory, started: Resolver<()>) {
    let id = shared.id;

    // ── Step 1: Loop primitives ──
    let mut driver = match factory() {
        Ok(driver) => driver,
        Err(e) => {
            error!(shard = id, error = %e, "event loop initialization failed");
            shared.finish();
            let _ = started.send(Err(ShardError::StartFailed {
                shard: id,
                reason: e.to_string(),
            }));
            return;
        }
    };
    let dispatcher = match dispatch::create(config.dispatch, config.background_threads, id) {
        Ok(dispatcher) => dispatcher,
        Err(e) => {
            error!(shard = id, error = %e, "dispatcher initialization failed");
            shared.finish();
            let _ = started.send(Err(ShardError::StartFailed {
                shard: id,
                reason: e.to_string(),
            }));
            return;
        }
    };
    let pool = match BufferPool::new(config.pool.clone()) {
        Ok(pool) => pool,
        Err(e) => {
            error!(shard = id, error = %e, "buffer pool initialization failed");
            shared.finish();
            let _ = started.send(Err(ShardError::StartFailed {
                shard: id,
                reason: e.to_string(),
            }));
            return;
        }
    };
    let _ = shared.waker.set(driver.waker());

    // ── Step 2: Shard-owned resources ──
    let ctx = ShardContext::new(
        Arc::clone(&shared),
        pool,
        WriteRequestPool::new(id, config.write_pool_capacity),
        dispatcher,
    );
    let mut shard_loop = ShardLoop {
        shared: Arc::clone(&shared),
        ctx,
        running: Vec::new(),
        closing: Vec::new(),
        max_passes: config.max_drain_passes.max(1),
    };

    shared.advance(ShardState::Running);
    info!(
        shard = id,
        driver = driver.name(),
        dispatch = shard_loop.ctx.dispatcher_name(),
        "shard started"
    );
    let _ = started.send(Ok(()));

    // ── Step 3: Run until stopped ──
    if let Err(e) = driver.run(config.heartbeat, &mut shard_loop) {
        error!(shard = id, error = %e, "event loop failed");
        shared.record_fatal(ShardError::LoopFailed {
            shard: id,
            reason: e.to_string(),
        });
    }

    // ── Step 4: Teardown ──
    shard_loop.ctx.teardown();
    drop(shard_loop);
    drop(driver);
    let abandoned = shared.finish();
    info!(shard = id, abandoned, "shard stopped");
}

/// Handle to one reactor shard.
pub struct ReactorThread {
    shared: Arc<ShardShared>,
    config: ShardConfig,
    factory: Mutex<Option<DriverFactory>>,
    thread: Mutex<Option<thread::JoinHandle<()>>>,
    stopping: Mutex<()>,
}

impl ReactorThread {
    /// A shard using the driver named in `config`.
    pub fn new(id: ShardId, config: ShardConfig) -> Self {
        let kind = config.driver;
        Self::with_driver(id, config, move || driver::create_loop(kind))
    }

    /// A shard whose event loop is built by `factory` on the shard thread.
    pub fn with_driver<F>(id: ShardId, config: ShardConfig, factory: F) -> Self
    where
        F: FnOnce() -> io::Result<Box<dyn EventLoop>> + Send + 'static,
    {
        Self {
            shared: Arc::new(ShardShared::new(id)),
            config,
            factory: Mutex::new(Some(Box::new(factory))),
            thread: Mutex::new(None),
            stopping: Mutex::new(()),
        }
    }

    #[inline]
    pub fn id(&self) -> ShardId {
        self.shared.id
    }

    #[inline]
    pub fn state(&self) -> ShardState {
        self.shared.state()
    }

    pub fn config(&self) -> &ShardConfig {
        &self.config
    }

    /// The error that ended the loop, if any.
    pub fn fatal_error(&self) -> Option<ShardError> {
        self.shared.fatal_error()
    }

    /// Spawn the loop thread. The completion resolves once the loop is
    /// initialized (`Running`), or with the initialization error.
    ///
    /// An invalid configuration fails with `StartFailed` and leaves the
    /// shard in `Created`.
    pub fn start(&self) -> Completion<()> {
        let id = self.shared.id;
        if let Err(e) = self.config.validate() {
            error!(shard = id, error = %e, "invalid shard configuration");
            return Completion::ready(Err(ShardError::StartFailed {
                shard: id,
                reason: e.to_string(),
            }));
        }

        // Held until the handle is stored, so `stop` never sees the
        // factory gone without a handle for a live thread.
        let mut thread_slot = self.thread.lock();
        let Some(factory) = self.factory.lock().take() else {
            return Completion::ready(Err(ShardError::AlreadyStarted(id)));
        };

        let (started, completion) = Completion::channel();
        let shared = Arc::clone(&self.shared);
        let config = self.config.clone();
        let spawned = thread::Builder::new()
            .name(format!("shardwire-{id}"))
            .spawn(move || shard_main(shared, config, factory, started));

        match spawned {
            Ok(handle) => {
                *thread_slot = Some(handle);
                completion
            }
            Err(e) => {
                error!(shard = id, error = %e, "failed to spawn shard thread");
                self.shared.finish();
                Completion::ready(Err(ShardError::StartFailed {
                    shard: id,
                    reason: e.to_string(),
                }))
            }
        }
    }

    /// Run `work` on the loop thread, after everything posted before it.
    ///
    /// A panic in `work` is fatal to the shard.
    pub fn post<F>(&self, work: F)
    where
        F: FnOnce(&mut ShardContext) + Send + 'static,
    {
        if !self.shared.enqueue(Box::new(work)) {
            debug!(shard = self.shared.id, "shard stopped, dropping posted work");
        }
    }

    /// Like [`post`](Self::post), with the result (or panic) delivered to
    /// the returned handle. The loop survives a panic here.
    pub fn post_async<T, F>(&self, work: F) -> Completion<T>
    where
        F: FnOnce(&mut ShardContext) -> T + Send + 'static,
        T: Send + 'static,
    {
        let (resolver, completion) = Completion::channel();
        let queued = self.shared.enqueue(Box::new(move |ctx: &mut ShardContext| {
            let shard = ctx.shard_id();
            let outcome = panic::catch_unwind(AssertUnwindSafe(|| work(ctx))).map_err(|payload| {
                let reason = panic_message(&*payload);
                warn!(shard, %reason, "async work item panicked");
                ShardError::WorkPanicked(reason)
            });
            let _ = resolver.send(outcome);
        }));
        if !queued {
            debug!(shard = self.shared.id, "shard stopped, abandoning async work");
        }
        completion
    }

    /// Post a callback that does not need the shard context.
    pub fn schedule<F>(&self, work: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.post(move |_| work());
    }

    /// Queue a resource-release callback on the close queue.
    pub fn queue_close<F>(&self, release: F)
    where
        F: FnOnce() + Send + 'static,
    {
        if !self.shared.enqueue_close(Box::new(release)) {
            debug!(shard = self.shared.id, "shard stopped, dropping close callback");
        }
    }

    /// Hand a connection to the shard.
    pub fn register(&self, connection: Box<dyn Connection>) {
        self.post(move |ctx| ctx.register(connection));
    }

    /// Visit every connection on the loop thread.
    pub fn walk<F>(&self, mut visit: F) -> Completion<()>
    where
        F: FnMut(&mut dyn Connection) + Send + 'static,
    {
        self.post_async(move |ctx| ctx.walk(&mut visit))
    }

    /// Run `task` through the shard's dispatch strategy.
    pub fn dispatch<F>(&self, task: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.post(move |ctx| ctx.dispatch(task));
    }

    /// Stop the shard within roughly `timeout`.
    ///
    /// Returns the fatal error if the loop died on its own,
    /// `StopTimedOut` if the thread could not be stopped at all.
    /// Concurrent callers are serialized; a later caller sees the outcome
    /// of the earlier one.
    pub fn stop(&self, timeout: Duration) -> Result<()> {
        let id = self.shared.id;
        let _stopping = self.stopping.lock();

        let mut thread_slot = self.thread.lock();
        let Some(handle) = thread_slot.take() else {
            let never_started = self.factory.lock().take().is_some();
            drop(thread_slot);
            if never_started {
                // Make sure it never will.
                self.shared.finish();
            } else if !self.shared.wait_exited(timeout) {
                // An earlier stop gave up on this thread.
                return Err(ShardError::StopTimedOut(id));
            }
            return self.shared.fatal_error().map_or(Ok(()), Err);
        };
        drop(thread_slot);

        let step = timeout / 3;
        for phase in [
            ShardState::StopRequested,
            ShardState::StoppingRude,
            ShardState::StoppingImmediate,
        ] {
            if self.shared.has_exited() {
                break;
            }
            self.shared.advance(phase);
            match phase {
                ShardState::StopRequested => {
                    info!(shard = id, ?timeout, "stop requested");
                    self.shared.enqueue(Box::new(|ctx| ctx.begin_graceful_close()));
                }
                ShardState::StoppingRude => {
                    warn!(shard = id, "graceful close timed out, aborting connections");
                    self.shared.enqueue(Box::new(|ctx| ctx.abort_connections()));
                }
                _ => {
                    warn!(shard = id, "abort timed out, stopping loop immediately");
                    self.shared.stop_immediate.store(true, Ordering::Release);
                    self.shared.wake();
                }
            }
            self.shared.wait_exited(step);
        }

        if !self.shared.has_exited() {
            error!(shard = id, "shard loop did not terminate, leaving thread detached");
            return Err(ShardError::StopTimedOut(id));
        }
        if handle.join().is_err() {
            return Err(ShardError::LoopFailed {
                shard: id,
                reason: "loop thread panicked".into(),
            });
        }
        self.shared.fatal_error().map_or(Ok(()), Err)
    }
}

impl Drop for ReactorThread {
    fn drop(&mut self) {
        if self.thread.get_mut().is_some() {
            if let Err(e) = self.stop(self.config.shutdown_timeout) {
                warn!(shard = self.shared.id, error = %e, "shard stopped with error on drop");
            }
        }
    }
}

impl fmt::Debug for ReactorThread {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReactorThread")
            .field("id", &self.shared.id)
            .field("state", &self.state())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{DispatchMode, DriverKind};
    use crate::driver::PortableLoop;
    use std::sync::atomic::AtomicUsize;
    use std::sync::mpsc;

    const WAIT: Duration = Duration::from_secs(5);

    type Log = Arc<Mutex<Vec<&'static str>>>;

    #[derive(Clone, Copy)]
    enum Closes {
        OnRequest,
        OnAbort,
        Never,
    }

    struct TestConn {
        closes: Closes,
        closed: bool,
        log: Log,
        beats: Arc<AtomicUsize>,
    }

    impl TestConn {
        fn boxed(closes: Closes, log: &Log, beats: &Arc<AtomicUsize>) -> Box<dyn Connection> {
            Box::new(TestConn {
                closes,
                closed: false,
                log: Arc::clone(log),
                beats: Arc::clone(beats),
            })
        }
    }

    impl Connection for TestConn {
        fn id(&self) -> u64 {
            1
        }

        fn on_heartbeat(&mut self, _now: Instant) {
            self.beats.fetch_add(1, Ordering::SeqCst);
        }

        fn request_close(&mut self) {
            self.log.lock().push("close");
            if matches!(self.closes, Closes::OnRequest) {
                self.closed = true;
            }
        }

        fn abort(&mut self) {
            self.log.lock().push("abort");
            if matches!(self.closes, Closes::OnAbort) {
                self.closed = true;
            }
        }

        fn is_closed(&self) -> bool {
            self.closed
        }
    }

    fn config() -> ShardConfig {
        ShardConfig::new().heartbeat(Duration::from_millis(50))
    }

    fn started(config: ShardConfig) -> ReactorThread {
        let shard = ReactorThread::new(0, config);
        shard.start().wait_timeout(WAIT).unwrap();
        shard
    }

    fn wait_for(mut cond: impl FnMut() -> bool) -> bool {
        let deadline = Instant::now() + WAIT;
        while Instant::now() < deadline {
            if cond() {
                return true;
            }
            thread::sleep(Duration::from_millis(5));
        }
        false
    }

    #[test]
    fn test_lifecycle_states() {
        let shard = ReactorThread::new(4, config());
        assert_eq!(shard.state(), ShardState::Created);

        shard.start().wait_timeout(WAIT).unwrap();
        assert_eq!(shard.state(), ShardState::Running);
        assert_eq!(shard.post_async(|ctx| ctx.shard_id()).wait_timeout(WAIT), Ok(4));

        shard.stop(Duration::from_secs(3)).unwrap();
        assert_eq!(shard.state(), ShardState::Stopped);
        assert!(shard.fatal_error().is_none());
    }

    #[test]
    fn test_start_twice_fails() {
        let shard = started(config());
        assert_eq!(shard.start().wait(), Err(ShardError::AlreadyStarted(0)));
    }

    #[test]
    fn test_stop_before_start() {
        let shard = ReactorThread::new(0, config());
        let orphan = shard.post_async(|_| 1);
        shard.stop(Duration::from_secs(1)).unwrap();
        assert_eq!(shard.state(), ShardState::Stopped);
        assert_eq!(orphan.wait(), Err(ShardError::Abandoned));
        assert_eq!(shard.start().wait(), Err(ShardError::AlreadyStarted(0)));
    }

    #[test]
    fn test_start_failure_reported() {
        let shard = ReactorThread::with_driver(2, config(), || {
            Err(io::Error::new(io::ErrorKind::Other, "no wake primitive"))
        });
        match shard.start().wait_timeout(WAIT) {
            Err(ShardError::StartFailed { shard, reason }) => {
                assert_eq!(shard, 2);
                assert!(reason.contains("no wake primitive"));
            }
            other => panic!("unexpected start result: {other:?}"),
        }
        assert_eq!(shard.state(), ShardState::Stopped);
        assert!(shard.stop(Duration::from_secs(1)).is_ok());
    }

    #[test]
    fn test_invalid_config_fails_start() {
        let shard = ReactorThread::new(3, config().heartbeat(Duration::ZERO));
        match shard.start().wait_timeout(WAIT) {
            Err(ShardError::StartFailed { shard, reason }) => {
                assert_eq!(shard, 3);
                assert!(reason.contains("heartbeat"), "{reason}");
            }
            other => panic!("unexpected start result: {other:?}"),
        }
        assert_eq!(shard.state(), ShardState::Created);

        let orphan = shard.post_async(|_| 1);
        shard.stop(Duration::from_secs(1)).unwrap();
        assert_eq!(shard.state(), ShardState::Stopped);
        assert_eq!(orphan.wait(), Err(ShardError::Abandoned));
    }

    #[test]
    fn test_concurrent_stop_is_bounded() {
        let shard = Arc::new(started(config()));
        let log = Log::default();
        let beats = Arc::new(AtomicUsize::new(0));
        shard.register(TestConn::boxed(Closes::Never, &log, &beats));
        shard.post_async(|_| ()).wait_timeout(WAIT).unwrap();

        let first = {
            let shard = Arc::clone(&shard);
            thread::spawn(move || {
                let begun = Instant::now();
                let result = shard.stop(Duration::from_millis(600));
                (result, begun.elapsed())
            })
        };
        thread::sleep(Duration::from_millis(50));
        assert_eq!(shard.stop(Duration::from_millis(600)), Ok(()));
        // The second caller only returns once the loop is really gone.
        assert_eq!(shard.state(), ShardState::Stopped);
        assert_eq!(log.lock()[..2], ["close", "abort"]);

        let (result, elapsed) = first.join().unwrap();
        assert_eq!(result, Ok(()));
        assert!(elapsed < Duration::from_secs(2), "{elapsed:?}");
        assert_eq!(shard.post_async(|_| 1).wait_timeout(WAIT), Err(ShardError::Abandoned));
    }

    #[test]
    fn test_stop_after_stop_returns_same_outcome() {
        let shard = started(config());
        shard.stop(Duration::from_secs(3)).unwrap();
        assert_eq!(shard.stop(Duration::from_millis(10)), Ok(()));
    }

    #[test]
    fn test_per_producer_order() {
        let shard = Arc::new(started(config()));
        let seen = Arc::new(Mutex::new(Vec::new()));
        const PRODUCERS: usize = 4;
        const PER_PRODUCER: usize = 500;

        let producers: Vec<_> = (0..PRODUCERS)
            .map(|p| {
                let shard = Arc::clone(&shard);
                let seen = Arc::clone(&seen);
                thread::spawn(move || {
                    for i in 0..PER_PRODUCER {
                        let seen = Arc::clone(&seen);
                        shard.post(move |_| seen.lock().push((p, i)));
                    }
                })
            })
            .collect();
        for p in producers {
            p.join().unwrap();
        }
        shard.post_async(|_| ()).wait_timeout(WAIT).unwrap();

        let seen = seen.lock();
        assert_eq!(seen.len(), PRODUCERS * PER_PRODUCER);
        for p in 0..PRODUCERS {
            let order: Vec<usize> = seen.iter().filter(|(q, _)| *q == p).map(|(_, i)| *i).collect();
            assert_eq!(order, (0..PER_PRODUCER).collect::<Vec<_>>());
        }
    }

    #[test]
    fn test_async_panic_faults_handle_only() {
        let shard = started(config());
        let failed = shard.post_async(|_| -> u32 { panic!("handler bug") });
        assert_eq!(
            failed.wait_timeout(WAIT),
            Err(ShardError::WorkPanicked("handler bug".into()))
        );

        assert_eq!(shard.post_async(|_| 11).wait_timeout(WAIT), Ok(11));
        assert_eq!(shard.state(), ShardState::Running);
        shard.stop(Duration::from_secs(3)).unwrap();
    }

    #[test]
    fn test_detached_panic_is_fatal() {
        let shard = started(config());
        shard.post(|_| panic!("unobserved failure"));

        assert!(wait_for(|| shard.state() == ShardState::Stopped));
        let expected = ShardError::WorkPanicked("unobserved failure".into());
        assert_eq!(shard.fatal_error(), Some(expected.clone()));
        assert_eq!(shard.stop(Duration::from_secs(1)), Err(expected));

        // Nothing runs after the loop died.
        assert_eq!(shard.post_async(|_| 1).wait_timeout(WAIT), Err(ShardError::Abandoned));
    }

    #[test]
    fn test_deferred_chain_does_not_wait_for_heartbeat() {
        // Longer than the test budget: only wakes can move the chain along.
        let shard = started(ShardConfig::new().heartbeat(Duration::from_secs(60)).max_drain_passes(2));
        let (tx, rx) = mpsc::channel();

        fn step(ctx: &mut ShardContext, left: usize, tx: mpsc::Sender<usize>) {
            if left == 0 {
                let _ = tx.send(ctx.shard_id());
            } else {
                ctx.defer(move |ctx| step(ctx, left - 1, tx));
            }
        }
        shard.post(move |ctx| step(ctx, 50, tx));

        assert_eq!(rx.recv_timeout(WAIT), Ok(0));
        shard.stop(Duration::from_secs(3)).unwrap();
    }

    /// Wraps the portable loop and records how many counted jobs ran in
    /// each `on_wake`.
    struct CountingLoop {
        inner: PortableLoop,
        executed: Arc<AtomicUsize>,
        per_wake: Arc<Mutex<Vec<usize>>>,
    }

    struct Tally<'a> {
        inner: &'a mut dyn LoopHandler,
        executed: &'a AtomicUsize,
        per_wake: &'a Mutex<Vec<usize>>,
    }

    impl LoopHandler for Tally<'_> {
        fn on_wake(&mut self) -> LoopControl {
            let before = self.executed.load(Ordering::SeqCst);
            let control = self.inner.on_wake();
            let ran = self.executed.load(Ordering::SeqCst) - before;
            self.per_wake.lock().push(ran);
            control
        }

        fn on_heartbeat(&mut self) -> LoopControl {
            self.inner.on_heartbeat()
        }
    }

    impl EventLoop for CountingLoop {
        fn name(&self) -> &'static str {
            "counting"
        }

        fn waker(&self) -> Arc<dyn LoopWaker> {
            self.inner.waker()
        }

        fn run(&mut self, heartbeat: Duration, handler: &mut dyn LoopHandler) -> io::Result<()> {
            let mut tally = Tally {
                inner: handler,
                executed: &self.executed,
                per_wake: &self.per_wake,
            };
            self.inner.run(heartbeat, &mut tally)
        }
    }

    #[test]
    fn test_drain_passes_bounded_per_wake() {
        const CHAIN: usize = 10;
        let executed = Arc::new(AtomicUsize::new(0));
        let per_wake = Arc::new(Mutex::new(Vec::new()));
        let driver = CountingLoop {
            inner: PortableLoop::new(),
            executed: Arc::clone(&executed),
            per_wake: Arc::clone(&per_wake),
        };
        let config = ShardConfig::new().heartbeat(Duration::from_secs(60)).max_drain_passes(3);
        let shard = ReactorThread::with_driver(0, config, move || Ok(Box::new(driver) as Box<dyn EventLoop>));
        shard.start().wait_timeout(WAIT).unwrap();

        // Each link defers the next, so every pass runs exactly one of them.
        fn link(ctx: &mut ShardContext, left: usize, executed: Arc<AtomicUsize>) {
            executed.fetch_add(1, Ordering::SeqCst);
            if left > 1 {
                ctx.defer(move |ctx| link(ctx, left - 1, executed));
            }
        }
        let counter = Arc::clone(&executed);
        shard.post(move |ctx| link(ctx, CHAIN, counter));

        assert!(wait_for(|| per_wake.lock().iter().sum::<usize>() == CHAIN));
        let per_wake = per_wake.lock().clone();
        assert!(per_wake.iter().all(|&n| n <= 3), "{per_wake:?}");
        assert_eq!(per_wake.iter().max(), Some(&3), "{per_wake:?}");
        assert!(per_wake.iter().filter(|&&n| n > 0).count() >= 4, "{per_wake:?}");
        shard.stop(Duration::from_secs(3)).unwrap();
    }

    #[test]
    fn test_heartbeat_ticks_connections() {
        let shard = started(ShardConfig::new().heartbeat(Duration::from_millis(10)));
        let registered = Instant::now();
        let log = Log::default();
        let beats = Arc::new(AtomicUsize::new(0));
        shard.register(TestConn::boxed(Closes::OnRequest, &log, &beats));

        assert!(wait_for(|| beats.load(Ordering::SeqCst) >= 3));
        // The cached clock moved with the ticks.
        let cached = shard.post_async(|ctx| ctx.now()).wait_timeout(WAIT).unwrap();
        assert!(cached >= registered);
        shard.stop(Duration::from_secs(3)).unwrap();
    }

    #[test]
    fn test_graceful_stop() {
        let shard = started(config());
        let log = Log::default();
        let beats = Arc::new(AtomicUsize::new(0));
        shard.register(TestConn::boxed(Closes::OnRequest, &log, &beats));
        assert_eq!(shard.post_async(|ctx| ctx.connection_count()).wait_timeout(WAIT), Ok(1));

        let begun = Instant::now();
        shard.stop(Duration::from_secs(3)).unwrap();
        assert!(begun.elapsed() < Duration::from_secs(1));
        assert_eq!(*log.lock(), vec!["close"]);
    }

    #[test]
    fn test_stop_escalates_to_abort() {
        let shard = started(config());
        let log = Log::default();
        let beats = Arc::new(AtomicUsize::new(0));
        shard.register(TestConn::boxed(Closes::OnAbort, &log, &beats));
        shard.post_async(|_| ()).wait_timeout(WAIT).unwrap();

        let begun = Instant::now();
        shard.stop(Duration::from_millis(600)).unwrap();
        let elapsed = begun.elapsed();
        assert!(elapsed >= Duration::from_millis(150), "{elapsed:?}");
        assert!(elapsed < Duration::from_millis(600), "{elapsed:?}");
        assert_eq!(*log.lock(), vec!["close", "abort"]);
    }

    #[test]
    fn test_stop_escalates_to_immediate() {
        let shard = started(config());
        let log = Log::default();
        let beats = Arc::new(AtomicUsize::new(0));
        shard.register(TestConn::boxed(Closes::Never, &log, &beats));
        shard.post_async(|_| ()).wait_timeout(WAIT).unwrap();

        let begun = Instant::now();
        shard.stop(Duration::from_millis(300)).unwrap();
        let elapsed = begun.elapsed();
        assert!(elapsed >= Duration::from_millis(180), "{elapsed:?}");
        assert!(elapsed < Duration::from_secs(2), "{elapsed:?}");
        assert_eq!(log.lock()[..2], ["close", "abort"]);
        assert_eq!(shard.state(), ShardState::Stopped);
    }

    #[test]
    fn test_stop_times_out_on_blocked_loop() {
        let shard = started(config());
        shard.post(|_| thread::sleep(Duration::from_millis(1500)));
        shard.post_async(|_| ()); // queue something behind the blocker

        let begun = Instant::now();
        assert_eq!(shard.stop(Duration::from_millis(300)), Err(ShardError::StopTimedOut(0)));
        assert!(begun.elapsed() < Duration::from_secs(1));
    }

    #[test]
    fn test_queue_close_and_schedule() {
        let shard = started(config());
        let (tx, rx) = mpsc::channel();
        let tx2 = tx.clone();
        shard.schedule(move || tx.send("scheduled").unwrap());
        shard.queue_close(move || tx2.send("closed").unwrap());

        let mut got = vec![rx.recv_timeout(WAIT).unwrap(), rx.recv_timeout(WAIT).unwrap()];
        got.sort();
        assert_eq!(got, vec!["closed", "scheduled"]);
        shard.stop(Duration::from_secs(3)).unwrap();
    }

    #[test]
    fn test_walk_visits_connections() {
        let shard = started(config());
        let log = Log::default();
        let beats = Arc::new(AtomicUsize::new(0));
        for _ in 0..3 {
            shard.register(TestConn::boxed(Closes::OnRequest, &log, &beats));
        }
        let visited = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&visited);
        shard
            .walk(move |_conn| {
                counter.fetch_add(1, Ordering::SeqCst);
            })
            .wait_timeout(WAIT)
            .unwrap();
        assert_eq!(visited.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn test_portable_driver() {
        let shard = started(config().driver(DriverKind::Portable));
        assert_eq!(shard.post_async(|_| "ok").wait_timeout(WAIT), Ok("ok"));
        shard.stop(Duration::from_secs(3)).unwrap();
    }

    #[test]
    fn test_background_dispatch_leaves_loop_thread() {
        let shard = started(config().dispatch(DispatchMode::Background));
        let (tx, rx) = mpsc::channel();
        shard.dispatch(move || {
            let name = thread::current().name().map(str::to_string);
            tx.send(name).unwrap();
        });
        let name = rx.recv_timeout(WAIT).unwrap().unwrap();
        assert!(name.starts_with("shardwire-0-bg-"), "{name}");
        shard.stop(Duration::from_secs(3)).unwrap();
    }

    #[test]
    fn test_lease_outlives_shard() {
        let shard = started(config());
        let block = shard
            .post_async(|ctx| ctx.pool().lease())
            .wait_timeout(WAIT)
            .unwrap()
            .unwrap();
        shard.stop(Duration::from_secs(3)).unwrap();

        // Pool disposed with the shard; returning the block just frees it.
        assert_eq!(block.capacity(), 4032);
        drop(block);
    }
}
