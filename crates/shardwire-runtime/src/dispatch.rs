//! Dispatch strategies for user callbacks.
//!
//! A shard never runs slow user code inside its drain loop unless asked
//! to. [`ShardContext::dispatch`](crate::ShardContext::dispatch) hands the
//! callback to one of:
//!
//! - [`InlineDispatcher`]: run now, on the shard thread
//! - [`BackgroundDispatcher`]: queue to a fixed set of worker threads
//! - [`LoggingDispatcher`]: wrap another dispatcher, catch and log panics

use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use crossbeam_queue::SegQueue;
use parking_lot::{Condvar, Mutex};
use tracing::{debug, error, warn};

use crate::config::DispatchMode;
use crate::error::panic_message;

pub type Task = Box<dyn FnOnce() + Send + 'static>;

pub trait Dispatcher: Send + Sync {
    fn dispatch(&self, task: Task);

    fn name(&self) -> &'static str;
}

/// Build the dispatcher for `mode`.
pub fn create(mode: DispatchMode, threads: usize, shard: usize) -> std::io::Result<Arc<dyn Dispatcher>> {
    Ok(match mode {
        DispatchMode::Inline => Arc::new(InlineDispatcher),
        DispatchMode::Background => Arc::new(BackgroundDispatcher::new(threads, shard)?),
        DispatchMode::BackgroundLogged => {
            Arc::new(LoggingDispatcher::new(BackgroundDispatcher::new(threads, shard)?))
        }
    })
}

#[derive(Debug, Default, Clone, Copy)]
pub struct InlineDispatcher;

impl Dispatcher for InlineDispatcher {
    fn dispatch(&self, task: Task) {
        task();
    }

    fn name(&self) -> &'static str {
        "inline"
    }
}

struct BackgroundInner {
    queue: SegQueue<Task>,
    lock: Mutex<()>,
    cond: Condvar,
    shutdown: AtomicBool,
    panicked: AtomicUsize,
}

/// Fixed worker pool fed from a lock-free queue.
///
/// A panicking task is counted and its worker keeps running.
pub struct BackgroundDispatcher {
    inner: Arc<BackgroundInner>,
    handles: Vec<thread::JoinHandle<()>>,
}

impl BackgroundDispatcher {
    pub fn new(threads: usize, shard: usize) -> std::io::Result<Self> {
        let threads = threads.clamp(1, 64);
        let inner = Arc::new(BackgroundInner {
            queue: SegQueue::new(),
            lock: Mutex::new(()),
            cond: Condvar::new(),
            shutdown: AtomicBool::new(false),
            panicked: AtomicUsize::new(0),
        });

        let mut this = Self {
            inner,
            handles: Vec::with_capacity(threads),
        };
        for worker in 0..threads {
            let inner = Arc::clone(&this.inner);
            // On error `this` drops and joins the workers spawned so far.
            let handle = thread::Builder::new()
                .name(format!("shardwire-{shard}-bg-{worker}"))
                .spawn(move || worker_loop(inner))?;
            this.handles.push(handle);
        }
        Ok(this)
    }

    /// Tasks that panicked so far.
    pub fn panicked(&self) -> usize {
        self.inner.panicked.load(Ordering::Relaxed)
    }

    pub fn threads(&self) -> usize {
        self.handles.len()
    }
}

impl Dispatcher for BackgroundDispatcher {
    fn dispatch(&self, task: Task) {
        if self.inner.shutdown.load(Ordering::Acquire) {
            warn!("background dispatcher shut down, running task inline");
            task();
            return;
        }
        self.inner.queue.push(task);
        let _guard = self.inner.lock.lock();
        self.inner.cond.notify_one();
    }

    fn name(&self) -> &'static str {
        "background"
    }
}

impl Drop for BackgroundDispatcher {
    fn drop(&mut self) {
        self.inner.shutdown.store(true, Ordering::Release);
        {
            let _guard = self.inner.lock.lock();
            self.inner.cond.notify_all();
        }
        let me = thread::current().id();
        for handle in self.handles.drain(..) {
            // Dropped from inside one of our own tasks: can't join ourselves.
            if handle.thread().id() == me {
                continue;
            }
            let _ = handle.join();
        }
        debug!("background dispatcher stopped");
    }
}

fn worker_loop(inner: Arc<BackgroundInner>) {
    loop {
        match inner.queue.pop() {
            Some(task) => {
                if panic::catch_unwind(AssertUnwindSafe(task)).is_err() {
                    inner.panicked.fetch_add(1, Ordering::Relaxed);
                }
            }
            None => {
                if inner.shutdown.load(Ordering::Acquire) {
                    break;
                }
                let mut guard = inner.lock.lock();
                if inner.queue.is_empty() && !inner.shutdown.load(Ordering::Acquire) {
                    inner.cond.wait_for(&mut guard, Duration::from_millis(100));
                }
            }
        }
    }
}

/// Runs each task through `inner`, logging instead of propagating panics.
pub struct LoggingDispatcher<D> {
    inner: D,
}

impl<D: Dispatcher> LoggingDispatcher<D> {
    pub fn new(inner: D) -> Self {
        Self { inner }
    }

    pub fn inner(&self) -> &D {
        &self.inner
    }
}

impl<D: Dispatcher> Dispatcher for LoggingDispatcher<D> {
    fn dispatch(&self, task: Task) {
        self.inner.dispatch(Box::new(move || {
            if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(task)) {
                error!(reason = %panic_message(&*payload), "dispatched callback panicked");
            }
        }));
    }

    fn name(&self) -> &'static str {
        "logged"
    }
}
