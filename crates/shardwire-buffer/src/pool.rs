//! Slab-backed block pool.
//!
//! ```text
//!  lease() ──▶ free list (SegQueue) ──hit──▶ PooledBlock
//!                  │ miss
//!                  ▼
//!             allocate slab, carve N blocks:
//!               N-1 ──▶ free list,  last ──▶ caller
//!
//!  drop(PooledBlock) ──▶ return_block ──▶ reset + push   (slab active)
//!                                    └──▶ drop            (pool disposed)
//! ```
//!
//! Leasing is intended for the owning shard thread; returns may come from
//! any thread. The lock around the slab list is only taken when a new slab
//! is carved or the pool is disposed.

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crossbeam_queue::SegQueue;
use parking_lot::{Condvar, Mutex};
use shardwire_core::CACHE_LINE_SIZE;
use tracing::{debug, warn};

use crate::block::{Block, PooledBlock};
use crate::config::PoolConfig;
use crate::error::{BufferError, Result};
use crate::slab::Slab;

/// Point-in-time pool counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PoolStats {
    /// Slabs currently owned by the pool.
    pub slabs: usize,
    /// Blocks carved from those slabs.
    pub carved: usize,
    /// Slab blocks sitting in the free list.
    pub free: usize,
    /// Slab blocks currently leased out.
    pub leased: usize,
    /// Standalone blocks currently leased out.
    pub oversized_leased: usize,
}

pub(crate) struct PoolShared {
    config: PoolConfig,
    free: SegQueue<Box<Block>>,
    slabs: Mutex<Vec<Arc<Slab>>>,
    next_slab_id: AtomicUsize,
    disposed: AtomicBool,
    carved: AtomicUsize,
    leased: AtomicUsize,
    oversized_leased: AtomicUsize,
    idle_lock: Mutex<()>,
    idle: Condvar,
}

impl PoolShared {
    fn new(config: PoolConfig) -> Self {
        Self {
            config,
            free: SegQueue::new(),
            slabs: Mutex::new(Vec::new()),
            next_slab_id: AtomicUsize::new(0),
            disposed: AtomicBool::new(false),
            carved: AtomicUsize::new(0),
            leased: AtomicUsize::new(0),
            oversized_leased: AtomicUsize::new(0),
            idle_lock: Mutex::new(()),
            idle: Condvar::new(),
        }
    }

    #[inline]
    fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::Acquire)
    }

    pub(crate) fn lease(self: &Arc<Self>) -> Result<PooledBlock> {
        if self.is_disposed() {
            return Err(BufferError::PoolDisposed);
        }
        let block = match self.free.pop() {
            Some(block) => block,
            None => self.carve_slab()?,
        };
        self.leased.fetch_add(1, Ordering::AcqRel);
        Ok(PooledBlock::new(block))
    }

    fn lease_with(self: &Arc<Self>, min_len: usize) -> Result<PooledBlock> {
        if min_len <= self.config.pooled_limit() {
            return self.lease();
        }
        if self.is_disposed() {
            return Err(BufferError::PoolDisposed);
        }
        let block = Box::new(Block::standalone(Arc::clone(self), min_len)?);
        self.oversized_leased.fetch_add(1, Ordering::AcqRel);
        debug!(len = min_len, "leased standalone block");
        Ok(PooledBlock::new(block))
    }

    /// Allocate a slab, push all but the last carved block to the free list
    /// and hand the last one back.
    fn carve_slab(self: &Arc<Self>) -> Result<Box<Block>> {
        let slab_len = self.config.slab_length();
        let block_len = self.config.block_length();
        let stride = self.config.block_stride;

        let id = self.next_slab_id.fetch_add(1, Ordering::Relaxed);
        let slab = Arc::new(Slab::allocate(id, slab_len)?);

        // First block starts on a cache line; the stride keeps the rest there.
        let base = slab.base().as_ptr() as usize;
        let mut offset = (CACHE_LINE_SIZE - base % CACHE_LINE_SIZE) % CACHE_LINE_SIZE;

        let mut last: Option<Box<Block>> = None;
        let mut count = 0;
        while offset + block_len <= slab_len {
            let block = Box::new(Block::carved(Arc::clone(&slab), Arc::clone(self), offset, block_len));
            if let Some(prev) = last.replace(block) {
                self.free.push(prev);
            }
            offset += stride;
            count += 1;
        }

        let last = last.ok_or(BufferError::SlabTooSmall { slab_len, block_len })?;
        self.carved.fetch_add(count, Ordering::AcqRel);
        self.slabs.lock().push(slab);
        debug!(slab = id, blocks = count, "carved new slab");
        Ok(last)
    }

    fn return_block(&self, mut block: Box<Block>) {
        if block.is_pooled() {
            if block.slab_active() && !self.is_disposed() {
                block.reset();
                self.free.push(block);
                if self.is_disposed() {
                    // Lost a race with dispose; don't strand the block.
                    while self.free.pop().is_some() {}
                }
            }
            // Blocks of a disposed pool are simply dropped.
            let prev = self.leased.fetch_sub(1, Ordering::AcqRel);
            if prev == 1 {
                let _guard = self.idle_lock.lock();
                self.idle.notify_all();
            }
        } else {
            self.oversized_leased.fetch_sub(1, Ordering::AcqRel);
        }
    }

    fn dispose(&self) {
        if self.disposed.swap(true, Ordering::AcqRel) {
            return;
        }
        let slabs = std::mem::take(&mut *self.slabs.lock());
        for slab in &slabs {
            slab.deactivate();
        }
        let slab_count = slabs.len();
        drop(slabs);
        self.carved.store(0, Ordering::Release);

        // Free blocks hold the last references to their slabs (and to us).
        while self.free.pop().is_some() {}

        let leased = self.leased.load(Ordering::Acquire);
        let oversized = self.oversized_leased.load(Ordering::Acquire);
        if leased + oversized > 0 {
            warn!(leased, oversized, "buffer pool disposed with blocks still leased");
        }
        debug!(slabs = slab_count, "buffer pool disposed");
    }

    fn stats(&self) -> PoolStats {
        let slabs = self.slabs.lock().len();
        PoolStats {
            slabs,
            carved: self.carved.load(Ordering::Acquire),
            free: self.free.len(),
            leased: self.leased.load(Ordering::Acquire),
            oversized_leased: self.oversized_leased.load(Ordering::Acquire),
        }
    }
}

/// Return every block of a chain to its pool, iteratively.
pub(crate) fn release_chain(head: Box<Block>) {
    let mut current = Some(head);
    while let Some(mut block) = current {
        current = block.take_next();
        let pool = Arc::clone(block.pool());
        pool.return_block(block);
    }
}

/// Owner handle of a block pool.
///
/// Dropping the handle disposes the pool. Outstanding leases stay valid
/// and are freed when they are dropped.
pub struct BufferPool {
    shared: Arc<PoolShared>,
}

impl BufferPool {
    /// A pool with the given geometry. Fails with `BufferError::Config`
    /// if `config` does not validate.
    pub fn new(config: PoolConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self::with_valid_config(config))
    }

    fn with_valid_config(config: PoolConfig) -> Self {
        Self {
            shared: Arc::new(PoolShared::new(config)),
        }
    }

    #[inline]
    pub fn config(&self) -> &PoolConfig {
        &self.shared.config
    }

    /// Lease one pooled block with `start == end == 0` and no successor.
    pub fn lease(&self) -> Result<PooledBlock> {
        self.shared.lease()
    }

    /// Lease a block with at least `min_len` usable bytes. Requests above
    /// the pooled limit get a standalone allocation that is freed, not
    /// recycled, on return.
    pub fn lease_with(&self, min_len: usize) -> Result<PooledBlock> {
        self.shared.lease_with(min_len)
    }

    /// Explicitly return a block (and its chain).
    ///
    /// Fails with `ForeignBlock` if the block was leased from another pool;
    /// it is then released to its own pool instead.
    pub fn return_block(&self, block: PooledBlock) -> Result<()> {
        if !self.owns(&block) {
            return Err(BufferError::ForeignBlock);
        }
        drop(block);
        Ok(())
    }

    #[inline]
    pub fn owns(&self, block: &Block) -> bool {
        Arc::ptr_eq(block.pool(), &self.shared)
    }

    /// Release all slabs. Idempotent. Later leases fail with
    /// `PoolDisposed`.
    pub fn dispose(&self) {
        self.shared.dispose();
    }

    #[inline]
    pub fn is_disposed(&self) -> bool {
        self.shared.is_disposed()
    }

    pub fn stats(&self) -> PoolStats {
        self.shared.stats()
    }

    /// Block until every pooled lease has been returned, or `timeout`
    /// passes. Returns whether the pool went idle.
    pub fn wait_until_returned(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let shared = &self.shared;
        let mut guard = shared.idle_lock.lock();
        loop {
            if shared.leased.load(Ordering::Acquire) == 0 {
                return true;
            }
            if shared.idle.wait_until(&mut guard, deadline).timed_out() {
                return shared.leased.load(Ordering::Acquire) == 0;
            }
        }
    }
}

impl Default for BufferPool {
    fn default() -> Self {
        Self::with_valid_config(PoolConfig::default())
    }
}

impl Drop for BufferPool {
    fn drop(&mut self) {
        self.shared.dispose();
    }
}

impl fmt::Debug for BufferPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BufferPool")
            .field("disposed", &self.is_disposed())
            .field("stats", &self.stats())
            .finish()
    }
}
