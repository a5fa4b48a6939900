//! Blocks and block leases.
//!
//! A [`Block`] is a fixed window of memory with a readable range
//! `[start, end)` and an optional owned successor. Readers on any thread
//! see a consistent prefix of a chain: the writer publishes `end` before
//! it links `next`, and readers load `next` before `end`.
//!
//! ```text
//!   data ┌──────────────────────────────────────────┐ capacity
//!        │ consumed │ readable       │ spare        │
//!        └──────────┴────────────────┴──────────────┘
//!                 start            end
//! ```
//!
//! Appending goes through a [`TailWriter`], a claim on the block's single
//! writer slot. Only the tail of a chain (no `next`) can be claimed, and
//! only at its current `end`.

use std::alloc::{alloc_zeroed, dealloc, Layout};
use std::fmt;
use std::mem::ManuallyDrop;
use std::ops::Deref;
use std::ptr::{self, NonNull};
use std::sync::atomic::{AtomicBool, AtomicPtr, AtomicUsize, Ordering};
use std::sync::Arc;

use shardwire_core::CACHE_LINE_SIZE;

use crate::error::{BufferError, Result};
use crate::pool::{self, PoolShared};
use crate::slab::Slab;

pub(crate) enum Backing {
    Slab(Arc<Slab>),
    Standalone(Layout),
}

pub struct Block {
    data: NonNull<u8>,
    capacity: usize,
    start: usize,
    end: AtomicUsize,
    next: AtomicPtr<Block>,
    writer: AtomicBool,
    pool: Arc<PoolShared>,
    backing: Backing,
}

// Safety: `data` points into memory kept alive by `backing`. Bytes below
// `end` are immutable while shared; bytes at or above `end` are only
// written by the holder of the `writer` claim. `start` changes only
// through `&mut Block`.
unsafe impl Send for Block {}
unsafe impl Sync for Block {}

impl Block {
    pub(crate) fn carved(slab: Arc<Slab>, pool: Arc<PoolShared>, offset: usize, len: usize) -> Self {
        debug_assert!(offset + len <= slab.len());
        // Safety: offset + len lies inside the slab region.
        let data = unsafe { NonNull::new_unchecked(slab.base().as_ptr().add(offset)) };
        Self {
            data,
            capacity: len,
            start: 0,
            end: AtomicUsize::new(0),
            next: AtomicPtr::new(ptr::null_mut()),
            writer: AtomicBool::new(false),
            pool,
            backing: Backing::Slab(slab),
        }
    }

    pub(crate) fn standalone(pool: Arc<PoolShared>, len: usize) -> Result<Self> {
        let failed = BufferError::SlabAllocation { len, errno: 0 };
        let layout = Layout::from_size_align(len.max(1), CACHE_LINE_SIZE).map_err(|_| failed.clone())?;
        // Safety: layout size is non-zero.
        let data = NonNull::new(unsafe { alloc_zeroed(layout) }).ok_or(failed)?;
        Ok(Self {
            data,
            capacity: len,
            start: 0,
            end: AtomicUsize::new(0),
            next: AtomicPtr::new(ptr::null_mut()),
            writer: AtomicBool::new(false),
            pool,
            backing: Backing::Standalone(layout),
        })
    }

    /// Usable bytes in this block.
    #[inline]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// First readable offset.
    #[inline]
    pub fn start(&self) -> usize {
        self.start
    }

    /// One past the last readable offset.
    #[inline]
    pub fn end(&self) -> usize {
        self.end.load(Ordering::Acquire)
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.end().saturating_sub(self.start)
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Bytes that can still be appended.
    #[inline]
    pub fn spare(&self) -> usize {
        self.capacity - self.end()
    }

    /// The successor in the chain, if one has been linked.
    #[inline]
    pub fn next(&self) -> Option<&Block> {
        let next = self.next.load(Ordering::Acquire);
        // Safety: a non-null `next` is a leaked `Box<Block>` owned by this
        // block; it lives until `take_next` or drop, both of which need
        // `&mut self`.
        unsafe { next.as_ref() }
    }

    /// The readable bytes `[start, end)`.
    pub fn readable(&self) -> &[u8] {
        let end = self.end();
        self.span(self.start.min(end), end)
    }

    /// Carved from a slab (as opposed to a standalone oversized block).
    #[inline]
    pub fn is_pooled(&self) -> bool {
        matches!(self.backing, Backing::Slab(_))
    }

    /// Id of the slab this block was carved from.
    pub fn slab_id(&self) -> Option<usize> {
        match &self.backing {
            Backing::Slab(slab) => Some(slab.id()),
            Backing::Standalone(_) => None,
        }
    }

    /// Address of the first byte of the block's window.
    #[inline]
    pub fn as_ptr(&self) -> *const u8 {
        self.data.as_ptr()
    }

    #[inline]
    pub(crate) fn pool(&self) -> &Arc<PoolShared> {
        &self.pool
    }

    #[inline]
    pub(crate) fn slab_active(&self) -> bool {
        match &self.backing {
            Backing::Slab(slab) => slab.is_active(),
            Backing::Standalone(_) => false,
        }
    }

    /// Bytes `[from, to)` of the block window.
    ///
    /// Callers keep `to` at or below a previously loaded `end()`.
    #[inline]
    pub(crate) fn span(&self, from: usize, to: usize) -> &[u8] {
        assert!(from <= to && to <= self.capacity, "span {from}..{to} outside block of {}", self.capacity);
        // Safety: in bounds of the window, and bytes below `end` are never
        // written while the block is shared.
        unsafe { std::slice::from_raw_parts(self.data.as_ptr().add(from), to - from) }
    }

    pub(crate) fn set_start(&mut self, start: usize) {
        debug_assert!(start <= self.end());
        self.start = start;
    }

    pub(crate) fn reset(&mut self) {
        debug_assert!(self.next.get_mut().is_null());
        self.start = 0;
        *self.end.get_mut() = 0;
        *self.writer.get_mut() = false;
    }

    pub(crate) fn take_next(&mut self) -> Option<Box<Block>> {
        let next = std::mem::replace(self.next.get_mut(), ptr::null_mut());
        // Safety: a non-null `next` was produced by `Box::into_raw` in `link`.
        NonNull::new(next).map(|p| unsafe { Box::from_raw(p.as_ptr()) })
    }

    /// Claim the writer slot for an append starting at `at`.
    pub(crate) fn claim_tail(&self, at: usize) -> Result<TailWriter<'_>> {
        if self
            .writer
            .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_err()
        {
            return Err(BufferError::WriterBusy);
        }
        let writer = TailWriter { block: self };
        if self.next().is_some() || self.end() != at {
            return Err(BufferError::NotAtTail);
        }
        Ok(writer)
    }
}

impl Drop for Block {
    fn drop(&mut self) {
        let mut next = self.take_next();
        while let Some(mut block) = next {
            next = block.take_next();
        }
        if let Backing::Standalone(layout) = self.backing {
            // Safety: allocated in `standalone` with this layout.
            unsafe { dealloc(self.data.as_ptr(), layout) };
        }
    }
}

impl fmt::Debug for Block {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Block")
            .field("ptr", &self.data)
            .field("capacity", &self.capacity)
            .field("start", &self.start)
            .field("end", &self.end())
            .field("has_next", &self.next().is_some())
            .field("slab", &self.slab_id())
            .finish()
    }
}

/// Exclusive right to append to the tail block of a chain.
pub(crate) struct TailWriter<'a> {
    block: &'a Block,
}

impl<'a> TailWriter<'a> {
    #[inline]
    pub(crate) fn block(&self) -> &'a Block {
        self.block
    }

    /// Copy as much of `src` as fits at offset `at`, without publishing it.
    pub(crate) fn write(&mut self, at: usize, src: &[u8]) -> usize {
        let block = self.block;
        assert!(at >= block.end.load(Ordering::Relaxed) && at <= block.capacity);
        let n = src.len().min(block.capacity - at);
        // Safety: [at, at + n) is past `end`, inside the window, and this
        // writer holds the block's only write claim.
        unsafe { ptr::copy_nonoverlapping(src.as_ptr(), block.data.as_ptr().add(at), n) };
        n
    }

    /// Make bytes up to `end` visible to readers.
    #[inline]
    pub(crate) fn publish(&self, end: usize) {
        debug_assert!(end <= self.block.capacity);
        self.block.end.store(end, Ordering::Release);
    }

    /// Attach `next` as this block's successor and return it.
    pub(crate) fn link(&self, next: PooledBlock) -> &'a Block {
        let raw = Box::into_raw(next.into_box());
        self.block.next.store(raw, Ordering::Release);
        // Safety: `raw` is now owned by `self.block`, which outlives 'a.
        unsafe { &*raw }
    }
}

impl Drop for TailWriter<'_> {
    fn drop(&mut self) {
        self.block.writer.store(false, Ordering::Release);
    }
}

/// A leased block (and anything chained after it).
///
/// Dropping the lease returns every block in the chain to the pool it was
/// leased from. This is safe from any thread.
pub struct PooledBlock {
    block: ManuallyDrop<Box<Block>>,
}

impl PooledBlock {
    pub(crate) fn new(block: Box<Block>) -> Self {
        Self {
            block: ManuallyDrop::new(block),
        }
    }

    pub(crate) fn into_box(self) -> Box<Block> {
        let mut this = ManuallyDrop::new(self);
        // Safety: `this` is never dropped, so the box is taken exactly once.
        unsafe { ManuallyDrop::take(&mut this.block) }
    }

    #[inline]
    pub(crate) fn block_mut(&mut self) -> &mut Block {
        &mut self.block
    }

    /// Detach the rest of the chain, leaving this block as its own tail.
    pub fn take_next(&mut self) -> Option<PooledBlock> {
        self.block.take_next().map(PooledBlock::new)
    }
}

impl Deref for PooledBlock {
    type Target = Block;

    #[inline]
    fn deref(&self) -> &Block {
        &self.block
    }
}

impl Drop for PooledBlock {
    fn drop(&mut self) {
        // Safety: drop runs once and `into_box` bypasses it.
        let block = unsafe { ManuallyDrop::take(&mut self.block) };
        pool::release_chain(block);
    }
}

impl fmt::Debug for PooledBlock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(&**self.block, f)
    }
}
