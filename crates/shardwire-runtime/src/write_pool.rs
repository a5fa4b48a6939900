//! Per-shard pool of reusable write requests.
//!
//! A [`WriteRequest`] gathers the spans of a block chain into an
//! `IoSlice` vector and writes them with vectored I/O. The vector's
//! allocation is the expensive part, so finished requests go back to a
//! bounded pool on their shard instead of being dropped.

use std::fmt;
use std::io::{self, IoSlice, Write};

use crossbeam_queue::ArrayQueue;
use shardwire_buffer::Cursor;
use shardwire_core::ShardId;
use tracing::trace;

use crate::error::{Result, ShardError};

pub struct WriteRequest {
    shard: ShardId,
    slices: Vec<IoSlice<'static>>,
    writes: u64,
}

impl WriteRequest {
    fn new(shard: ShardId) -> Self {
        Self {
            shard,
            slices: Vec::new(),
            writes: 0,
        }
    }

    /// Shard this request is bound to.
    #[inline]
    pub fn shard(&self) -> ShardId {
        self.shard
    }

    /// Completed `write_chain` calls over this request's lifetime.
    #[inline]
    pub fn writes(&self) -> u64 {
        self.writes
    }

    /// Write every byte between `start` and `end` to `sink`.
    ///
    /// Returns the number of bytes written. Retries on short writes and
    /// `Interrupted`; any other error is returned as-is.
    pub fn write_chain<W: Write + ?Sized>(&mut self, sink: &mut W, start: &Cursor<'_>, end: &Cursor<'_>) -> io::Result<usize> {
        let segments = start
            .segments_to(end)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;
        let total = segments.remaining();

        let mut slices = recycle(std::mem::take(&mut self.slices));
        slices.extend(segments.map(IoSlice::new));
        let result = write_all_vectored(sink, &mut slices);
        self.slices = recycle(slices);

        result?;
        self.writes += 1;
        Ok(total)
    }
}

impl fmt::Debug for WriteRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WriteRequest")
            .field("shard", &self.shard)
            .field("writes", &self.writes)
            .finish()
    }
}

/// Reuse a slice vector's allocation under a new lifetime.
fn recycle<'a>(mut slices: Vec<IoSlice<'_>>) -> Vec<IoSlice<'a>> {
    slices.clear();
    // Empty, so nothing is converted; collect reuses the allocation.
    slices.into_iter().map(|_| IoSlice::new(&[])).collect()
}

fn write_all_vectored<W: Write + ?Sized>(sink: &mut W, mut slices: &mut [IoSlice<'_>]) -> io::Result<()> {
    while !slices.is_empty() {
        match sink.write_vectored(slices) {
            Ok(0) => return Err(io::ErrorKind::WriteZero.into()),
            Ok(n) => IoSlice::advance_slices(&mut slices, n),
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) => return Err(e),
        }
    }
    Ok(())
}

/// Bounded pool of [`WriteRequest`]s for one shard.
pub struct WriteRequestPool {
    shard: ShardId,
    free: ArrayQueue<WriteRequest>,
    disposed: bool,
    created: usize,
}

impl WriteRequestPool {
    pub fn new(shard: ShardId, capacity: usize) -> Self {
        Self {
            shard,
            free: ArrayQueue::new(capacity.max(1)),
            disposed: false,
            created: 0,
        }
    }

    #[inline]
    pub fn shard(&self) -> ShardId {
        self.shard
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        self.free.capacity()
    }

    /// Requests waiting for reuse.
    #[inline]
    pub fn available(&self) -> usize {
        self.free.len()
    }

    /// Requests created since the pool was built.
    #[inline]
    pub fn created(&self) -> usize {
        self.created
    }

    /// A pooled request, or a fresh one bound to this shard.
    pub fn allocate(&mut self) -> Result<WriteRequest> {
        if self.disposed {
            return Err(ShardError::WritePoolDisposed);
        }
        if let Some(request) = self.free.pop() {
            return Ok(request);
        }
        self.created += 1;
        Ok(WriteRequest::new(self.shard))
    }

    /// Keep `request` for reuse, or drop it if the pool is full.
    pub fn return_request(&mut self, request: WriteRequest) -> Result<()> {
        if self.disposed {
            return Err(ShardError::WritePoolDisposed);
        }
        if request.shard != self.shard {
            return Err(ShardError::ForeignWriteRequest {
                owner: request.shard,
                shard: self.shard,
            });
        }
        if let Err(request) = self.free.push(request) {
            trace!(shard = self.shard, "write request pool full, dropping request");
            drop(request);
        }
        Ok(())
    }

    /// Drop every pooled request. Later calls fail with
    /// `WritePoolDisposed`.
    pub fn dispose(&mut self) {
        if self.disposed {
            return;
        }
        self.disposed = true;
        while self.free.pop().is_some() {}
    }

    #[inline]
    pub fn is_disposed(&self) -> bool {
        self.disposed
    }
}

impl fmt::Debug for WriteRequestPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WriteRequestPool")
            .field("shard", &self.shard)
            .field("available", &self.available())
            .field("capacity", &self.capacity())
            .field("disposed", &self.disposed)
            .finish()
    }
}
