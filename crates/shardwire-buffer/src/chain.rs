//! Owned block chains.

use std::fmt;

use crate::block::{Block, PooledBlock};
use crate::cursor::Cursor;
use crate::error::{BufferError, Result};
use crate::pool::BufferPool;

/// A leased head block and everything linked after it.
///
/// Appends go through `&self`, so one thread may append while others read
/// through cursors. Dropping the chain returns every block to its pool.
pub struct BlockChain {
    head: PooledBlock,
}

impl BlockChain {
    /// A chain of one empty block.
    pub fn new(pool: &BufferPool) -> Result<Self> {
        Ok(Self { head: pool.lease()? })
    }

    pub fn from_block(head: PooledBlock) -> Self {
        Self { head }
    }

    /// One block per segment, in order. Segments larger than a pooled
    /// block get a standalone block; empty segments give empty blocks.
    pub fn from_segments(pool: &BufferPool, segments: &[&[u8]]) -> Result<Self> {
        let first = segments.first().copied().unwrap_or_default();
        let chain = Self::from_block(pool.lease_with(first.len())?);
        {
            let head = chain.head();
            let mut writer = head.claim_tail(head.start())?;
            let n = writer.write(head.start(), first);
            writer.publish(head.start() + n);

            for segment in segments.iter().skip(1) {
                let block = pool.lease_with(segment.len())?;
                {
                    let mut fill = block.claim_tail(block.start())?;
                    let n = fill.write(block.start(), segment);
                    fill.publish(block.start() + n);
                }
                let next = writer.link(block);
                drop(writer);
                writer = next.claim_tail(next.end())?;
            }
        }
        Ok(chain)
    }

    #[inline]
    pub fn head(&self) -> &Block {
        &self.head
    }

    /// Cursor at the first readable byte.
    pub fn cursor(&self) -> Cursor<'_> {
        Cursor::new(&self.head)
    }

    /// Cursor at the end of the last block.
    pub fn end_cursor(&self) -> Cursor<'_> {
        let mut block: &Block = &self.head;
        while let Some(next) = block.next() {
            block = next;
        }
        // `end` only grows, so it is always a valid position.
        Cursor::at(block, block.end()).unwrap_or_else(|_| Cursor::new(block))
    }

    /// Readable bytes across the chain.
    pub fn len(&self) -> usize {
        self.blocks().map(Block::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.blocks().all(Block::is_empty)
    }

    pub fn block_count(&self) -> usize {
        self.blocks().count()
    }

    pub fn blocks(&self) -> impl Iterator<Item = &Block> {
        std::iter::successors(Some(self.head()), |b| b.next())
    }

    /// Append at the tail, leasing blocks as needed.
    pub fn append(&self, data: &[u8]) -> Result<()> {
        self.end_cursor().copy_from(data)
    }

    /// Drop `count` bytes from the front. Fully consumed head blocks go
    /// back to the pool.
    pub fn consume(&mut self, count: usize) -> Result<()> {
        let available = self.len();
        if count > available {
            return Err(BufferError::OutOfRange {
                requested: count,
                available,
            });
        }
        let mut remaining = count;
        loop {
            let in_head = self.head.len();
            if remaining < in_head || self.head.next().is_none() {
                let start = self.head.start() + remaining;
                self.head.block_mut().set_start(start);
                return Ok(());
            }
            remaining -= in_head;
            match self.head.take_next() {
                Some(next) => drop(std::mem::replace(&mut self.head, next)),
                None => return Ok(()),
            }
        }
    }

    pub fn to_vec(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.len());
        for block in self.blocks() {
            out.extend_from_slice(block.readable());
        }
        out
    }
}

impl fmt::Debug for BlockChain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BlockChain")
            .field("blocks", &self.block_count())
            .field("len", &self.len())
            .finish()
    }
}
