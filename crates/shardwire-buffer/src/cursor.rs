//! Cursor over a block chain.
//!
//! A [`Cursor`] is a `(block, index)` pair. It is `Copy`: saving a
//! position is just keeping a copy. All read operations observe the chain
//! as of the moment they load each block's `next`/`end`, so a reader on one
//! thread can follow a writer appending on another.
//!
//! Invariant: `block.start() <= index <= block.end()`.

use std::fmt;
use std::ptr;

use crate::block::Block;
use crate::error::{BufferError, Result};
use crate::scan::{self, Needles, ScanMode};

#[derive(Clone, Copy)]
pub struct Cursor<'a> {
    block: &'a Block,
    index: usize,
}

impl<'a> Cursor<'a> {
    /// Cursor at the first readable byte of `block`.
    pub fn new(block: &'a Block) -> Self {
        Self {
            block,
            index: block.start(),
        }
    }

    /// Cursor at an explicit offset, which must lie in `[start, end]`.
    pub fn at(block: &'a Block, index: usize) -> Result<Self> {
        if index < block.start() || index > block.end() {
            return Err(BufferError::OutOfRange {
                requested: index,
                available: block.end(),
            });
        }
        Ok(Self { block, index })
    }

    #[inline]
    pub fn block(&self) -> &'a Block {
        self.block
    }

    #[inline]
    pub fn index(&self) -> usize {
        self.index
    }

    /// Same block and same offset.
    #[inline]
    pub fn same_position(&self, other: &Cursor<'_>) -> bool {
        ptr::eq(self.block, other.block) && self.index == other.index
    }

    /// No readable byte remains, now, anywhere after the cursor.
    pub fn is_end(&self) -> bool {
        let mut block = self.block;
        let mut index = self.index;
        loop {
            let next = block.next();
            if index < block.end() {
                return false;
            }
            match next {
                Some(n) => {
                    block = n;
                    index = n.start();
                }
                None => return true,
            }
        }
    }

    /// Read one byte and advance past it. At the end of the chain the
    /// cursor does not move.
    pub fn take(&mut self) -> Option<u8> {
        let mut block = self.block;
        let mut index = self.index;
        loop {
            let next = block.next();
            let end = block.end();
            if index < end {
                let byte = block.span(index, index + 1)[0];
                self.block = block;
                self.index = index + 1;
                return Some(byte);
            }
            let n = next?;
            block = n;
            index = n.start();
        }
    }

    /// The byte `take` would return, without moving.
    pub fn peek(&self) -> Option<u8> {
        let mut ahead = *self;
        ahead.take()
    }

    /// The next 8 bytes as a little-endian `u64`, looking at most one block
    /// ahead. `None` when fewer than 8 bytes are reachable that way.
    pub fn peek_long(&self) -> Option<u64> {
        let next = self.block.next();
        let end = self.block.end();
        let tail = self.block.span(self.index.min(end), end);
        if tail.len() >= 8 {
            return Some(read_le(&tail[..8]));
        }

        let head = next?.readable();
        let need = 8 - tail.len();
        if head.len() < need {
            return None;
        }
        if tail.is_empty() {
            return Some(read_le(&head[..8]));
        }
        let lo = pack_le(tail);
        let hi = pack_le(&head[..need]);
        Some(lo | (hi << (tail.len() * 8)))
    }

    /// Advance by `count` bytes. On error the cursor is unchanged.
    pub fn skip(&mut self, count: usize) -> Result<()> {
        let mut block = self.block;
        let mut index = self.index;
        let mut remaining = count;
        loop {
            let next = block.next();
            let following = block.end().saturating_sub(index);
            if remaining <= following {
                self.block = block;
                self.index = index + remaining;
                return Ok(());
            }
            let Some(n) = next else {
                return Err(BufferError::OutOfRange {
                    requested: count,
                    available: count - remaining + following,
                });
            };
            remaining -= following;
            block = n;
            index = n.start();
        }
    }

    /// Find the first byte matching `needles`, scanning at most `limit`
    /// bytes (`None` for unbounded).
    ///
    /// On a match the cursor is left on the matching byte and the byte is
    /// returned. Otherwise the cursor ends `limit` bytes ahead, or at the
    /// end of the chain if that comes first.
    pub fn seek(&mut self, needles: impl Into<Needles>, limit: Option<usize>) -> Option<u8> {
        self.seek_with(ScanMode::detect(), needles, limit)
    }

    /// [`seek`](Self::seek) with an explicit scan strategy.
    pub fn seek_with(&mut self, mode: ScanMode, needles: impl Into<Needles>, limit: Option<usize>) -> Option<u8> {
        let needles = needles.into();
        let mut budget = limit.unwrap_or(usize::MAX);
        let mut block = self.block;
        let mut index = self.index;

        loop {
            let next = block.next();
            let end = block.end();
            let span = block.span(index.min(end), end);
            let window = &span[..span.len().min(budget)];

            if let Some(pos) = scan::find(mode, window, needles) {
                self.block = block;
                self.index = index + pos;
                return Some(window[pos]);
            }
            index += window.len();
            budget -= window.len();

            if budget == 0 {
                break;
            }
            match next {
                Some(n) => {
                    block = n;
                    index = n.start();
                }
                None => break,
            }
        }

        self.block = block;
        self.index = index;
        None
    }

    /// Seek, bounded by another cursor further along the same chain.
    pub fn seek_until(&mut self, needles: impl Into<Needles>, bound: &Cursor<'_>) -> Result<Option<u8>> {
        let limit = self.get_length(bound)?;
        Ok(self.seek(needles, Some(limit)))
    }

    /// Bytes between `self` and `other`. Fails if `other` is not reachable
    /// by walking forward from `self`.
    pub fn get_length(&self, other: &Cursor<'_>) -> Result<usize> {
        let mut block = self.block;
        let mut index = self.index;
        let mut length = 0;
        loop {
            if ptr::eq(block, other.block) {
                return other
                    .index
                    .checked_sub(index)
                    .map(|d| length + d)
                    .ok_or(BufferError::Unreachable);
            }
            let next = block.next().ok_or(BufferError::Unreachable)?;
            length += block.end().saturating_sub(index);
            block = next;
            index = next.start();
        }
    }

    /// Copy up to `dest.len()` bytes. Returns the count copied and the
    /// position just past them. `self` does not move.
    pub fn copy_to(&self, dest: &mut [u8]) -> (usize, Cursor<'a>) {
        let mut block = self.block;
        let mut index = self.index;
        let mut copied = 0;
        loop {
            let next = block.next();
            let end = block.end();
            let following = end.saturating_sub(index);
            let wanted = dest.len() - copied;

            if wanted <= following {
                dest[copied..].copy_from_slice(block.span(index, index + wanted));
                return (dest.len(), Cursor { block, index: index + wanted });
            }
            dest[copied..copied + following].copy_from_slice(block.span(index, end));
            copied += following;

            match next {
                Some(n) => {
                    block = n;
                    index = n.start();
                }
                None => return (copied, Cursor { block, index: end }),
            }
        }
    }

    /// Append `data` at the cursor, leasing new blocks from the tail
    /// block's pool as each one fills. The cursor must sit at the end of
    /// the last block; it is left at the end of the appended bytes.
    ///
    /// If a lease fails partway, the bytes written so far stay published
    /// and the cursor is left just past them.
    pub fn copy_from(&mut self, data: &[u8]) -> Result<()> {
        let mut writer = self.block.claim_tail(self.index)?;
        let mut block = self.block;
        let mut index = self.index;
        let mut rest = data;

        while !rest.is_empty() {
            if index == block.capacity() {
                writer.publish(index);
                let fresh = match block.pool().lease() {
                    Ok(fresh) => fresh,
                    Err(e) => {
                        self.block = block;
                        self.index = index;
                        return Err(e);
                    }
                };
                let next = writer.link(fresh);
                drop(writer);
                block = next;
                index = next.start();
                writer = block.claim_tail(index)?;
            }
            let n = writer.write(index, rest);
            index += n;
            rest = &rest[n..];
        }
        writer.publish(index);
        debug_assert!(ptr::eq(writer.block(), block));

        self.block = block;
        self.index = index;
        Ok(())
    }

    /// Append one byte; see [`copy_from`](Self::copy_from).
    pub fn put(&mut self, byte: u8) -> Result<()> {
        self.copy_from(&[byte])
    }

    /// The readable byte spans from `self` up to `end`.
    pub fn segments_to(&self, end: &Cursor<'a>) -> Result<Segments<'a>> {
        let total = self.get_length(end)?;
        Ok(Segments {
            block: Some(self.block),
            index: self.index,
            end: *end,
            remaining: total,
        })
    }
}

impl fmt::Debug for Cursor<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Cursor")
            .field("block", &self.block.as_ptr())
            .field("index", &self.index)
            .finish()
    }
}

/// Iterator over the contiguous spans between two cursors.
pub struct Segments<'a> {
    block: Option<&'a Block>,
    index: usize,
    end: Cursor<'a>,
    remaining: usize,
}

impl<'a> Segments<'a> {
    /// Total bytes not yet yielded.
    pub fn remaining(&self) -> usize {
        self.remaining
    }
}

impl<'a> Iterator for Segments<'a> {
    type Item = &'a [u8];

    fn next(&mut self) -> Option<&'a [u8]> {
        while let Some(block) = self.block {
            let last = ptr::eq(block, self.end.block);
            let stop = if last { self.end.index } else { block.end() };
            let span = block.span(self.index.min(stop), stop);

            if last {
                self.block = None;
            } else {
                self.block = block.next();
                self.index = self.block.map_or(0, Block::start);
            }
            if !span.is_empty() {
                self.remaining -= span.len();
                return Some(span);
            }
        }
        None
    }
}

#[inline]
fn read_le(bytes: &[u8]) -> u64 {
    let mut word = [0u8; 8];
    word.copy_from_slice(bytes);
    u64::from_le_bytes(word)
}

#[inline]
fn pack_le(bytes: &[u8]) -> u64 {
    bytes.iter().rev().fold(0, |acc, &b| (acc << 8) | b as u64)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{BlockChain, BufferPool, PoolConfig};
    use proptest::prelude::*;
    use std::sync::Arc;
    use std::thread;

    fn chain(pool: &BufferPool, parts: &[&[u8]]) -> BlockChain {
        BlockChain::from_segments(pool, parts).unwrap()
    }

    #[test]
    fn test_take_crosses_empty_blocks() {
        let pool = BufferPool::default();
        let chain = chain(&pool, &[b"ab", b"", b"", b"c"]);
        let mut cursor = chain.cursor();

        assert_eq!(cursor.take(), Some(b'a'));
        assert_eq!(cursor.take(), Some(b'b'));
        assert_eq!(cursor.peek(), Some(b'c'));
        assert_eq!(cursor.take(), Some(b'c'));

        let at_end = cursor;
        assert_eq!(cursor.take(), None);
        assert!(cursor.same_position(&at_end));
        assert!(cursor.is_end());
    }

    #[test]
    fn test_peek_long_straddles_boundary() {
        let data: Vec<u8> = (1..=16).collect();
        let expected = u64::from_le_bytes(data[..8].try_into().unwrap());
        let pool = BufferPool::default();

        for split in 0..=8 {
            let chain = chain(&pool, &[&data[..split], &data[split..]]);
            assert_eq!(chain.cursor().peek_long(), Some(expected), "split at {split}");

            // Same value when the straddle comes after a skipped prefix.
            let mut prefixed = vec![0xEE; 5];
            prefixed.extend_from_slice(&data[..split]);
            let chain = chain_with_prefix(&pool, &prefixed, &data[split..]);
            let mut cursor = chain.cursor();
            cursor.skip(5).unwrap();
            assert_eq!(cursor.peek_long(), Some(expected), "prefixed split at {split}");
        }
    }

    fn chain_with_prefix(pool: &BufferPool, first: &[u8], second: &[u8]) -> BlockChain {
        chain(pool, &[first, second])
    }

    #[test]
    fn test_peek_long_needs_eight_bytes() {
        let pool = BufferPool::default();
        let short = chain(&pool, &[b"GET /"]);
        assert_eq!(short.cursor().peek_long(), None);

        // Only one block of lookahead is used.
        let spread = chain(&pool, &[b"GET", b"", b" /index"]);
        assert_eq!(spread.cursor().peek_long(), None);
    }

    #[test]
    fn test_skip_is_all_or_nothing() {
        let pool = BufferPool::default();
        let chain = chain(&pool, &[b"abc", b"defg"]);
        let mut cursor = chain.cursor();

        cursor.skip(3).unwrap();
        // Landing exactly on a block end stays in that block.
        assert!(ptr::eq(cursor.block(), chain.head()));
        assert_eq!(cursor.index(), 3);

        let before = cursor;
        let err = cursor.skip(5).unwrap_err();
        assert_eq!(err, BufferError::OutOfRange { requested: 5, available: 4 });
        assert!(cursor.same_position(&before));

        cursor.skip(4).unwrap();
        assert!(cursor.is_end());
    }

    #[test]
    fn test_seek_moves_into_next_block() {
        let pool = BufferPool::default();
        let chain = chain(&pool, &[b"abc", b"\nxyz"]);
        let second = chain.head().next().unwrap();

        let mut cursor = chain.cursor();
        cursor.skip(3).unwrap();
        for mode in [ScanMode::Scalar, ScanMode::Vector] {
            let mut ahead = cursor;
            assert_eq!(ahead.seek_with(mode, b'\n', None), Some(b'\n'));
            assert!(ptr::eq(ahead.block(), second));
            assert_eq!(ahead.index(), second.start());
        }
    }

    #[test]
    fn test_seek_limit() {
        let pool = BufferPool::default();
        let chain = chain(&pool, &[b"hello", b" world"]);

        let mut cursor = chain.cursor();
        assert_eq!(cursor.seek(b' ', Some(5)), None);
        // Stopped after exactly five bytes.
        assert_eq!(cursor.index(), 5);
        assert!(ptr::eq(cursor.block(), chain.head()));

        let mut cursor = chain.cursor();
        assert_eq!(cursor.seek(b' ', Some(6)), Some(b' '));

        let mut cursor = chain.cursor();
        assert_eq!(cursor.seek(b' ', Some(0)), None);
        assert_eq!(cursor.index(), 0);

        let mut cursor = chain.cursor();
        assert_eq!(cursor.seek([b'#', b'?', b'!'], None), None);
        assert!(cursor.is_end());
        assert_eq!(cursor.index(), cursor.block().end());
    }

    #[test]
    fn test_seek_until_bound() {
        let pool = BufferPool::default();
        let chain = chain(&pool, &[b"key=va", b"lue;next"]);

        let mut bound = chain.cursor();
        bound.seek(b';', None).unwrap();

        let mut cursor = chain.cursor();
        assert_eq!(cursor.seek_until(b'=', &bound).unwrap(), Some(b'='));
        cursor.skip(1).unwrap();
        assert_eq!(cursor.seek_until(b'x', &bound).unwrap(), None);
        assert_eq!(cursor.get_length(&bound).unwrap(), 0);

        // A bound behind the cursor is not reachable.
        let start = chain.cursor();
        assert_eq!(cursor.seek_until(b'k', &start), Err(BufferError::Unreachable));
    }

    #[test]
    fn test_get_length() {
        let pool = BufferPool::default();
        let a = chain(&pool, &[b"0123", b"", b"4567", b"89"]);
        let b = chain(&pool, &[b"x"]);

        let start = a.cursor();
        let end = a.end_cursor();
        assert_eq!(start.get_length(&end).unwrap(), 10);
        assert_eq!(end.get_length(&end).unwrap(), 0);
        assert_eq!(end.get_length(&start), Err(BufferError::Unreachable));
        assert_eq!(start.get_length(&b.cursor()), Err(BufferError::Unreachable));
    }

    #[test]
    fn test_copy_to_partial_and_full() {
        let pool = BufferPool::default();
        let chain = chain(&pool, &[b"abc", b"", b"defgh"]);
        let cursor = chain.cursor();

        let mut small = [0u8; 5];
        let (n, after) = cursor.copy_to(&mut small);
        assert_eq!((n, &small), (5, b"abcde"));
        assert_eq!(after.peek(), Some(b'f'));

        let mut big = [0u8; 32];
        let (n, after) = cursor.copy_to(&mut big);
        assert_eq!(&big[..n], b"abcdefgh");
        assert!(after.is_end());
    }

    #[test]
    fn test_copy_from_grows_chain() {
        let pool = BufferPool::new(PoolConfig::new().block_stride(64).block_guard(0).blocks_per_slab(4)).unwrap();
        let chain = BlockChain::new(&pool).unwrap();
        let payload: Vec<u8> = (0..200u8).collect();

        let mut writer = chain.end_cursor();
        writer.copy_from(&payload).unwrap();
        writer.put(0xAA).unwrap();

        assert_eq!(chain.block_count(), 4);
        assert_eq!(chain.len(), 201);
        let mut all = payload.clone();
        all.push(0xAA);
        assert_eq!(chain.to_vec(), all);
        assert_eq!(writer.get_length(&chain.end_cursor()).unwrap(), 0);
    }

    #[test]
    fn test_copy_from_keeps_written_prefix_on_lease_failure() {
        let pool = BufferPool::new(PoolConfig::new().block_stride(64).block_guard(0).blocks_per_slab(4)).unwrap();
        let chain = BlockChain::new(&pool).unwrap();
        pool.dispose();
        let payload: Vec<u8> = (0..100u8).collect();

        let mut writer = chain.end_cursor();
        assert_eq!(writer.copy_from(&payload), Err(BufferError::PoolDisposed));

        assert_eq!(chain.len(), 64);
        assert_eq!(writer.index(), 64);
        assert!(writer.same_position(&chain.end_cursor()));
        assert_eq!(chain.to_vec(), &payload[..64]);
    }

    #[test]
    fn test_copy_from_requires_tail() {
        let pool = BufferPool::default();
        let chain = chain(&pool, &[b"abc", b"def"]);

        let mut head = chain.cursor();
        assert_eq!(head.copy_from(b"x"), Err(BufferError::NotAtTail));
        head.skip(3).unwrap();
        assert_eq!(head.copy_from(b"x"), Err(BufferError::NotAtTail));

        let mut tail = chain.end_cursor();
        tail.copy_from(b"x").unwrap();
        assert_eq!(chain.to_vec(), b"abcdefx");
    }

    #[test]
    fn test_segments_between_cursors() {
        let pool = BufferPool::default();
        let chain = chain(&pool, &[b"GET ", b"", b"/path", b" HTTP"]);
        let mut start = chain.cursor();
        start.skip(2).unwrap();
        let mut end = start;
        end.seek(b' ', None).unwrap();
        end.skip(1).unwrap();
        end.seek(b' ', None).unwrap();

        let segments = start.segments_to(&end).unwrap();
        assert_eq!(segments.remaining(), 7);
        let spans: Vec<&[u8]> = segments.collect();
        assert_eq!(spans, vec![&b"T "[..], &b"/path"[..]]);
    }

    #[test]
    fn test_reader_follows_concurrent_writer() {
        let pool = BufferPool::new(PoolConfig::new().block_stride(128).block_guard(0)).unwrap();
        let chain = Arc::new(BlockChain::new(&pool).unwrap());
        const TOTAL: usize = 10_000;

        let writer_chain = Arc::clone(&chain);
        let writer = thread::spawn(move || {
            for i in 0..TOTAL {
                let mut tail = writer_chain.end_cursor();
                tail.put((i % 251) as u8).unwrap();
            }
        });

        let mut seen = 0;
        let mut cursor = chain.cursor();
        while seen < TOTAL {
            match cursor.take() {
                Some(b) => {
                    assert_eq!(b, (seen % 251) as u8);
                    seen += 1;
                }
                None => thread::yield_now(),
            }
        }
        writer.join().unwrap();
        assert!(cursor.is_end());
    }

    const ALPHABET: &[u8] = &[b'a', b'b', b' ', b'\r', b'\n', 0x00, 0x80, 0xff];

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(1024))]

        #[test]
        fn prop_seek_modes_agree(
            parts in prop::collection::vec(prop::collection::vec(prop::sample::select(ALPHABET), 0..80), 1..5),
            picks in prop::collection::vec(prop::sample::select(ALPHABET), 1..=3),
            offset in 0usize..40,
            limit in prop::option::of(0usize..200),
        ) {
            let pool = BufferPool::default();
            let slices: Vec<&[u8]> = parts.iter().map(Vec::as_slice).collect();
            let chain = BlockChain::from_segments(&pool, &slices).unwrap();
            let total: usize = parts.iter().map(Vec::len).sum();

            let mut start = chain.cursor();
            start.skip(offset.min(total)).unwrap();

            let needles = match picks.as_slice() {
                [a] => Needles::one(*a),
                [a, b] => Needles::two(*a, *b),
                [a, b, c] => Needles::three(*a, *b, *c),
                _ => unreachable!(),
            };

            let mut scalar = start;
            let mut vector = start;
            let s = scalar.seek_with(ScanMode::Scalar, needles, limit);
            let v = vector.seek_with(ScanMode::Vector, needles, limit);
            prop_assert_eq!(s, v);
            prop_assert!(scalar.same_position(&vector));

            // Cross-check against a flat search.
            let flat = chain.to_vec();
            let from = offset.min(total);
            let window = &flat[from..flat.len().min(from.saturating_add(limit.unwrap_or(usize::MAX)))];
            let expected = window.iter().position(|&b| needles.matches(b));
            prop_assert_eq!(s.is_some(), expected.is_some());
            prop_assert_eq!(start.get_length(&scalar).unwrap(), expected.unwrap_or(window.len()));
        }

        #[test]
        fn prop_copy_round_trip(data in prop::collection::vec(any::<u8>(), 0..20_000)) {
            let pool = BufferPool::default();
            let chain = BlockChain::new(&pool).unwrap();
            chain.append(&data).unwrap();

            let mut out = vec![0u8; data.len() + 16];
            let (n, end) = chain.cursor().copy_to(&mut out);
            prop_assert_eq!(n, data.len());
            prop_assert_eq!(&out[..n], &data[..]);
            prop_assert!(end.is_end());
        }
    }
}
