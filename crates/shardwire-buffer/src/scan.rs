//! Byte-set search over a single contiguous span.
//!
//! Two strategies with identical results:
//!
//! - **Scalar**: one byte at a time.
//! - **Vector**: compares a whole chunk against each needle at once.
//!   x86_64 uses SSE2 (16 lanes, part of the baseline ISA); other targets
//!   use 64-bit SWAR words (8 lanes). The trailing partial chunk is always
//!   finished with the scalar loop.
//!
//! The mode is picked once per process ([`ScanMode::detect`]) and can be
//! pinned with `SHARDWIRE_SCAN=scalar|vector`.

use std::sync::OnceLock;

use shardwire_core::env::env_get_opt;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScanMode {
    Scalar,
    Vector,
}

impl ScanMode {
    /// The process-wide default, detected on first use.
    pub fn detect() -> ScanMode {
        static MODE: OnceLock<ScanMode> = OnceLock::new();
        *MODE.get_or_init(|| {
            match env_get_opt::<String>("SHARDWIRE_SCAN").as_deref() {
                Some("scalar") => ScanMode::Scalar,
                Some("vector") => ScanMode::Vector,
                _ => {
                    if vector_supported() {
                        ScanMode::Vector
                    } else {
                        ScanMode::Scalar
                    }
                }
            }
        })
    }

    /// Bytes compared per step.
    pub fn width(self) -> usize {
        match self {
            ScanMode::Scalar => 1,
            ScanMode::Vector => VECTOR_WIDTH,
        }
    }
}

#[cfg(target_arch = "x86_64")]
fn vector_supported() -> bool {
    std::arch::is_x86_feature_detected!("sse2")
}

#[cfg(not(target_arch = "x86_64"))]
fn vector_supported() -> bool {
    true
}

/// One to three bytes to search for.
///
/// Unused slots repeat the first needle so every comparison tests three lanes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Needles {
    bytes: [u8; 3],
    count: u8,
}

impl Needles {
    pub const fn one(a: u8) -> Self {
        Self { bytes: [a, a, a], count: 1 }
    }

    pub const fn two(a: u8, b: u8) -> Self {
        Self { bytes: [a, b, a], count: 2 }
    }

    pub const fn three(a: u8, b: u8, c: u8) -> Self {
        Self { bytes: [a, b, c], count: 3 }
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.bytes[..self.count as usize]
    }

    #[inline(always)]
    pub fn matches(&self, byte: u8) -> bool {
        byte == self.bytes[0] || byte == self.bytes[1] || byte == self.bytes[2]
    }
}

impl From<u8> for Needles {
    fn from(a: u8) -> Self {
        Needles::one(a)
    }
}

impl From<[u8; 1]> for Needles {
    fn from([a]: [u8; 1]) -> Self {
        Needles::one(a)
    }
}

impl From<[u8; 2]> for Needles {
    fn from([a, b]: [u8; 2]) -> Self {
        Needles::two(a, b)
    }
}

impl From<[u8; 3]> for Needles {
    fn from([a, b, c]: [u8; 3]) -> Self {
        Needles::three(a, b, c)
    }
}

/// Offset of the first byte in `hay` matching any needle.
#[inline]
pub fn find(mode: ScanMode, hay: &[u8], needles: Needles) -> Option<usize> {
    match mode {
        ScanMode::Scalar => find_scalar(hay, needles, 0),
        ScanMode::Vector => find_vector(hay, needles),
    }
}

#[inline]
fn find_scalar(hay: &[u8], needles: Needles, from: usize) -> Option<usize> {
    hay[from..]
        .iter()
        .position(|&b| needles.matches(b))
        .map(|pos| pos + from)
}

cfg_if::cfg_if! {
    if #[cfg(target_arch = "x86_64")] {
        const VECTOR_WIDTH: usize = 16;

        fn find_vector(hay: &[u8], needles: Needles) -> Option<usize> {
            use std::arch::x86_64::*;

            let mut offset = 0;
            // Safety: SSE2 is part of the x86_64 baseline. Every load is
            // unaligned and reads 16 bytes starting at `offset`, with
            // `offset + 16 <= hay.len()`.
            unsafe {
                let n0 = _mm_set1_epi8(needles.bytes[0] as i8);
                let n1 = _mm_set1_epi8(needles.bytes[1] as i8);
                let n2 = _mm_set1_epi8(needles.bytes[2] as i8);
                while offset + VECTOR_WIDTH <= hay.len() {
                    let chunk = _mm_loadu_si128(hay.as_ptr().add(offset) as *const __m128i);
                    let hits = _mm_or_si128(
                        _mm_or_si128(_mm_cmpeq_epi8(chunk, n0), _mm_cmpeq_epi8(chunk, n1)),
                        _mm_cmpeq_epi8(chunk, n2),
                    );
                    let mask = _mm_movemask_epi8(hits) as u32;
                    if mask != 0 {
                        return Some(offset + mask.trailing_zeros() as usize);
                    }
                    offset += VECTOR_WIDTH;
                }
            }
            find_scalar(hay, needles, offset)
        }
    } else {
        const VECTOR_WIDTH: usize = WORD;

        #[inline]
        fn find_vector(hay: &[u8], needles: Needles) -> Option<usize> {
            find_words(hay, needles)
        }
    }
}

const WORD: usize = 8;
const LO: u64 = 0x0101_0101_0101_0101;
const HI: u64 = 0x8080_8080_8080_8080;

/// High bit set in each lane of `v` that is zero. Lanes above the first
/// zero may be false positives; the lowest set bit is always exact.
#[inline(always)]
fn zero_lanes(v: u64) -> u64 {
    v.wrapping_sub(LO) & !v & HI
}

/// Portable word-at-a-time search.
#[cfg_attr(target_arch = "x86_64", allow(dead_code))]
fn find_words(hay: &[u8], needles: Needles) -> Option<usize> {
    let n0 = LO.wrapping_mul(needles.bytes[0] as u64);
    let n1 = LO.wrapping_mul(needles.bytes[1] as u64);
    let n2 = LO.wrapping_mul(needles.bytes[2] as u64);

    let chunks = hay.chunks_exact(WORD);
    for (i, chunk) in chunks.enumerate() {
        let mut bytes = [0u8; WORD];
        bytes.copy_from_slice(chunk);
        let word = u64::from_le_bytes(bytes);
        let hits = zero_lanes(word ^ n0) | zero_lanes(word ^ n1) | zero_lanes(word ^ n2);
        if hits != 0 {
            return Some(i * WORD + (hits.trailing_zeros() / 8) as usize);
        }
    }
    find_scalar(hay, needles, hay.len() - hay.len() % WORD)
}
