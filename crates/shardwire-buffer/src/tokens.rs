//! Fixed-width recognition of HTTP methods and versions.
//!
//! Tokens are matched by loading the first 4 or 8 bytes as a little-endian
//! integer and comparing against precomputed constants, so recognition
//! never walks the token byte by byte. The trailing space of a method
//! (or the `\r` after a version) is part of the match, which rejects
//! longer look-alikes such as `GETX` or `HTTP/1.10`.

use std::fmt;

use crate::cursor::Cursor;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HttpMethod {
    Get,
    Put,
    Post,
    Head,
    Trace,
    Patch,
    Delete,
    Connect,
    Options,
}

impl HttpMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            HttpMethod::Get => "GET",
            HttpMethod::Put => "PUT",
            HttpMethod::Post => "POST",
            HttpMethod::Head => "HEAD",
            HttpMethod::Trace => "TRACE",
            HttpMethod::Patch => "PATCH",
            HttpMethod::Delete => "DELETE",
            HttpMethod::Connect => "CONNECT",
            HttpMethod::Options => "OPTIONS",
        }
    }
}

impl fmt::Display for HttpMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HttpVersion {
    Http10,
    Http11,
}

impl HttpVersion {
    pub fn as_str(&self) -> &'static str {
        match self {
            HttpVersion::Http10 => "HTTP/1.0",
            HttpVersion::Http11 => "HTTP/1.1",
        }
    }
}

impl fmt::Display for HttpVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

const GET_INT: u32 = u32::from_le_bytes(*b"GET ");

const HTTP_10: u64 = u64::from_le_bytes(*b"HTTP/1.0");
const HTTP_11: u64 = u64::from_le_bytes(*b"HTTP/1.1");

const fn mask(bytes: u32) -> u64 {
    if bytes >= 8 {
        u64::MAX
    } else {
        (1u64 << (bytes * 8)) - 1
    }
}

struct Known {
    mask: u64,
    value: u64,
    method: HttpMethod,
}

const fn known(token: &[u8; 8], len: u32, method: HttpMethod) -> Known {
    Known {
        mask: mask(len),
        value: u64::from_le_bytes(*token) & mask(len),
        method,
    }
}

// Compared after the GET fast path; the mask covers name plus space.
const KNOWN_METHODS: [Known; 8] = [
    known(b"PUT \0\0\0\0", 4, HttpMethod::Put),
    known(b"POST \0\0\0", 5, HttpMethod::Post),
    known(b"HEAD \0\0\0", 5, HttpMethod::Head),
    known(b"TRACE \0\0", 6, HttpMethod::Trace),
    known(b"PATCH \0\0", 6, HttpMethod::Patch),
    known(b"DELETE \0", 7, HttpMethod::Delete),
    known(b"CONNECT ", 8, HttpMethod::Connect),
    known(b"OPTIONS ", 8, HttpMethod::Options),
];

/// Recognize a method at the start of `span`.
///
/// Returns the method and its length (excluding the trailing space).
/// `GET ` needs 4 bytes; every other method needs 8 readable bytes even
/// when the token itself is shorter.
pub fn known_method(span: &[u8]) -> Option<(HttpMethod, usize)> {
    if span.len() < 4 {
        return None;
    }
    let mut head = [0u8; 4];
    head.copy_from_slice(&span[..4]);
    if u32::from_le_bytes(head) == GET_INT {
        return Some((HttpMethod::Get, 3));
    }
    if span.len() < 8 {
        return None;
    }
    method_from_word(read_word(span))
}

/// Recognize `HTTP/1.0` or `HTTP/1.1` followed by `\r`.
pub fn known_version(span: &[u8]) -> Option<HttpVersion> {
    if span.len() < 9 || span[8] != b'\r' {
        return None;
    }
    version_from_word(read_word(span))
}

fn method_from_word(word: u64) -> Option<(HttpMethod, usize)> {
    if word as u32 == GET_INT {
        return Some((HttpMethod::Get, 3));
    }
    KNOWN_METHODS
        .iter()
        .find(|k| word & k.mask == k.value)
        .map(|k| (k.method, k.method.as_str().len()))
}

fn version_from_word(word: u64) -> Option<HttpVersion> {
    match word {
        HTTP_11 => Some(HttpVersion::Http11),
        HTTP_10 => Some(HttpVersion::Http10),
        _ => None,
    }
}

#[inline]
fn read_word(span: &[u8]) -> u64 {
    let mut word = [0u8; 8];
    word.copy_from_slice(&span[..8]);
    u64::from_le_bytes(word)
}

impl Cursor<'_> {
    /// [`known_method`] at the cursor, reading across block boundaries.
    /// The cursor does not move.
    pub fn known_method(&self) -> Option<(HttpMethod, usize)> {
        match self.peek_long() {
            Some(word) => method_from_word(word),
            None => {
                // Short or sparse tail: fall back to a copy.
                let mut buf = [0u8; 8];
                let (n, _) = self.copy_to(&mut buf);
                known_method(&buf[..n])
            }
        }
    }

    /// [`known_version`] at the cursor. The cursor does not move.
    pub fn known_version(&self) -> Option<HttpVersion> {
        let version = version_from_word(self.peek_long()?)?;
        let mut after = *self;
        after.skip(8).ok()?;
        (after.peek()? == b'\r').then_some(version)
    }
}
