//! Resynchronization: find the next genuine record at or after an arbitrary
//! byte offset.
//!
//! # How it works
//!
//! A window of `8 + max_key_size` bytes slides forward one byte at a time.
//! At each position the window is read as a candidate header:
//!
//! 1. `0 < key_size <= min(bytes_left - 8, max_key_size)`
//! 2. the key matches `pattern`, when one is given
//! 3. `0 <= content_size <= max_content_size`
//! 4. the content ends at or before end-of-stream
//! 5. the content decompresses under the scanner's codec
//!    (placeholder records are accepted without decompression)
//!
//! The first position passing all five is returned.  Decompression is the
//! only strong check, so an identity codec confirms any plausible header.
//!
//! The window is served from a buffer refilled in large chunks, so the
//! per-byte cost is a slice index rather than a read call.

use std::cmp::{max, min};
use std::io::{self, Read, Seek};

use regex::bytes::Regex;
use tracing::{debug, trace};

use super::Scanner;
use crate::record::{Document, Limits, EMPTY_DOC_KEY, FRAME_OVERHEAD};

/// Smallest refill, in bytes.
const REFILL_CHUNK: usize = 64 * 1024;
/// Shortest possible record: two size fields and a one-byte key.
const MIN_RECORD: u64 = FRAME_OVERHEAD + 1;

/// Parameters for one [`Scanner::next_valid`] call.
#[derive(Debug, Clone)]
pub struct SeekOptions {
    /// First candidate position.
    pub start:            u64,
    /// Last candidate position; `None` means end-of-stream.
    pub end:              Option<u64>,
    pub max_key_size:     u32,
    pub max_content_size: u64,
    /// Only accept records whose key matches.
    pub pattern:          Option<Regex>,
}

impl SeekOptions {
    pub fn new(start: u64, limits: Limits) -> Self {
        Self {
            start,
            end:              None,
            max_key_size:     limits.key_size_limit,
            max_content_size: limits.max_doc_size,
            pattern:          None,
        }
    }

    pub fn with_end(mut self, end: u64) -> Self {
        self.end = Some(end);
        self
    }

    pub fn with_pattern(mut self, pattern: Option<Regex>) -> Self {
        self.pattern = pattern;
        self
    }
}

/// Buffered view of `[start, start + data.len())`.
struct Window {
    start: u64,
    data:  Vec<u8>,
}

impl Window {
    fn covers(&self, from: u64, to: u64) -> bool {
        from >= self.start && to <= self.start + self.data.len() as u64
    }

    fn slice(&self, from: u64, to: u64) -> &[u8] {
        &self.data[(from - self.start) as usize..(to - self.start) as usize]
    }
}

impl<R: Read + Seek> Scanner<R> {
    /// Locate the first valid record at or after `opts.start`.
    ///
    /// Returns its offset and decoded document.  The cursor is left where it
    /// was before the call, whatever the outcome.  Malformed bytes are never
    /// an error here; only I/O failures are.
    pub fn next_valid(&mut self, opts: &SeekOptions) -> io::Result<Option<(u64, Document)>> {
        let saved = self.position()?;
        let found = self.scan_forward(opts);
        self.seek(saved)?;
        found
    }

    fn scan_forward(&mut self, opts: &SeekOptions) -> io::Result<Option<(u64, Document)>> {
        let len = self.len;
        let end = opts.end.map_or(len, |e| min(e, len));
        let span = FRAME_OVERHEAD + opts.max_key_size as u64;
        let chunk = max(span as usize, REFILL_CHUNK) * 2;

        let mut window = Window { start: opts.start, data: Vec::new() };
        let mut pos = opts.start;
        while pos <= end && pos + MIN_RECORD <= len {
            let reach = min(pos + span, len);
            if !window.covers(pos, reach) {
                let take = min(chunk as u64, len - pos) as usize;
                window.start = pos;
                window.data.resize(take, 0);
                self.seek(pos)?;
                self.reader.read_exact(&mut window.data)?;
            }
            if let Some(doc) = self.candidate(&window, pos, opts)? {
                debug!(start = opts.start, found = pos, skipped = pos - opts.start, "resynchronized");
                return Ok(Some((pos, doc)));
            }
            pos += 1;
        }
        trace!(start = opts.start, end, "no valid record in range");
        Ok(None)
    }

    /// Evaluate the candidate header at `pos`.
    fn candidate(&mut self, window: &Window, pos: u64, opts: &SeekOptions) -> io::Result<Option<Document>> {
        let len = self.len;
        let left = len - pos;

        let head = window.slice(pos, pos + 4);
        let key_size = i32::from_le_bytes([head[0], head[1], head[2], head[3]]);
        if key_size <= 0 || key_size as u64 > min(left - FRAME_OVERHEAD, opts.max_key_size as u64) {
            return Ok(None);
        }
        let key_end = pos + 4 + key_size as u64;
        let key = window.slice(pos + 4, key_end);
        if let Some(re) = &opts.pattern {
            if !re.is_match(key) {
                return Ok(None);
            }
        }
        let size = window.slice(key_end, key_end + 4);
        let content_size = i32::from_le_bytes([size[0], size[1], size[2], size[3]]);
        if content_size < 0 || content_size as u64 > opts.max_content_size {
            return Ok(None);
        }
        let content_start = key_end + 4;
        let content_end = content_start + content_size as u64;
        if content_end > len {
            return Ok(None);
        }

        let key = key.to_vec();
        let raw = if window.covers(content_start, content_end) {
            window.slice(content_start, content_end).to_vec()
        } else {
            let mut raw = vec![0u8; content_size as usize];
            self.seek(content_start)?;
            self.reader.read_exact(&mut raw)?;
            raw
        };
        if key == EMPTY_DOC_KEY {
            return Ok(Some(Document { key, content: raw }));
        }
        Ok(self.codec.decompress(&raw).ok().map(|content| Document { key, content }))
    }
}
