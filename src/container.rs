//! High-level [`Container`] API over one container file.
//!
//! ```no_run
//! use binpack::container::{Container, ContainerOptions, SearchOptions};
//! use binpack::count::CountOptions;
//! use regex::bytes::Regex;
//!
//! let mut c = Container::open("docs.bin", ContainerOptions::default())?;
//! let total = c.count(&CountOptions { workers: 4, ..Default::default() })?;
//! if let Some(offset) = c.search(&SearchOptions::new(Regex::new("^user:")?))? {
//!     let doc = c.read_at(offset)?;
//!     println!("{total} records, first match {:?}", doc.map(|d| d.key));
//! }
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```

use std::fs::File;
use std::io::{self, BufReader};
use std::path::{Path, PathBuf};

use rand::Rng;
use regex::bytes::Regex;
use tracing::{debug, warn};

use crate::codec::CodecId;
use crate::count::{self, CountError, CountOptions};
use crate::record::{Document, DocumentHeader, Limits, RecordError};
use crate::scanner::{Documents, Scanner, SeekOptions};

// ── Options ───────────────────────────────────────────────────────────────────

/// Configuration for [`Container::open`].
#[derive(Debug, Clone, Copy, Default)]
pub struct ContainerOptions {
    /// Record codec the container was written with.
    pub codec:  CodecId,
    pub limits: Limits,
}

/// Which match [`Container::search`] returns.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipMatches {
    /// Skip this many matches and return the next one.
    Count(u64),
    /// Skip a random number of matches in `0..100`.
    Random,
}

impl Default for SkipMatches {
    fn default() -> Self { SkipMatches::Count(0) }
}

#[derive(Debug, Clone)]
pub struct SearchOptions {
    pub pattern:       Regex,
    pub offset:        u64,
    pub skip:          SkipMatches,
    pub skip_on_error: bool,
}

impl SearchOptions {
    pub fn new(pattern: Regex) -> Self {
        Self { pattern, offset: 0, skip: SkipMatches::default(), skip_on_error: false }
    }
}

#[derive(Debug, Clone)]
pub struct ListOptions {
    pub offset:        u64,
    /// Stop after this many entries.
    pub limit:         Option<usize>,
    /// Keep every `step`-th matching record.
    pub step:          usize,
    pub pattern:       Option<Regex>,
    pub skip_on_error: bool,
}

impl Default for ListOptions {
    fn default() -> Self {
        Self { offset: 0, limit: None, step: 1, pattern: None, skip_on_error: false }
    }
}

/// Header summary returned by [`Container::list`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListEntry {
    pub offset:       u64,
    pub key:          Vec<u8>,
    /// Stored (encoded) content size.
    pub content_size: u64,
}

// ── Container ─────────────────────────────────────────────────────────────────

pub struct Container {
    path:    PathBuf,
    opts:    ContainerOptions,
    scanner: Scanner<BufReader<File>>,
}

impl Container {
    pub fn open<P: AsRef<Path>>(path: P, opts: ContainerOptions) -> io::Result<Self> {
        let path = path.as_ref().to_owned();
        let scanner = Scanner::new(BufReader::new(File::open(&path)?), opts.codec, opts.limits)?;
        Ok(Self { path, opts, scanner })
    }

    pub fn path(&self) -> &Path { &self.path }
    pub fn codec(&self) -> CodecId { self.opts.codec }
    pub fn len(&self) -> u64 { self.scanner.len() }
    pub fn is_empty(&self) -> bool { self.scanner.is_empty() }

    /// Decode the record starting exactly at `offset`.
    pub fn read_at(&mut self, offset: u64) -> Result<Option<Document>, RecordError> {
        self.scanner.read_at(offset, true)
    }

    /// Decoded documents from `offset` onwards.
    pub fn documents(&mut self, offset: u64, skip_on_error: bool) -> io::Result<Documents<'_, BufReader<File>>> {
        self.scanner.seek(offset)?;
        Ok(self.scanner.documents(skip_on_error))
    }

    /// First valid record at or after `offset`, optionally with a matching key.
    pub fn next_valid(&mut self, offset: u64, pattern: Option<Regex>) -> io::Result<Option<(u64, Document)>> {
        let opts = SeekOptions::new(offset, self.opts.limits).with_pattern(pattern);
        self.scanner.next_valid(&opts)
    }

    /// Count records with the partitioned counter.
    pub fn count(&self, opts: &CountOptions) -> Result<u64, CountError> {
        count::count(&self.path, self.opts.codec, opts)
    }

    /// Walk record headers and collect a listing.
    pub fn list(&mut self, opts: &ListOptions) -> Result<Vec<ListEntry>, RecordError> {
        let step = opts.step.max(1);
        let mut entries = Vec::new();
        let mut matched = 0usize;
        let mut headers = HeaderWalk::new(&mut self.scanner, opts.offset, opts.skip_on_error)?;
        while let Some((offset, header)) = headers.next_header()? {
            if opts.limit.is_some_and(|l| entries.len() >= l) {
                break;
            }
            if !opts.pattern.as_ref().map_or(true, |re| re.is_match(&header.key)) {
                continue;
            }
            if matched % step == 0 {
                entries.push(ListEntry { offset, key: header.key, content_size: header.content_size });
            }
            matched += 1;
        }
        Ok(entries)
    }

    /// Linear key search.
    ///
    /// Returns the offset of the match selected by `opts.skip`.  When fewer
    /// matches exist, the last match is returned instead; `None` means the
    /// pattern never matched.
    pub fn search(&mut self, opts: &SearchOptions) -> Result<Option<u64>, RecordError> {
        let target = match opts.skip {
            SkipMatches::Count(n) => n,
            SkipMatches::Random   => rand::thread_rng().gen_range(0..100),
        };
        debug!(pattern = %opts.pattern, offset = opts.offset, skip = target, "searching");

        let mut seen = 0u64;
        let mut last = None;
        let mut headers = HeaderWalk::new(&mut self.scanner, opts.offset, opts.skip_on_error)?;
        while let Some((offset, header)) = headers.next_header()? {
            if !opts.pattern.is_match(&header.key) {
                continue;
            }
            if seen == target {
                return Ok(Some(offset));
            }
            seen += 1;
            last = Some(offset);
        }
        Ok(last)
    }
}

// ── Header walk ───────────────────────────────────────────────────────────────

/// Sequential header reader shared by list and search.
struct HeaderWalk<'a> {
    scanner:       &'a mut Scanner<BufReader<File>>,
    skip_on_error: bool,
}

impl<'a> HeaderWalk<'a> {
    fn new(scanner: &'a mut Scanner<BufReader<File>>, offset: u64, skip_on_error: bool) -> io::Result<Self> {
        scanner.seek(offset)?;
        Ok(Self { scanner, skip_on_error })
    }

    fn next_header(&mut self) -> Result<Option<(u64, DocumentHeader)>, RecordError> {
        loop {
            let pos = self.scanner.position()?;
            match self.scanner.read_key() {
                Ok(Some(header)) => return Ok(Some((pos, header))),
                Ok(None) => return Ok(None),
                Err(e) if self.skip_on_error && e.is_malformed() => {
                    warn!(offset = pos, error = %e, "bad header, resynchronizing");
                    let opts = SeekOptions::new(pos + 1, self.scanner.limits());
                    match self.scanner.next_valid(&opts)? {
                        Some((next, _)) => { self.scanner.seek(next)?; }
                        None            => return Ok(None),
                    }
                }
                Err(e) => return Err(e),
            }
        }
    }
}
