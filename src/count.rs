//! Partitioned record counting.
//!
//! # Algorithm
//!
//! `[offset, end)` is split into `workers` byte ranges ([`crate::partition`]).
//! Each range runs on its own thread with its own file handle and:
//!
//! 1. resynchronizes from the range start to the first valid record,
//! 2. steps record by record until the cursor reaches or passes the range end,
//! 3. on a bad record either resynchronizes from the byte after it
//!    (`skip_on_error`) or fails the range.
//!
//! Partial counts come back over a bounded channel and are summed.  A failed
//! range poisons the total; the error carries the range, the failing offset
//! and the partial count.
//!
//! Ranges never coordinate.  A corrupted region straddling a boundary may be
//! recovered by both neighbours or by neither, so counts over damaged data
//! are best effort.

use std::fs::File;
use std::io::{self, BufReader, Read, Seek};
use std::path::{Path, PathBuf};
use std::thread;

use crossbeam::channel;
use regex::bytes::Regex;
use thiserror::Error;
use tracing::{debug, warn};

use crate::codec::CodecId;
use crate::partition::{partitions, Partition};
use crate::record::{Limits, RecordError};
use crate::scanner::{Scanner, SeekOptions};
use crate::stop::StopSignal;

// ── Options ──────────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct CountOptions {
    /// First byte of the counted range.
    pub offset:        u64,
    /// End of the counted range (exclusive); `None` counts to end-of-file.
    pub end:           Option<u64>,
    /// Number of concurrent partitions; `<= 1` counts on the calling thread.
    pub workers:       usize,
    /// Count only records whose key matches.
    pub pattern:       Option<Regex>,
    /// Resynchronize past bad records instead of failing.
    pub skip_on_error: bool,
    /// Trust headers without decompressing content.
    pub key_only:      bool,
    pub limits:        Limits,
    pub stop:          StopSignal,
}

impl Default for CountOptions {
    fn default() -> Self {
        Self {
            offset:        0,
            end:           None,
            workers:       1,
            pattern:       None,
            skip_on_error: false,
            key_only:      false,
            limits:        Limits::default(),
            stop:          StopSignal::new(),
        }
    }
}

// ── Error type ───────────────────────────────────────────────────────────────

#[derive(Error, Debug)]
pub enum CountError {
    #[error("cannot open {}: {source}", .path.display())]
    Open { path: PathBuf, #[source] source: io::Error },
    #[error("partition {partition} [{start}, {end}) failed at offset {offset} after {counted} records: {source}")]
    Partition {
        partition: usize,
        start:     u64,
        end:       u64,
        offset:    u64,
        /// Records counted in this partition before the failure.
        counted:   u64,
        #[source]
        source:    RecordError,
    },
    #[error("count stopped after {counted} records")]
    Stopped { counted: u64 },
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

// ── Entry points ─────────────────────────────────────────────────────────────

/// Count records of the container at `path`.
pub fn count(path: &Path, codec: CodecId, opts: &CountOptions) -> Result<u64, CountError> {
    let len = std::fs::metadata(path)
        .map_err(|source| CountError::Open { path: path.to_path_buf(), source })?
        .len();
    let end = opts.end.map_or(len, |e| e.min(len));
    let parts = partitions(opts.offset, end, opts.workers);
    debug!(path = %path.display(), offset = opts.offset, end, partitions = parts.len(), "counting");

    if parts.len() <= 1 {
        return match parts.first() {
            Some(part) => count_partition(path, codec, *part, opts),
            None       => Ok(0),
        };
    }

    let (tx, rx) = channel::bounded(parts.len());
    thread::scope(|scope| {
        for part in &parts {
            let tx = tx.clone();
            scope.spawn(move || {
                // The receiver outlives every sender in this scope.
                let _ = tx.send(count_partition(path, codec, *part, opts));
            });
        }
    });
    drop(tx);

    let mut total = 0u64;
    let mut stopped = false;
    let mut failure = None;
    for result in rx.iter() {
        match result {
            Ok(n) => total += n,
            Err(CountError::Stopped { counted }) => {
                total += counted;
                stopped = true;
            }
            Err(e) => {
                if failure.is_none() {
                    failure = Some(e);
                }
            }
        }
    }
    if let Some(e) = failure {
        return Err(e);
    }
    if stopped {
        return Err(CountError::Stopped { counted: total });
    }
    Ok(total)
}

fn count_partition(path: &Path, codec: CodecId, part: Partition, opts: &CountOptions) -> Result<u64, CountError> {
    let file = File::open(path).map_err(|source| CountError::Open { path: path.to_path_buf(), source })?;
    let mut scanner = Scanner::new(BufReader::new(file), codec, opts.limits)?;
    let n = count_range(&mut scanner, part, opts)?;
    debug!(partition = part.index, start = part.start, end = part.end, count = n, "partition counted");
    Ok(n)
}

/// Count the records whose first byte lies in `part`.
pub fn count_range<R: Read + Seek>(
    scanner: &mut Scanner<R>,
    part:    Partition,
    opts:    &CountOptions,
) -> Result<u64, CountError> {
    let align = SeekOptions::new(part.start, opts.limits).with_end(part.end);
    let mut pos = match scanner.next_valid(&align)? {
        Some((pos, _)) if pos < part.end => pos,
        _ => return Ok(0),
    };
    scanner.seek(pos)?;

    let mut counted = 0u64;
    while pos < part.end {
        if opts.stop.is_stopped() {
            return Err(CountError::Stopped { counted });
        }
        let step = if opts.key_only { scanner.skip_next() } else { scanner.verify_next() };
        match step {
            Ok(Some(header)) => {
                if opts.pattern.as_ref().map_or(true, |re| re.is_match(&header.key)) {
                    counted += 1;
                }
                pos = scanner.position()?;
            }
            Ok(None) => break,
            Err(e) if opts.skip_on_error && e.is_malformed() => {
                warn!(partition = part.index, offset = pos, error = %e, "skipping bad record");
                let retry = SeekOptions::new(pos + 1, opts.limits).with_end(part.end);
                match scanner.next_valid(&retry)? {
                    Some((next, _)) if next < part.end => {
                        pos = next;
                        scanner.seek(pos)?;
                    }
                    _ => break,
                }
            }
            Err(source) => {
                return Err(CountError::Partition {
                    partition: part.index,
                    start:     part.start,
                    end:       part.end,
                    offset:    pos,
                    counted,
                    source,
                });
            }
        }
    }
    Ok(counted)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scanner::tests::gzip_container;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn container_file(bytes: &[u8]) -> NamedTempFile {
        let mut f = NamedTempFile::new().unwrap();
        f.write_all(bytes).unwrap();
        f.flush().unwrap();
        f
    }

    fn opts(workers: usize) -> CountOptions {
        CountOptions { workers, ..CountOptions::default() }
    }

    #[test]
    fn partitioned_count_matches_sequential() {
        for m in [0usize, 1, 50, 1000] {
            let (bytes, _, _) = gzip_container(m);
            let file = container_file(&bytes);
            for workers in [1, 2, 4, 8] {
                let n = count(file.path(), CodecId::Gzip, &opts(workers)).unwrap();
                assert_eq!(n, m as u64, "m={m} workers={workers}");
            }
        }
    }

    #[test]
    fn key_only_count_matches() {
        let (bytes, _, _) = gzip_container(123);
        let file = container_file(&bytes);
        for workers in [1, 3, 8] {
            let o = CountOptions { key_only: true, ..opts(workers) };
            assert_eq!(count(file.path(), CodecId::Gzip, &o).unwrap(), 123);
        }
    }

    #[test]
    fn corrupted_record_skipped_or_reported() {
        let (mut bytes, offsets, _) = gzip_container(40);
        let mid = ((offsets[17] + offsets[18]) / 2) as usize;
        bytes[mid] ^= 0xff;
        let file = container_file(&bytes);

        for workers in [1, 4] {
            let skipping = CountOptions { skip_on_error: true, ..opts(workers) };
            assert_eq!(count(file.path(), CodecId::Gzip, &skipping).unwrap(), 39);

            let err = count(file.path(), CodecId::Gzip, &opts(workers)).unwrap_err();
            assert!(matches!(err, CountError::Partition { .. }), "{err}");
        }

        let err = count(file.path(), CodecId::Gzip, &opts(1)).unwrap_err();
        match err {
            CountError::Partition { offset, counted, .. } => {
                assert_eq!(offset, offsets[17]);
                assert_eq!(counted, 17);
            }
            other => panic!("unexpected {other}"),
        }
    }

    #[test]
    fn truncated_tail_is_reported() {
        let (mut bytes, _, _) = gzip_container(10);
        bytes.truncate(bytes.len() - 4);
        let file = container_file(&bytes);
        assert!(count(file.path(), CodecId::Gzip, &opts(1)).is_err());
        let skipping = CountOptions { skip_on_error: true, ..opts(1) };
        assert_eq!(count(file.path(), CodecId::Gzip, &skipping).unwrap(), 9);
    }

    #[test]
    fn pattern_filters_counted_records() {
        let (bytes, _, _) = gzip_container(60);
        let file = container_file(&bytes);
        let re = Regex::new("^key-0000[0-4]$").unwrap();
        for workers in [1, 4] {
            let o = CountOptions { pattern: Some(re.clone()), ..opts(workers) };
            assert_eq!(count(file.path(), CodecId::Gzip, &o).unwrap(), 5);
        }
    }

    #[test]
    fn sub_range_counts_records_starting_inside() {
        let (bytes, offsets, _) = gzip_container(20);
        let file = container_file(&bytes);
        let o = CountOptions { offset: offsets[5], end: Some(offsets[12]), ..opts(2) };
        assert_eq!(count(file.path(), CodecId::Gzip, &o).unwrap(), 7);
        let o = CountOptions { offset: offsets[5] + 1, end: Some(offsets[12] + 1), ..opts(1) };
        assert_eq!(count(file.path(), CodecId::Gzip, &o).unwrap(), 7);
    }

    #[test]
    fn stop_signal_interrupts() {
        let (bytes, _, _) = gzip_container(50);
        let file = container_file(&bytes);
        let o = opts(4);
        o.stop.trigger();
        assert!(matches!(count(file.path(), CodecId::Gzip, &o), Err(CountError::Stopped { .. })));
    }

    #[test]
    fn missing_file_is_open_error() {
        let err = count(Path::new("/nonexistent/binpack.bin"), CodecId::Gzip, &opts(2)).unwrap_err();
        assert!(matches!(err, CountError::Open { .. }));
    }
}
