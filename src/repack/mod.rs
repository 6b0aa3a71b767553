//! Repack engine: rewrite a container under new codecs.
//!
//! # Topologies
//!
//! | Topology | Readers | Writers | Output |
//! |----------|---------|---------|--------|
//! | [`Topology::FileSharded`] | one seeder | `workers` shard writers | merger concatenates shards, or shards kept |
//! | [`Topology::PartitionSharded`] | `workers` partition readers | one writer | written directly |
//!
//! Every queue is a bounded `crossbeam` channel.  End of input is signalled
//! by disconnection: when the last sender drops, every receiver drains what
//! is buffered and then observes the end exactly once.  A consumer that
//! gives up drops its receiver, which turns further sends into errors and
//! stops the producers.
//!
//! # Ordering
//!
//! With more than one worker, or with `split > 0`, records reach the target
//! in whatever order the workers finish them.  Only the set of documents is
//! preserved.
//!
//! # Ownership
//!
//! A shard file belongs to the worker writing it until announced, then to
//! the merger.  The target file and its package compressor belong to the
//! merger (or single writer) alone.  A worker that fails deletes its
//! unannounced shard; after a merge failure, announced shards stay on disk.

mod file_sharded;
mod partition_sharded;

use std::ffi::OsString;
use std::fmt;
use std::io;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;
use thiserror::Error;
use tracing::info;

use crate::codec::CodecId;
use crate::record::{Limits, RecordError};
use crate::stop::StopSignal;
use crate::writer::WriteError;

// ── Options ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Topology {
    /// One seeder, demand-driven workers writing shards, one merger.
    #[default]
    FileSharded,
    /// One reader per byte partition feeding a single writer.
    PartitionSharded,
}

impl Topology {
    pub fn name(self) -> &'static str {
        match self {
            Topology::FileSharded      => "file",
            Topology::PartitionSharded => "partition",
        }
    }
}

impl fmt::Display for Topology {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Topology {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "file" | "file-sharded"           => Ok(Topology::FileSharded),
            "partition" | "partition-sharded" => Ok(Topology::PartitionSharded),
            other => Err(format!("unknown topology '{other}' (expected file or partition)")),
        }
    }
}

/// Configuration for [`repack`].
#[derive(Debug, Clone)]
pub struct RepackOptions {
    pub source:        PathBuf,
    pub target:        PathBuf,
    pub workers:       usize,
    /// Documents per shard before a worker rotates to a new one; 0 disables.
    pub split:         u64,
    pub source_codec:  CodecId,
    pub target_codec:  CodecId,
    /// Whole-stream compression of the target.
    pub package_codec: CodecId,
    /// Stop after this many documents.
    pub limit:         Option<u64>,
    /// Concatenate file-sharded output into `target`; otherwise the
    /// `<target>.<n>` shards are the result.
    pub merge:         bool,
    pub topology:      Topology,
    pub skip_on_error: bool,
    pub limits:        Limits,
    pub stop:          StopSignal,
}

impl Default for RepackOptions {
    fn default() -> Self {
        Self {
            source:        PathBuf::new(),
            target:        PathBuf::new(),
            workers:       num_cpus::get(),
            split:         0,
            source_codec:  CodecId::Gzip,
            target_codec:  CodecId::Gzip,
            package_codec: CodecId::None,
            limit:         None,
            merge:         true,
            topology:      Topology::default(),
            skip_on_error: false,
            limits:        Limits::default(),
            stop:          StopSignal::new(),
        }
    }
}

// ── Report / errors ───────────────────────────────────────────────────────────

/// Totals of one repack run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RepackReport {
    pub documents_read:    u64,
    pub documents_written: u64,
    pub documents_skipped: u64,
    pub shards_merged:     u64,
    /// Shards left as output when not merging.
    pub shards_kept:       u64,
}

#[derive(Error, Debug)]
pub enum RepackError {
    #[error("cannot open {}: {source}", .path.display())]
    Open { path: PathBuf, #[source] source: io::Error },
    #[error("seeder failed at offset {offset}: {source}")]
    Seeder { offset: u64, #[source] source: RecordError },
    #[error("partition {partition} failed at offset {offset}: {source}")]
    Partition { partition: usize, offset: u64, #[source] source: RecordError },
    #[error("worker {worker} failed: {source}")]
    Worker { worker: usize, #[source] source: WriteError },
    #[error("merge of {} failed: {source}", .shard.display())]
    Merge { shard: PathBuf, #[source] source: io::Error },
    #[error("write to {} failed: {source}", .path.display())]
    Write { path: PathBuf, #[source] source: WriteError },
    #[error("repack stopped")]
    Stopped,
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

// ── Shared plumbing ───────────────────────────────────────────────────────────

/// Counters updated by every task of one run.
#[derive(Debug, Default)]
pub(crate) struct Stats {
    read:    AtomicU64,
    written: AtomicU64,
    skipped: AtomicU64,
    merged:  AtomicU64,
    kept:    AtomicU64,
}

impl Stats {
    pub(crate) fn read(&self)    { self.read.fetch_add(1, Ordering::Relaxed); }
    pub(crate) fn written(&self) { self.written.fetch_add(1, Ordering::Relaxed); }
    pub(crate) fn skipped(&self) { self.skipped.fetch_add(1, Ordering::Relaxed); }
    pub(crate) fn merged(&self)  { self.merged.fetch_add(1, Ordering::Relaxed); }
    pub(crate) fn kept(&self)    { self.kept.fetch_add(1, Ordering::Relaxed); }

    pub(crate) fn written_count(&self) -> u64 { self.written.load(Ordering::Relaxed) }

    fn report(&self) -> RepackReport {
        RepackReport {
            documents_read:    self.read.load(Ordering::Relaxed),
            documents_written: self.written.load(Ordering::Relaxed),
            documents_skipped: self.skipped.load(Ordering::Relaxed),
            shards_merged:     self.merged.load(Ordering::Relaxed),
            shards_kept:       self.kept.load(Ordering::Relaxed),
        }
    }
}

/// `<target>.<n>`
pub fn shard_path(target: &Path, n: usize) -> PathBuf {
    let mut name = OsString::from(target.as_os_str());
    name.push(format!(".{n}"));
    PathBuf::from(name)
}

/// Re-raise a panic from a scoped task.
pub(crate) fn join<T>(handle: std::thread::ScopedJoinHandle<'_, T>) -> T {
    handle.join().unwrap_or_else(|payload| std::panic::resume_unwind(payload))
}

/// Pick the error to report for a run: cancellation wins, then the first
/// task failure in spawn order.
pub(crate) fn settle(
    opts:    &RepackOptions,
    results: impl IntoIterator<Item = Result<(), RepackError>>,
) -> Result<(), RepackError> {
    let mut first = None;
    for result in results {
        match result {
            Ok(()) => {}
            Err(RepackError::Stopped) => {}
            Err(e) => {
                if first.is_none() {
                    first = Some(e);
                }
            }
        }
    }
    if opts.stop.is_stopped() {
        return Err(RepackError::Stopped);
    }
    first.map_or(Ok(()), Err)
}

// ── Entry point ───────────────────────────────────────────────────────────────

/// Repack `opts.source` into `opts.target`.
pub fn repack(opts: &RepackOptions) -> Result<RepackReport, RepackError> {
    let mut opts = opts.clone();
    opts.workers = opts.workers.max(1);
    info!(
        source   = %opts.source.display(),
        target   = %opts.target.display(),
        workers  = opts.workers,
        split    = opts.split,
        merge    = opts.merge,
        topology = %opts.topology,
        "repack started"
    );
    let stats = Stats::default();
    match opts.topology {
        Topology::FileSharded      => file_sharded::run(&opts, &stats)?,
        Topology::PartitionSharded => partition_sharded::run(&opts, &stats)?,
    }
    let report = stats.report();
    info!(
        read    = report.documents_read,
        written = report.documents_written,
        skipped = report.documents_skipped,
        merged  = report.shards_merged,
        kept    = report.shards_kept,
        "repack finished"
    );
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn shard_names_append_index() {
        assert_eq!(shard_path(Path::new("/tmp/out.bin"), 3), PathBuf::from("/tmp/out.bin.3"));
    }

    #[test]
    fn topology_names_parse() {
        assert_eq!("file".parse::<Topology>().unwrap(), Topology::FileSharded);
        assert_eq!("Partition".parse::<Topology>().unwrap(), Topology::PartitionSharded);
        assert!("ring".parse::<Topology>().is_err());
        assert_eq!(Topology::PartitionSharded.to_string(), "partition");
    }

    #[test]
    fn settle_prefers_stop_then_first_failure() {
        let opts = RepackOptions::default();
        let failed = settle(&opts, vec![
            Ok(()),
            Err(RepackError::Seeder { offset: 9, source: RecordError::ReadDoc }),
            Err(RepackError::Io(io::Error::new(io::ErrorKind::Other, "later"))),
        ]);
        assert!(matches!(failed, Err(RepackError::Seeder { offset: 9, .. })));

        opts.stop.trigger();
        assert!(matches!(settle(&opts, vec![Ok(())]), Err(RepackError::Stopped)));
    }
}
