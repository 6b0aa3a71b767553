//! File-sharded repack: one seeder, N shard workers, one merger.
//!
//! ```text
//!  seeder ──docs──▶ worker 0 ─┐
//!          (bounded) worker 1 ─┼─shard names─▶ merger ──▶ target
//!                    worker N ─┘   (bounded)
//! ```
//!
//! Workers pull from one shared queue, so distribution follows demand.  A
//! worker rotates to a fresh shard every `split` documents and announces
//! each closed, non-empty shard.  The merger runs from the start and copies
//! shards in announcement order.
//!
//! Without `merge` there is no merger: closed shards are the output and are
//! written under the package codec themselves.  A single worker with no
//! `split` skips shards entirely and writes the target directly.

use std::fs::{self, File};
use std::io::{BufReader, BufWriter, Read, Seek};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread;

use crossbeam::channel::{self, Receiver, Sender};
use tracing::{debug, error, info, warn};

use super::{join, settle, shard_path, RepackError, RepackOptions, Stats};
use crate::codec::CodecId;
use crate::record::{Document, RecordError};
use crate::scanner::{Scanner, SeekOptions};
use crate::writer::{ContainerWriter, WriteError};

/// Where workers put their output.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Output {
    /// One worker writing the target itself.
    Direct,
    /// Rotating shards concatenated by the merger.
    Merged,
    /// Rotating shards left as the final containers.
    Shards,
}

impl Output {
    fn for_options(opts: &RepackOptions) -> Self {
        if opts.split == 0 && opts.workers == 1 {
            Output::Direct
        } else if opts.merge {
            Output::Merged
        } else {
            Output::Shards
        }
    }
}

pub(super) fn run(opts: &RepackOptions, stats: &Stats) -> Result<(), RepackError> {
    let file = File::open(&opts.source)
        .map_err(|source| RepackError::Open { path: opts.source.clone(), source })?;
    let mut scanner = Scanner::new(BufReader::new(file), opts.source_codec, opts.limits)?;

    let output = Output::for_options(opts);
    debug!(?output, "file-sharded repack");
    let (doc_tx, doc_rx) = channel::bounded::<Document>(opts.workers + 3);
    let (shard_tx, shard_rx) = channel::bounded::<PathBuf>(opts.workers);
    let next_shard = AtomicUsize::new(0);

    thread::scope(|scope| {
        let merger = (output == Output::Merged).then(|| scope.spawn(|| merge(shard_rx, opts, stats)));
        let shard_tx = (output == Output::Merged).then_some(shard_tx);

        let workers: Vec<_> = (0..opts.workers)
            .map(|no| {
                let docs = doc_rx.clone();
                let shards = shard_tx.clone();
                let next_shard = &next_shard;
                scope.spawn(move || work(no, docs, shards, output, opts, next_shard, stats))
            })
            .collect();
        drop(doc_rx);
        drop(shard_tx);

        let seeded = seed(&mut scanner, doc_tx, opts, stats);
        let mut results = vec![seeded];
        results.extend(workers.into_iter().map(join));
        results.extend(merger.map(join));
        settle(opts, results)
    })
}

// ── Seeder ────────────────────────────────────────────────────────────────────

fn seed<R: Read + Seek>(
    scanner: &mut Scanner<R>,
    docs:    Sender<Document>,
    opts:    &RepackOptions,
    stats:   &Stats,
) -> Result<(), RepackError> {
    let mut sent = 0u64;
    loop {
        if opts.stop.is_stopped() {
            info!(sent, "seeder stopped");
            return Err(RepackError::Stopped);
        }
        if opts.limit.is_some_and(|limit| sent >= limit) {
            break;
        }
        let offset = scanner.position()?;
        match scanner.read_next(true) {
            Ok(Some(doc)) => {
                stats.read();
                if docs.send(doc).is_err() {
                    warn!(offset, "no workers left, seeder exiting");
                    break;
                }
                sent += 1;
            }
            Ok(None) => break,
            // Framing was sound; the cursor already sits on the next record.
            Err(RecordError::Decompress(e)) if opts.skip_on_error => {
                warn!(offset, error = %e, "skipping undecodable document");
                stats.skipped();
            }
            Err(e) if opts.skip_on_error && e.is_malformed() => {
                warn!(offset, error = %e, "bad record, resynchronizing");
                stats.skipped();
                match scanner.next_valid(&SeekOptions::new(offset + 1, opts.limits))? {
                    Some((next, _)) => { scanner.seek(next)?; }
                    None            => break,
                }
            }
            Err(source) => return Err(RepackError::Seeder { offset, source }),
        }
    }
    info!(sent, "seeder done");
    Ok(())
}

// ── Workers ───────────────────────────────────────────────────────────────────

/// A shard (or, in direct mode, the target) being written by one worker.
struct Shard {
    path:   PathBuf,
    writer: ContainerWriter<BufWriter<File>>,
    output: Output,
}

impl Shard {
    fn open(opts: &RepackOptions, output: Output, next: &AtomicUsize) -> Result<Self, WriteError> {
        let (path, package) = match output {
            Output::Direct => (opts.target.clone(), opts.package_codec),
            Output::Merged => (shard_path(&opts.target, next.fetch_add(1, Ordering::SeqCst) + 1), CodecId::None),
            Output::Shards => (shard_path(&opts.target, next.fetch_add(1, Ordering::SeqCst) + 1), opts.package_codec),
        };
        let writer = ContainerWriter::create(&path, opts.target_codec, package)?;
        Ok(Self { path, writer, output })
    }

    /// Close the shard and hand it on; empty shards are removed.
    fn announce(self, shards: Option<&Sender<PathBuf>>, worker: usize, stats: &Stats) -> Result<(), WriteError> {
        let records = self.writer.records();
        if let Err(e) = self.writer.finish() {
            let _ = fs::remove_file(&self.path);
            return Err(e.into());
        }
        if self.output == Output::Direct {
            debug!(worker, target = %self.path.display(), records, "target closed");
            return Ok(());
        }
        if records == 0 {
            fs::remove_file(&self.path)?;
            return Ok(());
        }
        debug!(worker, shard = %self.path.display(), records, "shard closed");
        match shards {
            Some(tx) => {
                if tx.send(self.path).is_err() {
                    error!(worker, "merger is gone, shard left on disk");
                }
            }
            None => {
                stats.kept();
                info!(worker, shard = %self.path.display(), records, "shard written");
            }
        }
        Ok(())
    }

    /// Drop an unannounced shard after a failure.
    fn discard(self) {
        let path = self.path;
        drop(self.writer);
        if let Err(e) = fs::remove_file(&path) {
            warn!(shard = %path.display(), error = %e, "cannot remove failed shard");
        }
    }
}

fn work(
    no:     usize,
    docs:   Receiver<Document>,
    shards: Option<Sender<PathBuf>>,
    output: Output,
    opts:   &RepackOptions,
    next:   &AtomicUsize,
    stats:  &Stats,
) -> Result<(), RepackError> {
    let failed = |source: WriteError| RepackError::Worker { worker: no, source };
    let mut shard = Shard::open(opts, output, next).map_err(failed)?;
    debug!(worker = no, shard = %shard.path.display(), "worker started");

    for doc in docs.iter() {
        match shard.writer.write(&doc) {
            Ok(_) => stats.written(),
            Err(e) if e.is_document_error() => {
                warn!(worker = no, key = %String::from_utf8_lossy(&doc.key), error = %e, "document not written");
                stats.skipped();
                continue;
            }
            Err(e) => {
                error!(worker = no, shard = %shard.path.display(), error = %e, "worker failed");
                shard.discard();
                return Err(failed(e));
            }
        }
        if output != Output::Direct && opts.split > 0 && shard.writer.records() >= opts.split {
            shard.announce(shards.as_ref(), no, stats).map_err(failed)?;
            shard = Shard::open(opts, output, next).map_err(failed)?;
        }
    }
    shard.announce(shards.as_ref(), no, stats).map_err(failed)?;
    debug!(worker = no, "worker done");
    Ok(())
}

// ── Merger ────────────────────────────────────────────────────────────────────

fn merge(shards: Receiver<PathBuf>, opts: &RepackOptions, stats: &Stats) -> Result<(), RepackError> {
    let mut failure = None;
    let mut out = match ContainerWriter::create(&opts.target, opts.target_codec, opts.package_codec) {
        Ok(w)  => Some(w),
        Err(source) => {
            failure = Some(RepackError::Merge { shard: opts.target.clone(), source });
            None
        }
    };

    // Keep draining after a failure so workers never block on announce.
    for shard in shards.iter() {
        let Some(writer) = out.as_mut() else {
            warn!(shard = %shard.display(), "merge disabled, shard left on disk");
            continue;
        };
        match copy_shard(writer, &shard) {
            Ok(bytes) => {
                stats.merged();
                debug!(shard = %shard.display(), bytes, "shard merged");
                if let Err(e) = fs::remove_file(&shard) {
                    warn!(shard = %shard.display(), error = %e, "cannot remove merged shard");
                }
            }
            Err(source) => {
                error!(shard = %shard.display(), error = %source, "merge failed");
                failure = Some(RepackError::Merge { shard, source });
                out = None;
            }
        }
    }

    if let Some(e) = failure {
        return Err(e);
    }
    if let Some(writer) = out {
        writer
            .finish()
            .map_err(|source| RepackError::Merge { shard: opts.target.clone(), source })?;
    }
    Ok(())
}

fn copy_shard<W: std::io::Write>(writer: &mut ContainerWriter<W>, shard: &Path) -> std::io::Result<u64> {
    let file = File::open(shard)?;
    writer.append_raw(BufReader::new(file))
}
