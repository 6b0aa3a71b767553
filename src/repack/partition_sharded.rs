//! Partition-sharded repack: N partition readers, one writer.
//!
//! ```text
//!  partition 0 ─┐
//!  partition 1 ─┼─encoded docs─▶ writer ──▶ target
//!  partition N ─┘  (bounded)
//! ```
//!
//! Each reader owns a byte range of the source and a private file handle.
//! It resynchronizes to the first record starting in its range, decodes
//! records until its cursor reaches the range end, re-encodes them under the
//! target codec and sends them on.  The writer frames them in arrival order.
//!
//! A document `limit` is enforced by the writer: once reached it raises an
//! internal halt flag and drops its receiver, so readers stop at their next
//! record boundary or send.
//!
//! There are no shards here, so `merge` has no effect.

use std::fs::{self, File};
use std::io::BufReader;
use std::thread;

use crossbeam::channel::{self, Receiver, Sender};
use tracing::{debug, info, warn};

use super::{join, settle, RepackError, RepackOptions, Stats};
use crate::codec::get_codec;
use crate::partition::{partitions, Partition};
use crate::record::Document;
use crate::scanner::{Scanner, SeekOptions};
use crate::stop::StopSignal;
use crate::writer::{encode_document, ContainerWriter};

pub(super) fn run(opts: &RepackOptions, stats: &Stats) -> Result<(), RepackError> {
    let len = fs::metadata(&opts.source)
        .map_err(|source| RepackError::Open { path: opts.source.clone(), source })?
        .len();
    let parts = partitions(0, len, opts.workers);
    debug!(partitions = parts.len(), len, "partition-sharded repack");

    let halt = StopSignal::new();
    let (tx, rx) = channel::bounded::<Document>(opts.workers + 3);

    thread::scope(|scope| {
        let writer = scope.spawn(|| write(rx, opts, &halt, stats));

        let readers: Vec<_> = parts
            .iter()
            .map(|part| {
                let tx = tx.clone();
                let halt = &halt;
                scope.spawn(move || read_partition(*part, tx, opts, halt, stats))
            })
            .collect();
        drop(tx);

        let mut results: Vec<_> = readers.into_iter().map(join).collect();
        results.push(join(writer));
        settle(opts, results)
    })
}

fn read_partition(
    part:  Partition,
    docs:  Sender<Document>,
    opts:  &RepackOptions,
    halt:  &StopSignal,
    stats: &Stats,
) -> Result<(), RepackError> {
    let file = File::open(&opts.source)
        .map_err(|source| RepackError::Open { path: opts.source.clone(), source })?;
    let mut scanner = Scanner::new(BufReader::new(file), opts.source_codec, opts.limits)?;
    let codec = get_codec(opts.target_codec);

    let align = SeekOptions::new(part.start, opts.limits).with_end(part.end);
    let mut pos = match scanner.next_valid(&align)? {
        Some((pos, _)) if pos < part.end => pos,
        _ => {
            debug!(partition = part.index, "no record starts in partition");
            return Ok(());
        }
    };
    scanner.seek(pos)?;

    let mut sent = 0u64;
    while pos < part.end {
        if opts.stop.is_stopped() {
            info!(partition = part.index, sent, "partition stopped");
            return Err(RepackError::Stopped);
        }
        if halt.is_stopped() {
            break;
        }
        match scanner.read_next(true) {
            Ok(Some(doc)) => {
                stats.read();
                let encoded = match encode_document(doc, codec.as_ref()) {
                    Ok(d) => d,
                    Err(e) => {
                        warn!(partition = part.index, offset = pos, error = %e, "document not re-encoded");
                        stats.skipped();
                        pos = scanner.position()?;
                        continue;
                    }
                };
                pos = scanner.position()?;
                if docs.send(encoded).is_err() {
                    break;
                }
                sent += 1;
            }
            Ok(None) => break,
            Err(e) if opts.skip_on_error && e.is_malformed() => {
                warn!(partition = part.index, offset = pos, error = %e, "bad record, resynchronizing");
                stats.skipped();
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
                return Err(RepackError::Partition { partition: part.index, offset: pos, source });
            }
        }
    }
    debug!(partition = part.index, start = part.start, end = part.end, sent, "partition done");
    Ok(())
}

fn write(
    docs:  Receiver<Document>,
    opts:  &RepackOptions,
    halt:  &StopSignal,
    stats: &Stats,
) -> Result<(), RepackError> {
    let target = &opts.target;
    let mut out = ContainerWriter::create(target, opts.target_codec, opts.package_codec)
        .map_err(|source| RepackError::Merge { shard: target.clone(), source })?;

    for doc in docs.iter() {
        if let Err(source) = out.write_encoded(&doc) {
            halt.trigger();
            return Err(RepackError::Write { path: target.clone(), source });
        }
        stats.written();
        if opts.limit.is_some_and(|limit| stats.written_count() >= limit) {
            info!(limit = ?opts.limit, "document limit reached");
            halt.trigger();
            break;
        }
    }
    drop(docs);
    out.finish()
        .map_err(|source| RepackError::Merge { shard: target.clone(), source })?;
    Ok(())
}
