use clap::{Parser, Subcommand};
use binpack::codec::{package_reader, CodecId, PackageWriter};
use binpack::container::{Container, ContainerOptions, ListOptions, SearchOptions, SkipMatches};
use binpack::count::CountOptions;
use binpack::record::{self, Document, Limits};
use binpack::repack::{repack, RepackOptions, Topology};
use binpack::writer::{AppendWriter, ContainerWriter};
use regex::bytes::Regex;
use serde::Serialize;
use std::fs::File;
use std::io::{self, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "binpack", about = "Key/value container files: scan, count, search and repack")]
struct Cli {
    /// Debug logging (overridden by RUST_LOG)
    #[arg(short, long, global = true)]
    verbose: bool,
    /// Largest plausible key, in bytes
    #[arg(long, global = true, default_value_t = record::KEY_SIZE_LIMIT)]
    key_size_limit: u32,
    /// Largest plausible content, in bytes
    #[arg(long, global = true, default_value_t = record::MAX_DOC_SIZE)]
    max_doc_size: u64,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List record offsets and keys
    List {
        input: PathBuf,
        /// Record codec: gzip (default), bzip2, brotli, lz4, xz, zstd, none
        #[arg(short, long, default_value = "gzip")]
        codec: CodecId,
        #[arg(short, long, default_value = "0")]
        offset: u64,
        #[arg(short, long)]
        limit: Option<usize>,
        /// Keep every n-th record
        #[arg(long, default_value = "1")]
        step: usize,
        /// Key regex
        #[arg(short, long)]
        pattern: Option<String>,
        /// Resynchronize past bad records
        #[arg(short, long)]
        skip_on_error: bool,
    },
    /// Print decoded documents
    Read {
        input: PathBuf,
        #[arg(short, long, default_value = "gzip")]
        codec: CodecId,
        #[arg(short, long, default_value = "0")]
        offset: u64,
        #[arg(short, long)]
        limit: Option<usize>,
        #[arg(long, default_value = "1")]
        step: usize,
        #[arg(short, long)]
        skip_on_error: bool,
        /// Write documents to this file instead of stdout
        #[arg(short = 'O', long)]
        output: Option<PathBuf>,
        /// Compress the output file with this codec
        #[arg(long, default_value = "none", requires = "output")]
        out_codec: CodecId,
    },
    /// Count records, optionally in parallel partitions
    Count {
        input: PathBuf,
        #[arg(short, long, default_value = "gzip")]
        codec: CodecId,
        #[arg(short, long, default_value = "0")]
        offset: u64,
        /// End offset (exclusive); end of file when omitted
        #[arg(short, long)]
        end: Option<u64>,
        /// Partitions counted concurrently (default: CPU count)
        #[arg(short, long)]
        workers: Option<usize>,
        #[arg(short, long)]
        pattern: Option<String>,
        #[arg(short, long)]
        skip_on_error: bool,
        /// Trust headers without decompressing content
        #[arg(short, long)]
        key_only: bool,
        /// Print a JSON report
        #[arg(long)]
        json: bool,
    },
    /// Find the offset of a record whose key matches
    Search {
        input: PathBuf,
        pattern: String,
        #[arg(short, long, default_value = "gzip")]
        codec: CodecId,
        #[arg(short, long, default_value = "0")]
        offset: u64,
        /// Matches to skip before returning one
        #[arg(short = 'n', long, default_value = "0")]
        skip: u64,
        /// Skip a random number of matches (0-99)
        #[arg(short, long, conflicts_with = "skip")]
        random: bool,
        #[arg(short, long)]
        skip_on_error: bool,
        /// Pretty-print JSON content
        #[arg(long)]
        pretty: bool,
    },
    /// Find the first valid record at or after an offset
    Seek {
        input: PathBuf,
        offset: u64,
        #[arg(short, long, default_value = "gzip")]
        codec: CodecId,
        #[arg(short, long)]
        pattern: Option<String>,
    },
    /// Pack files into a container, one document per file
    Pack {
        #[arg(short, long)]
        output: PathBuf,
        #[arg(short, long, default_value = "gzip")]
        codec: CodecId,
        /// Whole-stream package codec
        #[arg(short = 'k', long, default_value = "none", conflicts_with = "append")]
        package: CodecId,
        /// Append to an existing container under an advisory lock
        #[arg(short, long)]
        append: bool,
        #[arg(short, long, required = true, num_args = 1..)]
        input: Vec<PathBuf>,
    },
    /// Rewrite a container under new codecs
    Repack {
        source: PathBuf,
        target: PathBuf,
        /// Worker count (default: CPU count)
        #[arg(short, long)]
        workers: Option<usize>,
        /// Documents per shard; 0 disables rotation
        #[arg(long, default_value = "0")]
        split: u64,
        #[arg(long, default_value = "gzip")]
        source_codec: CodecId,
        #[arg(short, long, default_value = "gzip")]
        target_codec: CodecId,
        #[arg(short = 'k', long, default_value = "none")]
        package_codec: CodecId,
        /// Maximum number of documents
        #[arg(short, long)]
        limit: Option<u64>,
        /// Keep the `<target>.<n>` shards instead of merging them into the target
        #[arg(long)]
        no_merge: bool,
        /// file (one reader, sharded writers) or partition (sharded readers, one writer)
        #[arg(long, default_value = "file")]
        topology: Topology,
        #[arg(short, long)]
        skip_on_error: bool,
    },
    /// Extract every document into a directory
    Unpack {
        input: PathBuf,
        #[arg(short = 'C', long, default_value = ".")]
        output_dir: PathBuf,
        #[arg(short, long, default_value = "gzip")]
        codec: CodecId,
        /// Package codec the container is wrapped in
        #[arg(short = 'k', long, default_value = "none")]
        package: CodecId,
    },
}

#[derive(Serialize)]
struct CountReport {
    path:    String,
    codec:   String,
    workers: usize,
    offset:  u64,
    count:   u64,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(if cli.verbose { "debug" } else { "warn" }));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
    let limits = Limits { key_size_limit: cli.key_size_limit, max_doc_size: cli.max_doc_size };

    match cli.command {

        // ── List ─────────────────────────────────────────────────────────────
        Commands::List { input, codec, offset, limit, step, pattern, skip_on_error } => {
            let mut c = Container::open(&input, ContainerOptions { codec, limits })?;
            let opts = ListOptions { offset, limit, step, pattern: parse_pattern(pattern)?, skip_on_error };
            println!("{:>14} {:>10}  Key", "Offset", "Stored");
            for e in c.list(&opts)? {
                println!("{:>14} {:>10}  {}", e.offset, e.content_size, display_key(&e.key));
            }
        }

        // ── Read ─────────────────────────────────────────────────────────────
        Commands::Read { input, codec, offset, limit, step, skip_on_error, output, out_codec } => {
            let mut c = Container::open(&input, ContainerOptions { codec, limits })?;
            let sink: Box<dyn Write> = match &output {
                Some(path) => Box::new(BufWriter::new(File::create(path)?)),
                None       => Box::new(io::stdout().lock()),
            };
            let mut out = PackageWriter::new(sink, out_codec)?;
            let step = step.max(1);
            let mut shown = 0usize;
            for (i, item) in c.documents(offset, skip_on_error)?.enumerate() {
                if limit.is_some_and(|l| shown >= l) {
                    break;
                }
                let (at, doc) = item.map_err(|(at, e)| format!("offset {at}: {e}"))?;
                if i % step != 0 {
                    continue;
                }
                writeln!(out, "{at}\t{}\t{}", display_key(&doc.key), String::from_utf8_lossy(&doc.content))?;
                shown += 1;
            }
            out.finish()?;
            if let Some(path) = output {
                info!(output = %path.display(), documents = shown, codec = %out_codec, "documents written");
            }
        }

        // ── Count ────────────────────────────────────────────────────────────
        Commands::Count { input, codec, offset, end, workers, pattern, skip_on_error, key_only, json } => {
            let c = Container::open(&input, ContainerOptions { codec, limits })?;
            let opts = CountOptions {
                offset,
                end,
                workers: workers.unwrap_or_else(num_cpus::get),
                pattern: parse_pattern(pattern)?,
                skip_on_error,
                key_only,
                limits,
                ..CountOptions::default()
            };
            let count = c.count(&opts)?;
            if json {
                let report = CountReport {
                    path:    input.display().to_string(),
                    codec:   codec.to_string(),
                    workers: opts.workers,
                    offset,
                    count,
                };
                println!("{}", serde_json::to_string(&report)?);
            } else {
                println!("{count}");
            }
        }

        // ── Search ───────────────────────────────────────────────────────────
        Commands::Search { input, pattern, codec, offset, skip, random, skip_on_error, pretty } => {
            let mut c = Container::open(&input, ContainerOptions { codec, limits })?;
            let opts = SearchOptions {
                offset,
                skip: if random { SkipMatches::Random } else { SkipMatches::Count(skip) },
                skip_on_error,
                ..SearchOptions::new(Regex::new(&pattern)?)
            };
            match c.search(&opts)? {
                Some(at) => {
                    println!("{at}");
                    if let Some(doc) = c.read_at(at)? {
                        print_document(&doc, pretty);
                    }
                }
                None => {
                    eprintln!("no key matches '{pattern}'");
                    std::process::exit(1);
                }
            }
        }

        // ── Seek ─────────────────────────────────────────────────────────────
        Commands::Seek { input, offset, codec, pattern } => {
            let mut c = Container::open(&input, ContainerOptions { codec, limits })?;
            match c.next_valid(offset, parse_pattern(pattern)?)? {
                Some((at, doc)) => println!("{at}\t{}\t{} bytes", display_key(&doc.key), doc.content.len()),
                None => {
                    eprintln!("no valid record at or after {offset}");
                    std::process::exit(1);
                }
            }
        }

        // ── Pack ─────────────────────────────────────────────────────────────
        Commands::Pack { output, codec, package, append, input } => {
            let docs = input.iter().map(|p| read_document(p));
            if append {
                let mut w = AppendWriter::open(&output, codec)?;
                for doc in docs {
                    let doc = doc?;
                    let at = w.append(&doc)?;
                    println!("  {at:>12}  {}", display_key(&doc.key));
                }
            } else {
                let mut w = ContainerWriter::create(&output, codec, package)?;
                for doc in docs {
                    let doc = doc?;
                    let at = w.write(&doc)?;
                    println!("  {at:>12}  {}", display_key(&doc.key));
                }
                info!(output = %output.display(), bytes = w.bytes_written(), "packed");
                w.finish()?;
            }
        }

        // ── Repack ───────────────────────────────────────────────────────────
        Commands::Repack {
            source, target, workers, split, source_codec, target_codec,
            package_codec, limit, no_merge, topology, skip_on_error,
        } => {
            let opts = RepackOptions {
                source,
                target,
                workers: workers.unwrap_or_else(num_cpus::get),
                split,
                source_codec,
                target_codec,
                package_codec,
                limit,
                merge: !no_merge,
                topology,
                skip_on_error,
                limits,
                ..RepackOptions::default()
            };
            let report = repack(&opts)?;
            println!("{}", serde_json::to_string_pretty(&report)?);
        }

        // ── Unpack ───────────────────────────────────────────────────────────
        Commands::Unpack { input, output_dir, codec, package } => {
            std::fs::create_dir_all(&output_dir)?;
            let mut reader = package_reader(BufReader::new(File::open(&input)?), package)?;
            let record_codec = binpack::get_codec(codec);
            let mut n = 0usize;
            while let Some(doc) = record::read_record(&mut reader, Some(record_codec.as_ref()), &limits)? {
                std::fs::write(output_dir.join(file_name(&doc.key)), &doc.content)?;
                n += 1;
            }
            println!("Unpacked {n} document(s) to {}", output_dir.display());
        }
    }

    Ok(())
}

// ── helpers ──────────────────────────────────────────────────────────────────

fn parse_pattern(p: Option<String>) -> Result<Option<Regex>, regex::Error> {
    p.map(|p| Regex::new(&p)).transpose()
}

fn display_key(key: &[u8]) -> String {
    match std::str::from_utf8(key) {
        Ok(s)  => s.to_owned(),
        Err(_) => hex::encode(key),
    }
}

/// A filesystem-safe name for a key.
fn file_name(key: &[u8]) -> String {
    match std::str::from_utf8(key) {
        Ok(s) if !s.is_empty() && !s.contains(['/', '\\']) && s != "." && s != ".." => s.to_owned(),
        _ => hex::encode(key),
    }
}

fn read_document(path: &Path) -> std::io::Result<Document> {
    let key = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.display().to_string());
    Ok(Document::new(key, std::fs::read(path)?))
}

fn print_document(doc: &Document, pretty: bool) {
    println!("{}", display_key(&doc.key));
    if pretty {
        if let Ok(value) = serde_json::from_slice::<serde_json::Value>(&doc.content) {
            if let Ok(text) = serde_json::to_string_pretty(&value) {
                println!("{text}");
                return;
            }
        }
    }
    println!("{}", String::from_utf8_lossy(&doc.content));
}
