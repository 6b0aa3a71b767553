//! Container writers.
//!
//! [`ContainerWriter`] frames documents into any `Write` sink, compressing
//! each content under the record codec and optionally wrapping the whole
//! stream in a package codec.  It is the single owner of its package state.
//!
//! [`AppendWriter`] appends to an existing container file and holds an
//! exclusive advisory lock only around each individual record write, so
//! several processes may take turns appending to one file.

use std::fs::{File, OpenOptions};
use std::io::{self, BufWriter, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use fs2::FileExt;
use thiserror::Error;
use tracing::trace;

use crate::codec::{get_codec, Codec, CodecError, CodecId, PackageWriter};
use crate::record::{self, Document, RecordError};

// ── Error type ───────────────────────────────────────────────────────────────

#[derive(Error, Debug)]
pub enum WriteError {
    #[error("compress error: {0}")]
    Compress(#[source] CodecError),
    #[error(transparent)]
    Record(#[from] RecordError),
    #[error("cannot lock {}: {source}", .path.display())]
    Lock { path: PathBuf, #[source] source: io::Error },
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

impl WriteError {
    /// True when only the document at hand is at fault, not the sink.
    pub fn is_document_error(&self) -> bool {
        match self {
            WriteError::Compress(_) => true,
            WriteError::Record(e)   => e.is_malformed(),
            _                       => false,
        }
    }
}

/// Compress `doc.content` under `codec`; placeholder content stays literal.
pub fn encode_document(doc: Document, codec: &dyn Codec) -> Result<Document, WriteError> {
    if doc.is_placeholder() {
        return Ok(doc);
    }
    let content = codec.compress(&doc.content).map_err(WriteError::Compress)?;
    Ok(Document { key: doc.key, content })
}

// ── ContainerWriter ──────────────────────────────────────────────────────────

pub struct ContainerWriter<W: Write> {
    sink:    PackageWriter<W>,
    codec:   Box<dyn Codec>,
    /// Offset of the next record in the unpackaged stream.
    offset:  u64,
    records: u64,
}

impl ContainerWriter<BufWriter<File>> {
    /// Create (or truncate) a container file at `path`.
    pub fn create<P: AsRef<Path>>(path: P, codec: CodecId, package: CodecId) -> io::Result<Self> {
        let file = File::create(path)?;
        Self::new(BufWriter::new(file), codec, package)
    }
}

impl<W: Write> ContainerWriter<W> {
    pub fn new(inner: W, codec: CodecId, package: CodecId) -> io::Result<Self> {
        Ok(Self {
            sink:    PackageWriter::new(inner, package)?,
            codec:   get_codec(codec),
            offset:  0,
            records: 0,
        })
    }

    pub fn codec(&self) -> CodecId { self.codec.codec_id() }
    /// Records written so far (raw appends not included).
    pub fn records(&self) -> u64 { self.records }
    /// Bytes written before package compression.
    pub fn bytes_written(&self) -> u64 { self.offset }

    /// Compress and frame one document.  Returns its offset in the
    /// unpackaged stream.
    pub fn write(&mut self, doc: &Document) -> Result<u64, WriteError> {
        let encoded = encode_document(doc.clone(), self.codec.as_ref())?;
        self.write_encoded(&encoded)
    }

    /// Frame a document whose content is already encoded.
    pub fn write_encoded(&mut self, doc: &Document) -> Result<u64, WriteError> {
        let at = self.offset;
        self.offset += record::write_record(&mut self.sink, doc)?;
        self.records += 1;
        trace!(offset = at, key_len = doc.key.len(), "record written");
        Ok(at)
    }

    /// Copy already-framed bytes (a closed shard) into the stream.
    pub fn append_raw<R: Read>(&mut self, mut reader: R) -> io::Result<u64> {
        let n = io::copy(&mut reader, &mut self.sink)?;
        self.offset += n;
        Ok(n)
    }

    /// Finalize the package layer and return the sink.
    pub fn finish(self) -> io::Result<W> {
        self.sink.finish()
    }
}

// ── AppendWriter ─────────────────────────────────────────────────────────────

pub struct AppendWriter {
    file:  File,
    path:  PathBuf,
    codec: Box<dyn Codec>,
}

impl AppendWriter {
    /// Open `path` for appending, creating it if missing.
    pub fn open<P: AsRef<Path>>(path: P, codec: CodecId) -> Result<Self, WriteError> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)?;
        Ok(Self { file, path, codec: get_codec(codec) })
    }

    pub fn path(&self) -> &Path { &self.path }

    /// Append one document under an exclusive lock.  Returns its offset.
    pub fn append(&mut self, doc: &Document) -> Result<u64, WriteError> {
        let encoded = encode_document(doc.clone(), self.codec.as_ref())?;
        let bytes = record::frame(&encoded)?;

        self.file
            .lock_exclusive()
            .map_err(|source| WriteError::Lock { path: self.path.clone(), source })?;
        let written = self.write_locked(&bytes);
        let unlocked = FileExt::unlock(&self.file);
        let offset = written?;
        unlocked.map_err(|source| WriteError::Lock { path: self.path.clone(), source })?;
        Ok(offset)
    }

    fn write_locked(&mut self, bytes: &[u8]) -> io::Result<u64> {
        let offset = self.file.seek(SeekFrom::End(0))?;
        self.file.write_all(bytes)?;
        self.file.flush()?;
        Ok(offset)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::package_reader;
    use crate::record::{read_record, Limits, EMPTY_DOC_KEY};
    use std::io::Cursor;

    #[test]
    fn writer_frames_and_compresses() {
        let mut w = ContainerWriter::new(Vec::new(), CodecId::Gzip, CodecId::None).unwrap();
        let a = Document::new("a", "alpha alpha alpha");
        let b = Document::new("b", "");
        assert_eq!(w.write(&a).unwrap(), 0);
        let second = w.write(&b).unwrap();
        assert!(second > 0);
        assert_eq!(w.records(), 2);
        let bytes = w.finish().unwrap();

        let gzip = get_codec(CodecId::Gzip);
        let mut cur = Cursor::new(bytes);
        assert_eq!(read_record(&mut cur, Some(gzip.as_ref()), &Limits::default()).unwrap().unwrap(), a);
        assert_eq!(cur.position(), second);
        assert_eq!(read_record(&mut cur, Some(gzip.as_ref()), &Limits::default()).unwrap().unwrap(), b);
    }

    #[test]
    fn placeholder_is_stored_literally() {
        let mut w = ContainerWriter::new(Vec::new(), CodecId::Zstd, CodecId::None).unwrap();
        let doc = Document::new(EMPTY_DOC_KEY, "kept as is");
        w.write(&doc).unwrap();
        let bytes = w.finish().unwrap();
        assert_eq!(read_record(&bytes[..], None, &Limits::default()).unwrap().unwrap(), doc);
    }

    #[test]
    fn package_layer_wraps_the_stream() {
        let mut w = ContainerWriter::new(Vec::new(), CodecId::None, CodecId::Xz).unwrap();
        for i in 0..10 {
            w.write(&Document::new(format!("k{i}"), vec![b'z'; 200])).unwrap();
        }
        let packed = w.finish().unwrap();
        assert!(packed.len() < 10 * 200);

        let mut plain = Vec::new();
        package_reader(&packed[..], CodecId::Xz).unwrap().read_to_end(&mut plain).unwrap();
        let mut cur = Cursor::new(plain);
        let mut n = 0;
        while let Some(doc) = read_record(&mut cur, None, &Limits::default()).unwrap() {
            assert_eq!(doc.content.len(), 200);
            n += 1;
        }
        assert_eq!(n, 10);
    }

    #[test]
    fn empty_key_is_rejected() {
        let mut w = ContainerWriter::new(Vec::new(), CodecId::None, CodecId::None).unwrap();
        assert!(matches!(w.write(&Document::new("", "x")), Err(WriteError::Record(_))));
    }

    #[test]
    fn append_writer_extends_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("c.bin");
        let mut w = AppendWriter::open(&path, CodecId::Lz4).unwrap();
        assert_eq!(w.append(&Document::new("one", "1")).unwrap(), 0);
        drop(w);

        let mut w = AppendWriter::open(&path, CodecId::Lz4).unwrap();
        let second = w.append(&Document::new("two", "2")).unwrap();
        assert!(second > 0);

        let bytes = std::fs::read(&path).unwrap();
        let lz4 = get_codec(CodecId::Lz4);
        let mut cur = Cursor::new(bytes);
        assert_eq!(read_record(&mut cur, Some(lz4.as_ref()), &Limits::default()).unwrap().unwrap().key, b"one");
        assert_eq!(cur.position(), second);
        assert_eq!(read_record(&mut cur, Some(lz4.as_ref()), &Limits::default()).unwrap().unwrap().content, b"2");
    }
}
