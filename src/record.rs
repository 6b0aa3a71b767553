//! On-disk record framing.
//!
//! ```text
//! i32 LE  key_size
//! [u8]    key            (key_size bytes, never compressed)
//! i32 LE  content_size
//! [u8]    content        (content_size bytes, Compress(original, codec))
//! ```
//!
//! The codec is not recorded.  Records are written back to back with no
//! padding, magic or checksum, which is why recovery has to lean on
//! decompression to tell a real record from a lucky run of bytes.

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use std::io::{self, Read, Write};
use thiserror::Error;

use crate::codec::{Codec, CodecError};

/// Default upper bound on key length, in bytes.
pub const KEY_SIZE_LIMIT: u32 = 1000;
/// Default upper bound on content length, in bytes (1 GiB).
pub const MAX_DOC_SIZE: u64 = 0x4000_0000;
/// Placeholder key whose content is stored literally and never decompressed.
pub const EMPTY_DOC_KEY: &[u8] = b"empty-doc.";
/// Bytes of framing around key and content.
pub const FRAME_OVERHEAD: u64 = 8;

// ── Types ─────────────────────────────────────────────────────────────────────

/// A key/content pair.  Content is decoded when read through a scanner and
/// plain when handed to a writer.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default)]
pub struct Document {
    pub key:     Vec<u8>,
    pub content: Vec<u8>,
}

impl Document {
    pub fn new(key: impl Into<Vec<u8>>, content: impl Into<Vec<u8>>) -> Self {
        Self { key: key.into(), content: content.into() }
    }

    pub fn is_placeholder(&self) -> bool {
        self.key == EMPTY_DOC_KEY
    }

    /// Size of this document once framed, assuming `content` is final.
    pub fn framed_len(&self) -> u64 {
        FRAME_OVERHEAD + self.key.len() as u64 + self.content.len() as u64
    }
}

/// Header of one record: everything but the content bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DocumentHeader {
    pub key:          Vec<u8>,
    pub content_size: u64,
}

impl DocumentHeader {
    /// Bytes this record occupies on disk.
    pub fn record_len(&self) -> u64 {
        FRAME_OVERHEAD + self.key.len() as u64 + self.content_size
    }
}

/// Sanity bounds applied while scanning.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Limits {
    pub key_size_limit: u32,
    pub max_doc_size:   u64,
}

impl Default for Limits {
    fn default() -> Self {
        Self { key_size_limit: KEY_SIZE_LIMIT, max_doc_size: MAX_DOC_SIZE }
    }
}

// ── Error type ───────────────────────────────────────────────────────────────

#[derive(Error, Debug)]
pub enum RecordError {
    /// Fewer bytes remain than the key-size field or key require.
    #[error("key read error: record truncated inside its key")]
    ReadKey,
    /// Fewer bytes remain than the content-size field or content require.
    #[error("doc read error: record truncated inside its content")]
    ReadDoc,
    /// Length fields are out of range for a record.
    #[error("invalid document found: {0}")]
    InvalidDocument(String),
    /// Header is well formed but content does not decode.
    #[error("value decompress error: {0}")]
    Decompress(#[source] CodecError),
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

impl RecordError {
    /// True for errors that describe the bytes rather than the device.
    pub fn is_malformed(&self) -> bool {
        !matches!(self, RecordError::Io(_))
    }
}

// ── Framing ──────────────────────────────────────────────────────────────────

/// Write one record.  `doc.content` must already be in its final form.
pub fn write_record<W: Write>(mut writer: W, doc: &Document) -> Result<u64, RecordError> {
    let key_size = i32::try_from(doc.key.len())
        .map_err(|_| RecordError::InvalidDocument(format!("key of {} bytes", doc.key.len())))?;
    let content_size = i32::try_from(doc.content.len())
        .map_err(|_| RecordError::InvalidDocument(format!("content of {} bytes", doc.content.len())))?;
    if key_size == 0 {
        return Err(RecordError::InvalidDocument("empty key".into()));
    }
    writer.write_i32::<LittleEndian>(key_size)?;
    writer.write_all(&doc.key)?;
    writer.write_i32::<LittleEndian>(content_size)?;
    writer.write_all(&doc.content)?;
    Ok(doc.framed_len())
}

/// Produce the on-disk bytes of one record.
pub fn frame(doc: &Document) -> Result<Vec<u8>, RecordError> {
    let mut out = Vec::with_capacity(doc.framed_len() as usize);
    write_record(&mut out, doc)?;
    Ok(out)
}

/// Read exactly `buf.len()` bytes; returns how many were available before EOF.
fn fill<R: Read>(mut reader: R, buf: &mut [u8]) -> io::Result<usize> {
    let mut n = 0;
    while n < buf.len() {
        match reader.read(&mut buf[n..]) {
            Ok(0) => break,
            Ok(k) => n += k,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(n)
}

/// Read one record header and leave the reader at the first content byte.
///
/// Both length fields are checked against `limits` before anything is
/// allocated or read past them.  Returns `Ok(None)` when the reader is
/// exhausted exactly at a record boundary.
pub fn read_header<R: Read>(mut reader: R, limits: &Limits) -> Result<Option<DocumentHeader>, RecordError> {
    let mut size = [0u8; 4];
    match fill(&mut reader, &mut size)? {
        0 => return Ok(None),
        4 => {}
        _ => return Err(RecordError::ReadKey),
    }
    let key_size = i32::from_le_bytes(size);
    if key_size <= 0 {
        return Err(RecordError::InvalidDocument(format!("key size {key_size}")));
    }
    if key_size as u64 > limits.key_size_limit as u64 {
        return Err(RecordError::InvalidDocument(format!(
            "key size {key_size} exceeds limit {}", limits.key_size_limit)));
    }
    let mut key = vec![0u8; key_size as usize];
    if fill(&mut reader, &mut key)? != key.len() {
        return Err(RecordError::ReadKey);
    }
    let content_size = match reader.read_i32::<LittleEndian>() {
        Ok(n) => n,
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Err(RecordError::ReadDoc),
        Err(e) => return Err(e.into()),
    };
    if content_size < 0 {
        return Err(RecordError::InvalidDocument(format!("content size {content_size}")));
    }
    if content_size as u64 > limits.max_doc_size {
        return Err(RecordError::InvalidDocument(format!(
            "content size {content_size} exceeds limit {}", limits.max_doc_size)));
    }
    Ok(Some(DocumentHeader { key, content_size: content_size as u64 }))
}

/// Read the content bytes that follow `header`.
///
/// The buffer grows with the bytes actually present, so a header claiming
/// more than the stream holds fails without a full-size allocation.
pub fn read_content<R: Read>(reader: R, header: &DocumentHeader) -> Result<Vec<u8>, RecordError> {
    let mut content = Vec::new();
    reader.take(header.content_size).read_to_end(&mut content)?;
    if content.len() as u64 != header.content_size {
        return Err(RecordError::ReadDoc);
    }
    Ok(content)
}

/// Decode raw content under `codec`, honouring the placeholder key.
pub fn decode_content(key: &[u8], raw: Vec<u8>, codec: &dyn Codec) -> Result<Vec<u8>, RecordError> {
    if key == EMPTY_DOC_KEY {
        return Ok(raw);
    }
    codec.decompress(&raw).map_err(RecordError::Decompress)
}

/// Read one full record; `codec = None` leaves content as stored.
pub fn read_record<R: Read>(
    mut reader: R,
    codec:      Option<&dyn Codec>,
    limits:     &Limits,
) -> Result<Option<Document>, RecordError> {
    let Some(header) = read_header(&mut reader, limits)? else {
        return Ok(None);
    };
    let raw = read_content(&mut reader, &header)?;
    let content = match codec {
        Some(c) => decode_content(&header.key, raw, c)?,
        None    => raw,
    };
    Ok(Some(Document { key: header.key, content }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::{get_codec, CodecId};
    use proptest::prelude::*;
    use std::io::Cursor;

    #[test]
    fn layout_is_little_endian() {
        let bytes = frame(&Document::new("ab", "xyz")).unwrap();
        assert_eq!(bytes, [2, 0, 0, 0, b'a', b'b', 3, 0, 0, 0, b'x', b'y', b'z']);
    }

    #[test]
    fn clean_eof_is_none() {
        assert!(read_header(Cursor::new(Vec::<u8>::new()), &Limits::default()).unwrap().is_none());
    }

    #[test]
    fn truncations_are_classified() {
        let bytes = frame(&Document::new("key", "content")).unwrap();
        assert!(matches!(read_header(&bytes[..2], &Limits::default()), Err(RecordError::ReadKey)));
        assert!(matches!(read_header(&bytes[..5], &Limits::default()), Err(RecordError::ReadKey)));
        assert!(matches!(read_header(&bytes[..9], &Limits::default()), Err(RecordError::ReadDoc)));
        assert!(matches!(read_record(&bytes[..12], None, &Limits::default()), Err(RecordError::ReadDoc)));
    }

    #[test]
    fn bad_length_fields_are_invalid() {
        let neg_key = [0xff, 0xff, 0xff, 0xff, 1, 2, 3];
        assert!(matches!(read_header(&neg_key[..], &Limits::default()), Err(RecordError::InvalidDocument(_))));
        let mut neg_content = vec![1, 0, 0, 0, b'k'];
        neg_content.extend_from_slice(&(-5i32).to_le_bytes());
        assert!(matches!(read_header(&neg_content[..], &Limits::default()), Err(RecordError::InvalidDocument(_))));
        assert!(frame(&Document::new("", "x")).is_err());
    }

    /// Counts bytes pulled through it.
    struct Counting<R> { inner: R, read: u64 }

    impl<R: Read> Read for Counting<R> {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            let n = self.inner.read(buf)?;
            self.read += n as u64;
            Ok(n)
        }
    }

    #[test]
    fn oversized_lengths_fail_before_reading_on() {
        let mut bytes = 50_000_000i32.to_le_bytes().to_vec();
        bytes.resize(64 * 1024, 0);
        let mut r = Counting { inner: &bytes[..], read: 0 };
        let err = read_header(&mut r, &Limits::default()).unwrap_err();
        assert!(matches!(err, RecordError::InvalidDocument(_)));
        assert_eq!(r.read, 4);

        let mut bytes = vec![1, 0, 0, 0, b'k'];
        bytes.extend_from_slice(&i32::MAX.to_le_bytes());
        bytes.resize(64 * 1024, 0);
        let limits = Limits { key_size_limit: 10, max_doc_size: 1024 };
        let mut r = Counting { inner: &bytes[..], read: 0 };
        assert!(matches!(read_header(&mut r, &limits), Err(RecordError::InvalidDocument(_))));
        assert_eq!(r.read, 9);
    }

    #[test]
    fn short_content_fails_without_claimed_allocation() {
        let header = DocumentHeader { key: b"k".to_vec(), content_size: MAX_DOC_SIZE };
        assert!(matches!(read_content(&b"tiny"[..], &header), Err(RecordError::ReadDoc)));
    }

    #[test]
    fn placeholder_content_is_literal() {
        let gzip = get_codec(CodecId::Gzip);
        let doc  = Document::new(EMPTY_DOC_KEY, "not gzip at all");
        let bytes = frame(&doc).unwrap();
        let back = read_record(&bytes[..], Some(gzip.as_ref()), &Limits::default()).unwrap().unwrap();
        assert_eq!(back, doc);
        assert!(back.is_placeholder());
    }

    #[test]
    fn undecodable_content_is_a_decompress_error() {
        let gzip  = get_codec(CodecId::Gzip);
        let bytes = frame(&Document::new("k", "plain text")).unwrap();
        let err   = read_record(&bytes[..], Some(gzip.as_ref()), &Limits::default()).unwrap_err();
        assert!(matches!(err, RecordError::Decompress(_)));
        assert!(err.is_malformed());
    }

    proptest! {
        #[test]
        fn framing_reproduces_document(
            key     in proptest::collection::vec(any::<u8>(), 1..64),
            content in proptest::collection::vec(any::<u8>(), 0..512),
        ) {
            let doc   = Document { key, content };
            let bytes = frame(&doc).unwrap();
            prop_assert_eq!(bytes.len() as u64, doc.framed_len());
            let mut cur = Cursor::new(bytes);
            let back = read_record(&mut cur, None, &Limits::default()).unwrap().unwrap();
            prop_assert_eq!(back, doc);
            prop_assert!(read_record(&mut cur, None, &Limits::default()).unwrap().is_none());
        }
    }
}
