//! Positional reader over one container.
//!
//! # Access paths
//!
//! | Call | Reads content | Decompresses | Use |
//! |------|---------------|--------------|-----|
//! | [`Scanner::read_at`] / [`Scanner::read_next`] | yes | optional | exact reads, repack seeding |
//! | [`Scanner::read_key`] | no (seeks past) | no | list, search |
//! | [`Scanner::skip_next`] | no (seeks past) | no | fast counting |
//! | [`Scanner::next_valid`] | yes | yes | resynchronization |
//!
//! End-of-stream at a record boundary is `Ok(None)`, never an error.
//! Truncation inside a record is [`RecordError::ReadKey`] or
//! [`RecordError::ReadDoc`].  Every failed sequential call restores the
//! cursor to the start of the record it was looking at.

mod resync;

use std::io::{self, Read, Seek, SeekFrom};

use tracing::{trace, warn};

use crate::codec::{get_codec, Codec, CodecId};
use crate::record::{self, Document, DocumentHeader, Limits, RecordError};

pub use resync::SeekOptions;

// ── Scanner ───────────────────────────────────────────────────────────────────

pub struct Scanner<R: Read + Seek> {
    reader: R,
    codec:  Box<dyn Codec>,
    limits: Limits,
    len:    u64,
}

impl<R: Read + Seek> Scanner<R> {
    /// Wrap `reader`.  The stream length is sampled once; the cursor is left
    /// where it was.
    pub fn new(mut reader: R, codec: CodecId, limits: Limits) -> io::Result<Self> {
        let pos = reader.stream_position()?;
        let len = reader.seek(SeekFrom::End(0))?;
        reader.seek(SeekFrom::Start(pos))?;
        Ok(Self { reader, codec: get_codec(codec), limits, len })
    }

    pub fn codec(&self) -> CodecId { self.codec.codec_id() }
    pub fn limits(&self) -> Limits { self.limits }
    /// Stream length in bytes, as sampled at construction.
    pub fn len(&self) -> u64 { self.len }
    pub fn is_empty(&self) -> bool { self.len == 0 }

    pub fn position(&mut self) -> io::Result<u64> {
        self.reader.stream_position()
    }

    pub fn seek(&mut self, offset: u64) -> io::Result<u64> {
        self.reader.seek(SeekFrom::Start(offset))
    }

    // ── Sequential reads ─────────────────────────────────────────────────────

    /// Read the record at `offset`.
    pub fn read_at(&mut self, offset: u64, decompress: bool) -> Result<Option<Document>, RecordError> {
        self.seek(offset)?;
        self.read_next(decompress)
    }

    /// Read the record at the cursor and advance past it.
    ///
    /// A decompression failure still advances the cursor past the record,
    /// since its framing was sound; structural failures restore it.
    pub fn read_next(&mut self, decompress: bool) -> Result<Option<Document>, RecordError> {
        let start = self.position()?;
        let header = match self.checked_header(start) {
            Ok(Some(h)) => h,
            Ok(None)    => return Ok(None),
            Err(e)      => return self.restore(start, e),
        };
        let raw = match record::read_content(&mut self.reader, &header) {
            Ok(raw) => raw,
            Err(e)  => return self.restore(start, e),
        };
        let content = if decompress {
            record::decode_content(&header.key, raw, self.codec.as_ref())?
        } else {
            raw
        };
        Ok(Some(Document { key: header.key, content }))
    }

    /// Read the header at the cursor and seek past the content.
    pub fn read_key(&mut self) -> Result<Option<DocumentHeader>, RecordError> {
        self.skip_next()
    }

    /// Advance past one record without reading its content.
    ///
    /// Applies the scanner's limits and requires the declared content to fit
    /// inside the stream.  On error the cursor is back at the record start.
    pub fn skip_next(&mut self) -> Result<Option<DocumentHeader>, RecordError> {
        let start = self.position()?;
        let header = match self.checked_header(start) {
            Ok(Some(h)) => h,
            Ok(None)    => return Ok(None),
            Err(e)      => return self.restore(start, e),
        };
        self.reader.seek(SeekFrom::Start(start + header.record_len()))?;
        Ok(Some(header))
    }

    /// Skip one record and confirm its content decodes.
    pub fn verify_next(&mut self) -> Result<Option<DocumentHeader>, RecordError> {
        let start = self.position()?;
        let Some(doc) = self.read_next(true)? else {
            return Ok(None);
        };
        let content_size = self.position()? - start - record::FRAME_OVERHEAD - doc.key.len() as u64;
        Ok(Some(DocumentHeader { key: doc.key, content_size }))
    }

    /// Iterate decoded documents from the cursor.
    pub fn documents(&mut self, skip_on_error: bool) -> Documents<'_, R> {
        Documents { scanner: self, skip_on_error, done: false }
    }

    // ── Internal helpers ─────────────────────────────────────────────────────

    fn checked_header(&mut self, start: u64) -> Result<Option<DocumentHeader>, RecordError> {
        let Some(header) = record::read_header(&mut self.reader, &self.limits)? else {
            return Ok(None);
        };
        if start + header.record_len() > self.len {
            return Err(RecordError::ReadDoc);
        }
        Ok(Some(header))
    }

    fn restore<T>(&mut self, start: u64, err: RecordError) -> Result<T, RecordError> {
        trace!(offset = start, error = %err, "restoring cursor after failed read");
        self.seek(start)?;
        Err(err)
    }
}

// ── Document iterator ─────────────────────────────────────────────────────────

/// Decoded `(offset, document)` pairs from a scanner's cursor onwards.
///
/// With `skip_on_error`, a bad record triggers resynchronization from the
/// byte after its start; otherwise the error is yielded once and iteration
/// ends.
pub struct Documents<'a, R: Read + Seek> {
    scanner:       &'a mut Scanner<R>,
    skip_on_error: bool,
    done:          bool,
}

impl<R: Read + Seek> Iterator for Documents<'_, R> {
    type Item = Result<(u64, Document), (u64, RecordError)>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        let offset = match self.scanner.position() {
            Ok(p)  => p,
            Err(e) => { self.done = true; return Some(Err((0, e.into()))); }
        };
        match self.scanner.read_next(true) {
            Ok(Some(doc)) => Some(Ok((offset, doc))),
            Ok(None)      => { self.done = true; None }
            Err(e) if self.skip_on_error && e.is_malformed() => {
                warn!(offset, error = %e, "bad record, resynchronizing");
                let opts = SeekOptions::new(offset + 1, self.scanner.limits());
                let found = self.scanner.next_valid(&opts).map_err(RecordError::from);
                match found {
                    Ok(Some((pos, doc))) => {
                        // Re-walk the confirmed header to land on the next record.
                        let advanced = self.scanner.seek(pos).map_err(RecordError::from)
                            .and_then(|_| self.scanner.skip_next());
                        if let Err(e) = advanced {
                            self.done = true;
                            return Some(Err((pos, e)));
                        }
                        Some(Ok((pos, doc)))
                    }
                    Ok(None) => { self.done = true; None }
                    Err(e)   => { self.done = true; Some(Err((offset, e))) }
                }
            }
            Err(e) => { self.done = true; Some(Err((offset, e))) }
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::codec::compress;
    use crate::record::frame;
    use std::io::Cursor;

    /// Gzip-encoded container bytes plus each record's start offset.
    pub(crate) fn gzip_container(n: usize) -> (Vec<u8>, Vec<u64>, Vec<Document>) {
        let mut bytes   = Vec::new();
        let mut offsets = Vec::new();
        let mut docs    = Vec::new();
        for i in 0..n {
            let doc = Document::new(
                format!("key-{i:05}"),
                format!("{{\"id\":{i},\"body\":\"{}\"}}", "x".repeat(i % 37)),
            );
            let stored = Document::new(doc.key.clone(), compress(&doc.content, CodecId::Gzip).unwrap());
            offsets.push(bytes.len() as u64);
            bytes.extend(frame(&stored).unwrap());
            docs.push(doc);
        }
        (bytes, offsets, docs)
    }

    fn scanner(bytes: Vec<u8>) -> Scanner<Cursor<Vec<u8>>> {
        Scanner::new(Cursor::new(bytes), CodecId::Gzip, Limits::default()).unwrap()
    }

    #[test]
    fn sequential_read_decodes_in_order() {
        let (bytes, offsets, docs) = gzip_container(5);
        let mut s = scanner(bytes);
        for (i, doc) in docs.iter().enumerate() {
            assert_eq!(s.position().unwrap(), offsets[i]);
            assert_eq!(s.read_next(true).unwrap().as_ref(), Some(doc));
        }
        assert!(s.read_next(true).unwrap().is_none());
    }

    #[test]
    fn read_at_exact_offset() {
        let (bytes, offsets, docs) = gzip_container(4);
        let mut s = scanner(bytes);
        assert_eq!(s.read_at(offsets[2], true).unwrap().unwrap(), docs[2]);
        let raw = s.read_at(offsets[1], false).unwrap().unwrap();
        assert_eq!(raw.key, docs[1].key);
        assert_ne!(raw.content, docs[1].content);
    }

    #[test]
    fn skip_next_walks_headers() {
        let (bytes, offsets, docs) = gzip_container(6);
        let mut s = scanner(bytes);
        for i in 0..6 {
            let h = s.skip_next().unwrap().unwrap();
            assert_eq!(h.key, docs[i].key);
            let next = offsets.get(i + 1).copied().unwrap_or(s.len());
            assert_eq!(s.position().unwrap(), next);
        }
        assert!(s.skip_next().unwrap().is_none());
    }

    #[test]
    fn truncated_tail_restores_cursor() {
        let (mut bytes, offsets, _) = gzip_container(3);
        bytes.truncate(bytes.len() - 3);
        let mut s = scanner(bytes);
        s.seek(offsets[2]).unwrap();
        assert!(matches!(s.skip_next(), Err(RecordError::ReadDoc)));
        assert_eq!(s.position().unwrap(), offsets[2]);
        assert!(matches!(s.read_next(true), Err(RecordError::ReadDoc)));
        assert_eq!(s.position().unwrap(), offsets[2]);
    }

    #[test]
    fn limits_reject_oversized_headers() {
        let (bytes, _, _) = gzip_container(1);
        let tight = Limits { key_size_limit: 3, ..Limits::default() };
        let mut s = Scanner::new(Cursor::new(bytes), CodecId::Gzip, tight).unwrap();
        assert!(matches!(s.skip_next(), Err(RecordError::InvalidDocument(_))));
        assert_eq!(s.position().unwrap(), 0);
    }

    /// Seekable reader that tallies bytes read.
    struct Counting { inner: Cursor<Vec<u8>>, read: u64 }

    impl Read for Counting {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            let n = self.inner.read(buf)?;
            self.read += n as u64;
            Ok(n)
        }
    }

    impl Seek for Counting {
        fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> { self.inner.seek(pos) }
    }

    #[test]
    fn huge_key_size_is_rejected_from_the_header() {
        let mut bytes = 50_000_000i32.to_le_bytes().to_vec();
        bytes.resize(60_000_000, 0);
        let counting = Counting { inner: Cursor::new(bytes), read: 0 };
        let mut s = Scanner::new(counting, CodecId::Gzip, Limits::default()).unwrap();
        assert!(matches!(s.skip_next(), Err(RecordError::InvalidDocument(_))));
        assert!(matches!(s.read_next(true), Err(RecordError::InvalidDocument(_))));
        assert_eq!(s.position().unwrap(), 0);
        assert!(s.reader.read <= 8);
    }

    #[test]
    fn verify_next_catches_bad_content() {
        let (mut bytes, offsets, _) = gzip_container(3);
        let mid = ((offsets[1] + offsets[2]) / 2) as usize;
        bytes[mid] ^= 0xff;
        let mut s = scanner(bytes);
        assert!(s.verify_next().unwrap().is_some());
        assert!(matches!(s.verify_next(), Err(RecordError::Decompress(_))));
    }

    #[test]
    fn documents_iterator_skips_corruption() {
        let (mut bytes, offsets, docs) = gzip_container(5);
        let mid = ((offsets[2] + offsets[3]) / 2) as usize;
        bytes[mid] ^= 0xff;
        let mut s = scanner(bytes.clone());
        let got: Vec<_> = s.documents(true).map(|r| r.unwrap()).collect();
        let keys: Vec<_> = got.iter().map(|(_, d)| d.key.clone()).collect();
        let want: Vec<_> = [0, 1, 3, 4].iter().map(|&i| docs[i].key.clone()).collect();
        assert_eq!(keys, want);
        assert_eq!(got[2].0, offsets[3]);

        let mut strict = scanner(bytes);
        let results: Vec<_> = strict.documents(false).collect();
        assert_eq!(results.len(), 3);
        assert!(results[2].is_err());
    }
}
