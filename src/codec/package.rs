//! Whole-stream "package" compression.
//!
//! A package layer wraps the entire concatenated byte stream of records,
//! independent of any per-record codec.  [`PackageWriter`] is owned by
//! exactly one task (a merger or a single writer) and must be finalized with
//! [`PackageWriter::finish`] exactly once; dropping it without `finish`
//! leaves a truncated stream for every codec except `None`.

use std::io::{self, Read, Write};

use super::{CodecId, BROTLI_QUALITY, XZ_PRESET, ZSTD_LEVEL};

/// Streaming encoder for one package codec, resolved once at construction.
pub enum PackageWriter<W: Write> {
    None(W),
    Gzip(flate2::write::GzEncoder<W>),
    Bzip2(bzip2::write::BzEncoder<W>),
    Brotli(Box<brotli::CompressorWriter<W>>),
    Lz4(lz4_flex::frame::FrameEncoder<W>),
    Xz(xz2::write::XzEncoder<W>),
    Zstd(zstd::stream::write::Encoder<'static, W>),
}

impl<W: Write> PackageWriter<W> {
    pub fn new(inner: W, codec: CodecId) -> io::Result<Self> {
        Ok(match codec {
            CodecId::None   => PackageWriter::None(inner),
            CodecId::Gzip   => PackageWriter::Gzip(
                flate2::write::GzEncoder::new(inner, flate2::Compression::default())),
            CodecId::Bzip2  => PackageWriter::Bzip2(
                bzip2::write::BzEncoder::new(inner, bzip2::Compression::default())),
            CodecId::Brotli => PackageWriter::Brotli(Box::new(
                brotli::CompressorWriter::new(inner, 4096, BROTLI_QUALITY, 22))),
            CodecId::Lz4    => PackageWriter::Lz4(lz4_flex::frame::FrameEncoder::new(inner)),
            CodecId::Xz     => PackageWriter::Xz(xz2::write::XzEncoder::new(inner, XZ_PRESET)),
            CodecId::Zstd   => PackageWriter::Zstd(zstd::stream::write::Encoder::new(inner, ZSTD_LEVEL)?),
        })
    }

    pub fn codec(&self) -> CodecId {
        match self {
            PackageWriter::None(_)   => CodecId::None,
            PackageWriter::Gzip(_)   => CodecId::Gzip,
            PackageWriter::Bzip2(_)  => CodecId::Bzip2,
            PackageWriter::Brotli(_) => CodecId::Brotli,
            PackageWriter::Lz4(_)    => CodecId::Lz4,
            PackageWriter::Xz(_)     => CodecId::Xz,
            PackageWriter::Zstd(_)   => CodecId::Zstd,
        }
    }

    /// Write the codec trailer, flush, and hand back the sink.
    pub fn finish(self) -> io::Result<W> {
        let mut inner = match self {
            PackageWriter::None(w)   => w,
            PackageWriter::Gzip(w)   => w.finish()?,
            PackageWriter::Bzip2(w)  => w.finish()?,
            PackageWriter::Brotli(w) => w.into_inner(),
            PackageWriter::Lz4(w)    => w.finish().map_err(|e| io::Error::new(io::ErrorKind::Other, e))?,
            PackageWriter::Xz(w)     => w.finish()?,
            PackageWriter::Zstd(w)   => w.finish()?,
        };
        inner.flush()?;
        Ok(inner)
    }
}

impl<W: Write> Write for PackageWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self {
            PackageWriter::None(w)   => w.write(buf),
            PackageWriter::Gzip(w)   => w.write(buf),
            PackageWriter::Bzip2(w)  => w.write(buf),
            PackageWriter::Brotli(w) => w.write(buf),
            PackageWriter::Lz4(w)    => w.write(buf),
            PackageWriter::Xz(w)     => w.write(buf),
            PackageWriter::Zstd(w)   => w.write(buf),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self {
            PackageWriter::None(w)   => w.flush(),
            PackageWriter::Gzip(w)   => w.flush(),
            PackageWriter::Bzip2(w)  => w.flush(),
            PackageWriter::Brotli(w) => w.flush(),
            PackageWriter::Lz4(w)    => w.flush(),
            PackageWriter::Xz(w)     => w.flush(),
            PackageWriter::Zstd(w)   => w.flush(),
        }
    }
}

/// Decode a package-compressed stream.
pub fn package_reader<'a, R: Read + 'a>(inner: R, codec: CodecId) -> io::Result<Box<dyn Read + 'a>> {
    Ok(match codec {
        CodecId::None   => Box::new(inner),
        CodecId::Gzip   => Box::new(flate2::read::MultiGzDecoder::new(inner)),
        CodecId::Bzip2  => Box::new(bzip2::read::MultiBzDecoder::new(inner)),
        CodecId::Brotli => Box::new(brotli::Decompressor::new(inner, 4096)),
        CodecId::Lz4    => Box::new(lz4_flex::frame::FrameDecoder::new(inner)),
        CodecId::Xz     => Box::new(xz2::read::XzDecoder::new_multi_decoder(inner)),
        CodecId::Zstd   => Box::new(zstd::stream::read::Decoder::new(inner)?),
    })
}
