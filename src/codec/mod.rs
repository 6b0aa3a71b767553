//! Codec registry: small integer identities, resolved once into a trait object.
//!
//! # Identity rules
//! A container never records which codec compressed its documents.  Writer
//! and reader agree on the [`CodecId`] out-of-band (CLI flag, caller option).
//! The numeric tag is an in-process convenience only and is never written
//! into a record header.
//!
//! # Dispatch
//! Callers resolve a `CodecId` through [`get_codec`] once, at construction
//! time, and keep the returned `Box<dyn Codec>` for the lifetime of the
//! scanner, writer or worker.  Nothing re-dispatches per document.
//!
//! # Confirmation
//! [`Codec::decompress`] doubles as the resynchronization confirmation
//! signal, so every non-identity codec must fail on input it did not
//! produce.  An empty payload is always rejected: a real compressed payload
//! carries at least a stream header.

pub mod package;

use std::io::{self, Read, Write};
use thiserror::Error;

pub use package::{package_reader, PackageWriter};

// ── CodecId enum ─────────────────────────────────────────────────────────────

/// Runtime codec discriminant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum CodecId {
    /// Identity transform.
    None   = 0,
    #[default]
    Gzip   = 1,
    Bzip2  = 2,
    Brotli = 3,
    Lz4    = 4,
    Xz     = 5,
    Zstd   = 6,
}

impl CodecId {
    pub const ALL: [CodecId; 7] = [
        CodecId::None,
        CodecId::Gzip,
        CodecId::Bzip2,
        CodecId::Brotli,
        CodecId::Lz4,
        CodecId::Xz,
        CodecId::Zstd,
    ];

    /// Human-readable name (diagnostics and CLI help).
    pub fn name(self) -> &'static str {
        match self {
            CodecId::None   => "none",
            CodecId::Gzip   => "gzip",
            CodecId::Bzip2  => "bzip2",
            CodecId::Brotli => "brotli",
            CodecId::Lz4    => "lz4",
            CodecId::Xz     => "xz",
            CodecId::Zstd   => "zstd",
        }
    }

    /// Parse from a CLI string.  Accepts the usual short aliases.
    pub fn from_name(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "none"          => Some(CodecId::None),
            "gzip" | "gz"   => Some(CodecId::Gzip),
            "bzip2" | "bz2" => Some(CodecId::Bzip2),
            "brotli" | "br" => Some(CodecId::Brotli),
            "lz4"           => Some(CodecId::Lz4),
            "xz"            => Some(CodecId::Xz),
            "zstd" | "zst"  => Some(CodecId::Zstd),
            _               => None,
        }
    }
}

impl TryFrom<u8> for CodecId {
    type Error = CodecError;

    fn try_from(tag: u8) -> Result<Self, Self::Error> {
        CodecId::ALL
            .into_iter()
            .find(|c| *c as u8 == tag)
            .ok_or(CodecError::UnknownCodec(tag))
    }
}

impl std::fmt::Display for CodecId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

impl std::str::FromStr for CodecId {
    type Err = CodecError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        CodecId::from_name(s).ok_or_else(|| CodecError::UnknownName(s.to_owned()))
    }
}

// ── Error type ───────────────────────────────────────────────────────────────

#[derive(Error, Debug)]
pub enum CodecError {
    #[error("Compression error: {0}")]
    Compression(String),
    #[error("Decompression error: {0}")]
    Decompression(String),
    #[error("Unknown codec tag {0}")]
    UnknownCodec(u8),
    #[error("Unknown codec name '{0}'")]
    UnknownName(String),
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

// ── Codec trait ──────────────────────────────────────────────────────────────

pub trait Codec: Send + Sync {
    fn codec_id(&self) -> CodecId;
    fn compress(&self, data: &[u8]) -> Result<Vec<u8>, CodecError>;
    fn decompress(&self, data: &[u8]) -> Result<Vec<u8>, CodecError>;
}

fn reject_empty(data: &[u8]) -> Result<(), CodecError> {
    if data.is_empty() {
        return Err(CodecError::Decompression("empty payload".into()));
    }
    Ok(())
}

fn read_all<R: Read>(mut r: R) -> Result<Vec<u8>, CodecError> {
    let mut out = Vec::new();
    r.read_to_end(&mut out)
        .map_err(|e| CodecError::Decompression(e.to_string()))?;
    Ok(out)
}

// ── Built-in codec implementations ──────────────────────────────────────────

pub struct NoneCodec;
impl Codec for NoneCodec {
    fn codec_id(&self) -> CodecId { CodecId::None }
    fn compress(&self, data: &[u8])   -> Result<Vec<u8>, CodecError> { Ok(data.to_vec()) }
    fn decompress(&self, data: &[u8]) -> Result<Vec<u8>, CodecError> { Ok(data.to_vec()) }
}

pub struct GzipCodec;
impl Codec for GzipCodec {
    fn codec_id(&self) -> CodecId { CodecId::Gzip }
    fn compress(&self, data: &[u8]) -> Result<Vec<u8>, CodecError> {
        let mut w = flate2::write::GzEncoder::new(Vec::new(), flate2::Compression::default());
        w.write_all(data).map_err(|e| CodecError::Compression(e.to_string()))?;
        w.finish().map_err(|e| CodecError::Compression(e.to_string()))
    }
    fn decompress(&self, data: &[u8]) -> Result<Vec<u8>, CodecError> {
        reject_empty(data)?;
        read_all(flate2::read::GzDecoder::new(data))
    }
}

pub struct Bzip2Codec;
impl Codec for Bzip2Codec {
    fn codec_id(&self) -> CodecId { CodecId::Bzip2 }
    fn compress(&self, data: &[u8]) -> Result<Vec<u8>, CodecError> {
        let mut w = bzip2::write::BzEncoder::new(Vec::new(), bzip2::Compression::default());
        w.write_all(data).map_err(|e| CodecError::Compression(e.to_string()))?;
        w.finish().map_err(|e| CodecError::Compression(e.to_string()))
    }
    fn decompress(&self, data: &[u8]) -> Result<Vec<u8>, CodecError> {
        reject_empty(data)?;
        read_all(bzip2::read::BzDecoder::new(data))
    }
}

pub struct BrotliCodec;
impl Codec for BrotliCodec {
    fn codec_id(&self) -> CodecId { CodecId::Brotli }
    fn compress(&self, data: &[u8]) -> Result<Vec<u8>, CodecError> {
        let mut out = Vec::new();
        {
            let mut w = brotli::CompressorWriter::new(&mut out, 4096, BROTLI_QUALITY, 22);
            w.write_all(data).map_err(|e| CodecError::Compression(e.to_string()))?;
        }
        Ok(out)
    }
    fn decompress(&self, data: &[u8]) -> Result<Vec<u8>, CodecError> {
        reject_empty(data)?;
        read_all(brotli::Decompressor::new(data, 4096))
    }
}

pub struct Lz4Codec;
impl Codec for Lz4Codec {
    fn codec_id(&self) -> CodecId { CodecId::Lz4 }
    fn compress(&self, data: &[u8]) -> Result<Vec<u8>, CodecError> {
        let mut w = lz4_flex::frame::FrameEncoder::new(Vec::new());
        w.write_all(data).map_err(|e| CodecError::Compression(e.to_string()))?;
        w.finish().map_err(|e| CodecError::Compression(e.to_string()))
    }
    fn decompress(&self, data: &[u8]) -> Result<Vec<u8>, CodecError> {
        reject_empty(data)?;
        read_all(lz4_flex::frame::FrameDecoder::new(data))
    }
}

pub struct XzCodec;
impl Codec for XzCodec {
    fn codec_id(&self) -> CodecId { CodecId::Xz }
    fn compress(&self, data: &[u8]) -> Result<Vec<u8>, CodecError> {
        let mut w = xz2::write::XzEncoder::new(Vec::new(), XZ_PRESET);
        w.write_all(data).map_err(|e| CodecError::Compression(e.to_string()))?;
        w.finish().map_err(|e| CodecError::Compression(e.to_string()))
    }
    fn decompress(&self, data: &[u8]) -> Result<Vec<u8>, CodecError> {
        reject_empty(data)?;
        read_all(xz2::read::XzDecoder::new(data))
    }
}

pub struct ZstdCodec;
impl Codec for ZstdCodec {
    fn codec_id(&self) -> CodecId { CodecId::Zstd }
    fn compress(&self, data: &[u8]) -> Result<Vec<u8>, CodecError> {
        zstd::encode_all(data, ZSTD_LEVEL).map_err(|e| CodecError::Compression(e.to_string()))
    }
    fn decompress(&self, data: &[u8]) -> Result<Vec<u8>, CodecError> {
        reject_empty(data)?;
        zstd::decode_all(data).map_err(|e| CodecError::Decompression(e.to_string()))
    }
}

/// Brotli quality used for both per-record and package compression.
pub const BROTLI_QUALITY: u32 = 6;
/// xz preset used for both per-record and package compression.
pub const XZ_PRESET: u32 = 6;
/// Zstd level used for both per-record and package compression.
pub const ZSTD_LEVEL: i32 = 3;

// ── Factory ──────────────────────────────────────────────────────────────────

/// Resolve a CodecId to a built-in codec.
pub fn get_codec(id: CodecId) -> Box<dyn Codec> {
    match id {
        CodecId::None   => Box::new(NoneCodec),
        CodecId::Gzip   => Box::new(GzipCodec),
        CodecId::Bzip2  => Box::new(Bzip2Codec),
        CodecId::Brotli => Box::new(BrotliCodec),
        CodecId::Lz4    => Box::new(Lz4Codec),
        CodecId::Xz     => Box::new(XzCodec),
        CodecId::Zstd   => Box::new(ZstdCodec),
    }
}

/// One-shot compression under `id`.
pub fn compress(data: &[u8], id: CodecId) -> Result<Vec<u8>, CodecError> {
    get_codec(id).compress(data)
}

/// One-shot decompression under `id`.
pub fn decompress(data: &[u8], id: CodecId) -> Result<Vec<u8>, CodecError> {
    get_codec(id).decompress(data)
}
