//! Stateless compression codecs identified by a one-byte magic, and the
//! process-wide compression service dispatching between a primary codec, a
//! fallback codec and auto-detected legacy formats.
//!
//! Every compressed blob starts with the magic byte of the codec that
//! produced it. LZ4 and Zlib blobs carry the uncompressed size as a
//! big-endian u32 right after the magic; Zstd frames describe their own
//! content size.

use std::io::{self, Read, Write};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use byteorder::{ReadBytesExt, WriteBytesExt, BE};
use flate2::read::ZlibDecoder;
use flate2::write::ZlibEncoder;
use flate2::Compression;
use tracing::warn;

use crate::config::CompressionConfig;


/// Magic byte prefixing LZ4 blobs.
pub const LZ4_MAGIC: u8 = 0x4C;
/// Magic byte prefixing Zstd blobs.
pub const ZSTD_MAGIC: u8 = 0x54;
/// Magic byte prefixing Zlib blobs.
pub const ZLIB_MAGIC: u8 = 0x78;
/// Magic byte found on Zlib blobs written by old builds, decoded as Zlib.
pub const ZLIB_LEGACY_MAGIC: u8 = 0x01;

/// Hard cap on the declared uncompressed size of a single blob.
const MAX_FRAME_SIZE: u64 = 64 * 1024 * 1024;

/// Scratch capacity used to decode Zstd frames that do not declare their
/// content size. Only the migration context accepts such frames.
const ZSTD_FALLBACK_CAPACITY: usize = (1 << 20) + (64 << 10);


/// The compression algorithms understood by the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CodecKind {
    Lz4,
    Zstd,
    Zlib,
}

impl CodecKind {

    pub fn name(self) -> &'static str {
        match self {
            Self::Lz4 => "lz4",
            Self::Zstd => "zstd",
            Self::Zlib => "zlib",
        }
    }

    pub fn magic(self) -> u8 {
        match self {
            Self::Lz4 => LZ4_MAGIC,
            Self::Zstd => ZSTD_MAGIC,
            Self::Zlib => ZLIB_MAGIC,
        }
    }

    /// Resolve a blob magic byte to the codec that can decode it.
    pub fn for_magic(magic: u8) -> Option<Self> {
        match magic {
            LZ4_MAGIC => Some(Self::Lz4),
            ZSTD_MAGIC => Some(Self::Zstd),
            ZLIB_MAGIC | ZLIB_LEGACY_MAGIC => Some(Self::Zlib),
            _ => None,
        }
    }

    /// Inclusive level range accepted by the underlying algorithm.
    pub fn level_range(self) -> (u32, u32) {
        match self {
            Self::Lz4 => (1, 17),
            Self::Zstd => (1, 22),
            Self::Zlib => (1, 9),
        }
    }

    pub fn default_level(self) -> u32 {
        match self {
            Self::Lz4 => 6,
            Self::Zstd => 3,
            Self::Zlib => 6,
        }
    }

    /// Codec used to retry a failed compression with this kind as primary.
    pub fn default_fallback(self) -> Self {
        match self {
            Self::Zlib => Self::Lz4,
            _ => Self::Zlib,
        }
    }

    fn index(self) -> usize {
        match self {
            Self::Lz4 => 0,
            Self::Zstd => 1,
            Self::Zlib => 2,
        }
    }

}

/// Where a codec level is going to be used. Migration favors safe settings
/// over speed, the runtime path favors latency.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CodecContext {
    Runtime,
    Migration,
}

/// Clamp a requested level into the algorithm range, then narrow it for the
/// given context. Zstd levels 20 and above are refused outright for
/// migration. The clamp is logged once per codec per process.
pub fn checked_level(kind: CodecKind, requested: u32, context: CodecContext) -> Result<u32, CodecError> {

    if kind == CodecKind::Zstd && context == CodecContext::Migration && requested >= 20 {
        return Err(CodecError::UnsafeLevel { codec: kind.name(), level: requested });
    }

    let (min, max) = kind.level_range();
    let max = match (kind, context) {
        (CodecKind::Lz4, CodecContext::Runtime) => 12,
        (CodecKind::Zstd, CodecContext::Runtime) => 15,
        (CodecKind::Zlib, CodecContext::Runtime) => 6,
        (_, CodecContext::Migration) => max,
    };

    let clamped = requested.clamp(min, max);
    if clamped != requested {
        static LOGGED: [AtomicBool; 3] = [
            AtomicBool::new(false),
            AtomicBool::new(false),
            AtomicBool::new(false),
        ];
        if !LOGGED[kind.index()].swap(true, Ordering::Relaxed) {
            warn!("{} level {requested} out of range, clamped to {clamped}", kind.name());
        }
    }

    Ok(clamped)

}


/// A stateless compressor/decompressor for one algorithm at one level.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Codec {
    kind: CodecKind,
    level: u32,
}

impl Codec {

    /// Build a codec for the runtime context, clamping the level.
    pub fn new(kind: CodecKind, level: u32) -> Self {
        // Runtime clamping never fails.
        let level = checked_level(kind, level, CodecContext::Runtime).unwrap();
        Self { kind, level }
    }

    /// Build a codec for an explicit context, refusing unsafe levels.
    pub fn with_context(kind: CodecKind, level: u32, context: CodecContext) -> Result<Self, CodecError> {
        Ok(Self { kind, level: checked_level(kind, level, context)? })
    }

    /// A codec at the default level for a detected magic byte.
    pub fn for_magic(magic: u8) -> Option<Self> {
        let kind = CodecKind::for_magic(magic)?;
        Some(Self { kind, level: kind.default_level() })
    }

    pub fn kind(&self) -> CodecKind {
        self.kind
    }

    pub fn name(&self) -> &'static str {
        self.kind.name()
    }

    pub fn magic(&self) -> u8 {
        self.kind.magic()
    }

    pub fn level(&self) -> u32 {
        self.level
    }

    /// Compress a payload into an enveloped blob. The empty payload always
    /// produces the canonical empty envelope for the codec.
    pub fn compress(&self, data: &[u8]) -> Result<Vec<u8>, CodecError> {

        if data.len() as u64 > MAX_FRAME_SIZE {
            return Err(CodecError::OversizedFrame { size: data.len() as u64, max: MAX_FRAME_SIZE });
        }

        let mut out = Vec::with_capacity(data.len() / 2 + 16);
        out.push(self.magic());

        match self.kind {
            CodecKind::Lz4 => {
                out.write_u32::<BE>(data.len() as u32)?;
                if !data.is_empty() {
                    let mode = if self.level <= 3 {
                        lz4::block::CompressionMode::DEFAULT
                    } else {
                        lz4::block::CompressionMode::HIGHCOMPRESSION(self.level as i32)
                    };
                    out.extend_from_slice(&lz4::block::compress(data, Some(mode), false)?);
                }
            }
            CodecKind::Zlib => {
                out.write_u32::<BE>(data.len() as u32)?;
                if !data.is_empty() {
                    let mut encoder = ZlibEncoder::new(out, Compression::new(self.level));
                    encoder.write_all(data)?;
                    out = encoder.finish()?;
                }
            }
            CodecKind::Zstd => {
                if !data.is_empty() {
                    out.extend_from_slice(&zstd::bulk::compress(data, self.level as i32)?);
                }
            }
        }

        Ok(out)

    }

    /// Decompress an enveloped blob on the runtime path: Zstd frames without
    /// a declared content size are refused.
    pub fn decompress(&self, blob: &[u8]) -> Result<Vec<u8>, CodecError> {
        self.decompress_in(blob, CodecContext::Runtime)
    }

    /// Decompress an enveloped blob; the migration context additionally
    /// accepts Zstd frames with an unknown content size through a bounded
    /// scratch allocation.
    pub fn decompress_in(&self, blob: &[u8], context: CodecContext) -> Result<Vec<u8>, CodecError> {

        let (&magic, payload) = blob.split_first().ok_or(CodecError::EmptyBlob)?;
        if CodecKind::for_magic(magic) != Some(self.kind) {
            return Err(CodecError::MagicMismatch { codec: self.name(), found: magic });
        }

        match self.kind {
            CodecKind::Lz4 | CodecKind::Zlib => {

                let mut cursor = payload;
                if cursor.len() < 4 {
                    return Err(CodecError::TruncatedEnvelope { codec: self.name() });
                }
                let size = cursor.read_u32::<BE>()?;
                if size as u64 > MAX_FRAME_SIZE {
                    return Err(CodecError::OversizedFrame { size: size as u64, max: MAX_FRAME_SIZE });
                }
                if size == 0 {
                    return Ok(Vec::new());
                }

                let out = if self.kind == CodecKind::Lz4 {
                    lz4::block::decompress(cursor, Some(size as i32))?
                } else {
                    let mut out = Vec::with_capacity(size as usize);
                    ZlibDecoder::new(cursor).read_to_end(&mut out)?;
                    out
                };

                if out.len() != size as usize {
                    return Err(CodecError::SizeMismatch { expected: size, actual: out.len() });
                }
                Ok(out)

            }
            CodecKind::Zstd => {

                if payload.is_empty() {
                    return Ok(Vec::new());
                }

                match zstd::zstd_safe::get_frame_content_size(payload) {
                    Ok(Some(size)) if size > MAX_FRAME_SIZE => {
                        Err(CodecError::OversizedFrame { size, max: MAX_FRAME_SIZE })
                    }
                    Ok(Some(size)) => {
                        Ok(zstd::bulk::decompress(payload, size as usize)?)
                    }
                    Ok(None) if context == CodecContext::Migration => {
                        let mut out = zstd::bulk::decompress(payload, ZSTD_FALLBACK_CAPACITY)?;
                        out.shrink_to_fit();
                        Ok(out)
                    }
                    Ok(None) => Err(CodecError::UnsizedFrame),
                    Err(_) => Err(CodecError::TruncatedEnvelope { codec: self.name() }),
                }

            }
        }

    }

}


/// Counter snapshot of a compression service.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ServiceCounters {
    pub compressions: u64,
    pub decompressions: u64,
    pub fallbacks: u64,
}

/// Primary/fallback compression with magic-byte dispatch on decode.
///
/// `compress` always tries the primary codec, retrying once with the
/// fallback when one is configured. `decompress` routes a blob to the
/// primary, the fallback, or a default codec instance for any other
/// recognized magic byte; unknown magic bytes are a typed error.
#[derive(Debug)]
pub struct CompressionService {
    primary: Codec,
    fallback: Option<Codec>,
    context: CodecContext,
    compressions: AtomicU64,
    decompressions: AtomicU64,
    fallbacks: AtomicU64,
}

impl CompressionService {

    pub fn new(config: &CompressionConfig) -> Self {
        let primary = Codec::new(config.algorithm, config.level);
        let fallback = config.fallback_enabled.then(|| {
            let kind = config.algorithm.default_fallback();
            Codec::new(kind, kind.default_level())
        });
        Self::with_codecs(primary, fallback, CodecContext::Runtime)
    }

    /// Build a service for migration, refusing unsafe levels.
    pub fn for_migration(config: &CompressionConfig) -> Result<Self, CodecError> {
        let primary = Codec::with_context(config.algorithm, config.level, CodecContext::Migration)?;
        let fallback = match config.fallback_enabled {
            true => {
                let kind = config.algorithm.default_fallback();
                Some(Codec::with_context(kind, kind.default_level(), CodecContext::Migration)?)
            }
            false => None,
        };
        Ok(Self::with_codecs(primary, fallback, CodecContext::Migration))
    }

    pub fn with_codecs(primary: Codec, fallback: Option<Codec>, context: CodecContext) -> Self {
        Self {
            primary,
            fallback,
            context,
            compressions: AtomicU64::new(0),
            decompressions: AtomicU64::new(0),
            fallbacks: AtomicU64::new(0),
        }
    }

    pub fn primary(&self) -> Codec {
        self.primary
    }

    pub fn fallback(&self) -> Option<Codec> {
        self.fallback
    }

    pub fn compress(&self, data: &[u8]) -> Result<Vec<u8>, CodecError> {
        self.compressions.fetch_add(1, Ordering::Relaxed);
        match self.primary.compress(data) {
            Ok(blob) => Ok(blob),
            Err(err) => {
                let Some(fallback) = self.fallback else {
                    return Err(err);
                };
                warn!("{} compression failed ({err}), retrying with {}", self.primary.name(), fallback.name());
                self.fallbacks.fetch_add(1, Ordering::Relaxed);
                fallback.compress(data)
            }
        }
    }

    pub fn decompress(&self, blob: &[u8]) -> Result<Vec<u8>, CodecError> {

        self.decompressions.fetch_add(1, Ordering::Relaxed);
        let &magic = blob.first().ok_or(CodecError::EmptyBlob)?;
        let kind = CodecKind::for_magic(magic).ok_or(CodecError::UnknownFormat(magic))?;

        if kind == self.primary.kind() {
            return self.primary.decompress_in(blob, self.context);
        }

        if let Some(fallback) = self.fallback {
            if kind == fallback.kind() {
                self.fallbacks.fetch_add(1, Ordering::Relaxed);
                return fallback.decompress_in(blob, self.context);
            }
        }

        // Known magic without a registered codec: decode with a default
        // instance so legacy blobs keep loading after a config change.
        Codec::new(kind, kind.default_level()).decompress_in(blob, self.context)

    }

    pub fn counters(&self) -> ServiceCounters {
        ServiceCounters {
            compressions: self.compressions.load(Ordering::Relaxed),
            decompressions: self.decompressions.load(Ordering::Relaxed),
            fallbacks: self.fallbacks.load(Ordering::Relaxed),
        }
    }

}


/// Error type for every compression and decompression call.
#[derive(thiserror::Error, Debug)]
pub enum CodecError {
    #[error("io: {0}")]
    Io(#[from] io::Error),
    #[error("empty compressed blob")]
    EmptyBlob,
    #[error("truncated {codec} envelope")]
    TruncatedEnvelope { codec: &'static str },
    #[error("blob magic {found:#04x} does not belong to codec {codec}")]
    MagicMismatch { codec: &'static str, found: u8 },
    #[error("unknown compressed format magic {0:#04x}")]
    UnknownFormat(u8),
    #[error("zstd frame does not declare its content size")]
    UnsizedFrame,
    #[error("frame of {size} bytes exceeds the {max} byte cap")]
    OversizedFrame { size: u64, max: u64 },
    #[error("decompressed {actual} bytes but envelope declared {expected}")]
    SizeMismatch { expected: u32, actual: usize },
    #[error("{codec} level {level} is unsafe for migration")]
    UnsafeLevel { codec: &'static str, level: u32 },
}
