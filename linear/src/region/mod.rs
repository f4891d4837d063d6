//! Region file formats storing 32x32 chunks inside a single file: the Linear
//! Region Format and the legacy Anvil format, with conversion, validation
//! and recovery between the two.

use std::path::Path;

pub mod anvil;
pub mod convert;
pub mod linear;
pub mod recovery;
pub mod validate;


/// Number of chunk slots in one region file.
pub const REGION_CHUNKS: usize = 1024;

/// Hard cap on the uncompressed payload of a single chunk.
pub const MAX_CHUNK_SIZE: usize = 1024 * 1024;

/// Cap on the declared compressed size of a single directory entry.
pub const MAX_ENTRY_SIZE: u32 = 16 * 16 * 256;


/// Index of a chunk's metadata slot inside its region, same calculation as
/// the Notchian server.
#[inline]
pub fn chunk_index(cx: i32, cz: i32) -> usize {
    (cx & 31) as usize | (((cz & 31) as usize) << 5)
}

/// Region coordinates of the region containing a chunk.
#[inline]
pub fn chunk_to_region(cx: i32, cz: i32) -> (i32, i32) {
    (cx >> 5, cz >> 5)
}


/// The two on-disk region formats.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RegionFormat {
    Linear,
    Anvil,
}

impl RegionFormat {

    pub fn extension(self) -> &'static str {
        match self {
            Self::Linear => "lrf",
            Self::Anvil => "mca",
        }
    }

    /// Detect the format of a region file from its extension.
    pub fn detect(path: &Path) -> Option<Self> {
        match path.extension()?.to_str()? {
            "lrf" => Some(Self::Linear),
            "mca" => Some(Self::Anvil),
            _ => None,
        }
    }

    pub fn file_name(self, rx: i32, rz: i32) -> String {
        format!("r.{rx}.{rz}.{}", self.extension())
    }

}

/// Parse the region coordinates out of a `r.{rx}.{rz}.{ext}` file name.
pub fn parse_region_name(path: &Path) -> Option<(i32, i32)> {
    let stem = path.file_stem()?.to_str()?;
    let mut parts = stem.split('.');
    if parts.next()? != "r" {
        return None;
    }
    let rx = parts.next()?.parse().ok()?;
    let rz = parts.next()?.parse().ok()?;
    parts.next().is_none().then_some((rx, rz))
}


/// A chunk payload moving through the storage pipeline, always uncompressed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkEntry {
    pub cx: i32,
    pub cz: i32,
    /// Uncompressed chunk payload.
    pub data: Vec<u8>,
    /// Magic byte of the codec the chunk was stored with, when it came from
    /// disk through the codec service.
    pub source_magic: Option<u8>,
    /// Set when the chunk was stored with a non-primary codec and the
    /// service is configured to re-encode on the next save.
    pub recompress: bool,
}

impl ChunkEntry {

    pub fn new(cx: i32, cz: i32, data: Vec<u8>) -> Self {
        Self { cx, cz, data, source_magic: None, recompress: false }
    }

}
