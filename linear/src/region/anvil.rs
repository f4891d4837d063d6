//! Legacy Anvil region file format storing 32x32 chunks inside 4 KiB file
//! sectors, kept for backward-compatible reads and rollback writes. The
//! sector accounting follows the same algorithms as the Notchian server.

use std::fs::File;
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::Path;
use std::time::{SystemTime, UNIX_EPOCH};

use flate2::read::{GzDecoder, ZlibDecoder};

use crate::codec::{CodecError, CompressionService};
use crate::io::{ReadJavaExt, WriteJavaExt};

use super::{chunk_index, MAX_CHUNK_SIZE};


/// Byte length of one file sector.
pub const SECTOR_SIZE: usize = 4096;

/// Internal constant empty array of 4K to write an empty sector.
const EMPTY_SECTOR: &[u8; SECTOR_SIZE] = &[0; SECTOR_SIZE];

/// Chunk payload compressed with GZip. Written by ancient servers, only
/// decoded here.
pub const COMPRESSION_GZIP: u8 = 1;
/// Chunk payload compressed with raw Zlib, the stock-compatible encoding.
pub const COMPRESSION_ZLIB: u8 = 2;
/// Vendor extension: the payload is a codec service envelope.
pub const COMPRESSION_SERVICE: u8 = 128;


/// A handle to an Anvil region file.
///
/// Being generic over `I` allows using an in-memory buffer for tests.
pub struct AnvilRegion<I> {
    /// Underlying reader/writer with seek.
    inner: I,
    /// Metadata of each chunk slot.
    slots: Box<[Slot; 1024]>,
    /// Bit mapping of sectors that are allocated.
    sectors: Vec<u64>,
}

impl AnvilRegion<File> {

    /// Open a region file, reporting every integrity problem without
    /// altering the file; deleting and retrying is up to the caller.
    pub fn open<P: AsRef<Path>>(path: P, create: bool) -> Result<Self, AnvilError> {

        let path: &Path = path.as_ref();

        if create {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let file = File::options()
            .read(true)
            .write(true)
            .create(create)
            .open(path)?;

        Self::new(file, create)

    }

}

impl<I> AnvilRegion<I>
where
    I: Read + Write + Seek,
{

    /// Wrap an inner reader/writer with seek, reading the two header
    /// sectors and checking file integrity.
    pub fn new(mut inner: I, create: bool) -> Result<Self, AnvilError> {

        let mut file_len = inner.seek(SeekFrom::End(0))?;

        // A region file stores the offset and timestamp tables in its first
        // 8K, initialize them when creating a fresh file.
        if file_len == 0 && create {
            for _ in 0..2 {
                inner.write_all(EMPTY_SECTOR)?;
            }
            file_len = 2 * SECTOR_SIZE as u64;
        } else if file_len < 2 * SECTOR_SIZE as u64 {
            return Err(AnvilError::FileTooSmall(file_len));
        } else if file_len % SECTOR_SIZE as u64 != 0 {
            return Err(AnvilError::FileNotPadded(file_len));
        }

        let mut slots: Box<[Slot; 1024]> = Box::new([Slot::INIT; 1024]);
        let mut sectors = vec![0u64; file_len as usize / SECTOR_SIZE];
        // First two sectors are reserved for the tables.
        sectors[0] |= 0b11;

        inner.seek(SeekFrom::Start(0))?;

        for i in 0..1024 {

            let range_raw = inner.read_java_int()? as u32;
            let range = SectorRange {
                offset: range_raw >> 8,
                count: range_raw & 0xFF,
            };

            slots[i].range = range;

            for offset in range.offset..range.offset + range.count {
                if let Some(slot) = sectors.get_mut(offset as usize / 64) {
                    *slot |= 1u64 << (offset % 64);
                } else {
                    return Err(AnvilError::IllegalRange);
                }
            }

        }

        for i in 0..1024 {
            slots[i].timestamp = inner.read_java_int()? as u32;
        }

        Ok(Self { inner, slots, sectors })

    }

    fn get_slot(&self, cx: i32, cz: i32) -> Slot {
        self.slots[chunk_index(cx, cz)]
    }

    fn set_slot_and_sync(&mut self, cx: i32, cz: i32, slot: Slot) -> io::Result<()> {
        let index = chunk_index(cx, cz);
        self.slots[index] = slot;
        let range_raw = slot.range.offset << 8 | slot.range.count & 0xFF;
        let header_offset = index as u64 * 4;
        self.inner.seek(SeekFrom::Start(header_offset))?;
        self.inner.write_java_int(range_raw as i32)?;
        self.inner.seek(SeekFrom::Start(header_offset + SECTOR_SIZE as u64))?;
        self.inner.write_java_int(slot.timestamp as i32)?;
        Ok(())
    }

    pub fn has_chunk(&self, cx: i32, cz: i32) -> bool {
        !self.get_slot(cx, cz).is_empty()
    }

    /// Local coordinates (0..32) of every occupied chunk slot.
    pub fn occupied(&self) -> impl Iterator<Item = (i32, i32)> + '_ {
        self.slots.iter().enumerate().filter_map(|(i, slot)| {
            (!slot.is_empty()).then_some(((i & 31) as i32, (i >> 5) as i32))
        })
    }

    /// Read the chunk stored at the given position; coordinates are taken
    /// modulo 32. The payload is returned still compressed.
    pub fn read_chunk(&mut self, cx: i32, cz: i32) -> Result<AnvilChunk, AnvilError> {

        let slot = self.get_slot(cx, cz);
        if slot.is_empty() {
            return Err(AnvilError::EmptyChunk);
        }

        if slot.range.offset < 2 {
            return Err(AnvilError::IllegalRange);
        }

        self.inner.seek(SeekFrom::Start(slot.range.offset as u64 * SECTOR_SIZE as u64))?;

        let chunk_size = self.inner.read_java_int()?;
        if chunk_size <= 0 || chunk_size as u32 + 4 > slot.range.count * SECTOR_SIZE as u32 {
            return Err(AnvilError::IllegalRange);
        }

        let compression_id = self.inner.read_java_byte()? as u8;
        let mut data = vec![0u8; chunk_size as usize - 1];
        self.inner.read_exact(&mut data)?;

        Ok(AnvilChunk { compression_id, data })

    }

    /// Write a chunk payload at the given position; coordinates are taken
    /// modulo 32. The payload must already match the compression id.
    pub fn write_chunk(&mut self, cx: i32, cz: i32, compression_id: u8, data: &[u8]) -> Result<(), AnvilError> {

        // 4 length bytes and 1 compression id precede the payload, and an
        // empty payload still occupies one sector.
        let needed = (data.len() + 5).div_ceil(SECTOR_SIZE).max(1) as u32;
        if needed > 0xFF {
            return Err(AnvilError::OutOfSector);
        }

        let mut slot = self.get_slot(cx, cz);

        if needed < slot.range.count {
            // Keep the head of the current range, give the tail back.
            self.release_sectors(SectorRange {
                offset: slot.range.offset + needed,
                count: slot.range.count - needed,
            })?;
            slot.range.count = needed;
        } else if needed > slot.range.count {
            self.release_sectors(slot.range)?;
            slot.range = self.claim_sectors(needed);
        }

        slot.timestamp = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs() as u32)
            .unwrap_or(0);

        self.set_slot_and_sync(cx, cz, slot)?;

        self.inner.seek(SeekFrom::Start(slot.range.offset as u64 * SECTOR_SIZE as u64))?;
        self.inner.write_java_int(data.len() as i32 + 1)?; // Counting the compression id.
        self.inner.write_java_byte(compression_id as i8)?;
        self.inner.write_all(data)?;

        // Pad to the sector boundary, clearing stale bytes behind the new
        // payload.
        let written = data.len() + 5;
        let pad = (SECTOR_SIZE - written % SECTOR_SIZE) % SECTOR_SIZE;
        self.inner.write_all(&EMPTY_SECTOR[..pad])?;

        self.inner.flush()?;

        Ok(())

    }

    fn is_allocated(&self, sector: u32) -> bool {
        self.sectors.get(sector as usize / 64)
            .is_some_and(|bits| bits & (1u64 << (sector % 64)) != 0)
    }

    fn set_allocated(&mut self, sector: u32, allocated: bool) {
        let index = sector as usize / 64;
        if index >= self.sectors.len() {
            self.sectors.resize(index + 1, 0);
        }
        let mask = 1u64 << (sector % 64);
        if allocated {
            self.sectors[index] |= mask;
        } else {
            self.sectors[index] &= !mask;
        }
    }

    /// Zero a sector range on disk and mark it free again.
    fn release_sectors(&mut self, range: SectorRange) -> io::Result<()> {
        if range.count == 0 {
            return Ok(());
        }
        self.inner.seek(SeekFrom::Start(range.offset as u64 * SECTOR_SIZE as u64))?;
        for sector in range.offset..range.offset + range.count {
            self.set_allocated(sector, false);
            self.inner.write_all(EMPTY_SECTOR)?;
        }
        Ok(())
    }

    /// Mark a contiguous run of free sectors as used and return it. The
    /// scan starts after the two header sectors; when no hole fits, the
    /// run lands behind the last allocation and the file grows.
    fn claim_sectors(&mut self, needed: u32) -> SectorRange {

        let limit = (self.sectors.len() * 64) as u32;
        let mut start = 2;
        let mut found = 0;

        for sector in 2..limit {
            if self.is_allocated(sector) {
                start = sector + 1;
                found = 0;
            } else {
                found += 1;
                if found == needed {
                    break;
                }
            }
        }

        let range = SectorRange { offset: start, count: needed };
        for sector in range.offset..range.offset + range.count {
            self.set_allocated(sector, true);
        }
        range

    }

}


/// A chunk payload read from an Anvil region, still compressed.
#[derive(Debug, Clone)]
pub struct AnvilChunk {
    pub compression_id: u8,
    pub data: Vec<u8>,
}

impl AnvilChunk {

    /// Decompress the payload: GZip and Zlib inline, the vendor id through
    /// the codec service.
    pub fn decompress(&self, service: &CompressionService) -> Result<Vec<u8>, AnvilError> {
        match self.compression_id {
            COMPRESSION_GZIP => {
                let mut out = Vec::new();
                GzDecoder::new(&self.data[..])
                    .take(MAX_CHUNK_SIZE as u64 + 1)
                    .read_to_end(&mut out)?;
                Ok(out)
            }
            COMPRESSION_ZLIB => {
                let mut out = Vec::new();
                ZlibDecoder::new(&self.data[..])
                    .take(MAX_CHUNK_SIZE as u64 + 1)
                    .read_to_end(&mut out)?;
                Ok(out)
            }
            COMPRESSION_SERVICE => Ok(service.decompress(&self.data)?),
            id => Err(AnvilError::IllegalCompression(id)),
        }
    }

    /// Codec magic of the envelope for vendor payloads.
    pub fn envelope_magic(&self) -> Option<u8> {
        (self.compression_id == COMPRESSION_SERVICE)
            .then(|| self.data.first().copied())
            .flatten()
    }

}


/// Internal cached slot metadata, kept in sync with the region file.
#[derive(Debug, Clone, Copy)]
struct Slot {
    /// Sector range holding the chunk, empty when count is zero.
    range: SectorRange,
    /// Timestamp of the last save, seconds since the epoch.
    timestamp: u32,
}

impl Slot {

    const INIT: Self = Self { range: SectorRange { offset: 0, count: 0 }, timestamp: 0 };

    fn is_empty(self) -> bool {
        self.range.is_empty()
    }

}

/// A range of sectors within the file.
#[derive(Debug, Clone, Copy, Default)]
struct SectorRange {
    /// Offset of the first sector in that range.
    offset: u32,
    /// Number of sectors in the range.
    count: u32,
}

impl SectorRange {

    fn is_empty(self) -> bool {
        self.count == 0
    }

}


/// Error type for every call on Anvil region files.
#[derive(thiserror::Error, Debug)]
pub enum AnvilError {
    #[error("io: {0}")]
    Io(#[from] io::Error),
    #[error("the region file size ({0}) is too short to store the two 4K header sectors")]
    FileTooSmall(u64),
    #[error("the region file size ({0}) is not a multiple of 4K")]
    FileNotPadded(u64),
    #[error("the region file has an invalid chunk range, out of range or colliding with another one")]
    IllegalRange,
    #[error("the required chunk is empty, it has no sector allocated in the region file")]
    EmptyChunk,
    #[error("the compression id {0} in the chunk header is illegal")]
    IllegalCompression(u8),
    #[error("no more sectors are available in the region file")]
    OutOfSector,
    #[error("codec: {0}")]
    Codec(#[from] CodecError),
}


#[cfg(test)]
mod tests {

    use super::*;
    use crate::codec::{Codec, CodecContext, CodecKind};
    use flate2::write::ZlibEncoder;
    use flate2::Compression;
    use std::io::Cursor;

    fn zlib(data: &[u8]) -> Vec<u8> {
        let mut encoder = ZlibEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(data).unwrap();
        encoder.finish().unwrap()
    }

    fn service() -> CompressionService {
        CompressionService::with_codecs(
            Codec::new(CodecKind::Lz4, 6),
            None,
            CodecContext::Runtime,
        )
    }

    #[test]
    fn create_write_read_zlib() {
        let mut region = AnvilRegion::new(Cursor::new(Vec::new()), true).unwrap();
        assert!(!region.has_chunk(0, 0));

        let payload = vec![0x0A; 600];
        region.write_chunk(0, 0, COMPRESSION_ZLIB, &zlib(&payload)).unwrap();
        assert!(region.has_chunk(0, 0));

        let chunk = region.read_chunk(0, 0).unwrap();
        assert_eq!(chunk.compression_id, COMPRESSION_ZLIB);
        assert_eq!(chunk.decompress(&service()).unwrap(), payload);
    }

    #[test]
    fn vendor_envelope_round_trip() {
        let service = service();
        let mut region = AnvilRegion::new(Cursor::new(Vec::new()), true).unwrap();
        let payload = vec![0x0A; 1200];
        let blob = service.compress(&payload).unwrap();
        region.write_chunk(5, 9, COMPRESSION_SERVICE, &blob).unwrap();
        let chunk = region.read_chunk(5, 9).unwrap();
        assert_eq!(chunk.envelope_magic(), Some(0x4C));
        assert_eq!(chunk.decompress(&service).unwrap(), payload);
    }

    #[test]
    fn reopen_keeps_chunks() {
        let mut cursor = Cursor::new(Vec::new());
        {
            let mut region = AnvilRegion::new(&mut cursor, true).unwrap();
            region.write_chunk(1, 2, COMPRESSION_ZLIB, &zlib(&[0x0A; 100])).unwrap();
            region.write_chunk(31, 31, COMPRESSION_ZLIB, &zlib(&[0x09; 40])).unwrap();
        }
        let mut region = AnvilRegion::new(&mut cursor, false).unwrap();
        let occupied = region.occupied().collect::<Vec<_>>();
        assert_eq!(occupied, vec![(1, 2), (31, 31)]);
        assert!(region.read_chunk(1, 2).is_ok());
    }

    #[test]
    fn rewrite_reallocates_sectors() {
        let mut region = AnvilRegion::new(Cursor::new(Vec::new()), true).unwrap();
        // Spans two sectors, then shrinks back to one.
        let big = vec![7u8; 2 * SECTOR_SIZE];
        region.write_chunk(0, 0, COMPRESSION_SERVICE, &big).unwrap();
        region.write_chunk(0, 1, COMPRESSION_ZLIB, &zlib(&[0x01; 64])).unwrap();
        region.write_chunk(0, 0, COMPRESSION_ZLIB, &zlib(&[0x02; 64])).unwrap();
        let chunk = region.read_chunk(0, 0).unwrap();
        assert_eq!(chunk.decompress(&service()).unwrap(), vec![0x02; 64]);
        let other = region.read_chunk(0, 1).unwrap();
        assert_eq!(other.decompress(&service()).unwrap(), vec![0x01; 64]);
    }

    #[test]
    fn missing_chunk_is_empty_error() {
        let mut region = AnvilRegion::new(Cursor::new(Vec::new()), true).unwrap();
        assert!(matches!(region.read_chunk(7, 7), Err(AnvilError::EmptyChunk)));
    }

    #[test]
    fn illegal_compression_id() {
        let mut region = AnvilRegion::new(Cursor::new(Vec::new()), true).unwrap();
        region.write_chunk(0, 0, 42, &[1, 2, 3]).unwrap();
        let chunk = region.read_chunk(0, 0).unwrap();
        assert!(matches!(
            chunk.decompress(&service()),
            Err(AnvilError::IllegalCompression(42)),
        ));
    }

}
