//! Linear Region Format: a compact region file with a fixed header, packed
//! chunk payloads and an explicit directory located through the header.
//!
//! Layout, all little-endian: magic `LRF\0`, version u32, compression id u8,
//! flags u8, 2 reserved bytes, directory offset u64, entry count u32, then
//! the payload area and the directory wherever the header points. Payload
//! bytes are codec envelopes, checksummed with xxh32.

use std::collections::{HashMap, HashSet};
use std::fs::File;
use std::io::{self, BufReader, BufWriter, Read, Seek, SeekFrom, Write};
use std::path::Path;

use byteorder::{ReadBytesExt, WriteBytesExt, LE};
use xxhash_rust::xxh32::xxh32;

use super::{MAX_CHUNK_SIZE, MAX_ENTRY_SIZE, REGION_CHUNKS};


/// File magic of every Linear region file.
pub const LINEAR_MAGIC: [u8; 4] = *b"LRF\0";

/// Current format version.
pub const LINEAR_VERSION: u32 = 1;

/// Byte length of the fixed header.
pub const HEADER_SIZE: u64 = 24;

/// Byte length of one directory entry.
pub const ENTRY_SIZE: u64 = 28;

/// Seed for payload checksums.
const CHECKSUM_SEED: u32 = 0;


#[derive(Debug, Clone, Copy)]
struct DirEntry {
    cx: i32,
    cz: i32,
    offset: u64,
    compressed_size: u32,
    uncompressed_size: u32,
    checksum: u32,
}

/// A chunk read back from a Linear region file. The payload is still the
/// compressed codec envelope.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LinearChunk {
    pub cx: i32,
    pub cz: i32,
    pub data: Vec<u8>,
    pub uncompressed_size: u32,
}


/// Writer for a Linear region file. Payloads are appended as they arrive,
/// the directory is written on [`finish`] and the header patched to point
/// at it.
///
/// [`finish`]: LinearWriter::finish
pub struct LinearWriter<I> {
    inner: I,
    codec_magic: u8,
    entries: Vec<DirEntry>,
    keys: HashSet<(i32, i32)>,
    offset: u64,
}

impl LinearWriter<BufWriter<File>> {

    /// Create a region file at the given path, truncating any previous one.
    pub fn create<P: AsRef<Path>>(path: P, codec_magic: u8) -> Result<Self, LinearError> {
        let path: &Path = path.as_ref();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let file = File::create(path)?;
        Self::new(BufWriter::new(file), codec_magic)
    }

}

impl<I> LinearWriter<I>
where
    I: Write + Seek,
{

    /// Start writing a region around an inner writer with seek. A zeroed
    /// header is written immediately so payloads can follow.
    pub fn new(mut inner: I, codec_magic: u8) -> Result<Self, LinearError> {
        inner.seek(SeekFrom::Start(0))?;
        inner.write_all(&[0u8; HEADER_SIZE as usize])?;
        Ok(Self {
            inner,
            codec_magic,
            entries: Vec::new(),
            keys: HashSet::new(),
            offset: HEADER_SIZE,
        })
    }

    /// Append one chunk payload. The payload must already be a compressed
    /// codec envelope; `uncompressed_size` is recorded in the directory so
    /// readers can budget decompression.
    pub fn append(&mut self, cx: i32, cz: i32, payload: &[u8], uncompressed_size: u32) -> Result<(), LinearError> {

        if self.entries.len() >= REGION_CHUNKS {
            return Err(LinearError::RegionFull);
        }
        if payload.len() as u64 > MAX_ENTRY_SIZE as u64 {
            return Err(LinearError::OversizedEntry { cx, cz, size: payload.len() as u64 });
        }
        if uncompressed_size as usize > MAX_CHUNK_SIZE {
            return Err(LinearError::OversizedEntry { cx, cz, size: uncompressed_size as u64 });
        }
        if !self.keys.insert((cx, cz)) {
            return Err(LinearError::DuplicateEntry { cx, cz });
        }

        self.inner.write_all(payload)?;
        self.entries.push(DirEntry {
            cx,
            cz,
            offset: self.offset,
            compressed_size: payload.len() as u32,
            uncompressed_size,
            checksum: xxh32(payload, CHECKSUM_SEED),
        });
        self.offset += payload.len() as u64;

        Ok(())

    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Write the directory, patch the header and flush. Consumes the writer.
    pub fn finish(mut self) -> Result<(), LinearError> {

        let dir_offset = self.offset;
        for entry in &self.entries {
            self.inner.write_i32::<LE>(entry.cx)?;
            self.inner.write_i32::<LE>(entry.cz)?;
            self.inner.write_u64::<LE>(entry.offset)?;
            self.inner.write_u32::<LE>(entry.compressed_size)?;
            self.inner.write_u32::<LE>(entry.uncompressed_size)?;
            self.inner.write_u32::<LE>(entry.checksum)?;
        }

        self.inner.seek(SeekFrom::Start(0))?;
        self.inner.write_all(&LINEAR_MAGIC)?;
        self.inner.write_u32::<LE>(LINEAR_VERSION)?;
        self.inner.write_u8(self.codec_magic)?;
        self.inner.write_u8(0)?; // flags
        self.inner.write_all(&[0u8; 2])?;
        self.inner.write_u64::<LE>(dir_offset)?;
        self.inner.write_u32::<LE>(self.entries.len() as u32)?;
        self.inner.flush()?;

        Ok(())

    }

}


/// Reader for a Linear region file. The directory is read and verified up
/// front, payload checksums are verified on each chunk read.
pub struct LinearReader<I> {
    inner: I,
    codec_magic: u8,
    entries: HashMap<(i32, i32), DirEntry>,
}

impl LinearReader<BufReader<File>> {

    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, LinearError> {
        let file = File::open(path)?;
        Self::new(BufReader::new(file))
    }

}

impl<I> LinearReader<I>
where
    I: Read + Seek,
{

    pub fn new(mut inner: I) -> Result<Self, LinearError> {

        let file_len = inner.seek(SeekFrom::End(0))?;
        if file_len < HEADER_SIZE {
            return Err(LinearError::TruncatedFile(file_len));
        }

        inner.seek(SeekFrom::Start(0))?;
        let mut magic = [0u8; 4];
        inner.read_exact(&mut magic)?;
        if magic != LINEAR_MAGIC {
            return Err(LinearError::BadMagic(magic));
        }

        let version = inner.read_u32::<LE>()?;
        if version != LINEAR_VERSION {
            return Err(LinearError::UnsupportedVersion(version));
        }

        let codec_magic = inner.read_u8()?;
        let _flags = inner.read_u8()?;
        let mut reserved = [0u8; 2];
        inner.read_exact(&mut reserved)?;
        let dir_offset = inner.read_u64::<LE>()?;
        let count = inner.read_u32::<LE>()?;

        if count as usize > REGION_CHUNKS {
            return Err(LinearError::DirectoryOutOfBounds { offset: dir_offset, count });
        }
        let dir_end = dir_offset
            .checked_add(count as u64 * ENTRY_SIZE)
            .ok_or(LinearError::DirectoryOutOfBounds { offset: dir_offset, count })?;
        if dir_offset < HEADER_SIZE || dir_end > file_len {
            return Err(LinearError::DirectoryOutOfBounds { offset: dir_offset, count });
        }

        inner.seek(SeekFrom::Start(dir_offset))?;
        let mut entries = HashMap::with_capacity(count as usize);
        for _ in 0..count {

            let entry = DirEntry {
                cx: inner.read_i32::<LE>()?,
                cz: inner.read_i32::<LE>()?,
                offset: inner.read_u64::<LE>()?,
                compressed_size: inner.read_u32::<LE>()?,
                uncompressed_size: inner.read_u32::<LE>()?,
                checksum: inner.read_u32::<LE>()?,
            };

            if entry.compressed_size > MAX_ENTRY_SIZE
                || entry.uncompressed_size as usize > MAX_CHUNK_SIZE
            {
                return Err(LinearError::OversizedEntry {
                    cx: entry.cx,
                    cz: entry.cz,
                    size: entry.compressed_size.max(entry.uncompressed_size) as u64,
                });
            }

            let end = entry.offset
                .checked_add(entry.compressed_size as u64)
                .ok_or(LinearError::EntryOutOfBounds { cx: entry.cx, cz: entry.cz })?;
            if entry.offset < HEADER_SIZE || end > file_len {
                return Err(LinearError::EntryOutOfBounds { cx: entry.cx, cz: entry.cz });
            }

            if entries.insert((entry.cx, entry.cz), entry).is_some() {
                return Err(LinearError::DuplicateEntry { cx: entry.cx, cz: entry.cz });
            }

        }

        Ok(Self { inner, codec_magic, entries })

    }

    /// Magic byte of the codec the writer was configured with.
    pub fn codec_magic(&self) -> u8 {
        self.codec_magic
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn has_chunk(&self, cx: i32, cz: i32) -> bool {
        self.entries.contains_key(&(cx, cz))
    }

    /// Coordinates of every chunk present in the file, in no guaranteed
    /// order.
    pub fn keys(&self) -> impl Iterator<Item = (i32, i32)> + '_ {
        self.entries.keys().copied()
    }

    /// Read one chunk payload, verifying its checksum. Returns `None` for a
    /// chunk absent from the directory.
    pub fn read_chunk(&mut self, cx: i32, cz: i32) -> Result<Option<LinearChunk>, LinearError> {

        let Some(entry) = self.entries.get(&(cx, cz)).copied() else {
            return Ok(None);
        };

        self.inner.seek(SeekFrom::Start(entry.offset))?;
        let mut data = vec![0u8; entry.compressed_size as usize];
        self.inner.read_exact(&mut data)?;

        if xxh32(&data, CHECKSUM_SEED) != entry.checksum {
            return Err(LinearError::ChecksumMismatch { cx, cz });
        }

        Ok(Some(LinearChunk {
            cx,
            cz,
            data,
            uncompressed_size: entry.uncompressed_size,
        }))

    }

    /// Read every chunk in the file.
    pub fn read_all(&mut self) -> Result<Vec<LinearChunk>, LinearError> {
        let keys = self.keys().collect::<Vec<_>>();
        let mut chunks = Vec::with_capacity(keys.len());
        for (cx, cz) in keys {
            // The key cannot vanish between collect and read.
            chunks.push(self.read_chunk(cx, cz)?.unwrap());
        }
        Ok(chunks)
    }

}


/// Error type for every call on Linear region files.
#[derive(thiserror::Error, Debug)]
pub enum LinearError {
    #[error("io: {0}")]
    Io(#[from] io::Error),
    #[error("the region file length ({0}) cannot hold the fixed header")]
    TruncatedFile(u64),
    #[error("the region file magic {0:02x?} is not a Linear header")]
    BadMagic([u8; 4]),
    #[error("unsupported Linear format version {0}")]
    UnsupportedVersion(u32),
    #[error("the directory at {offset} with {count} entries does not fit the file")]
    DirectoryOutOfBounds { offset: u64, count: u32 },
    #[error("chunk {cx}/{cz} payload lies outside the file")]
    EntryOutOfBounds { cx: i32, cz: i32 },
    #[error("chunk {cx}/{cz} declares a size of {size} bytes, above the per-chunk cap")]
    OversizedEntry { cx: i32, cz: i32, size: u64 },
    #[error("chunk {cx}/{cz} is listed twice in the directory")]
    DuplicateEntry { cx: i32, cz: i32 },
    #[error("chunk {cx}/{cz} payload does not match its checksum")]
    ChecksumMismatch { cx: i32, cz: i32 },
    #[error("the region file already holds 1024 chunks")]
    RegionFull,
}


#[cfg(test)]
mod tests {

    use super::*;
    use std::io::Cursor;

    fn build(chunks: &[(i32, i32, Vec<u8>)]) -> Vec<u8> {
        let mut cursor = Cursor::new(Vec::new());
        {
            let mut writer = LinearWriter::new(&mut cursor, 0x54).unwrap();
            for (cx, cz, data) in chunks {
                writer.append(*cx, *cz, data, data.len() as u32).unwrap();
            }
            writer.finish().unwrap();
        }
        cursor.into_inner()
    }

    #[test]
    fn write_read_round_trip() {
        let chunks = vec![
            (0, 0, vec![1u8; 100]),
            (5, -3, vec![2u8; 50]),
            (-31, 31, vec![3u8; 10]),
        ];
        let bytes = build(&chunks);
        let mut reader = LinearReader::new(Cursor::new(bytes)).unwrap();
        assert_eq!(reader.len(), 3);
        assert_eq!(reader.codec_magic(), 0x54);
        assert!(reader.has_chunk(5, -3));
        assert!(!reader.has_chunk(1, 1));
        let chunk = reader.read_chunk(5, -3).unwrap().unwrap();
        assert_eq!(chunk.data, vec![2u8; 50]);
        assert_eq!(chunk.uncompressed_size, 50);
        assert!(reader.read_chunk(9, 9).unwrap().is_none());

        let mut all = reader.read_all().unwrap();
        all.sort_by_key(|c| (c.cx, c.cz));
        let mut expected = chunks;
        expected.sort_by_key(|c| (c.0, c.1));
        assert_eq!(all.len(), expected.len());
        for (chunk, (cx, cz, data)) in all.iter().zip(&expected) {
            assert_eq!((chunk.cx, chunk.cz), (*cx, *cz));
            assert_eq!(&chunk.data, data);
        }
    }

    #[test]
    fn writer_refuses_duplicates() {
        let mut cursor = Cursor::new(Vec::new());
        let mut writer = LinearWriter::new(&mut cursor, 0x4C).unwrap();
        writer.append(1, 2, &[9; 10], 10).unwrap();
        assert!(matches!(
            writer.append(1, 2, &[9; 10], 10),
            Err(LinearError::DuplicateEntry { cx: 1, cz: 2 }),
        ));
    }

    #[test]
    fn reader_rejects_bad_magic_and_version() {
        let mut bytes = build(&[(0, 0, vec![7u8; 8])]);
        let mut broken = bytes.clone();
        broken[0] = b'X';
        assert!(matches!(
            LinearReader::new(Cursor::new(broken)),
            Err(LinearError::BadMagic(_)),
        ));
        bytes[4] = 99;
        assert!(matches!(
            LinearReader::new(Cursor::new(bytes)),
            Err(LinearError::UnsupportedVersion(99)),
        ));
    }

    #[test]
    fn reader_rejects_corrupted_payload() {
        let mut bytes = build(&[(0, 0, vec![7u8; 64])]);
        // Flip a payload byte right after the header.
        bytes[HEADER_SIZE as usize + 10] ^= 0xFF;
        let mut reader = LinearReader::new(Cursor::new(bytes)).unwrap();
        assert!(matches!(
            reader.read_chunk(0, 0),
            Err(LinearError::ChecksumMismatch { cx: 0, cz: 0 }),
        ));
    }

    #[test]
    fn reader_rejects_truncated_directory() {
        let bytes = build(&[(0, 0, vec![7u8; 8])]);
        let truncated = bytes[..bytes.len() - 4].to_vec();
        assert!(matches!(
            LinearReader::new(Cursor::new(truncated)),
            Err(LinearError::DirectoryOutOfBounds { .. }),
        ));
    }

    #[test]
    fn reader_rejects_oversized_entry() {
        let mut writer = LinearWriter::new(Cursor::new(Vec::new()), 0x54).unwrap();
        assert!(matches!(
            writer.append(0, 0, &vec![0u8; MAX_ENTRY_SIZE as usize + 1], 10),
            Err(LinearError::OversizedEntry { .. }),
        ));
    }

}
