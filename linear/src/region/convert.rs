//! Conversion between the Anvil and Linear region formats, single file or
//! whole directory, with per-chunk validation and skip-and-report recovery.

use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use flate2::write::ZlibEncoder;
use flate2::Compression;
use tracing::{debug, info, warn};

use crate::codec::{CodecError, CompressionService};

use super::anvil::{AnvilError, AnvilRegion, COMPRESSION_ZLIB};
use super::linear::{LinearError, LinearReader, LinearWriter};
use super::validate::{ChunkValidator, ValidationError};
use super::{parse_region_name, RegionFormat};


/// Number of chunks processed per streaming batch.
const BATCH_SIZE: usize = 64;


/// A chunk left out of a conversion, with the reason.
#[derive(Debug, Clone)]
pub struct ChunkSkip {
    pub cx: i32,
    pub cz: i32,
    pub reason: String,
}

/// Outcome of a single file conversion.
#[derive(Debug, Default)]
pub struct FileReport {
    /// Chunks written to the target file.
    pub converted: usize,
    /// Chunks skipped with their reasons.
    pub skipped: Vec<ChunkSkip>,
}

/// Outcome of a directory conversion.
#[derive(Debug, Default)]
pub struct DirectoryReport {
    pub succeeded: usize,
    pub failed: usize,
    /// Per-file outcome, failure carries the reason.
    pub files: Vec<(PathBuf, Result<FileReport, String>)>,
}

impl DirectoryReport {

    pub fn summary(&self) -> String {
        format!("{} succeeded, {} failed", self.succeeded, self.failed)
    }

}


/// Converts region files between formats through the codec service.
pub struct RegionConverter {
    service: Arc<CompressionService>,
}

impl RegionConverter {

    pub fn new(service: Arc<CompressionService>) -> Self {
        Self { service }
    }

    /// Convert a single region file. Source and target formats are detected
    /// from the extensions and must differ. Chunks failing validation or
    /// decoding are skipped and reported; I/O failures on the target abort.
    pub fn convert_file(&self, src: &Path, dst: &Path) -> Result<FileReport, ConvertError> {

        let src_format = RegionFormat::detect(src)
            .ok_or_else(|| ConvertError::UnknownFormat(src.to_path_buf()))?;
        let dst_format = RegionFormat::detect(dst)
            .ok_or_else(|| ConvertError::UnknownFormat(dst.to_path_buf()))?;
        if src_format == dst_format {
            return Err(ConvertError::SameFormat(src_format));
        }

        let (rx, rz) = parse_region_name(src).unwrap_or_else(|| {
            warn!("cannot parse region coordinates from {src:?}, assuming 0/0");
            (0, 0)
        });

        debug!("converting {src:?} ({src_format:?}) to {dst:?} ({dst_format:?})");

        let report = match src_format {
            RegionFormat::Anvil => self.anvil_to_linear(src, dst, rx, rz)?,
            RegionFormat::Linear => self.linear_to_anvil(src, dst)?,
        };

        info!(
            "converted {src:?}: {} chunks written, {} skipped",
            report.converted, report.skipped.len(),
        );

        Ok(report)

    }

    fn anvil_to_linear(&self, src: &Path, dst: &Path, rx: i32, rz: i32) -> Result<FileReport, ConvertError> {

        let mut region = AnvilRegion::open(src, false)?;
        let mut writer = LinearWriter::create(dst, self.service.primary().magic())?;
        let mut validator = ChunkValidator::new();
        let mut report = FileReport::default();

        let occupied = region.occupied().collect::<Vec<_>>();
        for batch in occupied.chunks(BATCH_SIZE) {
            for &(lx, lz) in batch {

                let (cx, cz) = (rx * 32 + lx, rz * 32 + lz);
                let outcome = read_anvil_payload(&mut region, &self.service, lx, lz)
                    .and_then(|raw| {
                        validator.validate(cx, cz, &raw)?;
                        let blob = self.service.compress(&raw)?;
                        writer.append(cx, cz, &blob, raw.len() as u32)?;
                        Ok(())
                    });

                match outcome {
                    Ok(()) => report.converted += 1,
                    Err(err) if err.is_target_io() => return Err(err),
                    Err(err) => {
                        warn!("skipping chunk {cx}/{cz} of {src:?}: {err}");
                        report.skipped.push(ChunkSkip { cx, cz, reason: err.to_string() });
                    }
                }

            }
            debug!("converted batch of {} chunks from {src:?}", batch.len());
        }

        writer.finish()?;
        Ok(report)

    }

    fn linear_to_anvil(&self, src: &Path, dst: &Path) -> Result<FileReport, ConvertError> {

        let mut reader = LinearReader::open(src)?;
        let mut region = AnvilRegion::open(dst, true)?;
        let mut validator = ChunkValidator::new();
        let mut report = FileReport::default();

        let keys = reader.keys().collect::<Vec<_>>();
        for batch in keys.chunks(BATCH_SIZE) {
            for &(cx, cz) in batch {

                let outcome = read_linear_payload(&mut reader, &self.service, cx, cz)
                    .and_then(|raw| {
                        validator.validate(cx, cz, &raw)?;
                        // Rollback targets must stay readable by stock
                        // tools, so always store raw Zlib.
                        let mut encoder = ZlibEncoder::new(Vec::new(), Compression::new(6));
                        encoder.write_all(&raw).map_err(ConvertError::Io)?;
                        let blob = encoder.finish().map_err(ConvertError::Io)?;
                        region.write_chunk(cx, cz, COMPRESSION_ZLIB, &blob)?;
                        Ok(())
                    });

                match outcome {
                    Ok(()) => report.converted += 1,
                    Err(err) if err.is_target_io() => return Err(err),
                    Err(err) => {
                        warn!("skipping chunk {cx}/{cz} of {src:?}: {err}");
                        report.skipped.push(ChunkSkip { cx, cz, reason: err.to_string() });
                    }
                }

            }
        }

        Ok(report)

    }

    /// Convert every region file of `src_dir` that is not already in the
    /// target format, writing the results into `dst_dir`. Individual file
    /// failures are recorded and do not stop the run.
    pub fn convert_directory(&self, src_dir: &Path, dst_dir: &Path, to: RegionFormat) -> Result<DirectoryReport, ConvertError> {

        std::fs::create_dir_all(dst_dir)?;
        let mut report = DirectoryReport::default();

        let mut paths = std::fs::read_dir(src_dir)?
            .collect::<Result<Vec<_>, _>>()?
            .into_iter()
            .map(|entry| entry.path())
            .filter(|path| RegionFormat::detect(path).is_some_and(|format| format != to))
            .collect::<Vec<_>>();
        paths.sort();

        for src in paths {

            let Some((rx, rz)) = parse_region_name(&src) else {
                warn!("ignoring region file with unparseable name: {src:?}");
                continue;
            };
            let dst = dst_dir.join(to.file_name(rx, rz));

            match self.convert_file(&src, &dst) {
                Ok(file_report) => {
                    report.succeeded += 1;
                    report.files.push((src, Ok(file_report)));
                }
                Err(err) => {
                    warn!("failed to convert {src:?}: {err}");
                    report.failed += 1;
                    report.files.push((src, Err(err.to_string())));
                }
            }

        }

        info!("directory conversion of {src_dir:?}: {}", report.summary());
        Ok(report)

    }

}

/// Read and decompress one chunk from an Anvil region.
fn read_anvil_payload(
    region: &mut AnvilRegion<std::fs::File>,
    service: &CompressionService,
    lx: i32,
    lz: i32,
) -> Result<Vec<u8>, ConvertError> {
    let chunk = region.read_chunk(lx, lz)?;
    Ok(chunk.decompress(service)?)
}

/// Read and decompress one chunk from a Linear region.
fn read_linear_payload(
    reader: &mut LinearReader<std::io::BufReader<std::fs::File>>,
    service: &CompressionService,
    cx: i32,
    cz: i32,
) -> Result<Vec<u8>, ConvertError> {
    let chunk = reader.read_chunk(cx, cz)?
        .ok_or(ConvertError::Linear(LinearError::ChecksumMismatch { cx, cz }))?;
    Ok(service.decompress(&chunk.data)?)
}


/// Error type for conversions.
#[derive(thiserror::Error, Debug)]
pub enum ConvertError {
    #[error("io: {0}")]
    Io(#[from] io::Error),
    #[error("source and target are both {0:?}")]
    SameFormat(RegionFormat),
    #[error("cannot detect a region format for {0:?}")]
    UnknownFormat(PathBuf),
    #[error("anvil: {0}")]
    Anvil(#[from] AnvilError),
    #[error("linear: {0}")]
    Linear(#[from] LinearError),
    #[error("codec: {0}")]
    Codec(#[from] CodecError),
    #[error("validation: {0}")]
    Validation(#[from] ValidationError),
}

impl ConvertError {

    /// True for failures of the conversion target itself, which abort the
    /// file instead of skipping the chunk.
    fn is_target_io(&self) -> bool {
        matches!(self, Self::Io(_) | Self::Linear(LinearError::Io(_)))
    }

}


#[cfg(test)]
mod tests {

    use super::*;
    use crate::codec::{Codec, CodecContext, CodecKind};
    use crate::region::anvil::COMPRESSION_SERVICE;
    use flate2::write::ZlibEncoder;
    use std::io::{Seek, SeekFrom, Write};

    fn service() -> Arc<CompressionService> {
        Arc::new(CompressionService::with_codecs(
            Codec::new(CodecKind::Zstd, 3),
            Some(Codec::new(CodecKind::Zlib, 6)),
            CodecContext::Migration,
        ))
    }

    fn zlib(data: &[u8]) -> Vec<u8> {
        let mut encoder = ZlibEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(data).unwrap();
        encoder.finish().unwrap()
    }

    fn payload(tag: u8, len: usize) -> Vec<u8> {
        let mut data = vec![tag];
        data.extend((1..len).map(|i| (i % 251) as u8));
        data
    }

    fn write_anvil(path: &Path, chunks: &[(i32, i32, Vec<u8>)]) {
        let mut region = AnvilRegion::open(path, true).unwrap();
        for (lx, lz, data) in chunks {
            region.write_chunk(*lx, *lz, COMPRESSION_ZLIB, &zlib(data)).unwrap();
        }
    }

    #[test]
    fn anvil_to_linear_and_back() {

        let dir = tempfile::tempdir().unwrap();
        let mca = dir.path().join("r.1.-2.mca");
        let lrf = dir.path().join("r.1.-2.lrf");
        let back = dir.path().join("back").join("r.1.-2.mca");
        std::fs::create_dir_all(back.parent().unwrap()).unwrap();

        let chunks = vec![
            (0, 0, payload(0x0A, 300)),
            (3, 4, payload(0x0A, 500)),
            (31, 31, payload(0x09, 200)),
        ];
        write_anvil(&mca, &chunks);

        let converter = RegionConverter::new(service());
        let report = converter.convert_file(&mca, &lrf).unwrap();
        assert_eq!(report.converted, 3);
        assert!(report.skipped.is_empty());

        // Absolute coordinates in the Linear directory.
        let mut reader = LinearReader::open(&lrf).unwrap();
        assert!(reader.has_chunk(32, -64));
        assert!(reader.has_chunk(35, -60));
        let chunk = reader.read_chunk(35, -60).unwrap().unwrap();
        assert_eq!(service().decompress(&chunk.data).unwrap(), payload(0x0A, 500));
        drop(reader);

        let report = converter.convert_file(&lrf, &back).unwrap();
        assert_eq!(report.converted, 3);

        let mut region = AnvilRegion::open(&back, false).unwrap();
        let chunk = region.read_chunk(35, -60).unwrap();
        assert_eq!(chunk.decompress(&service()).unwrap(), payload(0x0A, 500));

    }

    #[test]
    fn refuses_same_format() {
        let converter = RegionConverter::new(service());
        let err = converter
            .convert_file(Path::new("r.0.0.mca"), Path::new("r.0.1.mca"))
            .unwrap_err();
        assert!(matches!(err, ConvertError::SameFormat(RegionFormat::Anvil)));
    }

    #[test]
    fn corrupted_chunk_is_skipped() {

        let dir = tempfile::tempdir().unwrap();
        let mca = dir.path().join("r.0.0.mca");
        let lrf = dir.path().join("r.0.0.lrf");

        write_anvil(&mca, &[
            (0, 0, payload(0x0A, 300)),
            (1, 0, payload(0x0A, 300)),
        ]);

        // Overwrite the declared length of the second chunk so it overflows
        // its sector allocation.
        {
            let mut file = std::fs::OpenOptions::new().write(true).open(&mca).unwrap();
            let index = 1usize; // slot of chunk 1/0
            let mut head = [0u8; 4];
            use std::io::Read;
            let mut check = std::fs::File::open(&mca).unwrap();
            check.seek(SeekFrom::Start(index as u64 * 4)).unwrap();
            check.read_exact(&mut head).unwrap();
            let sector = u32::from_be_bytes(head) >> 8;
            file.seek(SeekFrom::Start(sector as u64 * 4096)).unwrap();
            file.write_all(&(u32::MAX / 2).to_be_bytes()).unwrap();
        }

        let converter = RegionConverter::new(service());
        let report = converter.convert_file(&mca, &lrf).unwrap();
        assert_eq!(report.converted, 1);
        assert_eq!(report.skipped.len(), 1);
        assert_eq!((report.skipped[0].cx, report.skipped[0].cz), (1, 0));
        assert!(mca.exists());

    }

    #[test]
    fn directory_conversion_reports() {

        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("region");
        let dst = dir.path().join("linear");
        std::fs::create_dir_all(&src).unwrap();

        write_anvil(&src.join("r.0.0.mca"), &[(0, 0, payload(0x0A, 100))]);
        write_anvil(&src.join("r.0.1.mca"), &[(5, 5, payload(0x0A, 100))]);
        // A file that is not a region file at all.
        std::fs::write(src.join("r.9.9.mca"), b"not a region").unwrap();

        let converter = RegionConverter::new(service());
        let report = converter.convert_directory(&src, &dst, RegionFormat::Linear).unwrap();
        assert_eq!(report.succeeded, 2);
        assert_eq!(report.failed, 1);
        assert_eq!(report.summary(), "2 succeeded, 1 failed");
        assert!(dst.join("r.0.0.lrf").exists());
        assert!(dst.join("r.0.1.lrf").exists());
        assert!(!dst.join("r.9.9.lrf").exists());

    }

}
