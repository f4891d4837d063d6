//! Guard rails around migrations: original-file backups, post-write
//! verification, rollback to Anvil and corruption markers.

use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use tracing::{info, warn};

use super::convert::{ConvertError, RegionConverter};
use super::linear::{LinearError, LinearReader};
use super::{parse_region_name, RegionFormat};


/// Extension appended to a region file name to mark it corrupt.
const CORRUPT_MARKER_EXT: &str = "corrupt";


/// Tracks and performs the recovery actions of a migration.
#[derive(Debug)]
pub struct RecoveryManager {
    backup_enabled: bool,
    recoveries: AtomicU64,
    rollbacks: AtomicU64,
}

impl RecoveryManager {

    pub fn new(backup_enabled: bool) -> Self {
        Self {
            backup_enabled,
            recoveries: AtomicU64::new(0),
            rollbacks: AtomicU64::new(0),
        }
    }

    pub fn backup_enabled(&self) -> bool {
        self.backup_enabled
    }

    /// Copy a region file into a timestamped `backup-<secs>` directory next
    /// to it. Returns the backup path, or `None` when backups are disabled.
    pub fn backup_region(&self, src: &Path) -> Result<Option<PathBuf>, RecoveryError> {

        if !self.backup_enabled {
            return Ok(None);
        }

        let secs = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0);

        let parent = src.parent().unwrap_or(Path::new("."));
        let backup_dir = parent.join(format!("backup-{secs}"));
        std::fs::create_dir_all(&backup_dir)?;

        let file_name = src.file_name()
            .ok_or_else(|| RecoveryError::NotARegionFile(src.to_path_buf()))?;
        let backup = backup_dir.join(file_name);
        std::fs::copy(src, &backup)?;

        info!("backed up {src:?} to {backup:?}");
        Ok(Some(backup))

    }

    /// Verify a freshly written Linear file: the format must re-detect from
    /// the extension, the file must open cleanly and hold the expected
    /// number of chunks.
    pub fn verify_linear(&self, path: &Path, expected_chunks: usize) -> Result<(), RecoveryError> {

        if RegionFormat::detect(path) != Some(RegionFormat::Linear) {
            return Err(RecoveryError::NotARegionFile(path.to_path_buf()));
        }

        let len = std::fs::metadata(path)?.len();
        if len == 0 {
            return Err(RecoveryError::VerifyFailed {
                path: path.to_path_buf(),
                expected: expected_chunks,
                actual: 0,
            });
        }

        let reader = LinearReader::open(path)?;
        if reader.len() != expected_chunks {
            return Err(RecoveryError::VerifyFailed {
                path: path.to_path_buf(),
                expected: expected_chunks,
                actual: reader.len(),
            });
        }

        Ok(())

    }

    /// Convert a Linear region back to Anvil inside `dir`, counting the
    /// rollback. The target file name is derived from the source name.
    pub fn rollback_to_mca(&self, lrf: &Path, dir: &Path, converter: &RegionConverter) -> Result<PathBuf, RecoveryError> {

        let (rx, rz) = parse_region_name(lrf)
            .ok_or_else(|| RecoveryError::NotARegionFile(lrf.to_path_buf()))?;
        let dst = dir.join(RegionFormat::Anvil.file_name(rx, rz));

        converter.convert_file(lrf, &dst)?;
        self.rollbacks.fetch_add(1, Ordering::Relaxed);
        warn!("rolled back {lrf:?} to {dst:?}");

        Ok(dst)

    }

    /// Record one recovered file.
    pub fn count_recovery(&self) {
        self.recoveries.fetch_add(1, Ordering::Relaxed);
    }

    pub fn recoveries(&self) -> u64 {
        self.recoveries.load(Ordering::Relaxed)
    }

    pub fn rollbacks(&self) -> u64 {
        self.rollbacks.load(Ordering::Relaxed)
    }

}


/// Path of the corruption marker for a region file.
pub fn marker_path(region: &Path) -> PathBuf {
    let mut name = region.file_name().unwrap_or_default().to_os_string();
    name.push(".");
    name.push(CORRUPT_MARKER_EXT);
    region.with_file_name(name)
}

/// Write a corruption marker next to a region file. The file is excluded
/// from automated migration until the marker is cleared.
pub fn mark_corrupt(region: &Path, reason: &str) -> io::Result<PathBuf> {
    let marker = marker_path(region);
    std::fs::write(&marker, reason)?;
    warn!("marked {region:?} as corrupt: {reason}");
    Ok(marker)
}

pub fn is_marked_corrupt(region: &Path) -> bool {
    marker_path(region).exists()
}

/// Remove the corruption marker, allowing migration again. Returns whether
/// a marker existed.
pub fn clear_marker(region: &Path) -> io::Result<bool> {
    match std::fs::remove_file(marker_path(region)) {
        Ok(()) => Ok(true),
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(false),
        Err(err) => Err(err),
    }
}


#[derive(thiserror::Error, Debug)]
pub enum RecoveryError {
    #[error("io: {0}")]
    Io(#[from] io::Error),
    #[error("linear: {0}")]
    Linear(#[from] LinearError),
    #[error("convert: {0}")]
    Convert(#[from] ConvertError),
    #[error("{0:?} is not a region file")]
    NotARegionFile(PathBuf),
    #[error("verification of {path:?} failed: expected {expected} chunks, found {actual}")]
    VerifyFailed { path: PathBuf, expected: usize, actual: usize },
}
