//! Online MCA to LRF migration honoring the configured policy, with backup,
//! post-write verification and rollback through the recovery manager.

use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use tracing::{debug, info, warn};

use crate::codec::{CodecError, CompressionService};
use crate::config::Config;
use crate::region::convert::{ConvertError, RegionConverter};
use crate::region::recovery::{self, RecoveryError, RecoveryManager};
use crate::region::{parse_region_name, RegionFormat};


/// When regions are migrated from MCA to LRF.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MigrationMode {
    /// Migrate a region the first time it is read.
    OnDemand,
    /// Migrate at the governor's idle cue, one region at a time.
    Background,
    /// Migrate everything up front before serving reads.
    FullLrf,
    /// Never migrate automatically.
    #[default]
    Manual,
}

/// Result of migrating one region file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MigrationOutcome {
    /// The region was converted and verified.
    Migrated { lrf: PathBuf, chunks: usize, skipped: usize },
    /// A corruption marker excludes this file from automated migration.
    Excluded,
    /// A Linear twin already exists, nothing to do.
    AlreadyLinear(PathBuf),
}

/// Aggregate outcome of a directory migration.
#[derive(Debug, Clone, Copy, Default)]
pub struct MigrationReport {
    pub files_migrated: u64,
    pub files_failed: u64,
    pub files_excluded: u64,
    pub chunks_written: u64,
    pub chunks_skipped: u64,
}


pub struct Migrator {
    service: Arc<CompressionService>,
    converter: RegionConverter,
    recovery: RecoveryManager,
    mode: MigrationMode,
    /// Regions queued for background migration.
    pending: Mutex<Vec<PathBuf>>,
    files_migrated: AtomicU64,
    files_failed: AtomicU64,
}

impl Migrator {

    /// Build a migrator from the engine configuration. The codec levels are
    /// validated for the migration context, which refuses unsafe settings.
    pub fn new(config: &Config) -> Result<Self, CodecError> {
        let service = Arc::new(CompressionService::for_migration(&config.compression)?);
        Ok(Self {
            converter: RegionConverter::new(Arc::clone(&service)),
            service,
            recovery: RecoveryManager::new(config.storage.backup_original),
            mode: config.storage.conversion_mode,
            pending: Mutex::new(Vec::new()),
            files_migrated: AtomicU64::new(0),
            files_failed: AtomicU64::new(0),
        })
    }

    pub fn mode(&self) -> MigrationMode {
        self.mode
    }

    pub fn recovery(&self) -> &RecoveryManager {
        &self.recovery
    }

    pub fn service(&self) -> &Arc<CompressionService> {
        &self.service
    }

    /// Apply a migration policy to a region directory. `FullLrf` migrates
    /// everything now; `Background` queues the files for [`idle_step`];
    /// `OnDemand` and `Manual` do nothing here.
    ///
    /// [`idle_step`]: Migrator::idle_step
    pub fn migrate(&self, region_dir: &Path, mode: MigrationMode) -> Result<MigrationReport, MigrateError> {
        match mode {
            MigrationMode::Manual | MigrationMode::OnDemand => {
                debug!("no up-front migration for {mode:?}");
                Ok(MigrationReport::default())
            }
            MigrationMode::Background => {
                let files = anvil_files(region_dir)?;
                let queued = files.len();
                self.pending.lock().unwrap().extend(files);
                info!("queued {queued} regions of {region_dir:?} for background migration");
                Ok(MigrationReport::default())
            }
            MigrationMode::FullLrf => self.migrate_all(region_dir),
        }
    }

    /// Migrate every `.mca` file in a directory, continuing over per-file
    /// failures.
    pub fn migrate_all(&self, region_dir: &Path) -> Result<MigrationReport, MigrateError> {

        let mut report = MigrationReport::default();
        for mca in anvil_files(region_dir)? {
            self.migrate_into_report(&mca, &mut report);
        }

        info!(
            "migrated {region_dir:?}: {} files converted, {} failed, {} excluded",
            report.files_migrated, report.files_failed, report.files_excluded,
        );
        Ok(report)

    }

    /// Migrate one queued background region. Returns false once the queue
    /// is empty.
    pub fn idle_step(&self) -> bool {
        let Some(mca) = self.pending.lock().unwrap().pop() else {
            return false;
        };
        let mut report = MigrationReport::default();
        self.migrate_into_report(&mca, &mut report);
        true
    }

    /// Number of regions still queued for background migration.
    pub fn pending_len(&self) -> usize {
        self.pending.lock().unwrap().len()
    }

    fn migrate_into_report(&self, mca: &Path, report: &mut MigrationReport) {
        match self.migrate_region(mca) {
            Ok(MigrationOutcome::Migrated { chunks, skipped, .. }) => {
                report.files_migrated += 1;
                report.chunks_written += chunks as u64;
                report.chunks_skipped += skipped as u64;
            }
            Ok(MigrationOutcome::Excluded) => report.files_excluded += 1,
            Ok(MigrationOutcome::AlreadyLinear(_)) => {}
            Err(err) => {
                warn!("failed to migrate {mca:?}: {err}");
                report.files_failed += 1;
            }
        }
    }

    /// Migrate a single `.mca` region to its `.lrf` twin: optional backup,
    /// conversion, then verification of the written file. The original is
    /// only removed after verification, and only when a backup exists.
    pub fn migrate_region(&self, mca: &Path) -> Result<MigrationOutcome, MigrateError> {

        if recovery::is_marked_corrupt(mca) {
            warn!("{mca:?} carries a corruption marker, migration refused");
            return Ok(MigrationOutcome::Excluded);
        }

        let (rx, rz) = parse_region_name(mca)
            .ok_or_else(|| MigrateError::BadRegionName(mca.to_path_buf()))?;
        let parent = mca.parent().unwrap_or(Path::new("."));
        let lrf = parent.join(RegionFormat::Linear.file_name(rx, rz));

        if lrf.exists() {
            debug!("{lrf:?} already exists, skipping migration of {mca:?}");
            return Ok(MigrationOutcome::AlreadyLinear(lrf));
        }

        let backup = self.recovery.backup_region(mca)?;

        let file_report = match self.converter.convert_file(mca, &lrf) {
            Ok(file_report) => file_report,
            Err(err) => {
                self.files_failed.fetch_add(1, Ordering::Relaxed);
                // A failed write leaves no half-migrated file behind.
                let _ = std::fs::remove_file(&lrf);
                recovery::mark_corrupt(mca, &err.to_string())?;
                return Err(err.into());
            }
        };

        if let Err(err) = self.recovery.verify_linear(&lrf, file_report.converted) {
            self.files_failed.fetch_add(1, Ordering::Relaxed);
            self.recovery.count_recovery();
            let _ = std::fs::remove_file(&lrf);
            recovery::mark_corrupt(mca, &err.to_string())?;
            return Err(err.into());
        }

        // The original only disappears once verified and safely copied.
        if backup.is_some() {
            std::fs::remove_file(mca)?;
        }

        self.files_migrated.fetch_add(1, Ordering::Relaxed);
        info!(
            "migrated {mca:?} ({} chunks, {} skipped)",
            file_report.converted, file_report.skipped.len(),
        );

        Ok(MigrationOutcome::Migrated {
            lrf,
            chunks: file_report.converted,
            skipped: file_report.skipped.len(),
        })

    }

    pub fn files_migrated(&self) -> u64 {
        self.files_migrated.load(Ordering::Relaxed)
    }

    pub fn files_failed(&self) -> u64 {
        self.files_failed.load(Ordering::Relaxed)
    }

}

fn anvil_files(region_dir: &Path) -> io::Result<Vec<PathBuf>> {
    let mut files = std::fs::read_dir(region_dir)?
        .collect::<Result<Vec<_>, _>>()?
        .into_iter()
        .map(|entry| entry.path())
        .filter(|path| RegionFormat::detect(path) == Some(RegionFormat::Anvil))
        .collect::<Vec<_>>();
    files.sort();
    Ok(files)
}


#[derive(thiserror::Error, Debug)]
pub enum MigrateError {
    #[error("io: {0}")]
    Io(#[from] io::Error),
    #[error("cannot parse region coordinates from {0:?}")]
    BadRegionName(PathBuf),
    #[error("convert: {0}")]
    Convert(#[from] ConvertError),
    #[error("recovery: {0}")]
    Recovery(#[from] RecoveryError),
}


#[cfg(test)]
mod tests {

    use super::*;
    use crate::config::{CompressionConfig, StorageConfig};
    use crate::region::anvil::{AnvilRegion, COMPRESSION_ZLIB};
    use crate::region::linear::LinearReader;
    use flate2::write::ZlibEncoder;
    use flate2::Compression;
    use std::io::Write;

    fn config(backup: bool) -> Config {
        Config {
            compression: CompressionConfig::default(),
            storage: StorageConfig { backup_original: backup, ..StorageConfig::default() },
            ..Config::default()
        }
    }

    fn zlib(data: &[u8]) -> Vec<u8> {
        let mut encoder = ZlibEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(data).unwrap();
        encoder.finish().unwrap()
    }

    fn payload(len: usize) -> Vec<u8> {
        let mut data = vec![0x0A];
        data.extend((1..len).map(|i| (i % 97) as u8));
        data
    }

    fn write_region(path: &Path, chunks: usize) {
        let mut region = AnvilRegion::open(path, true).unwrap();
        for i in 0..chunks {
            region.write_chunk(i as i32, 0, COMPRESSION_ZLIB, &zlib(&payload(200 + i))).unwrap();
        }
    }

    #[test]
    fn full_migration_with_backup_removes_original() {
        let dir = tempfile::tempdir().unwrap();
        let mca = dir.path().join("r.0.0.mca");
        write_region(&mca, 4);

        let migrator = Migrator::new(&config(true)).unwrap();
        let report = migrator.migrate(dir.path(), MigrationMode::FullLrf).unwrap();
        assert_eq!(report.files_migrated, 1);
        assert_eq!(report.chunks_written, 4);

        let lrf = dir.path().join("r.0.0.lrf");
        assert!(lrf.exists());
        assert!(!mca.exists());

        let reader = LinearReader::open(&lrf).unwrap();
        assert_eq!(reader.len(), 4);
    }

    #[test]
    fn migration_without_backup_keeps_original() {
        let dir = tempfile::tempdir().unwrap();
        let mca = dir.path().join("r.0.0.mca");
        write_region(&mca, 2);

        let migrator = Migrator::new(&config(false)).unwrap();
        let outcome = migrator.migrate_region(&mca).unwrap();
        assert!(matches!(outcome, MigrationOutcome::Migrated { chunks: 2, .. }));
        assert!(mca.exists());
        assert!(dir.path().join("r.0.0.lrf").exists());
    }

    #[test]
    fn corruption_marker_excludes_file() {
        let dir = tempfile::tempdir().unwrap();
        let mca = dir.path().join("r.0.0.mca");
        write_region(&mca, 1);
        recovery::mark_corrupt(&mca, "test").unwrap();

        let migrator = Migrator::new(&config(false)).unwrap();
        assert_eq!(migrator.migrate_region(&mca).unwrap(), MigrationOutcome::Excluded);
        assert!(!dir.path().join("r.0.0.lrf").exists());

        recovery::clear_marker(&mca).unwrap();
        assert!(matches!(
            migrator.migrate_region(&mca).unwrap(),
            MigrationOutcome::Migrated { .. },
        ));
    }

    #[test]
    fn background_mode_queues_and_steps() {
        let dir = tempfile::tempdir().unwrap();
        write_region(&dir.path().join("r.0.0.mca"), 1);
        write_region(&dir.path().join("r.1.0.mca"), 1);

        let migrator = Migrator::new(&config(false)).unwrap();
        migrator.migrate(dir.path(), MigrationMode::Background).unwrap();
        assert_eq!(migrator.pending_len(), 2);

        assert!(migrator.idle_step());
        assert!(migrator.idle_step());
        assert!(!migrator.idle_step());
        assert_eq!(migrator.files_migrated(), 2);
        assert!(dir.path().join("r.0.0.lrf").exists());
        assert!(dir.path().join("r.1.0.lrf").exists());
    }

    #[test]
    fn manual_mode_does_nothing() {
        let dir = tempfile::tempdir().unwrap();
        write_region(&dir.path().join("r.0.0.mca"), 1);
        let migrator = Migrator::new(&config(false)).unwrap();
        let report = migrator.migrate(dir.path(), MigrationMode::Manual).unwrap();
        assert_eq!(report.files_migrated, 0);
        assert!(!dir.path().join("r.0.0.lrf").exists());
    }

    #[test]
    fn corrupt_chunk_is_skipped_and_original_kept() {
        let dir = tempfile::tempdir().unwrap();
        let mca = dir.path().join("r.0.0.mca");
        {
            let mut region = AnvilRegion::open(&mca, true).unwrap();
            region.write_chunk(0, 0, COMPRESSION_ZLIB, &zlib(&payload(100))).unwrap();
            // Garbage that fails zlib decoding.
            region.write_chunk(1, 0, COMPRESSION_ZLIB, &[0xDE, 0xAD, 0xBE, 0xEF]).unwrap();
        }

        let migrator = Migrator::new(&config(false)).unwrap();
        let outcome = migrator.migrate_region(&mca).unwrap();
        let MigrationOutcome::Migrated { chunks, skipped, .. } = outcome else {
            panic!("expected migration");
        };
        assert_eq!(chunks, 1);
        assert_eq!(skipped, 1);
        assert!(mca.exists());
    }

}
