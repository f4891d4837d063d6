//! The engine value owning every subsystem: codec service, RAM cache,
//! storage manager, unified queue, governor and migrator. Collaborators
//! construct one engine at startup from a [`Config`] and share it by
//! reference; tests construct a fresh engine per case.

use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use arcstr::ArcStr;
use tracing::{debug, info, warn};

use crate::cache::ChunkCache;
use crate::codec::{CodecError, CompressionService, ServiceCounters};
use crate::config::{Config, StorageFormat};
use crate::governor::{
    AdjustmentMode, DetectedHardware, Governor, GovernorDecision, HardwareProvider,
    HealthProvider, SteadyHealth,
};
use crate::migrate::{MigrateError, MigrationMode, MigrationReport, Migrator};
use crate::queue::{ChunkQueue, QueueStats, Task, TaskClass, TaskCompletion};
use crate::region::{chunk_to_region, ChunkEntry, RegionFormat};
use crate::storage::{LoadCompletion, SaveCompletion, StorageCounters, StorageManager};
use crate::util::SystemClock;


/// Grace period granted to running tasks on shutdown.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);


/// Collaborator callback resolving a region file path for a world.
pub trait WorldRegistry: Send + Sync {
    fn region_path(&self, world: &str, rx: i32, rz: i32) -> PathBuf;
}

/// Directory layout `<root>/<world>/region/r.{rx}.{rz}.{ext}`. An existing
/// Linear file wins over an Anvil one; fresh regions follow the configured
/// storage format.
pub struct DirWorldRegistry {
    root: PathBuf,
    format: StorageFormat,
}

impl DirWorldRegistry {

    pub fn new(root: impl Into<PathBuf>, format: StorageFormat) -> Self {
        Self { root: root.into(), format }
    }

    pub fn region_dir(&self, world: &str) -> PathBuf {
        self.root.join(world).join("region")
    }

}

impl WorldRegistry for DirWorldRegistry {

    fn region_path(&self, world: &str, rx: i32, rz: i32) -> PathBuf {
        let dir = self.region_dir(world);
        let lrf = dir.join(RegionFormat::Linear.file_name(rx, rz));
        if lrf.exists() {
            return lrf;
        }
        let mca = dir.join(RegionFormat::Anvil.file_name(rx, rz));
        if mca.exists() {
            return mca;
        }
        match self.format.resolve(None) {
            RegionFormat::Linear => lrf,
            RegionFormat::Anvil => mca,
        }
    }

}


/// Executes dequeued tasks. The engine ships a storage-backed handler for
/// the load classes; generation classes belong to the embedding server.
pub trait TaskHandler: Send + Sync {
    /// Run one task to completion, returning success.
    fn handle(&self, task: &Task) -> bool;
}

/// Built-in handler: loads for `PriorityLoad` and `HyperViewPrefetch`
/// through the storage manager, fails generation tasks since the engine
/// has no world generator.
struct StorageTaskHandler {
    storage: Arc<StorageManager>,
    worlds: Arc<dyn WorldRegistry>,
}

impl TaskHandler for StorageTaskHandler {

    fn handle(&self, task: &Task) -> bool {
        match task.class {
            TaskClass::PriorityLoad | TaskClass::HyperViewPrefetch => {
                let (rx, rz) = chunk_to_region(task.key.cx, task.key.cz);
                let path = self.worlds.region_path(&task.key.world, rx, rz);
                let result = self.storage.load_chunk(&path, task.key.cx, task.key.cz).wait();
                !matches!(result, crate::storage::LoadResult::Failed(_))
            }
            TaskClass::ParallelGeneration | TaskClass::BackgroundGeneration => {
                warn!("no generation handler installed, failing {} task", task.class.name());
                false
            }
        }
    }

}


/// Aggregated statistics of a running engine.
#[derive(Debug, Clone)]
pub struct EngineStats {
    pub storage: StorageCounters,
    pub queue: QueueStats,
    pub service: ServiceCounters,
    pub governor_mode: AdjustmentMode,
    pub last_decision: Option<GovernorDecision>,
    pub files_migrated: u64,
}


pub struct Engine {
    config: Config,
    service: Arc<CompressionService>,
    cache: Arc<ChunkCache>,
    storage: Arc<StorageManager>,
    queue: Arc<ChunkQueue>,
    governor: Arc<Governor>,
    migrator: Arc<Migrator>,
    worlds: Arc<dyn WorldRegistry>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl Engine {

    /// Build an engine rooted at a world directory, with detected hardware
    /// and an always-healthy tick signal.
    pub fn new(config: Config, root: impl Into<PathBuf>) -> Result<Self, CodecError> {
        let format = config.storage.format;
        let max_memory = config.governor.max_memory;
        Self::with_providers(
            config,
            Arc::new(DirWorldRegistry::new(root, format)),
            Box::new(DetectedHardware { max_memory }),
            Box::new(SteadyHealth),
        )
    }

    /// Build an engine with collaborator-supplied callbacks.
    pub fn with_providers(
        config: Config,
        worlds: Arc<dyn WorldRegistry>,
        hardware: Box<dyn HardwareProvider>,
        health: Box<dyn HealthProvider>,
    ) -> Result<Self, CodecError> {

        let service = Arc::new(CompressionService::new(&config.compression));
        let cache = Arc::new(ChunkCache::new(&config.storage.cache, Arc::new(SystemClock)));
        let storage = StorageManager::new(
            &config.storage,
            config.compression.recompress_on_load,
            Arc::clone(&service),
            Arc::clone(&cache),
        );
        let queue = ChunkQueue::new(&config.queue);
        let governor = Governor::new(
            &config.governor,
            Arc::clone(&storage),
            Arc::clone(&queue),
            hardware,
            health,
            config.storage.pools.all_auto(),
        );
        let migrator = Arc::new(Migrator::new(&config)?);

        governor.adjust_now();
        governor.start(config.governor.adjust_interval);
        info!("engine ready, cache {}", if cache.is_enabled() { "enabled" } else { "disabled" });

        Ok(Self {
            config,
            service,
            cache,
            storage,
            queue,
            governor,
            migrator,
            worlds,
            workers: Mutex::new(Vec::new()),
        })

    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn service(&self) -> &Arc<CompressionService> {
        &self.service
    }

    pub fn cache(&self) -> &Arc<ChunkCache> {
        &self.cache
    }

    pub fn storage(&self) -> &Arc<StorageManager> {
        &self.storage
    }

    pub fn queue(&self) -> &Arc<ChunkQueue> {
        &self.queue
    }

    pub fn governor(&self) -> &Arc<Governor> {
        &self.governor
    }

    pub fn migrator(&self) -> &Arc<Migrator> {
        &self.migrator
    }

    /// Spawn queue worker threads running the built-in storage handler.
    pub fn start_workers(&self, count: usize) {
        let handler: Arc<dyn TaskHandler> = Arc::new(StorageTaskHandler {
            storage: Arc::clone(&self.storage),
            worlds: Arc::clone(&self.worlds),
        });
        self.start_workers_with(count, handler);
    }

    /// Spawn queue worker threads running a collaborator handler.
    pub fn start_workers_with(&self, count: usize, handler: Arc<dyn TaskHandler>) {

        let mut workers = self.workers.lock().unwrap();
        for i in 0..count {

            let queue = Arc::clone(&self.queue);
            let handler = Arc::clone(&handler);

            let handle = thread::Builder::new()
                .name(format!("Chunk Queue Worker #{i}"))
                .spawn(move || {
                    while let Some(task) = queue.next_task() {
                        if task.token.is_cancelled() {
                            queue.complete_task(&task, false);
                            continue;
                        }
                        let success = handler.handle(&task);
                        queue.complete_task(&task, success);
                    }
                    debug!("queue worker exiting");
                })
                .expect("failed to spawn queue worker");
            workers.push(handle);

        }

    }

    /// Resolve the region file path of a chunk, running on-demand migration
    /// when configured.
    fn resolve_region(&self, world: &str, cx: i32, cz: i32) -> PathBuf {

        let (rx, rz) = chunk_to_region(cx, cz);
        let path = self.worlds.region_path(world, rx, rz);

        if self.config.storage.conversion_mode == MigrationMode::OnDemand
            && RegionFormat::detect(&path) == Some(RegionFormat::Anvil)
            && path.exists()
        {
            match self.migrator.migrate_region(&path) {
                Ok(crate::migrate::MigrationOutcome::Migrated { lrf, .. })
                | Ok(crate::migrate::MigrationOutcome::AlreadyLinear(lrf)) => return lrf,
                Ok(crate::migrate::MigrationOutcome::Excluded) => {}
                Err(err) => warn!("on-demand migration of {path:?} failed: {err}"),
            }
        }

        path

    }

    /// Load a chunk directly through the storage manager.
    pub fn load(&self, world: &str, cx: i32, cz: i32) -> LoadCompletion {
        let path = self.resolve_region(world, cx, cz);
        self.storage.load_chunk(&path, cx, cz)
    }

    /// Save a chunk through the storage manager.
    pub fn save(&self, world: &str, entry: ChunkEntry) -> SaveCompletion {
        let path = self.resolve_region(world, entry.cx, entry.cz);
        self.storage.save_chunk(&path, entry)
    }

    pub fn invalidate(&self, world: &str, cx: i32, cz: i32) {
        let (rx, rz) = chunk_to_region(cx, cz);
        let path = self.worlds.region_path(world, rx, rz);
        self.storage.invalidate(&path, cx, cz);
    }

    /// Submit chunk work to the unified queue.
    pub fn submit(&self, class: TaskClass, world: impl Into<ArcStr>, cx: i32, cz: i32) -> TaskCompletion {
        self.queue.submit(class, world, cx, cz)
    }

    pub fn cancel(&self, world: impl Into<ArcStr>, cx: i32, cz: i32) -> bool {
        self.queue.cancel(world, cx, cz)
    }

    pub fn set_governor_mode(&self, mode: AdjustmentMode) {
        self.governor.set_mode(mode);
    }

    pub fn effective_prefetch_radius(&self, requested: u32) -> u32 {
        self.governor.effective_prefetch_radius(requested)
    }

    /// Migrate a world's region directory with the given policy.
    pub fn migrate(&self, world: &str, mode: MigrationMode) -> Result<MigrationReport, MigrateError> {
        let dir = self.worlds.region_path(world, 0, 0);
        let region_dir = dir.parent().map(PathBuf::from).unwrap_or(dir);
        self.migrator.migrate(&region_dir, mode)
    }

    pub fn stats(&self) -> EngineStats {
        EngineStats {
            storage: self.storage.counters(),
            queue: self.queue.stats(),
            service: self.service.counters(),
            governor_mode: self.governor.mode(),
            last_decision: self.governor.last_decision(),
            files_migrated: self.migrator.files_migrated(),
        }
    }

    /// Cancel queued work, wait for running tasks within the grace period,
    /// stop the governor and join the workers.
    pub fn shutdown(&self) {
        info!("engine shutting down");
        self.queue.shutdown(SHUTDOWN_GRACE);
        self.governor.stop();
        let workers = std::mem::take(&mut *self.workers.lock().unwrap());
        for handle in workers {
            if handle.join().is_err() {
                warn!("queue worker panicked during shutdown");
            }
        }
    }

}
