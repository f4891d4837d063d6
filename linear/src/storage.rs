//! The storage manager, single integration point between the work queue and
//! the disk: lazily opened region handles, a per-region read/write lock
//! discipline, the RAM cache and four runtime-resizable worker pools
//! (load, write, compress, decompress).

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use tracing::{debug, warn};

use crate::cache::{CacheCounters, CacheKey, ChunkCache};
use crate::codec::{Codec, CodecKind, CompressionService, ZLIB_MAGIC};
use crate::config::StorageConfig;
use crate::pool::WorkerPool;
use crate::region::anvil::{AnvilError, AnvilRegion, COMPRESSION_SERVICE, COMPRESSION_ZLIB};
use crate::region::linear::{LinearReader, LinearWriter};
use crate::region::{ChunkEntry, RegionFormat};
use crate::util::Completion;


/// Completion handle of a chunk load.
pub type LoadCompletion = Completion<LoadResult>;
/// Completion handle of a chunk save.
pub type SaveCompletion = Completion<Result<(), StorageError>>;

/// Outcome of a chunk load. A chunk absent from its region file is a
/// legitimate outcome, not an error.
#[derive(Debug, Clone)]
pub enum LoadResult {
    Loaded(ChunkEntry),
    Missing,
    Failed(StorageError),
}

/// Current pool targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolSizes {
    pub load: usize,
    pub write: usize,
    pub compress: usize,
    pub decompress: usize,
}

/// Counter snapshot of the storage manager.
#[derive(Debug, Clone, Copy, Default)]
pub struct StorageCounters {
    pub loads: u64,
    pub saves: u64,
    pub load_errors: u64,
    pub save_errors: u64,
    pub cache_hits: u64,
    pub cache: CacheCounters,
}


/// One region file known to the manager. Readers share the lock, writers
/// take it exclusively; operations on distinct regions run in parallel.
struct RegionHandle {
    path: PathBuf,
    format: RegionFormat,
    lock: RwLock<()>,
}

/// Raw payload read from disk before decompression.
enum RawPayload {
    Anvil { compression_id: u8, data: Vec<u8> },
    Linear { data: Vec<u8> },
}

/// Saves in flight for one key: the latest completion serves as the read
/// barrier, the count keeps version tracking alive until every older save
/// drained.
struct PendingWrite {
    completion: SaveCompletion,
    in_flight: usize,
}


#[derive(Debug, Default)]
struct Counters {
    loads: AtomicU64,
    saves: AtomicU64,
    load_errors: AtomicU64,
    save_errors: AtomicU64,
    cache_hits: AtomicU64,
}

pub struct StorageManager {
    service: Arc<CompressionService>,
    cache: Arc<ChunkCache>,
    recompress_on_load: bool,
    regions: Mutex<HashMap<PathBuf, Arc<RegionHandle>>>,
    /// In-flight saves by key: a load submitted after a save waits on the
    /// save's completion so reads and writes stay ordered per key.
    pending_writes: Arc<Mutex<HashMap<CacheKey, PendingWrite>>>,
    /// Monotonic write versions; a write that lost the race to a newer
    /// version of the same key skips the disk, keeping writes totally
    /// ordered per key.
    write_seq: AtomicU64,
    committed_writes: Arc<Mutex<HashMap<CacheKey, u64>>>,
    load_pool: Arc<WorkerPool>,
    write_pool: Arc<WorkerPool>,
    compress_pool: Arc<WorkerPool>,
    decompress_pool: Arc<WorkerPool>,
    counters: Arc<Counters>,
}

impl StorageManager {

    pub fn new(
        config: &StorageConfig,
        recompress_on_load: bool,
        service: Arc<CompressionService>,
        cache: Arc<ChunkCache>,
    ) -> Arc<Self> {

        let cores = num_cpus::get();
        let pools = &config.pools;

        Arc::new(Self {
            service,
            cache,
            recompress_on_load,
            regions: Mutex::new(HashMap::new()),
            pending_writes: Arc::new(Mutex::new(HashMap::new())),
            write_seq: AtomicU64::new(0),
            committed_writes: Arc::new(Mutex::new(HashMap::new())),
            load_pool: Arc::new(WorkerPool::new("Chunk Load", pools.load.resolve((cores / 2).max(2)))),
            write_pool: Arc::new(WorkerPool::new("Chunk Write", pools.write.resolve((cores / 4).max(1)))),
            compress_pool: Arc::new(WorkerPool::new("Chunk Compress", pools.compress.resolve((cores / 4).max(1)))),
            decompress_pool: Arc::new(WorkerPool::new("Chunk Decompress", pools.decompress.resolve((cores / 4).max(1)))),
            counters: Arc::new(Counters::default()),
        })

    }

    pub fn service(&self) -> &Arc<CompressionService> {
        &self.service
    }

    pub fn cache(&self) -> &Arc<ChunkCache> {
        &self.cache
    }

    fn handle(&self, region_path: &Path) -> Arc<RegionHandle> {
        let mut regions = self.regions.lock().unwrap();
        Arc::clone(regions.entry(region_path.to_path_buf()).or_insert_with(|| {
            let format = RegionFormat::detect(region_path).unwrap_or(RegionFormat::Linear);
            debug!("opening region handle {region_path:?} as {format:?}");
            Arc::new(RegionHandle {
                path: region_path.to_path_buf(),
                format,
                lock: RwLock::new(()),
            })
        }))
    }

    /// Load a chunk, serving from the cache when possible, otherwise
    /// reading on the load pool and decoding on the decompress pool.
    pub fn load_chunk(&self, region_path: &Path, cx: i32, cz: i32) -> LoadCompletion {

        let completion = Completion::new();
        let key = CacheKey::new(region_path, cx, cz);

        if let Some(data) = self.cache.get(&key) {
            self.counters.cache_hits.fetch_add(1, Ordering::Relaxed);
            let mut entry = ChunkEntry::new(cx, cz, (*data).clone());
            entry.source_magic = Some(self.service.primary().magic());
            completion.complete(LoadResult::Loaded(entry));
            return completion;
        }

        self.counters.loads.fetch_add(1, Ordering::Relaxed);

        let handle = self.handle(region_path);
        let service = Arc::clone(&self.service);
        let cache = Arc::clone(&self.cache);
        let decompress_pool = Arc::clone(&self.decompress_pool);
        let counters = Arc::clone(&self.counters);
        let recompress_on_load = self.recompress_on_load;
        let write_barrier = self.pending_writes.lock().unwrap()
            .get(&key)
            .map(|pending| pending.completion.clone());
        let job_completion = completion.clone();

        self.load_pool.execute(move || {

            // A save submitted before this load commits first.
            if let Some(barrier) = write_barrier {
                let _ = barrier.wait();
            }

            let raw = {
                let _guard = handle.lock.read().unwrap();
                read_raw(&handle, cx, cz)
            };

            match raw {
                Ok(None) => {
                    job_completion.complete(LoadResult::Missing);
                }
                Err(err) => {
                    warn!("failed to read chunk {cx}/{cz} from {:?}: {err}", handle.path);
                    counters.load_errors.fetch_add(1, Ordering::Relaxed);
                    job_completion.complete(LoadResult::Failed(err));
                }
                Ok(Some(raw)) => {
                    decompress_pool.execute(move || {
                        match decode_raw(&service, raw, cx, cz, recompress_on_load) {
                            Ok(entry) => {
                                cache.put(key, Arc::new(entry.data.clone()));
                                job_completion.complete(LoadResult::Loaded(entry));
                            }
                            Err(err) => {
                                warn!("failed to decode chunk {cx}/{cz}: {err}");
                                counters.load_errors.fetch_add(1, Ordering::Relaxed);
                                job_completion.complete(LoadResult::Failed(err));
                            }
                        }
                    });
                }
            }

        });

        completion

    }

    /// Save a chunk: compress on the compress pool, write on the write pool
    /// under the region's exclusive lock, then invalidate the cache key.
    pub fn save_chunk(&self, region_path: &Path, entry: ChunkEntry) -> SaveCompletion {

        self.counters.saves.fetch_add(1, Ordering::Relaxed);

        let completion = Completion::new();
        let key = CacheKey::new(region_path, entry.cx, entry.cz);
        let version = self.write_seq.fetch_add(1, Ordering::Relaxed) + 1;
        {
            let mut pending = self.pending_writes.lock().unwrap();
            pending.entry(key.clone())
                .and_modify(|write| {
                    write.completion = completion.clone();
                    write.in_flight += 1;
                })
                .or_insert_with(|| PendingWrite { completion: completion.clone(), in_flight: 1 });
        }

        let handle = self.handle(region_path);
        let service = Arc::clone(&self.service);
        let cache = Arc::clone(&self.cache);
        let write_pool = Arc::clone(&self.write_pool);
        let counters = Arc::clone(&self.counters);
        let pending_writes = Arc::clone(&self.pending_writes);
        let committed_writes = Arc::clone(&self.committed_writes);
        let job_completion = completion.clone();

        self.compress_pool.execute(move || {

            let wire = match make_wire_payload(&service, &handle, &entry) {
                Ok(wire) => wire,
                Err(err) => {
                    counters.save_errors.fetch_add(1, Ordering::Relaxed);
                    release_pending_write(&pending_writes, &committed_writes, &key);
                    job_completion.complete(Err(err));
                    return;
                }
            };

            write_pool.execute(move || {

                let result = {
                    let _guard = handle.lock.write().unwrap();
                    let superseded = committed_writes.lock().unwrap()
                        .get(&key)
                        .is_some_and(|&committed| committed > version);
                    if superseded {
                        debug!("skipping superseded write of {}/{}", entry.cx, entry.cz);
                        Ok(())
                    } else {
                        let result = write_wire_payload(&handle, entry.cx, entry.cz, entry.data.len() as u32, wire);
                        if result.is_ok() {
                            committed_writes.lock().unwrap().insert(key.clone(), version);
                        }
                        result
                    }
                };

                cache.invalidate(&key);
                if let Err(err) = &result {
                    warn!("failed to write chunk {}/{} to {:?}: {err}", entry.cx, entry.cz, handle.path);
                    counters.save_errors.fetch_add(1, Ordering::Relaxed);
                }
                release_pending_write(&pending_writes, &committed_writes, &key);
                job_completion.complete(result);

            });

        });

        completion

    }

    pub fn invalidate(&self, region_path: &Path, cx: i32, cz: i32) {
        self.cache.invalidate(&CacheKey::new(region_path, cx, cz));
    }

    pub fn clear_region(&self, region_path: &Path) {
        self.cache.clear_region(region_path);
    }

    /// Retarget the four pools. In-flight work is never dropped, pools over
    /// target shrink by attrition.
    pub fn update_executors(&self, loads: usize, writes: usize, compressions: usize, decompressions: usize) {
        self.load_pool.resize(loads);
        self.write_pool.resize(writes);
        self.compress_pool.resize(compressions);
        self.decompress_pool.resize(decompressions);
    }

    pub fn pool_sizes(&self) -> PoolSizes {
        PoolSizes {
            load: self.load_pool.target(),
            write: self.write_pool.target(),
            compress: self.compress_pool.target(),
            decompress: self.decompress_pool.target(),
        }
    }

    pub fn counters(&self) -> StorageCounters {
        StorageCounters {
            loads: self.counters.loads.load(Ordering::Relaxed),
            saves: self.counters.saves.load(Ordering::Relaxed),
            load_errors: self.counters.load_errors.load(Ordering::Relaxed),
            save_errors: self.counters.save_errors.load(Ordering::Relaxed),
            cache_hits: self.counters.cache_hits.load(Ordering::Relaxed),
            cache: self.cache.counters(),
        }
    }

}


/// Account one finished save. The barrier and the committed version are
/// only dropped once every save for the key drained, since any still-queued
/// older save must keep seeing the committed version.
fn release_pending_write(
    pending: &Mutex<HashMap<CacheKey, PendingWrite>>,
    committed: &Mutex<HashMap<CacheKey, u64>>,
    key: &CacheKey,
) {
    let mut pending = pending.lock().unwrap();
    if let Some(write) = pending.get_mut(key) {
        write.in_flight -= 1;
        if write.in_flight == 0 {
            pending.remove(key);
            committed.lock().unwrap().remove(key);
        }
    }
}

/// Read the raw, still-compressed payload of one chunk.
fn read_raw(handle: &RegionHandle, cx: i32, cz: i32) -> Result<Option<RawPayload>, StorageError> {

    if !handle.path.exists() {
        return Ok(None);
    }

    match handle.format {
        RegionFormat::Anvil => {
            let mut region = AnvilRegion::open(&handle.path, false)
                .map_err(|err| StorageError::from_anvil(&handle.path, err))?;
            match region.read_chunk(cx, cz) {
                Ok(chunk) => Ok(Some(RawPayload::Anvil {
                    compression_id: chunk.compression_id,
                    data: chunk.data,
                })),
                Err(AnvilError::EmptyChunk) => Ok(None),
                Err(err) => Err(StorageError::from_anvil(&handle.path, err)),
            }
        }
        RegionFormat::Linear => {
            let mut reader = LinearReader::open(&handle.path)
                .map_err(|err| StorageError::from_linear(&handle.path, err))?;
            match reader.read_chunk(cx, cz) {
                Ok(Some(chunk)) => Ok(Some(RawPayload::Linear { data: chunk.data })),
                Ok(None) => Ok(None),
                Err(err) => Err(StorageError::from_linear(&handle.path, err)),
            }
        }
    }

}

/// Decompress a raw payload into a chunk entry.
fn decode_raw(
    service: &CompressionService,
    raw: RawPayload,
    cx: i32,
    cz: i32,
    recompress_on_load: bool,
) -> Result<ChunkEntry, StorageError> {

    let primary_magic = service.primary().magic();

    let (data, source_magic) = match raw {
        RawPayload::Anvil { compression_id, data } => {
            let chunk = crate::region::anvil::AnvilChunk { compression_id, data };
            // Raw Zlib payloads (id 2) count as Zlib-sourced so they can
            // keep their codec on save; GZip has no codec counterpart.
            let magic = match compression_id {
                COMPRESSION_ZLIB => Some(ZLIB_MAGIC),
                _ => chunk.envelope_magic(),
            };
            let payload = chunk.decompress(service)
                .map_err(|err| StorageError::Codec(err.to_string()))?;
            (payload, magic)
        }
        RawPayload::Linear { data } => {
            let magic = data.first().copied();
            let payload = service.decompress(&data)
                .map_err(|err| StorageError::Codec(err.to_string()))?;
            (payload, magic)
        }
    };

    let mut entry = ChunkEntry::new(cx, cz, data);
    entry.source_magic = source_magic;
    entry.recompress = recompress_on_load && source_magic != Some(primary_magic);
    Ok(entry)

}

/// Payload ready to hit the disk.
enum WirePayload {
    Anvil { compression_id: u8, data: Vec<u8> },
    Linear { envelope: Vec<u8> },
}

/// Compress a chunk entry for its target region format. A chunk loaded
/// under a non-primary codec keeps that codec on save unless re-encoding
/// was requested at load time. Anvil regions get stock-compatible raw Zlib
/// whenever the effective codec is Zlib, the vendor envelope otherwise.
fn make_wire_payload(
    service: &CompressionService,
    handle: &RegionHandle,
    entry: &ChunkEntry,
) -> Result<WirePayload, StorageError> {

    let kept = entry.source_magic
        .filter(|&magic| !entry.recompress && magic != service.primary().magic())
        .and_then(Codec::for_magic);
    let effective = kept.unwrap_or_else(|| service.primary());

    if handle.format == RegionFormat::Anvil && effective.kind() == CodecKind::Zlib {
        use flate2::write::ZlibEncoder;
        use std::io::Write;
        let mut encoder = ZlibEncoder::new(
            Vec::new(),
            flate2::Compression::new(effective.level()),
        );
        return encoder.write_all(&entry.data)
            .and_then(|()| encoder.finish())
            .map(|data| WirePayload::Anvil { compression_id: COMPRESSION_ZLIB, data })
            .map_err(|err| StorageError::Codec(err.to_string()));
    }

    let envelope = match kept {
        Some(codec) => codec.compress(&entry.data),
        None => service.compress(&entry.data),
    }
    .map_err(|err| StorageError::Codec(err.to_string()))?;

    match handle.format {
        RegionFormat::Linear => Ok(WirePayload::Linear { envelope }),
        RegionFormat::Anvil => Ok(WirePayload::Anvil { compression_id: COMPRESSION_SERVICE, data: envelope }),
    }

}

/// Write a wire payload under the region's exclusive lock. Linear regions
/// are rewritten through a temporary file because the format is append-only
/// within a writer session.
fn write_wire_payload(
    handle: &RegionHandle,
    cx: i32,
    cz: i32,
    uncompressed_size: u32,
    wire: WirePayload,
) -> Result<(), StorageError> {

    match wire {
        WirePayload::Anvil { compression_id, data } => {
            let mut region = AnvilRegion::open(&handle.path, true)
                .map_err(|err| StorageError::from_anvil(&handle.path, err))?;
            region.write_chunk(cx, cz, compression_id, &data)
                .map_err(|err| StorageError::from_anvil(&handle.path, err))
        }
        WirePayload::Linear { envelope } => {

            let mut existing = Vec::new();
            let mut codec_magic = envelope.first().copied().unwrap_or(0);
            if handle.path.exists() {
                let mut reader = LinearReader::open(&handle.path)
                    .map_err(|err| StorageError::from_linear(&handle.path, err))?;
                codec_magic = reader.codec_magic();
                existing = reader.read_all()
                    .map_err(|err| StorageError::from_linear(&handle.path, err))?;
            }

            let tmp = handle.path.with_extension("lrf.tmp");
            let mut writer = LinearWriter::create(&tmp, codec_magic)
                .map_err(|err| StorageError::from_linear(&tmp, err))?;

            for chunk in existing {
                if (chunk.cx, chunk.cz) == (cx, cz) {
                    continue;
                }
                writer.append(chunk.cx, chunk.cz, &chunk.data, chunk.uncompressed_size)
                    .map_err(|err| StorageError::from_linear(&tmp, err))?;
            }
            writer.append(cx, cz, &envelope, uncompressed_size)
                .map_err(|err| StorageError::from_linear(&tmp, err))?;
            writer.finish()
                .map_err(|err| StorageError::from_linear(&tmp, err))?;

            std::fs::rename(&tmp, &handle.path)
                .map_err(|err| StorageError::Io {
                    path: handle.path.display().to_string(),
                    message: err.to_string(),
                })

        }
    }

}


/// Storage failure kinds surfaced through completion handles. Causes are
/// flattened to strings so outcomes stay cheap to clone and share.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum StorageError {
    #[error("io: {path}: {message}")]
    Io { path: String, message: String },
    #[error("codec: {0}")]
    Codec(String),
    #[error("format: {0}")]
    Format(String),
}

impl StorageError {

    fn from_anvil(path: &Path, err: AnvilError) -> Self {
        match err {
            AnvilError::Io(err) => Self::Io {
                path: path.display().to_string(),
                message: err.to_string(),
            },
            AnvilError::Codec(err) => Self::Codec(err.to_string()),
            err => Self::Format(err.to_string()),
        }
    }

    fn from_linear(path: &Path, err: crate::region::linear::LinearError) -> Self {
        use crate::region::linear::LinearError;
        match err {
            LinearError::Io(err) => Self::Io {
                path: path.display().to_string(),
                message: err.to_string(),
            },
            err => Self::Format(err.to_string()),
        }
    }

}
