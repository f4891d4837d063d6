//! The resource governor: a hardware profile and a rolling health snapshot
//! drive the storage pool sizes, the queue concurrency bound and the
//! prefetch radius published to collaborators. A dedicated low-priority
//! worker re-evaluates on a fixed cadence.

use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::thread;
use std::time::Duration;

use crossbeam_channel::{bounded, RecvTimeoutError, Sender};
use once_cell::sync::Lazy;
use tracing::{debug, info, warn};

use crate::config::GovernorConfig;
use crate::queue::ChunkQueue;
use crate::storage::{PoolSizes, StorageManager};


/// Prefetch radius ceiling under critical health.
const CRITICAL_RADIUS: u32 = 8;


/// One reading of the collaborator's tick loop.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct HealthSnapshot {
    /// Milliseconds spent per tick.
    pub mspt: f32,
    /// Ticks per second actually achieved.
    pub tps: f32,
}

impl HealthSnapshot {

    /// A server at rest: instant ticks at full rate.
    pub const IDEAL: Self = Self { mspt: 0.0, tps: 20.0 };

    pub fn is_healthy(self) -> bool {
        !self.is_struggling() && !self.is_critical()
    }

    pub fn is_struggling(self) -> bool {
        self.mspt > 50.0 || self.tps < 18.0
    }

    pub fn is_critical(self) -> bool {
        self.mspt > 100.0 || self.tps < 10.0
    }

}

/// Coarse hardware bucket driving the adaptive defaults.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HardwareTier {
    LowEnd,
    MidRange,
    HighEnd,
    Server,
}

impl HardwareTier {

    /// Pool baseline as `[load, write, compress, decompress]`.
    fn base_pools(self) -> [usize; 4] {
        match self {
            Self::LowEnd => [2, 1, 1, 1],
            Self::MidRange => [4, 2, 2, 2],
            Self::HighEnd => [6, 3, 4, 4],
            Self::Server => [8, 4, 6, 6],
        }
    }

    fn base_concurrent(self) -> usize {
        match self {
            Self::LowEnd => 4,
            Self::MidRange => 8,
            Self::HighEnd => 16,
            Self::Server => 32,
        }
    }

    /// Ceiling on the prefetch radius collaborators may use.
    fn radius_cap(self) -> u32 {
        match self {
            Self::LowEnd => 8,
            Self::MidRange => 16,
            Self::HighEnd => 32,
            Self::Server => 64,
        }
    }

    /// Multiplier applied by [`AdjustmentMode::Adaptive`].
    fn multiplier(self) -> f32 {
        match self {
            Self::LowEnd => 0.5,
            Self::MidRange => 1.0,
            Self::HighEnd => 1.25,
            Self::Server => 1.5,
        }
    }

}

/// Description of the machine the engine runs on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HardwareProfile {
    pub cores: usize,
    pub max_memory: u64,
    pub os: &'static str,
    pub tier: HardwareTier,
}

impl HardwareProfile {

    pub fn classify(cores: usize, max_memory: u64) -> HardwareTier {
        const GIB: u64 = 1024 * 1024 * 1024;
        if cores >= 16 && max_memory >= 32 * GIB {
            HardwareTier::Server
        } else if cores >= 8 && max_memory >= 12 * GIB {
            HardwareTier::HighEnd
        } else if cores >= 4 && max_memory >= 6 * GIB {
            HardwareTier::MidRange
        } else {
            HardwareTier::LowEnd
        }
    }

    /// Build a profile from the detected core count and the configured
    /// memory budget.
    pub fn detect(max_memory: u64) -> Self {
        static CORES: Lazy<usize> = Lazy::new(num_cpus::get);
        let cores = *CORES;
        Self {
            cores,
            max_memory,
            os: std::env::consts::OS,
            tier: Self::classify(cores, max_memory),
        }
    }

}

/// Collaborator callback reading the tick loop health.
pub trait HealthProvider: Send + Sync {
    fn snapshot(&self) -> HealthSnapshot;
}

/// Collaborator callback describing the machine.
pub trait HardwareProvider: Send + Sync {
    fn profile(&self) -> HardwareProfile;
}

/// Health provider for embedders without a tick loop, always ideal.
#[derive(Debug, Default)]
pub struct SteadyHealth;

impl HealthProvider for SteadyHealth {
    fn snapshot(&self) -> HealthSnapshot {
        HealthSnapshot::IDEAL
    }
}

/// Hardware provider using the detected core count and a fixed memory
/// budget.
#[derive(Debug)]
pub struct DetectedHardware {
    pub max_memory: u64,
}

impl HardwareProvider for DetectedHardware {
    fn profile(&self) -> HardwareProfile {
        HardwareProfile::detect(self.max_memory)
    }
}


/// How aggressively resources are sized relative to the tier baseline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AdjustmentMode {
    Conservative,
    Balanced,
    Aggressive,
    #[default]
    Adaptive,
}

impl AdjustmentMode {

    pub fn name(self) -> &'static str {
        match self {
            Self::Conservative => "conservative",
            Self::Balanced => "balanced",
            Self::Aggressive => "aggressive",
            Self::Adaptive => "adaptive",
        }
    }

    fn multiplier(self, tier: HardwareTier) -> f32 {
        match self {
            Self::Conservative => 0.5,
            Self::Balanced => 1.0,
            Self::Aggressive => 1.5,
            Self::Adaptive => tier.multiplier(),
        }
    }

}

impl FromStr for AdjustmentMode {

    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "conservative" => Ok(Self::Conservative),
            "balanced" => Ok(Self::Balanced),
            "aggressive" => Ok(Self::Aggressive),
            "adaptive" => Ok(Self::Adaptive),
            other => Err(format!("unknown governor mode: {other}")),
        }
    }

}


/// Everything the governor decided on its last evaluation.
#[derive(Debug, Clone, Copy)]
pub struct GovernorDecision {
    pub pools: PoolSizes,
    pub max_concurrent: usize,
    pub snapshot: HealthSnapshot,
    pub tier: HardwareTier,
}

pub struct Governor {
    storage: Arc<StorageManager>,
    queue: Arc<ChunkQueue>,
    hardware: Box<dyn HardwareProvider>,
    health: Box<dyn HealthProvider>,
    mode: Mutex<AdjustmentMode>,
    /// False when the operator pinned pool sizes in the configuration.
    manage_pools: bool,
    adjustments: AtomicU64,
    last: Mutex<Option<GovernorDecision>>,
    stopper: Mutex<Option<Sender<()>>>,
}

impl Governor {

    pub fn new(
        config: &GovernorConfig,
        storage: Arc<StorageManager>,
        queue: Arc<ChunkQueue>,
        hardware: Box<dyn HardwareProvider>,
        health: Box<dyn HealthProvider>,
        manage_pools: bool,
    ) -> Arc<Self> {
        Arc::new(Self {
            storage,
            queue,
            hardware,
            health,
            mode: Mutex::new(config.mode),
            manage_pools,
            adjustments: AtomicU64::new(0),
            last: Mutex::new(None),
            stopper: Mutex::new(None),
        })
    }

    /// Start the periodic adjuster. The worker only holds a weak reference
    /// so an engine dropped without an explicit stop still winds down.
    pub fn start(self: &Arc<Self>, interval: Duration) {

        let mut stopper = self.stopper.lock().unwrap();
        if stopper.is_some() {
            return;
        }

        let (sender, receiver) = bounded::<()>(1);
        *stopper = Some(sender);
        let weak: Weak<Governor> = Arc::downgrade(self);

        thread::Builder::new()
            .name("Resource Governor".to_owned())
            .spawn(move || {
                loop {
                    match receiver.recv_timeout(interval) {
                        Err(RecvTimeoutError::Timeout) => {
                            let Some(governor) = weak.upgrade() else { break };
                            governor.adjust_now();
                        }
                        Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
                    }
                }
            })
            .expect("failed to spawn governor worker");

    }

    /// Stop the periodic adjuster.
    pub fn stop(&self) {
        if let Some(sender) = self.stopper.lock().unwrap().take() {
            let _ = sender.send(());
        }
    }

    pub fn mode(&self) -> AdjustmentMode {
        *self.mode.lock().unwrap()
    }

    /// Switch the adjustment mode. Re-applying the current mode is a no-op.
    pub fn set_mode(&self, mode: AdjustmentMode) {
        {
            let mut current = self.mode.lock().unwrap();
            if *current == mode {
                debug!("governor mode already {}", mode.name());
                return;
            }
            info!("governor mode {} -> {}", current.name(), mode.name());
            *current = mode;
        }
        self.adjust_now();
    }

    /// Re-evaluate immediately: compute pool targets and the concurrency
    /// bound, and push them to the storage manager and the queue.
    pub fn adjust_now(&self) -> GovernorDecision {

        let profile = self.hardware.profile();
        let snapshot = self.health.snapshot();
        let mode = self.mode();
        let multiplier = mode.multiplier(profile.tier);

        let scale = |n: usize| ((n as f32 * multiplier).round() as usize).max(1);
        let base = profile.tier.base_pools();
        let pools = PoolSizes {
            load: scale(base[0]),
            write: scale(base[1]),
            compress: scale(base[2]),
            decompress: scale(base[3]),
        };

        let mut max_concurrent = scale(profile.tier.base_concurrent());
        if snapshot.is_critical() {
            max_concurrent = (max_concurrent / 4).max(1);
            warn!("critical health (mspt {:.1}, tps {:.1}), clamping concurrency to {max_concurrent}", snapshot.mspt, snapshot.tps);
        } else if snapshot.is_struggling() {
            max_concurrent = (max_concurrent / 2).max(1);
        }

        // Soft deadline pressure backs concurrency off one notch more.
        if self.queue.soft_deadline_exceeded() {
            max_concurrent = (max_concurrent - max_concurrent / 4).max(1);
            debug!("queued work past its soft deadline, backing off to {max_concurrent}");
        }

        if self.manage_pools {
            self.storage.update_executors(pools.load, pools.write, pools.compress, pools.decompress);
        }
        self.queue.set_max_concurrent(max_concurrent);
        self.queue.set_critical(snapshot.is_critical());

        let decision = GovernorDecision {
            pools,
            max_concurrent,
            snapshot,
            tier: profile.tier,
        };
        *self.last.lock().unwrap() = Some(decision);
        self.adjustments.fetch_add(1, Ordering::Relaxed);
        debug!("adjusted: tier {:?}, mode {}, pools {pools:?}, concurrency {max_concurrent}", profile.tier, mode.name());

        decision

    }

    /// Clamp a requested prefetch radius to what the machine and the
    /// current health allow.
    pub fn effective_prefetch_radius(&self, requested: u32) -> u32 {
        let profile = self.hardware.profile();
        let snapshot = self.health.snapshot();
        let capped = requested.min(profile.tier.radius_cap());
        if snapshot.is_critical() {
            capped.min(CRITICAL_RADIUS)
        } else if snapshot.is_struggling() {
            (capped / 2).max(1)
        } else {
            capped
        }
    }

    pub fn adjustments(&self) -> u64 {
        self.adjustments.load(Ordering::Relaxed)
    }

    pub fn last_decision(&self) -> Option<GovernorDecision> {
        *self.last.lock().unwrap()
    }

}


#[cfg(test)]
mod tests {

    use super::*;
    use crate::cache::ChunkCache;
    use crate::codec::CompressionService;
    use crate::config::{CacheConfig, CompressionConfig, QueueConfig, StorageConfig};
    use crate::queue::{TaskClass, TaskOutcome};
    use crate::util::SystemClock;

    struct FakeHealth(Mutex<HealthSnapshot>);

    impl FakeHealth {
        fn new(snapshot: HealthSnapshot) -> Arc<Self> {
            Arc::new(Self(Mutex::new(snapshot)))
        }
        fn set(&self, snapshot: HealthSnapshot) {
            *self.0.lock().unwrap() = snapshot;
        }
    }

    impl HealthProvider for Arc<FakeHealth> {
        fn snapshot(&self) -> HealthSnapshot {
            *self.0.lock().unwrap()
        }
    }

    struct FixedHardware(HardwareProfile);

    impl HardwareProvider for FixedHardware {
        fn profile(&self) -> HardwareProfile {
            self.0
        }
    }

    fn profile(tier: HardwareTier) -> HardwareProfile {
        HardwareProfile { cores: 8, max_memory: 16 << 30, os: "linux", tier }
    }

    fn governor(tier: HardwareTier, health: Arc<FakeHealth>) -> (Arc<Governor>, Arc<ChunkQueue>, Arc<StorageManager>) {
        let service = Arc::new(CompressionService::new(&CompressionConfig::default()));
        let cache = Arc::new(ChunkCache::new(
            &CacheConfig { enabled: false, ..CacheConfig::default() },
            Arc::new(SystemClock),
        ));
        let storage = StorageManager::new(&StorageConfig::default(), false, service, cache);
        let queue = ChunkQueue::new(&QueueConfig::default());
        let governor = Governor::new(
            &GovernorConfig::default(),
            Arc::clone(&storage),
            Arc::clone(&queue),
            Box::new(FixedHardware(profile(tier))),
            Box::new(health),
            true,
        );
        (governor, queue, storage)
    }

    #[test]
    fn tier_classification() {
        const GIB: u64 = 1 << 30;
        assert_eq!(HardwareProfile::classify(2, 4 * GIB), HardwareTier::LowEnd);
        assert_eq!(HardwareProfile::classify(4, 8 * GIB), HardwareTier::MidRange);
        assert_eq!(HardwareProfile::classify(8, 16 * GIB), HardwareTier::HighEnd);
        assert_eq!(HardwareProfile::classify(32, 64 * GIB), HardwareTier::Server);
        // Plenty of cores but little memory stays low.
        assert_eq!(HardwareProfile::classify(32, 2 * GIB), HardwareTier::LowEnd);
    }

    #[test]
    fn health_thresholds() {
        assert!(HealthSnapshot::IDEAL.is_healthy());
        assert!(HealthSnapshot { mspt: 60.0, tps: 19.0 }.is_struggling());
        let critical = HealthSnapshot { mspt: 120.0, tps: 9.0 };
        assert!(critical.is_critical());
        assert!(!critical.is_healthy());
    }

    #[test]
    fn adjust_applies_mode_multiplier() {
        let health = FakeHealth::new(HealthSnapshot::IDEAL);
        let (governor, queue, storage) = governor(HardwareTier::HighEnd, health);

        governor.set_mode(AdjustmentMode::Balanced);
        let decision = governor.last_decision().unwrap();
        assert_eq!(decision.pools, PoolSizes { load: 6, write: 3, compress: 4, decompress: 4 });
        assert_eq!(decision.max_concurrent, 16);
        assert_eq!(storage.pool_sizes(), decision.pools);
        assert_eq!(queue.stats().max_concurrent, 16);

        governor.set_mode(AdjustmentMode::Conservative);
        let decision = governor.last_decision().unwrap();
        assert_eq!(decision.pools, PoolSizes { load: 3, write: 2, compress: 2, decompress: 2 });
        assert_eq!(decision.max_concurrent, 8);
    }

    #[test]
    fn identical_mode_is_a_no_op() {
        let health = FakeHealth::new(HealthSnapshot::IDEAL);
        let (governor, _queue, _storage) = governor(HardwareTier::MidRange, health);
        governor.set_mode(AdjustmentMode::Balanced);
        let count = governor.adjustments();
        governor.set_mode(AdjustmentMode::Balanced);
        assert_eq!(governor.adjustments(), count);
    }

    #[test]
    fn critical_clamps_concurrency_and_refuses_prefetch() {
        let health = FakeHealth::new(HealthSnapshot { mspt: 120.0, tps: 9.0 });
        let (governor, queue, _storage) = governor(HardwareTier::Server, Arc::clone(&health));

        let decision = governor.adjust_now();
        assert!(decision.snapshot.is_critical());
        assert!(decision.max_concurrent <= 12);

        let completion = queue.submit(TaskClass::HyperViewPrefetch, "w", 0, 0);
        assert_eq!(completion.try_get(), Some(TaskOutcome::Cancelled));
    }

    #[test]
    fn prefetch_radius_scenarios() {
        let health = FakeHealth::new(HealthSnapshot::IDEAL);
        let (governor, _queue, _storage) = governor(HardwareTier::Server, Arc::clone(&health));

        assert_eq!(governor.effective_prefetch_radius(64), 64);
        assert_eq!(governor.effective_prefetch_radius(100), 64);

        health.set(HealthSnapshot { mspt: 70.0, tps: 15.0 });
        assert_eq!(governor.effective_prefetch_radius(64), 32);

        health.set(HealthSnapshot { mspt: 120.0, tps: 9.0 });
        assert_eq!(governor.effective_prefetch_radius(64), 8);
    }

    #[test]
    fn adaptive_mode_follows_tier() {
        let health = FakeHealth::new(HealthSnapshot::IDEAL);
        let (governor, _queue, _storage) = governor(HardwareTier::LowEnd, health);
        // Default mode is adaptive, low end halves the baseline.
        let decision = governor.adjust_now();
        assert_eq!(decision.pools, PoolSizes { load: 1, write: 1, compress: 1, decompress: 1 });
        assert_eq!(decision.max_concurrent, 2);
    }

}
