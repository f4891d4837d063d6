//! The unified chunk queue, sole scheduling authority for chunk-directed
//! work. Tasks are deduplicated by `(world, chunk)`, ordered by class
//! priority with FIFO tie-break, and bounded both globally and per class.
//! Workers block on [`next_task`] and report back through [`complete_task`].
//!
//! [`next_task`]: ChunkQueue::next_task
//! [`complete_task`]: ChunkQueue::complete_task

use std::cmp::Ordering as CmpOrdering;
use std::collections::{BinaryHeap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

use arcstr::ArcStr;
use tracing::{debug, warn};

use crate::config::QueueConfig;
use crate::util::Completion;


/// Work classes in strict priority order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TaskClass {
    /// Player-facing load, minimize latency.
    PriorityLoad,
    /// Near-player generation.
    ParallelGeneration,
    /// Idle fill generation.
    BackgroundGeneration,
    /// Speculative prefetch, behind everything else.
    HyperViewPrefetch,
}

impl TaskClass {

    pub const ALL: [Self; 4] = [
        Self::PriorityLoad,
        Self::ParallelGeneration,
        Self::BackgroundGeneration,
        Self::HyperViewPrefetch,
    ];

    /// Numeric priority, lower runs first.
    pub fn priority(self) -> u8 {
        match self {
            Self::PriorityLoad => 0,
            Self::ParallelGeneration => 2,
            Self::BackgroundGeneration => 5,
            Self::HyperViewPrefetch => 8,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Self::PriorityLoad => "priority-load",
            Self::ParallelGeneration => "parallel-generation",
            Self::BackgroundGeneration => "background-generation",
            Self::HyperViewPrefetch => "hyper-view-prefetch",
        }
    }

    /// Queued time after which the governor should back off submissions of
    /// this class. Exceeding it never fails the task itself.
    pub fn soft_deadline(self) -> Duration {
        match self {
            Self::PriorityLoad => Duration::from_millis(500),
            Self::ParallelGeneration => Duration::from_secs(2),
            Self::BackgroundGeneration => Duration::from_secs(10),
            Self::HyperViewPrefetch => Duration::from_secs(30),
        }
    }

    fn index(self) -> usize {
        match self {
            Self::PriorityLoad => 0,
            Self::ParallelGeneration => 1,
            Self::BackgroundGeneration => 2,
            Self::HyperViewPrefetch => 3,
        }
    }

}

/// Identity of a chunk task: the world and the chunk coordinates.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TaskKey {
    pub world: ArcStr,
    pub cx: i32,
    pub cz: i32,
}

impl TaskKey {

    pub fn new(world: impl Into<ArcStr>, cx: i32, cz: i32) -> Self {
        Self { world: world.into(), cx, cz }
    }

}

/// Final outcome observed through a task's completion handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskOutcome {
    Completed,
    Failed,
    Cancelled,
}

pub type TaskCompletion = Completion<TaskOutcome>;

/// Cooperative cancellation flag shared with the running worker.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {

    pub fn cancel(&self) {
        self.0.store(true, Ordering::Relaxed);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Relaxed)
    }

}

/// A dequeued task handed to a worker.
#[derive(Debug, Clone)]
pub struct Task {
    pub id: u64,
    pub key: TaskKey,
    pub class: TaskClass,
    pub token: CancelToken,
}


struct PendingTask {
    id: u64,
    class: TaskClass,
    seq: u64,
    generation: u64,
    running: bool,
    enqueued_at: Instant,
    completion: TaskCompletion,
    token: CancelToken,
}

/// Heap entries order by (priority, seq); upgrades push a fresh entry with
/// a bumped generation and the stale one is skipped at pop.
struct HeapEntry {
    priority: u8,
    seq: u64,
    generation: u64,
    key: TaskKey,
}

impl PartialEq for HeapEntry {
    fn eq(&self, other: &Self) -> bool {
        (self.priority, self.seq) == (other.priority, other.seq)
    }
}

impl Eq for HeapEntry {}

impl PartialOrd for HeapEntry {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

impl Ord for HeapEntry {
    fn cmp(&self, other: &Self) -> CmpOrdering {
        // BinaryHeap is a max-heap, invert so the lowest (priority, seq)
        // surfaces first.
        other.priority.cmp(&self.priority)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

struct QueueState {
    heap: BinaryHeap<HeapEntry>,
    pending: HashMap<TaskKey, PendingTask>,
    running: usize,
    class_running: [usize; 4],
    max_concurrent: usize,
    critical: bool,
    shutdown: bool,
    next_seq: u64,
    next_id: u64,
}

impl QueueState {

    /// Tasks queued and not yet running.
    fn queued(&self) -> usize {
        self.pending.len() - self.running
    }

}

#[derive(Debug, Default)]
struct QueueCounters {
    submitted: AtomicU64,
    deduped: AtomicU64,
    upgraded: AtomicU64,
    completed: AtomicU64,
    failed: AtomicU64,
    cancelled: AtomicU64,
    refused: AtomicU64,
}

/// Counter and depth snapshot of the queue.
#[derive(Debug, Clone, Copy, Default)]
pub struct QueueStats {
    pub queued: usize,
    pub running: usize,
    pub max_concurrent: usize,
    pub submitted: u64,
    pub deduped: u64,
    pub upgraded: u64,
    pub completed: u64,
    pub failed: u64,
    pub cancelled: u64,
    pub refused: u64,
}


pub struct ChunkQueue {
    state: Mutex<QueueState>,
    available: Condvar,
    idle: Condvar,
    prefetch_cap: usize,
    background_cap: usize,
    background_watermark: usize,
    counters: QueueCounters,
}

impl ChunkQueue {

    pub fn new(config: &QueueConfig) -> Arc<Self> {
        let max_concurrent = config.max_concurrent
            .unwrap_or_else(|| num_cpus::get().max(4))
            .max(1);
        Arc::new(Self {
            state: Mutex::new(QueueState {
                heap: BinaryHeap::new(),
                pending: HashMap::new(),
                running: 0,
                class_running: [0; 4],
                max_concurrent,
                critical: false,
                shutdown: false,
                next_seq: 0,
                next_id: 0,
            }),
            available: Condvar::new(),
            idle: Condvar::new(),
            prefetch_cap: config.prefetch_cap.max(1),
            background_cap: config.background_cap.max(1),
            background_watermark: config.background_watermark,
            counters: QueueCounters::default(),
        })
    }

    fn class_cap(&self, class: TaskClass) -> usize {
        match class {
            TaskClass::HyperViewPrefetch => self.prefetch_cap,
            TaskClass::BackgroundGeneration => self.background_cap,
            _ => usize::MAX,
        }
    }

    /// Submit chunk work. Two submissions for the same `(world, chunk)`
    /// share one completion handle; a higher-priority class submitted for a
    /// queued key promotes it. Refused submissions resolve immediately with
    /// [`TaskOutcome::Cancelled`].
    pub fn submit(&self, class: TaskClass, world: impl Into<ArcStr>, cx: i32, cz: i32) -> TaskCompletion {

        self.counters.submitted.fetch_add(1, Ordering::Relaxed);
        let key = TaskKey { world: world.into(), cx, cz };

        let mut state = self.state.lock().unwrap();

        if state.shutdown {
            self.counters.refused.fetch_add(1, Ordering::Relaxed);
            return Completion::resolved(TaskOutcome::Cancelled);
        }

        // Admission control under load.
        if state.critical && class == TaskClass::HyperViewPrefetch {
            self.counters.refused.fetch_add(1, Ordering::Relaxed);
            debug!("refusing prefetch of {}/{cx}/{cz} under critical health", key.world);
            return Completion::resolved(TaskOutcome::Cancelled);
        }
        if state.critical
            && class == TaskClass::BackgroundGeneration
            && state.queued() > self.background_watermark
        {
            self.counters.refused.fetch_add(1, Ordering::Relaxed);
            return Completion::resolved(TaskOutcome::Cancelled);
        }

        if let Some(pending) = state.pending.get_mut(&key) {
            self.counters.deduped.fetch_add(1, Ordering::Relaxed);
            let completion = pending.completion.clone();
            if !pending.running && class.priority() < pending.class.priority() {
                pending.class = class;
                pending.generation += 1;
                let entry = HeapEntry {
                    priority: class.priority(),
                    seq: pending.seq,
                    generation: pending.generation,
                    key: key.clone(),
                };
                state.heap.push(entry);
                self.counters.upgraded.fetch_add(1, Ordering::Relaxed);
                debug!("upgraded {}/{cx}/{cz} to {}", key.world, class.name());
                drop(state);
                self.available.notify_one();
            }
            return completion;
        }

        let completion: TaskCompletion = Completion::new();
        let id = state.next_id;
        state.next_id += 1;
        let seq = state.next_seq;
        state.next_seq += 1;

        state.pending.insert(key.clone(), PendingTask {
            id,
            class,
            seq,
            generation: 0,
            running: false,
            enqueued_at: Instant::now(),
            completion: completion.clone(),
            token: CancelToken::default(),
        });
        state.heap.push(HeapEntry { priority: class.priority(), seq, generation: 0, key });

        drop(state);
        self.available.notify_one();
        completion

    }

    /// Block until a task is runnable or the queue shuts down. Returns
    /// `None` on shutdown.
    pub fn next_task(&self) -> Option<Task> {
        let mut state = self.state.lock().unwrap();
        loop {
            if state.shutdown {
                return None;
            }
            if let Some(task) = Self::pop_runnable(self, &mut state) {
                return Some(task);
            }
            state = self.available.wait(state).unwrap();
        }
    }

    /// Non-blocking variant of [`next_task`] for tick-driven consumers.
    ///
    /// [`next_task`]: ChunkQueue::next_task
    pub fn try_next_task(&self) -> Option<Task> {
        let mut state = self.state.lock().unwrap();
        if state.shutdown {
            return None;
        }
        Self::pop_runnable(self, &mut state)
    }

    fn pop_runnable(&self, guard: &mut QueueState) -> Option<Task> {

        if guard.running >= guard.max_concurrent {
            return None;
        }

        let state = &mut *guard;
        let mut deferred = Vec::new();
        let mut picked = None;

        while let Some(entry) = state.heap.pop() {

            let Some(pending) = state.pending.get(&entry.key) else {
                // Task already cancelled or completed, stale entry.
                continue;
            };
            if pending.generation != entry.generation || pending.running {
                continue;
            }

            if pending.token.is_cancelled() {
                let pending = state.pending.remove(&entry.key).unwrap();
                pending.completion.complete(TaskOutcome::Cancelled);
                self.counters.cancelled.fetch_add(1, Ordering::Relaxed);
                continue;
            }

            if state.class_running[pending.class.index()] >= self.class_cap(pending.class) {
                deferred.push(entry);
                continue;
            }

            picked = Some(entry);
            break;

        }

        // Class-capped entries go back untouched.
        for entry in deferred {
            state.heap.push(entry);
        }

        let entry = picked?;
        let pending = state.pending.get_mut(&entry.key).unwrap();
        pending.running = true;
        let task = Task {
            id: pending.id,
            key: entry.key.clone(),
            class: pending.class,
            token: pending.token.clone(),
        };
        state.class_running[pending.class.index()] += 1;
        state.running += 1;
        Some(task)

    }

    /// Release a task's permit and dedup slot and resolve its completion.
    /// A cancelled task resolves with [`TaskOutcome::Cancelled`] regardless
    /// of `success`.
    pub fn complete_task(&self, task: &Task, success: bool) {

        let mut state = self.state.lock().unwrap();

        let matches = state.pending.get(&task.key).is_some_and(|p| p.id == task.id);
        if !matches {
            warn!("completion for unknown task {}/{}/{}", task.key.world, task.key.cx, task.key.cz);
            return;
        }

        let pending = state.pending.remove(&task.key).unwrap();
        state.running -= 1;
        state.class_running[pending.class.index()] -= 1;

        let outcome = if pending.token.is_cancelled() {
            TaskOutcome::Cancelled
        } else if success {
            TaskOutcome::Completed
        } else {
            TaskOutcome::Failed
        };

        match outcome {
            TaskOutcome::Completed => self.counters.completed.fetch_add(1, Ordering::Relaxed),
            TaskOutcome::Failed => self.counters.failed.fetch_add(1, Ordering::Relaxed),
            TaskOutcome::Cancelled => self.counters.cancelled.fetch_add(1, Ordering::Relaxed),
        };
        pending.completion.complete(outcome);

        if state.shutdown && state.running == 0 {
            self.idle.notify_all();
        }

        drop(state);
        self.available.notify_all();

    }

    /// Cancel a task by key. A queued task resolves immediately, a running
    /// task is flagged and resolves as cancelled when its worker reports
    /// back. Returns whether a task was found.
    pub fn cancel(&self, world: impl Into<ArcStr>, cx: i32, cz: i32) -> bool {

        let key = TaskKey { world: world.into(), cx, cz };
        let mut state = self.state.lock().unwrap();

        let Some(pending) = state.pending.get(&key) else {
            return false;
        };

        if pending.running {
            pending.token.cancel();
        } else {
            let pending = state.pending.remove(&key).unwrap();
            pending.completion.complete(TaskOutcome::Cancelled);
            self.counters.cancelled.fetch_add(1, Ordering::Relaxed);
        }
        true

    }

    /// Governor input: the global bound on running tasks.
    pub fn set_max_concurrent(&self, bound: usize) {
        let mut state = self.state.lock().unwrap();
        state.max_concurrent = bound.max(1);
        drop(state);
        self.available.notify_all();
    }

    /// Governor input: critical health refuses prefetch admissions.
    pub fn set_critical(&self, critical: bool) {
        self.state.lock().unwrap().critical = critical;
    }

    /// True when some queued task has waited past its class soft deadline.
    pub fn soft_deadline_exceeded(&self) -> bool {
        let state = self.state.lock().unwrap();
        let now = Instant::now();
        state.pending.values().any(|pending| {
            !pending.running
                && now.saturating_duration_since(pending.enqueued_at) > pending.class.soft_deadline()
        })
    }

    pub fn stats(&self) -> QueueStats {
        let state = self.state.lock().unwrap();
        QueueStats {
            queued: state.queued(),
            running: state.running,
            max_concurrent: state.max_concurrent,
            submitted: self.counters.submitted.load(Ordering::Relaxed),
            deduped: self.counters.deduped.load(Ordering::Relaxed),
            upgraded: self.counters.upgraded.load(Ordering::Relaxed),
            completed: self.counters.completed.load(Ordering::Relaxed),
            failed: self.counters.failed.load(Ordering::Relaxed),
            cancelled: self.counters.cancelled.load(Ordering::Relaxed),
            refused: self.counters.refused.load(Ordering::Relaxed),
        }
    }

    /// Cancel every queued task, then wait up to `grace` for running tasks
    /// to report back. Workers blocked in [`next_task`] return `None`.
    ///
    /// [`next_task`]: ChunkQueue::next_task
    pub fn shutdown(&self, grace: Duration) {

        let mut state = self.state.lock().unwrap();
        state.shutdown = true;

        let queued_keys = state.pending.iter()
            .filter(|(_, pending)| !pending.running)
            .map(|(key, _)| key.clone())
            .collect::<Vec<_>>();
        for key in queued_keys {
            let pending = state.pending.remove(&key).unwrap();
            pending.completion.complete(TaskOutcome::Cancelled);
            self.counters.cancelled.fetch_add(1, Ordering::Relaxed);
        }
        state.heap.clear();
        self.available.notify_all();

        let deadline = Instant::now() + grace;
        while state.running > 0 {
            let Some(remaining) = deadline.checked_duration_since(Instant::now()) else {
                warn!("queue shutdown grace expired with {} tasks still running", state.running);
                break;
            };
            let (guard, timeout) = self.idle.wait_timeout(state, remaining).unwrap();
            state = guard;
            if timeout.timed_out() && state.running > 0 {
                warn!("queue shutdown grace expired with {} tasks still running", state.running);
                break;
            }
        }

    }

}


#[cfg(test)]
mod tests {

    use super::*;

    fn queue(max_concurrent: usize) -> Arc<ChunkQueue> {
        ChunkQueue::new(&QueueConfig {
            max_concurrent: Some(max_concurrent),
            prefetch_cap: 1,
            background_cap: 2,
            background_watermark: 64,
        })
    }

    #[test]
    fn dedup_shares_completion() {
        let queue = queue(8);
        let first = queue.submit(TaskClass::PriorityLoad, "w", 3, 4);
        let second = queue.submit(TaskClass::PriorityLoad, "w", 3, 4);
        assert!(first.same_slot(&second));
        assert_eq!(queue.stats().deduped, 1);
        assert_eq!(queue.stats().queued, 1);

        let task = queue.try_next_task().unwrap();
        assert!(queue.try_next_task().is_none());
        queue.complete_task(&task, true);
        assert_eq!(first.wait(), TaskOutcome::Completed);
        assert_eq!(second.try_get(), Some(TaskOutcome::Completed));
    }

    #[test]
    fn priority_order_with_fifo_ties() {
        let queue = queue(8);
        queue.submit(TaskClass::HyperViewPrefetch, "w", 0, 0);
        queue.submit(TaskClass::BackgroundGeneration, "w", 1, 0);
        queue.submit(TaskClass::PriorityLoad, "w", 2, 0);
        queue.submit(TaskClass::PriorityLoad, "w", 3, 0);
        queue.submit(TaskClass::ParallelGeneration, "w", 4, 0);

        let order = std::iter::from_fn(|| queue.try_next_task())
            .map(|task| (task.class, task.key.cx))
            .collect::<Vec<_>>();
        assert_eq!(order, vec![
            (TaskClass::PriorityLoad, 2),
            (TaskClass::PriorityLoad, 3),
            (TaskClass::ParallelGeneration, 4),
            (TaskClass::BackgroundGeneration, 1),
            (TaskClass::HyperViewPrefetch, 0),
        ]);
    }

    #[test]
    fn class_upgrade_promotes_pending_task() {
        let queue = queue(8);
        let prefetch = queue.submit(TaskClass::HyperViewPrefetch, "w", 10, 10);
        queue.submit(TaskClass::BackgroundGeneration, "w", 11, 10);
        let load = queue.submit(TaskClass::PriorityLoad, "w", 10, 10);
        assert!(prefetch.same_slot(&load));
        assert_eq!(queue.stats().upgraded, 1);

        let task = queue.try_next_task().unwrap();
        assert_eq!(task.class, TaskClass::PriorityLoad);
        assert_eq!((task.key.cx, task.key.cz), (10, 10));
    }

    #[test]
    fn class_cap_defers_without_blocking_others() {
        let queue = queue(4);
        queue.submit(TaskClass::HyperViewPrefetch, "w", 0, 0);
        queue.submit(TaskClass::HyperViewPrefetch, "w", 1, 0);

        let first = queue.try_next_task().unwrap();
        assert_eq!(first.class, TaskClass::HyperViewPrefetch);
        // Prefetch cap is 1: the second prefetch is deferred despite free
        // global permits.
        assert!(queue.try_next_task().is_none());

        // A deferred prefetch does not block later lower-priority work.
        queue.submit(TaskClass::BackgroundGeneration, "w", 2, 0);
        let second = queue.try_next_task().unwrap();
        assert_eq!(second.class, TaskClass::BackgroundGeneration);

        queue.complete_task(&first, true);
        let third = queue.try_next_task().unwrap();
        assert_eq!(third.class, TaskClass::HyperViewPrefetch);
        assert_eq!((third.key.cx, third.key.cz), (1, 0));
    }

    #[test]
    fn global_bound_limits_running_tasks() {
        let queue = queue(2);
        for i in 0..3 {
            queue.submit(TaskClass::PriorityLoad, "w", i, 0);
        }
        let first = queue.try_next_task().unwrap();
        let _second = queue.try_next_task().unwrap();
        assert!(queue.try_next_task().is_none());
        queue.complete_task(&first, true);
        assert!(queue.try_next_task().is_some());
    }

    #[test]
    fn cancel_queued_task() {
        let queue = queue(4);
        let completion = queue.submit(TaskClass::ParallelGeneration, "w", 5, 5);
        assert!(queue.cancel("w", 5, 5));
        assert_eq!(completion.try_get(), Some(TaskOutcome::Cancelled));
        assert!(queue.try_next_task().is_none());
        assert!(!queue.cancel("w", 5, 5));
    }

    #[test]
    fn cancel_running_task_is_cooperative() {
        let queue = queue(4);
        let completion = queue.submit(TaskClass::PriorityLoad, "w", 6, 6);
        let task = queue.try_next_task().unwrap();
        assert!(queue.cancel("w", 6, 6));
        assert!(task.token.is_cancelled());
        assert!(completion.try_get().is_none());
        queue.complete_task(&task, true);
        assert_eq!(completion.try_get(), Some(TaskOutcome::Cancelled));
    }

    #[test]
    fn critical_health_refuses_prefetch() {
        let queue = queue(4);
        queue.set_critical(true);
        let completion = queue.submit(TaskClass::HyperViewPrefetch, "w", 0, 0);
        assert_eq!(completion.try_get(), Some(TaskOutcome::Cancelled));
        assert_eq!(queue.stats().refused, 1);
        // Priority loads are always admitted.
        let load = queue.submit(TaskClass::PriorityLoad, "w", 0, 0);
        assert!(load.try_get().is_none());
    }

    #[test]
    fn background_watermark_refusal_under_critical() {
        let queue = ChunkQueue::new(&QueueConfig {
            max_concurrent: Some(64),
            prefetch_cap: 1,
            background_cap: 2,
            background_watermark: 2,
        });
        for i in 0..3 {
            queue.submit(TaskClass::PriorityLoad, "w", i, 0);
        }

        // Over the watermark but healthy: still admitted.
        let admitted = queue.submit(TaskClass::BackgroundGeneration, "w", 8, 8);
        assert!(admitted.try_get().is_none());

        queue.set_critical(true);
        let refused = queue.submit(TaskClass::BackgroundGeneration, "w", 9, 9);
        assert_eq!(refused.try_get(), Some(TaskOutcome::Cancelled));
    }

    #[test]
    fn blocking_consumer_wakes_on_submit() {
        let queue = queue(4);
        let worker = {
            let queue = Arc::clone(&queue);
            std::thread::spawn(move || queue.next_task())
        };
        std::thread::sleep(Duration::from_millis(20));
        queue.submit(TaskClass::PriorityLoad, "w", 1, 2);
        let task = worker.join().unwrap().unwrap();
        assert_eq!((task.key.cx, task.key.cz), (1, 2));
    }

    #[test]
    fn shutdown_cancels_queued_and_unblocks_workers() {
        let queue = queue(4);
        let queued = queue.submit(TaskClass::BackgroundGeneration, "w", 1, 1);
        let running = queue.submit(TaskClass::PriorityLoad, "w", 2, 2);
        let task = queue.try_next_task().unwrap();

        let finisher = {
            let queue = Arc::clone(&queue);
            let task = task.clone();
            std::thread::spawn(move || {
                std::thread::sleep(Duration::from_millis(50));
                queue.complete_task(&task, true);
            })
        };

        queue.shutdown(Duration::from_secs(5));
        finisher.join().unwrap();

        assert_eq!(queued.try_get(), Some(TaskOutcome::Cancelled));
        assert_eq!(running.try_get(), Some(TaskOutcome::Completed));
        assert!(queue.next_task().is_none());
        let late = queue.submit(TaskClass::PriorityLoad, "w", 3, 3);
        assert_eq!(late.try_get(), Some(TaskOutcome::Cancelled));
    }

    #[test]
    fn failed_task_outcome() {
        let queue = queue(4);
        let completion = queue.submit(TaskClass::PriorityLoad, "w", 0, 1);
        let task = queue.try_next_task().unwrap();
        queue.complete_task(&task, false);
        assert_eq!(completion.try_get(), Some(TaskOutcome::Failed));
        assert_eq!(queue.stats().failed, 1);
    }

}
