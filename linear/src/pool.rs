//! Named worker thread pools whose size can be changed at runtime. Growth
//! spawns threads immediately, shrinking happens by attrition: a worker
//! exits after finishing its current job when the pool is over target, so
//! no accepted job is ever dropped.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;

use crossbeam_channel::{unbounded, Receiver, Sender};
use tracing::debug;


type Job = Box<dyn FnOnce() + Send + 'static>;

/// Handle to a worker pool. Dropping the handle disconnects the job channel
/// and lets every worker exit once the queue drains.
pub struct WorkerPool {
    shared: Arc<PoolShared>,
    sender: Sender<Job>,
}

struct PoolShared {
    name: String,
    target: AtomicUsize,
    alive: AtomicUsize,
    receiver: Receiver<Job>,
}

impl WorkerPool {

    pub fn new(name: impl Into<String>, size: usize) -> Self {
        let (sender, receiver) = unbounded();
        let shared = Arc::new(PoolShared {
            name: name.into(),
            target: AtomicUsize::new(0),
            alive: AtomicUsize::new(0),
            receiver,
        });
        let pool = Self { shared, sender };
        pool.resize(size);
        pool
    }

    /// Queue a job. Jobs run in submission order per worker but the pool as
    /// a whole gives no ordering guarantee.
    pub fn execute(&self, job: impl FnOnce() + Send + 'static) {
        self.sender.send(Box::new(job))
            .expect("workers hold the receiver while this handle exists");
    }

    /// Change the worker count. At least one worker is always kept.
    pub fn resize(&self, target: usize) {

        let target = target.max(1);
        let previous = self.shared.target.swap(target, Ordering::Relaxed);
        if previous != target {
            debug!("{} pool target {previous} -> {target}", self.shared.name);
        }

        loop {
            let alive = self.shared.alive.load(Ordering::Relaxed);
            if alive >= target {
                break;
            }
            if self.shared.alive
                .compare_exchange(alive, alive + 1, Ordering::Relaxed, Ordering::Relaxed)
                .is_ok()
            {
                spawn_worker(Arc::clone(&self.shared));
            }
        }

    }

    /// Current worker count; over target while attrition is in progress.
    pub fn alive(&self) -> usize {
        self.shared.alive.load(Ordering::Relaxed)
    }

    pub fn target(&self) -> usize {
        self.shared.target.load(Ordering::Relaxed)
    }

    /// Number of jobs queued and not yet picked up.
    pub fn backlog(&self) -> usize {
        self.sender.len()
    }

}

fn spawn_worker(shared: Arc<PoolShared>) {
    let name = format!("{} Worker", shared.name);
    thread::Builder::new()
        .name(name)
        .spawn(move || {
            while let Ok(job) = shared.receiver.recv() {
                job();
                // Attrition check between jobs, never mid-job.
                let mut alive = shared.alive.load(Ordering::Relaxed);
                while alive > shared.target.load(Ordering::Relaxed) {
                    match shared.alive.compare_exchange(
                        alive, alive - 1,
                        Ordering::Relaxed, Ordering::Relaxed,
                    ) {
                        Ok(_) => return,
                        Err(current) => alive = current,
                    }
                }
            }
            shared.alive.fetch_sub(1, Ordering::Relaxed);
        })
        .expect("failed to spawn pool worker");
}
