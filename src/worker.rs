//! Worker pools and the writer's memory throttle.
//!
//! [`WorkerGroup`] is a bounded FIFO task queue over a fixed set of
//! threads.  `add_job` blocks once the queue limit is reached, which is
//! the backpressure mechanism throughout the writer: a segmenter stalls
//! in `add_chunkable` when all downstream compression slots are busy.
//!
//! [`MemoryThrottle`] is a process-wide credit counter.  Producers request
//! a credit sized by the compressor's memory estimate before queueing a
//! compression job and the credit is released when the buffer is handed
//! off (the guard drops).

use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;

use crossbeam_channel::{bounded, unbounded, Sender};

type Job = Box<dyn FnOnce() + Send + 'static>;

// ── Worker group ─────────────────────────────────────────────────────────────

struct GroupState {
    /// Jobs queued or running.
    pending: Mutex<usize>,
    idle:    Condvar,
}

pub struct WorkerGroup {
    tx:      Option<Sender<Job>>,
    threads: Vec<JoinHandle<()>>,
    state:   Arc<GroupState>,
}

impl WorkerGroup {
    /// `num_workers == 0` selects the number of CPUs.  `queue_limit`
    /// bounds the number of jobs waiting in the queue (not running);
    /// `0` means unbounded, for callers that must never block in
    /// `add_job`.
    pub fn new(name: &str, num_workers: usize, queue_limit: usize) -> Self {
        let num_workers = if num_workers == 0 { num_cpus::get() } else { num_workers };
        let (tx, rx) = if queue_limit == 0 { unbounded::<Job>() } else { bounded::<Job>(queue_limit) };
        let state = Arc::new(GroupState { pending: Mutex::new(0), idle: Condvar::new() });

        let threads = (0..num_workers)
            .map(|i| {
                let rx = rx.clone();
                let state = state.clone();
                std::thread::Builder::new()
                    .name(format!("{name}{i}"))
                    .spawn(move || {
                        while let Ok(job) = rx.recv() {
                            job();
                            let mut pending = state.pending.lock().unwrap();
                            *pending -= 1;
                            if *pending == 0 {
                                state.idle.notify_all();
                            }
                        }
                    })
                    .expect("failed to spawn worker thread")
            })
            .collect();

        WorkerGroup { tx: Some(tx), threads, state }
    }

    pub fn num_workers(&self) -> usize {
        self.threads.len()
    }

    /// Enqueue a job, blocking while the queue is full.  Returns `false`
    /// after [`WorkerGroup::stop`].
    pub fn add_job<F: FnOnce() + Send + 'static>(&self, job: F) -> bool {
        let Some(tx) = &self.tx else { return false };
        {
            let mut pending = self.state.pending.lock().unwrap();
            *pending += 1;
        }
        if tx.send(Box::new(job)).is_err() {
            let mut pending = self.state.pending.lock().unwrap();
            *pending -= 1;
            return false;
        }
        true
    }

    /// Block until every queued job has finished.
    pub fn wait(&self) {
        let mut pending = self.state.pending.lock().unwrap();
        while *pending > 0 {
            pending = self.state.idle.wait(pending).unwrap();
        }
    }

    /// Drain the queue and join all workers.
    pub fn stop(&mut self) {
        if let Some(tx) = self.tx.take() {
            drop(tx);
            for t in self.threads.drain(..) {
                let _ = t.join();
            }
        }
    }
}

impl Drop for WorkerGroup {
    fn drop(&mut self) {
        self.stop();
    }
}

// ── Memory throttle ──────────────────────────────────────────────────────────

struct ThrottleState {
    available: Mutex<u64>,
    released:  Condvar,
}

/// Credit-based limiter for compressor working sets.
#[derive(Clone)]
pub struct MemoryThrottle {
    state: Arc<ThrottleState>,
    total: u64,
}

/// An outstanding credit; returned to the throttle on drop.
pub struct MemoryCredit {
    state:  Arc<ThrottleState>,
    amount: u64,
}

impl MemoryThrottle {
    pub fn new(total: u64) -> Self {
        MemoryThrottle {
            state: Arc::new(ThrottleState {
                available: Mutex::new(total),
                released:  Condvar::new(),
            }),
            total,
        }
    }

    /// Acquire `amount` bytes of credit, blocking until enough is free.
    /// Requests larger than the total are clamped so they can't deadlock;
    /// they simply wait for exclusive use of the whole budget.
    pub fn request(&self, amount: u64) -> MemoryCredit {
        let amount = amount.min(self.total);
        let mut available = self.state.available.lock().unwrap();
        while *available < amount {
            available = self.state.released.wait(available).unwrap();
        }
        *available -= amount;
        MemoryCredit { state: self.state.clone(), amount }
    }
}

impl Drop for MemoryCredit {
    fn drop(&mut self) {
        let mut available = self.state.available.lock().unwrap();
        *available += self.amount;
        self.state.released.notify_all();
    }
}
