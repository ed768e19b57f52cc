//! Worker pool for speculative decode jobs
//!
//! Uses work-stealing deques for priority-based execution:
//! - New tasks pushed to the global injector
//! - Workers steal old tasks from each other when idle
//! - Zero lock contention between workers
//!
//! Epoch mechanism allows cancelling stale requests when playback jumps.

use crossbeam::deque::{Injector, Worker};
use log::{trace, warn};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::thread;

type Job = Box<dyn FnOnce() + Send + 'static>;

/// Counters shared between the pool handle and its threads
#[derive(Default)]
struct Load {
    queued: AtomicUsize, // pushed, not yet picked up
    busy: AtomicUsize,   // currently running
}

impl Load {
    fn run(&self, job: Job) {
        self.queued.fetch_sub(1, Ordering::AcqRel);
        self.busy.fetch_add(1, Ordering::AcqRel);
        job();
        self.busy.fetch_sub(1, Ordering::AcqRel);
    }
}

/// Worker pool with work-stealing and epoch cancellation.
///
/// # Example
/// ```ignore
/// let workers = Workers::new(4, Arc::new(AtomicU64::new(0)));
/// let epoch = workers.current_epoch();
/// workers.execute_with_epoch(epoch, move || decode(position));
/// ```
pub struct Workers {
    injector: Arc<Injector<Job>>,         // Global queue for external tasks
    handles: Vec<thread::JoinHandle<()>>, // Thread handles for proper shutdown
    current_epoch: Arc<AtomicU64>,        // Epoch counter (shared with the owner)
    shutdown: Arc<AtomicBool>,            // Shutdown signal
    load: Arc<Load>,
}

impl Workers {
    /// Create worker pool with work-stealing deques and shared epoch counter.
    ///
    /// Threads that fail to spawn are logged and skipped; check
    /// [`Workers::thread_count`] for the effective size.
    pub fn new(num_threads: usize, epoch: Arc<AtomicU64>) -> Self {
        let injector: Arc<Injector<Job>> = Arc::new(Injector::new());
        let shutdown = Arc::new(AtomicBool::new(false));
        let load = Arc::new(Load::default());

        let mut workers_local: Vec<Worker<Job>> = Vec::new();
        let mut stealers = Vec::new();
        let mut handles = Vec::new();

        for _ in 0..num_threads {
            let worker: Worker<Job> = Worker::new_fifo();
            stealers.push(worker.stealer());
            workers_local.push(worker);
        }

        for (worker_id, worker) in workers_local.into_iter().enumerate() {
            let injector = Arc::clone(&injector);
            let shutdown = Arc::clone(&shutdown);
            let load = Arc::clone(&load);
            let stealers = stealers.clone();

            let spawned = thread::Builder::new()
                .name(format!("framefork-worker-{}", worker_id))
                .spawn(move || {
                    trace!("Worker {} started", worker_id);

                    loop {
                        // 1. Own queue
                        if let Some(job) = worker.pop() {
                            load.run(job);
                            continue;
                        }

                        // 2. Global injector
                        if let Some(job) = injector.steal().success() {
                            load.run(job);
                            continue;
                        }

                        // 3. Steal from siblings
                        let mut found_work = false;
                        for stealer in &stealers {
                            if let Some(job) = stealer.steal().success() {
                                load.run(job);
                                found_work = true;
                                break;
                            }
                        }

                        if found_work {
                            continue;
                        }

                        if shutdown.load(Ordering::Relaxed) {
                            break;
                        }

                        thread::sleep(std::time::Duration::from_millis(1));
                    }

                    trace!("Worker {} stopped", worker_id);
                });

            match spawned {
                Ok(handle) => handles.push(handle),
                Err(e) => warn!("Failed to spawn worker {}: {}", worker_id, e),
            }
        }

        trace!("Workers initialized: {} threads (work-stealing)", handles.len());

        Self {
            injector,
            handles,
            current_epoch: epoch,
            shutdown,
            load,
        }
    }

    /// Number of running threads
    pub fn thread_count(&self) -> usize {
        self.handles.len()
    }

    /// Threads with nothing running and nothing waiting for them
    pub fn idle(&self) -> usize {
        let taken = self.load.busy.load(Ordering::Acquire) + self.load.queued.load(Ordering::Acquire);
        self.handles.len().saturating_sub(taken)
    }

    /// Execute closure on a worker thread.
    pub fn execute<F>(&self, f: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.load.queued.fetch_add(1, Ordering::AcqRel);
        self.injector.push(Box::new(f));
    }

    /// Get current epoch
    pub fn current_epoch(&self) -> u64 {
        self.current_epoch.load(Ordering::Relaxed)
    }

    /// Invalidate every queued epoch-checked job, returns the new epoch
    pub fn bump_epoch(&self) -> u64 {
        self.current_epoch.fetch_add(1, Ordering::AcqRel) + 1
    }

    /// Execute closure with epoch check (for cancellable requests).
    ///
    /// The check happens when a worker picks the job up, so jobs queued before
    /// a [`Workers::bump_epoch`] are skipped.
    pub fn execute_with_epoch<F>(&self, epoch: u64, f: F)
    where
        F: FnOnce() + Send + 'static,
    {
        let current_epoch = Arc::clone(&self.current_epoch);

        let wrapped = move || {
            if current_epoch.load(Ordering::Relaxed) == epoch {
                f();
            } else {
                trace!("Skipping stale job (epoch {})", epoch);
            }
        };

        self.execute(wrapped);
    }
}

impl Drop for Workers {
    fn drop(&mut self) {
        use std::time::{Duration, Instant};

        let num_threads = self.handles.len();
        trace!("Workers shutting down ({} threads)...", num_threads);

        self.shutdown.store(true, Ordering::SeqCst);

        // 500ms total for all threads
        let deadline = Instant::now() + Duration::from_millis(500);

        let handles = std::mem::take(&mut self.handles);
        for handle in handles {
            while !handle.is_finished() {
                if Instant::now() >= deadline {
                    trace!("Shutdown timeout reached, exiting anyway");
                    return;
                }
                thread::sleep(Duration::from_millis(1));
            }
            let _ = handle.join();
        }

        trace!("All {} workers stopped gracefully", num_threads);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;
    use std::time::Duration;

    #[test]
    fn test_execute_runs_jobs() {
        let workers = Workers::new(2, Arc::new(AtomicU64::new(0)));
        let (tx, rx) = mpsc::channel();
        for i in 0..8 {
            let tx = tx.clone();
            workers.execute(move || {
                let _ = tx.send(i);
            });
        }
        let mut got: Vec<i32> = (0..8)
            .map(|_| rx.recv_timeout(Duration::from_secs(2)).unwrap())
            .collect();
        got.sort();
        assert_eq!(got, (0..8).collect::<Vec<_>>());
    }

    /// Test: Jobs queued under an old epoch are skipped
    #[test]
    fn test_stale_epoch_skipped() {
        let workers = Workers::new(1, Arc::new(AtomicU64::new(0)));
        let (tx, rx) = mpsc::channel();

        // Park the only worker so the next job stays queued
        let (release_tx, release_rx) = mpsc::channel::<()>();
        workers.execute(move || {
            let _ = release_rx.recv_timeout(Duration::from_secs(2));
        });

        let stale = workers.current_epoch();
        let stale_tx = tx.clone();
        workers.execute_with_epoch(stale, move || {
            let _ = stale_tx.send("stale");
        });
        let fresh = workers.bump_epoch();
        workers.execute_with_epoch(fresh, move || {
            let _ = tx.send("fresh");
        });
        release_tx.send(()).unwrap();

        assert_eq!(rx.recv_timeout(Duration::from_secs(2)).unwrap(), "fresh");
        assert!(rx.recv_timeout(Duration::from_millis(50)).is_err());
    }

    #[test]
    fn test_idle_tracks_load() {
        let workers = Workers::new(2, Arc::new(AtomicU64::new(0)));
        assert_eq!(workers.thread_count(), 2);
        assert_eq!(workers.idle(), 2);

        let (release_tx, release_rx) = mpsc::channel::<()>();
        workers.execute(move || {
            let _ = release_rx.recv_timeout(Duration::from_secs(2));
        });
        assert_eq!(workers.idle(), 1);
        release_tx.send(()).unwrap();

        let deadline = std::time::Instant::now() + Duration::from_secs(2);
        while workers.idle() != 2 && std::time::Instant::now() < deadline {
            thread::sleep(Duration::from_millis(1));
        }
        assert_eq!(workers.idle(), 2);
    }
}
