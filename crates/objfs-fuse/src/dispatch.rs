//! Worker pool for filesystem callbacks.
//!
//! The FUSE session thread hands every callback to this pool and returns
//! immediately; the job owns the reply and answers the kernel when done.
//! Calls on different nodes therefore run in parallel, while calls on the
//! same node serialize on its mutex.
//!
//! A panicking job (a violated internal invariant) is logged at error level
//! and its reply is dropped, which fails the request with `EIO`. The worker
//! survives.

use crossbeam_channel::{Sender, bounded};
use std::io;
use std::panic::{self, AssertUnwindSafe};
use std::thread::{self, JoinHandle};
use tracing::{debug, error, info, warn};

/// Queued jobs per worker before submission blocks the session thread.
pub const QUEUE_DEPTH_PER_WORKER: usize = 64;

type Job = Box<dyn FnOnce() + Send + 'static>;

/// Fixed-size pool of named worker threads.
pub struct WorkerPool {
    submit_tx: Option<Sender<Job>>,
    workers: Vec<JoinHandle<()>>,
}

impl std::fmt::Debug for WorkerPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerPool")
            .field("workers", &self.workers.len())
            .field("running", &self.submit_tx.is_some())
            .finish()
    }
}

impl WorkerPool {
    /// Starts `threads` workers (at least one).
    pub fn new(threads: usize) -> io::Result<Self> {
        let threads = threads.max(1);
        let (submit_tx, submit_rx) = bounded::<Job>(threads * QUEUE_DEPTH_PER_WORKER);

        let mut workers = Vec::with_capacity(threads);
        for worker_id in 0..threads {
            let rx = submit_rx.clone();
            let handle = thread::Builder::new()
                .name(format!("objfs-worker-{worker_id}"))
                .spawn(move || {
                    debug!(worker_id, "Worker started");
                    for job in rx.iter() {
                        if panic::catch_unwind(AssertUnwindSafe(job)).is_err() {
                            error!(worker_id, "Filesystem callback panicked");
                        }
                    }
                    debug!(worker_id, "Worker exiting");
                })?;
            workers.push(handle);
        }

        info!(threads, "Worker pool started");
        Ok(Self {
            submit_tx: Some(submit_tx),
            workers,
        })
    }

    /// Queues `job`, blocking while the queue is full.
    ///
    /// After shutdown the job runs on the calling thread.
    pub fn spawn<F>(&self, job: F)
    where
        F: FnOnce() + Send + 'static,
    {
        let job: Job = Box::new(job);
        let rejected = match &self.submit_tx {
            Some(tx) => match tx.send(job) {
                Ok(()) => return,
                Err(e) => e.into_inner(),
            },
            None => job,
        };
        warn!("Worker pool is shut down, running callback inline");
        rejected();
    }

    pub fn threads(&self) -> usize {
        self.workers.len()
    }

    /// Stops accepting jobs, drains the queue and joins every worker.
    pub fn shutdown(&mut self) {
        if self.submit_tx.take().is_none() {
            return;
        }
        for handle in std::mem::take(&mut self.workers) {
            if handle.join().is_err() {
                warn!("Worker thread terminated abnormally");
            }
        }
        info!("Worker pool stopped");
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_runs_all_jobs_before_shutdown_returns() {
        let mut pool = WorkerPool::new(4).unwrap();
        let done = Arc::new(AtomicUsize::new(0));
        for _ in 0..100 {
            let done = Arc::clone(&done);
            pool.spawn(move || {
                done.fetch_add(1, Ordering::SeqCst);
            });
        }
        pool.shutdown();
        assert_eq!(done.load(Ordering::SeqCst), 100);
    }

    #[test]
    fn test_worker_survives_panic() {
        let mut pool = WorkerPool::new(1).unwrap();
        let done = Arc::new(AtomicUsize::new(0));
        pool.spawn(|| panic!("invariant violated"));
        let counter = Arc::clone(&done);
        pool.spawn(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        pool.shutdown();
        assert_eq!(done.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_spawn_after_shutdown_runs_inline() {
        let mut pool = WorkerPool::new(2).unwrap();
        pool.shutdown();
        let done = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&done);
        pool.spawn(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        assert_eq!(done.load(Ordering::SeqCst), 1);
        assert_eq!(pool.threads(), 0);
    }

    #[test]
    fn test_zero_threads_means_one() {
        let pool = WorkerPool::new(0).unwrap();
        assert_eq!(pool.threads(), 1);
    }
}
