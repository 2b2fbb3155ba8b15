//! Fixed-size pool of long-lived worker threads.
//!
//! Jobs go into one mutex-protected FIFO queue; workers sleep on a condition
//! variable until the queue is non-empty or the pool is stopping, pop one job,
//! and run it outside the lock. The `stopping` flag is only read and written
//! under the queue mutex, so a submission racing with [`WorkerPool::shutdown`]
//! is either queued before the flag flips (and then drained) or rejected with
//! [`EngineError::PoolStopped`].

use std::collections::VecDeque;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::mpsc::{Receiver, sync_channel};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};

use tracing::debug;

use crate::error::{EngineError, Result};

type Job = Box<dyn FnOnce() + Send + 'static>;

const THREADS_ENV: &str = "SMCPP_THREADS";

#[derive(Default)]
struct Queue {
    jobs: VecDeque<Job>,
    stopping: bool,
}

#[derive(Default)]
struct Shared {
    queue: Mutex<Queue>,
    available: Condvar,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, Queue> {
        // Jobs run outside the lock and panics are caught, so a poisoned
        // queue still holds consistent data.
        self.queue.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Worker count from `SMCPP_THREADS`, else detected parallelism; at least 1.
pub fn default_threads() -> usize {
    std::env::var(THREADS_ENV)
        .ok()
        .and_then(|s| s.trim().parse::<usize>().ok())
        .or_else(|| thread::available_parallelism().ok().map(|n| n.get()))
        .unwrap_or(1)
        .max(1)
}

pub struct WorkerPool {
    shared: Arc<Shared>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    size: usize,
}

impl WorkerPool {
    pub fn new(threads: usize) -> Result<Self> {
        let size = threads.max(1);
        let shared = Arc::new(Shared::default());
        let mut workers = Vec::with_capacity(size);
        for i in 0..size {
            let shared = Arc::clone(&shared);
            let handle = thread::Builder::new()
                .name(format!("smcpp-worker-{i}"))
                .spawn(move || worker_loop(&shared))?;
            workers.push(handle);
        }
        debug!(threads = size, "worker pool started");
        Ok(Self {
            shared,
            workers: Mutex::new(workers),
            size,
        })
    }

    pub fn with_default_threads() -> Result<Self> {
        Self::new(default_threads())
    }

    pub fn size(&self) -> usize {
        self.size
    }

    /// Queues `f`; arguments are bound by capturing them in the closure.
    pub fn enqueue<F, T>(&self, f: F) -> Result<TaskHandle<T>>
    where
        F: FnOnce() -> T + Send + 'static,
        T: Send + 'static,
    {
        let (tx, rx) = sync_channel(1);
        let job: Job = Box::new(move || {
            let outcome = catch_unwind(AssertUnwindSafe(f));
            // The handle may have been dropped; nobody is waiting then.
            let _ = tx.send(outcome);
        });
        {
            let mut queue = self.shared.lock();
            if queue.stopping {
                return Err(EngineError::PoolStopped);
            }
            queue.jobs.push_back(job);
        }
        self.shared.available.notify_one();
        Ok(TaskHandle { rx })
    }

    /// Stops accepting work, drains the queue and joins every worker.
    /// Calling it again is a no-op.
    pub fn shutdown(&self) {
        {
            let mut queue = self.shared.lock();
            queue.stopping = true;
        }
        self.shared.available.notify_all();
        let workers = {
            let mut guard = self.workers.lock().unwrap_or_else(PoisonError::into_inner);
            std::mem::take(&mut *guard)
        };
        if workers.is_empty() {
            return;
        }
        for worker in workers {
            let _ = worker.join();
        }
        debug!(threads = self.size, "worker pool stopped");
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn worker_loop(shared: &Shared) {
    loop {
        let job = {
            let mut queue = shared.lock();
            while queue.jobs.is_empty() && !queue.stopping {
                queue = shared
                    .available
                    .wait(queue)
                    .unwrap_or_else(PoisonError::into_inner);
            }
            match queue.jobs.pop_front() {
                Some(job) => job,
                None => return,
            }
        };
        job();
    }
}

/// Eventual result of a queued job.
pub struct TaskHandle<T> {
    rx: Receiver<thread::Result<T>>,
}

impl<T> TaskHandle<T> {
    /// Blocks until the job finished; a panic inside the job becomes
    /// [`EngineError::TaskPanicked`].
    pub fn wait(self) -> Result<T> {
        match self.rx.recv() {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(payload)) => Err(EngineError::TaskPanicked(panic_message(payload.as_ref()))),
            Err(_) => Err(EngineError::TaskLost),
        }
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}
