use rayon::prelude::*;
use rayon::{ThreadPool, ThreadPoolBuilder};

use crate::config::EngineConfig;
use crate::error::{Error, Result};

/// Bounded pool of OS threads shared by every fan-out point of the engine.
///
/// Each `run_batch` call blocks until all of its jobs have finished, so one
/// phase never overlaps the next.
pub struct WorkerPool {
    pool: ThreadPool,
}

impl WorkerPool {
    pub fn new(threads: usize) -> Result<Self> {
        let pool = ThreadPoolBuilder::new()
            .num_threads(threads.max(1))
            .thread_name(|i| format!("repatch-worker-{i}"))
            .build()
            .map_err(|e| Error::Config(format!("failed to build worker pool: {e}")))?;
        Ok(Self { pool })
    }

    pub fn from_config(config: &EngineConfig) -> Result<Self> {
        Self::new(config.worker_count())
    }

    pub fn threads(&self) -> usize {
        self.pool.current_num_threads()
    }

    /// Run `job` over every item and wait for the whole batch.
    /// Results come back in submission order.
    pub fn run_batch<T, R, F>(&self, items: Vec<T>, job: F) -> Vec<R>
    where
        T: Send,
        R: Send,
        F: Fn(T) -> R + Sync + Send,
    {
        self.pool
            .install(|| items.into_par_iter().map(job).collect())
    }

    /// Like `run_batch`, but each worker thread builds its state once with
    /// `init` (e.g. its own archive handle) and reuses it across jobs.
    pub fn run_batch_with<T, S, R, I, F>(&self, items: Vec<T>, init: I, job: F) -> Vec<R>
    where
        T: Send,
        R: Send,
        I: Fn() -> S + Sync + Send,
        F: Fn(&mut S, T) -> R + Sync + Send,
    {
        self.pool
            .install(|| items.into_par_iter().map_init(init, job).collect())
    }
}
