//! Executor: abstraction for how jobs are run.
//!
//! The environment decides WHAT runs (one job per record); the executor
//! decides HOW: inline on the caller's thread or on a bounded worker pool.

use std::fmt;
use std::sync::{Arc, Condvar, Mutex, PoisonError};

/// A unit of work handed to an executor.
pub type Task = Box<dyn FnOnce() + Send + 'static>;

/// Errors raised when an executor cannot accept work.
#[derive(Debug, thiserror::Error)]
pub enum SubmitError {
    #[error("failed to build worker pool: {0}")]
    PoolBuild(String),

    #[error("task rejected: {0}")]
    Rejected(String),
}

/// Executor determines HOW submitted jobs run.
///
/// - `SimpleExecutor`: runs each task to completion on the submitting thread
/// - `PoolExecutor`: runs tasks on a fixed-size worker pool, blocking the
///   submitter while every worker is busy (requires `parallel` feature)
pub trait Executor: Send + Sync {
    /// Run `task`, now or later.
    ///
    /// Once this returns `Ok`, the task must eventually run.
    fn submit(&self, task: Task) -> Result<(), SubmitError>;

    /// Maximum number of tasks this executor runs at once.
    fn concurrency(&self) -> usize {
        1
    }
}

impl<E: Executor + ?Sized> Executor for Arc<E> {
    fn submit(&self, task: Task) -> Result<(), SubmitError> {
        (**self).submit(task)
    }

    fn concurrency(&self) -> usize {
        (**self).concurrency()
    }
}

/// Runs every task inline before `submit` returns.
#[derive(Debug, Clone, Default)]
pub struct SimpleExecutor;

impl SimpleExecutor {
    /// Create a new simple executor.
    pub fn new() -> Self {
        Self
    }
}

impl Executor for SimpleExecutor {
    fn submit(&self, task: Task) -> Result<(), SubmitError> {
        task();
        Ok(())
    }
}

// ============================================================================
// Slots
// ============================================================================

/// Counting permit set used for backpressure.
///
/// A permit is held for as long as a task is queued or running, and released
/// when the permit is dropped.
pub struct Slots {
    /// Maximum number of permits.
    limit: usize,
    /// Permits currently handed out.
    used: Mutex<usize>,
    cond: Condvar,
}

impl fmt::Debug for Slots {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Slots")
            .field("limit", &self.limit)
            .field("used", &self.used())
            .finish()
    }
}

impl Slots {
    /// Create a permit set with `limit` permits (at least one).
    pub fn new(limit: usize) -> Arc<Self> {
        Arc::new(Self {
            limit: limit.max(1),
            used: Mutex::new(0),
            cond: Condvar::new(),
        })
    }

    /// Take a permit if one is free.
    pub fn try_acquire(self: &Arc<Self>) -> Option<SlotPermit> {
        let mut used = self.used.lock().unwrap_or_else(PoisonError::into_inner);
        if *used >= self.limit {
            return None;
        }
        *used += 1;
        Some(SlotPermit {
            slots: Arc::clone(self),
        })
    }

    /// Block until a permit is free, then take it.
    pub fn acquire(self: &Arc<Self>) -> SlotPermit {
        let mut used = self.used.lock().unwrap_or_else(PoisonError::into_inner);
        while *used >= self.limit {
            used = self
                .cond
                .wait(used)
                .unwrap_or_else(PoisonError::into_inner);
        }
        *used += 1;
        SlotPermit {
            slots: Arc::clone(self),
        }
    }

    /// Number of permits currently held.
    pub fn used(&self) -> usize {
        *self.used.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Total number of permits.
    pub fn limit(&self) -> usize {
        self.limit
    }

    fn release(&self) {
        let mut used = self.used.lock().unwrap_or_else(PoisonError::into_inner);
        *used = used.saturating_sub(1);
        self.cond.notify_one();
    }
}

/// RAII guard for one slot. Releases the slot when dropped.
#[derive(Debug)]
pub struct SlotPermit {
    slots: Arc<Slots>,
}

impl Drop for SlotPermit {
    fn drop(&mut self) {
        self.slots.release();
    }
}

// ============================================================================
// Pool Executor (requires "parallel" feature)
// ============================================================================

/// Fixed-size worker pool.
///
/// Uses a dedicated rayon pool. `submit` takes a slot before spawning and
/// the worker releases it when the task finishes, so at most `threads` tasks
/// are queued or running and a saturated pool blocks the submitter.
#[cfg(feature = "parallel")]
pub struct PoolExecutor {
    pool: rayon::ThreadPool,
    slots: Arc<Slots>,
}

#[cfg(feature = "parallel")]
impl fmt::Debug for PoolExecutor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PoolExecutor")
            .field("threads", &self.pool.current_num_threads())
            .field("slots", &self.slots)
            .finish()
    }
}

#[cfg(feature = "parallel")]
impl PoolExecutor {
    /// Create a pool with `threads` workers (at least one).
    pub fn new(threads: usize) -> Result<Self, SubmitError> {
        let threads = threads.max(1);
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(threads)
            .thread_name(|i| format!("xylem-worker-{i}"))
            .build()
            .map_err(|e| SubmitError::PoolBuild(e.to_string()))?;

        Ok(Self {
            pool,
            slots: Slots::new(threads),
        })
    }

    /// Create a pool sized to the machine's available parallelism.
    pub fn with_available_parallelism() -> Result<Self, SubmitError> {
        Self::new(available_parallelism())
    }

    /// Number of tasks currently queued or running.
    pub fn in_flight(&self) -> usize {
        self.slots.used()
    }
}

#[cfg(feature = "parallel")]
impl Executor for PoolExecutor {
    fn submit(&self, task: Task) -> Result<(), SubmitError> {
        let permit = self.slots.acquire();
        self.pool.spawn(move || {
            let _permit = permit;
            task();
        });
        Ok(())
    }

    fn concurrency(&self) -> usize {
        self.slots.limit()
    }
}

/// Number of worker threads to use when none is configured.
#[cfg(feature = "parallel")]
pub(crate) fn available_parallelism() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
}
