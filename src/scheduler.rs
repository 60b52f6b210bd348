//! Process-wide worker pool and cooperative cancellation.
//!
//! The pool is built at most once per process. Conversions borrow it through
//! [`Scheduler::acquire`] and fall back to running on the calling thread when
//! threads are unavailable or pool construction failed.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use log::{debug, info, warn};
use rayon::prelude::*;
use rayon::{ThreadPool, ThreadPoolBuilder};

use crate::error::{CancelReason, ConversionError, PoolError, Result};
use crate::progress::ProgressReporter;

const MAX_THREADS: usize = 16;

enum PoolState {
    Idle,
    PoolRequested,
    PoolReady(Arc<ThreadPool>),
    PoolFailed(String),
}

static POOL: Mutex<PoolState> = Mutex::new(PoolState::Idle);

/// Observable pool lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PoolStatus {
    /// The target cannot spawn threads.
    NotSupported,
    /// Threads are available but no pool has been built yet.
    Supported,
    Initialized,
    Failed,
}

fn lock_state() -> MutexGuard<'static, PoolState> {
    POOL.lock().unwrap_or_else(PoisonError::into_inner)
}

pub fn threading_supported() -> bool {
    !cfg!(all(target_arch = "wasm32", not(target_feature = "atomics")))
}

/// Largest worker count the pool will use on this machine.
pub fn max_worker_threads() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
        .saturating_sub(1)
        .clamp(1, MAX_THREADS)
}

pub fn capped_thread_count(requested: usize) -> usize {
    requested.clamp(1, max_worker_threads())
}

/// Builds the shared pool. A second call after success fails with
/// `AlreadyInitialized`; a call after a failed build retries.
pub fn init_pool(thread_count: usize) -> std::result::Result<(), PoolError> {
    if !threading_supported() {
        return Err(PoolError::NotSupported);
    }
    let mut state = lock_state();
    if matches!(*state, PoolState::PoolReady(_) | PoolState::PoolRequested) {
        return Err(PoolError::AlreadyInitialized);
    }
    build_pool(&mut state, capped_thread_count(thread_count))
}

fn build_pool(state: &mut PoolState, threads: usize) -> std::result::Result<(), PoolError> {
    *state = PoolState::PoolRequested;
    match ThreadPoolBuilder::new()
        .num_threads(threads)
        .thread_name(|i| format!("trace2svg-worker-{i}"))
        .build()
    {
        Ok(pool) => {
            info!("Worker pool ready with {} threads", threads);
            *state = PoolState::PoolReady(Arc::new(pool));
            Ok(())
        }
        Err(e) => {
            warn!("Worker pool construction failed: {}", e);
            *state = PoolState::PoolFailed(e.to_string());
            Err(PoolError::Build(e.to_string()))
        }
    }
}

pub fn pool_status() -> PoolStatus {
    if !threading_supported() {
        return PoolStatus::NotSupported;
    }
    match *lock_state() {
        PoolState::Idle | PoolState::PoolRequested => PoolStatus::Supported,
        PoolState::PoolReady(_) => PoolStatus::Initialized,
        PoolState::PoolFailed(_) => PoolStatus::Failed,
    }
}

/// Cancellation flag plus an optional deadline, shared across workers.
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    flag: Arc<AtomicBool>,
    deadline: Option<Instant>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns a token sharing this flag whose deadline is `timeout` from now.
    pub fn with_timeout(&self, timeout: Duration) -> Self {
        let deadline = Instant::now() + timeout;
        Self {
            flag: Arc::clone(&self.flag),
            deadline: Some(match self.deadline {
                Some(existing) => existing.min(deadline),
                None => deadline,
            }),
        }
    }

    pub fn cancel(&self) {
        self.flag.store(true, Ordering::Relaxed);
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::Relaxed)
    }

    pub fn check(&self) -> Result<()> {
        if self.is_cancelled() {
            return Err(ConversionError::Cancelled {
                reason: CancelReason::Requested,
            });
        }
        if let Some(deadline) = self.deadline {
            if Instant::now() >= deadline {
                return Err(ConversionError::Cancelled {
                    reason: CancelReason::Timeout,
                });
            }
        }
        Ok(())
    }
}

/// Per-conversion handle on the worker pool.
#[derive(Clone, Default)]
pub struct Scheduler {
    pool: Option<Arc<ThreadPool>>,
}

impl Scheduler {
    /// Runs everything on the calling thread.
    pub fn sequential() -> Self {
        Self { pool: None }
    }

    /// Borrows the shared pool, building it lazily on first use.
    pub fn acquire(parallel: bool) -> Self {
        if !parallel || !threading_supported() {
            return Self::sequential();
        }
        let mut state = lock_state();
        if matches!(*state, PoolState::Idle) {
            // Failure is recorded in the state and handled below.
            let _ = build_pool(&mut state, max_worker_threads());
        }
        match &*state {
            PoolState::PoolReady(pool) => Self {
                pool: Some(Arc::clone(pool)),
            },
            PoolState::PoolFailed(reason) => {
                warn!("Running sequentially, worker pool unavailable: {}", reason);
                Self::sequential()
            }
            PoolState::Idle | PoolState::PoolRequested => Self::sequential(),
        }
    }

    pub fn threads(&self) -> usize {
        self.pool
            .as_ref()
            .map(|pool| pool.current_num_threads())
            .unwrap_or(1)
    }

    /// Maps `f` over the partitions and returns results in partition order.
    ///
    /// The token is checked before each partition starts. The first error
    /// (including cancellation) aborts the remaining work.
    pub(crate) fn run_partitions<T, R, F>(
        &self,
        partitions: Vec<T>,
        cancel: &CancelToken,
        progress: Option<(&ProgressReporter<'_>, u32, u32)>,
        f: F,
    ) -> Result<Vec<R>>
    where
        T: Send,
        R: Send,
        F: Fn(usize, T) -> Result<R> + Sync + Send,
    {
        let total = partitions.len();
        let completed = AtomicUsize::new(0);
        let task = |(index, partition): (usize, T)| -> Result<R> {
            cancel.check()?;
            let out = f(index, partition)?;
            let done = completed.fetch_add(1, Ordering::Relaxed) + 1;
            if let Some((reporter, pass, passes)) = progress {
                reporter.partition_done(pass, passes, done, total);
            }
            Ok(out)
        };

        match &self.pool {
            Some(pool) if total > 1 => {
                debug!(
                    "Running {} partitions on {} threads",
                    total,
                    pool.current_num_threads()
                );
                pool.install(|| partitions.into_par_iter().enumerate().map(task).collect())
            }
            _ => partitions.into_iter().enumerate().map(task).collect(),
        }
    }
}

/// Splits `0..len` into at most `parts` contiguous ranges of near-equal size.
pub fn split_range(len: usize, parts: usize) -> Vec<std::ops::Range<usize>> {
    let parts = parts.clamp(1, len.max(1));
    let base = len / parts;
    let extra = len % parts;
    let mut ranges = Vec::with_capacity(parts);
    let mut start = 0;
    for i in 0..parts {
        let size = base + usize::from(i < extra);
        ranges.push(start..start + size);
        start += size;
    }
    ranges
}
