//! A task-pool parallelism library for shared-memory multiprocessing.
//!
//! Taskforce runs work on a fixed set of worker threads backed by one
//! shared FIFO queue. The primitive is the future/promise pair: a [`Task`]
//! is submitted once and later *forced* to yield its result, and a thread
//! forcing a still-queued task steals it and runs it inline rather than
//! waiting. On top of that sit a small set of data-parallel operations
//! (parallel foreach, eager and pipelined map, reduce) and a worker-local
//! storage facility for per-worker accumulators.
//!
//! # Quick start
//!
//! ```
//! use taskforce::TaskPool;
//!
//! let pool = TaskPool::with_threads(4);
//!
//! // Eager parallel map.
//! let squares = pool.amap(&[1, 2, 3, 4, 5], None, |x| x * x).unwrap();
//! assert_eq!(squares, [1, 4, 9, 16, 25]);
//!
//! // Ordered parallel reduce; only associativity is required.
//! let total = pool.reduce(&squares, None, |a, b| a + b).unwrap();
//! assert_eq!(total, 55);
//! ```
//!
//! The process-wide [`global_pool`] is constructed lazily with
//! [`default_pool_threads`] workers and marked daemon, so it never blocks
//! process exit. The free functions [`for_each`], [`amap`], and [`reduce`]
//! are shorthands for the corresponding operations on it.

// -----------------------------------------------------------------------------
// Modules

mod amap;
mod batch;
mod error;
mod foreach;
mod pipeline;
mod pool;
mod queue;
mod reduce;
mod task;
mod util;
mod wls;

// -----------------------------------------------------------------------------
// Top-level exports

pub use error::Error;
pub use error::Fault;
pub use pipeline::AsyncBuf;
pub use pipeline::BlockSource;
pub use pipeline::Blocks;
pub use pipeline::LazyMap;
pub use pipeline::MapBlocks;
pub use pool::TaskPool;
pub use task::Task;
pub use wls::WlsRange;
pub use wls::WorkerLocal;

// -----------------------------------------------------------------------------
// Process-wide configuration

use core::sync::atomic::{AtomicUsize, Ordering};
use std::sync::OnceLock;
use std::thread::available_parallelism;

/// Sentinel meaning "derive the worker count from the machine".
const UNCONFIGURED: usize = usize::MAX;

static DEFAULT_POOL_THREADS: AtomicUsize = AtomicUsize::new(UNCONFIGURED);

static GLOBAL_POOL: OnceLock<TaskPool> = OnceLock::new();

/// The number of logical CPUs detected on this machine.
pub fn total_cpus() -> usize {
    available_parallelism().map(|n| n.get()).unwrap_or(1)
}

/// The worker count the global pool is (or will be) created with. Defaults
/// to `total_cpus() - 1`, leaving one core for the submitting thread.
pub fn default_pool_threads() -> usize {
    let configured = DEFAULT_POOL_THREADS.load(Ordering::Relaxed);
    if configured == UNCONFIGURED {
        total_cpus().saturating_sub(1)
    } else {
        configured
    }
}

/// Overrides [`default_pool_threads`]. Only observable to readers that have
/// not yet materialised the global pool; once [`global_pool`] has been
/// called, changing this has no effect on it.
pub fn set_default_pool_threads(n_workers: usize) {
    DEFAULT_POOL_THREADS.store(n_workers, Ordering::Relaxed);
}

/// The lazily-constructed process-wide pool. Its workers are daemon
/// threads: they do not keep the process alive and are reaped at exit.
pub fn global_pool() -> &'static TaskPool {
    GLOBAL_POOL.get_or_init(|| {
        let pool = TaskPool::with_threads(default_pool_threads());
        pool.set_daemon(true);
        pool
    })
}

// -----------------------------------------------------------------------------
// Global pool shorthands

/// Runs `body` over every element of `items` on the global pool.
///
/// See also: [`TaskPool::for_each`].
pub fn for_each<T, F>(items: &mut [T], work_unit: Option<usize>, body: F) -> Result<(), Error>
where
    T: Send,
    F: Fn(&mut T) + Sync,
{
    global_pool().for_each(items, work_unit, body)
}

/// Eagerly maps `f` over `items` on the global pool.
///
/// See also: [`TaskPool::amap`].
pub fn amap<T, R, F>(items: &[T], work_unit: Option<usize>, f: F) -> Result<Vec<R>, Error>
where
    T: Sync,
    R: Send,
    F: Fn(&T) -> R + Sync,
{
    global_pool().amap(items, work_unit, f)
}

/// Reduces `items` under an associative operator on the global pool.
///
/// See also: [`TaskPool::reduce`].
pub fn reduce<T, F>(items: &[T], work_unit: Option<usize>, op: F) -> Result<T, Error>
where
    T: Clone + Send + Sync,
    F: Fn(T, T) -> T + Sync,
{
    global_pool().reduce(items, work_unit, op)
}

// -----------------------------------------------------------------------------
// Tests

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cpu_detection_is_sane() {
        assert!(total_cpus() >= 1);
    }

    #[test]
    fn global_pool_is_daemon_and_stable() {
        let first = global_pool() as *const TaskPool;
        let second = global_pool() as *const TaskPool;
        assert_eq!(first, second);
        assert!(global_pool().is_daemon());
    }

    #[test]
    fn global_shorthands_use_the_global_pool() {
        let mut values = [1u32, 2, 3];
        for_each(&mut values, None, |v| *v += 1).unwrap();
        assert_eq!(values, [2, 3, 4]);
        let doubled = amap(&values, None, |v| v * 2).unwrap();
        assert_eq!(doubled, [4, 6, 8]);
        assert_eq!(reduce(&doubled, None, |a, b| a + b).unwrap(), 18);
    }
}
