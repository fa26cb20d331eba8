//! Worker-local storage: one padded accumulator slot per worker.
//!
//! Parallel loop bodies that accumulate into shared state would serialize
//! on that state (or race on it). Worker-local storage gives each worker
//! its own slot, keyed by the pool's worker index, with slot zero shared by
//! every thread outside the pool. Slots are cache-line padded so adjacent
//! workers never contend on the same line.
//!
//! After the parallel phase, [`WorkerLocal::to_range`] publishes the slots
//! as a read-only view; folding that view yields the combined result.

use core::cell::UnsafeCell;
use core::ops::Index;
use core::sync::atomic::{fence, AtomicBool, Ordering};
use std::sync::Arc;

use crossbeam_utils::CachePadded;

use crate::pool::{PoolInner, TaskPool};

/// Per-worker accumulator slots for one pool. Created by
/// [`TaskPool::worker_local`].
///
/// Using one instance from two distinct non-worker threads at the same time
/// is not supported: both would select the shared outside slot.
pub struct WorkerLocal<T> {
    pool: Arc<PoolInner>,
    slots: Box<[CachePadded<UnsafeCell<T>>]>,
    still_local: AtomicBool,
}

// SAFETY: Each worker index selects a distinct slot, so cross-thread access
// never aliases while the storage is live; publication is ordered by
// `to_range`'s fence.
unsafe impl<T: Send> Sync for WorkerLocal<T> {}

impl TaskPool {
    /// Allocates worker-local storage with `size + 1` slots (one per
    /// worker, plus the shared outside slot), each initialized by `init`.
    pub fn worker_local<T, F>(&self, mut init: F) -> WorkerLocal<T>
    where
        F: FnMut() -> T,
    {
        let slots: Vec<CachePadded<UnsafeCell<T>>> = (0..self.size() + 1)
            .map(|_| CachePadded::new(UnsafeCell::new(init())))
            .collect();
        WorkerLocal {
            pool: self.inner().clone(),
            slots: slots.into_boxed_slice(),
            still_local: AtomicBool::new(true),
        }
    }
}

impl<T> WorkerLocal<T> {
    /// The number of slots, always `pool.size() + 1`.
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        false
    }

    /// Runs `f` with exclusive access to the calling thread's slot.
    ///
    /// Must not be called once [`WorkerLocal::to_range`] has published the
    /// slots (checked in debug builds), and `f` must not re-enter `with` on
    /// the same storage.
    pub fn with<R, F>(&self, f: F) -> R
    where
        F: FnOnce(&mut T) -> R,
    {
        debug_assert!(
            self.still_local.load(Ordering::Relaxed),
            "worker-local storage used after to_range"
        );
        let slot = &self.slots[self.pool.worker_index()];
        // SAFETY: The worker index keys a distinct slot per worker thread,
        // non-worker threads share slot zero under the single-outside-user
        // contract, and `f` cannot re-enter per the method contract.
        f(unsafe { &mut *slot.get() })
    }

    /// Ends the accumulation phase: publishes every slot and returns a
    /// read-only view over all of them, outside slot first.
    pub fn to_range(&mut self) -> WlsRange<'_, T> {
        self.still_local.store(false, Ordering::Relaxed);
        fence(Ordering::SeqCst);
        WlsRange { slots: &self.slots }
    }
}

/// A read-only, random-access view over published worker-local slots.
pub struct WlsRange<'a, T> {
    slots: &'a [CachePadded<UnsafeCell<T>>],
}

impl<'a, T> WlsRange<'a, T> {
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        false
    }

    pub fn get(&self, index: usize) -> &'a T {
        // SAFETY: The storage is published and borrowed shared for 'a, so
        // no writers exist.
        unsafe { &*self.slots[index].get() }
    }

    pub fn iter(&self) -> impl Iterator<Item = &'a T> + 'a {
        let slots = self.slots;
        // SAFETY: As in `get`.
        slots.iter().map(|slot| unsafe { &*slot.get() })
    }
}

impl<T> Index<usize> for WlsRange<'_, T> {
    type Output = T;

    fn index(&self, index: usize) -> &T {
        self.get(index)
    }
}

// -----------------------------------------------------------------------------
// Tests

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn one_slot_per_worker_plus_outside() {
        let pool = TaskPool::with_threads(3);
        let mut storage = pool.worker_local(|| 0u32);
        assert_eq!(storage.len(), 4);
        assert_eq!(storage.to_range().len(), 4);
    }

    #[test]
    fn outside_thread_uses_slot_zero() {
        let pool = TaskPool::with_threads(2);
        let mut storage = pool.worker_local(|| 0u64);
        for i in 1..=10u64 {
            storage.with(|slot| *slot += i);
        }
        let range = storage.to_range();
        assert_eq!(*range.get(0), 55);
        assert_eq!(range.iter().copied().sum::<u64>(), 55);
    }

    #[test]
    fn zero_worker_pool_still_has_the_outside_slot() {
        let pool = TaskPool::with_threads(0);
        let mut storage = pool.worker_local(|| 1u8);
        storage.with(|slot| *slot += 1);
        assert_eq!(storage.to_range()[0], 2);
    }

    #[test]
    fn slots_do_not_share_cache_lines() {
        let pool = TaskPool::with_threads(1);
        let mut storage = pool.worker_local(|| 0u8);
        let range = storage.to_range();
        let first = range.get(0) as *const u8 as usize;
        let second = range.get(1) as *const u8 as usize;
        assert!(second.abs_diff(first) >= 64);
    }
}
