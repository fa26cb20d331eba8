//! The eager parallel map.
//!
//! `amap` evaluates a pure element-wise function over a random-access
//! source and writes the results into an output buffer of the same length.
//! Work units own disjoint index ranges, so result slots are written
//! without synchronization. Submission is batched through the shared
//! driver, and the whole map is forced before the call returns.

use core::mem::{ManuallyDrop, MaybeUninit};
use core::ops::ControlFlow;
use std::sync::{Arc, Mutex};

use crate::batch::{resolve_work_unit, run_batched};
use crate::error::Error;
use crate::pool::{PoolInner, TaskPool};
use crate::util::MutPtr;

// -----------------------------------------------------------------------------
// Progress tracking

/// Records how far a work unit got, so that a failed map can drop exactly
/// the results that were produced. Completed ranges accumulate as units are
/// re-assigned and when this guard unwinds.
struct Watermark<'a> {
    completed: &'a Mutex<Vec<(usize, usize)>>,
    start: usize,
    cur: usize,
}

impl Drop for Watermark<'_> {
    fn drop(&mut self) {
        if self.cur > self.start {
            self.completed.lock().unwrap().push((self.start, self.cur));
        }
    }
}

// -----------------------------------------------------------------------------
// Core

pub(crate) fn amap_core<T, R, F>(
    pool: &Arc<PoolInner>,
    items: &[T],
    work_unit: Option<usize>,
    f: &F,
) -> Result<Vec<R>, Error>
where
    T: Sync,
    R: Send,
    F: Fn(&T) -> R + Sync,
{
    let len = items.len();
    let work_unit = resolve_work_unit(work_unit, pool.size(), len)?;
    if len == 0 {
        return Ok(Vec::new());
    }

    let mut out: Vec<MaybeUninit<R>> = Vec::with_capacity(len);
    // SAFETY: MaybeUninit slots need no initialization.
    unsafe { out.set_len(len) };
    let out_ptr = MutPtr::new(out.as_mut_ptr());
    let completed: Mutex<Vec<(usize, usize)>> = Mutex::new(Vec::new());

    let unit = |start: usize, end: usize| -> ControlFlow<()> {
        let mut watermark = Watermark {
            completed: &completed,
            start,
            cur: start,
        };
        for index in start..end {
            let value = f(&items[index]);
            // SAFETY: Work units cover disjoint index ranges and each slot
            // is written exactly once.
            unsafe { out_ptr.get().add(index).write(MaybeUninit::new(value)) };
            watermark.cur = index + 1;
        }
        ControlFlow::Continue(())
    };

    let (broke, fault) = run_batched(pool, len, work_unit, &unit);
    debug_assert!(!broke);
    match fault {
        None => {
            // Submission covered the whole range and every unit completed,
            // so every slot is initialized.
            let mut out = ManuallyDrop::new(out);
            let ptr = out.as_mut_ptr().cast::<R>();
            let capacity = out.capacity();
            // SAFETY: Same allocation, every element initialized.
            Ok(unsafe { Vec::from_raw_parts(ptr, len, capacity) })
        }
        Some(fault) => {
            for (start, end) in completed.into_inner().unwrap() {
                for index in start..end {
                    // SAFETY: Recorded ranges were fully written, each
                    // exactly once, and are disjoint.
                    unsafe { out[index].assume_init_drop() };
                }
            }
            Err(Error::WorkUnits(fault))
        }
    }
}

pub(crate) fn amap_into_core<T, R, F>(
    pool: &Arc<PoolInner>,
    items: &[T],
    out: &mut [R],
    work_unit: Option<usize>,
    f: &F,
) -> Result<(), Error>
where
    T: Sync,
    R: Send,
    F: Fn(&T) -> R + Sync,
{
    if out.len() != items.len() {
        return Err(Error::Precondition(
            "output buffer length must match the input length",
        ));
    }
    let len = items.len();
    let work_unit = resolve_work_unit(work_unit, pool.size(), len)?;
    let out_ptr = MutPtr::new(out.as_mut_ptr());
    let unit = |start: usize, end: usize| -> ControlFlow<()> {
        for index in start..end {
            let value = f(&items[index]);
            // SAFETY: Disjoint ranges; the slot holds an initialized value
            // that is replaced (and dropped) in place.
            unsafe { *out_ptr.get().add(index) = value };
        }
        ControlFlow::Continue(())
    };
    let (broke, fault) = run_batched(pool, len, work_unit, &unit);
    debug_assert!(!broke);
    match fault {
        None => Ok(()),
        Some(fault) => Err(Error::WorkUnits(fault)),
    }
}

// -----------------------------------------------------------------------------
// Pool surface

impl TaskPool {
    /// Eagerly maps `f` over `items` in parallel, returning the results in
    /// source order. Equivalent to a serial map for pure `f`.
    pub fn amap<T, R, F>(&self, items: &[T], work_unit: Option<usize>, f: F) -> Result<Vec<R>, Error>
    where
        T: Sync,
        R: Send,
        F: Fn(&T) -> R + Sync,
    {
        amap_core(self.inner(), items, work_unit, &f)
    }

    /// Like [`TaskPool::amap`], writing results into a caller-provided
    /// buffer, which must have the same length as `items`.
    ///
    /// # Errors
    ///
    /// [`Error::Precondition`] when the buffer length differs from the
    /// input length.
    pub fn amap_into<T, R, F>(
        &self,
        items: &[T],
        out: &mut [R],
        work_unit: Option<usize>,
        f: F,
    ) -> Result<(), Error>
    where
        T: Sync,
        R: Send,
        F: Fn(&T) -> R + Sync,
    {
        amap_into_core(self.inner(), items, out, work_unit, &f)
    }
}

// -----------------------------------------------------------------------------
// Tests

#[cfg(test)]
mod tests {
    use core::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    #[test]
    fn matches_serial_map() {
        let pool = TaskPool::with_threads(3);
        let items: Vec<i64> = (0..2000).collect();
        let expected: Vec<i64> = items.iter().map(|x| x * x).collect();
        let mapped = pool.amap(&items, None, |x| x * x).unwrap();
        assert_eq!(mapped, expected);
    }

    #[test]
    fn explicit_buffer_is_filled_in_place() {
        let pool = TaskPool::with_threads(2);
        let items = [1, 2, 3, 4, 5];
        let mut out = [0; 5];
        pool.amap_into(&items, &mut out, Some(2), |x| x * 10).unwrap();
        assert_eq!(out, [10, 20, 30, 40, 50]);
    }

    #[test]
    fn wrong_buffer_length_is_a_precondition_fault() {
        let pool = TaskPool::with_threads(2);
        let items = [1, 2, 3, 4, 5];
        let mut out = [0; 4];
        assert!(matches!(
            pool.amap_into(&items, &mut out, None, |x| x * 10),
            Err(Error::Precondition(_))
        ));
    }

    #[test]
    fn zero_worker_pool_degrades_to_serial() {
        let pool = TaskPool::with_threads(0);
        let mapped = pool.amap(&[1, 2, 3], None, |x| x + 1).unwrap();
        assert_eq!(mapped, [2, 3, 4]);
    }

    #[test]
    fn empty_input_yields_empty_output() {
        let pool = TaskPool::with_threads(2);
        let empty: [u8; 0] = [];
        let mapped: Vec<u8> = pool.amap(&empty, None, |x| *x).unwrap();
        assert!(mapped.is_empty());
    }

    #[test]
    fn produced_results_are_dropped_on_failure() {
        static LIVE: AtomicUsize = AtomicUsize::new(0);

        #[derive(Debug)]
        struct Counted;
        impl Counted {
            fn new() -> Counted {
                LIVE.fetch_add(1, Ordering::Relaxed);
                Counted
            }
        }
        impl Drop for Counted {
            fn drop(&mut self) {
                LIVE.fetch_sub(1, Ordering::Relaxed);
            }
        }

        let pool = TaskPool::with_threads(2);
        let items: Vec<usize> = (0..100).collect();
        let err = pool
            .amap(&items, Some(5), |&i| {
                if i == 42 {
                    panic!("mapper failed");
                }
                Counted::new()
            })
            .unwrap_err();
        assert!(matches!(err, Error::WorkUnits(_)));
        assert_eq!(LIVE.load(Ordering::Relaxed), 0);
    }

    #[test]
    fn work_unit_larger_than_input() {
        let pool = TaskPool::with_threads(2);
        let mapped = pool.amap(&[1, 2, 3], Some(100), |x| x * 2).unwrap();
        assert_eq!(mapped, [2, 4, 6]);
    }
}
