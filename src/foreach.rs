//! Parallel foreach over slices, iterators, and pipelines.
//!
//! Random-access sources split into contiguous index ranges of the
//! work-unit size, dispatched through the batched submission driver. Other
//! sources are buffered into work-unit-sized blocks on the driver thread;
//! to mutate elements of non-random-access storage in place, iterate `&mut`
//! references.
//!
//! Rust closures cannot break across a function boundary, so the break
//! surface of a parallel loop is the `try_` family: bodies return
//! [`ControlFlow`], and `Break` stops further submission and reports
//! [`Error::Break`]. Units that already started are allowed to complete,
//! and panics they raise are chained into the reported error.

use core::ops::ControlFlow;
use core::sync::atomic::Ordering;
use std::cell::UnsafeCell;
use std::collections::VecDeque;
use std::sync::Arc;

use crate::batch::{resolve_work_unit, run_batched};
use crate::error::{Error, Fault};
use crate::pipeline::{BlockSource, Blocks};
use crate::pool::{PoolInner, TaskPool};
use crate::task::{Header, DONE};
use crate::util::{FrameGuard, MutPtr};

/// Block size for iterator sources whose length is unknown.
const LOOSE_BLOCK: usize = 16;

// -----------------------------------------------------------------------------
// Slice foreach

fn slice_for_each<T, F>(
    pool: &Arc<PoolInner>,
    items: &mut [T],
    work_unit: Option<usize>,
    body: F,
) -> Result<(), Error>
where
    T: Send,
    F: Fn(usize, &mut T) -> ControlFlow<()> + Sync,
{
    let len = items.len();
    let work_unit = resolve_work_unit(work_unit, pool.size(), len)?;
    let base = MutPtr::new(items.as_mut_ptr());
    let unit = move |start: usize, end: usize| -> ControlFlow<()> {
        for index in start..end {
            // SAFETY: Work units cover disjoint index ranges, so every
            // element has exactly one borrower.
            let item = unsafe { &mut *base.get().add(index) };
            if let ControlFlow::Break(()) = body(index, item) {
                return ControlFlow::Break(());
            }
        }
        ControlFlow::Continue(())
    };
    finish(run_batched(pool, len, work_unit, &unit))
}

fn finish((broke, fault): (bool, Option<Fault>)) -> Result<(), Error> {
    match (broke, fault) {
        (true, chained) => Err(Error::Break { chained }),
        (false, Some(fault)) => Err(Error::WorkUnits(fault)),
        (false, None) => Ok(()),
    }
}

impl TaskPool {
    /// Runs `body` over every element of `items` in parallel. Elements are
    /// processed in work units of `work_unit` contiguous elements; when
    /// `None`, a size targeting about four units per executor is chosen.
    pub fn for_each<T, F>(
        &self,
        items: &mut [T],
        work_unit: Option<usize>,
        body: F,
    ) -> Result<(), Error>
    where
        T: Send,
        F: Fn(&mut T) + Sync,
    {
        slice_for_each(self.inner(), items, work_unit, |_, item| {
            body(item);
            ControlFlow::Continue(())
        })
    }

    /// Like [`TaskPool::for_each`], passing the element index to the body.
    pub fn for_each_indexed<T, F>(
        &self,
        items: &mut [T],
        work_unit: Option<usize>,
        body: F,
    ) -> Result<(), Error>
    where
        T: Send,
        F: Fn(usize, &mut T) + Sync,
    {
        slice_for_each(self.inner(), items, work_unit, |index, item| {
            body(index, item);
            ControlFlow::Continue(())
        })
    }

    /// Like [`TaskPool::for_each`], with a body that may request a break.
    /// A break stops further submission and the call reports
    /// [`Error::Break`] once the in-flight units have completed.
    pub fn try_for_each<T, F>(
        &self,
        items: &mut [T],
        work_unit: Option<usize>,
        body: F,
    ) -> Result<(), Error>
    where
        T: Send,
        F: Fn(&mut T) -> ControlFlow<()> + Sync,
    {
        slice_for_each(self.inner(), items, work_unit, |_, item| body(item))
    }

    /// Index-aware variant of [`TaskPool::try_for_each`].
    pub fn try_for_each_indexed<T, F>(
        &self,
        items: &mut [T],
        work_unit: Option<usize>,
        body: F,
    ) -> Result<(), Error>
    where
        T: Send,
        F: Fn(usize, &mut T) -> ControlFlow<()> + Sync,
    {
        slice_for_each(self.inner(), items, work_unit, body)
    }

    /// Runs `body` over every item of an arbitrary iterator. Items are
    /// buffered into work-unit-sized blocks on the calling thread and the
    /// blocks execute on the pool.
    pub fn for_each_iter<I, F>(
        &self,
        source: I,
        work_unit: Option<usize>,
        body: F,
    ) -> Result<(), Error>
    where
        I: Iterator,
        I::Item: Send,
        F: Fn(I::Item) + Sync,
    {
        let block = match work_unit {
            Some(0) => return Err(Error::Precondition("work-unit size must be non-zero")),
            Some(n) => n,
            None => match source.size_hint() {
                (lower, Some(upper)) if lower == upper => {
                    resolve_work_unit(None, self.size(), lower)?
                }
                _ => LOOSE_BLOCK,
            },
        };
        for_each_blocks(self.inner(), Blocks::new(source, block), &body)
    }

    /// Runs `body` over every element delivered by a pipeline. Ready
    /// buffers are taken from the pipeline by O(1) storage swap, and the
    /// pipeline's buffer size overrides the work-unit size.
    pub fn for_each_pipeline<S, F>(&self, source: S, body: F) -> Result<(), Error>
    where
        S: BlockSource,
        F: Fn(S::Item) + Sync,
    {
        for_each_blocks(self.inner(), source, &body)
    }
}

// -----------------------------------------------------------------------------
// Block-buffered foreach

/// A work unit holding an owned block of items.
#[repr(C)]
struct BlockUnit<T, F> {
    header: Header,
    items: UnsafeCell<VecDeque<T>>,
    body: *const F,
}

impl<T, F> BlockUnit<T, F>
where
    T: Send,
    F: Fn(T) + Sync,
{
    fn idle(body: *const F) -> BlockUnit<T, F> {
        let unit = BlockUnit {
            header: Header::new(run_block::<T, F>),
            items: UnsafeCell::new(VecDeque::new()),
            body,
        };
        unit.header.state.store(DONE, Ordering::Relaxed);
        unit
    }
}

fn block_ptr<T, F>(unit: &BlockUnit<T, F>) -> *mut Header {
    (unit as *const BlockUnit<T, F>).cast_mut().cast::<Header>()
}

/// # Safety
///
/// `header` must point at a live `BlockUnit<T, F>` whose body pointer is
/// valid, and the caller must have won the claim.
unsafe fn run_block<T, F>(header: *mut Header)
where
    F: Fn(T),
{
    let unit = header.cast::<BlockUnit<T, F>>();
    // SAFETY: The driver keeps the body alive until every unit is forced.
    let body = unsafe { &*(*unit).body };
    // SAFETY: The executor has exclusive payload access.
    let items = unsafe { &mut *(*unit).items.get() };
    let outcome = Fault::catch(|| {
        while let Some(item) = items.pop_front() {
            body(item);
        }
    });
    if let Err(fault) = outcome {
        // SAFETY: Shared access to the live record's header.
        unsafe { (*header).record_fault(fault) };
    }
}

fn for_each_blocks<S, F>(pool: &Arc<PoolInner>, mut source: S, body: &F) -> Result<(), Error>
where
    S: BlockSource,
    F: Fn(S::Item) + Sync,
{
    let block = source.block_size();

    if pool.size() == 0 {
        let outcome = Fault::catch(|| {
            let mut storage = VecDeque::new();
            loop {
                storage.clear();
                let more = source.fill_block(&mut storage, block);
                while let Some(item) = storage.pop_front() {
                    body(item);
                }
                if !more {
                    break;
                }
            }
        });
        return match outcome {
            Ok(()) => Ok(()),
            Err(fault) => Err(Error::WorkUnits(fault)),
        };
    }

    let n_slots = 2 * pool.size();
    let slots: Vec<BlockUnit<S::Item, F>> = (0..n_slots).map(|_| BlockUnit::idle(body)).collect();

    let mut more = true;
    let mut stopped = false;
    let mut producer_fault: Option<Fault> = None;
    let mut faults: Vec<Fault> = Vec::new();

    // Workers hold pointers into this frame until every unit is forced.
    let guard = FrameGuard::arm();

    while more && !stopped {
        let mut assigned = false;
        for slot in &slots {
            if slot.header.state.load(Ordering::Acquire) != DONE {
                continue;
            }
            if let Some(fault) = slot.header.take_fault() {
                faults.push(fault);
                stopped = true;
                break;
            }
            // SAFETY: A done, unqueued unit is exclusively the driver's.
            let storage = unsafe { &mut *slot.items.get() };
            storage.clear();
            match Fault::catch(|| source.fill_block(&mut *storage, block)) {
                Ok(still_more) => more = still_more,
                Err(fault) => {
                    producer_fault = Some(fault);
                    stopped = true;
                    break;
                }
            }
            if storage.is_empty() {
                if !more {
                    break;
                }
                continue;
            }
            // SAFETY: The unit outlives the driver scope.
            unsafe { pool.enqueue(block_ptr(slot)) };
            assigned = true;
            if !more {
                break;
            }
        }
        if !(more && !stopped) {
            break;
        }
        if !assigned {
            // The ring is full; sleep until some unit completes.
            pool.wait_until(|| {
                slots
                    .iter()
                    .any(|slot| slot.header.state.load(Ordering::Acquire) == DONE)
            });
        }
    }

    for slot in &slots {
        pool.work_force_done(block_ptr(slot));
    }
    guard.disarm();

    for slot in &slots {
        if let Some(fault) = slot.header.take_fault() {
            faults.push(fault);
        }
    }
    if let Some(fault) = producer_fault {
        fault.resume();
    }
    match Fault::chain(faults) {
        Some(fault) => Err(Error::WorkUnits(fault)),
        None => Ok(()),
    }
}

// -----------------------------------------------------------------------------
// Tests

#[cfg(test)]
mod tests {
    use core::sync::atomic::AtomicUsize;

    use super::*;

    #[test]
    fn mutates_every_element() {
        let pool = TaskPool::with_threads(3);
        let mut values: Vec<u64> = (0..500).collect();
        pool.for_each(&mut values, Some(13), |value| *value *= 2)
            .unwrap();
        assert!(values.iter().enumerate().all(|(i, &v)| v == 2 * i as u64));
    }

    #[test]
    fn indexed_bodies_see_their_index() {
        let pool = TaskPool::with_threads(2);
        let mut values = vec![0usize; 97];
        pool.for_each_indexed(&mut values, None, |index, value| *value = index)
            .unwrap();
        assert!(values.iter().enumerate().all(|(i, &v)| v == i));
    }

    #[test]
    fn empty_and_single_element_sources() {
        let pool = TaskPool::with_threads(2);
        let mut empty: [u32; 0] = [];
        pool.for_each(&mut empty, None, |_| unreachable!()).unwrap();
        let mut single = [5u32];
        pool.for_each(&mut single, None, |value| *value += 1).unwrap();
        assert_eq!(single, [6]);
    }

    #[test]
    fn break_reports_a_distinct_error() {
        let pool = TaskPool::with_threads(2);
        let mut values: Vec<u32> = (0..100).collect();
        let err = pool
            .try_for_each(&mut values, Some(10), |value| {
                if *value == 0 {
                    ControlFlow::Break(())
                } else {
                    ControlFlow::Continue(())
                }
            })
            .unwrap_err();
        assert!(matches!(err, Error::Break { .. }));
    }

    #[test]
    fn iterator_sources_are_buffered() {
        let pool = TaskPool::with_threads(2);
        let sum = AtomicUsize::new(0);
        pool.for_each_iter((0..1000).map(|x| x * 2), None, |item| {
            sum.fetch_add(item, Ordering::Relaxed);
        })
        .unwrap();
        assert_eq!(sum.load(Ordering::Relaxed), 999_000);
    }

    #[test]
    fn iterator_body_panic_is_aggregated() {
        let pool = TaskPool::with_threads(2);
        let err = pool
            .for_each_iter(0..100, Some(5), |item| {
                if item % 30 == 7 {
                    panic!("bad item");
                }
            })
            .unwrap_err();
        match err {
            Error::WorkUnits(fault) => {
                assert!(fault.iter().all(|f| f.message() == Some("bad item")));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn pipeline_blocks_are_swapped_through() {
        let pool = TaskPool::with_threads(2);
        let buffered = pool.async_buf(0..300usize, 32).unwrap();
        let sum = AtomicUsize::new(0);
        pool.for_each_pipeline(buffered, |item| {
            sum.fetch_add(item, Ordering::Relaxed);
        })
        .unwrap();
        assert_eq!(sum.load(Ordering::Relaxed), (0..300).sum::<usize>());
    }

    #[test]
    fn zero_worker_pool_runs_in_thread() {
        let pool = TaskPool::with_threads(0);
        let mut values = vec![1u32; 64];
        pool.for_each(&mut values, None, |value| *value += 1).unwrap();
        assert!(values.iter().all(|&v| v == 2));
        let count = AtomicUsize::new(0);
        pool.for_each_iter(0..10, None, |_| {
            count.fetch_add(1, Ordering::Relaxed);
        })
        .unwrap();
        assert_eq!(count.load(Ordering::Relaxed), 10);
    }
}
