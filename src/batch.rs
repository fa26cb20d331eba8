//! Batched lazy submission for the data-parallel operations.
//!
//! Splitting a length-L source into L/W tasks up front would cost O(L)
//! memory. Instead the driver keeps a ring of `2 * pool_size` work-unit
//! records and re-assigns each record to a fresh sub-range as soon as it
//! completes. After the first round of assignments the driver packages the
//! assignment scan itself as a *submitter task* that re-queues itself, so
//! any worker can keep the ring full while the driver thread is busy
//! executing stolen units. Memory stays O(pool_size) for any source length.
//!
//! On the first fault from any unit, submission stops; units already in
//! flight run to completion and every captured panic is chained into a
//! single [`Fault`].

use core::cell::UnsafeCell;
use core::mem;
use core::ops::ControlFlow;
use core::slice;
use core::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;

use tracing::trace;

use crate::error::{Error, Fault};
use crate::pool::PoolInner;
use crate::task::{Header, DONE};
use crate::util::FrameGuard;

// -----------------------------------------------------------------------------
// Work-unit sizing

/// Resolves the work-unit size for a source of length `len`. The default
/// aims for about four units per executor so that units stay coarse while
/// still balancing across the pool.
pub(crate) fn resolve_work_unit(
    requested: Option<usize>,
    pool_size: usize,
    len: usize,
) -> Result<usize, Error> {
    match requested {
        Some(0) => Err(Error::Precondition("work-unit size must be non-zero")),
        Some(n) => Ok(n),
        None => {
            let target_units = 4 * (pool_size + 1);
            Ok((len / target_units).max(1))
        }
    }
}

// -----------------------------------------------------------------------------
// Driver state

/// A work-unit body: executes the half-open index range it is given.
/// Returning `Break` stops further submission and is reported to the
/// caller; it is how a parallel loop body signals a break request.
pub(crate) type UnitBody<'a> = dyn Fn(usize, usize) -> ControlFlow<()> + Sync + 'a;

struct BatchCtx<'a> {
    len: usize,
    work_unit: usize,
    /// First index not yet assigned to a unit. Only the submitter advances
    /// this, and the task state machine allows one submitter run at a time.
    cursor: AtomicUsize,
    /// Set on the first fault or break; stops further assignment.
    stop: AtomicBool,
    broke: AtomicBool,
    done_submitting: AtomicBool,
    /// Faults collected from records that were re-assigned after failing.
    faults: Mutex<Vec<Fault>>,
    body: &'a UnitBody<'a>,
}

/// Strips the context lifetime so records can hold a thin pointer. Every
/// record is forced to completion before the context leaves scope.
fn erase<'a>(ctx: &BatchCtx<'a>) -> *const BatchCtx<'static> {
    (ctx as *const BatchCtx<'a>).cast()
}

// -----------------------------------------------------------------------------
// Work-unit records

#[repr(C)]
struct UnitTask {
    header: Header,
    /// The assigned sub-range. Written by the submitter while the record is
    /// done and unqueued, read by the executor after the queue hand-off.
    range: UnsafeCell<(usize, usize)>,
    ctx: *const BatchCtx<'static>,
}

impl UnitTask {
    /// A fresh record in the done state, ready to be assigned a range.
    fn idle(ctx: *const BatchCtx<'static>) -> UnitTask {
        let unit = UnitTask {
            header: Header::new(run_unit),
            range: UnsafeCell::new((0, 0)),
            ctx,
        };
        unit.header.state.store(DONE, Ordering::Relaxed);
        unit
    }
}

fn unit_ptr(unit: &UnitTask) -> *mut Header {
    (unit as *const UnitTask).cast_mut().cast::<Header>()
}

/// Executes one work unit.
///
/// # Safety
///
/// `header` must point at a `UnitTask` whose context is still alive, and
/// the caller must have won the claim on the record.
unsafe fn run_unit(header: *mut Header) {
    let unit = header.cast::<UnitTask>();
    // SAFETY: The submitter wrote the range before queuing the record, and
    // the queue hand-off ordered that write before this read.
    let (start, end) = unsafe { *(*unit).range.get() };
    // SAFETY: The driver keeps the context alive until every record is
    // forced.
    let ctx = unsafe { &*(*unit).ctx };
    match Fault::catch(|| (ctx.body)(start, end)) {
        Ok(ControlFlow::Continue(())) => {}
        Ok(ControlFlow::Break(())) => {
            ctx.broke.store(true, Ordering::Relaxed);
            ctx.stop.store(true, Ordering::Relaxed);
        }
        Err(fault) => {
            // SAFETY: Shared access to the live record's header.
            unsafe { (*header).record_fault(fault) };
            ctx.stop.store(true, Ordering::Relaxed);
        }
    }
}

// -----------------------------------------------------------------------------
// The submitter task

/// The self-resubmitting record that drives assignment rounds. Its body
/// runs [`submit_round`] and then either re-queues itself or, once
/// submission is finished, marks itself done.
#[repr(C)]
struct SubmitterTask {
    header: Header,
    ctx: *const BatchCtx<'static>,
    slots: *const UnitTask,
    n_slots: usize,
    pool: *const PoolInner,
}

/// # Safety
///
/// `header` must point at a `SubmitterTask` whose context, slots, and pool
/// are all still alive, and the caller must have won the claim.
unsafe fn run_submitter(header: *mut Header) {
    let this = header.cast::<SubmitterTask>();
    // SAFETY: The driver keeps everything the submitter points at alive
    // until it observes `done_submitting` and forces this record.
    let (pool, ctx, slots) = unsafe {
        let this = &*this;
        (
            &*this.pool,
            &*this.ctx,
            slice::from_raw_parts(this.slots, this.n_slots),
        )
    };
    submit_round(pool, ctx, slots);
    if ctx.done_submitting.load(Ordering::Acquire) {
        // No re-queue happened, so this executor is the only agent touching
        // the record and may complete it directly.
        //
        // SAFETY: As above.
        unsafe { (*header).state.store(DONE, Ordering::Release) };
    } else {
        // SAFETY: The record stays valid on the driver's frame, which
        // forces it before unwinding.
        unsafe { pool.enqueue(header) };
    }
}

/// One assignment scan over the ring: every done record is handed the next
/// contiguous sub-range and re-queued, until the source is exhausted or a
/// fault stops submission.
fn submit_round(pool: &PoolInner, ctx: &BatchCtx<'_>, slots: &[UnitTask]) {
    let mut assigned = 0;
    for slot in slots {
        if ctx.stop.load(Ordering::Relaxed) || ctx.cursor.load(Ordering::Relaxed) >= ctx.len {
            break;
        }
        if slot.header.state.load(Ordering::Acquire) != DONE {
            continue;
        }
        if let Some(fault) = slot.header.take_fault() {
            // The fault must leave the record before a later round may
            // overwrite it. Submission is already stopping.
            ctx.faults.lock().unwrap().push(fault);
            continue;
        }
        let start = ctx.cursor.load(Ordering::Relaxed);
        let end = ctx.len.min(start + ctx.work_unit);
        // SAFETY: A done, unqueued record has no executor; the submitter is
        // the only agent re-assigning it.
        unsafe { *slot.range.get() = (start, end) };
        ctx.cursor.store(end, Ordering::Relaxed);
        // SAFETY: The record outlives the driver scope.
        unsafe { pool.enqueue(unit_ptr(slot)) };
        assigned += 1;
    }
    if ctx.cursor.load(Ordering::Relaxed) >= ctx.len || ctx.stop.load(Ordering::Relaxed) {
        ctx.done_submitting.store(true, Ordering::Release);
    }
    if assigned > 0 {
        trace!(assigned, "submitted work units");
    }
}

// -----------------------------------------------------------------------------
// Driver entry point

/// Runs `body` over `[0, len)` split into `work_unit`-sized ranges on the
/// pool. Returns whether any unit requested a break, plus the chain of
/// panics captured from failed units.
pub(crate) fn run_batched(
    pool: &Arc<PoolInner>,
    len: usize,
    work_unit: usize,
    body: &UnitBody<'_>,
) -> (bool, Option<Fault>) {
    if len == 0 {
        return (false, None);
    }
    if pool.size() == 0 {
        return run_serial(body, len);
    }

    let ctx = BatchCtx {
        len,
        work_unit,
        cursor: AtomicUsize::new(0),
        stop: AtomicBool::new(false),
        broke: AtomicBool::new(false),
        done_submitting: AtomicBool::new(false),
        faults: Mutex::new(Vec::new()),
        body,
    };
    let n_slots = 2 * pool.size();
    let slots: Vec<UnitTask> = (0..n_slots).map(|_| UnitTask::idle(erase(&ctx))).collect();

    // From the first enqueue until every record is forced, an unwind from
    // this frame would leave workers holding pointers into it.
    let guard = FrameGuard::arm();

    submit_round(pool, &ctx, &slots);

    if !ctx.done_submitting.load(Ordering::Acquire) {
        let submitter = SubmitterTask {
            header: Header::new_resubmitting(run_submitter),
            ctx: erase(&ctx),
            slots: slots.as_ptr(),
            n_slots,
            pool: Arc::as_ptr(pool),
        };
        let submitter_ptr = (&submitter as *const SubmitterTask).cast_mut().cast::<Header>();
        // SAFETY: The submitter lives on this frame and is forced below.
        unsafe { pool.enqueue(submitter_ptr) };

        // Cooperate with the pool: execute whatever is still queued, the
        // submitter included, instead of idling while workers catch up.
        loop {
            let mut stole = false;
            for slot in &slots {
                stole |= pool.try_steal(unit_ptr(slot));
            }
            stole |= pool.try_steal(submitter_ptr);
            if ctx.done_submitting.load(Ordering::Acquire) {
                break;
            }
            if !stole {
                thread::yield_now();
            }
        }
        pool.force_done(submitter_ptr);
    }

    for slot in &slots {
        pool.work_force_done(unit_ptr(slot));
    }
    guard.disarm();

    let mut faults = mem::take(&mut *ctx.faults.lock().unwrap());
    for slot in &slots {
        if let Some(fault) = slot.header.take_fault() {
            faults.push(fault);
        }
    }
    (ctx.broke.load(Ordering::Relaxed), Fault::chain(faults))
}

/// In-thread evaluation for pools without workers.
fn run_serial(body: &UnitBody<'_>, len: usize) -> (bool, Option<Fault>) {
    match Fault::catch(|| body(0, len)) {
        Ok(ControlFlow::Continue(())) => (false, None),
        Ok(ControlFlow::Break(())) => (true, None),
        Err(fault) => (false, Some(fault)),
    }
}

// -----------------------------------------------------------------------------
// Tests

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::TaskPool;

    #[test]
    fn default_work_unit_targets_four_per_executor() {
        assert_eq!(resolve_work_unit(None, 3, 1600).unwrap(), 100);
        assert_eq!(resolve_work_unit(None, 0, 2).unwrap(), 1);
        assert_eq!(resolve_work_unit(None, 7, 0).unwrap(), 1);
        assert_eq!(resolve_work_unit(Some(9), 3, 1600).unwrap(), 9);
        assert!(matches!(
            resolve_work_unit(Some(0), 1, 10),
            Err(Error::Precondition(_))
        ));
    }

    #[test]
    fn every_index_is_visited_exactly_once() {
        let pool = TaskPool::with_threads(3);
        let len = 1000;
        let visits: Vec<AtomicUsize> = (0..len).map(|_| AtomicUsize::new(0)).collect();
        let body = |start: usize, end: usize| {
            for i in start..end {
                visits[i].fetch_add(1, Ordering::Relaxed);
            }
            ControlFlow::Continue(())
        };
        let (broke, fault) = run_batched(pool.inner(), len, 7, &body);
        assert!(!broke);
        assert!(fault.is_none());
        assert!(visits.iter().all(|v| v.load(Ordering::Relaxed) == 1));
    }

    #[test]
    fn faults_from_several_units_are_chained() {
        let pool = TaskPool::with_threads(2);
        let body = |start: usize, _end: usize| {
            if start == 0 || start == 9 {
                panic!("unit failed");
            }
            ControlFlow::Continue(())
        };
        // Work units of one element each: indices 0 and 9 both fail when
        // they run, and both may run because they can be queued before the
        // first fault stops submission.
        let (broke, fault) = run_batched(pool.inner(), 10, 1, &body);
        assert!(!broke);
        let fault = fault.expect("at least one captured panic");
        assert!(fault.len() >= 1);
        assert!(fault.iter().all(|f| f.message() == Some("unit failed")));
    }

    #[test]
    fn break_stops_submission() {
        let pool = TaskPool::with_threads(2);
        let body = |_start: usize, _end: usize| ControlFlow::Break(());
        let (broke, fault) = run_batched(pool.inner(), 100, 10, &body);
        assert!(broke);
        assert!(fault.is_none());
    }

    #[test]
    fn serial_fallback_covers_the_whole_range() {
        let pool = TaskPool::with_threads(0);
        let count = AtomicUsize::new(0);
        let body = |start: usize, end: usize| {
            count.fetch_add(end - start, Ordering::Relaxed);
            ControlFlow::Continue(())
        };
        let (broke, fault) = run_batched(pool.inner(), 55, 8, &body);
        assert!(!broke);
        assert!(fault.is_none());
        assert_eq!(count.load(Ordering::Relaxed), 55);
    }
}
