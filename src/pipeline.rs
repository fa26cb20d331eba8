//! Double-buffered pipelines: the asynchronous read-ahead buffer and the
//! lazy parallel map.
//!
//! A pipeline owns two buffers of the same size. One is handed to the
//! consumer; the other is refilled from the source by a single background
//! task on the pool. When the consumer drains its buffer it forces the
//! background task, swaps the buffers, and re-submits the empty one. The
//! consumer therefore blocks only when it outpaces production, and memory
//! stays at two buffers regardless of the source length.
//!
//! Pipelines compose: stacking [`TaskPool::map`] or [`TaskPool::async_buf`]
//! on top of another pipeline does not copy elements between layers. The
//! outer layer takes the inner layer's ready buffer by an O(1) storage swap
//! and adopts its buffer size. The seam for this is the [`BlockSource`]
//! trait, which the pipelines implement alongside [`Iterator`].

use core::cell::UnsafeCell;
use core::marker::PhantomData;
use core::mem;
use std::collections::VecDeque;
use std::sync::Arc;

use tracing::trace;

use crate::amap::amap_core;
use crate::error::{Error, Fault};
use crate::pool::{PoolInner, TaskPool};
use crate::task::Header;

// -----------------------------------------------------------------------------
// Block sources

/// A producer of elements delivered a block at a time.
///
/// `fill_block` appends up to `n` items to `out` and returns false once the
/// source is exhausted; a final partial fill may both deliver items and
/// report exhaustion. Callers pass `out` empty. A source with its own
/// internal buffering is free to replace `out`'s storage wholesale instead
/// of copying into it, and such sources report their preferred granularity
/// through `block_size`, which overrides whatever the caller would have
/// chosen.
pub trait BlockSource {
    type Item: Send;

    /// The preferred number of items per block.
    fn block_size(&self) -> usize;

    /// The exact number of items left, when the source knows it.
    fn remaining(&self) -> Option<usize>;

    /// Fills `out` with the next block. Returns false once exhausted.
    fn fill_block(&mut self, out: &mut VecDeque<Self::Item>, n: usize) -> bool;
}

/// Adapts any iterator into a [`BlockSource`] by buffering elements into
/// blocks on the calling thread.
pub struct Blocks<I> {
    iter: I,
    block: usize,
}

impl<I: Iterator> Blocks<I> {
    pub(crate) fn new(iter: I, block: usize) -> Blocks<I> {
        Blocks { iter, block }
    }
}

impl<I> BlockSource for Blocks<I>
where
    I: Iterator,
    I::Item: Send,
{
    type Item = I::Item;

    fn block_size(&self) -> usize {
        self.block
    }

    fn remaining(&self) -> Option<usize> {
        match self.iter.size_hint() {
            (lower, Some(upper)) if lower == upper => Some(lower),
            _ => None,
        }
    }

    fn fill_block(&mut self, out: &mut VecDeque<I::Item>, n: usize) -> bool {
        for _ in 0..n {
            match self.iter.next() {
                Some(item) => out.push_back(item),
                None => return false,
            }
        }
        true
    }
}

/// A [`BlockSource`] that maps each block of an inner source through a
/// function, eagerly and in parallel over the pool.
pub struct MapBlocks<S: BlockSource, F, R> {
    source: S,
    f: F,
    pool: Arc<PoolInner>,
    scratch: VecDeque<S::Item>,
    _result: PhantomData<fn() -> R>,
}

impl<S, F, R> BlockSource for MapBlocks<S, F, R>
where
    S: BlockSource,
    S::Item: Sync,
    F: Fn(&S::Item) -> R + Sync,
    R: Send,
{
    type Item = R;

    fn block_size(&self) -> usize {
        self.source.block_size()
    }

    fn remaining(&self) -> Option<usize> {
        self.source.remaining()
    }

    fn fill_block(&mut self, out: &mut VecDeque<R>, n: usize) -> bool {
        self.scratch.clear();
        let more = self.source.fill_block(&mut self.scratch, n);
        if !self.scratch.is_empty() {
            let inputs = self.scratch.make_contiguous();
            match amap_core(&self.pool, inputs, None, &self.f) {
                Ok(results) => out.extend(results),
                // Producer failures travel to the consumer as a captured
                // panic carrying the aggregate error.
                Err(error) => std::panic::panic_any(error),
            }
        }
        more
    }
}

// -----------------------------------------------------------------------------
// The double buffer

/// The record shared with the background fill task. Boxed so its address
/// survives moves of the owning pipeline.
#[repr(C)]
struct FillCell<S: BlockSource> {
    header: Header,
    pool: Arc<PoolInner>,
    state: UnsafeCell<FillState<S>>,
}

struct FillState<S: BlockSource> {
    source: S,
    back: VecDeque<S::Item>,
    block: usize,
    more: bool,
}

/// Refills the back buffer from the source.
///
/// # Safety
///
/// `header` must point at a live `FillCell<S>` and the consumer must not
/// touch the state while this record is in flight.
unsafe fn run_fill<S: BlockSource>(header: *mut Header) {
    let cell = header.cast::<FillCell<S>>();
    // SAFETY: The fill task has exclusive state access while in flight.
    let state = unsafe { &mut *(*cell).state.get() };
    let outcome = Fault::catch(|| {
        state.back.clear();
        state.more = state.source.fill_block(&mut state.back, state.block);
    });
    if let Err(fault) = outcome {
        // SAFETY: Shared access to the live record's header.
        unsafe { (*cell).header.record_fault(fault) };
    }
}

/// An asynchronous read-ahead buffer over a source, consumed as an
/// iterator: while the caller works through one buffer, a background task
/// on the pool produces the next.
///
/// Created by [`TaskPool::async_buf`], [`TaskPool::map`], and
/// [`TaskPool::map_pipeline`]. A panic raised by the producer (the source
/// or a map function) is re-raised at the consumer's next element read.
pub struct AsyncBuf<S: BlockSource> {
    cell: Box<FillCell<S>>,
    front: VecDeque<S::Item>,
    remaining: Option<usize>,
    in_flight: bool,
    done: bool,
    block: usize,
}

/// A lazily evaluated, pipelined parallel map: blocks of the source are
/// mapped via an eager parallel map in the background while the consumer
/// iterates the previous block's results.
pub type LazyMap<S, F, R> = AsyncBuf<MapBlocks<S, F, R>>;

impl<S> AsyncBuf<S>
where
    S: BlockSource + Send + 'static,
{
    pub(crate) fn new(pool: Arc<PoolInner>, mut source: S, block: usize) -> Result<AsyncBuf<S>, Error> {
        if block == 0 {
            return Err(Error::Precondition("buffer size must be non-zero"));
        }
        let remaining = source.remaining();
        // The first buffer is filled synchronously so the consumer can
        // start immediately; read-ahead begins with the second.
        let mut front = VecDeque::with_capacity(block);
        let more = source.fill_block(&mut front, block);
        let cell = Box::new(FillCell {
            header: Header::new(run_fill::<S>),
            pool,
            state: UnsafeCell::new(FillState {
                source,
                back: VecDeque::with_capacity(block),
                block,
                more,
            }),
        });
        let mut buf = AsyncBuf {
            cell,
            front,
            remaining,
            in_flight: false,
            done: false,
            block,
        };
        if more {
            buf.submit_fill();
        } else if buf.front.is_empty() {
            buf.done = true;
        }
        Ok(buf)
    }

    /// The pipeline's buffer size.
    pub fn block_size(&self) -> usize {
        self.block
    }

    /// The exact number of elements left, when the source reported one.
    pub fn len_remaining(&self) -> Option<usize> {
        self.remaining
    }

    fn submit_fill(&mut self) {
        trace!("submitting background buffer fill");
        // SAFETY: The cell is heap-allocated and this pipeline's destructor
        // forces any in-flight fill, so the record outlives its executor.
        unsafe { self.cell.pool.enqueue(self.header_ptr()) };
        self.in_flight = true;
    }

    /// Waits for the in-flight fill, surfacing any producer panic.
    fn finish_fill(&mut self) {
        self.cell.pool.force_done(self.header_ptr());
        self.in_flight = false;
        self.cell.header.rethrow_fault();
    }

    /// Makes the front buffer non-empty, or marks the pipeline done.
    fn ensure_front(&mut self) {
        loop {
            if !self.front.is_empty() || self.done {
                return;
            }
            if !self.in_flight {
                self.done = true;
                return;
            }
            self.finish_fill();
            trace!("swapping pipeline buffers");
            // SAFETY: No fill is in flight, so the state is exclusively
            // the consumer's.
            let state = unsafe { &mut *self.cell.state.get() };
            mem::swap(&mut self.front, &mut state.back);
            state.back.clear();
            let more = state.more;
            if more {
                self.submit_fill();
            } else if self.front.is_empty() {
                self.done = true;
            }
        }
    }
}

impl<S> Iterator for AsyncBuf<S>
where
    S: BlockSource + Send + 'static,
{
    type Item = S::Item;

    fn next(&mut self) -> Option<S::Item> {
        self.ensure_front();
        let item = self.front.pop_front();
        if item.is_some() {
            if let Some(remaining) = self.remaining.as_mut() {
                *remaining = remaining.saturating_sub(1);
            }
        }
        item
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        match self.remaining {
            Some(remaining) => (remaining, Some(remaining)),
            None => (0, None),
        }
    }
}

impl<S> BlockSource for AsyncBuf<S>
where
    S: BlockSource + Send + 'static,
{
    type Item = S::Item;

    fn block_size(&self) -> usize {
        self.block
    }

    fn remaining(&self) -> Option<usize> {
        self.remaining
    }

    fn fill_block(&mut self, out: &mut VecDeque<S::Item>, _n: usize) -> bool {
        self.ensure_front();
        if self.front.is_empty() {
            return false;
        }
        // Hand the ready buffer to the caller wholesale and adopt the
        // caller's empty storage as the next front.
        let block = mem::replace(&mut self.front, mem::take(out));
        *out = block;
        if let Some(remaining) = self.remaining.as_mut() {
            *remaining = remaining.saturating_sub(out.len());
        }
        true
    }
}

impl<S: BlockSource> AsyncBuf<S> {
    fn header_ptr(&self) -> *mut Header {
        (&*self.cell as *const FillCell<S>).cast_mut().cast::<Header>()
    }
}

impl<S: BlockSource> Drop for AsyncBuf<S> {
    fn drop(&mut self) {
        if self.in_flight {
            self.cell.pool.force_done(self.header_ptr());
            drop(self.cell.header.take_fault());
        }
    }
}

// -----------------------------------------------------------------------------
// Pool constructors

impl TaskPool {
    /// Wraps `source` in an asynchronous read-ahead buffer of `buffer`
    /// elements per block.
    ///
    /// # Errors
    ///
    /// [`Error::Precondition`] when `buffer` is zero.
    pub fn async_buf<I>(&self, source: I, buffer: usize) -> Result<AsyncBuf<Blocks<I>>, Error>
    where
        I: Iterator + Send + 'static,
        I::Item: Send + 'static,
    {
        AsyncBuf::new(self.inner().clone(), Blocks::new(source, buffer), buffer)
    }

    /// Lazily maps `f` over `source` with `buffer` elements per block. Each
    /// block is produced by an eager parallel map over the pool while the
    /// consumer iterates the previous one.
    ///
    /// # Errors
    ///
    /// [`Error::Precondition`] when `buffer` is zero.
    pub fn map<I, F, R>(&self, source: I, buffer: usize, f: F) -> Result<LazyMap<Blocks<I>, F, R>, Error>
    where
        I: Iterator + Send + 'static,
        I::Item: Send + Sync + 'static,
        F: Fn(&I::Item) -> R + Send + Sync + 'static,
        R: Send + 'static,
    {
        let mapped = MapBlocks {
            source: Blocks::new(source, buffer),
            f,
            pool: self.inner().clone(),
            scratch: VecDeque::new(),
            _result: PhantomData,
        };
        AsyncBuf::new(self.inner().clone(), mapped, buffer)
    }

    /// Stacks a lazy map on top of an existing pipeline without an
    /// intermediate copy: each ready block of the inner pipeline is taken
    /// by storage swap, and the new layer adopts the inner buffer size.
    pub fn map_pipeline<S, F, R>(&self, source: S, f: F) -> Result<LazyMap<S, F, R>, Error>
    where
        S: BlockSource + Send + 'static,
        S::Item: Send + Sync + 'static,
        F: Fn(&S::Item) -> R + Send + Sync + 'static,
        R: Send + 'static,
    {
        let block = source.block_size();
        let mapped = MapBlocks {
            source,
            f,
            pool: self.inner().clone(),
            scratch: VecDeque::new(),
            _result: PhantomData,
        };
        AsyncBuf::new(self.inner().clone(), mapped, block)
    }
}

// -----------------------------------------------------------------------------
// Tests

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn async_buf_preserves_order() {
        let pool = TaskPool::with_threads(2);
        let buffered = pool.async_buf(0..1000, 64).unwrap();
        let collected: Vec<_> = buffered.collect();
        let expected: Vec<_> = (0..1000).collect();
        assert_eq!(collected, expected);
    }

    #[test]
    fn async_buf_length_decrements() {
        let pool = TaskPool::with_threads(1);
        let mut buffered = pool.async_buf(0..10, 4).unwrap();
        assert_eq!(buffered.size_hint(), (10, Some(10)));
        buffered.next();
        buffered.next();
        assert_eq!(buffered.size_hint(), (8, Some(8)));
    }

    #[test]
    fn async_buf_rejects_zero_buffer() {
        let pool = TaskPool::with_threads(1);
        assert!(matches!(
            pool.async_buf(0..10, 0),
            Err(Error::Precondition(_))
        ));
    }

    #[test]
    fn map_applies_in_order() {
        let pool = TaskPool::with_threads(2);
        let mapped = pool.map(1..=6, 2, |x: &i32| x * 10).unwrap();
        let collected: Vec<_> = mapped.collect();
        assert_eq!(collected, [10, 20, 30, 40, 50, 60]);
    }

    #[test]
    fn map_on_zero_worker_pool_is_serial() {
        let pool = TaskPool::with_threads(0);
        let mapped = pool.map(0..5, 2, |x: &i32| x + 1).unwrap();
        let collected: Vec<_> = mapped.collect();
        assert_eq!(collected, [1, 2, 3, 4, 5]);
    }

    #[test]
    fn chained_map_adopts_inner_buffer_size() {
        let pool = TaskPool::with_threads(2);
        let inner = pool.async_buf(0..200, 64).unwrap();
        let outer = pool.map_pipeline(inner, |x: &i32| x * 2).unwrap();
        assert_eq!(outer.block_size(), 64);
        let collected: Vec<_> = outer.collect();
        let expected: Vec<_> = (0..200).map(|x| x * 2).collect();
        assert_eq!(collected, expected);
    }

    #[test]
    fn empty_source_is_immediately_done() {
        let pool = TaskPool::with_threads(1);
        let mut buffered = pool.async_buf(0..0, 8).unwrap();
        assert_eq!(buffered.next(), None);
        assert_eq!(buffered.next(), None);
    }

    #[test]
    fn producer_panic_surfaces_at_consumption() {
        use std::panic::{catch_unwind, AssertUnwindSafe};
        let pool = TaskPool::with_threads(1);
        let source = (0..100).map(|x| {
            if x == 50 {
                panic!("source failed");
            }
            x
        });
        let mut buffered = pool.async_buf(source, 10).unwrap();
        let outcome = catch_unwind(AssertUnwindSafe(|| {
            while buffered.next().is_some() {}
        }));
        assert!(outcome.is_err());
    }
}
