//! The task record and its forcing primitives.
//!
//! A task is a single unit of deferred work. Every task starts with a
//! [`Header`]: the state byte, the intrusive queue links, a type-erased run
//! thunk, and the slot for a panic captured from the body. The payload that
//! follows the header is known only to the run thunk, which lets the pool
//! queue and execute heterogeneous tasks without per-task allocations or
//! vtables. The public [`Task`] type pairs a header with a closure and a
//! result slot; the internal drivers (batched submission, pipelines) lay out
//! their own records on the same header.
//!
//! When using a header-based record, one must be extremely careful to ensure
//! that:
//! (a) The record does not outlive anything its payload closes over.
//! (b) The record's address is stable from submission until it is `Done`.
//! (c) The run thunk is invoked only by the executor that won the
//!     `NotStarted -> InProgress` transition.

use core::cell::UnsafeCell;
use core::hint;
use core::pin::Pin;
use core::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::{Arc, Mutex, OnceLock};
use std::thread;
use std::thread::JoinHandle;

use crate::error::Fault;
use crate::pool::PoolInner;
use crate::util::MutPtr;

// -----------------------------------------------------------------------------
// Task states

/// The task has been created or queued, but no executor has claimed it.
pub(crate) const NOT_STARTED: u8 = 0;

/// Exactly one executor (a worker or a stealing forcer) is running the body.
pub(crate) const IN_PROGRESS: u8 = 1;

/// The body has finished; the result or captured panic may be read.
pub(crate) const DONE: u8 = 2;

// -----------------------------------------------------------------------------
// Task header

/// Queue links. Read and written only while holding the owning pool's lock.
pub(crate) struct Links {
    pub prev: *mut Header,
    pub next: *mut Header,
    pub on_queue: bool,
}

/// Where a task was submitted, and therefore how it must be forced.
pub(crate) enum Home {
    /// Submitted to a pool queue; forcing may steal.
    Pool(Arc<PoolInner>),
    /// Running on a dedicated one-shot thread; forcing joins it.
    Thread(Arc<OneShot>),
}

/// The common prefix of every task record.
///
/// All mutation goes through interior mutability: the state byte is atomic,
/// the links are guarded by the pool lock, and the fault slot is guarded by
/// its own mutex so that concurrent forcers cannot race on the payload.
pub(crate) struct Header {
    pub(crate) state: AtomicU8,
    pub(crate) links: UnsafeCell<Links>,
    run: unsafe fn(*mut Header),
    /// When false, the executor leaves the state byte alone after the body
    /// returns; the body has re-queued or completed the task itself.
    pub(crate) set_done_on_completion: AtomicBool,
    fault: Mutex<Option<Fault>>,
    faulted: AtomicBool,
    home: OnceLock<Home>,
}

// SAFETY: The raw pointers in `links` are only touched under the pool lock,
// the state byte and flags are atomic, and the panic slot is behind a mutex.
unsafe impl Send for Header {}
// SAFETY: As above.
unsafe impl Sync for Header {}

impl Header {
    pub(crate) fn new(run: unsafe fn(*mut Header)) -> Header {
        Header {
            state: AtomicU8::new(NOT_STARTED),
            links: UnsafeCell::new(Links {
                prev: core::ptr::null_mut(),
                next: core::ptr::null_mut(),
                on_queue: false,
            }),
            run,
            set_done_on_completion: AtomicBool::new(true),
            fault: Mutex::new(None),
            faulted: AtomicBool::new(false),
            home: OnceLock::new(),
        }
    }

    /// Creates a header for a record that re-queues itself from inside its
    /// own body. The executor will not touch the state byte after the body
    /// returns; the body does so itself before completing.
    pub(crate) fn new_resubmitting(run: unsafe fn(*mut Header)) -> Header {
        let header = Header::new(run);
        header.set_done_on_completion.store(false, Ordering::Relaxed);
        header
    }

    /// Runs the payload.
    ///
    /// # Safety
    ///
    /// The caller must have won the `NotStarted -> InProgress` transition
    /// for this record and `this` must point at the full record the header
    /// belongs to.
    #[inline(always)]
    pub(crate) unsafe fn run(this: *mut Header) {
        // SAFETY: Per the caller's obligations.
        unsafe { ((*this).run)(this) };
    }

    #[inline(always)]
    pub(crate) fn is_done(&self) -> bool {
        self.state.load(Ordering::Acquire) == DONE
    }

    /// Stores a fault captured from the body. Called by run thunks only,
    /// while the record is `InProgress`.
    pub(crate) fn record_fault(&self, fault: Fault) {
        self.faulted.store(true, Ordering::Relaxed);
        *self.fault.lock().unwrap() = Some(fault);
    }

    /// Removes and returns the captured fault, if one is present.
    pub(crate) fn take_fault(&self) -> Option<Fault> {
        if self.faulted.load(Ordering::Relaxed) {
            self.fault.lock().unwrap().take()
        } else {
            None
        }
    }

    pub(crate) fn faulted(&self) -> bool {
        self.faulted.load(Ordering::Relaxed)
    }

    /// Re-raises the captured fault on the calling thread, if one was
    /// recorded. The original payload is consumed by the first rethrow;
    /// later calls panic with a plain message instead.
    pub(crate) fn rethrow_fault(&self) {
        if let Some(fault) = self.take_fault() {
            fault.resume();
        }
        if self.faulted() {
            panic!("task panicked");
        }
    }

    pub(crate) fn bind(&self, home: Home) -> Result<(), Home> {
        self.home.set(home)
    }

    pub(crate) fn home(&self) -> Option<&Home> {
        self.home.get()
    }
}

// -----------------------------------------------------------------------------
// One-shot execution

/// A degenerate pool of size one: a single task running on a freshly
/// spawned thread, with no queue and no stealing.
pub(crate) struct OneShot {
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl OneShot {
    /// Waits for the task thread to finish. Only the first caller performs
    /// the join; racing forcers fall back to polling the state byte.
    pub(crate) fn wait(&self) {
        let handle = self.handle.lock().unwrap().take();
        if let Some(handle) = handle {
            let _ = handle.join();
        }
    }
}

// -----------------------------------------------------------------------------
// Task

/// A single unit of deferred work: a closure, submitted to a pool (or to a
/// fresh thread) and later *forced* to yield its result.
///
/// Tasks are created with [`Task::new`], pinned in place (for example with
/// [`core::pin::pin!`]), and handed to [`TaskPool::submit`] or
/// [`Task::execute_in_new_thread`]. Once submitted, a task's storage address
/// is fixed until it is done; dropping a submitted task forces it to
/// completion first, so a task pinned to a stack frame never outlives its
/// borrowed data.
///
/// Mutations the body makes through captured references are published by the
/// completion of the task and are observable after any forcing call, not
/// earlier.
///
/// [`TaskPool::submit`]: crate::TaskPool::submit
#[repr(C)]
pub struct Task<F, R> {
    header: Header,
    f: UnsafeCell<Option<F>>,
    result: UnsafeCell<Option<R>>,
}

// SAFETY: Access to the payload slots is serialized by the state machine:
// the closure is consumed by the single executor, and the result is written
// before the `Done` store that forcers synchronize with.
unsafe impl<F: Send, R: Send> Send for Task<F, R> {}
// SAFETY: As above; concurrent forcers perform only shared reads after
// observing `Done`.
unsafe impl<F: Send, R: Send> Sync for Task<F, R> {}

/// Runs a [`Task`] payload, capturing any panic into the header.
///
/// # Safety
///
/// `this` must point at a `Task<F, R>` whose closure has not yet been taken.
unsafe fn execute_payload<F, R>(this: *mut Header)
where
    F: FnOnce() -> R,
{
    let task = this.cast::<Task<F, R>>();
    // SAFETY: The state machine guarantees a single executor, so we have
    // exclusive access to both payload slots for the duration of the run.
    let f = unsafe { (*(*task).f.get()).take() };
    let f = f.expect("task body executed twice");
    match Fault::catch(f) {
        // SAFETY: As above; the forcing thread will not read the result
        // slot until it observes the `Done` store.
        Ok(value) => unsafe { *(*task).result.get() = Some(value) },
        Err(fault) => {
            // SAFETY: Shared reference to the header of a live record.
            unsafe { (*task).header.record_fault(fault) };
        }
    }
}

impl<F, R> Task<F, R>
where
    F: FnOnce() -> R + Send,
    R: Send,
{
    /// Creates a new, unsubmitted task from a closure.
    pub fn new(f: F) -> Task<F, R> {
        Task {
            header: Header::new(execute_payload::<F, R>),
            f: UnsafeCell::new(Some(f)),
            result: UnsafeCell::new(None),
        }
    }

    pub(crate) fn header(&self) -> &Header {
        &self.header
    }

    pub(crate) fn header_ptr(&self) -> *mut Header {
        (self as *const Task<F, R>).cast_mut().cast::<Header>()
    }

    /// Returns true once the task has finished executing. If the body
    /// panicked, reading `done` re-raises that panic.
    pub fn done(&self) -> bool {
        if self.header.is_done() {
            self.header.rethrow_fault();
            true
        } else {
            false
        }
    }

    /// Forces the task by busy-waiting on its state byte.
    ///
    /// If the task is still queued it is stolen and executed inline on the
    /// calling thread; otherwise the thread spins until the executor
    /// finishes. Intended for very short tasks where sleeping costs more
    /// than it saves.
    ///
    /// # Panics
    ///
    /// Re-raises any panic captured from the body. Panics if the task was
    /// never submitted.
    pub fn spin_force(&self) -> &R {
        match self.submitted_home() {
            Home::Pool(pool) => {
                if !pool.try_steal(self.header_ptr()) {
                    while !self.header.is_done() {
                        hint::spin_loop();
                    }
                }
            }
            Home::Thread(one_shot) => self.join_one_shot(one_shot),
        }
        self.finished_result()
    }

    /// Forces the task, sleeping on the pool's completion condvar while it
    /// is running elsewhere.
    ///
    /// # Panics
    ///
    /// Re-raises any panic captured from the body. Panics if the task was
    /// never submitted.
    pub fn yield_force(&self) -> &R {
        match self.submitted_home() {
            Home::Pool(pool) => pool.force_done(self.header_ptr()),
            Home::Thread(one_shot) => self.join_one_shot(one_shot),
        }
        self.finished_result()
    }

    /// Forces the task, executing other queued tasks inline while waiting.
    ///
    /// This is the forcing mode to use when the waiting thread may itself be
    /// a pool worker: a thread blocked on child work keeps draining the
    /// queue instead of idling, so nested task graphs cannot starve the
    /// pool.
    ///
    /// # Panics
    ///
    /// Re-raises any panic captured from the body. Panics if the task was
    /// never submitted.
    pub fn work_force(&self) -> &R {
        match self.submitted_home() {
            Home::Pool(pool) => pool.work_force_done(self.header_ptr()),
            Home::Thread(one_shot) => self.join_one_shot(one_shot),
        }
        self.finished_result()
    }

    /// Executes the task on a freshly spawned thread instead of a pool.
    /// Forcing the task joins that thread.
    pub fn execute_in_new_thread(self: Pin<&Self>) {
        self.spawn_one_shot(None);
    }

    /// Like [`Task::execute_in_new_thread`], with an OS priority applied to
    /// the spawned thread before the body runs.
    pub fn execute_in_new_thread_with_priority(self: Pin<&Self>, priority: i32) {
        self.spawn_one_shot(Some(priority));
    }

    fn spawn_one_shot(self: Pin<&Self>, priority: Option<i32>) {
        let this = Pin::get_ref(self);
        let one_shot = Arc::new(OneShot {
            handle: Mutex::new(None),
        });
        if this.header.bind(Home::Thread(one_shot.clone())).is_err() {
            panic!("task already submitted");
        }
        let record = MutPtr::new(this.header_ptr());
        let handle = thread::Builder::new()
            .name("taskforce-task".into())
            .spawn(move || {
                if let Some(priority) = priority {
                    crate::pool::set_current_thread_priority(priority);
                }
                let header = record.get();
                // SAFETY: The task is pinned, so its storage cannot be
                // reused without its destructor running, and the destructor
                // waits for this thread. No other executor exists: the task
                // was never queued, and `bind` above rejects double
                // submission.
                unsafe {
                    (*header).state.store(IN_PROGRESS, Ordering::Relaxed);
                    Header::run(header);
                    (*header).state.store(DONE, Ordering::Release);
                }
            })
            .expect("failed to spawn task thread");
        *one_shot.handle.lock().unwrap() = Some(handle);
    }

    fn submitted_home(&self) -> &Home {
        self.header
            .home()
            .expect("forcing a task that was never submitted")
    }

    fn join_one_shot(&self, one_shot: &OneShot) {
        one_shot.wait();
        // A racing forcer may have taken the join handle before the spawner
        // stored it; fall back to polling until the thread body publishes
        // the terminal state.
        while !self.header.is_done() {
            thread::yield_now();
        }
    }

    fn finished_result(&self) -> &R {
        self.header.rethrow_fault();
        // SAFETY: The task is done and cannot run again, so the result slot
        // is never written after this point; shared reads are fine.
        let result = unsafe { (*self.result.get()).as_ref() };
        result.expect("task completed without a result")
    }
}

impl<F, R> Drop for Task<F, R> {
    fn drop(&mut self) {
        let header_ptr = (self as *mut Task<F, R>).cast::<Header>();
        let Some(home) = self.header.home() else {
            return;
        };
        if self.header.is_done() {
            return;
        }
        // A submitted task pinned to this stack frame must finish before
        // its storage is reclaimed. Panics stay captured in the header; a
        // destructor is no place to rethrow them.
        match home {
            Home::Pool(pool) => pool.force_done(header_ptr),
            Home::Thread(one_shot) => {
                one_shot.wait();
                while !self.header.is_done() {
                    thread::yield_now();
                }
            }
        }
    }
}
