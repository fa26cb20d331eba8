//! This module contains the api and worker logic for the task pool.
//!
//! A [`TaskPool`] owns a fixed set of worker threads and one shared FIFO of
//! pending tasks. Workers pop from the head of the queue and execute; a
//! thread forcing a task may instead *steal* it, detaching it from the queue
//! under the pool lock and running it inline. One mutex guards the queue and
//! the pool status; task state bytes are atomic so `done` checks never take
//! the lock.

use core::cell::Cell;
use core::mem;
use core::pin::Pin;
use core::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread;
use std::thread::JoinHandle;

use tracing::{debug, trace};

use crate::error::Error;
use crate::queue::TaskList;
use crate::task::{Header, Home, Task, DONE, IN_PROGRESS, NOT_STARTED};

// -----------------------------------------------------------------------------
// Worker identity

/// Base indices for pool instances. Every pool claims a contiguous block,
/// one index per worker, so worker identity survives across pools.
static NEXT_BASE_INDEX: AtomicUsize = AtomicUsize::new(1);

thread_local! {
    /// The absolute worker index of this thread, or zero for any thread that
    /// is not a pool worker.
    static WORKER_INDEX: Cell<usize> = const { Cell::new(0) };
}

// -----------------------------------------------------------------------------
// Pool types

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
enum PoolStatus {
    /// Accepting and executing tasks.
    Running,
    /// No new submissions; workers drain the queue and then exit.
    Finishing,
    /// Workers exit at the next check, abandoning queued tasks. Abandoned
    /// tasks must be forced by their owners if the results matter.
    Stopped,
}

struct PoolShared {
    queue: TaskList,
    status: PoolStatus,
}

/// The shared half of a pool. Kept alive by the pool handle, its workers,
/// and every task bound to it, so forcing remains possible even after the
/// public handle is gone.
pub(crate) struct PoolInner {
    shared: Mutex<PoolShared>,
    /// Workers wait here when the queue is empty.
    work_ready: Condvar,
    /// Forcers wait here; broadcast on every task completion.
    task_done: Condvar,
    threads: Mutex<Vec<JoinHandle<()>>>,
    size: usize,
    base_index: usize,
    daemon: AtomicBool,
    priority: Mutex<Option<i32>>,
    #[cfg(target_os = "linux")]
    worker_tids: Mutex<Vec<libc::pid_t>>,
}

/// A fixed-size pool of worker threads sharing one FIFO task queue.
///
/// ```no_run
/// use std::pin::pin;
/// use taskforce::{Task, TaskPool};
///
/// let pool = TaskPool::with_threads(4);
///
/// // A future: submit now, force later.
/// let task = pin!(Task::new(|| expensive()));
/// pool.submit(task.as_ref()).unwrap();
/// let answer = *task.yield_force();
///
/// // Data parallelism over the same workers.
/// let squares = pool.amap(&[1, 2, 3, 4], None, |x| x * x).unwrap();
/// assert_eq!(squares, [1, 4, 9, 16]);
/// # fn expensive() -> u64 { 42 }
/// ```
///
/// Dropping a non-daemon pool finishes it and joins the workers. Daemon
/// pools (such as the global pool) leave their workers detached instead.
pub struct TaskPool {
    inner: Arc<PoolInner>,
}

// -----------------------------------------------------------------------------
// Pool creation and lifecycle

#[allow(clippy::new_without_default)]
impl TaskPool {
    /// Creates a pool with [`default_pool_threads`] workers.
    ///
    /// [`default_pool_threads`]: crate::default_pool_threads
    pub fn new() -> TaskPool {
        TaskPool::with_threads(crate::default_pool_threads())
    }

    /// Creates a pool with exactly `n_workers` worker threads.
    ///
    /// A pool of size zero is legal: submissions queue up and run inline on
    /// whichever thread forces them, and the data-parallel operations
    /// degrade to serial evaluation.
    pub fn with_threads(n_workers: usize) -> TaskPool {
        let base_index = NEXT_BASE_INDEX.fetch_add(n_workers.max(1), Ordering::Relaxed);
        let inner = Arc::new(PoolInner {
            shared: Mutex::new(PoolShared {
                queue: TaskList::new(),
                status: PoolStatus::Running,
            }),
            work_ready: Condvar::new(),
            task_done: Condvar::new(),
            threads: Mutex::new(Vec::new()),
            size: n_workers,
            base_index,
            daemon: AtomicBool::new(false),
            priority: Mutex::new(None),
            #[cfg(target_os = "linux")]
            worker_tids: Mutex::new(Vec::new()),
        });

        debug!(workers = n_workers, "starting task pool");

        let mut handles = Vec::with_capacity(n_workers);
        for slot in 0..n_workers {
            let worker_inner = inner.clone();
            let handle = thread::Builder::new()
                .name(format!("taskforce-worker-{slot}"))
                .spawn(move || worker_loop(worker_inner, slot))
                .expect("failed to spawn worker thread");
            handles.push(handle);
        }
        *inner.threads.lock().unwrap() = handles;

        TaskPool { inner }
    }

    /// The number of worker threads in this pool.
    pub fn size(&self) -> usize {
        self.inner.size
    }

    /// Marks the pool as finishing: no new submissions are accepted, the
    /// workers drain the queue and then exit. Idempotent.
    pub fn finish(&self) {
        let mut shared = self.inner.shared.lock().unwrap();
        if shared.status == PoolStatus::Running {
            shared.status = PoolStatus::Finishing;
        }
        let queued = shared.queue.len();
        drop(shared);
        self.inner.work_ready.notify_all();
        debug!(queued, "pool finishing");
    }

    /// Stops the pool: workers exit at the next check and queued tasks are
    /// abandoned. An abandoned task can still be forced by its owner, which
    /// steals and runs it inline. Idempotent.
    pub fn stop(&self) {
        let mut shared = self.inner.shared.lock().unwrap();
        shared.status = PoolStatus::Stopped;
        let abandoned = shared.queue.len();
        drop(shared);
        self.inner.work_ready.notify_all();
        self.inner.task_done.notify_all();
        debug!(abandoned, "pool stopped");
    }

    /// Whether this pool's workers are left detached when the pool handle
    /// is dropped.
    pub fn is_daemon(&self) -> bool {
        self.inner.daemon.load(Ordering::Relaxed)
    }

    /// Sets the daemon flag. Non-daemon pools (the default for explicitly
    /// constructed pools) finish and join their workers on drop; daemon
    /// pools leave them for process exit to reap.
    pub fn set_daemon(&self, daemon: bool) {
        self.inner.daemon.store(daemon, Ordering::Relaxed);
    }

    /// The OS priority applied to this pool's workers, if one was set.
    pub fn priority(&self) -> Option<i32> {
        *self.inner.priority.lock().unwrap()
    }

    /// Applies an OS priority (niceness on Linux) to the pool's worker
    /// threads. A rejection by the OS is logged and otherwise ignored.
    pub fn set_priority(&self, priority: i32) {
        *self.inner.priority.lock().unwrap() = Some(priority);
        self.inner.apply_priority_to_workers(priority);
    }

    /// The index this pool assigns to the calling thread: a stable value in
    /// `1..=size` for the pool's own workers, and `0` for every other
    /// thread.
    pub fn worker_index(&self) -> usize {
        self.inner.worker_index()
    }

    pub(crate) fn inner(&self) -> &Arc<PoolInner> {
        &self.inner
    }
}

// -----------------------------------------------------------------------------
// Submission

impl TaskPool {
    /// Submits a task to the pool's queue.
    ///
    /// The task must be pinned: its address is the queue node, and it must
    /// stay put until the task is done. Dropping a submitted task forces it
    /// to completion first, so data borrowed by the body cannot be freed
    /// while a worker still needs it.
    ///
    /// # Errors
    ///
    /// [`Error::Terminated`] if the pool is finishing or stopped;
    /// [`Error::Precondition`] if the task was already submitted.
    pub fn submit<F, R>(&self, task: Pin<&Task<F, R>>) -> Result<(), Error>
    where
        F: FnOnce() -> R + Send,
        R: Send,
    {
        let task = Pin::get_ref(task);
        let mut shared = self.inner.shared.lock().unwrap();
        if shared.status != PoolStatus::Running {
            return Err(Error::Terminated);
        }
        if task
            .header()
            .bind(Home::Pool(self.inner.clone()))
            .is_err()
        {
            return Err(Error::Precondition("task already submitted"));
        }
        // SAFETY: The task is pinned and its destructor forces completion,
        // so the record outlives its time on the queue. Binding the home
        // above rejects double submission, and the record starts out in the
        // not-started state.
        unsafe { shared.queue.push_back(task.header_ptr()) };
        drop(shared);
        self.inner.work_ready.notify_one();
        trace!("task submitted");
        Ok(())
    }
}

// -----------------------------------------------------------------------------
// Scheduling primitives

impl PoolInner {
    pub(crate) fn size(&self) -> usize {
        self.size
    }

    pub(crate) fn worker_index(&self) -> usize {
        let absolute = WORKER_INDEX.with(Cell::get);
        if absolute >= self.base_index && absolute < self.base_index + self.size {
            absolute - self.base_index + 1
        } else {
            0
        }
    }

    /// Queues an internal record, resetting it to the not-started state.
    /// Used by the drivers for both first submission and re-submission.
    ///
    /// # Safety
    ///
    /// `task` must point at a live record that is not queued and has no
    /// executor, and the record must stay valid until it is done.
    pub(crate) unsafe fn enqueue(&self, task: *mut Header) {
        {
            let mut shared = self.shared.lock().unwrap();
            // SAFETY: Per the caller's obligations, plus the lock for the
            // link access.
            unsafe {
                (*task).state.store(NOT_STARTED, Ordering::Release);
                shared.queue.push_back(task);
            }
        }
        self.work_ready.notify_one();
    }

    /// The caller-steal primitive: atomically detach a still-queued record
    /// and run it inline on the calling thread. Returns false when the
    /// record is not queued or another executor already claimed it.
    pub(crate) fn try_steal(&self, task: *mut Header) -> bool {
        {
            let mut shared = self.shared.lock().unwrap();
            // SAFETY: Link access under the pool lock.
            if !unsafe { (*(*task).links.get()).on_queue } {
                return false;
            }
            // Exactly one agent wins this transition; a worker that got
            // here first has already unlinked the record.
            let claimed = unsafe {
                (*task)
                    .state
                    .compare_exchange(NOT_STARTED, IN_PROGRESS, Ordering::Acquire, Ordering::Relaxed)
                    .is_ok()
            };
            if !claimed {
                return false;
            }
            // SAFETY: Still queued (checked above under this same lock).
            unsafe { shared.queue.unlink(task) };
        }
        trace!("stole queued task for inline execution");
        // SAFETY: We won the claim.
        unsafe { self.execute(task) };
        true
    }

    /// Runs a claimed record and publishes its completion.
    ///
    /// # Safety
    ///
    /// The caller must have won the `NotStarted -> InProgress` transition.
    pub(crate) unsafe fn execute(&self, task: *mut Header) {
        // SAFETY: Per the caller's obligations.
        unsafe { Header::run(task) };
        // SAFETY: The record is still live; owners cannot reclaim it until
        // it is done. Self-resubmitting records manage their own state.
        let publish = unsafe { (*task).set_done_on_completion.load(Ordering::Relaxed) };
        if publish {
            // SAFETY: As above.
            unsafe { (*task).state.store(DONE, Ordering::Release) };
        }
        // Forcers recheck the state byte while holding the lock, so taking
        // it here closes the window for a missed wakeup.
        drop(self.shared.lock().unwrap());
        self.task_done.notify_all();
    }

    /// Forces a record: steal it if still queued, otherwise sleep on the
    /// completion condvar until its executor finishes.
    pub(crate) fn force_done(&self, task: *mut Header) {
        if self.try_steal(task) {
            return;
        }
        self.wait_done(task);
    }

    /// Forces a record, executing other queued tasks inline while it is
    /// busy elsewhere. Falls back to sleeping once the queue is empty.
    pub(crate) fn work_force_done(&self, task: *mut Header) {
        if self.try_steal(task) {
            return;
        }
        loop {
            // SAFETY: The record is live until done, and we only read its
            // atomic state byte.
            if unsafe { (*task).state.load(Ordering::Acquire) } == DONE {
                return;
            }
            let other = {
                let mut shared = self.shared.lock().unwrap();
                pop_claim(&mut shared)
            };
            match other {
                // SAFETY: `pop_claim` won the claim for us.
                Some(next) => unsafe { self.execute(next) },
                None => return self.wait_done(task),
            }
        }
    }

    fn wait_done(&self, task: *mut Header) {
        let mut shared = self.shared.lock().unwrap();
        // SAFETY: The record is live until done; this is an atomic read.
        while unsafe { (*task).state.load(Ordering::Acquire) } != DONE {
            shared = self.task_done.wait(shared).unwrap();
        }
    }

    /// Sleeps on the completion condvar until `ready` reports true. The
    /// predicate is evaluated under the pool lock and must only read
    /// atomics.
    pub(crate) fn wait_until(&self, mut ready: impl FnMut() -> bool) {
        let mut shared = self.shared.lock().unwrap();
        while !ready() {
            shared = self.task_done.wait(shared).unwrap();
        }
    }

    fn apply_priority_to_workers(&self, priority: i32) {
        #[cfg(target_os = "linux")]
        {
            for &tid in self.worker_tids.lock().unwrap().iter() {
                apply_thread_priority(tid, priority);
            }
        }
        #[cfg(not(target_os = "linux"))]
        let _ = priority;
    }
}

/// Pops the oldest queued record and claims it for execution. Must be
/// called with the pool lock held (enforced by the `PoolShared` borrow).
fn pop_claim(shared: &mut PoolShared) -> Option<*mut Header> {
    // SAFETY: The lock is held per the `PoolShared` borrow.
    let task = unsafe { shared.queue.pop_front() }?;
    // SAFETY: A queued record is live and in the not-started state.
    let claimed = unsafe {
        (*task)
            .state
            .compare_exchange(NOT_STARTED, IN_PROGRESS, Ordering::Acquire, Ordering::Relaxed)
            .is_ok()
    };
    debug_assert!(claimed, "queued task was not in the not-started state");
    claimed.then_some(task)
}

impl Drop for TaskPool {
    fn drop(&mut self) {
        if self.is_daemon() {
            return;
        }
        self.finish();
        let handles = mem::take(&mut *self.inner.threads.lock().unwrap());
        for handle in handles {
            let _ = handle.join();
        }
    }
}

// -----------------------------------------------------------------------------
// Worker loop

/// The main loop for a worker thread: under the lock, claim the oldest
/// queued task (waiting on the worker condvar when there is none); release
/// the lock; execute. A finishing pool is drained before the worker flips
/// the status to stopped and exits; a stopped pool is abandoned as-is.
fn worker_loop(inner: Arc<PoolInner>, slot: usize) {
    WORKER_INDEX.with(|index| index.set(inner.base_index + slot));
    register_worker_thread(&inner);
    debug!(worker = slot, "worker started");

    loop {
        let task = {
            let mut shared = inner.shared.lock().unwrap();
            loop {
                if shared.status == PoolStatus::Stopped {
                    break None;
                }
                if let Some(task) = pop_claim(&mut shared) {
                    break Some(task);
                }
                if shared.status == PoolStatus::Finishing {
                    shared.status = PoolStatus::Stopped;
                    break None;
                }
                shared = inner.work_ready.wait(shared).unwrap();
            }
        };
        match task {
            // SAFETY: `pop_claim` won the claim for us.
            Some(task) => unsafe { inner.execute(task) },
            None => break,
        }
    }

    // Wake the remaining workers so they observe the shutdown too.
    inner.work_ready.notify_all();
    debug!(worker = slot, "worker exiting");
}

// -----------------------------------------------------------------------------
// OS thread priority

#[cfg(target_os = "linux")]
fn register_worker_thread(inner: &PoolInner) {
    // SAFETY: Plain gettid syscall.
    let tid = unsafe { libc::syscall(libc::SYS_gettid) } as libc::pid_t;
    inner.worker_tids.lock().unwrap().push(tid);
    if let Some(priority) = *inner.priority.lock().unwrap() {
        apply_thread_priority(tid, priority);
    }
}

#[cfg(not(target_os = "linux"))]
fn register_worker_thread(_inner: &PoolInner) {}

#[cfg(target_os = "linux")]
fn apply_thread_priority(tid: libc::pid_t, priority: i32) {
    // SAFETY: setpriority on a thread id we own; failure is reported via
    // the return value.
    let outcome = unsafe { libc::setpriority(libc::PRIO_PROCESS, tid as libc::id_t, priority) };
    if outcome != 0 {
        debug!(tid, priority, "setpriority rejected");
    }
}

/// Applies an OS priority to the calling thread. Used by one-shot task
/// threads.
#[cfg(target_os = "linux")]
pub(crate) fn set_current_thread_priority(priority: i32) {
    // SAFETY: Plain gettid syscall.
    let tid = unsafe { libc::syscall(libc::SYS_gettid) } as libc::pid_t;
    apply_thread_priority(tid, priority);
}

#[cfg(not(target_os = "linux"))]
pub(crate) fn set_current_thread_priority(_priority: i32) {}

// -----------------------------------------------------------------------------
// Tests
