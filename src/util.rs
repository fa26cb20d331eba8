//! Small shared helpers.

/// A raw mutable pointer that may be sent to and shared with other threads.
///
/// This exists so that task payloads can smuggle pointers into closures and
/// task records without those types becoming `!Send`. It provides no
/// synchronization whatsoever; every use site must argue its own exclusivity.
pub(crate) struct MutPtr<T: ?Sized> {
    ptr: *mut T,
}

impl<T> MutPtr<T> {
    #[inline(always)]
    pub fn new(ptr: *mut T) -> MutPtr<T> {
        MutPtr { ptr }
    }

    /// Returns the raw pointer.
    #[inline(always)]
    pub fn get(&self) -> *mut T {
        self.ptr
    }
}

impl<T: ?Sized> Clone for MutPtr<T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T: ?Sized> Copy for MutPtr<T> {}

// SAFETY: !Send for raw pointers is not for safety, just as a lint. Call
// sites are responsible for access discipline.
unsafe impl<T: ?Sized> Send for MutPtr<T> {}

// SAFETY: As above; sharing the pointer value itself is harmless.
unsafe impl<T: ?Sized> Sync for MutPtr<T> {}

/// Turns an unwind of the current frame into an abort.
///
/// The batch drivers queue task records that live on their own stack
/// frame; unwinding past them while workers still hold those pointers
/// would be a use-after-free. A driver arms a guard before its first
/// enqueue and disarms it once every record has been forced. Driver code
/// between those points never runs user callables directly (bodies are
/// caught inside the run thunks), so the guard firing means an internal
/// invariant broke.
pub(crate) struct FrameGuard;

impl FrameGuard {
    pub fn arm() -> FrameGuard {
        FrameGuard
    }

    pub fn disarm(self) {
        core::mem::forget(self);
    }
}

impl Drop for FrameGuard {
    fn drop(&mut self) {
        tracing::error!("panicked while workers hold borrowed task records; aborting");
        std::process::abort();
    }
}
