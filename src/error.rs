//! Error types for the data-parallel surface.
//!
//! Panics escaping a task body are captured at execution time and re-raised
//! when the task is forced. The parallel algorithms instead collect every
//! captured panic from their work units into a [`Fault`] chain and report it
//! through [`Error`], so a caller can distinguish a failed loop body from a
//! misuse of the api.

use core::any::Any;
use core::fmt;
use std::panic::{catch_unwind, resume_unwind, AssertUnwindSafe};

use thiserror::Error;

// -----------------------------------------------------------------------------
// Fault chain

/// A panic captured from one work unit, chained to any further panics that
/// occurred in the same parallel operation.
///
/// The chain is linear: [`Fault::next`] (also exposed through
/// [`std::error::Error::source`]) walks towards the remaining faults. The
/// order of faults within a chain is unspecified.
pub struct Fault {
    payload: Box<dyn Any + Send + 'static>,
    next: Option<Box<Fault>>,
}

impl Fault {
    fn single(payload: Box<dyn Any + Send + 'static>) -> Fault {
        Fault {
            payload,
            next: None,
        }
    }

    /// Runs a task body, converting any panic that escapes it into a
    /// fault. This is the only place the library catches unwinds; every
    /// fault in the system enters through here and leaves again through
    /// [`Fault::resume`], so the body may be treated as exception safe.
    pub(crate) fn catch<R>(body: impl FnOnce() -> R) -> Result<R, Fault> {
        catch_unwind(AssertUnwindSafe(body)).map_err(Fault::single)
    }

    /// Re-raises this fault's panic payload on the calling thread. Any
    /// faults chained behind it are dropped.
    #[cold]
    pub(crate) fn resume(self) -> ! {
        resume_unwind(self.payload)
    }

    /// Links a batch of faults into a single chain. Returns `None` when
    /// the batch is empty.
    pub(crate) fn chain(mut faults: Vec<Fault>) -> Option<Fault> {
        let mut head: Option<Fault> = None;
        while let Some(mut fault) = faults.pop() {
            fault.next = head.map(Box::new);
            head = Some(fault);
        }
        head
    }

    /// The panic message, when the payload was a string.
    pub fn message(&self) -> Option<&str> {
        if let Some(message) = self.payload.downcast_ref::<&'static str>() {
            Some(message)
        } else {
            self.payload.downcast_ref::<String>().map(String::as_str)
        }
    }

    /// The next fault in the chain, if any.
    pub fn next(&self) -> Option<&Fault> {
        self.next.as_deref()
    }

    /// Walks the whole chain, starting with this fault.
    pub fn iter(&self) -> impl Iterator<Item = &Fault> {
        let mut cursor = Some(self);
        core::iter::from_fn(move || {
            let fault = cursor?;
            cursor = fault.next();
            Some(fault)
        })
    }

    /// The number of faults in the chain.
    pub fn len(&self) -> usize {
        self.iter().count()
    }

    /// Consumes the head of the chain, returning the raw panic payload.
    pub fn into_payload(self) -> Box<dyn Any + Send + 'static> {
        self.payload
    }
}

impl fmt::Display for Fault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.message() {
            Some(message) => write!(f, "work unit panicked: {message}"),
            None => write!(f, "work unit panicked"),
        }
    }
}

impl fmt::Debug for Fault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Fault")
            .field("message", &self.message())
            .field("chained", &self.next.is_some())
            .finish()
    }
}

impl std::error::Error for Fault {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.next().map(|fault| fault as &(dyn std::error::Error + 'static))
    }
}

// -----------------------------------------------------------------------------
// Error kinds

/// Errors reported by pool submission and the data-parallel operations.
#[derive(Debug, Error)]
pub enum Error {
    /// One or more work units of a parallel operation panicked. The faults
    /// are chained; their order is unspecified.
    #[error("parallel operation failed: {} work unit(s) panicked", .0.len())]
    WorkUnits(#[source] Fault),

    /// A parallel loop body requested a break. Breaking out of a parallel
    /// loop is a programming error; units that had already started were
    /// allowed to complete, and any panics they raised are chained here.
    #[error("a parallel loop body attempted to break out of the loop")]
    Break { chained: Option<Fault> },

    /// Invalid input to an operation, such as a zero work-unit size or an
    /// output buffer of the wrong length.
    #[error("precondition violated: {0}")]
    Precondition(&'static str),

    /// A seedless reduce over an empty source has no value to return.
    #[error("cannot reduce an empty source without a seed")]
    EmptyReduce,

    /// The pool is finishing or stopped and no longer accepts tasks.
    #[error("task pool is no longer accepting tasks")]
    Terminated,
}

impl Error {
    /// The fault chain attached to this error, if any.
    pub fn faults(&self) -> Option<&Fault> {
        match self {
            Error::WorkUnits(fault) => Some(fault),
            Error::Break { chained } => chained.as_ref(),
            _ => None,
        }
    }
}

// -----------------------------------------------------------------------------
// Tests

#[cfg(test)]
mod tests {
    use super::*;

    fn payload(message: &'static str) -> Box<dyn Any + Send + 'static> {
        Box::new(message)
    }

    #[test]
    fn empty_chain() {
        assert!(Fault::chain(Vec::new()).is_none());
    }

    #[test]
    fn catch_converts_panics_into_faults() {
        assert_eq!(Fault::catch(|| 7).unwrap(), 7);
        let fault = Fault::catch(|| -> () { panic!("caught") }).unwrap_err();
        assert_eq!(fault.message(), Some("caught"));
    }

    #[test]
    fn chain_preserves_all_payloads() {
        let faults = vec![
            Fault::single(payload("a")),
            Fault::single(payload("b")),
            Fault::single(payload("c")),
        ];
        let fault = Fault::chain(faults).unwrap();
        let messages: Vec<_> = fault.iter().filter_map(Fault::message).collect();
        assert_eq!(messages, ["a", "b", "c"]);
        assert_eq!(fault.len(), 3);
    }

    #[test]
    fn string_payloads_render() {
        let fault = Fault::single(Box::new(String::from("boom")));
        assert_eq!(fault.message(), Some("boom"));
        assert_eq!(fault.to_string(), "work unit panicked: boom");
    }

    #[test]
    fn source_walks_the_chain() {
        use std::error::Error as _;
        let fault =
            Fault::chain(vec![Fault::single(payload("head")), Fault::single(payload("tail"))])
                .unwrap();
        let err = Error::WorkUnits(fault);
        let source = err.source().expect("chain head");
        assert!(source.to_string().contains("head"));
    }
}
