//! Error types shared across the scope, lifecycle and combinator machinery.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use thiserror::Error;

static NEXT_SCOPE_ID: AtomicU64 = AtomicU64::new(1);

/// Opaque identity of a [`Scope`](crate::scope::Scope), used to stamp
/// cancellation signals with their origin without holding a reference back
/// to the scope itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ScopeId(u64);

impl ScopeId {
    pub(crate) fn next() -> Self {
        ScopeId(NEXT_SCOPE_ID.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for ScopeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "scope#{}", self.0)
    }
}

/// Errors surfaced by bound computations, bound sequences and combiners.
///
/// `E` is the caller's own source error type; it is `Infallible` for plain
/// futures, which have no error channel of their own.
#[derive(Debug, Error)]
pub enum ScopeError<E> {
    /// A bind was attempted after the owning scope had already cancelled.
    #[error("scope {0} is already cancelled")]
    AlreadyCancelled(ScopeId),

    /// The bound task was cancelled by its owning scope.
    #[error("task was cancelled by scope {scope}")]
    Cancelled { scope: ScopeId },

    /// A single-subscription sequence was listened to more than once.
    #[error("stream was listened to more than once")]
    DuplicateListener,

    /// A programmer error in the arguments passed to an operation, e.g. an
    /// empty source list passed to [`merge_streams`](crate::merge::merge_streams).
    #[error("invalid argument: {0}")]
    ArgumentFault(String),

    /// An error produced by the wrapped source itself, passed through unmodified.
    #[error(transparent)]
    Source(E),
}

impl<E> ScopeError<E> {
    pub fn is_cancellation(&self) -> bool {
        matches!(self, ScopeError::Cancelled { .. })
    }

    pub fn cancelling_scope(&self) -> Option<ScopeId> {
        match self {
            ScopeError::Cancelled { scope } => Some(*scope),
            _ => None,
        }
    }
}

/// Error produced when a source in a [`MergeCombiner`](crate::merge::MergeCombiner)
/// fails: wraps the original error with its index and keeps it distinguishable
/// from a cancellation or argument fault of the combiner itself.
#[derive(Debug, Error)]
#[error("source {index} failed: {error}")]
pub struct MergeSourceError<E> {
    pub index: usize,
    pub error: E,
}
