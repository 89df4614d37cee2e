//! Bound sequences: streams whose lifecycle is tied to a [`Scope`]. The
//! source is driven lazily, at most one item per consumer poll, and a
//! cancellation is checked before every such poll so it pre-empts any item
//! the source has not yet delivered to the consumer instead of racing
//! against a background task's buffer.
//!
//! Grounded on `utils::stream_subscribable::StreamSubscribable` for the
//! once-only-subscribe shape; checking shared state before delegating to the
//! wrapped stream on every `poll_next` is grounded on
//! `utils::stream_backoff::StreamBackoff`'s poll-time state machine.
use std::convert::Infallible;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};

use futures::Stream;
use parking_lot::Mutex;
use tracing::trace;

use crate::error::{ScopeError, ScopeId};
use crate::scope::{HandleId, Scope};

type Item<T> = Result<T, ScopeError<Infallible>>;

enum State<T> {
    AlreadyCancelled(ScopeId),
    Ready(Mutex<Option<BoundSequenceStream<T>>>),
}

/// A stream bound to a [`Scope`]. Exactly one subscriber is allowed: a
/// second call to [`subscribe`](BoundSequence::subscribe) fails synchronously
/// with [`ScopeError::DuplicateListener`], mirroring the single-subscription
/// destination contract of a [`crate::lifecycle::LifecycleStream`]. Rust's
/// ownership rules enforce that directly for the stream itself once handed
/// out; the check here exists because `BoundSequence` is handed out before
/// anyone has subscribed.
pub struct BoundSequence<T> {
    state: State<T>,
}

impl<T: Send + 'static> BoundSequence<T> {
    fn already_cancelled(id: ScopeId) -> Self {
        BoundSequence {
            state: State::AlreadyCancelled(id),
        }
    }

    fn ready(stream: BoundSequenceStream<T>) -> Self {
        BoundSequence {
            state: State::Ready(Mutex::new(Some(stream))),
        }
    }

    /// Take ownership of the stream of bound events. Fails if called twice.
    ///
    /// # Errors
    ///
    /// Returns [`ScopeError::AlreadyCancelled`] if the owning scope had
    /// already cancelled when this sequence was bound, or
    /// [`ScopeError::DuplicateListener`] if called more than once.
    pub fn subscribe(&self) -> Result<BoundSequenceStream<T>, ScopeError<Infallible>> {
        match &self.state {
            State::AlreadyCancelled(id) => Err(ScopeError::AlreadyCancelled(*id)),
            State::Ready(slot) => slot.lock().take().ok_or(ScopeError::DuplicateListener),
        }
    }
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum SeqState {
    Streaming,
    Done,
}

/// The subscribed stream of a [`BoundSequence`].
///
/// Holds the source directly rather than forwarding it through a channel fed
/// by a spawned task: a channel buffer lets an eager source race ahead of
/// the consumer and finish before a cancellation has a chance to pre-empt
/// it, which is exactly the defect this type exists to avoid. Polling this
/// stream is what drives the source; nothing runs on its behalf in the
/// background.
pub struct BoundSequenceStream<T> {
    source: Pin<Box<dyn Stream<Item = T> + Send>>,
    cancelled: Arc<AtomicBool>,
    scope: Scope,
    handle_id: Option<HandleId>,
    scope_id: ScopeId,
    state: SeqState,
}

impl<T> std::fmt::Debug for BoundSequenceStream<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BoundSequenceStream")
            .field("scope", &self.scope_id)
            .finish_non_exhaustive()
    }
}

impl<T> BoundSequenceStream<T> {
    fn finish(&mut self) {
        if let Some(id) = self.handle_id.take() {
            self.scope.deregister(id);
        }
    }
}

impl<T> Stream for BoundSequenceStream<T> {
    type Item = Item<T>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        if this.state == SeqState::Done {
            return Poll::Ready(None);
        }
        if this.cancelled.load(Ordering::Acquire) {
            trace!(scope = %this.scope_id, "bound sequence observed cancellation before its next source item");
            this.state = SeqState::Done;
            this.finish();
            return Poll::Ready(Some(Err(ScopeError::Cancelled {
                scope: this.scope_id,
            })));
        }
        match this.source.as_mut().poll_next(cx) {
            Poll::Ready(Some(value)) => Poll::Ready(Some(Ok(value))),
            Poll::Ready(None) => {
                this.state = SeqState::Done;
                this.finish();
                Poll::Ready(None)
            }
            Poll::Pending => Poll::Pending,
        }
    }
}

impl<T> Drop for BoundSequenceStream<T> {
    fn drop(&mut self) {
        // The consumer cancelled the destination subscription itself (by
        // dropping it) before the source was done; forward that by forgetting
        // the handle so the scope no longer carries it.
        self.finish();
    }
}

impl Scope {
    /// Bind a source stream to this scope. Subscribing returns a stream that
    /// drives `source` one item per poll; the scope cancelling flips a flag
    /// this stream checks before every such poll, so it delivers at most one
    /// more item after a cancel: a single [`ScopeError::Cancelled`] followed
    /// by the end of the stream, even if the source already had further
    /// items ready to produce.
    pub fn bind_sequence<S, T>(&self, source: S) -> BoundSequence<T>
    where
        S: Stream<Item = T> + Send + 'static,
        T: Send + 'static,
    {
        if self.is_cancelled() {
            return BoundSequence::already_cancelled(self.id());
        }

        let cancelled = Arc::new(AtomicBool::new(false));
        let scope_id = self.id();
        let cancel_flag = cancelled.clone();
        let handle_id = self.register(Box::new(move || {
            cancel_flag.store(true, Ordering::Release);
        }));
        let Some(handle_id) = handle_id else {
            return BoundSequence::already_cancelled(self.id());
        };

        BoundSequence::ready(BoundSequenceStream {
            source: Box::pin(source),
            cancelled,
            scope: self.clone(),
            handle_id: Some(handle_id),
            scope_id,
            state: SeqState::Streaming,
        })
    }
}
