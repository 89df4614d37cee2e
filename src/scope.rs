//! Scopes own a set of cancellable task handles and cancel them as one unit.
//!
//! Grounded on `controller::Controller::run`'s graceful/forceful shutdown
//! selectors (a spawned reconciler future raced against shutdown signals,
//! `utils::CancelableJoinHandle`) generalised from "one controller, two
//! shutdown futures" to "arbitrarily many bound handles, one cancel call".
use std::convert::Infallible;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};

use parking_lot::Mutex;
use tracing::{debug, trace};

use crate::bridge::Bridge;
use crate::error::{ScopeError, ScopeId};

pub(crate) type CancelAction = Box<dyn FnOnce() + Send>;
pub(crate) type HandleId = u64;

struct Handle {
    id: HandleId,
    cancel: CancelAction,
}

struct ScopeInner {
    id: ScopeId,
    cancelled: AtomicBool,
    next_handle: AtomicU64,
    handles: Mutex<Vec<Handle>>,
    children: Mutex<Vec<Scope>>,
}

/// A unit of cancellation. Owns a set of bound task handles and a list of
/// child scopes; cancelling a scope cancels every handle and recurses into
/// every child, synchronously, in the order they were registered.
#[derive(Clone)]
pub struct Scope {
    inner: Arc<ScopeInner>,
}

impl Default for Scope {
    fn default() -> Self {
        Self::new()
    }
}

impl Scope {
    /// Create a fresh, uncancelled, parentless scope.
    #[must_use]
    pub fn new() -> Self {
        Scope {
            inner: Arc::new(ScopeInner {
                id: ScopeId::next(),
                cancelled: AtomicBool::new(false),
                next_handle: AtomicU64::new(0),
                handles: Mutex::new(Vec::new()),
                children: Mutex::new(Vec::new()),
            }),
        }
    }

    /// Create a scope that is cancelled together with `parent`.
    ///
    /// If `parent` has already cancelled, the child is constructed already
    /// cancelled: `is_cancelled()` reads `true` immediately and every bind
    /// on it fails with [`ScopeError::AlreadyCancelled`], exactly as it would
    /// after a real `cancel_all`. Child construction is infallible either way.
    pub fn child_of(parent: &Scope) -> Self {
        let child = Scope::new();
        if parent.is_cancelled() {
            debug!(parent = %parent.id(), child = %child.id(), "child created under an already-cancelled parent; pre-cancelling");
            child.inner.cancelled.store(true, Ordering::Release);
            return child;
        }
        parent.inner.children.lock().push(child.clone());
        child
    }

    #[must_use]
    pub fn id(&self) -> ScopeId {
        self.inner.id
    }

    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.inner.cancelled.load(Ordering::Acquire)
    }

    pub(crate) fn register(&self, cancel: CancelAction) -> Option<HandleId> {
        if self.is_cancelled() {
            return None;
        }
        let id = self.inner.next_handle.fetch_add(1, Ordering::Relaxed);
        let mut handles = self.inner.handles.lock();
        // is_cancelled() may have flipped true between the check above and
        // taking the lock; cancel_all only ever drains the list under the
        // same lock, so re-check here to avoid stranding a handle that will
        // never be cancelled.
        if self.is_cancelled() {
            return None;
        }
        handles.push(Handle { id, cancel });
        Some(id)
    }

    pub(crate) fn deregister(&self, id: HandleId) -> bool {
        let mut handles = self.inner.handles.lock();
        if let Some(pos) = handles.iter().position(|h| h.id == id) {
            handles.remove(pos);
            true
        } else {
            false
        }
    }

    /// Cancel every bound handle and every child scope, synchronously.
    ///
    /// Idempotent: a second call is a no-op. Handles registered by a cancel
    /// callback that runs during this call are not visited: the handle set
    /// is snapshotted at the start via `mem::take`, matching the documented
    /// "snapshot then iterate" semantics.
    pub fn cancel_all(&self) {
        if self.inner.cancelled.swap(true, Ordering::AcqRel) {
            return;
        }
        let handles = std::mem::take(&mut *self.inner.handles.lock());
        debug!(scope = %self.id(), handles = handles.len(), "cancelling scope");
        for handle in handles {
            (handle.cancel)();
        }
        let children = std::mem::take(&mut *self.inner.children.lock());
        for child in children {
            child.cancel_all();
        }
    }

    /// Bind a plain future to this scope: it is polled to completion
    /// regardless, but if the scope cancels first, the returned
    /// [`BoundComputation`] resolves to [`ScopeError::Cancelled`] instead of
    /// the future's value, and the future's eventual output is discarded.
    pub fn bind_computation<T, Fut>(&self, fut: Fut) -> BoundComputation<T>
    where
        T: Send + 'static,
        Fut: Future<Output = T> + Send + 'static,
    {
        if self.is_cancelled() {
            return BoundComputation {
                state: State::AlreadyCancelled(self.id()),
            };
        }

        let (bridge, awaiter) = Bridge::channel();
        let scope_id = self.id();

        let cancel_bridge = bridge.clone();
        let handle_id = self.register(Box::new(move || {
            trace!(scope = %scope_id, "cancelling bound computation");
            cancel_bridge.settle(Err(ScopeError::Cancelled { scope: scope_id }));
        }));

        let Some(handle_id) = handle_id else {
            // Lost a race against cancel_all between the is_cancelled() check
            // above and registration; resolve as cancelled immediately.
            return BoundComputation {
                state: State::AlreadyCancelled(self.id()),
            };
        };

        let scope_for_cleanup = self.clone();
        let settle_bridge = bridge;
        tokio::spawn(async move {
            let value = fut.await;
            if settle_bridge.settle(Ok(value)) {
                scope_for_cleanup.deregister(handle_id);
            }
        });

        BoundComputation {
            state: State::Pending(awaiter, scope_id),
        }
    }

    /// Register a callback to run exactly once: either when the scope
    /// cancels, or earlier via [`CancelListener::invoke_early`], whichever
    /// comes first.
    pub fn add_cancel_listener<F>(&self, callback: F) -> CancelListener
    where
        F: FnOnce() + Send + 'static,
    {
        let once = Arc::new(OnceCancel {
            fired: AtomicBool::new(false),
            callback: Mutex::new(Some(Box::new(callback))),
        });

        let fire_on_cancel = once.clone();
        let id = self.register(Box::new(move || fire_on_cancel.fire()));

        CancelListener {
            scope: self.clone(),
            id,
            once,
        }
    }

    /// Run `block` such that a [`ScopeError::Cancelled`] originating from
    /// *this* scope is absorbed (the result is `Ok(None)`) instead of
    /// propagating; every other error (including cancellation signals from a
    /// different scope) is returned unchanged.
    ///
    /// # Errors
    ///
    /// Returns `block`'s error unchanged if it fails with anything other than
    /// a cancellation from this scope.
    pub async fn catch_cancellations<T, E, Fut>(
        &self,
        block: Fut,
    ) -> Result<Option<T>, ScopeError<E>>
    where
        Fut: Future<Output = Result<T, ScopeError<E>>>,
    {
        let mine = self.id();
        crate::cancel_filter::catch_cancellations_matching(block, move |id| id == mine).await
    }
}

struct OnceCancel {
    fired: AtomicBool,
    callback: Mutex<Option<Box<dyn FnOnce() + Send>>>,
}

impl OnceCancel {
    fn fire(&self) {
        if self.fired.swap(true, Ordering::AcqRel) {
            return;
        }
        if let Some(cb) = self.callback.lock().take() {
            cb();
        }
    }
}

/// Handle to a cancel listener registered via [`Scope::add_cancel_listener`].
pub struct CancelListener {
    scope: Scope,
    id: Option<HandleId>,
    once: Arc<OnceCancel>,
}

impl CancelListener {
    /// Run the callback now, if it hasn't already run. A no-op if the
    /// callback already fired (via an earlier `invoke_early` or via the
    /// scope cancelling).
    pub fn invoke_early(&self) {
        if let Some(id) = self.id {
            self.scope.deregister(id);
        }
        self.once.fire();
    }

    /// True if the callback has already run.
    #[must_use]
    pub fn has_fired(&self) -> bool {
        self.once.fired.load(Ordering::Acquire)
    }
}

enum State<T> {
    AlreadyCancelled(ScopeId),
    Pending(
        crate::bridge::BridgeAwaiter<Result<T, ScopeError<Infallible>>>,
        ScopeId,
    ),
    Done,
}

/// A future bound to a [`Scope`]: resolves to the wrapped future's value, or
/// to [`ScopeError::Cancelled`] if the scope cancelled first.
pub struct BoundComputation<T> {
    state: State<T>,
}

impl<T> Future for BoundComputation<T> {
    type Output = Result<T, ScopeError<Infallible>>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        match std::mem::replace(&mut this.state, State::Done) {
            State::AlreadyCancelled(id) => Poll::Ready(Err(ScopeError::AlreadyCancelled(id))),
            State::Pending(mut awaiter, scope_id) => {
                match Pin::new(&mut awaiter).poll(cx) {
                    Poll::Ready(Some(result)) => Poll::Ready(result),
                    // The bridge's sender was dropped without settling: the
                    // scope (and every handle referencing it) was dropped
                    // outright. Treat that the same as a cancellation.
                    Poll::Ready(None) => {
                        Poll::Ready(Err(ScopeError::Cancelled { scope: scope_id }))
                    }
                    Poll::Pending => {
                        this.state = State::Pending(awaiter, scope_id);
                        Poll::Pending
                    }
                }
            }
            State::Done => panic!("BoundComputation polled after completion"),
        }
    }
}
