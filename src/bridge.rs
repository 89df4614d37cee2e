//! A completion cell that settles at most once, shared between two independent
//! producers that race to decide a [`crate::scope::BoundComputation`]'s
//! outcome: the wrapped future finishing, or the owning scope cancelling it.
//!
//! Grounded on `utils::delayed_init::DelayedInit`, but generalised to allow
//! settling from either side of the race rather than from a single owner:
//! `DelayedInit`'s `Initializer` is consumed by `init`, which is fine when
//! there is exactly one producer. Here the cancellation path and the value
//! path both hold a handle, so the "only one send succeeds" guarantee is
//! enforced by a `Mutex<Option<Sender>>` instead of ownership.
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use parking_lot::Mutex;
use tokio::sync::oneshot;

/// The settling half of a bridge. Cloneable: every clone races to be the
/// first to call [`Bridge::settle`], and only the first succeeds.
pub struct Bridge<T> {
    tx: Arc<Mutex<Option<oneshot::Sender<T>>>>,
}

impl<T> Clone for Bridge<T> {
    fn clone(&self) -> Self {
        Bridge {
            tx: self.tx.clone(),
        }
    }
}

impl<T> Bridge<T> {
    /// Create a fresh bridge and its awaiter half.
    #[must_use]
    pub fn channel() -> (Bridge<T>, BridgeAwaiter<T>) {
        let (tx, rx) = oneshot::channel();
        (
            Bridge {
                tx: Arc::new(Mutex::new(Some(tx))),
            },
            BridgeAwaiter { rx },
        )
    }

    /// Attempt to settle the bridge with `value`. Returns `true` if this call
    /// won the race; a `false` means some other settle attempt got there first
    /// and `value` is silently dropped.
    pub fn settle(&self, value: T) -> bool {
        let mut guard = self.tx.lock();
        match guard.take() {
            Some(tx) => {
                let _ = tx.send(value);
                true
            }
            None => false,
        }
    }

    /// True once some settle attempt has won the race (or is in the process
    /// of winning it).
    #[must_use]
    pub fn is_settled(&self) -> bool {
        self.tx.lock().is_none()
    }
}

/// The awaiting half of a bridge. Polls ready once the matching [`Bridge`]
/// settles.
pub struct BridgeAwaiter<T> {
    rx: oneshot::Receiver<T>,
}

impl<T> Future for BridgeAwaiter<T> {
    type Output = Option<T>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        Pin::new(&mut this.rx).poll(cx).map(Result::ok)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn first_settle_wins() {
        let (bridge, awaiter) = Bridge::channel();
        let b1 = bridge.clone();
        let b2 = bridge.clone();

        assert!(b1.settle("value"));
        assert!(!b2.settle("cancel"));
        assert_eq!(awaiter.await, Some("value"));
    }

    #[tokio::test]
    async fn settle_after_drop_is_noop() {
        let (bridge, awaiter) = Bridge::<u32>::channel();
        drop(awaiter);
        assert!(bridge.settle(1));
        assert!(!bridge.settle(2));
    }

    #[test]
    fn is_settled_reflects_state() {
        let (bridge, _awaiter) = Bridge::channel();
        assert!(!bridge.is_settled());
        bridge.settle(42);
        assert!(bridge.is_settled());
    }
}
