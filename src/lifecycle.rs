//! Stream-lifecycle transformation: wrap a source stream with overridable
//! per-phase hooks while reproducing the source's behavior by default.
//!
//! Grounded on `utils::event_flatten::EventFlatten` for the "buffer
//! intermediate state across polls, re-derive context at each call" shape,
//! and on `utils::stream_backoff::StreamBackoff` for the general
//! pin-project-stream-with-internal-state-machine idiom. The listen/cancel
//! hook pair that the source system exposes on its (pausable,
//! possibly-broadcast) stream controller has no equivalent in Rust's
//! poll-based `Stream`: there is no separate "listen" call, and
//! single-subscription enforcement falls out of ownership for free (a plain,
//! non-`Clone`, owned `Stream` cannot structurally be polled from two
//! places). So `on_listen` fires on first poll and `on_cancel` fires from
//! `Drop` if the stream is dropped before the source finished, which is the
//! closest analogue available: "the destination was cancelled" becomes
//! "the consumer stopped polling before done".
use std::collections::VecDeque;
use std::pin::Pin;
use std::task::{Context, Poll};

use futures::{Stream, StreamExt};
use pin_project::{pin_project, pinned_drop};

/// Per-phase hooks for a [`LifecycleStream`]. The default trait methods
/// implement a faithful passthrough; override only the phases that need
/// custom behavior.
pub trait LifecycleTransformer<Item> {
    type Output;

    /// Fires once, on the first poll of the destination stream.
    fn on_listen(&mut self) {}

    /// One source item arrives; return zero or more destination items.
    fn on_source_data(&mut self, item: Item) -> Vec<Self::Output>;

    /// The source stream ended; return any final destination items before
    /// the destination itself ends.
    fn on_source_done(&mut self) -> Vec<Self::Output> {
        Vec::new()
    }

    /// The destination was dropped before the source naturally completed.
    fn on_cancel(&mut self) {}
}

/// Transforms every source item into itself, unchanged: the default
/// passthrough behavior a custom transformer augments.
pub struct Identity;

impl<Item> LifecycleTransformer<Item> for Identity {
    type Output = Item;

    fn on_source_data(&mut self, item: Item) -> Vec<Item> {
        vec![item]
    }
}

#[pin_project(PinnedDrop)]
pub struct LifecycleStream<S, X>
where
    S: Stream,
    X: LifecycleTransformer<S::Item>,
{
    #[pin]
    source: S,
    transformer: X,
    pending: VecDeque<X::Output>,
    listened: bool,
    done: bool,
}

impl<S, X> Stream for LifecycleStream<S, X>
where
    S: Stream,
    X: LifecycleTransformer<S::Item>,
{
    type Item = X::Output;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let mut this = self.project();
        if !*this.listened {
            *this.listened = true;
            this.transformer.on_listen();
        }
        loop {
            if let Some(item) = this.pending.pop_front() {
                return Poll::Ready(Some(item));
            }
            if *this.done {
                return Poll::Ready(None);
            }
            match this.source.as_mut().poll_next(cx) {
                Poll::Ready(Some(item)) => {
                    this.pending.extend(this.transformer.on_source_data(item));
                }
                Poll::Ready(None) => {
                    *this.done = true;
                    this.pending.extend(this.transformer.on_source_done());
                }
                Poll::Pending => return Poll::Pending,
            }
        }
    }
}

#[pinned_drop]
impl<S, X> PinnedDrop for LifecycleStream<S, X>
where
    S: Stream,
    X: LifecycleTransformer<S::Item>,
{
    fn drop(self: Pin<&mut Self>) {
        let this = self.project();
        if !*this.done {
            this.transformer.on_cancel();
        }
    }
}

/// Extension trait installing [`transform`](LifecycleStreamExt::transform)
/// on any `Stream`, matching the `WatchStreamExt`-style "extension-method
/// sugar" pattern: no hidden state, a thin free-function wrapper.
pub trait LifecycleStreamExt: Stream + Sized {
    fn transform<X>(self, transformer: X) -> LifecycleStream<Self, X>
    where
        X: LifecycleTransformer<Self::Item>,
    {
        LifecycleStream {
            source: self,
            transformer,
            pending: VecDeque::new(),
            listened: false,
            done: false,
        }
    }
}

impl<S: Stream> LifecycleStreamExt for S {}

/// Drive `source` through `transformer` on a background task, fanning every
/// destination item out to every subscriber of the returned broadcast
/// receiver. Models the "broadcast destination" controller flavor of
/// [`LifecycleTransformer::on_listen`]'s `bind_destination` hook: unlike a
/// plain `Stream`, a broadcast destination may be listened to by any number
/// of subscribers, each seeing every item from the point they subscribed.
///
/// Grounded on `utils::broadcast::Broadcaster` (backpressure the producer,
/// never drop a slow subscriber's buffer) and `reflector::dispatcher::Dispatcher`
/// (a driving task plus a cloneable receiver handle).
pub fn broadcast<S, X>(
    source: S,
    transformer: X,
    capacity: usize,
) -> async_broadcast::Receiver<X::Output>
where
    S: Stream + Send + 'static,
    S::Item: Send,
    X: LifecycleTransformer<S::Item> + Send + 'static,
    X::Output: Clone + Send + 'static,
{
    let (tx, rx) = async_broadcast::broadcast(capacity);
    let stream = source.transform(transformer);
    tokio::spawn(async move {
        futures::pin_mut!(stream);
        while let Some(item) = stream.next().await {
            if tx.broadcast(item).await.is_err() {
                break;
            }
        }
    });
    rx
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::stream;

    #[tokio::test]
    async fn identity_transform_is_a_faithful_round_trip() {
        let source = stream::iter(vec![1, 2, 3]);
        let out: Vec<_> = source.transform(Identity).collect().await;
        assert_eq!(out, vec![1, 2, 3]);
    }

    struct Double;
    impl LifecycleTransformer<i32> for Double {
        type Output = i32;
        fn on_source_data(&mut self, item: i32) -> Vec<i32> {
            vec![item, item]
        }
    }

    #[tokio::test]
    async fn transformer_can_emit_multiple_items_per_source_item() {
        let source = stream::iter(vec![1, 2]);
        let out: Vec<_> = source.transform(Double).collect().await;
        assert_eq!(out, vec![1, 1, 2, 2]);
    }

    struct CountsCancel(std::sync::Arc<std::sync::atomic::AtomicUsize>);
    impl LifecycleTransformer<i32> for CountsCancel {
        type Output = i32;
        fn on_source_data(&mut self, item: i32) -> Vec<i32> {
            vec![item]
        }
        fn on_cancel(&mut self) {
            self.0.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        }
    }

    #[tokio::test]
    async fn on_cancel_fires_when_dropped_before_source_done() {
        let count = std::sync::Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let source = stream::iter(vec![1, 2, 3]).then(|x| async move {
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
            x
        });
        let mut s = Box::pin(source.transform(CountsCancel(count.clone())));
        assert_eq!(s.next().await, Some(1));
        drop(s);
        assert_eq!(count.load(std::sync::atomic::Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn on_cancel_does_not_fire_after_natural_completion() {
        let count = std::sync::Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let source = stream::iter(vec![1]);
        let s = source.transform(CountsCancel(count.clone()));
        let _: Vec<_> = s.collect().await;
        assert_eq!(count.load(std::sync::atomic::Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn broadcast_destination_fans_out_to_multiple_subscribers() {
        let source = stream::iter(vec![1, 2, 3]);
        let rx1 = broadcast(source, Identity, 8);
        let mut rx2 = rx1.clone();
        let mut rx1 = rx1;
        let a: Vec<_> = rx1.by_ref().collect().await;
        let b: Vec<_> = rx2.by_ref().collect().await;
        assert_eq!(a, vec![1, 2, 3]);
        assert_eq!(b, vec![1, 2, 3]);
    }
}
