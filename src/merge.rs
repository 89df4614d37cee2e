//! N-way latest-value stream merging sharing one destination.
//!
//! Grounded on `utils::broadcast::Broadcaster` for the "many producers, one
//! shared destination fed through a channel" shape, and on
//! `controller::runner::FutureHashMap` for polling a dynamically-sized set of
//! in-flight producers and surfacing whichever is ready first.
use std::pin::Pin;
use std::task::{Context, Poll};

use futures::{Stream, StreamExt};
use tokio::sync::mpsc;

use crate::error::{MergeSourceError, ScopeError};

enum Signal<T, E> {
    Item(Result<T, E>),
    SourceDone,
}

/// The shared destination of [`merge_streams`]: emits the latest value of
/// every source, in the sources' declared order, each time any source
/// produces a fresh value, starting only once every source has produced at
/// least one. Closes once the last still-active source ends, whether or not
/// it ever produced a value.
pub struct MergeStream<T, E> {
    rx: mpsc::Receiver<(usize, Signal<T, E>)>,
    latest: Vec<Option<T>>,
    live: usize,
    closed: bool,
}

// `MergeStream` holds no pinned futures of its own (just an mpsc receiver and
// plain owned state), so it is never address-sensitive; unpin it
// unconditionally rather than forcing `T: Unpin` on every caller.
impl<T, E> Unpin for MergeStream<T, E> {}

impl<T, E> Stream for MergeStream<T, E>
where
    T: Clone,
{
    type Item = Result<Vec<T>, ScopeError<MergeSourceError<E>>>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        if this.closed {
            return Poll::Ready(None);
        }
        loop {
            match this.rx.poll_recv(cx) {
                Poll::Ready(Some((index, Signal::Item(Ok(value))))) => {
                    this.latest[index] = Some(value);
                    if this.latest.iter().all(Option::is_some) {
                        let tuple = this.latest.iter().cloned().map(Option::unwrap).collect();
                        return Poll::Ready(Some(Ok(tuple)));
                    }
                }
                Poll::Ready(Some((index, Signal::Item(Err(error))))) => {
                    return Poll::Ready(Some(Err(ScopeError::Source(MergeSourceError {
                        index,
                        error,
                    }))));
                }
                Poll::Ready(Some((_, Signal::SourceDone))) => {
                    this.live -= 1;
                    if this.live == 0 {
                        this.closed = true;
                        return Poll::Ready(None);
                    }
                }
                Poll::Ready(None) => {
                    this.closed = true;
                    return Poll::Ready(None);
                }
                Poll::Pending => return Poll::Pending,
            }
        }
    }
}

/// Merge `sources`, in declared order, into one stream of latest-value
/// tuples.
///
/// # Errors
///
/// Returns [`ScopeError::ArgumentFault`] synchronously if `sources` is empty.
pub fn merge_streams<S, T, E>(
    sources: Vec<S>,
) -> Result<MergeStream<T, E>, ScopeError<MergeSourceError<E>>>
where
    S: Stream<Item = Result<T, E>> + Send + 'static,
    T: Clone + Send + 'static,
    E: Send + 'static,
{
    if sources.is_empty() {
        return Err(ScopeError::ArgumentFault(
            "merge_streams requires at least one source".to_string(),
        ));
    }
    let n = sources.len();
    let (tx, rx) = mpsc::channel(n.max(1) * 4);
    for (index, source) in sources.into_iter().enumerate() {
        let tx = tx.clone();
        tokio::spawn(async move {
            futures::pin_mut!(source);
            while let Some(item) = source.next().await {
                if tx.send((index, Signal::Item(item))).await.is_err() {
                    return;
                }
            }
            let _ = tx.send((index, Signal::SourceDone)).await;
        });
    }
    drop(tx);
    Ok(MergeStream {
        rx,
        latest: vec![None; n],
        live: n,
        closed: false,
    })
}

/// Merge two streams of possibly-different value types (sharing one error
/// type) into a stream of latest-value pairs. Hand-written rather than
/// macro-generated for clarity; `merge3` follows the identical shape.
/// `merge4` through `merge10` follow it too, generated by the
/// [`impl_merge_n`] macro below rather than typed out by hand ten times over
/// (see `DESIGN.md`).
pub fn merge2<SA, SB, TA, TB, E>(
    a: SA,
    b: SB,
) -> impl Stream<Item = Result<(TA, TB), ScopeError<MergeSourceError<E>>>>
where
    SA: Stream<Item = Result<TA, E>> + Send + 'static,
    SB: Stream<Item = Result<TB, E>> + Send + 'static,
    TA: Clone + Send + 'static,
    TB: Clone + Send + 'static,
    E: Send + 'static,
{
    let tagged_a = a.map(|item| match item {
        Ok(v) => Ok(Tagged2::A(v)),
        Err(e) => Err((0usize, e)),
    });
    let tagged_b = b.map(|item| match item {
        Ok(v) => Ok(Tagged2::B(v)),
        Err(e) => Err((1usize, e)),
    });
    merge_tagged(vec![tagged_a.boxed(), tagged_b.boxed()]).filter_map(move |result| {
        std::future::ready(match result {
            Ok(tuple) => match (&tuple[0], &tuple[1]) {
                (Tagged2::A(a), Tagged2::B(b)) => Some(Ok((a.clone(), b.clone()))),
                _ => None,
            },
            Err(e) => Some(Err(e)),
        })
    })
}

pub fn merge3<SA, SB, SC, TA, TB, TC, E>(
    a: SA,
    b: SB,
    c: SC,
) -> impl Stream<Item = Result<(TA, TB, TC), ScopeError<MergeSourceError<E>>>>
where
    SA: Stream<Item = Result<TA, E>> + Send + 'static,
    SB: Stream<Item = Result<TB, E>> + Send + 'static,
    SC: Stream<Item = Result<TC, E>> + Send + 'static,
    TA: Clone + Send + 'static,
    TB: Clone + Send + 'static,
    TC: Clone + Send + 'static,
    E: Send + 'static,
{
    let tagged_a = a.map(|item| match item {
        Ok(v) => Ok(Tagged3::A(v)),
        Err(e) => Err((0usize, e)),
    });
    let tagged_b = b.map(|item| match item {
        Ok(v) => Ok(Tagged3::B(v)),
        Err(e) => Err((1usize, e)),
    });
    let tagged_c = c.map(|item| match item {
        Ok(v) => Ok(Tagged3::C(v)),
        Err(e) => Err((2usize, e)),
    });
    merge_tagged(vec![tagged_a.boxed(), tagged_b.boxed(), tagged_c.boxed()]).filter_map(
        move |result| {
            std::future::ready(match result {
                Ok(tuple) => match (&tuple[0], &tuple[1], &tuple[2]) {
                    (Tagged3::A(a), Tagged3::B(b), Tagged3::C(c)) => {
                        Some(Ok((a.clone(), b.clone(), c.clone())))
                    }
                    _ => None,
                },
                Err(e) => Some(Err(e)),
            })
        },
    )
}

#[derive(Clone)]
enum Tagged2<TA, TB> {
    A(TA),
    B(TB),
}

#[derive(Clone)]
enum Tagged3<TA, TB, TC> {
    A(TA),
    B(TB),
    C(TC),
}

/// Generates a typed `mergeN` wrapper and its backing `TaggedN` sum type for
/// an arity beyond the hand-written `merge2`/`merge3`. Each arm of the
/// `where`/tagging/untagging boilerplate is identical across arities, so
/// `merge4..merge10` are spelled out once here instead of ten times by hand.
macro_rules! impl_merge_n {
    ($fn_name:ident, $tagged:ident, [$( ($var:ident, $variant:ident, $src:ident, $ty:ident, $idx:expr) ),+ $(,)?]) => {
        #[derive(Clone)]
        enum $tagged<$($ty),+> {
            $($variant($ty)),+
        }

        #[allow(clippy::too_many_arguments)]
        pub fn $fn_name<$($src,)+ $($ty,)+ E>(
            $($var: $src),+
        ) -> impl Stream<Item = Result<($($ty),+), ScopeError<MergeSourceError<E>>>>
        where
            $($src: Stream<Item = Result<$ty, E>> + Send + 'static,)+
            $($ty: Clone + Send + 'static,)+
            E: Send + 'static,
        {
            $(
                let $var = $var.map(|item| match item {
                    Ok(v) => Ok($tagged::$variant(v)),
                    Err(e) => Err(($idx, e)),
                });
            )+
            merge_tagged(vec![$($var.boxed()),+]).filter_map(move |result| {
                std::future::ready(match result {
                    Ok(tuple) => match ($(&tuple[$idx]),+) {
                        ($($tagged::$variant($var)),+) => Some(Ok(($($var.clone()),+))),
                        _ => None,
                    },
                    Err(e) => Some(Err(e)),
                })
            })
        }
    };
}

impl_merge_n!(
    merge4,
    Tagged4,
    [
        (a, A, SA, TA, 0usize),
        (b, B, SB, TB, 1usize),
        (c, C, SC, TC, 2usize),
        (d, D, SD, TD, 3usize),
    ]
);
impl_merge_n!(
    merge5,
    Tagged5,
    [
        (a, A, SA, TA, 0usize),
        (b, B, SB, TB, 1usize),
        (c, C, SC, TC, 2usize),
        (d, D, SD, TD, 3usize),
        (e, E2, SE, TE, 4usize),
    ]
);
impl_merge_n!(
    merge6,
    Tagged6,
    [
        (a, A, SA, TA, 0usize),
        (b, B, SB, TB, 1usize),
        (c, C, SC, TC, 2usize),
        (d, D, SD, TD, 3usize),
        (e, E2, SE, TE, 4usize),
        (f, F, SF, TF, 5usize),
    ]
);
impl_merge_n!(
    merge7,
    Tagged7,
    [
        (a, A, SA, TA, 0usize),
        (b, B, SB, TB, 1usize),
        (c, C, SC, TC, 2usize),
        (d, D, SD, TD, 3usize),
        (e, E2, SE, TE, 4usize),
        (f, F, SF, TF, 5usize),
        (g, G, SG, TG, 6usize),
    ]
);
impl_merge_n!(
    merge8,
    Tagged8,
    [
        (a, A, SA, TA, 0usize),
        (b, B, SB, TB, 1usize),
        (c, C, SC, TC, 2usize),
        (d, D, SD, TD, 3usize),
        (e, E2, SE, TE, 4usize),
        (f, F, SF, TF, 5usize),
        (g, G, SG, TG, 6usize),
        (h, H, SH, TH, 7usize),
    ]
);
impl_merge_n!(
    merge9,
    Tagged9,
    [
        (a, A, SA, TA, 0usize),
        (b, B, SB, TB, 1usize),
        (c, C, SC, TC, 2usize),
        (d, D, SD, TD, 3usize),
        (e, E2, SE, TE, 4usize),
        (f, F, SF, TF, 5usize),
        (g, G, SG, TG, 6usize),
        (h, H, SH, TH, 7usize),
        (i, I, SI, TI, 8usize),
    ]
);
impl_merge_n!(
    merge10,
    Tagged10,
    [
        (a, A, SA, TA, 0usize),
        (b, B, SB, TB, 1usize),
        (c, C, SC, TC, 2usize),
        (d, D, SD, TD, 3usize),
        (e, E2, SE, TE, 4usize),
        (f, F, SF, TF, 5usize),
        (g, G, SG, TG, 6usize),
        (h, H, SH, TH, 7usize),
        (i, I, SI, TI, 8usize),
        (j, J, SJ, TJ, 9usize),
    ]
);

/// Helper shared by the typed `mergeN` wrappers: each source is pre-tagged
/// into a common sum type before going through the same homogeneous
/// dynamic combiner `merge_streams` uses, then untagged by the caller.
fn merge_tagged<T, E>(
    sources: Vec<futures::stream::BoxStream<'static, Result<T, (usize, E)>>>,
) -> impl Stream<Item = Result<Vec<T>, ScopeError<MergeSourceError<E>>>>
where
    T: Clone + Send + 'static,
    E: Send + 'static,
{
    let retagged = sources.into_iter().map(|s| {
        s.map(|item| match item {
            Ok(v) => Ok(v),
            Err((_, e)) => Err(e),
        })
    });
    merge_streams(retagged.collect())
        .unwrap_or_else(|_| unreachable!("caller always supplies a non-empty source list"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::stream;

    #[tokio::test]
    async fn rejects_empty_source_list() {
        let result = merge_streams::<futures::stream::Empty<Result<i32, ()>>, i32, ()>(vec![]);
        assert!(matches!(result, Err(ScopeError::ArgumentFault(_))));
    }

    // Drives the combiner's poll logic directly against a hand-fed channel,
    // bypassing the per-source driving tasks `merge_streams` spawns, so the
    // interleaving of source events is exact rather than left to the
    // scheduler.
    type BareMergeChannel<T, E> = mpsc::Sender<(usize, Signal<T, E>)>;

    fn bare_merge<T: Clone, E>(n: usize) -> (BareMergeChannel<T, E>, MergeStream<T, E>) {
        let (tx, rx) = mpsc::channel(16);
        (
            tx,
            MergeStream {
                rx,
                latest: vec![None; n],
                live: n,
                closed: false,
            },
        )
    }

    #[tokio::test]
    async fn emits_latest_value_tuples_once_all_sources_have_spoken() {
        let (tx, merged) = bare_merge::<i32, ()>(2);
        futures::pin_mut!(merged);

        tx.send((0, Signal::Item(Ok(1)))).await.unwrap();
        tx.send((1, Signal::Item(Ok(21)))).await.unwrap();
        assert_eq!(merged.next().await.unwrap().unwrap(), vec![1, 21]);

        tx.send((0, Signal::Item(Ok(2)))).await.unwrap();
        assert_eq!(merged.next().await.unwrap().unwrap(), vec![2, 21]);

        tx.send((1, Signal::Item(Ok(22)))).await.unwrap();
        assert_eq!(merged.next().await.unwrap().unwrap(), vec![2, 22]);

        tx.send((0, Signal::Item(Ok(3)))).await.unwrap();
        assert_eq!(merged.next().await.unwrap().unwrap(), vec![3, 22]);

        tx.send((1, Signal::Item(Ok(23)))).await.unwrap();
        assert_eq!(merged.next().await.unwrap().unwrap(), vec![3, 23]);
    }

    #[tokio::test]
    async fn spawned_sources_eventually_settle_on_the_final_tuple() {
        let a = stream::iter(vec![Ok::<_, ()>(1), Ok(2), Ok(3)]);
        let b = stream::iter(vec![Ok::<_, ()>(21), Ok(22), Ok(23)]);
        let merged = merge_streams(vec![a.boxed(), b.boxed()]).unwrap();
        let out: Vec<_> = merged.collect().await;
        let out: Vec<Vec<i32>> = out.into_iter().map(Result::unwrap).collect();
        assert_eq!(out.last(), Some(&vec![3, 23]));
        assert!(!out.is_empty());
    }

    #[tokio::test]
    async fn source_error_is_wrapped_with_its_index() {
        let a = stream::iter(vec![Ok::<_, &str>(1)]);
        let b = stream::iter(vec![Err::<i32, _>("boom")]);
        let merged = merge_streams(vec![a.boxed(), b.boxed()]).unwrap();
        let out: Vec<_> = merged.collect().await;
        let err = out
            .into_iter()
            .find_map(Result::err)
            .expect("expected at least one error");
        match err {
            ScopeError::Source(MergeSourceError { index, error }) => {
                assert_eq!(index, 1);
                assert_eq!(error, "boom");
            }
            other => panic!("unexpected error variant: {other:?}"),
        }
    }

    #[tokio::test]
    async fn closes_when_last_active_source_completes() {
        let a = stream::iter(Vec::<Result<i32, ()>>::new());
        let b = stream::iter(vec![Ok::<_, ()>(1)]);
        let merged = merge_streams(vec![a.boxed(), b.boxed()]).unwrap();
        let out: Vec<_> = merged.collect().await;
        assert!(out.is_empty());
    }

    #[tokio::test]
    async fn merge2_produces_typed_pairs() {
        let a = stream::iter(vec![Ok::<_, ()>(1)]);
        let b = stream::iter(vec![Ok::<_, ()>("x")]);
        let out: Vec<_> = merge2(a, b).collect().await;
        assert_eq!(
            out.into_iter().map(Result::unwrap).collect::<Vec<_>>(),
            vec![(1, "x")]
        );
    }

    #[tokio::test]
    async fn merge4_produces_typed_quadruples() {
        let a = stream::iter(vec![Ok::<_, ()>(1)]);
        let b = stream::iter(vec![Ok::<_, ()>("x")]);
        let c = stream::iter(vec![Ok::<_, ()>(true)]);
        let d = stream::iter(vec![Ok::<_, ()>(2.5f64)]);
        let out: Vec<_> = merge4(a, b, c, d).collect().await;
        assert_eq!(
            out.into_iter().map(Result::unwrap).collect::<Vec<_>>(),
            vec![(1, "x", true, 2.5)]
        );
    }

    #[tokio::test]
    async fn merge10_produces_typed_tuples_of_ten() {
        let mut streams = (0..10).map(|n| stream::iter(vec![Ok::<_, ()>(n)]));
        let mut next_stream = move || streams.next().expect("ten streams");
        let out: Vec<_> = merge10(
            next_stream(),
            next_stream(),
            next_stream(),
            next_stream(),
            next_stream(),
            next_stream(),
            next_stream(),
            next_stream(),
            next_stream(),
            next_stream(),
        )
        .collect()
        .await;
        assert_eq!(
            out.into_iter().map(Result::unwrap).collect::<Vec<_>>(),
            vec![(0, 1, 2, 3, 4, 5, 6, 7, 8, 9)]
        );
    }
}
