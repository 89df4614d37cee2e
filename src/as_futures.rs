//! Turn a stream of results into a stream of per-event completions, so a
//! consumer can handle each event's error locally instead of the error
//! ending iteration.
//!
//! A plain `Stream<Item = Result<T, E>>` does not, by itself, stop at the
//! first `Err` the way `try_for_each`/`try_collect` do, but those
//! short-circuiting combinators are exactly the ones most Rust code reaches
//! for over a `TryStream`. [`Completion`] exists to make the
//! "keep-going-regardless" contract explicit and resistant to an accidental
//! `?`, rather than to work around a language limitation the way the source
//! system's adapter does. Implemented as a specialised
//! [`crate::lifecycle::LifecycleTransformer`], matching the source design's
//! positioning of this adapter as a transformer subclass.
use futures::Stream;

use crate::lifecycle::{LifecycleStream, LifecycleStreamExt, LifecycleTransformer};

/// One source event, already settled: either the value it produced, or the
/// error it failed with.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Completion<T, E> {
    Resolved(T),
    Rejected(E),
}

impl<T, E> Completion<T, E> {
    /// # Errors
    ///
    /// Returns the wrapped error if this completion is [`Completion::Rejected`].
    pub fn into_result(self) -> Result<T, E> {
        match self {
            Completion::Resolved(value) => Ok(value),
            Completion::Rejected(error) => Err(error),
        }
    }

    pub fn is_resolved(&self) -> bool {
        matches!(self, Completion::Resolved(_))
    }
}

pub struct AsFutures;

impl<T, E> LifecycleTransformer<Result<T, E>> for AsFutures {
    type Output = Completion<T, E>;

    fn on_source_data(&mut self, item: Result<T, E>) -> Vec<Self::Output> {
        vec![match item {
            Ok(value) => Completion::Resolved(value),
            Err(error) => Completion::Rejected(error),
        }]
    }
}

/// Installs [`as_futures`](AsFuturesExt::as_futures) on any
/// `Stream<Item = Result<T, E>>`.
pub trait AsFuturesExt<T, E>: Stream<Item = Result<T, E>> + Sized {
    #[allow(clippy::wrong_self_convention)]
    fn as_futures(self) -> LifecycleStream<Self, AsFutures> {
        self.transform(AsFutures)
    }
}

impl<S, T, E> AsFuturesExt<T, E> for S where S: Stream<Item = Result<T, E>> {}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::{stream, StreamExt};

    #[tokio::test]
    async fn each_event_becomes_its_own_completion_and_iteration_continues_past_errors() {
        let source = stream::iter(vec![Ok(1), Err("e"), Ok(2)]);
        let completions: Vec<_> = source.as_futures().collect().await;

        assert_eq!(completions.len(), 3);
        let mut resolved = Vec::new();
        let mut rejected = Vec::new();
        for completion in completions {
            match completion.into_result() {
                Ok(v) => resolved.push(v),
                Err(e) => rejected.push(e),
            }
        }
        assert_eq!(resolved, vec![1, 2]);
        assert_eq!(rejected, vec!["e"]);
    }
}
