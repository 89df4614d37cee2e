//! "Try/catch for cancellation": absorb a [`ScopeError::Cancelled`] matching
//! a predicate, let everything else through unchanged.
//!
//! In the source system this wraps the block in a guarded dynamic execution
//! context with an uncaught-error hook, because cancellation there can
//! surface either as the block's own return value or as an out-of-band
//! uncaught exception. Here cancellation is always delivered as an ordinary
//! [`Result::Err`] (see [`crate::scope::BoundComputation`] and
//! [`crate::bound::BoundSequence`]), so there is no separate uncaught-error
//! channel to guard: filtering reduces to matching on the block's own
//! `Result`, which is the idiomatic Rust realisation of the same contract.
use crate::error::{ScopeError, ScopeId};
use std::future::Future;

/// Run `block`; if it fails with a cancellation whose scope satisfies
/// `predicate`, return `Ok(None)` instead of propagating the error. Any
/// other outcome (success, or a non-matching error) passes through.
///
/// # Errors
///
/// Returns `block`'s error unchanged if it fails with anything other than a
/// cancellation matching `predicate`.
pub async fn catch_cancellations_matching<T, E, Fut, P>(
    block: Fut,
    predicate: P,
) -> Result<Option<T>, ScopeError<E>>
where
    Fut: Future<Output = Result<T, ScopeError<E>>>,
    P: Fn(ScopeId) -> bool,
{
    match block.await {
        Ok(value) => Ok(Some(value)),
        Err(ScopeError::Cancelled { scope }) if predicate(scope) => Ok(None),
        Err(other) => Err(other),
    }
}

/// Run `block`, absorbing a cancellation from *any* scope.
///
/// # Errors
///
/// Returns `block`'s error unchanged if it fails with anything other than a
/// cancellation.
pub async fn catch_all_cancellations<T, E, Fut>(block: Fut) -> Result<Option<T>, ScopeError<E>>
where
    Fut: Future<Output = Result<T, ScopeError<E>>>,
{
    catch_cancellations_matching(block, |_| true).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scope::Scope;

    #[tokio::test]
    async fn absorbs_matching_cancellation() {
        let scope = Scope::new();
        let bound = scope.bind_computation(async {
            tokio::time::sleep(std::time::Duration::from_secs(3600)).await;
        });
        scope.cancel_all();
        let result = scope.catch_cancellations(bound).await.unwrap();
        assert!(result.is_none());
    }

    #[tokio::test]
    async fn rethrows_foreign_scope_cancellation() {
        let s1 = Scope::new();
        let s2 = Scope::new();
        let bound = s2.bind_computation(async {
            tokio::time::sleep(std::time::Duration::from_secs(3600)).await;
        });
        s2.cancel_all();
        let err = s1.catch_cancellations(bound).await.unwrap_err();
        assert_eq!(err.cancelling_scope(), Some(s2.id()));
    }

    #[tokio::test]
    async fn catch_all_absorbs_any_scope() {
        let s2 = Scope::new();
        let bound = s2.bind_computation(async {
            tokio::time::sleep(std::time::Duration::from_secs(3600)).await;
        });
        s2.cancel_all();
        let result = catch_all_cancellations(bound).await.unwrap();
        assert!(result.is_none());
    }
}
