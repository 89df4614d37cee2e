#![deny(clippy::all)]
#![deny(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

//! Structured concurrency: scopes that cancel bound futures and streams as
//! one unit.
//!
//! A [`scope::Scope`] owns a set of bound task handles. Cancelling the scope
//! cancels every one of them, synchronously and as one unit, regardless of
//! whether they are one-shot computations ([`scope::BoundComputation`]) or
//! event streams ([`bound::BoundSequence`]). [`lifecycle::LifecycleTransformer`]
//! is the extensibility seam used to build both of those on top of, along
//! with [`merge::merge_streams`] and [`as_futures::AsFuturesExt`].

pub mod as_futures;
pub mod bound;
pub mod bridge;
pub mod cancel_filter;
pub mod error;
pub mod lifecycle;
pub mod merge;
pub mod scope;

pub use as_futures::{AsFuturesExt, Completion};
pub use bound::{BoundSequence, BoundSequenceStream};
pub use cancel_filter::{catch_all_cancellations, catch_cancellations_matching};
pub use error::{MergeSourceError, ScopeError, ScopeId};
pub use lifecycle::{
    broadcast, Identity, LifecycleStream, LifecycleStreamExt, LifecycleTransformer,
};
pub use merge::{merge2, merge3, merge_streams, MergeStream};
pub use scope::{BoundComputation, CancelListener, Scope};
