//! Result distribution strategies.
//!
//! A strategy maps the aggregate value returned by the downstream operation
//! and a caller's index to that caller's own value:
//!
//! - [`Unpack`]: the aggregate is a `Vec` aligned 1:1 with the group's items,
//!   each caller receives its own element.
//! - [`Broadcast`]: every caller receives a clone of the whole aggregate.
//! - [`FnStrategy`]: any pure function `(aggregate, index) -> Option<value>`.
//!
//! Returning `None` means the aggregate has no slice for that index; the
//! caller then fails with `BatchError::MissingResult`.

use std::marker::PhantomData;

/// Maps an aggregate result to one caller's value
pub trait DistributionStrategy<R>: Send + Sync {
    /// Value handed to each caller
    type Output;

    /// Project the caller at `index` out of `aggregate`
    fn distribute(&self, aggregate: &R, index: usize) -> Option<Self::Output>;
}

/// Each caller receives the element at its own index
#[derive(Debug, Clone, Copy, Default)]
pub struct Unpack;

impl<T: Clone> DistributionStrategy<Vec<T>> for Unpack {
    type Output = T;

    fn distribute(&self, aggregate: &Vec<T>, index: usize) -> Option<T> {
        aggregate.get(index).cloned()
    }
}

/// Every caller receives the whole aggregate
#[derive(Debug, Clone, Copy, Default)]
pub struct Broadcast;

impl<R: Clone> DistributionStrategy<R> for Broadcast {
    type Output = R;

    fn distribute(&self, aggregate: &R, _index: usize) -> Option<R> {
        Some(aggregate.clone())
    }
}

/// Strategy backed by a closure
pub struct FnStrategy<F, T> {
    f: F,
    _output: PhantomData<fn() -> T>,
}

impl<F, T> FnStrategy<F, T> {
    pub fn new(f: F) -> Self {
        Self {
            f,
            _output: PhantomData,
        }
    }
}

impl<R, T, F> DistributionStrategy<R> for FnStrategy<F, T>
where
    F: Fn(&R, usize) -> Option<T> + Send + Sync,
{
    type Output = T;

    fn distribute(&self, aggregate: &R, index: usize) -> Option<T> {
        (self.f)(aggregate, index)
    }
}
