//! Promises built from a collection of other promises.
//!
//! Each combinator registers one reaction per input and settles its result
//! through a shared resolver. Settlement is idempotent, so inputs that settle
//! after the combinator has decided are simply ignored.
//!
use crate::event_loop::Handle;
use crate::lock;
use crate::promise::{Promise, Status};
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex};

/// How one input of [`all_settled`] ended.
///
/// Serializes as `{"status": "fulfilled", "value": ..}` or
/// `{"status": "rejected", "reason": ..}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "lowercase")]
pub enum Outcome<T, E> {
    Fulfilled { value: T },
    Rejected { reason: E },
}

impl<T, E> Outcome<T, E> {
    pub fn status(&self) -> Status {
        match self {
            Outcome::Fulfilled { .. } => Status::Fulfilled,
            Outcome::Rejected { .. } => Status::Rejected,
        }
    }

    pub fn into_result(self) -> Result<T, E> {
        match self {
            Outcome::Fulfilled { value } => Ok(value),
            Outcome::Rejected { reason } => Err(reason),
        }
    }
}

impl<T, E> From<Result<T, E>> for Outcome<T, E> {
    fn from(result: Result<T, E>) -> Self {
        match result {
            Ok(value) => Outcome::Fulfilled { value },
            Err(reason) => Outcome::Rejected { reason },
        }
    }
}

struct Gather<T> {
    slots: Vec<Option<T>>,
    remaining: usize,
}

impl<T> Gather<T> {
    fn new(len: usize) -> Arc<Mutex<Self>> {
        Arc::new(Mutex::new(Gather {
            slots: (0..len).map(|_| None).collect(),
            remaining: len,
        }))
    }

    /// Fill `index`, handing back every slot once the last one is in.
    fn fill(&mut self, index: usize, item: T) -> Option<Vec<T>> {
        if self.slots[index].replace(item).is_none() {
            self.remaining -= 1;
        }
        if self.remaining > 0 {
            return None;
        }
        Some(self.slots.drain(..).flatten().collect())
    }
}

/// Fulfill with every input's value, in input order, or reject with the
/// first rejection to settle.
///
/// An empty input fulfills right away with an empty `Vec`.
///
/// # Examples
///
/// ```
/// use deferred::{all, EventLoop, Promise};
///
/// let mut event_loop = EventLoop::new();
/// let handle = event_loop.handle();
/// let both = all(&handle, vec![
///     Promise::<i32, String>::resolved(&handle, 1),
///     Promise::resolved(&handle, 2),
/// ]);
/// assert_eq!(event_loop.block_on(both).unwrap(), Ok(vec![1, 2]));
/// ```
pub fn all<T, E, I>(handle: &Handle, promises: I) -> Promise<Vec<T>, E>
where
    T: Clone + Send + 'static,
    E: Clone + Send + 'static,
    I: IntoIterator<Item = Promise<T, E>>,
{
    let promises: Vec<_> = promises.into_iter().collect();
    let (combined, resolver) = Promise::pending(handle);
    if promises.is_empty() {
        resolver.resolve(Vec::new());
        return combined;
    }
    let gather = Gather::new(promises.len());
    for (index, promise) in promises.into_iter().enumerate() {
        let gather = gather.clone();
        let resolver = resolver.clone();
        promise.add_reaction(Box::new(move |outcome| match outcome {
            Ok(value) => {
                let values = lock(&gather).fill(index, value);
                if let Some(values) = values {
                    resolver.resolve(values);
                }
            }
            Err(reason) => resolver.reject(reason),
        }));
    }
    combined
}

/// Fulfill once every input has settled, with one [`Outcome`] per input.
///
/// Never rejects.
pub fn all_settled<T, E, I>(handle: &Handle, promises: I) -> Promise<Vec<Outcome<T, E>>, E>
where
    T: Clone + Send + 'static,
    E: Clone + Send + 'static,
    I: IntoIterator<Item = Promise<T, E>>,
{
    let promises: Vec<_> = promises.into_iter().collect();
    let (combined, resolver) = Promise::pending(handle);
    if promises.is_empty() {
        resolver.resolve(Vec::new());
        return combined;
    }
    let gather = Gather::new(promises.len());
    for (index, promise) in promises.into_iter().enumerate() {
        let gather = gather.clone();
        let resolver = resolver.clone();
        promise.add_reaction(Box::new(move |outcome| {
            let outcomes = lock(&gather).fill(index, Outcome::from(outcome));
            if let Some(outcomes) = outcomes {
                resolver.resolve(outcomes);
            }
        }));
    }
    combined
}

/// Settle the way the first input to settle does.
///
/// An empty input never settles.
pub fn race<T, E, I>(handle: &Handle, promises: I) -> Promise<T, E>
where
    T: Clone + Send + 'static,
    E: Clone + Send + 'static,
    I: IntoIterator<Item = Promise<T, E>>,
{
    let (combined, resolver) = Promise::pending(handle);
    for promise in promises {
        let resolver = resolver.clone();
        promise.add_reaction(Box::new(move |outcome| match outcome {
            Ok(value) => resolver.resolve(value),
            Err(reason) => resolver.reject(reason),
        }));
    }
    combined
}
