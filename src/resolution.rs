use crate::promise::{Promise, Resolver};
use std::fmt;

/// Anything a promise can be resolved *with* besides a plain value.
///
/// Adopting a thenable flattens it: the adopting promise settles the way the
/// thenable tells its resolver to, instead of fulfilling with the thenable
/// itself. `subscribe` runs in its own microtask.
pub trait Thenable<T, E>: Send {
    fn subscribe(self: Box<Self>, resolver: Resolver<T, E>);

    /// Address of the promise behind this thenable, used to refuse adopting oneself.
    #[doc(hidden)]
    fn identity(&self) -> Option<usize> {
        None
    }
}

/// A thenable backed by a closure. See [`from_fn`].
pub struct FromFn<F>(F);

/// Wrap a closure that receives the adopting promise's resolver.
///
/// # Examples
///
/// ```
/// use deferred::{from_fn, EventLoop, Promise, Resolution};
///
/// let mut event_loop = EventLoop::new();
/// let handle = event_loop.handle();
/// let thenable = from_fn(|resolver: deferred::Resolver<i32, ()>| resolver.resolve(7));
/// let promise = Promise::resolve_with(&handle, Resolution::adopt(thenable));
/// assert_eq!(event_loop.block_on(promise).unwrap(), Ok(7));
/// ```
pub fn from_fn<F>(subscribe: F) -> FromFn<F> {
    FromFn(subscribe)
}

impl<T, E, F> Thenable<T, E> for FromFn<F>
where
    F: FnOnce(Resolver<T, E>) + Send,
{
    fn subscribe(self: Box<Self>, resolver: Resolver<T, E>) {
        (self.0)(resolver)
    }
}

/// What a handler, or a call to [`Resolver::resolve_with`], settles a promise with.
pub enum Resolution<T, E> {
    Fulfill(T),
    Reject(E),
    Adopt(Box<dyn Thenable<T, E>>),
}

impl<T, E> Resolution<T, E> {
    pub fn adopt<Th>(thenable: Th) -> Self
    where
        Th: Thenable<T, E> + 'static,
    {
        Resolution::Adopt(Box::new(thenable))
    }
}

impl<T, E> From<Result<T, E>> for Resolution<T, E> {
    fn from(result: Result<T, E>) -> Self {
        match result {
            Ok(value) => Resolution::Fulfill(value),
            Err(reason) => Resolution::Reject(reason),
        }
    }
}

impl<T, E> From<Promise<T, E>> for Resolution<T, E>
where
    T: Clone + Send + 'static,
    E: Clone + Send + 'static,
{
    fn from(promise: Promise<T, E>) -> Self {
        Resolution::Adopt(Box::new(promise))
    }
}

impl<T: fmt::Debug, E: fmt::Debug> fmt::Debug for Resolution<T, E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Resolution::Fulfill(value) => f.debug_tuple("Fulfill").field(value).finish(),
            Resolution::Reject(reason) => f.debug_tuple("Reject").field(reason).finish(),
            Resolution::Adopt(_) => f.write_str("Adopt(..)"),
        }
    }
}
