//! The deferred value container and its settlement capability.
//!
//! A [`Promise`] is the consumer side: it can be inspected, chained and
//! awaited, and may be cloned freely. A [`Resolver`] is the producer side:
//! it settles the promise, and may be cloned and sent to other threads.
//! Dropping the last resolver of a pending promise abandons it: it stays
//! pending forever and its queued reactions are released.
//!
use crate::event_loop::{Handle, Job};
use crate::lock;
use crate::resolution::{Resolution, Thenable};
use crate::Error;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll, Waker};
use tracing::{debug, trace, warn};

/// The settlement status of a [`Promise`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Status {
    Pending,
    Fulfilled,
    Rejected,
}

/// A boxed reaction handler, as taken by [`Promise::register_reaction`].
pub type Handler<A, T, E> = Box<dyn FnOnce(A) -> Resolution<T, E> + Send + 'static>;

pub(crate) type Reaction<T, E> = Box<dyn FnOnce(Result<T, E>) + Send + 'static>;

enum State<T, E> {
    Pending,
    Fulfilled(T),
    Rejected(E),
}

struct Inner<T, E> {
    state: State<T, E>,
    reactions: Vec<Reaction<T, E>>,
    wakers: Vec<Waker>,
    /// Live resolvers of the current epoch.
    resolvers: usize,
    /// Bumped on every adoption; resolvers from an older epoch are spent.
    epoch: u64,
    /// Counted in the loop's live promises.
    tracked: bool,
}

/// A value that settles once, fulfilled with `T` or rejected with `E`.
pub struct Promise<T, E> {
    inner: Arc<Mutex<Inner<T, E>>>,
    handle: Handle,
}

/// The capability to settle one [`Promise`].
///
/// All clones share the promise. The first settlement wins and every later
/// call is a no-op. After [`adopt`](Resolver::adopt), only the adopted
/// thenable can settle the promise.
pub struct Resolver<T, E> {
    promise: Promise<T, E>,
    epoch: u64,
}

impl<T, E> Clone for Promise<T, E> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
            handle: self.handle.clone(),
        }
    }
}

impl<T, E> Promise<T, E> {
    fn with_state(handle: &Handle, state: State<T, E>, resolvers: usize) -> Self {
        let tracked = resolvers > 0;
        if tracked {
            handle.track_pending();
        }
        Self {
            inner: Arc::new(Mutex::new(Inner {
                state,
                reactions: Vec::new(),
                wakers: Vec::new(),
                resolvers,
                epoch: 0,
                tracked,
            })),
            handle: handle.clone(),
        }
    }

    pub fn status(&self) -> Status {
        match lock(&self.inner).state {
            State::Pending => Status::Pending,
            State::Fulfilled(_) => Status::Fulfilled,
            State::Rejected(_) => Status::Rejected,
        }
    }

    pub fn is_pending(&self) -> bool {
        self.status() == Status::Pending
    }

    /// The loop this promise schedules its reactions on.
    pub fn handle(&self) -> &Handle {
        &self.handle
    }

    fn address(&self) -> usize {
        Arc::as_ptr(&self.inner) as *const () as usize
    }
}

impl<T, E> Promise<T, E>
where
    T: Clone + Send + 'static,
    E: Clone + Send + 'static,
{
    /// Create a promise and run `executor` on it right away.
    ///
    /// The executor receives the promise's resolver and may keep clones of it
    /// for later. Returning `Err(reason)` rejects the promise, unless it was
    /// already settled.
    ///
    /// # Examples
    ///
    /// ```
    /// use deferred::{EventLoop, Promise, Status};
    ///
    /// let event_loop = EventLoop::new();
    /// let failed = Promise::<(), &str>::new(&event_loop.handle(), |_resolver| Err("boom"));
    /// assert_eq!(failed.status(), Status::Rejected);
    /// assert_eq!(failed.reason(), Some("boom"));
    /// ```
    pub fn new<F>(handle: &Handle, executor: F) -> Self
    where
        F: FnOnce(Resolver<T, E>) -> Result<(), E>,
    {
        let (promise, resolver) = Self::pending(handle);
        if let Err(reason) = executor(resolver.clone()) {
            resolver.reject(reason);
        }
        promise
    }

    /// A pending promise together with its resolver.
    pub fn pending(handle: &Handle) -> (Self, Resolver<T, E>) {
        let promise = Self::with_state(handle, State::Pending, 1);
        let resolver = Resolver {
            promise: promise.clone(),
            epoch: 0,
        };
        (promise, resolver)
    }

    /// An already fulfilled promise.
    pub fn resolved(handle: &Handle, value: T) -> Self {
        Self::with_state(handle, State::Fulfilled(value), 0)
    }

    /// An already rejected promise. The reason is stored as is.
    pub fn rejected(handle: &Handle, reason: E) -> Self {
        Self::with_state(handle, State::Rejected(reason), 0)
    }

    /// A promise resolved with `resolution`, adopting it if it is a thenable.
    pub fn resolve_with(handle: &Handle, resolution: Resolution<T, E>) -> Self {
        match resolution {
            Resolution::Fulfill(value) => Self::resolved(handle, value),
            Resolution::Reject(reason) => Self::rejected(handle, reason),
            adopt @ Resolution::Adopt(_) => {
                let (promise, resolver) = Self::pending(handle);
                resolver.resolve_with(adopt);
                promise
            }
        }
    }

    /// The fulfillment value, once fulfilled.
    pub fn value(&self) -> Option<T> {
        match &lock(&self.inner).state {
            State::Fulfilled(value) => Some(value.clone()),
            _ => None,
        }
    }

    /// The rejection reason, once rejected.
    pub fn reason(&self) -> Option<E> {
        match &lock(&self.inner).state {
            State::Rejected(reason) => Some(reason.clone()),
            _ => None,
        }
    }

    /// Register `reaction` to receive the settlement in a microtask.
    ///
    /// On an abandoned promise the reaction is dropped right away, which in
    /// turn abandons whatever it would have settled.
    pub(crate) fn add_reaction(&self, reaction: Reaction<T, E>) {
        let settled = {
            let mut inner = lock(&self.inner);
            match &inner.state {
                State::Pending if inner.resolvers == 0 => None,
                State::Pending => {
                    inner.reactions.push(reaction);
                    return;
                }
                State::Fulfilled(value) => Some(Ok(value.clone())),
                State::Rejected(reason) => Some(Err(reason.clone())),
            }
        };
        match settled {
            Some(outcome) => self
                .handle
                .enqueue(std::iter::once(Box::new(move || reaction(outcome)) as Job)),
            None => trace!("reaction dropped, promise was abandoned"),
        }
    }

    fn chain<U, F>(&self, callback: F) -> Promise<U, E>
    where
        U: Clone + Send + 'static,
        F: FnOnce(Result<T, E>) -> Resolution<U, E> + Send + 'static,
    {
        let (downstream, resolver) = Promise::pending(&self.handle);
        self.add_reaction(Box::new(move |outcome| {
            resolver.resolve_with(callback(outcome))
        }));
        downstream
    }

    /// Register an optional handler per settlement and get the chained promise.
    ///
    /// A missing handler passes its settlement through to the returned
    /// promise unchanged.
    pub fn register_reaction(
        &self,
        on_fulfilled: Option<Handler<T, T, E>>,
        on_rejected: Option<Handler<E, T, E>>,
    ) -> Promise<T, E> {
        self.chain(move |outcome| match (outcome, on_fulfilled, on_rejected) {
            (Ok(value), Some(handler), _) => handler(value),
            (Ok(value), None, _) => Resolution::Fulfill(value),
            (Err(reason), _, Some(handler)) => handler(reason),
            (Err(reason), _, None) => Resolution::Reject(reason),
        })
    }

    /// Shorthand for `register_reaction(None, Some(on_rejected))`.
    pub fn register_rejection_reaction<R>(&self, on_rejected: R) -> Promise<T, E>
    where
        R: FnOnce(E) -> Resolution<T, E> + Send + 'static,
    {
        self.register_reaction(None, Some(Box::new(on_rejected)))
    }

    /// Map the fulfillment value. Rejections pass through.
    pub fn then<U, F>(&self, on_fulfilled: F) -> Promise<U, E>
    where
        U: Clone + Send + 'static,
        F: FnOnce(T) -> Result<U, E> + Send + 'static,
    {
        self.chain(move |outcome| match outcome {
            Ok(value) => on_fulfilled(value).into(),
            Err(reason) => Resolution::Reject(reason),
        })
    }

    /// Like [`then`](Promise::then), but the handler may hand back a promise to adopt.
    pub fn and_then<U, F>(&self, on_fulfilled: F) -> Promise<U, E>
    where
        U: Clone + Send + 'static,
        F: FnOnce(T) -> Resolution<U, E> + Send + 'static,
    {
        self.chain(move |outcome| match outcome {
            Ok(value) => on_fulfilled(value),
            Err(reason) => Resolution::Reject(reason),
        })
    }

    /// Handle both settlements, each handler deciding the chained promise.
    pub fn then_or_else<U, F, R>(&self, on_fulfilled: F, on_rejected: R) -> Promise<U, E>
    where
        U: Clone + Send + 'static,
        F: FnOnce(T) -> Resolution<U, E> + Send + 'static,
        R: FnOnce(E) -> Resolution<U, E> + Send + 'static,
    {
        self.chain(move |outcome| match outcome {
            Ok(value) => on_fulfilled(value),
            Err(reason) => on_rejected(reason),
        })
    }

    /// Recover from a rejection. Fulfillments pass through.
    pub fn catch<R>(&self, on_rejected: R) -> Promise<T, E>
    where
        R: FnOnce(E) -> Result<T, E> + Send + 'static,
    {
        self.chain(move |outcome| match outcome {
            Ok(value) => Resolution::Fulfill(value),
            Err(reason) => on_rejected(reason).into(),
        })
    }

    /// Run `on_settled` on either settlement, passing the settlement through.
    pub fn finally<F>(&self, on_settled: F) -> Promise<T, E>
    where
        F: FnOnce() + Send + 'static,
    {
        self.chain(move |outcome| {
            on_settled();
            outcome.into()
        })
    }
}

impl<T, E> Thenable<T, E> for Promise<T, E>
where
    T: Clone + Send + 'static,
    E: Clone + Send + 'static,
{
    fn subscribe(self: Box<Self>, resolver: Resolver<T, E>) {
        self.add_reaction(Box::new(move |outcome| match outcome {
            Ok(value) => resolver.resolve(value),
            Err(reason) => resolver.reject(reason),
        }));
    }

    fn identity(&self) -> Option<usize> {
        Some(self.address())
    }
}

impl<T: Clone, E: Clone> Future for Promise<T, E> {
    type Output = Result<T, E>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let mut inner = lock(&self.inner);
        match &inner.state {
            State::Fulfilled(value) => Poll::Ready(Ok(value.clone())),
            State::Rejected(reason) => Poll::Ready(Err(reason.clone())),
            State::Pending => {
                if !inner.wakers.iter().any(|waker| waker.will_wake(cx.waker())) {
                    inner.wakers.push(cx.waker().clone());
                }
                Poll::Pending
            }
        }
    }
}

impl<T, E> fmt::Debug for Promise<T, E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Promise")
            .field("status", &self.status())
            .finish()
    }
}

impl<T, E> Resolver<T, E>
where
    T: Clone + Send + 'static,
    E: Clone + Send + 'static,
{
    /// Fulfill the promise with `value`.
    pub fn resolve(&self, value: T) {
        self.settle(Ok(value));
    }

    /// Reject the promise with `reason`.
    pub fn reject(&self, reason: E) {
        self.settle(Err(reason));
    }

    /// Settle the promise the way `thenable` settles.
    ///
    /// Fails with [`Error::SelfResolution`] when `thenable` is this very
    /// promise, leaving the promise untouched.
    pub fn adopt<Th>(&self, thenable: Th) -> Result<(), Error>
    where
        Th: Thenable<T, E> + 'static,
    {
        self.adopt_boxed(Box::new(thenable))
    }

    pub fn resolve_with(&self, resolution: Resolution<T, E>) {
        match resolution {
            Resolution::Fulfill(value) => self.resolve(value),
            Resolution::Reject(reason) => self.reject(reason),
            Resolution::Adopt(thenable) => {
                if let Err(err) = self.adopt_boxed(thenable) {
                    warn!(%err, "promise abandoned in a resolution cycle");
                }
            }
        }
    }

    /// The promise this resolver settles.
    pub fn promise(&self) -> Promise<T, E> {
        self.promise.clone()
    }

    fn adopt_boxed(&self, thenable: Box<dyn Thenable<T, E>>) -> Result<(), Error> {
        let follower = {
            let mut inner = lock(&self.promise.inner);
            if !matches!(inner.state, State::Pending) || inner.epoch != self.epoch {
                trace!("adoption ignored, promise already resolved");
                return Ok(());
            }
            if thenable.identity() == Some(self.promise.address()) {
                return Err(Error::SelfResolution);
            }
            // older resolvers are spent, only the follower can settle now
            inner.epoch += 1;
            inner.resolvers = 1;
            Resolver {
                promise: self.promise.clone(),
                epoch: inner.epoch,
            }
        };
        trace!("adopting thenable");
        self.promise
            .handle
            .enqueue(std::iter::once(Box::new(move || thenable.subscribe(follower)) as Job));
        Ok(())
    }

    fn settle(&self, outcome: Result<T, E>) {
        let (reactions, wakers, untrack) = {
            let mut inner = lock(&self.promise.inner);
            if !matches!(inner.state, State::Pending) || inner.epoch != self.epoch {
                trace!("settlement ignored, promise already resolved");
                return;
            }
            inner.state = match &outcome {
                Ok(value) => State::Fulfilled(value.clone()),
                Err(reason) => State::Rejected(reason.clone()),
            };
            if outcome.is_err() && inner.reactions.is_empty() && inner.wakers.is_empty() {
                debug!("promise rejected with nothing observing it");
            }
            (
                std::mem::take(&mut inner.reactions),
                std::mem::take(&mut inner.wakers),
                std::mem::replace(&mut inner.tracked, false),
            )
        };
        trace!(
            fulfilled = outcome.is_ok(),
            reactions = reactions.len(),
            "promise settled"
        );
        self.promise.handle.enqueue(reactions.into_iter().map(|reaction| {
            let outcome = outcome.clone();
            Box::new(move || reaction(outcome)) as Job
        }));
        for waker in wakers {
            waker.wake();
        }
        // last, so a loop that sees the count drop also sees the queued work
        if untrack {
            self.promise.handle.untrack_pending();
        }
    }
}

impl<T, E> Clone for Resolver<T, E> {
    fn clone(&self) -> Self {
        let mut inner = lock(&self.promise.inner);
        if inner.epoch == self.epoch {
            inner.resolvers += 1;
        }
        drop(inner);
        Self {
            promise: self.promise.clone(),
            epoch: self.epoch,
        }
    }
}

impl<T, E> Drop for Resolver<T, E> {
    /// If this was the last resolver of a pending promise, abandon it.
    fn drop(&mut self) {
        let (reactions, wakers) = {
            let mut inner = lock(&self.promise.inner);
            if inner.epoch != self.epoch {
                return;
            }
            inner.resolvers -= 1;
            if inner.resolvers > 0 || !matches!(inner.state, State::Pending) {
                return;
            }
            if !std::mem::replace(&mut inner.tracked, false) {
                return;
            }
            (
                std::mem::take(&mut inner.reactions),
                std::mem::take(&mut inner.wakers),
            )
        };
        trace!(released = reactions.len(), "last resolver dropped, promise abandoned");
        self.promise.handle.untrack_pending();
        // releasing the reactions drops their resolvers in turn
        drop(reactions);
        drop(wakers);
    }
}

impl<T, E> fmt::Debug for Resolver<T, E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Resolver")
            .field("promise", &self.promise)
            .field("epoch", &self.epoch)
            .finish()
    }
}
