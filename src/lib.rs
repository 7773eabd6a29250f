//! Promise-style deferred values for rust.
//!
//! A [`Promise`] starts out pending and settles exactly once, either
//! fulfilled with a value or rejected with a reason. Reactions registered
//! with [`Promise::then`] and friends never run on the stack that registered
//! or settled them: they are queued as microtasks on an [`EventLoop`] and run
//! at its next checkpoint, ahead of any timer.
//!
//! # Examples
//!
//! ```
//! use deferred::{EventLoop, Promise};
//! use std::time::Duration;
//!
//! let mut event_loop = EventLoop::new();
//! let handle = event_loop.handle();
//!
//! // the executor runs before `new` returns
//! let timer = handle.clone();
//! let promise = Promise::<u32, String>::new(&handle, move |resolver| {
//!     timer.set_timeout(Duration::from_millis(10), move || resolver.resolve(1));
//!     Ok(())
//! });
//!
//! let doubled = promise.then(|count| Ok(count * 2));
//! assert_eq!(event_loop.block_on(doubled).unwrap(), Ok(2));
//! ```
//!
pub mod combinators;
pub mod config;
pub mod event_loop;
pub mod promise;
pub mod resolution;

pub use combinators::{all, all_settled, race, Outcome};
pub use config::LoopConfig;
pub use event_loop::{EventLoop, Handle, TimerId};
pub use promise::{Handler, Promise, Resolver, Status};
pub use resolution::{from_fn, FromFn, Resolution, Thenable};

use std::sync::{Mutex, MutexGuard, PoisonError};

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("a promise cannot adopt itself")]
    SelfResolution,
    #[error("more than {0} microtasks in a single checkpoint")]
    MicrotaskBudgetExceeded(usize),
    #[error("the event loop has nothing left that could complete the future")]
    Stalled,
}

/// State behind our mutexes is consistent at every unlock, so a panic in
/// user code elsewhere must not take the promise down with it.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
