//! The cooperative loop that promises schedule their reactions on.
//!
//! A loop owns two queues. Microtasks hold promise reactions and adoption
//! jobs. Timers hold callbacks registered with [`Handle::set_timeout`]. Every
//! turn drains the whole microtask queue (a checkpoint) before a single due
//! timer fires, so reactions always run ahead of timers.
//!
use crate::{lock, Error, LoopConfig};
use futures::task::{waker, ArcWake};
use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap, VecDeque};
use std::fmt;
use std::future::Future;
use std::pin::pin;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::mpsc::{channel, Receiver, RecvTimeoutError, Sender};
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};
use std::time::{Duration, Instant};
use tracing::{debug, trace, Level};

pub(crate) type Job = Box<dyn FnOnce() + Send + 'static>;

/// Identifies a timer so it can be cleared before it fires.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TimerId(u64);

#[derive(Default)]
struct Timers {
    // (deadline, id): ids grow monotonically, so equal deadlines fire in scheduling order
    heap: BinaryHeap<Reverse<(Instant, u64)>>,
    jobs: HashMap<u64, Job>,
}

#[derive(Default)]
struct Shared {
    microtasks: Mutex<VecDeque<Job>>,
    timers: Mutex<Timers>,
    next_timer: AtomicU64,
    /// Pending promises that still have a live resolver.
    live_promises: AtomicUsize,
}

/// A cloneable, `Send` reference to an [`EventLoop`].
///
/// Promises keep a handle to the loop they were created on and use it to
/// schedule their reactions. Other threads use it to queue work and wake the
/// loop.
#[derive(Clone)]
pub struct Handle {
    shared: Arc<Shared>,
    wake: Sender<()>,
}

impl Handle {
    /// Queue a callback to run at the next microtask checkpoint.
    pub fn queue_microtask<F>(&self, callback: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.enqueue(std::iter::once(Box::new(callback) as Job));
    }

    /// Run `callback` once `delay` has elapsed and the microtask queue is empty.
    ///
    /// A delay too large to express as a deadline never fires.
    pub fn set_timeout<F>(&self, delay: Duration, callback: F) -> TimerId
    where
        F: FnOnce() + Send + 'static,
    {
        let id = self.shared.next_timer.fetch_add(1, Ordering::Relaxed);
        let Some(deadline) = Instant::now().checked_add(delay) else {
            trace!(id, ?delay, "timer delay out of range, never firing");
            return TimerId(id);
        };
        {
            let mut timers = lock(&self.shared.timers);
            timers.heap.push(Reverse((deadline, id)));
            timers.jobs.insert(id, Box::new(callback));
        }
        trace!(id, ?delay, "timer scheduled");
        self.wake();
        TimerId(id)
    }

    /// Cancel a timer. Returns `false` if it already fired or was cleared.
    pub fn clear_timeout(&self, id: TimerId) -> bool {
        let cleared = lock(&self.shared.timers).jobs.remove(&id.0).is_some();
        trace!(id = id.0, cleared, "timer cleared");
        cleared
    }

    /// Append jobs to the microtask queue as one batch.
    pub(crate) fn enqueue<I>(&self, jobs: I)
    where
        I: IntoIterator<Item = Job>,
    {
        let queued = {
            let mut microtasks = lock(&self.shared.microtasks);
            let before = microtasks.len();
            microtasks.extend(jobs);
            microtasks.len() - before
        };
        if queued > 0 {
            trace!(queued, "microtasks enqueued");
            self.wake();
        }
    }

    pub(crate) fn track_pending(&self) {
        self.shared.live_promises.fetch_add(1, Ordering::SeqCst);
    }

    pub(crate) fn untrack_pending(&self) {
        self.shared.live_promises.fetch_sub(1, Ordering::SeqCst);
        // a parked loop may now be stalled
        self.wake();
    }

    /// Number of pending promises that can still be settled.
    pub fn live_promises(&self) -> usize {
        self.shared.live_promises.load(Ordering::SeqCst)
    }

    fn wake(&self) {
        // the receiver only disappears with the loop, and then nobody is left to wake
        let _ = self.wake.send(());
    }
}

impl fmt::Debug for Handle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Handle")
            .field("microtasks", &lock(&self.shared.microtasks).len())
            .field("timers", &lock(&self.shared.timers).jobs.len())
            .field("live_promises", &self.live_promises())
            .finish()
    }
}

struct LoopWaker {
    woken: AtomicBool,
    handle: Handle,
}

impl ArcWake for LoopWaker {
    fn wake_by_ref(arc_self: &Arc<Self>) {
        arc_self.woken.store(true, Ordering::SeqCst);
        arc_self.handle.wake();
    }
}

/// Single-threaded driver for microtasks and timers.
///
/// # Examples
///
/// ```
/// use deferred::{EventLoop, Promise};
/// use std::time::Duration;
///
/// let mut event_loop = EventLoop::new();
/// let handle = event_loop.handle();
/// let promise = Promise::<&str, String>::new(&handle, |resolver| {
///     let timer = handle.clone();
///     timer.set_timeout(Duration::from_millis(5), move || resolver.resolve("foo"));
///     Ok(())
/// });
/// assert_eq!(event_loop.block_on(promise).unwrap(), Ok("foo"));
/// ```
pub struct EventLoop {
    handle: Handle,
    wakeups: Receiver<()>,
    config: LoopConfig,
}

impl Default for EventLoop {
    fn default() -> Self {
        Self::with_config(LoopConfig::default())
    }
}

impl EventLoop {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_config(config: LoopConfig) -> Self {
        let (wake, wakeups) = channel();
        Self {
            handle: Handle {
                shared: Arc::new(Shared::default()),
                wake,
            },
            wakeups,
            config,
        }
    }

    pub fn handle(&self) -> Handle {
        self.handle.clone()
    }

    pub fn config(&self) -> &LoopConfig {
        &self.config
    }

    /// Perform one microtask checkpoint, returning how many microtasks ran.
    ///
    /// Microtasks queued while the checkpoint runs are part of it.
    pub fn run_microtasks(&mut self) -> Result<usize, Error> {
        let mut ran = 0;
        loop {
            let job = {
                let mut microtasks = lock(&self.handle.shared.microtasks);
                if microtasks.is_empty() {
                    break;
                }
                if let Some(budget) = self.config.microtask_budget {
                    if ran >= budget {
                        return Err(Error::MicrotaskBudgetExceeded(budget));
                    }
                }
                microtasks.pop_front()
            };
            if let Some(job) = job {
                job();
                ran += 1;
            }
        }
        if ran > 0 {
            trace!(ran, "microtask checkpoint complete");
        }
        Ok(ran)
    }

    /// Drive microtasks and timers until both queues are empty.
    ///
    /// Waiting for a timer deadline is interrupted by wakes from other
    /// threads, so their settlements are processed promptly.
    #[tracing::instrument(level = Level::DEBUG, skip(self))]
    pub fn run(&mut self) -> Result<(), Error> {
        loop {
            self.drain_wakeups();
            self.run_microtasks()?;
            let now = Instant::now();
            if let Some(job) = self.take_due_timer(now) {
                job();
                continue;
            }
            match self.next_deadline() {
                Some(deadline) => {
                    self.wait(Some(deadline.saturating_duration_since(now)));
                }
                None if self.has_microtasks() => continue,
                None => {
                    debug!("event loop idle");
                    return Ok(());
                }
            }
        }
    }

    /// Drive the loop until `future` completes.
    ///
    /// Returns [`Error::Stalled`] when the future is pending and nothing is
    /// left that could wake it: no microtasks, no timers and no live
    /// resolvers, or the configured park timeout elapsed.
    #[tracing::instrument(level = Level::DEBUG, skip_all)]
    pub fn block_on<F: Future>(&mut self, future: F) -> Result<F::Output, Error> {
        let mut future = pin!(future);
        let signal = Arc::new(LoopWaker {
            woken: AtomicBool::new(true),
            handle: self.handle.clone(),
        });
        let waker = waker(signal.clone());
        let mut cx = Context::from_waker(&waker);
        loop {
            if signal.woken.swap(false, Ordering::SeqCst) {
                if let Poll::Ready(output) = future.as_mut().poll(&mut cx) {
                    return Ok(output);
                }
            }
            self.drain_wakeups();
            if self.run_microtasks()? > 0 || signal.woken.load(Ordering::SeqCst) {
                continue;
            }
            let now = Instant::now();
            if let Some(job) = self.take_due_timer(now) {
                job();
                continue;
            }
            if self.has_microtasks() {
                continue;
            }
            match self.next_deadline() {
                Some(deadline) => {
                    self.wait(Some(deadline.saturating_duration_since(now)));
                }
                None if self.handle.live_promises() == 0 => {
                    if let Poll::Ready(output) = future.as_mut().poll(&mut cx) {
                        return Ok(output);
                    }
                    debug!("nothing left to wake the future");
                    return Err(Error::Stalled);
                }
                None => {
                    debug!(live = self.handle.live_promises(), "parking until woken");
                    if !self.wait(self.config.park_timeout()) {
                        debug!("park timeout elapsed");
                        return Err(Error::Stalled);
                    }
                }
            }
        }
    }

    fn has_microtasks(&self) -> bool {
        !lock(&self.handle.shared.microtasks).is_empty()
    }

    fn drain_wakeups(&self) {
        while self.wakeups.try_recv().is_ok() {}
    }

    /// Block until woken or until `timeout` passes. Returns whether a wake arrived.
    fn wait(&self, timeout: Option<Duration>) -> bool {
        match timeout {
            Some(timeout) => match self.wakeups.recv_timeout(timeout) {
                Ok(()) => true,
                Err(RecvTimeoutError::Timeout) => false,
                // we hold a sender through our own handle
                Err(RecvTimeoutError::Disconnected) => false,
            },
            None => self.wakeups.recv().is_ok(),
        }
    }

    fn take_due_timer(&self, now: Instant) -> Option<Job> {
        let mut timers = lock(&self.handle.shared.timers);
        while let Some(Reverse((deadline, id))) = timers.heap.peek().copied() {
            if deadline > now {
                return None;
            }
            timers.heap.pop();
            if let Some(job) = timers.jobs.remove(&id) {
                trace!(id, "timer fired");
                return Some(job);
            }
        }
        None
    }

    fn next_deadline(&self) -> Option<Instant> {
        let mut timers = lock(&self.handle.shared.timers);
        while let Some(Reverse((deadline, id))) = timers.heap.peek().copied() {
            if timers.jobs.contains_key(&id) {
                return Some(deadline);
            }
            // cleared
            timers.heap.pop();
        }
        None
    }
}

impl fmt::Debug for EventLoop {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventLoop")
            .field("handle", &self.handle)
            .field("config", &self.config)
            .finish()
    }
}
