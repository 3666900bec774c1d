use std::cell::{Cell, RefCell};
use std::collections::VecDeque;
use std::future::Future;
use std::rc::{Rc, Weak};
use std::time::{Duration, Instant};

use tracing::trace;

use crate::error::{Error, Result};
use crate::http::MultiDriver;
use crate::promise::Promise;
use crate::runtime::reactor::{Firing, Reactor};
use crate::runtime::task::{TaskManager, poll_task};
use crate::runtime::timer::{TimerId, TimerWheel};

/// Upper bound on one idle sleep; keeps the loop responsive to work that
/// arrives without a wakeup edge.
const IDLE_SLEEP_CAP: Duration = Duration::from_millis(20);

pub(crate) type Job = Box<dyn FnOnce()>;

thread_local! {
    static CURRENT: RefCell<Vec<Handle>> = const { RefCell::new(Vec::new()) };
}

pub(crate) struct LoopInner {
    pub(crate) reactor: RefCell<Reactor>,
    pub(crate) timers: RefCell<TimerWheel>,
    pub(crate) http: RefCell<MultiDriver>,
    pub(crate) tasks: RefCell<TaskManager>,
    microtasks: RefCell<VecDeque<Job>>,
    next_tick: RefCell<VecDeque<Job>>,
    stop_requested: Cell<bool>,
    rejection_sink: RefCell<Rc<dyn Fn(&Error)>>,
}

/// The single-threaded cooperative event loop.
///
/// One tick runs, in order: the next-tick queue, due timers, one unit of
/// HTTP progress, at most one task resume, then the microtask queue; the
/// loop then sleeps in the reactor for no longer than the nearest deadline
/// allows. `run` returns when every queue is empty or [`Handle::stop`] was
/// called.
pub struct EventLoop {
    inner: Rc<LoopInner>,
}

impl EventLoop {
    pub fn new() -> Result<Self> {
        let inner = Rc::new(LoopInner {
            reactor: RefCell::new(Reactor::new()?),
            timers: RefCell::new(TimerWheel::new()),
            http: RefCell::new(MultiDriver::new()),
            tasks: RefCell::new(TaskManager::new()),
            microtasks: RefCell::new(VecDeque::new()),
            next_tick: RefCell::new(VecDeque::new()),
            stop_requested: Cell::new(false),
            rejection_sink: RefCell::new(Rc::new(|err: &Error| {
                tracing::warn!(%err, "unhandled promise rejection");
            })),
        });
        Ok(Self { inner })
    }

    pub fn handle(&self) -> Handle {
        Handle {
            inner: Rc::downgrade(&self.inner),
        }
    }

    /// Run until every queue quiesces or `stop()` is called.
    pub fn run(&self) -> Result<()> {
        let _guard = ContextGuard::enter(self.handle());
        loop {
            self.inner.tick();
            if self.inner.stop_requested.take() {
                trace!("event loop stopped");
                return Ok(());
            }
            if self.inner.is_quiescent() {
                trace!("event loop quiescent");
                return Ok(());
            }
            self.inner.poll_io()?;
            if self.inner.stop_requested.take() {
                return Ok(());
            }
        }
    }

    /// Drive the loop until `future` completes, then return its output.
    ///
    /// Returns `None` if the loop stopped or quiesced before the future
    /// finished (a deadlocked await, for example).
    pub fn block_on<F>(&self, future: F) -> Option<F::Output>
    where
        F: Future + 'static,
        F::Output: 'static,
    {
        let _guard = ContextGuard::enter(self.handle());
        let outcome = Rc::new(RefCell::new(None));
        let slot = Rc::clone(&outcome);
        self.inner
            .tasks
            .borrow_mut()
            .spawn(async move { *slot.borrow_mut() = Some(future.await) });

        loop {
            self.inner.tick();
            if outcome.borrow().is_some() {
                return outcome.borrow_mut().take();
            }
            if self.inner.stop_requested.take() || self.inner.is_quiescent() {
                return outcome.borrow_mut().take();
            }
            if self.inner.poll_io().is_err() {
                return outcome.borrow_mut().take();
            }
        }
    }
}

impl LoopInner {
    fn tick(&self) {
        // 1. next-tick queue, drained fully
        loop {
            let job = self.next_tick.borrow_mut().pop_front();
            match job {
                Some(job) => job(),
                None => break,
            }
        }

        // 2. due timers
        let due = self.timers.borrow_mut().take_due(Instant::now());
        for timer in due {
            timer();
        }

        // 3. one unit of HTTP progress
        let completions = self.http.borrow_mut().tick();
        for (callback, outcome) in completions {
            callback(outcome);
        }

        // 4. at most one task resume
        self.resume_one_task();

        // 5. microtask queue, drained fully
        loop {
            let job = self.microtasks.borrow_mut().pop_front();
            match job {
                Some(job) => job(),
                None => break,
            }
        }
    }

    fn resume_one_task(&self) {
        let taken = self.tasks.borrow_mut().take_ready();
        let Some((id, mut future)) = taken else {
            return;
        };
        let waker = self.tasks.borrow().waker(id);
        let done = poll_task(&mut future, &waker).is_ready();
        self.tasks
            .borrow_mut()
            .store(id, if done { None } else { Some(future) });
    }

    fn poll_io(&self) -> Result<()> {
        let timeout = self.idle_timeout();
        let fired = self.reactor.borrow_mut().poll(Some(timeout))?;
        for firing in fired {
            match firing {
                Firing::Read(cb) => cb(),
                Firing::Write(cb) => cb(),
            }
        }
        Ok(())
    }

    /// How long the loop may sleep without oversleeping the next deadline.
    fn idle_timeout(&self) -> Duration {
        if self.stop_requested.get()
            || !self.next_tick.borrow().is_empty()
            || !self.microtasks.borrow().is_empty()
            || self.tasks.borrow().has_ready()
        {
            return Duration::ZERO;
        }
        let mut timeout = IDLE_SLEEP_CAP;
        if let Some(delay) = self.timers.borrow_mut().next_delay(Instant::now()) {
            timeout = timeout.min(delay);
        }
        if let Some(delay) = self.http.borrow().next_poll_timeout() {
            timeout = timeout.min(delay);
        }
        timeout
    }

    fn is_quiescent(&self) -> bool {
        self.next_tick.borrow().is_empty()
            && self.microtasks.borrow().is_empty()
            && self.timers.borrow().is_empty()
            && self.tasks.borrow().is_empty()
            && self.http.borrow().active() == 0
            && self.reactor.borrow().watcher_count() == 0
    }
}

/// Cheap, cloneable reference to a live event loop.
///
/// A handle does not keep the loop alive; operations on a handle whose loop
/// is gone are no-ops (or `None`/`false` where a result is expected).
#[derive(Clone)]
pub struct Handle {
    inner: Weak<LoopInner>,
}

impl Handle {
    /// The handle of the loop currently running on this thread.
    ///
    /// # Panics
    /// Panics when called outside `run`/`block_on` (or an explicit
    /// [`Handle::enter`] scope).
    pub fn current() -> Handle {
        Self::try_current().expect("no event loop context on this thread")
    }

    pub fn try_current() -> Option<Handle> {
        CURRENT.with(|stack| stack.borrow().last().cloned())
    }

    /// Install this handle as the thread's current loop for the lifetime of
    /// the returned guard. `run` and `block_on` do this automatically.
    pub fn enter(&self) -> ContextGuard {
        ContextGuard::enter(self.clone())
    }

    /// Finish the current tick, then exit `run`.
    pub fn stop(&self) {
        if let Some(inner) = self.inner.upgrade() {
            inner.stop_requested.set(true);
        }
    }

    /// Schedule a callback on the microtask queue (runs before the loop
    /// returns to polling).
    pub fn enqueue_microtask(&self, job: impl FnOnce() + 'static) {
        if let Some(inner) = self.inner.upgrade() {
            inner.microtasks.borrow_mut().push_back(Box::new(job));
        }
    }

    /// Schedule a callback for the start of the next loop iteration, before
    /// timers and I/O dispatch.
    pub fn next_tick(&self, job: impl FnOnce() + 'static) {
        if let Some(inner) = self.inner.upgrade() {
            inner.next_tick.borrow_mut().push_back(Box::new(job));
        }
    }

    pub fn add_timer(&self, delay: Duration, callback: impl FnOnce() + 'static) -> Option<TimerId> {
        let inner = self.inner.upgrade()?;
        let id = inner.timers.borrow_mut().add(delay, Box::new(callback));
        Some(id)
    }

    pub fn cancel_timer(&self, id: TimerId) -> bool {
        match self.inner.upgrade() {
            Some(inner) => inner.timers.borrow_mut().cancel(id),
            None => false,
        }
    }

    /// Spawn a cooperative task; its output settles the returned promise.
    pub fn spawn<T, F>(&self, future: F) -> Promise<T>
    where
        T: 'static,
        F: Future<Output = Result<T>> + 'static,
    {
        let (promise, resolver) = Promise::pending_with(self);
        if let Some(inner) = self.inner.upgrade() {
            inner.tasks.borrow_mut().spawn(async move {
                resolver.settle(future.await.map(Rc::new));
            });
        } else {
            resolver.reject(Error::Cancelled);
        }
        promise
    }

    /// Replace the sink that receives rejections nobody handled.
    pub fn set_rejection_sink(&self, sink: impl Fn(&Error) + 'static) {
        if let Some(inner) = self.inner.upgrade() {
            *inner.rejection_sink.borrow_mut() = Rc::new(sink);
        }
    }

    pub(crate) fn report_unhandled_rejection(&self, err: &Error) {
        if let Some(inner) = self.inner.upgrade() {
            let sink = Rc::clone(&inner.rejection_sink.borrow());
            sink(err);
        }
    }

    pub(crate) fn with_reactor<R>(&self, f: impl FnOnce(&mut Reactor) -> R) -> Option<R> {
        let inner = self.inner.upgrade()?;
        let result = f(&mut inner.reactor.borrow_mut());
        Some(result)
    }

    pub(crate) fn with_http<R>(&self, f: impl FnOnce(&mut MultiDriver) -> R) -> Option<R> {
        let inner = self.inner.upgrade()?;
        let result = f(&mut inner.http.borrow_mut());
        Some(result)
    }
}

/// Scope guard for the thread-local current-loop stack.
pub struct ContextGuard {
    _private: (),
}

impl ContextGuard {
    fn enter(handle: Handle) -> Self {
        CURRENT.with(|stack| stack.borrow_mut().push(handle));
        Self { _private: () }
    }
}

impl Drop for ContextGuard {
    fn drop(&mut self) {
        CURRENT.with(|stack| {
            stack.borrow_mut().pop();
        });
    }
}
