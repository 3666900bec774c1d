//! Eager single-assignment promises with chaining, combinators and
//! cancellation, scheduled on the event loop's microtask queue.

mod combinator;

pub use combinator::{BatchTask, all, any, batch, race};

use std::cell::{Cell, RefCell};
use std::future::Future;
use std::pin::Pin;
use std::rc::Rc;
use std::task::{Context, Poll, Waker};
use std::time::Duration;

use crate::error::{Error, Result};
use crate::runtime::Handle;

/// A settled outcome. Values live behind `Rc` so every continuation of a
/// promise observes the same allocation.
pub type Settled<T> = Result<Rc<T>>;

type Continuation<T> = Box<dyn FnOnce(Settled<T>)>;

/// Externally visible promise state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PromiseState {
    Pending,
    Fulfilled,
    Rejected,
    Cancelled,
}

enum State<T> {
    Pending,
    Settled(Settled<T>),
}

struct Inner<T> {
    handle: Handle,
    state: State<T>,
    continuations: Vec<Continuation<T>>,
    wakers: Vec<Waker>,
    /// Some consumer took responsibility for a rejection (a continuation,
    /// an awaiter). Unobserved rejections go to the loop's sink on drop.
    observed: bool,
}

impl<T> Drop for Inner<T> {
    fn drop(&mut self) {
        if self.observed {
            return;
        }
        if let State::Settled(Err(err)) = &self.state
            && !err.is_cancelled()
        {
            self.handle.report_unhandled_rejection(err);
        }
    }
}

/// Shared cancellation record at the root of a promise chain.
///
/// Chained promises keep an `Rc` back to their root; cancelling any link
/// cancels the root, and continuations that have not yet run check the flag
/// and skip themselves.
struct RootState {
    cancelled: Cell<bool>,
    cancel_handler: RefCell<Option<Box<dyn FnOnce()>>>,
    reject_on_cancel: RefCell<Option<Box<dyn FnOnce()>>>,
}

impl RootState {
    fn new() -> Self {
        Self {
            cancelled: Cell::new(false),
            cancel_handler: RefCell::new(None),
            reject_on_cancel: RefCell::new(None),
        }
    }

    fn cancel(&self) {
        if self.cancelled.replace(true) {
            return;
        }
        let handler = self.cancel_handler.borrow_mut().take();
        if let Some(handler) = handler {
            handler();
        }
        let reject = self.reject_on_cancel.borrow_mut().take();
        if let Some(reject) = reject {
            reject();
        }
    }
}

/// Settle without consulting the root flag. Used by the cancellation path
/// itself and by internal forwarding where the flag was already applied.
fn settle_raw<T: 'static>(inner: &Rc<RefCell<Inner<T>>>, outcome: Settled<T>) {
    let mut guard = inner.borrow_mut();
    if let State::Settled(_) = guard.state {
        return;
    }
    guard.state = State::Settled(outcome.clone());
    let continuations = std::mem::take(&mut guard.continuations);
    let wakers = std::mem::take(&mut guard.wakers);
    if !continuations.is_empty() || !wakers.is_empty() {
        guard.observed = true;
    }
    let handle = guard.handle.clone();
    drop(guard);

    for waker in wakers {
        waker.wake();
    }
    // Continuations never run inline: each is its own microtask.
    for continuation in continuations {
        let outcome = outcome.clone();
        handle.enqueue_microtask(move || continuation(outcome));
    }
}

fn settle_checked<T: 'static>(inner: &Rc<RefCell<Inner<T>>>, root: &RootState, outcome: Settled<T>) {
    // A fulfillment arriving after cancellation is forbidden; it becomes the
    // canonical rejection instead.
    let outcome = if root.cancelled.get() && outcome.is_ok() {
        Err(Error::Cancelled)
    } else {
        outcome
    };
    settle_raw(inner, outcome);
}

/// Write end of a pending promise. Clones settle the same promise; the first
/// settlement wins and the rest are no-ops.
pub struct Resolver<T> {
    inner: Rc<RefCell<Inner<T>>>,
    root: Rc<RootState>,
}

impl<T> Clone for Resolver<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Rc::clone(&self.inner),
            root: Rc::clone(&self.root),
        }
    }
}

impl<T: 'static> Resolver<T> {
    pub fn resolve(&self, value: T) {
        self.settle(Ok(Rc::new(value)));
    }

    pub fn reject(&self, err: Error) {
        self.settle(Err(err));
    }

    pub fn settle(&self, outcome: Settled<T>) {
        settle_checked(&self.inner, &self.root, outcome);
    }
}

/// An eager, single-assignment future.
///
/// Cloning yields another handle to the same promise. Promises are also
/// `Future`s: awaiting one inside a spawned task parks the task until the
/// promise settles.
pub struct Promise<T> {
    inner: Rc<RefCell<Inner<T>>>,
    root: Rc<RootState>,
}

impl<T> Clone for Promise<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Rc::clone(&self.inner),
            root: Rc::clone(&self.root),
        }
    }
}

impl<T: 'static> Promise<T> {
    /// A pending promise plus its resolver, bound to `handle`'s loop.
    pub fn pending_with(handle: &Handle) -> (Self, Resolver<T>) {
        let inner = Rc::new(RefCell::new(Inner {
            handle: handle.clone(),
            state: State::Pending,
            continuations: Vec::new(),
            wakers: Vec::new(),
            observed: false,
        }));
        let root = Rc::new(RootState::new());
        let reject_target = Rc::clone(&inner);
        *root.reject_on_cancel.borrow_mut() = Some(Box::new(move || {
            settle_raw(&reject_target, Err(Error::Cancelled));
        }));
        let promise = Self {
            inner: Rc::clone(&inner),
            root: Rc::clone(&root),
        };
        (promise, Resolver { inner, root })
    }

    /// A pending promise on the current loop.
    ///
    /// # Panics
    /// Panics outside a loop context; see [`Handle::current`].
    pub fn pending() -> (Self, Resolver<T>) {
        Self::pending_with(&Handle::current())
    }

    /// Run `executor` with the resolver; an error return rejects the promise.
    pub fn new(executor: impl FnOnce(Resolver<T>) -> Result<()>) -> Self {
        let (promise, resolver) = Self::pending();
        if let Err(err) = executor(resolver.clone()) {
            resolver.reject(err);
        }
        promise
    }

    pub fn fulfilled(value: T) -> Self {
        Self::fulfilled_with(&Handle::current(), value)
    }

    pub fn fulfilled_with(handle: &Handle, value: T) -> Self {
        let (promise, resolver) = Self::pending_with(handle);
        resolver.resolve(value);
        promise
    }

    pub fn rejected(err: Error) -> Self {
        Self::rejected_with(&Handle::current(), err)
    }

    pub fn rejected_with(handle: &Handle, err: Error) -> Self {
        let (promise, resolver) = Self::pending_with(handle);
        resolver.reject(err);
        promise
    }

    pub(crate) fn handle(&self) -> Handle {
        self.inner.borrow().handle.clone()
    }

    pub fn state(&self) -> PromiseState {
        match &self.inner.borrow().state {
            State::Pending => {
                if self.root.cancelled.get() {
                    PromiseState::Cancelled
                } else {
                    PromiseState::Pending
                }
            }
            State::Settled(Ok(_)) => PromiseState::Fulfilled,
            State::Settled(Err(_)) => {
                if self.root.cancelled.get() {
                    PromiseState::Cancelled
                } else {
                    PromiseState::Rejected
                }
            }
        }
    }

    pub fn is_settled(&self) -> bool {
        matches!(self.inner.borrow().state, State::Settled(_))
    }

    /// Register a raw continuation. On a pending promise it is queued; on a
    /// settled one it is scheduled as a microtask immediately.
    pub(crate) fn subscribe(&self, f: impl FnOnce(Settled<T>) + 'static) {
        let mut guard = self.inner.borrow_mut();
        if let State::Settled(outcome) = &guard.state {
            let outcome = outcome.clone();
            guard.observed = true;
            let handle = guard.handle.clone();
            drop(guard);
            handle.enqueue_microtask(move || f(outcome));
        } else {
            guard.continuations.push(Box::new(f));
        }
    }

    /// Chain a fulfillment transform. Rejections pass through untouched; an
    /// `Err` return (or an upstream rejection) rejects the returned promise.
    pub fn then<U: 'static>(&self, on_fulfilled: impl FnOnce(Rc<T>) -> Result<U> + 'static) -> Promise<U> {
        let child = self.chained::<U>();
        let inner = Rc::clone(&child.inner);
        let root = Rc::clone(&child.root);
        self.subscribe(move |outcome| {
            if root.cancelled.get() {
                settle_raw(&inner, Err(Error::Cancelled));
                return;
            }
            let next = match outcome {
                Ok(value) => on_fulfilled(value).map(Rc::new),
                Err(err) => Err(err),
            };
            settle_checked(&inner, &root, next);
        });
        child
    }

    /// Chain a transform that returns another promise; the result adopts
    /// that promise's eventual state.
    pub fn and_then<U: 'static>(
        &self,
        on_fulfilled: impl FnOnce(Rc<T>) -> Promise<U> + 'static,
    ) -> Promise<U> {
        let child = self.chained::<U>();
        let inner = Rc::clone(&child.inner);
        let root = Rc::clone(&child.root);
        self.subscribe(move |outcome| {
            if root.cancelled.get() {
                settle_raw(&inner, Err(Error::Cancelled));
                return;
            }
            match outcome {
                Ok(value) => {
                    let adopted = on_fulfilled(value);
                    adopted.subscribe(move |next| settle_checked(&inner, &root, next));
                }
                Err(err) => settle_checked(&inner, &root, Err(err)),
            }
        });
        child
    }

    /// Chain a rejection handler. Fulfillments pass through; the handler may
    /// recover with a new value or fail again.
    pub fn catch(&self, on_rejected: impl FnOnce(Error) -> Result<T> + 'static) -> Promise<T> {
        let child = self.chained::<T>();
        let inner = Rc::clone(&child.inner);
        let root = Rc::clone(&child.root);
        self.mark_observed();
        self.subscribe(move |outcome| {
            if root.cancelled.get() {
                settle_raw(&inner, Err(Error::Cancelled));
                return;
            }
            let next = match outcome {
                Ok(value) => Ok(value),
                Err(err) => on_rejected(err).map(Rc::new),
            };
            settle_checked(&inner, &root, next);
        });
        child
    }

    /// Run `f` on settlement without changing the adopted value, except that
    /// an `Err` from `f` rejects the chain.
    pub fn finally(&self, f: impl FnOnce() -> Result<()> + 'static) -> Promise<T> {
        let child = self.chained::<T>();
        let inner = Rc::clone(&child.inner);
        let root = Rc::clone(&child.root);
        self.subscribe(move |outcome| {
            if root.cancelled.get() {
                settle_raw(&inner, Err(Error::Cancelled));
                return;
            }
            let next = match f() {
                Ok(()) => outcome,
                Err(err) => Err(err),
            };
            settle_checked(&inner, &root, next);
        });
        child
    }

    /// Cancel the chain this promise belongs to. Idempotent: the cancel
    /// handler runs at most once, the root rejects with the canonical
    /// cancellation reason, and continuations that have not yet run are
    /// skipped.
    pub fn cancel(&self) {
        self.root.cancel();
    }

    /// Attach the cancel handler; the last one registered wins. Registering
    /// on an already-cancelled chain runs the handler immediately.
    pub fn on_cancel(&self, handler: impl FnOnce() + 'static) {
        if self.root.cancelled.get() {
            handler();
        } else {
            *self.root.cancel_handler.borrow_mut() = Some(Box::new(handler));
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.root.cancelled.get()
    }

    pub(crate) fn mark_observed(&self) {
        self.inner.borrow_mut().observed = true;
    }

    /// A fresh pending promise sharing this promise's root, for chaining.
    fn chained<U: 'static>(&self) -> Promise<U> {
        let inner = Rc::new(RefCell::new(Inner {
            handle: self.handle(),
            state: State::Pending,
            continuations: Vec::new(),
            wakers: Vec::new(),
            observed: false,
        }));
        Promise {
            inner,
            root: Rc::clone(&self.root),
        }
    }
}

impl<T: 'static> Future for Promise<T> {
    type Output = Settled<T>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let mut guard = self.inner.borrow_mut();
        match &guard.state {
            State::Settled(outcome) => {
                let outcome = outcome.clone();
                guard.observed = true;
                Poll::Ready(outcome)
            }
            State::Pending => {
                if !guard.wakers.iter().any(|w| w.will_wake(cx.waker())) {
                    guard.wakers.push(cx.waker().clone());
                }
                Poll::Pending
            }
        }
    }
}

/// A promise that fulfills with `()` after `duration`. Cancelling it cancels
/// the underlying timer, so the callback never fires.
pub fn delay(duration: Duration) -> Promise<()> {
    delay_with(&Handle::current(), duration)
}

pub fn delay_with(handle: &Handle, duration: Duration) -> Promise<()> {
    let (promise, resolver) = Promise::pending_with(handle);
    match handle.add_timer(duration, move || resolver.resolve(())) {
        Some(id) => {
            let handle = handle.clone();
            promise.on_cancel(move || {
                handle.cancel_timer(id);
            });
        }
        None => promise.cancel(),
    }
    promise
}

/// Race `promise` against a deadline. Whichever side loses is cancelled.
pub fn timeout<T: 'static>(promise: Promise<T>, duration: Duration) -> Promise<T> {
    let handle = promise.handle();
    let (out, resolver) = Promise::pending_with(&handle);
    let deadline = delay_with(&handle, duration);

    {
        let resolver = resolver.clone();
        let task = promise.clone();
        deadline.subscribe(move |outcome| {
            // A cancelled deadline rejects with Cancelled; only a real
            // expiry produces the timeout.
            if outcome.is_ok() {
                resolver.reject(Error::Timeout(duration));
                task.cancel();
            }
        });
    }
    {
        let deadline = deadline.clone();
        promise.subscribe(move |outcome| {
            deadline.cancel();
            resolver.settle(outcome);
        });
    }
    out
}

/// Spawn a task on the current loop; see [`Handle::spawn`].
pub fn spawn<T, F>(future: F) -> Promise<T>
where
    T: 'static,
    F: Future<Output = Result<T>> + 'static,
{
    Handle::current().spawn(future)
}

/// Schedule a callback for the start of the next loop iteration.
pub fn next_tick(job: impl FnOnce() + 'static) {
    Handle::current().next_tick(job);
}
