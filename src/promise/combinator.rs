//! Promise combinators: `all`, `any`, `race` and the bounded-concurrency
//! `batch`.

use std::cell::{Cell, RefCell};
use std::rc::Rc;

use crate::error::Error;
use crate::promise::{Promise, Resolver};
use crate::runtime::Handle;

fn ambient_handle<T: 'static>(promises: &[Promise<T>]) -> Handle {
    promises
        .first()
        .map(Promise::handle)
        .unwrap_or_else(Handle::current)
}

/// Fulfills with every value in input order; rejects with the first
/// rejection. An empty input fulfills with an empty vector.
pub fn all<T: 'static>(promises: Vec<Promise<T>>) -> Promise<Vec<Rc<T>>> {
    let handle = ambient_handle(&promises);
    if promises.is_empty() {
        return Promise::fulfilled_with(&handle, Vec::new());
    }

    let (out, resolver) = Promise::pending_with(&handle);
    let results: Rc<RefCell<Vec<Option<Rc<T>>>>> =
        Rc::new(RefCell::new(vec![None; promises.len()]));
    let remaining = Rc::new(Cell::new(promises.len()));

    for (index, promise) in promises.iter().enumerate() {
        let results = Rc::clone(&results);
        let remaining = Rc::clone(&remaining);
        let resolver = resolver.clone();
        promise.subscribe(move |outcome| match outcome {
            Ok(value) => {
                results.borrow_mut()[index] = Some(value);
                remaining.set(remaining.get() - 1);
                if remaining.get() == 0 {
                    let values = results.borrow_mut().drain(..).flatten().collect();
                    resolver.resolve(values);
                }
            }
            Err(err) => resolver.reject(err),
        });
    }
    out
}

/// Fulfills with the first fulfillment; rejects with an aggregate of every
/// reason when all inputs reject. An empty input rejects immediately.
pub fn any<T: 'static>(promises: Vec<Promise<T>>) -> Promise<T> {
    let handle = ambient_handle(&promises);
    if promises.is_empty() {
        return Promise::rejected_with(&handle, Error::Aggregate(Vec::new()));
    }

    let (out, resolver) = Promise::pending_with(&handle);
    let errors: Rc<RefCell<Vec<Option<Error>>>> =
        Rc::new(RefCell::new(vec![None; promises.len()]));
    let remaining = Rc::new(Cell::new(promises.len()));

    for (index, promise) in promises.iter().enumerate() {
        let errors = Rc::clone(&errors);
        let remaining = Rc::clone(&remaining);
        let resolver = resolver.clone();
        promise.subscribe(move |outcome| match outcome {
            Ok(value) => resolver.settle(Ok(value)),
            Err(err) => {
                errors.borrow_mut()[index] = Some(err);
                remaining.set(remaining.get() - 1);
                if remaining.get() == 0 {
                    let reasons = errors.borrow_mut().drain(..).flatten().collect();
                    resolver.reject(Error::Aggregate(reasons));
                }
            }
        });
    }
    out
}

/// Adopts the first settlement, fulfilled or rejected, and cancels the
/// losers. An empty input stays pending forever.
pub fn race<T: 'static>(promises: Vec<Promise<T>>) -> Promise<T> {
    let handle = ambient_handle(&promises);
    let (out, resolver) = Promise::pending_with(&handle);
    let decided = Rc::new(Cell::new(false));

    for (index, promise) in promises.iter().enumerate() {
        let resolver = resolver.clone();
        let decided = Rc::clone(&decided);
        let losers: Vec<Promise<T>> = promises
            .iter()
            .enumerate()
            .filter(|(i, _)| *i != index)
            .map(|(_, p)| p.clone())
            .collect();
        promise.subscribe(move |outcome| {
            if decided.replace(true) {
                return;
            }
            resolver.settle(outcome);
            for loser in &losers {
                loser.cancel();
            }
        });
    }
    out
}

/// A deferred unit of work for [`batch`]; invoked when its slot starts.
pub type BatchTask<T> = Box<dyn FnOnce() -> Promise<T>>;

struct BatchState<T> {
    tasks: Vec<Option<BatchTask<T>>>,
    results: Vec<Option<Rc<T>>>,
    running: Vec<Promise<T>>,
    next: usize,
    slice_end: usize,
    active: usize,
    completed: usize,
    failed: bool,
    batch_size: usize,
    concurrency: usize,
    resolver: Resolver<Vec<Rc<T>>>,
}

/// Run `tasks` in sequential slices of `batch_size`; within a slice at most
/// `concurrency` (default: the slice size) run at once. Results preserve
/// input order. The first rejection rejects the output and cancels whatever
/// is still running.
pub fn batch<T: 'static>(
    tasks: Vec<BatchTask<T>>,
    batch_size: usize,
    concurrency: Option<usize>,
) -> Promise<Vec<Rc<T>>> {
    let handle = Handle::current();
    let (out, resolver) = Promise::pending_with(&handle);
    if tasks.is_empty() {
        resolver.resolve(Vec::new());
        return out;
    }

    let batch_size = batch_size.max(1);
    let concurrency = concurrency.unwrap_or(batch_size).max(1);
    let total = tasks.len();
    let state = Rc::new(RefCell::new(BatchState {
        tasks: tasks.into_iter().map(Some).collect(),
        results: vec![None; total],
        running: Vec::new(),
        next: 0,
        slice_end: batch_size.min(total),
        active: 0,
        completed: 0,
        failed: false,
        batch_size,
        concurrency,
        resolver,
    }));
    pump(&state);
    out
}

fn pump<T: 'static>(state: &Rc<RefCell<BatchState<T>>>) {
    loop {
        let mut started_any = false;

        // Start tasks up to the concurrency limit of the current slice.
        loop {
            let task = {
                let mut s = state.borrow_mut();
                if s.failed || s.active >= s.concurrency || s.next >= s.slice_end {
                    None
                } else {
                    let index = s.next;
                    s.next += 1;
                    match s.tasks[index].take() {
                        Some(task) => {
                            s.active += 1;
                            Some((index, task))
                        }
                        None => None,
                    }
                }
            };
            let Some((index, task)) = task else { break };
            started_any = true;

            let promise = task();
            {
                let mut s = state.borrow_mut();
                s.running.push(promise.clone());
            }
            let state = Rc::clone(state);
            promise.subscribe(move |outcome| {
                on_task_settled(&state, index, outcome);
            });
        }

        // Advance to the next slice only once the current one drained.
        let advanced = {
            let mut s = state.borrow_mut();
            if s.failed || s.active > 0 || s.next < s.slice_end {
                false
            } else if s.completed == s.results.len() {
                let values = s.results.drain(..).flatten().collect();
                s.resolver.resolve(values);
                false
            } else {
                s.slice_end = (s.slice_end + s.batch_size).min(s.results.len());
                true
            }
        };

        if !advanced && !started_any {
            return;
        }
    }
}

fn on_task_settled<T: 'static>(
    state: &Rc<RefCell<BatchState<T>>>,
    index: usize,
    outcome: crate::promise::Settled<T>,
) {
    {
        let mut s = state.borrow_mut();
        s.active -= 1;
        match outcome {
            Ok(value) => {
                s.results[index] = Some(value);
                s.completed += 1;
            }
            Err(err) => {
                if !s.failed {
                    s.failed = true;
                    s.resolver.reject(err);
                    let running = std::mem::take(&mut s.running);
                    drop(s);
                    for promise in running {
                        promise.cancel();
                    }
                    return;
                }
                return;
            }
        }
    }
    pump(state);
}
