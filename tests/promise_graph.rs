//! Promise state machine, combinators and cancellation semantics.

use std::cell::{Cell, RefCell};
use std::rc::Rc;
use std::time::{Duration, Instant};

use pretty_assertions::assert_eq;
use weft::promise::{BatchTask, Promise, PromiseState, all, any, batch, delay, race, timeout};
use weft::runtime::EventLoop;
use weft::Error;

#[test]
fn settlement_is_single_assignment() {
    let event_loop = EventLoop::new().unwrap();
    let handle = event_loop.handle();
    let _guard = handle.enter();

    let (promise, resolver) = Promise::pending();
    resolver.resolve(1);
    resolver.resolve(2);
    resolver.reject(Error::ConnectionLost);
    assert_eq!(promise.state(), PromiseState::Fulfilled);

    let value = event_loop.block_on(promise).unwrap().unwrap();
    assert_eq!(*value, 1);
}

#[test]
fn continuations_are_never_invoked_synchronously() {
    let event_loop = EventLoop::new().unwrap();
    let handle = event_loop.handle();
    let _guard = handle.enter();

    let ran = Rc::new(Cell::new(false));

    // registered on a pending promise, then settled: still asynchronous
    let (promise, resolver) = Promise::pending();
    {
        let ran = Rc::clone(&ran);
        promise.then(move |_: Rc<i32>| {
            ran.set(true);
            Ok(())
        });
    }
    resolver.resolve(7);
    assert!(!ran.get(), "settle ran continuation inline");

    // registered on an already-settled promise: scheduled, not inline
    let settled = Promise::fulfilled(1);
    let ran_settled = Rc::new(Cell::new(false));
    {
        let ran_settled = Rc::clone(&ran_settled);
        settled.then(move |_| {
            ran_settled.set(true);
            Ok(())
        });
    }
    assert!(!ran_settled.get(), "registration ran continuation inline");

    event_loop.run().unwrap();
    assert!(ran.get());
    assert!(ran_settled.get());
}

#[test]
fn then_catch_finally_chain() {
    let event_loop = EventLoop::new().unwrap();
    let handle = event_loop.handle();
    let _guard = handle.enter();

    let finalized = Rc::new(Cell::new(0));
    let chain = {
        let finalized = Rc::clone(&finalized);
        Promise::fulfilled(10)
            .then(|v: Rc<i32>| Ok(*v * 2))
            .then(|_: Rc<i32>| -> Result<i32, Error> {
                Err(Error::BadConfig("boom".to_string()))
            })
            .catch(|err| match err {
                Error::BadConfig(_) => Ok(99),
                other => Err(other),
            })
            .finally(move || {
                finalized.set(finalized.get() + 1);
                Ok(())
            })
    };

    let value = event_loop.block_on(chain).unwrap().unwrap();
    assert_eq!(*value, 99);
    assert_eq!(finalized.get(), 1);
}

#[test]
fn finally_error_rejects_the_chain() {
    let event_loop = EventLoop::new().unwrap();
    let handle = event_loop.handle();
    let _guard = handle.enter();

    let chain = Promise::fulfilled(1)
        .finally(|| Err(Error::BadConfig("cleanup failed".to_string())));
    let outcome = event_loop.block_on(chain).unwrap();
    assert!(matches!(outcome, Err(Error::BadConfig(_))));
}

#[test]
fn cancel_before_executor_resolves_wins() {
    let event_loop = EventLoop::new().unwrap();
    let handle = event_loop.handle();
    let _guard = handle.enter();

    let (promise, resolver) = Promise::<i32>::pending();
    promise.cancel();
    resolver.resolve(5);

    assert_eq!(promise.state(), PromiseState::Cancelled);
    let outcome = event_loop.block_on(promise).unwrap();
    assert!(matches!(outcome, Err(Error::Cancelled)));
}

#[test]
fn cancel_handler_runs_once_and_last_registration_wins() {
    let event_loop = EventLoop::new().unwrap();
    let handle = event_loop.handle();
    let _guard = handle.enter();

    let first = Rc::new(Cell::new(0));
    let second = Rc::new(Cell::new(0));

    let (promise, _resolver) = Promise::<i32>::pending();
    {
        let first = Rc::clone(&first);
        promise.on_cancel(move || first.set(first.get() + 1));
    }
    {
        let second = Rc::clone(&second);
        promise.on_cancel(move || second.set(second.get() + 1));
    }

    promise.cancel();
    promise.cancel();

    assert_eq!(first.get(), 0, "replaced handler must not run");
    assert_eq!(second.get(), 1);
    drop(event_loop);
}

#[test]
fn cancellation_skips_pending_continuations() {
    let event_loop = EventLoop::new().unwrap();
    let handle = event_loop.handle();
    let _guard = handle.enter();

    let ran = Rc::new(Cell::new(false));
    let (promise, resolver) = Promise::pending();
    let downstream = {
        let ran = Rc::clone(&ran);
        promise.then(move |_: Rc<i32>| {
            ran.set(true);
            Ok(())
        })
    };

    promise.cancel();
    resolver.resolve(1);

    let outcome = event_loop.block_on(downstream).unwrap();
    assert!(matches!(outcome, Err(Error::Cancelled)));
    assert!(!ran.get(), "continuation ran after root cancellation");
}

#[test]
fn all_preserves_input_order() {
    let event_loop = EventLoop::new().unwrap();
    let handle = event_loop.handle();
    let _guard = handle.enter();

    let slow = delay(Duration::from_millis(30)).then(|_| Ok(1));
    let fast = Promise::fulfilled(2);
    let combined = all(vec![slow, fast]);

    let values = event_loop.block_on(combined).unwrap().unwrap();
    let values: Vec<i32> = values.iter().map(|v| **v).collect();
    assert_eq!(values, vec![1, 2]);
}

#[test]
fn all_rejects_on_first_rejection_and_empty_fulfills() {
    let event_loop = EventLoop::new().unwrap();
    let handle = event_loop.handle();
    let _guard = handle.enter();

    let empty = all(Vec::<Promise<i32>>::new());
    let values = event_loop.block_on(empty).unwrap().unwrap();
    assert!(values.is_empty());

    let failing = all(vec![
        Promise::fulfilled(1),
        Promise::rejected(Error::ConnectionLost),
    ]);
    let outcome = event_loop.block_on(failing).unwrap();
    assert!(matches!(outcome, Err(Error::ConnectionLost)));
}

#[test]
fn any_rejects_only_when_every_input_rejects() {
    let event_loop = EventLoop::new().unwrap();
    let handle = event_loop.handle();
    let _guard = handle.enter();

    let winner = any(vec![
        Promise::rejected(Error::ConnectionLost),
        Promise::fulfilled(3),
    ]);
    assert_eq!(*event_loop.block_on(winner).unwrap().unwrap(), 3);

    let all_failed = any(vec![
        Promise::<i32>::rejected(Error::ConnectionLost),
        Promise::<i32>::rejected(Error::PoolClosing),
    ]);
    match event_loop.block_on(all_failed).unwrap() {
        Err(Error::Aggregate(reasons)) => assert_eq!(reasons.len(), 2),
        other => panic!("unexpected outcome: {other:?}"),
    }
}

#[test]
fn race_adopts_first_settlement_and_cancels_losers() {
    let event_loop = EventLoop::new().unwrap();
    let handle = event_loop.handle();
    let _guard = handle.enter();

    let fast = Promise::fulfilled("fast".to_string());
    let slow = delay(Duration::from_millis(100)).then(|_| Ok("slow".to_string()));
    let raced = race(vec![fast, slow.clone()]);

    let started = Instant::now();
    let value = event_loop.block_on(raced).unwrap().unwrap();
    assert_eq!(*value, "fast");
    assert!(slow.is_cancelled(), "loser was not cancelled");
    assert!(started.elapsed() < Duration::from_millis(100));
}

#[test]
fn batch_runs_slices_sequentially_and_preserves_order() {
    let event_loop = EventLoop::new().unwrap();
    let handle = event_loop.handle();
    let _guard = handle.enter();

    let tasks: Vec<BatchTask<usize>> = (0..6usize)
        .map(|i| {
            Box::new(move || delay(Duration::from_millis(100)).then(move |_| Ok(i)))
                as BatchTask<usize>
        })
        .collect();

    let started = Instant::now();
    let combined = batch(tasks, 2, None);
    let values = event_loop.block_on(combined).unwrap().unwrap();
    let elapsed = started.elapsed();

    let values: Vec<usize> = values.iter().map(|v| **v).collect();
    assert_eq!(values, vec![0, 1, 2, 3, 4, 5]);
    assert!(
        elapsed >= Duration::from_millis(300),
        "slices overlapped: {elapsed:?}"
    );
    assert!(
        elapsed < Duration::from_millis(1500),
        "slices did not run concurrently inside: {elapsed:?}"
    );
}

#[test]
fn batch_first_rejection_cancels_the_rest() {
    let event_loop = EventLoop::new().unwrap();
    let handle = event_loop.handle();
    let _guard = handle.enter();

    let started_count = Rc::new(Cell::new(0usize));
    let tasks: Vec<BatchTask<usize>> = (0..4usize)
        .map(|i| {
            let started_count = Rc::clone(&started_count);
            Box::new(move || {
                started_count.set(started_count.get() + 1);
                if i == 0 {
                    Promise::rejected(Error::BadConfig("task failed".to_string()))
                } else {
                    delay(Duration::from_millis(50)).then(move |_| Ok(i))
                }
            }) as BatchTask<usize>
        })
        .collect();

    let combined = batch(tasks, 2, None);
    let outcome = event_loop.block_on(combined).unwrap();
    assert!(matches!(outcome, Err(Error::BadConfig(_))));
    // the failing slice had started; later slices never ran
    assert!(started_count.get() <= 2);
}

#[test]
fn timeout_rejects_late_tasks_and_cancels_them() {
    let event_loop = EventLoop::new().unwrap();
    let handle = event_loop.handle();
    let _guard = handle.enter();

    let slow = delay(Duration::from_millis(200)).then(|_| Ok(1));
    let guarded = timeout(slow.clone(), Duration::from_millis(30));

    let outcome = event_loop.block_on(guarded).unwrap();
    assert!(matches!(outcome, Err(Error::Timeout(_))));
    assert!(slow.is_cancelled());

    let quick = timeout(Promise::fulfilled(5), Duration::from_secs(5));
    assert_eq!(*event_loop.block_on(quick).unwrap().unwrap(), 5);
}

#[test]
fn unhandled_rejections_reach_the_sink() {
    let event_loop = EventLoop::new().unwrap();
    let handle = event_loop.handle();
    let _guard = handle.enter();

    let reported: Rc<RefCell<Vec<String>>> = Rc::new(RefCell::new(Vec::new()));
    {
        let reported = Rc::clone(&reported);
        handle.set_rejection_sink(move |err| reported.borrow_mut().push(err.to_string()));
    }

    drop(Promise::<i32>::rejected(Error::ConnectionLost));
    assert_eq!(*reported.borrow(), vec!["connection lost".to_string()]);

    // handled rejections stay quiet
    let caught = Promise::<i32>::rejected(Error::ConnectionLost).catch(|_| Ok(0));
    event_loop.block_on(caught).unwrap().unwrap();
    assert_eq!(reported.borrow().len(), 1);
}
