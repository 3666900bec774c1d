use std::collections::VecDeque;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll, Wake, Waker};

use slab::Slab;

type TaskFuture = Pin<Box<dyn Future<Output = ()>>>;

/// Queue of task ids whose wakers fired. The `Mutex` exists only because
/// `std::task::Waker` demands `Send + Sync`; the runtime itself is
/// single-threaded and the lock is never contended.
#[derive(Default)]
pub(crate) struct ReadyQueue {
    ids: Mutex<VecDeque<usize>>,
}

impl ReadyQueue {
    fn push(&self, id: usize) {
        if let Ok(mut ids) = self.ids.lock()
            && !ids.contains(&id)
        {
            ids.push_back(id);
        }
    }

    fn pop(&self) -> Option<usize> {
        self.ids.lock().ok()?.pop_front()
    }

    fn is_empty(&self) -> bool {
        self.ids.lock().map(|ids| ids.is_empty()).unwrap_or(true)
    }
}

struct TaskWaker {
    id: usize,
    ready: Arc<ReadyQueue>,
}

impl Wake for TaskWaker {
    fn wake(self: Arc<Self>) {
        self.ready.push(self.id);
    }
}

/// Holds suspended cooperative tasks and resumes them as their wakers fire.
///
/// A task awaiting a pending promise is parked here: the promise keeps the
/// task's waker and pushes the id onto the ready queue when it settles.
/// `take_ready` + `store` split a resume into two phases so the task body may
/// spawn new tasks while it runs.
pub(crate) struct TaskManager {
    tasks: Slab<Option<TaskFuture>>,
    ready: Arc<ReadyQueue>,
}

impl TaskManager {
    pub fn new() -> Self {
        Self {
            tasks: Slab::new(),
            ready: Arc::new(ReadyQueue::default()),
        }
    }

    pub fn spawn(&mut self, future: impl Future<Output = ()> + 'static) -> usize {
        let id = self.tasks.insert(Some(Box::pin(future)));
        self.ready.push(id);
        id
    }

    /// Detach the next ready task, if any. The caller polls it without
    /// holding the manager borrow and hands it back through [`Self::store`].
    pub fn take_ready(&mut self) -> Option<(usize, TaskFuture)> {
        while let Some(id) = self.ready.pop() {
            // Stale ids (finished tasks, reused slots) are skipped.
            if let Some(slot) = self.tasks.get_mut(id)
                && let Some(future) = slot.take()
            {
                return Some((id, future));
            }
        }
        None
    }

    pub fn store(&mut self, id: usize, future: Option<TaskFuture>) {
        match future {
            Some(future) => {
                if let Some(slot) = self.tasks.get_mut(id) {
                    *slot = Some(future);
                }
            }
            None => {
                let _ = self.tasks.try_remove(id);
            }
        }
    }

    pub fn waker(&self, id: usize) -> Waker {
        Waker::from(Arc::new(TaskWaker {
            id,
            ready: Arc::clone(&self.ready),
        }))
    }

    pub fn has_ready(&self) -> bool {
        !self.ready.is_empty()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }
}

/// Poll a detached task future once.
pub(crate) fn poll_task(future: &mut TaskFuture, waker: &Waker) -> Poll<()> {
    let mut cx = Context::from_waker(waker);
    future.as_mut().poll(&mut cx)
}
