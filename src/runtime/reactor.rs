use std::io;
use std::rc::Rc;
use std::time::Duration;

use mio::event::Source;
use mio::{Events, Interest, Poll, Token};
use slab::Slab;

/// Persistent read callback; invoked on every readable event until the
/// watcher is removed.
pub(crate) type ReadCallback = Rc<dyn Fn()>;
/// One-shot write callback; removed after the first writable event.
pub(crate) type WriteCallback = Box<dyn FnOnce()>;

#[derive(Default)]
struct Watcher {
    read: Option<ReadCallback>,
    write: Option<WriteCallback>,
}

/// Work detached from the reactor during a poll, run after the borrow ends
/// so callbacks are free to touch the reactor again.
pub(crate) enum Firing {
    Read(ReadCallback),
    Write(WriteCallback),
}

/// Readiness polling over a set of registered streams.
///
/// Sources are registered once with combined read/write interest
/// (edge-triggered); whether anything happens on an event is decided by the
/// callbacks currently armed. Writers follow the edge-triggered discipline:
/// callers write until `WouldBlock` first and only then arm a write watcher,
/// so a stored callback always has a wakeup edge coming.
pub(crate) struct Reactor {
    poll: Poll,
    events: Events,
    watchers: Slab<Watcher>,
}

impl Reactor {
    pub fn new() -> io::Result<Self> {
        Ok(Self {
            poll: Poll::new()?,
            events: Events::with_capacity(256),
            watchers: Slab::new(),
        })
    }

    /// Register a stream and return its token. The stream stays registered
    /// until [`Reactor::detach`].
    pub fn attach(&mut self, source: &mut impl Source) -> io::Result<Token> {
        let entry = self.watchers.vacant_entry();
        let token = Token(entry.key());
        self.poll
            .registry()
            .register(source, token, Interest::READABLE | Interest::WRITABLE)?;
        entry.insert(Watcher::default());
        Ok(token)
    }

    pub fn detach(&mut self, source: &mut impl Source, token: Token) {
        if self.watchers.try_remove(token.0).is_some() {
            // A handle that was closed under us is already gone from the
            // poll set; ignore the failure.
            let _ = self.poll.registry().deregister(source);
        }
    }

    /// Drop a watcher whose stream no longer exists; closing the descriptor
    /// already removed it from the poll set.
    pub fn forget(&mut self, token: Token) {
        let _ = self.watchers.try_remove(token.0);
    }

    pub fn set_read(&mut self, token: Token, callback: Option<ReadCallback>) {
        if let Some(watcher) = self.watchers.get_mut(token.0) {
            watcher.read = callback;
        }
    }

    pub fn arm_write(&mut self, token: Token, callback: WriteCallback) {
        if let Some(watcher) = self.watchers.get_mut(token.0) {
            watcher.write = Some(callback);
        }
    }

    pub fn watcher_count(&self) -> usize {
        self.watchers.len()
    }

    /// Poll for readiness. `timeout` of zero never blocks; `None` blocks
    /// until at least one stream is ready. Returns the detached callbacks of
    /// ready streams; an empty return means zero descriptors fired and the
    /// caller dispatches nothing.
    pub fn poll(&mut self, timeout: Option<Duration>) -> io::Result<Vec<Firing>> {
        match self.poll.poll(&mut self.events, timeout) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::Interrupted => return Ok(Vec::new()),
            Err(e) => return Err(e),
        }

        let mut fired = Vec::new();
        for event in self.events.iter() {
            let Some(watcher) = self.watchers.get_mut(event.token().0) else {
                // Stale token: the stream was detached after the event was
                // queued.
                continue;
            };
            // Writers fire first: a connect-completion edge must be observed
            // before any bytes that follow it are read.
            if (event.is_writable() || event.is_write_closed())
                && let Some(cb) = watcher.write.take()
            {
                fired.push(Firing::Write(cb));
            }
            if (event.is_readable() || event.is_read_closed())
                && let Some(cb) = watcher.read.as_ref()
            {
                fired.push(Firing::Read(Rc::clone(cb)));
            }
        }
        Ok(fired)
    }
}
