use std::cell::RefCell;
use std::collections::VecDeque;
use std::ops::Deref;
use std::rc::{Rc, Weak};

use tracing::{debug, trace};

use crate::error::Error;
use crate::mysql::conn::Conn;
use crate::mysql::transaction::Transaction;
use crate::opts::{Opts, PoolOpts};
use crate::promise::{Promise, Resolver};
use crate::runtime::Handle;

struct PoolInner {
    handle: Handle,
    opts: Opts,
    max: usize,
    /// Connections ready for checkout, oldest first.
    idle: VecDeque<Conn>,
    /// Every live connection, idle or checked out; used by `close`.
    roster: Vec<Conn>,
    /// `|idle| + |busy|`; incremented when a connect starts, decremented
    /// when a connection is discarded or fails to open.
    count: usize,
    /// Acquirers waiting for a slot, woken in arrival order.
    waiters: VecDeque<Resolver<PooledConn>>,
    closed: bool,
}

impl PoolInner {
    fn forget(&mut self, conn: &Conn) {
        if let Some(at) = self.roster.iter().position(|c| c.same_conn(conn)) {
            self.roster.swap_remove(at);
        }
        self.count = self.count.saturating_sub(1);
    }
}

/// Bounded connection pool with FIFO waiters.
///
/// At most `max_connections` connections exist at once; acquisitions beyond
/// that wait in arrival order. Returned guards hand their connection back on
/// drop.
#[derive(Clone)]
pub struct Pool {
    inner: Rc<RefCell<PoolInner>>,
}

impl Pool {
    pub fn new(handle: &Handle, opts: Opts, pool_opts: PoolOpts) -> Self {
        Self {
            inner: Rc::new(RefCell::new(PoolInner {
                handle: handle.clone(),
                opts,
                max: pool_opts.max_connections.max(1),
                idle: VecDeque::new(),
                roster: Vec::new(),
                count: 0,
                waiters: VecDeque::new(),
                closed: false,
            })),
        }
    }

    /// Check a connection out: an idle one when available, a fresh one when
    /// under capacity, otherwise a FIFO wait.
    pub fn acquire(&self) -> Promise<PooledConn> {
        let handle = self.handle();
        let mut guard = self.inner.borrow_mut();
        if guard.closed {
            drop(guard);
            return Promise::rejected_with(&handle, Error::PoolClosing);
        }

        // Skip over connections that died while parked.
        while let Some(conn) = guard.idle.pop_front() {
            if conn.is_usable() {
                trace!("pool: reusing idle connection");
                let pooled = PooledConn::new(conn, Rc::downgrade(&self.inner));
                drop(guard);
                return Promise::fulfilled_with(&handle, pooled);
            }
            guard.forget(&conn);
        }

        if guard.count < guard.max {
            guard.count += 1;
            drop(guard);
            return self.spawn_connection();
        }

        trace!("pool: at capacity, queueing waiter");
        let (promise, resolver) = Promise::pending_with(&handle);
        guard.waiters.push_back(resolver);
        promise
    }

    /// Begin a transaction on an exclusively held connection.
    pub fn begin(&self) -> Promise<Transaction> {
        Transaction::begin(self)
    }

    /// Close every connection, reject every waiter, zero the counts.
    pub fn close(&self) {
        let (waiters, roster) = {
            let mut guard = self.inner.borrow_mut();
            if guard.closed {
                return;
            }
            guard.closed = true;
            guard.idle.clear();
            guard.count = 0;
            (
                std::mem::take(&mut guard.waiters),
                std::mem::take(&mut guard.roster),
            )
        };
        debug!(connections = roster.len(), waiters = waiters.len(), "pool closing");
        for waiter in waiters {
            waiter.reject(Error::PoolClosing);
        }
        for conn in roster {
            conn.close().mark_observed();
        }
    }

    pub fn idle_count(&self) -> usize {
        self.inner.borrow().idle.len()
    }

    pub fn connection_count(&self) -> usize {
        self.inner.borrow().count
    }

    pub fn in_use(&self) -> usize {
        let guard = self.inner.borrow();
        guard.count - guard.idle.len()
    }

    pub fn waiter_count(&self) -> usize {
        self.inner.borrow().waiters.len()
    }

    pub fn max_connections(&self) -> usize {
        self.inner.borrow().max
    }

    fn handle(&self) -> Handle {
        self.inner.borrow().handle.clone()
    }

    /// Open a new connection for an acquirer; the slot was already counted.
    fn spawn_connection(&self) -> Promise<PooledConn> {
        let handle = self.handle();
        let opts = self.inner.borrow().opts.clone();
        let (promise, resolver) = Promise::pending_with(&handle);

        let weak = Rc::downgrade(&self.inner);
        let connect = Conn::connect(&handle, opts);
        connect.subscribe(move |outcome| match outcome {
            Ok(conn) => {
                let conn = (*conn).clone();
                if let Some(inner) = weak.upgrade() {
                    {
                        let mut guard = inner.borrow_mut();
                        if guard.closed {
                            drop(guard);
                            conn.close().mark_observed();
                            resolver.reject(Error::PoolClosing);
                            return;
                        }
                        guard.roster.push(conn.clone());
                    }
                    watch_disconnects(&inner, &conn);
                    resolver.resolve(PooledConn::new(conn, weak));
                } else {
                    conn.close().mark_observed();
                    resolver.reject(Error::PoolClosing);
                }
            }
            Err(err) => {
                if let Some(inner) = weak.upgrade() {
                    {
                        let mut guard = inner.borrow_mut();
                        guard.count = guard.count.saturating_sub(1);
                    }
                    Pool::grant_slot(&inner);
                }
                resolver.reject(err);
            }
        });
        promise
    }

    /// A slot opened up (discard or failed connect): start a connection for
    /// the first waiter, if any.
    fn grant_slot(inner: &Rc<RefCell<PoolInner>>) {
        let should_spawn = {
            let guard = inner.borrow();
            !guard.closed && !guard.waiters.is_empty() && guard.count < guard.max
        };
        if !should_spawn {
            return;
        }
        {
            let mut guard = inner.borrow_mut();
            guard.count += 1;
        }
        let pool = Pool {
            inner: Rc::clone(inner),
        };
        let replacement = pool.spawn_connection();
        let weak = Rc::downgrade(inner);
        replacement.subscribe(move |outcome| {
            let Some(inner) = weak.upgrade() else { return };
            let waiter = inner.borrow_mut().waiters.pop_front();
            let Some(waiter) = waiter else {
                // Nobody is waiting anymore; park the connection.
                if let Ok(pooled) = outcome {
                    drop(pooled);
                }
                return;
            };
            match outcome {
                Ok(pooled) => waiter.settle(Ok(pooled)),
                Err(err) => waiter.reject(err),
            }
        });
    }

    /// Hand a connection back. Called by `PooledConn::drop`.
    fn release(inner: &Rc<RefCell<PoolInner>>, conn: Conn, force_close: bool) {
        let mut guard = inner.borrow_mut();
        if guard.closed {
            drop(guard);
            conn.close().mark_observed();
            return;
        }

        if force_close || conn.is_broken() {
            trace!("pool: discarding returned connection");
            guard.forget(&conn);
            drop(guard);
            conn.close().mark_observed();
            Pool::grant_slot(inner);
            return;
        }

        // An open prepared statement still owns this connection; park it
        // outside the idle set and finish the release when the last pin
        // drops.
        if conn.is_pinned() {
            trace!("pool: returned connection is pinned by a statement");
            drop(guard);
            let weak = Rc::downgrade(inner);
            let parked = conn.clone();
            conn.set_on_unpinned(move || match weak.upgrade() {
                Some(inner) => Pool::release(&inner, parked, false),
                None => parked.close().mark_observed(),
            });
            return;
        }

        if let Some(waiter) = guard.waiters.pop_front() {
            trace!("pool: handing connection to waiter");
            let pooled = PooledConn::new(conn, Rc::downgrade(inner));
            drop(guard);
            waiter.resolve(pooled);
            return;
        }

        guard.idle.push_back(conn);
    }
}

/// Remove the connection from the pool's books when it dies out from under
/// us (server-side close of an idle connection, mid-command failure).
fn watch_disconnects(inner: &Rc<RefCell<PoolInner>>, conn: &Conn) {
    let weak = Rc::downgrade(inner);
    // Identify the connection by address so the callback does not keep a
    // strong handle to its own connection.
    let addr = conn.addr();
    conn.set_on_disconnect(move || {
        let Some(inner) = weak.upgrade() else { return };
        let was_idle = {
            let mut guard = inner.borrow_mut();
            if guard.closed {
                return;
            }
            match guard.idle.iter().position(|c| c.addr() == addr) {
                Some(at) => {
                    if let Some(conn) = guard.idle.remove(at) {
                        guard.forget(&conn);
                    }
                    true
                }
                // A checked-out connection is accounted for when its guard
                // comes back through `release`.
                None => false,
            }
        };
        if was_idle {
            debug!("pool: idle connection lost");
            Pool::grant_slot(&inner);
        }
    });
}

/// Checkout guard: dereferences to [`Conn`] and returns the connection to
/// its pool on drop.
pub struct PooledConn {
    conn: Conn,
    pool: Weak<RefCell<PoolInner>>,
    force_close: std::cell::Cell<bool>,
}

impl PooledConn {
    fn new(conn: Conn, pool: Weak<RefCell<PoolInner>>) -> Self {
        Self {
            conn,
            pool,
            force_close: std::cell::Cell::new(false),
        }
    }

    pub fn conn(&self) -> &Conn {
        &self.conn
    }

    /// Close the connection on return instead of parking it.
    pub fn discard(self) {
        self.force_close.set(true);
    }
}

impl Deref for PooledConn {
    type Target = Conn;

    fn deref(&self) -> &Self::Target {
        &self.conn
    }
}

impl Drop for PooledConn {
    fn drop(&mut self) {
        match self.pool.upgrade() {
            Some(inner) => Pool::release(&inner, self.conn.clone(), self.force_close.get()),
            None => self.conn.close().mark_observed(),
        }
    }
}
