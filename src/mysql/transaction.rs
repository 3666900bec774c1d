use std::cell::{Cell, RefCell};
use std::rc::Rc;

use tracing::debug;

use crate::error::Error;
use crate::mysql::pool::{Pool, PooledConn};
use crate::mysql::result::QueryResult;
use crate::mysql::statement::Statement;
use crate::promise::Promise;
use crate::protocol::value::Param;

/// A transaction pinned to one pooled connection.
///
/// The connection is held exclusively for the transaction's lifetime and
/// returns to the pool only after COMMIT or ROLLBACK completes. Dropping a
/// transaction that was neither committed nor rolled back issues a
/// best-effort ROLLBACK first.
pub struct Transaction {
    pinned: RefCell<Option<Rc<PooledConn>>>,
    complete: Cell<bool>,
}

impl Transaction {
    /// Acquire a connection, issue `BEGIN`, and hand back the pinned handle.
    pub(crate) fn begin(pool: &Pool) -> Promise<Transaction> {
        pool.acquire().and_then(|pooled| {
            let tx_conn = Rc::clone(&pooled);
            pooled.query_drop("BEGIN").then(move |_| {
                Ok(Transaction {
                    pinned: RefCell::new(Some(tx_conn)),
                    complete: Cell::new(false),
                })
            })
        })
    }

    /// Run a query on the pinned connection.
    pub fn query(&self, sql: &str) -> Promise<QueryResult> {
        match self.conn() {
            Some(conn) => conn.query(sql),
            None => self.completed_error(),
        }
    }

    pub fn query_drop(&self, sql: &str) -> Promise<()> {
        self.query(sql).then(|_| Ok(()))
    }

    /// Prepare a statement on the pinned connection.
    pub fn prepare(&self, sql: &str) -> Promise<Statement> {
        match self.conn() {
            Some(conn) => conn.prepare(sql),
            None => self.completed_error(),
        }
    }

    /// Prepare-and-execute convenience for one-shot parameterized commands.
    pub fn exec(&self, sql: &str, params: Vec<Param>) -> Promise<QueryResult> {
        match self.conn() {
            Some(_) => {
                self.prepare(sql)
                    .and_then(move |stmt| {
                        let result = stmt.exec(params);
                        // the statement handle may go; COM_STMT_CLOSE trails
                        // the execute in the connection queue
                        result.finally(move || {
                            drop(stmt);
                            Ok(())
                        })
                    })
            }
            None => self.completed_error(),
        }
    }

    /// Commit and release the connection back to the pool.
    pub fn commit(&self) -> Promise<()> {
        self.finish("COMMIT")
    }

    /// Roll back and release the connection back to the pool.
    pub fn rollback(&self) -> Promise<()> {
        self.finish("ROLLBACK")
    }

    pub fn is_complete(&self) -> bool {
        self.complete.get()
    }

    fn finish(&self, statement: &str) -> Promise<()> {
        let Some(pinned) = self.pinned.borrow_mut().take() else {
            return self.completed_error();
        };
        self.complete.set(true);
        let release = Rc::clone(&pinned);
        pinned.query_drop(statement).finally(move || {
            // dropping the last guard reference returns the connection
            drop(release);
            Ok(())
        })
    }

    fn conn(&self) -> Option<Rc<PooledConn>> {
        self.pinned.borrow().as_ref().map(Rc::clone)
    }

    fn completed_error<T: 'static>(&self) -> Promise<T> {
        // The pinned connection is gone, so reach the loop through any
        // remaining handle is impossible; use the current context.
        Promise::rejected(Error::BadConfig(
            "transaction already committed or rolled back".to_string(),
        ))
    }
}

impl Drop for Transaction {
    fn drop(&mut self) {
        if self.complete.get() {
            return;
        }
        let Some(pinned) = self.pinned.borrow_mut().take() else {
            return;
        };
        debug!("transaction dropped without commit; rolling back");
        let release = Rc::clone(&pinned);
        pinned
            .query_drop("ROLLBACK")
            .finally(move || {
                drop(release);
                Ok(())
            })
            .mark_observed();
    }
}
