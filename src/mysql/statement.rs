use std::cell::Cell;

use crate::error::Error;
use crate::mysql::command::PreparedInfo;
use crate::mysql::conn::Conn;
use crate::mysql::result::QueryResult;
use crate::promise::Promise;
use crate::protocol::column::Column;
use crate::protocol::value::Param;

/// A prepared statement, pinned to the connection it was prepared on.
///
/// Statement ids are only meaningful to the preparing connection, so every
/// execution runs there. The handle pins the connection: while a statement
/// is open, the pool will not park the connection or hand it to another
/// caller, even after the checkout guard that prepared it has been
/// returned. The pin is released by `close` (or drop).
pub struct Statement {
    conn: Conn,
    statement_id: u32,
    num_params: u16,
    num_columns: u16,
    columns: Vec<Column>,
    closed: Cell<bool>,
}

impl Statement {
    pub(crate) fn new(conn: Conn, info: &PreparedInfo) -> Self {
        conn.pin();
        Self {
            conn,
            statement_id: info.statement_id,
            num_params: info.num_params,
            num_columns: info.num_columns,
            columns: info.columns.clone(),
            closed: Cell::new(false),
        }
    }

    pub fn id(&self) -> u32 {
        self.statement_id
    }

    pub fn param_count(&self) -> u16 {
        self.num_params
    }

    pub fn column_count(&self) -> u16 {
        self.num_columns
    }

    /// Result-set column metadata captured at prepare time.
    pub fn columns(&self) -> &[Column] {
        &self.columns
    }

    /// Execute with the given parameters (binary protocol).
    pub fn exec(&self, params: Vec<Param>) -> Promise<QueryResult> {
        if self.closed.get() {
            return Promise::rejected_with(
                &self.conn_handle(),
                Error::BadConfig("statement is closed".to_string()),
            );
        }
        if params.len() != self.num_params as usize {
            return Promise::rejected_with(
                &self.conn_handle(),
                Error::BadConfig(format!(
                    "statement expects {} parameters, got {}",
                    self.num_params,
                    params.len()
                )),
            );
        }
        self.conn.execute_statement(self.statement_id, &params)
    }

    /// Deallocate the statement on the server and release the connection
    /// pin. Idempotent; COM_STMT_CLOSE has no response, so there is nothing
    /// to await.
    pub fn close(&self) {
        if !self.closed.replace(true) {
            self.conn.close_statement(self.statement_id);
            self.conn.unpin();
        }
    }

    fn conn_handle(&self) -> crate::runtime::Handle {
        // Routing through a rejected promise keeps the error on the loop the
        // statement belongs to.
        self.conn.loop_handle()
    }
}

impl Drop for Statement {
    fn drop(&mut self) {
        self.close();
    }
}
