//! Asynchronous MySQL client: connection state machine, command queue,
//! bounded pool and transactions, all driven by the event loop.

pub(crate) mod command;
mod conn;
mod pool;
mod result;
mod statement;
mod transaction;

pub use command::PreparedInfo;
pub use conn::{Conn, ConnState};
pub use pool::{Pool, PooledConn};
pub use result::{QueryResult, Row};
pub use statement::Statement;
pub use transaction::Transaction;
