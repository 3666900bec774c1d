//! Per-command response drivers.
//!
//! Each in-flight command owns a small state machine that is fed one packet
//! at a time by the connection and settles the command's promise when the
//! final packet arrives. Server errors fail only the command; malformed
//! packets bubble up as fatal connection errors.

use std::rc::Rc;

use crate::error::{Error, Result};
use crate::mysql::result::{QueryResult, Row};
use crate::promise::Resolver;
use crate::protocol::column::Column;
use crate::protocol::command::{CommandResponse, PrepareOk, parse_command_response, parse_prepare_ok};
use crate::protocol::response::{OkPayload, is_eof_terminator, is_err_packet, server_error};
use crate::protocol::value::{parse_binary_row, parse_text_row};

/// What the connection should do after feeding a packet to the driver.
#[derive(Debug)]
pub(crate) enum Step {
    /// More packets belong to this command.
    Continue,
    /// The command is complete and its promise is settled.
    Done,
}

pub(crate) trait ResponseDriver {
    fn on_packet(&mut self, payload: &[u8]) -> Result<Step>;

    /// Reject the command's promise; called on server errors, fatal
    /// connection errors and queue teardown.
    fn fail(self: Box<Self>, err: Error);

    /// Whether the server answers this command at all (COM_STMT_CLOSE and
    /// COM_QUIT are fire-and-forget).
    fn expects_response(&self) -> bool {
        true
    }

    /// Settle a response-less command once its bytes are flushed.
    fn complete_without_response(self: Box<Self>) {}
}

/// Result-set reading phase shared by the text and binary protocols.
enum RowsState {
    FirstPacket,
    Columns { remaining: usize },
    Rows,
}

/// Drives COM_QUERY (text rows) or COM_STMT_EXECUTE (binary rows).
pub(crate) struct QueryDriver {
    state: RowsState,
    binary: bool,
    columns: Vec<Column>,
    shared_columns: Rc<Vec<Column>>,
    rows: Vec<Row>,
    resolver: Resolver<QueryResult>,
}

impl QueryDriver {
    pub fn text(resolver: Resolver<QueryResult>) -> Self {
        Self::new(resolver, false)
    }

    pub fn binary(resolver: Resolver<QueryResult>) -> Self {
        Self::new(resolver, true)
    }

    fn new(resolver: Resolver<QueryResult>, binary: bool) -> Self {
        Self {
            state: RowsState::FirstPacket,
            binary,
            columns: Vec::new(),
            shared_columns: Rc::new(Vec::new()),
            rows: Vec::new(),
            resolver,
        }
    }

    fn finish(&mut self, terminator: OkPayload) {
        let result = QueryResult {
            columns: Rc::clone(&self.shared_columns),
            rows: std::mem::take(&mut self.rows),
            affected_rows: terminator.affected_rows,
            last_insert_id: terminator.last_insert_id,
            warnings: terminator.warnings,
            status_flags: terminator.status_flags,
        };
        self.resolver.resolve(result);
    }
}

impl ResponseDriver for QueryDriver {
    fn on_packet(&mut self, payload: &[u8]) -> Result<Step> {
        match &mut self.state {
            RowsState::FirstPacket => match parse_command_response(payload)? {
                CommandResponse::Ok => {
                    let ok = OkPayload::parse(payload)?;
                    self.resolver.resolve(QueryResult::without_rows(
                        ok.affected_rows,
                        ok.last_insert_id,
                        ok.warnings,
                        ok.status_flags,
                    ));
                    Ok(Step::Done)
                }
                CommandResponse::ResultSet { column_count } => {
                    let remaining = column_count as usize;
                    self.columns.reserve(remaining);
                    self.state = RowsState::Columns { remaining };
                    Ok(Step::Continue)
                }
            },

            RowsState::Columns { remaining } => {
                self.columns.push(Column::parse(payload)?);
                *remaining -= 1;
                if *remaining == 0 {
                    self.shared_columns = Rc::new(std::mem::take(&mut self.columns));
                    self.state = RowsState::Rows;
                }
                Ok(Step::Continue)
            }

            RowsState::Rows => {
                if is_err_packet(payload) {
                    return Err(server_error(payload));
                }
                if is_eof_terminator(payload) {
                    let terminator = OkPayload::parse(payload)?;
                    self.finish(terminator);
                    return Ok(Step::Done);
                }
                let values = if self.binary {
                    parse_binary_row(payload, &self.shared_columns)?
                } else {
                    parse_text_row(payload, self.shared_columns.len())?
                };
                self.rows.push(Row {
                    columns: Rc::clone(&self.shared_columns),
                    values,
                });
                Ok(Step::Continue)
            }
        }
    }

    fn fail(self: Box<Self>, err: Error) {
        self.resolver.reject(err);
    }
}

/// Metadata produced by COM_STMT_PREPARE.
#[derive(Debug, Clone)]
pub struct PreparedInfo {
    pub statement_id: u32,
    pub num_params: u16,
    pub num_columns: u16,
    pub columns: Vec<Column>,
}

enum PrepareState {
    AwaitingOk,
    ParamDefs { remaining: usize },
    ColumnDefs { remaining: usize },
}

/// Drives COM_STMT_PREPARE: prepare-OK, then the parameter definition group,
/// then the column definition group. Empty groups are skipped; under
/// DEPRECATE_EOF the groups have no terminators.
pub(crate) struct PrepareDriver {
    state: PrepareState,
    meta: Option<PrepareOk>,
    columns: Vec<Column>,
    resolver: Resolver<PreparedInfo>,
}

impl PrepareDriver {
    pub fn new(resolver: Resolver<PreparedInfo>) -> Self {
        Self {
            state: PrepareState::AwaitingOk,
            meta: None,
            columns: Vec::new(),
            resolver,
        }
    }

    fn finish(&mut self) -> Result<Step> {
        let meta = self.meta.take().ok_or(Error::InvalidPacket)?;
        self.resolver.resolve(PreparedInfo {
            statement_id: meta.statement_id(),
            num_params: meta.num_params(),
            num_columns: meta.num_columns(),
            columns: std::mem::take(&mut self.columns),
        });
        Ok(Step::Done)
    }
}

impl ResponseDriver for PrepareDriver {
    fn on_packet(&mut self, payload: &[u8]) -> Result<Step> {
        match &mut self.state {
            PrepareState::AwaitingOk => {
                if is_err_packet(payload) {
                    return Err(server_error(payload));
                }
                let meta = parse_prepare_ok(payload)?;
                let params = meta.num_params() as usize;
                let columns = meta.num_columns() as usize;
                self.meta = Some(meta);
                if params > 0 {
                    self.state = PrepareState::ParamDefs { remaining: params };
                    Ok(Step::Continue)
                } else if columns > 0 {
                    self.state = PrepareState::ColumnDefs { remaining: columns };
                    Ok(Step::Continue)
                } else {
                    self.finish()
                }
            }

            PrepareState::ParamDefs { remaining } => {
                // Parameter definitions are validated but not kept.
                Column::parse(payload)?;
                *remaining -= 1;
                if *remaining == 0 {
                    let columns = self
                        .meta
                        .as_ref()
                        .map(|m| m.num_columns() as usize)
                        .unwrap_or(0);
                    if columns > 0 {
                        self.state = PrepareState::ColumnDefs { remaining: columns };
                    } else {
                        return self.finish();
                    }
                }
                Ok(Step::Continue)
            }

            PrepareState::ColumnDefs { remaining } => {
                self.columns.push(Column::parse(payload)?);
                *remaining -= 1;
                if *remaining == 0 {
                    return self.finish();
                }
                Ok(Step::Continue)
            }
        }
    }

    fn fail(self: Box<Self>, err: Error) {
        self.resolver.reject(err);
    }
}

/// Drives commands answered by a single OK packet (COM_PING, BEGIN-style
/// bookkeeping is done by the caller on top of `QueryDriver`).
pub(crate) struct OkDriver {
    resolver: Resolver<()>,
}

impl OkDriver {
    pub fn new(resolver: Resolver<()>) -> Self {
        Self { resolver }
    }
}

impl ResponseDriver for OkDriver {
    fn on_packet(&mut self, payload: &[u8]) -> Result<Step> {
        if is_err_packet(payload) {
            return Err(server_error(payload));
        }
        OkPayload::parse(payload)?;
        self.resolver.resolve(());
        Ok(Step::Done)
    }

    fn fail(self: Box<Self>, err: Error) {
        self.resolver.reject(err);
    }
}

/// Fire-and-forget commands: COM_STMT_CLOSE, COM_QUIT.
pub(crate) struct SilentDriver {
    resolver: Option<Resolver<()>>,
}

impl SilentDriver {
    pub fn new(resolver: Option<Resolver<()>>) -> Self {
        Self { resolver }
    }
}

impl ResponseDriver for SilentDriver {
    fn on_packet(&mut self, _payload: &[u8]) -> Result<Step> {
        // The server never answers these commands.
        Err(Error::InvalidPacket)
    }

    fn fail(self: Box<Self>, err: Error) {
        if let Some(resolver) = self.resolver {
            resolver.reject(err);
        }
    }

    fn expects_response(&self) -> bool {
        false
    }

    fn complete_without_response(self: Box<Self>) {
        if let Some(resolver) = self.resolver {
            resolver.resolve(());
        }
    }
}
