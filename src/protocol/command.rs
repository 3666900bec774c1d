use zerocopy::byteorder::little_endian::{U16 as U16LE, U32 as U32LE};
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout};

use crate::constant::CommandByte;
use crate::error::{Error, Result};
use crate::protocol::primitive::*;
use crate::protocol::value::{Param, write_execute_params};

/// Write COM_QUERY.
pub fn write_query(out: &mut Vec<u8>, sql: &str) {
    write_u8(out, CommandByte::Query as u8);
    out.extend_from_slice(sql.as_bytes());
}

/// Write COM_STMT_PREPARE.
pub fn write_prepare(out: &mut Vec<u8>, sql: &str) {
    write_u8(out, CommandByte::StmtPrepare as u8);
    out.extend_from_slice(sql.as_bytes());
}

/// Write COM_STMT_EXECUTE: statement id, flags, iteration count, then the
/// parameter block.
pub fn write_execute(out: &mut Vec<u8>, statement_id: u32, params: &[Param]) {
    write_u8(out, CommandByte::StmtExecute as u8);
    write_u32(out, statement_id);
    // CURSOR_TYPE_NO_CURSOR
    write_u8(out, 0x00);
    // iteration count, always 1
    write_u32(out, 1);
    write_execute_params(out, params);
}

/// Write COM_STMT_CLOSE. The server sends no response.
pub fn write_stmt_close(out: &mut Vec<u8>, statement_id: u32) {
    write_u8(out, CommandByte::StmtClose as u8);
    write_u32(out, statement_id);
}

/// Write COM_PING.
pub fn write_ping(out: &mut Vec<u8>) {
    write_u8(out, CommandByte::Ping as u8);
}

/// Write COM_QUIT. The server closes the connection instead of replying.
pub fn write_quit(out: &mut Vec<u8>) {
    write_u8(out, CommandByte::Quit as u8);
}

/// First response packet of COM_QUERY / COM_STMT_EXECUTE.
#[derive(Debug)]
pub enum CommandResponse {
    /// 0x00: the command produced no result set.
    Ok,
    /// A result set follows: this many column definition packets, then rows.
    ResultSet { column_count: u64 },
}

/// Classify the first response packet of a row-producing command.
///
/// ERR packets surface as `Error::Server`; 0xFB (LOCAL INFILE) is not
/// supported.
pub fn parse_command_response(payload: &[u8]) -> Result<CommandResponse> {
    match payload.first() {
        None => Err(Error::UnexpectedEof),
        Some(0xFF) => Err(crate::protocol::response::server_error(payload)),
        Some(0x00) => Ok(CommandResponse::Ok),
        Some(0xFB) => Err(Error::Unsupported(
            "LOCAL INFILE responses are not supported".to_string(),
        )),
        Some(_) => {
            let (column_count, _rest) = read_lenenc_int(payload)?;
            Ok(CommandResponse::ResultSet { column_count })
        }
    }
}

/// COM_STMT_PREPARE OK response (zero-copy view).
///
/// MySQL >= 5.7 and MariaDB send at least twelve bytes: status, statement
/// id, column count, parameter count, one reserved byte, warning count.
#[repr(C, packed)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable)]
pub struct PrepareOk {
    statement_id: U32LE,
    num_columns: U16LE,
    num_params: U16LE,
    _reserved: u8,
    warning_count: U16LE,
}

impl PrepareOk {
    pub fn statement_id(&self) -> u32 {
        self.statement_id.get()
    }

    pub fn num_columns(&self) -> u16 {
        self.num_columns.get()
    }

    pub fn num_params(&self) -> u16 {
        self.num_params.get()
    }

    pub fn warning_count(&self) -> u16 {
        self.warning_count.get()
    }
}

/// Read the payload following a 0x00 status byte of a prepare response.
pub fn parse_prepare_ok(payload: &[u8]) -> Result<PrepareOk> {
    let (status, data) = read_u8(payload)?;
    if status != 0x00 {
        return Err(Error::InvalidPacket);
    }
    if data.len() < 11 {
        return Err(Error::UnexpectedEof);
    }
    PrepareOk::read_from_bytes(&data[..11]).map_err(|_| Error::InvalidPacket)
}

/// Encode a prepare-OK payload (status byte included).
pub fn encode_prepare_ok(out: &mut Vec<u8>, statement_id: u32, num_columns: u16, num_params: u16) {
    write_u8(out, 0x00);
    write_u32(out, statement_id);
    write_u16(out, num_columns);
    write_u16(out, num_params);
    write_u8(out, 0x00);
    write_u16(out, 0);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn command_bytes() {
        let mut out = Vec::new();
        write_query(&mut out, "SELECT 1");
        assert_eq!(out[0], 0x03);
        assert_eq!(&out[1..], b"SELECT 1");

        let mut out = Vec::new();
        write_prepare(&mut out, "SELECT ?");
        assert_eq!(out[0], 0x16);

        let mut out = Vec::new();
        write_stmt_close(&mut out, 7);
        assert_eq!(out, vec![0x19, 7, 0, 0, 0]);

        let mut out = Vec::new();
        write_ping(&mut out);
        assert_eq!(out, vec![0x0e]);

        let mut out = Vec::new();
        write_quit(&mut out);
        assert_eq!(out, vec![0x01]);
    }

    #[test]
    fn execute_header_layout() {
        let mut out = Vec::new();
        write_execute(&mut out, 0x0102_0304, &[]);
        assert_eq!(out, vec![0x17, 0x04, 0x03, 0x02, 0x01, 0x00, 0x01, 0, 0, 0]);
    }

    #[test]
    fn prepare_ok_round_trips() {
        let mut wire = Vec::new();
        encode_prepare_ok(&mut wire, 11, 2, 3);
        let ok = parse_prepare_ok(&wire).unwrap();
        assert_eq!(ok.statement_id(), 11);
        assert_eq!(ok.num_columns(), 2);
        assert_eq!(ok.num_params(), 3);
        assert_eq!(ok.warning_count(), 0);
    }

    #[test]
    fn response_classification() {
        assert!(matches!(
            parse_command_response(&[0x00, 0, 0, 0, 0, 0, 0]).unwrap(),
            CommandResponse::Ok
        ));
        assert!(matches!(
            parse_command_response(&[0x03]).unwrap(),
            CommandResponse::ResultSet { column_count: 3 }
        ));
        assert!(parse_command_response(&[0xFB]).is_err());
        assert!(parse_command_response(&[]).is_err());
    }
}
