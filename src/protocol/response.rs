use crate::constant::ServerStatusFlags;
use crate::error::{Error, Result};
use crate::protocol::primitive::*;

/// Maximum payload length of an OK packet doubling as a result-set
/// terminator under DEPRECATE_EOF.
pub const EOF_OK_MAX_LEN: usize = 9;

/// Classify the first byte of a response payload.
pub fn is_err_packet(payload: &[u8]) -> bool {
    payload.first() == Some(&0xFF)
}

pub fn is_ok_packet(payload: &[u8]) -> bool {
    payload.first() == Some(&0x00)
}

/// With DEPRECATE_EOF negotiated, result sets end with an OK packet whose
/// first byte is 0xFE and whose payload is shorter than nine bytes.
pub fn is_eof_terminator(payload: &[u8]) -> bool {
    payload.first() == Some(&0xFE) && payload.len() < EOF_OK_MAX_LEN
}

/// Parsed OK packet (also used for the 0xFE terminator form).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OkPayload {
    pub affected_rows: u64,
    pub last_insert_id: u64,
    pub status_flags: ServerStatusFlags,
    pub warnings: u16,
    pub info: String,
}

impl OkPayload {
    pub fn parse(payload: &[u8]) -> Result<Self> {
        let (header, data) = read_u8(payload)?;
        if header != 0x00 && header != 0xFE {
            return Err(Error::InvalidPacket);
        }
        let (affected_rows, data) = read_lenenc_int(data)?;
        let (last_insert_id, data) = read_lenenc_int(data)?;
        let (status, data) = read_u16(data)?;
        let (warnings, data) = read_u16(data)?;

        Ok(Self {
            affected_rows,
            last_insert_id,
            status_flags: ServerStatusFlags::from_bits_truncate(status),
            warnings,
            info: lossy_str(data),
        })
    }

    /// Encode with the ordinary 0x00 header.
    pub fn encode(&self, out: &mut Vec<u8>) {
        self.encode_with_header(out, 0x00);
    }

    /// Encode as a DEPRECATE_EOF result-set terminator (0xFE header).
    pub fn encode_as_terminator(&self, out: &mut Vec<u8>) {
        self.encode_with_header(out, 0xFE);
    }

    fn encode_with_header(&self, out: &mut Vec<u8>, header: u8) {
        write_u8(out, header);
        write_lenenc_int(out, self.affected_rows);
        write_lenenc_int(out, self.last_insert_id);
        write_u16(out, self.status_flags.bits());
        write_u16(out, self.warnings);
        out.extend_from_slice(self.info.as_bytes());
    }
}

impl Default for OkPayload {
    fn default() -> Self {
        Self {
            affected_rows: 0,
            last_insert_id: 0,
            status_flags: ServerStatusFlags::SERVER_STATUS_AUTOCOMMIT,
            warnings: 0,
            info: String::new(),
        }
    }
}

/// Parsed ERR packet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ErrPayload {
    pub code: u16,
    pub sql_state: String,
    pub message: String,
}

impl ErrPayload {
    pub fn parse(payload: &[u8]) -> Result<Self> {
        let (header, data) = read_u8(payload)?;
        if header != 0xFF {
            return Err(Error::InvalidPacket);
        }
        let (code, data) = read_u16(data)?;

        // Optional '#' marker followed by a five-character SQLSTATE.
        let (sql_state, rest) = if data.first() == Some(&b'#') {
            let (state, rest) = read_bytes(&data[1..], 5)?;
            (lossy_str(state), rest)
        } else {
            (String::new(), data)
        };

        Ok(Self {
            code,
            sql_state,
            message: lossy_str(rest),
        })
    }

    pub fn encode(&self, out: &mut Vec<u8>) {
        write_u8(out, 0xFF);
        write_u16(out, self.code);
        if !self.sql_state.is_empty() {
            out.push(b'#');
            out.extend_from_slice(self.sql_state.as_bytes());
        }
        out.extend_from_slice(self.message.as_bytes());
    }
}

impl From<ErrPayload> for Error {
    fn from(err: ErrPayload) -> Self {
        Error::Server {
            code: err.code,
            sql_state: err.sql_state,
            message: err.message,
        }
    }
}

/// Parse an ERR payload straight into the crate error.
pub fn server_error(payload: &[u8]) -> Error {
    match ErrPayload::parse(payload) {
        Ok(err) => err.into(),
        Err(err) => err,
    }
}
