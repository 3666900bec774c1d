use bytes::{Buf, BytesMut};
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout};

use crate::constant::MAX_PAYLOAD_LEN;
use crate::error::{Error, Result};

/// MySQL packet header (zero-copy).
///
/// Wire layout:
/// - length: 3 bytes (little-endian payload length)
/// - sequence_id: 1 byte
#[repr(C, packed)]
#[derive(Debug, Clone, Copy, FromBytes, KnownLayout, Immutable, IntoBytes)]
pub struct PacketHeader {
    pub length: [u8; 3],
    pub sequence_id: u8,
}

impl PacketHeader {
    pub fn encode(length: usize, sequence_id: u8) -> Self {
        let len = u32::to_le_bytes(length as u32);
        Self {
            length: [len[0], len[1], len[2]],
            sequence_id,
        }
    }

    pub fn length(&self) -> usize {
        u32::from_le_bytes([self.length[0], self.length[1], self.length[2], 0]) as usize
    }
}

/// Frame a command payload into `out`.
///
/// Payloads that would need 16 MiB packet splitting are rejected rather
/// than split.
pub fn write_frame(out: &mut Vec<u8>, payload: &[u8], sequence_id: u8) -> Result<()> {
    if payload.len() >= MAX_PAYLOAD_LEN {
        return Err(Error::Unsupported(
            "packet payloads of 16 MiB or more are not supported".to_string(),
        ));
    }
    let header = PacketHeader::encode(payload.len(), sequence_id);
    out.extend_from_slice(header.as_bytes());
    out.extend_from_slice(payload);
    Ok(())
}

/// Peel one whole packet off the front of `buf`, buffering partial reads.
///
/// Returns `(sequence_id, payload)` when a complete packet is available,
/// `None` when more bytes are needed.
pub fn take_packet(buf: &mut BytesMut) -> Result<Option<(u8, BytesMut)>> {
    if buf.len() < 4 {
        return Ok(None);
    }
    let length = u32::from_le_bytes([buf[0], buf[1], buf[2], 0]) as usize;
    if length >= MAX_PAYLOAD_LEN {
        return Err(Error::Unsupported(
            "packet payloads of 16 MiB or more are not supported".to_string(),
        ));
    }
    if buf.len() < 4 + length {
        return Ok(None);
    }
    let sequence_id = buf[3];
    buf.advance(4);
    let payload = buf.split_to(length);
    Ok(Some((sequence_id, payload)))
}
