use crate::constant::{ColumnFlags, ColumnType};
use crate::error::{Error, Result};
use crate::protocol::primitive::*;

/// Parsed column definition packet (Protocol::ColumnDefinition41).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Column {
    pub catalog: String,
    pub schema: String,
    pub table: String,
    pub org_table: String,
    pub name: String,
    pub org_name: String,
    pub charset: u16,
    pub column_length: u32,
    pub column_type: ColumnType,
    pub flags: ColumnFlags,
    pub decimals: u8,
}

impl Column {
    pub fn parse(payload: &[u8]) -> Result<Self> {
        let (catalog, data) = read_lenenc_bytes(payload)?;
        let (schema, data) = read_lenenc_bytes(data)?;
        let (table, data) = read_lenenc_bytes(data)?;
        let (org_table, data) = read_lenenc_bytes(data)?;
        let (name, data) = read_lenenc_bytes(data)?;
        let (org_name, data) = read_lenenc_bytes(data)?;

        // length of the fixed tail, always 0x0c
        let (_fixed_len, data) = read_lenenc_int(data)?;
        let (charset, data) = read_u16(data)?;
        let (column_length, data) = read_u32(data)?;
        let (type_byte, data) = read_u8(data)?;
        let column_type = ColumnType::from_u8(type_byte).ok_or(Error::InvalidPacket)?;
        let (flags, data) = read_u16(data)?;
        let (decimals, _data) = read_u8(data)?;

        Ok(Self {
            catalog: lossy_str(catalog),
            schema: lossy_str(schema),
            table: lossy_str(table),
            org_table: lossy_str(org_table),
            name: lossy_str(name),
            org_name: lossy_str(org_name),
            charset,
            column_length,
            column_type,
            flags: ColumnFlags::from_bits_truncate(flags),
            decimals,
        })
    }

    pub fn encode(&self, out: &mut Vec<u8>) {
        write_lenenc_bytes(out, self.catalog.as_bytes());
        write_lenenc_bytes(out, self.schema.as_bytes());
        write_lenenc_bytes(out, self.table.as_bytes());
        write_lenenc_bytes(out, self.org_table.as_bytes());
        write_lenenc_bytes(out, self.name.as_bytes());
        write_lenenc_bytes(out, self.org_name.as_bytes());
        write_lenenc_int(out, 0x0c);
        write_u16(out, self.charset);
        write_u32(out, self.column_length);
        write_u8(out, self.column_type as u8);
        write_u16(out, self.flags.bits());
        write_u8(out, self.decimals);
        // two bytes of filler close the fixed tail
        write_u16(out, 0);
    }

    pub fn is_unsigned(&self) -> bool {
        self.flags.contains(ColumnFlags::UNSIGNED_FLAG)
    }
}
