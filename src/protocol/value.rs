use crate::constant::{ColumnType, ColumnFlags};
use crate::error::{Error, Result};
use crate::protocol::column::Column;
use crate::protocol::primitive::*;

/// A statement parameter. The codec picks the wire type from the tag:
/// Null -> MYSQL_TYPE_NULL, Int -> LONGLONG, Float -> DOUBLE,
/// Str/Bytes -> VAR_STRING.
#[derive(Debug, Clone, PartialEq)]
pub enum Param {
    Null,
    Int(i64),
    Float(f64),
    Str(String),
    Bytes(Vec<u8>),
}

impl Param {
    pub fn is_null(&self) -> bool {
        matches!(self, Param::Null)
    }

    fn wire_type(&self) -> u8 {
        match self {
            Param::Null => ColumnType::Null as u8,
            Param::Int(_) => ColumnType::LongLong as u8,
            Param::Float(_) => ColumnType::Double as u8,
            Param::Str(_) | Param::Bytes(_) => ColumnType::Varchar as u8,
        }
    }

    fn write_value(&self, out: &mut Vec<u8>) {
        match self {
            Param::Null => {}
            Param::Int(value) => write_u64(out, *value as u64),
            Param::Float(value) => write_u64(out, value.to_bits()),
            Param::Str(value) => write_lenenc_bytes(out, value.as_bytes()),
            Param::Bytes(value) => write_lenenc_bytes(out, value),
        }
    }
}

impl From<i64> for Param {
    fn from(value: i64) -> Self {
        Param::Int(value)
    }
}

impl From<i32> for Param {
    fn from(value: i32) -> Self {
        Param::Int(value as i64)
    }
}

impl From<u32> for Param {
    fn from(value: u32) -> Self {
        Param::Int(value as i64)
    }
}

impl From<f64> for Param {
    fn from(value: f64) -> Self {
        Param::Float(value)
    }
}

impl From<&str> for Param {
    fn from(value: &str) -> Self {
        Param::Str(value.to_string())
    }
}

impl From<String> for Param {
    fn from(value: String) -> Self {
        Param::Str(value)
    }
}

impl From<Vec<u8>> for Param {
    fn from(value: Vec<u8>) -> Self {
        Param::Bytes(value)
    }
}

impl<T: Into<Param>> From<Option<T>> for Param {
    fn from(value: Option<T>) -> Self {
        match value {
            Some(inner) => inner.into(),
            None => Param::Null,
        }
    }
}

/// Encode the parameter block of a COM_STMT_EXECUTE packet: NULL bitmap,
/// new-params-bound flag, per-parameter types, then values.
pub fn write_execute_params(out: &mut Vec<u8>, params: &[Param]) {
    if params.is_empty() {
        return;
    }

    let mut bitmap = vec![0u8; params.len().div_ceil(8)];
    for (index, param) in params.iter().enumerate() {
        if param.is_null() {
            bitmap[index / 8] |= 1 << (index % 8);
        }
    }
    out.extend_from_slice(&bitmap);

    // new-params-bound
    write_u8(out, 0x01);
    for param in params {
        write_u8(out, param.wire_type());
        write_u8(out, 0x00);
    }
    for param in params {
        param.write_value(out);
    }
}

/// A decoded field value.
///
/// Text-protocol rows surface every non-NULL field as `Bytes`; the binary
/// protocol produces typed variants. Temporal types arrive as their raw
/// binary payload in `Bytes`.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Null,
    Int(i64),
    UInt(u64),
    Float(f64),
    Bytes(Vec<u8>),
}

impl Value {
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Int(v) => Some(*v),
            Value::UInt(v) => i64::try_from(*v).ok(),
            Value::Bytes(raw) => std::str::from_utf8(raw).ok()?.parse().ok(),
            _ => None,
        }
    }

    pub fn as_u64(&self) -> Option<u64> {
        match self {
            Value::UInt(v) => Some(*v),
            Value::Int(v) => u64::try_from(*v).ok(),
            Value::Bytes(raw) => std::str::from_utf8(raw).ok()?.parse().ok(),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Float(v) => Some(*v),
            Value::Int(v) => Some(*v as f64),
            Value::UInt(v) => Some(*v as f64),
            Value::Bytes(raw) => std::str::from_utf8(raw).ok()?.parse().ok(),
            Value::Null => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Bytes(raw) => simdutf8::basic::from_utf8(raw).ok(),
            _ => None,
        }
    }

    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Value::Bytes(raw) => Some(raw),
            _ => None,
        }
    }
}

/// Parse a text-protocol row: one length-encoded string or NULL marker per
/// column.
pub fn parse_text_row(payload: &[u8], num_columns: usize) -> Result<Vec<Value>> {
    let mut values = Vec::with_capacity(num_columns);
    let mut data = payload;
    for _ in 0..num_columns {
        if data.first() == Some(&NULL_MARKER) {
            values.push(Value::Null);
            data = &data[1..];
        } else {
            let (field, rest) = read_lenenc_bytes(data)?;
            values.push(Value::Bytes(field.to_vec()));
            data = rest;
        }
    }
    if !data.is_empty() {
        return Err(Error::InvalidPacket);
    }
    Ok(values)
}

/// Encode a text-protocol row.
pub fn encode_text_row(out: &mut Vec<u8>, values: &[Value]) {
    for value in values {
        match value {
            Value::Null => out.push(NULL_MARKER),
            Value::Bytes(raw) => write_lenenc_bytes(out, raw),
            Value::Int(v) => write_lenenc_bytes(out, v.to_string().as_bytes()),
            Value::UInt(v) => write_lenenc_bytes(out, v.to_string().as_bytes()),
            Value::Float(v) => write_lenenc_bytes(out, v.to_string().as_bytes()),
        }
    }
}

/// Parse a binary-protocol row (COM_STMT_EXECUTE result).
///
/// Layout: 0x00 header, NULL bitmap of `(num_columns + 9) / 8` bytes with a
/// two-bit offset, then typed values for non-NULL columns.
pub fn parse_binary_row(payload: &[u8], columns: &[Column]) -> Result<Vec<Value>> {
    let (header, data) = read_u8(payload)?;
    if header != 0x00 {
        return Err(Error::InvalidPacket);
    }

    let bitmap_len = (columns.len() + 9) / 8;
    let (bitmap, mut data) = read_bytes(data, bitmap_len)?;

    let mut values = Vec::with_capacity(columns.len());
    for (index, column) in columns.iter().enumerate() {
        let bit = index + 2;
        if bitmap[bit / 8] & (1 << (bit % 8)) != 0 {
            values.push(Value::Null);
            continue;
        }
        let (value, rest) = parse_binary_value(column, data)?;
        values.push(value);
        data = rest;
    }
    Ok(values)
}

fn parse_binary_value<'a>(column: &Column, data: &'a [u8]) -> Result<(Value, &'a [u8])> {
    let unsigned = column.flags.contains(ColumnFlags::UNSIGNED_FLAG);
    match column.column_type {
        ColumnType::Null => Ok((Value::Null, data)),

        ColumnType::Tiny => {
            let (raw, rest) = read_u8(data)?;
            let value = if unsigned {
                Value::UInt(raw as u64)
            } else {
                Value::Int(raw as i8 as i64)
            };
            Ok((value, rest))
        }
        ColumnType::Short | ColumnType::Year => {
            let (raw, rest) = read_u16(data)?;
            let value = if unsigned {
                Value::UInt(raw as u64)
            } else {
                Value::Int(raw as i16 as i64)
            };
            Ok((value, rest))
        }
        ColumnType::Long | ColumnType::Int24 => {
            let (raw, rest) = read_u32(data)?;
            let value = if unsigned {
                Value::UInt(raw as u64)
            } else {
                Value::Int(raw as i32 as i64)
            };
            Ok((value, rest))
        }
        ColumnType::LongLong => {
            let (raw, rest) = read_u64(data)?;
            let value = if unsigned {
                Value::UInt(raw)
            } else {
                Value::Int(raw as i64)
            };
            Ok((value, rest))
        }

        ColumnType::Float => {
            let (raw, rest) = read_u32(data)?;
            Ok((Value::Float(f32::from_bits(raw) as f64), rest))
        }
        ColumnType::Double => {
            let (raw, rest) = read_u64(data)?;
            Ok((Value::Float(f64::from_bits(raw)), rest))
        }

        // Temporal values are length-prefixed; surface the raw payload.
        ColumnType::Date
        | ColumnType::Datetime
        | ColumnType::Timestamp
        | ColumnType::Timestamp2
        | ColumnType::Datetime2
        | ColumnType::NewDate
        | ColumnType::Time
        | ColumnType::Time2 => {
            let (len, rest) = read_u8(data)?;
            let (raw, rest) = read_bytes(rest, len as usize)?;
            Ok((Value::Bytes(raw.to_vec()), rest))
        }

        // Everything else is a length-encoded byte string.
        _ => {
            let (raw, rest) = read_lenenc_bytes(data)?;
            Ok((Value::Bytes(raw.to_vec()), rest))
        }
    }
}

/// Encode a binary-protocol row for the given column set.
pub fn encode_binary_row(out: &mut Vec<u8>, columns: &[Column], values: &[Value]) {
    write_u8(out, 0x00);
    let bitmap_len = (columns.len() + 9) / 8;
    let bitmap_at = out.len();
    out.extend(std::iter::repeat_n(0u8, bitmap_len));

    for (index, (column, value)) in columns.iter().zip(values).enumerate() {
        if value.is_null() {
            let bit = index + 2;
            out[bitmap_at + bit / 8] |= 1 << (bit % 8);
            continue;
        }
        match (column.column_type, value) {
            (ColumnType::Tiny, Value::Int(v)) => write_u8(out, *v as u8),
            (ColumnType::Tiny, Value::UInt(v)) => write_u8(out, *v as u8),
            (ColumnType::Short | ColumnType::Year, Value::Int(v)) => write_u16(out, *v as u16),
            (ColumnType::Short | ColumnType::Year, Value::UInt(v)) => write_u16(out, *v as u16),
            (ColumnType::Long | ColumnType::Int24, Value::Int(v)) => write_u32(out, *v as u32),
            (ColumnType::Long | ColumnType::Int24, Value::UInt(v)) => write_u32(out, *v as u32),
            (ColumnType::LongLong, Value::Int(v)) => write_u64(out, *v as u64),
            (ColumnType::LongLong, Value::UInt(v)) => write_u64(out, *v),
            (ColumnType::Float, Value::Float(v)) => write_u32(out, (*v as f32).to_bits()),
            (ColumnType::Double, Value::Float(v)) => write_u64(out, v.to_bits()),
            (_, Value::Bytes(raw)) => write_lenenc_bytes(out, raw),
            (_, Value::Int(v)) => write_lenenc_bytes(out, v.to_string().as_bytes()),
            (_, Value::UInt(v)) => write_lenenc_bytes(out, v.to_string().as_bytes()),
            (_, Value::Float(v)) => write_lenenc_bytes(out, v.to_string().as_bytes()),
            (_, Value::Null) => {}
        }
    }
}
