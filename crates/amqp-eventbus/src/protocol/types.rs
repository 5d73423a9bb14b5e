//! Primitive wire types: integers, short/long strings, bit groups and field
//! tables.
//!
//! Readers consume from a `Bytes` cursor and fail with
//! [`ProtocolError::Truncated`] instead of panicking on short input.

use super::ProtocolError;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::collections::BTreeMap;

/// Field table, ordered so encoding is deterministic.
pub type FieldTable = BTreeMap<String, FieldValue>;

/// A typed value inside a field table or array.
#[derive(Debug, Clone, PartialEq)]
pub enum FieldValue {
    Bool(bool),
    I8(i8),
    U8(u8),
    I16(i16),
    U16(u16),
    I32(i32),
    U32(u32),
    I64(i64),
    F32(f32),
    F64(f64),
    Decimal(u8, u32),
    LongStr(Bytes),
    Array(Vec<FieldValue>),
    Timestamp(u64),
    Table(FieldTable),
    Void,
    Bytes(Bytes),
}

impl FieldValue {
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            FieldValue::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            FieldValue::LongStr(b) => std::str::from_utf8(b).ok(),
            _ => None,
        }
    }

    pub fn string(s: impl Into<String>) -> Self {
        FieldValue::LongStr(Bytes::from(s.into()))
    }
}

fn need(buf: &Bytes, n: usize, what: &'static str) -> Result<(), ProtocolError> {
    if buf.remaining() < n {
        Err(ProtocolError::Truncated(what))
    } else {
        Ok(())
    }
}

pub(crate) fn read_u8(buf: &mut Bytes) -> Result<u8, ProtocolError> {
    need(buf, 1, "octet")?;
    Ok(buf.get_u8())
}

pub(crate) fn read_u16(buf: &mut Bytes) -> Result<u16, ProtocolError> {
    need(buf, 2, "short")?;
    Ok(buf.get_u16())
}

pub(crate) fn read_u32(buf: &mut Bytes) -> Result<u32, ProtocolError> {
    need(buf, 4, "long")?;
    Ok(buf.get_u32())
}

pub(crate) fn read_u64(buf: &mut Bytes) -> Result<u64, ProtocolError> {
    need(buf, 8, "longlong")?;
    Ok(buf.get_u64())
}

pub(crate) fn read_short_str(buf: &mut Bytes) -> Result<String, ProtocolError> {
    let len = read_u8(buf)? as usize;
    need(buf, len, "shortstr")?;
    let raw = buf.split_to(len);
    String::from_utf8(raw.to_vec()).map_err(|_| ProtocolError::InvalidUtf8)
}

pub(crate) fn read_long_bytes(buf: &mut Bytes) -> Result<Bytes, ProtocolError> {
    let len = read_u32(buf)? as usize;
    need(buf, len, "longstr")?;
    Ok(buf.split_to(len))
}

pub(crate) fn read_long_str(buf: &mut Bytes) -> Result<String, ProtocolError> {
    let raw = read_long_bytes(buf)?;
    String::from_utf8(raw.to_vec()).map_err(|_| ProtocolError::InvalidUtf8)
}

/// Read one octet holding up to eight packed bits, least significant first.
pub(crate) fn read_bits<const N: usize>(buf: &mut Bytes) -> Result<[bool; N], ProtocolError> {
    let octet = read_u8(buf)?;
    let mut bits = [false; N];
    for (i, bit) in bits.iter_mut().enumerate() {
        *bit = octet & (1 << i) != 0;
    }
    Ok(bits)
}

pub(crate) fn write_bits(buf: &mut BytesMut, bits: &[bool]) {
    let octet = bits
        .iter()
        .enumerate()
        .fold(0u8, |acc, (i, bit)| if *bit { acc | (1 << i) } else { acc });
    buf.put_u8(octet);
}

pub(crate) fn write_short_str(buf: &mut BytesMut, s: &str) -> Result<(), ProtocolError> {
    let len = u8::try_from(s.len()).map_err(|_| ProtocolError::StringTooLong(s.len()))?;
    buf.put_u8(len);
    buf.put_slice(s.as_bytes());
    Ok(())
}

pub(crate) fn write_long_bytes(buf: &mut BytesMut, b: &[u8]) -> Result<(), ProtocolError> {
    let len = u32::try_from(b.len()).map_err(|_| ProtocolError::StringTooLong(b.len()))?;
    buf.put_u32(len);
    buf.put_slice(b);
    Ok(())
}

pub(crate) fn read_table(buf: &mut Bytes) -> Result<FieldTable, ProtocolError> {
    let mut raw = read_long_bytes(buf)?;
    let mut table = FieldTable::new();
    while raw.has_remaining() {
        let key = read_short_str(&mut raw)?;
        let value = read_value(&mut raw)?;
        table.insert(key, value);
    }
    Ok(table)
}

fn read_value(buf: &mut Bytes) -> Result<FieldValue, ProtocolError> {
    let tag = read_u8(buf)?;
    let value = match tag {
        b't' => FieldValue::Bool(read_u8(buf)? != 0),
        b'b' => FieldValue::I8(read_u8(buf)? as i8),
        b'B' => FieldValue::U8(read_u8(buf)?),
        b's' => FieldValue::I16(read_u16(buf)? as i16),
        b'u' => FieldValue::U16(read_u16(buf)?),
        b'I' => FieldValue::I32(read_u32(buf)? as i32),
        b'i' => FieldValue::U32(read_u32(buf)?),
        b'l' => FieldValue::I64(read_u64(buf)? as i64),
        b'f' => FieldValue::F32(f32::from_bits(read_u32(buf)?)),
        b'd' => FieldValue::F64(f64::from_bits(read_u64(buf)?)),
        b'D' => {
            let scale = read_u8(buf)?;
            FieldValue::Decimal(scale, read_u32(buf)?)
        }
        b'S' => FieldValue::LongStr(read_long_bytes(buf)?),
        b'x' => FieldValue::Bytes(read_long_bytes(buf)?),
        b'T' => FieldValue::Timestamp(read_u64(buf)?),
        b'F' => {
            // read_table consumes its own length prefix
            FieldValue::Table(read_table(buf)?)
        }
        b'A' => {
            let mut raw = read_long_bytes(buf)?;
            let mut items = Vec::new();
            while raw.has_remaining() {
                items.push(read_value(&mut raw)?);
            }
            FieldValue::Array(items)
        }
        b'V' => FieldValue::Void,
        other => return Err(ProtocolError::UnknownFieldType(other)),
    };
    Ok(value)
}

pub(crate) fn write_table(buf: &mut BytesMut, table: &FieldTable) -> Result<(), ProtocolError> {
    let mut body = BytesMut::new();
    for (key, value) in table {
        write_short_str(&mut body, key)?;
        write_value(&mut body, value)?;
    }
    write_long_bytes(buf, &body)
}

fn write_value(buf: &mut BytesMut, value: &FieldValue) -> Result<(), ProtocolError> {
    match value {
        FieldValue::Bool(v) => {
            buf.put_u8(b't');
            buf.put_u8(u8::from(*v));
        }
        FieldValue::I8(v) => {
            buf.put_u8(b'b');
            buf.put_i8(*v);
        }
        FieldValue::U8(v) => {
            buf.put_u8(b'B');
            buf.put_u8(*v);
        }
        FieldValue::I16(v) => {
            buf.put_u8(b's');
            buf.put_i16(*v);
        }
        FieldValue::U16(v) => {
            buf.put_u8(b'u');
            buf.put_u16(*v);
        }
        FieldValue::I32(v) => {
            buf.put_u8(b'I');
            buf.put_i32(*v);
        }
        FieldValue::U32(v) => {
            buf.put_u8(b'i');
            buf.put_u32(*v);
        }
        FieldValue::I64(v) => {
            buf.put_u8(b'l');
            buf.put_i64(*v);
        }
        FieldValue::F32(v) => {
            buf.put_u8(b'f');
            buf.put_f32(*v);
        }
        FieldValue::F64(v) => {
            buf.put_u8(b'd');
            buf.put_f64(*v);
        }
        FieldValue::Decimal(scale, v) => {
            buf.put_u8(b'D');
            buf.put_u8(*scale);
            buf.put_u32(*v);
        }
        FieldValue::LongStr(v) => {
            buf.put_u8(b'S');
            write_long_bytes(buf, v)?;
        }
        FieldValue::Bytes(v) => {
            buf.put_u8(b'x');
            write_long_bytes(buf, v)?;
        }
        FieldValue::Timestamp(v) => {
            buf.put_u8(b'T');
            buf.put_u64(*v);
        }
        FieldValue::Table(t) => {
            buf.put_u8(b'F');
            write_table(buf, t)?;
        }
        FieldValue::Array(items) => {
            buf.put_u8(b'A');
            let mut body = BytesMut::new();
            for item in items {
                write_value(&mut body, item)?;
            }
            write_long_bytes(buf, &body)?;
        }
        FieldValue::Void => buf.put_u8(b'V'),
    }
    Ok(())
}
