//! The subset of VelocyPack needed for the VelocyStream transport envelope.
//!
//! Document bodies are opaque to this crate, but the VST request/response headers and the
//! authentication message are small VelocyPack arrays that the transport itself has to produce and read.
//! Encoding always uses the compact array/object layouts since they need no index tables.
//! Decoding accepts every layout a server may send.

use anyhow::{anyhow, Result};
use bytes::{BufMut, Bytes, BytesMut};

#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Null,
    Bool(bool),
    Int(i64),
    UInt(u64),
    Double(f64),
    String(String),
    Binary(Vec<u8>),
    Array(Vec<Value>),
    Object(Vec<(String, Value)>),
}

impl Value {
    pub fn get(&self, key: &str) -> Option<&Value> {
        match self {
            Value::Object(fields) => fields.iter().find(|(k, _)| k == key).map(|(_, v)| v),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(value) => Some(value),
            _ => None,
        }
    }

    pub fn as_u64(&self) -> Option<u64> {
        match self {
            Value::UInt(value) => Some(*value),
            Value::Int(value) => u64::try_from(*value).ok(),
            _ => None,
        }
    }

    pub fn as_array(&self) -> Option<&[Value]> {
        match self {
            Value::Array(values) => Some(values),
            _ => None,
        }
    }

    pub fn as_object(&self) -> Option<&[(String, Value)]> {
        match self {
            Value::Object(fields) => Some(fields),
            _ => None,
        }
    }
}

impl From<&str> for Value {
    fn from(value: &str) -> Self {
        Value::String(value.to_owned())
    }
}

impl From<String> for Value {
    fn from(value: String) -> Self {
        Value::String(value)
    }
}

impl From<i64> for Value {
    fn from(value: i64) -> Self {
        Value::Int(value)
    }
}

impl From<u64> for Value {
    fn from(value: u64) -> Self {
        Value::UInt(value)
    }
}

pub fn encode(value: &Value) -> Bytes {
    let mut dst = BytesMut::new();
    encode_into(value, &mut dst);
    dst.freeze()
}

pub fn encode_into(value: &Value, dst: &mut BytesMut) {
    match value {
        Value::Null => dst.put_u8(0x18),
        Value::Bool(false) => dst.put_u8(0x19),
        Value::Bool(true) => dst.put_u8(0x1a),
        Value::Double(value) => {
            dst.put_u8(0x1b);
            dst.put_f64_le(*value);
        }
        Value::Int(value) => encode_int(*value, dst),
        Value::UInt(value) => encode_uint(*value, dst),
        Value::String(value) => encode_string(value, dst),
        Value::Binary(value) => {
            let len = value.len() as u64;
            let width = uint_width(len);
            dst.put_u8(0xbf + width as u8);
            dst.put_slice(&len.to_le_bytes()[..width]);
            dst.put_slice(value);
        }
        Value::Array(values) if values.is_empty() => dst.put_u8(0x01),
        Value::Array(values) => {
            let mut items = BytesMut::new();
            for value in values {
                encode_into(value, &mut items);
            }
            encode_compact(0x13, &items, values.len(), dst);
        }
        Value::Object(fields) if fields.is_empty() => dst.put_u8(0x0a),
        Value::Object(fields) => {
            let mut items = BytesMut::new();
            for (key, value) in fields {
                encode_string(key, &mut items);
                encode_into(value, &mut items);
            }
            encode_compact(0x14, &items, fields.len(), dst);
        }
    }
}

fn encode_int(value: i64, dst: &mut BytesMut) {
    match value {
        0..=9 => dst.put_u8(0x30 + value as u8),
        -6..=-1 => dst.put_u8((0x40 + value) as u8),
        _ => {
            let width = (1..=8)
                .find(|width| {
                    let bits = 8 * width - 1;
                    width == &8 || (-(1i64 << bits)..(1i64 << bits)).contains(&value)
                })
                .unwrap_or(8);
            dst.put_u8(0x1f + width as u8);
            dst.put_slice(&value.to_le_bytes()[..width]);
        }
    }
}

fn encode_uint(value: u64, dst: &mut BytesMut) {
    if value <= 9 {
        dst.put_u8(0x30 + value as u8);
    } else {
        let width = uint_width(value);
        dst.put_u8(0x27 + width as u8);
        dst.put_slice(&value.to_le_bytes()[..width]);
    }
}

fn encode_string(value: &str, dst: &mut BytesMut) {
    let len = value.len();
    if len <= 126 {
        dst.put_u8(0x40 + len as u8);
    } else {
        dst.put_u8(0xbf);
        dst.put_u64_le(len as u64);
    }
    dst.put_slice(value.as_bytes());
}

fn uint_width(value: u64) -> usize {
    (1..8).find(|width| value >> (8 * width) == 0).unwrap_or(8)
}

fn encode_compact(head: u8, items: &[u8], count: usize, dst: &mut BytesMut) {
    let count_len = varint_len(count as u64);
    let mut total = 2 + items.len() + count_len;
    loop {
        let next = 1 + varint_len(total as u64) + items.len() + count_len;
        if next == total {
            break;
        }
        total = next;
    }
    dst.put_u8(head);
    put_varint(total as u64, dst);
    dst.put_slice(items);
    let mut count_bytes = BytesMut::new();
    put_varint(count as u64, &mut count_bytes);
    count_bytes.reverse();
    dst.put_slice(&count_bytes);
}

fn varint_len(mut value: u64) -> usize {
    let mut len = 1;
    while value >= 0x80 {
        value >>= 7;
        len += 1;
    }
    len
}

fn put_varint(mut value: u64, dst: &mut BytesMut) {
    while value >= 0x80 {
        dst.put_u8((value as u8 & 0x7f) | 0x80);
        value >>= 7;
    }
    dst.put_u8(value as u8);
}

/// Returns the value stored at the start of `src` and the number of bytes it occupies.
pub fn decode(src: &[u8]) -> Result<(Value, usize)> {
    let size = byte_size(src)?;
    let value = decode_value(&src[..size])?;
    Ok((value, size))
}

/// The number of bytes taken up by the value stored at the start of `src`.
pub fn byte_size(src: &[u8]) -> Result<usize> {
    let head = *src
        .first()
        .ok_or_else(|| anyhow!("Cannot read a velocypack value from an empty buffer"))?;
    let size = match head {
        0x01 | 0x0a | 0x18..=0x1a | 0x1e | 0x1f | 0x30..=0x3f => 1,
        // containers store their total length, head byte included
        0x02..=0x09 | 0x0b..=0x12 => read_uint(src, 1, container_width(head))? as usize,
        0x13 | 0x14 => read_varint(src, 1)?.0 as usize,
        0x1b | 0x1c => 9,
        0x20..=0x27 => 1 + (head - 0x1f) as usize,
        0x28..=0x2f => 1 + (head - 0x27) as usize,
        0x40..=0xbe => 1 + (head - 0x40) as usize,
        0xbf => 9 + read_uint(src, 1, 8)? as usize,
        0xc0..=0xc7 => {
            let width = (head - 0xbf) as usize;
            1 + width + read_uint(src, 1, width)? as usize
        }
        head => return Err(anyhow!("Unsupported velocypack type 0x{head:02x}")),
    };
    if size > src.len() || size == 0 {
        return Err(anyhow!(
            "velocypack value of type 0x{head:02x} claims {size} bytes but only {} are available",
            src.len()
        ));
    }
    Ok(size)
}

fn container_width(head: u8) -> usize {
    match head {
        0x02 | 0x06 | 0x0b | 0x0f => 1,
        0x03 | 0x07 | 0x0c | 0x10 => 2,
        0x04 | 0x08 | 0x0d | 0x11 => 4,
        _ => 8,
    }
}

fn decode_value(src: &[u8]) -> Result<Value> {
    let head = src[0];
    Ok(match head {
        0x01 => Value::Array(vec![]),
        0x0a => Value::Object(vec![]),
        0x02..=0x05 => Value::Array(decode_array_without_index(src)?),
        0x06..=0x09 => {
            let offsets = index_table(src)?;
            let values = offsets
                .into_iter()
                .map(|offset| decode(slice_from(src, offset)?).map(|(value, _)| value))
                .collect::<Result<_>>()?;
            Value::Array(values)
        }
        0x0b..=0x12 => {
            let offsets = index_table(src)?;
            let fields = offsets
                .into_iter()
                .map(|offset| decode_field(slice_from(src, offset)?).map(|(field, _)| field))
                .collect::<Result<_>>()?;
            Value::Object(fields)
        }
        0x13 | 0x14 => {
            let (_, length_len) = read_varint(src, 1)?;
            let (count, count_len) = read_reversed_varint(src)?;
            let end = src.len() - count_len;
            let mut position = 1 + length_len;
            if head == 0x13 {
                let mut values = Vec::with_capacity(count as usize);
                for _ in 0..count {
                    let (value, size) = decode(&src[position..end])?;
                    values.push(value);
                    position += size;
                }
                Value::Array(values)
            } else {
                let mut fields = Vec::with_capacity(count as usize);
                for _ in 0..count {
                    let (field, size) = decode_field(&src[position..end])?;
                    fields.push(field);
                    position += size;
                }
                Value::Object(fields)
            }
        }
        0x18 | 0x1e | 0x1f => Value::Null,
        0x19 => Value::Bool(false),
        0x1a => Value::Bool(true),
        0x1b => Value::Double(f64::from_le_bytes(src[1..9].try_into()?)),
        0x1c => Value::Int(read_int(src, 1, 8)?),
        0x20..=0x27 => Value::Int(read_int(src, 1, (head - 0x1f) as usize)?),
        0x28..=0x2f => Value::UInt(read_uint(src, 1, (head - 0x27) as usize)?),
        0x30..=0x39 => Value::Int((head - 0x30) as i64),
        0x3a..=0x3f => Value::Int(head as i64 - 0x40),
        0x40..=0xbe => Value::String(std::str::from_utf8(&src[1..])?.to_owned()),
        0xbf => Value::String(std::str::from_utf8(&src[9..])?.to_owned()),
        0xc0..=0xc7 => Value::Binary(src[1 + (head - 0xbf) as usize..].to_vec()),
        head => return Err(anyhow!("Unsupported velocypack type 0x{head:02x}")),
    })
}

fn decode_field(src: &[u8]) -> Result<((String, Value), usize)> {
    let (key, key_size) = decode(src)?;
    let key = match key {
        Value::String(key) => key,
        // attribute name translations that servers use for system attributes
        Value::Int(1) => "_key".to_owned(),
        Value::Int(2) => "_rev".to_owned(),
        Value::Int(3) => "_id".to_owned(),
        Value::Int(4) => "_from".to_owned(),
        Value::Int(5) => "_to".to_owned(),
        key => return Err(anyhow!("Unsupported velocypack object key {key:?}")),
    };
    let (value, value_size) = decode(slice_from(src, key_size)?)?;
    Ok(((key, value), key_size + value_size))
}

fn decode_array_without_index(src: &[u8]) -> Result<Vec<Value>> {
    let width = container_width(src[0]);
    let mut position = 1 + width;
    // zero padding may precede the first item
    while src.get(position) == Some(&0) {
        position += 1;
    }
    let mut values = vec![];
    while position < src.len() {
        let (value, size) = decode(&src[position..])?;
        values.push(value);
        position += size;
    }
    Ok(values)
}

fn index_table(src: &[u8]) -> Result<Vec<usize>> {
    let head = src[0];
    let width = container_width(head);
    let (count, table_end) = if width == 8 {
        (read_uint(src, src.len().saturating_sub(8), 8)? as usize, src.len() - 8)
    } else {
        (read_uint(src, 1 + width, width)? as usize, src.len())
    };
    let table_start = table_end
        .checked_sub(count * width)
        .ok_or_else(|| anyhow!("velocypack index table does not fit in its container"))?;
    (0..count)
        .map(|i| read_uint(src, table_start + i * width, width).map(|offset| offset as usize))
        .collect()
}

fn slice_from(src: &[u8], offset: usize) -> Result<&[u8]> {
    src.get(offset..)
        .filter(|slice| !slice.is_empty())
        .ok_or_else(|| anyhow!("velocypack offset {offset} is out of bounds"))
}

fn read_uint(src: &[u8], offset: usize, width: usize) -> Result<u64> {
    let bytes = src
        .get(offset..offset + width)
        .ok_or_else(|| anyhow!("velocypack value truncated"))?;
    let mut buf = [0u8; 8];
    buf[..width].copy_from_slice(bytes);
    Ok(u64::from_le_bytes(buf))
}

fn read_int(src: &[u8], offset: usize, width: usize) -> Result<i64> {
    let bytes = src
        .get(offset..offset + width)
        .ok_or_else(|| anyhow!("velocypack value truncated"))?;
    let negative = bytes[width - 1] & 0x80 != 0;
    let mut buf = if negative { [0xff; 8] } else { [0; 8] };
    buf[..width].copy_from_slice(bytes);
    Ok(i64::from_le_bytes(buf))
}

fn read_varint(src: &[u8], offset: usize) -> Result<(u64, usize)> {
    let mut value = 0u64;
    for (i, byte) in src.iter().skip(offset).take(10).enumerate() {
        value |= ((byte & 0x7f) as u64) << (7 * i);
        if byte & 0x80 == 0 {
            return Ok((value, i + 1));
        }
    }
    Err(anyhow!("velocypack varint truncated"))
}

fn read_reversed_varint(src: &[u8]) -> Result<(u64, usize)> {
    let mut value = 0u64;
    for (i, byte) in src.iter().rev().take(10).enumerate() {
        value |= ((byte & 0x7f) as u64) << (7 * i);
        if byte & 0x80 == 0 {
            return Ok((value, i + 1));
        }
    }
    Err(anyhow!("velocypack reversed varint truncated"))
}
