//! Primitive field types and their wire encodings.
//!
//! | Type        | Encoding                                              |
//! |-------------|-------------------------------------------------------|
//! | `Bool`      | 1 byte, `0x00` or `0x01`                              |
//! | `Int(n)`    | `n` bytes, big-endian unsigned (1 <= n <= 8)          |
//! | `Str`       | 2-byte length + UTF-8 bytes                           |
//! | `Bin`       | 2-byte length + raw bytes                             |
//! | `List(t,n)` | `n`-byte element count + elements of `t`              |
//!
//! List counts are capped at `15/16 * 2^(8n)`.

use crate::error::ProtocolError;
use bytes::{BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Maximum byte length of a `Str` or `Bin` value.
pub const MAX_BLOB_LEN: usize = u16::MAX as usize;

/// The wire type of a single field.
///
/// Schema files write the scalar types as bare names (`bool`, `str`, `bin`)
/// and the sized ones as single-key maps: `{ int: 4 }` or
/// `{ list: { element: str, count_len: 1 } }`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "FieldTypeRaw", into = "FieldTypeRaw")]
pub enum FieldType {
    Bool,
    /// Unsigned integer spanning the given number of bytes.
    Int(u8),
    Str,
    Bin,
    /// List of `element` prefixed by a `count_len`-byte element count.
    List {
        element: Box<FieldType>,
        count_len: u8,
    },
}

#[derive(Serialize, Deserialize)]
#[serde(untagged)]
enum FieldTypeRaw {
    Scalar(ScalarRaw),
    Int { int: u8 },
    List { list: ListRaw },
}

#[derive(Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
enum ScalarRaw {
    Bool,
    Str,
    Bin,
}

#[derive(Serialize, Deserialize)]
struct ListRaw {
    element: Box<FieldType>,
    count_len: u8,
}

impl From<FieldTypeRaw> for FieldType {
    fn from(raw: FieldTypeRaw) -> Self {
        match raw {
            FieldTypeRaw::Scalar(ScalarRaw::Bool) => FieldType::Bool,
            FieldTypeRaw::Scalar(ScalarRaw::Str) => FieldType::Str,
            FieldTypeRaw::Scalar(ScalarRaw::Bin) => FieldType::Bin,
            FieldTypeRaw::Int { int } => FieldType::Int(int),
            FieldTypeRaw::List { list } => FieldType::List {
                element: list.element,
                count_len: list.count_len,
            },
        }
    }
}

impl From<FieldType> for FieldTypeRaw {
    fn from(ty: FieldType) -> Self {
        match ty {
            FieldType::Bool => FieldTypeRaw::Scalar(ScalarRaw::Bool),
            FieldType::Str => FieldTypeRaw::Scalar(ScalarRaw::Str),
            FieldType::Bin => FieldTypeRaw::Scalar(ScalarRaw::Bin),
            FieldType::Int(int) => FieldTypeRaw::Int { int },
            FieldType::List { element, count_len } => FieldTypeRaw::List {
                list: ListRaw { element, count_len },
            },
        }
    }
}

impl FieldType {
    pub fn list(element: FieldType, count_len: u8) -> Self {
        FieldType::List {
            element: Box::new(element),
            count_len,
        }
    }

    /// Maximum element count for a list whose count spans `count_len` bytes.
    pub fn list_cap(count_len: u8) -> u64 {
        let full = 1u128 << (8 * count_len.min(8) as u32);
        (full * 15 / 16).min(u64::MAX as u128) as u64
    }

    /// Checks that widths are within the encodable range.
    pub fn check(&self) -> Result<(), ProtocolError> {
        match self {
            FieldType::Int(n) if !(1..=8).contains(n) => Err(ProtocolError::Encode(format!(
                "integer width {} outside 1..=8",
                n
            ))),
            FieldType::List { element, count_len } => {
                if !(1..=8).contains(count_len) {
                    return Err(ProtocolError::Encode(format!(
                        "list count width {} outside 1..=8",
                        count_len
                    )));
                }
                element.check()
            }
            _ => Ok(()),
        }
    }

    /// Encodes `value` as this type.
    pub fn encode(&self, value: &Value, buf: &mut BytesMut) -> Result<(), ProtocolError> {
        match (self, value) {
            (FieldType::Bool, Value::Bool(b)) => {
                buf.put_u8(u8::from(*b));
            }
            (FieldType::Int(n), Value::Int(v)) => {
                let n = *n as usize;
                if !(1..=8).contains(&n) {
                    return Err(ProtocolError::Encode(format!("integer width {}", n)));
                }
                if n < 8 && *v >> (8 * n) != 0 {
                    return Err(ProtocolError::Encode(format!(
                        "{} does not fit in {} bytes",
                        v, n
                    )));
                }
                buf.put_slice(&v.to_be_bytes()[8 - n..]);
            }
            (FieldType::Str, Value::Str(s)) => put_blob(buf, s.as_bytes())?,
            (FieldType::Bin, Value::Bin(b)) => put_blob(buf, b)?,
            (FieldType::List { element, count_len }, Value::List(items)) => {
                let cap = Self::list_cap(*count_len);
                if items.len() as u64 > cap {
                    return Err(ProtocolError::Encode(format!(
                        "list of {} elements exceeds cap {}",
                        items.len(),
                        cap
                    )));
                }
                let n = *count_len as usize;
                buf.put_slice(&(items.len() as u64).to_be_bytes()[8 - n..]);
                for item in items {
                    element.encode(item, buf)?;
                }
            }
            (ty, value) => {
                return Err(ProtocolError::Encode(format!(
                    "value {} does not match type {}",
                    value, ty
                )))
            }
        }
        Ok(())
    }

    pub(crate) fn decode(&self, reader: &mut Reader<'_>) -> Result<Value, ProtocolError> {
        match self {
            FieldType::Bool => match reader.u8()? {
                0 => Ok(Value::Bool(false)),
                1 => Ok(Value::Bool(true)),
                other => Err(ProtocolError::malformed(format!(
                    "invalid boolean byte {:#04x}",
                    other
                ))),
            },
            FieldType::Int(n) => Ok(Value::Int(reader.uint(*n as usize)?)),
            FieldType::Str => {
                let len = reader.uint(2)? as usize;
                let raw = reader.take(len)?;
                let s = std::str::from_utf8(raw)
                    .map_err(|_| ProtocolError::malformed("invalid UTF-8 in string"))?;
                Ok(Value::Str(s.to_string()))
            }
            FieldType::Bin => {
                let len = reader.uint(2)? as usize;
                Ok(Value::Bin(Bytes::copy_from_slice(reader.take(len)?)))
            }
            FieldType::List { element, count_len } => {
                let count = reader.uint(*count_len as usize)?;
                if count > Self::list_cap(*count_len) {
                    return Err(ProtocolError::malformed(format!(
                        "list count {} exceeds cap",
                        count
                    )));
                }
                // Each element takes at least one byte, so a count beyond the
                // remaining input is only ever truncation.
                let mut items = Vec::with_capacity((count as usize).min(reader.remaining()));
                for _ in 0..count {
                    items.push(element.decode(reader)?);
                }
                Ok(Value::List(items))
            }
        }
    }
}

impl fmt::Display for FieldType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FieldType::Bool => write!(f, "Bool"),
            FieldType::Int(n) => write!(f, "Int({})", n),
            FieldType::Str => write!(f, "Str"),
            FieldType::Bin => write!(f, "Bin"),
            FieldType::List { element, count_len } => {
                write!(f, "List({}, {})", element, count_len)
            }
        }
    }
}

fn put_blob(buf: &mut BytesMut, data: &[u8]) -> Result<(), ProtocolError> {
    if data.len() > MAX_BLOB_LEN {
        return Err(ProtocolError::Encode(format!(
            "{} bytes exceeds maximum length {}",
            data.len(),
            MAX_BLOB_LEN
        )));
    }
    buf.put_u16(data.len() as u16);
    buf.put_slice(data);
    Ok(())
}

/// A decoded field value.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Value {
    Bool(bool),
    Int(u64),
    Str(String),
    Bin(Bytes),
    List(Vec<Value>),
}

impl Value {
    pub fn as_int(&self) -> Option<u64> {
        match self {
            Value::Int(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Str(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_list(&self) -> Option<&[Value]> {
        match self {
            Value::List(items) => Some(items),
            _ => None,
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Bool(b) => write!(f, "{}", b),
            Value::Int(v) => write!(f, "{}", v),
            Value::Str(s) => write!(f, "{:?}", s),
            Value::Bin(b) => write!(f, "<{} bytes>", b.len()),
            Value::List(items) => write!(f, "[{} items]", items.len()),
        }
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Bool(v)
    }
}

impl From<u64> for Value {
    fn from(v: u64) -> Self {
        Value::Int(v)
    }
}

impl From<u32> for Value {
    fn from(v: u32) -> Self {
        Value::Int(v as u64)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::Str(v.to_string())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::Str(v)
    }
}

impl From<Bytes> for Value {
    fn from(v: Bytes) -> Self {
        Value::Bin(v)
    }
}

impl From<Vec<Value>> for Value {
    fn from(v: Vec<Value>) -> Self {
        Value::List(v)
    }
}

/// Cursor over a byte slice that reports truncation as `Incomplete`.
pub(crate) struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    pub(crate) fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    pub(crate) fn position(&self) -> usize {
        self.pos
    }

    pub(crate) fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    pub(crate) fn take(&mut self, n: usize) -> Result<&'a [u8], ProtocolError> {
        if self.remaining() < n {
            return Err(ProtocolError::Incomplete {
                needed: n - self.remaining(),
            });
        }
        let slice = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(slice)
    }

    pub(crate) fn u8(&mut self) -> Result<u8, ProtocolError> {
        Ok(self.take(1)?[0])
    }

    pub(crate) fn uint(&mut self, n: usize) -> Result<u64, ProtocolError> {
        let raw = self.take(n)?;
        Ok(raw.iter().fold(0u64, |acc, b| (acc << 8) | *b as u64))
    }
}
