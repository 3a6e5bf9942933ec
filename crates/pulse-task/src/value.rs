//! Task values
//!
//! The value tree exchanged between workers and the main loop, plus its
//! compact binary form. Custom format (no serde): tag byte, LEB128
//! varints, little-endian scalars.
//!
//! [`TaskValue::Shared`] is the deliberate shared-memory escape hatch for
//! the thread backend; it has no binary form and is rejected at the
//! isolate boundary with an error naming the offending type.

use std::any::Any;
use std::sync::Arc;

/// Boundary and framing errors for values crossing an isolate boundary
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BoundaryError {
    #[error(
        "value of type `{type_name}` cannot cross the isolate boundary; \
         only self-contained values are transferable"
    )]
    NotRepresentable { type_name: &'static str },

    #[error("truncated value frame")]
    Truncated,

    #[error("malformed value frame")]
    Malformed,

    #[error("unknown value tag: {0}")]
    UnknownTag(u8),

    #[error("string payload is not valid UTF-8")]
    InvalidUtf8,
}

/// A reference-counted value shared between the main thread and a worker
///
/// Mutation through a `Shared` value is visible on both sides without
/// synchronization beyond what the wrapped type provides. Only the thread
/// and sync backends accept it.
#[derive(Clone)]
pub struct SharedValue {
    type_name: &'static str,
    value: Arc<dyn Any + Send + Sync>,
}

impl SharedValue {
    pub fn new<T: Any + Send + Sync>(value: T) -> Self {
        Self {
            type_name: std::any::type_name::<T>(),
            value: Arc::new(value),
        }
    }

    /// Name of the wrapped Rust type, for diagnostics
    pub fn type_name(&self) -> &'static str {
        self.type_name
    }

    pub fn downcast_ref<T: Any + Send + Sync>(&self) -> Option<&T> {
        self.value.downcast_ref()
    }
}

impl std::fmt::Debug for SharedValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "SharedValue<{}>", self.type_name)
    }
}

/// Value exchanged through task channels
#[derive(Debug, Clone)]
pub enum TaskValue {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    Bytes(Vec<u8>),
    List(Vec<TaskValue>),
    Map(Vec<(String, TaskValue)>),
    Shared(SharedValue),
}

const TAG_NULL: u8 = 0;
const TAG_BOOL: u8 = 1;
const TAG_INT: u8 = 2;
const TAG_FLOAT: u8 = 3;
const TAG_STR: u8 = 4;
const TAG_BYTES: u8 = 5;
const TAG_LIST: u8 = 6;
const TAG_MAP: u8 = 7;

impl TaskValue {
    /// Wrap any `Send + Sync` value for shared-memory transfer
    pub fn shared<T: Any + Send + Sync>(value: T) -> Self {
        Self::Shared(SharedValue::new(value))
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Self::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            Self::Int(n) => Some(*n),
            _ => None,
        }
    }

    pub fn as_float(&self) -> Option<f64> {
        match self {
            Self::Float(x) => Some(*x),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::Str(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Self::Bytes(b) => Some(b),
            _ => None,
        }
    }

    pub fn as_list(&self) -> Option<&[TaskValue]> {
        match self {
            Self::List(items) => Some(items),
            _ => None,
        }
    }

    pub fn as_map(&self) -> Option<&[(String, TaskValue)]> {
        match self {
            Self::Map(entries) => Some(entries),
            _ => None,
        }
    }

    pub fn as_shared(&self) -> Option<&SharedValue> {
        match self {
            Self::Shared(s) => Some(s),
            _ => None,
        }
    }

    /// Serialize into `buf`
    ///
    /// Fails fast on [`TaskValue::Shared`]: such values have no
    /// self-contained form and must not cross an isolate boundary.
    pub fn encode(&self, buf: &mut Vec<u8>) -> Result<(), BoundaryError> {
        match self {
            Self::Null => buf.push(TAG_NULL),
            Self::Bool(b) => {
                buf.push(TAG_BOOL);
                buf.push(u8::from(*b));
            }
            Self::Int(n) => {
                buf.push(TAG_INT);
                write_varint(buf, zigzag_encode(*n));
            }
            Self::Float(x) => {
                buf.push(TAG_FLOAT);
                buf.extend_from_slice(&x.to_le_bytes());
            }
            Self::Str(s) => {
                buf.push(TAG_STR);
                write_varint(buf, s.len() as u64);
                buf.extend_from_slice(s.as_bytes());
            }
            Self::Bytes(b) => {
                buf.push(TAG_BYTES);
                write_varint(buf, b.len() as u64);
                buf.extend_from_slice(b);
            }
            Self::List(items) => {
                buf.push(TAG_LIST);
                write_varint(buf, items.len() as u64);
                for item in items {
                    item.encode(buf)?;
                }
            }
            Self::Map(entries) => {
                buf.push(TAG_MAP);
                write_varint(buf, entries.len() as u64);
                for (key, value) in entries {
                    write_varint(buf, key.len() as u64);
                    buf.extend_from_slice(key.as_bytes());
                    value.encode(buf)?;
                }
            }
            Self::Shared(shared) => {
                return Err(BoundaryError::NotRepresentable {
                    type_name: shared.type_name(),
                });
            }
        }
        Ok(())
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, BoundaryError> {
        let mut buf = Vec::new();
        self.encode(&mut buf)?;
        Ok(buf)
    }

    /// Deserialize one value, returning it and the bytes consumed
    pub fn decode(buf: &[u8]) -> Result<(TaskValue, usize), BoundaryError> {
        let (&tag, rest) = buf.split_first().ok_or(BoundaryError::Truncated)?;
        match tag {
            TAG_NULL => Ok((Self::Null, 1)),
            TAG_BOOL => {
                let (&b, _) = rest.split_first().ok_or(BoundaryError::Truncated)?;
                match b {
                    0 => Ok((Self::Bool(false), 2)),
                    1 => Ok((Self::Bool(true), 2)),
                    _ => Err(BoundaryError::Malformed),
                }
            }
            TAG_INT => {
                let (raw, n) = read_varint(rest)?;
                Ok((Self::Int(zigzag_decode(raw)), 1 + n))
            }
            TAG_FLOAT => {
                if rest.len() < 8 {
                    return Err(BoundaryError::Truncated);
                }
                let mut le = [0u8; 8];
                le.copy_from_slice(&rest[..8]);
                Ok((Self::Float(f64::from_le_bytes(le)), 9))
            }
            TAG_STR => {
                let (bytes, n) = read_len_prefixed(rest)?;
                let s = std::str::from_utf8(bytes).map_err(|_| BoundaryError::InvalidUtf8)?;
                Ok((Self::Str(s.to_string()), 1 + n))
            }
            TAG_BYTES => {
                let (bytes, n) = read_len_prefixed(rest)?;
                Ok((Self::Bytes(bytes.to_vec()), 1 + n))
            }
            TAG_LIST => {
                let (count, mut offset) = read_varint(rest)?;
                let mut items = Vec::new();
                for _ in 0..count {
                    let (item, n) = Self::decode(&rest[offset..])?;
                    items.push(item);
                    offset += n;
                }
                Ok((Self::List(items), 1 + offset))
            }
            TAG_MAP => {
                let (count, mut offset) = read_varint(rest)?;
                let mut entries = Vec::new();
                for _ in 0..count {
                    let (key_bytes, n) = read_len_prefixed(&rest[offset..])?;
                    let key = std::str::from_utf8(key_bytes)
                        .map_err(|_| BoundaryError::InvalidUtf8)?
                        .to_string();
                    offset += n;
                    let (value, n) = Self::decode(&rest[offset..])?;
                    entries.push((key, value));
                    offset += n;
                }
                Ok((Self::Map(entries), 1 + offset))
            }
            other => Err(BoundaryError::UnknownTag(other)),
        }
    }

    pub fn from_bytes(buf: &[u8]) -> Result<TaskValue, BoundaryError> {
        let (value, _) = Self::decode(buf)?;
        Ok(value)
    }
}

impl PartialEq for TaskValue {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Self::Null, Self::Null) => true,
            (Self::Bool(a), Self::Bool(b)) => a == b,
            (Self::Int(a), Self::Int(b)) => a == b,
            (Self::Float(a), Self::Float(b)) => a == b,
            (Self::Str(a), Self::Str(b)) => a == b,
            (Self::Bytes(a), Self::Bytes(b)) => a == b,
            (Self::List(a), Self::List(b)) => a == b,
            (Self::Map(a), Self::Map(b)) => a == b,
            (Self::Shared(a), Self::Shared(b)) => Arc::ptr_eq(&a.value, &b.value),
            _ => false,
        }
    }
}

impl From<bool> for TaskValue {
    fn from(b: bool) -> Self {
        Self::Bool(b)
    }
}

impl From<i32> for TaskValue {
    fn from(n: i32) -> Self {
        Self::Int(i64::from(n))
    }
}

impl From<i64> for TaskValue {
    fn from(n: i64) -> Self {
        Self::Int(n)
    }
}

impl From<f64> for TaskValue {
    fn from(x: f64) -> Self {
        Self::Float(x)
    }
}

impl From<&str> for TaskValue {
    fn from(s: &str) -> Self {
        Self::Str(s.to_string())
    }
}

impl From<String> for TaskValue {
    fn from(s: String) -> Self {
        Self::Str(s)
    }
}

impl From<Vec<u8>> for TaskValue {
    fn from(b: Vec<u8>) -> Self {
        Self::Bytes(b)
    }
}

impl From<Vec<TaskValue>> for TaskValue {
    fn from(items: Vec<TaskValue>) -> Self {
        Self::List(items)
    }
}

fn zigzag_encode(n: i64) -> u64 {
    ((n << 1) ^ (n >> 63)) as u64
}

fn zigzag_decode(raw: u64) -> i64 {
    ((raw >> 1) as i64) ^ -((raw & 1) as i64)
}

/// Write variable-length integer (LEB128)
fn write_varint(buf: &mut Vec<u8>, mut value: u64) {
    loop {
        let mut byte = (value & 0x7F) as u8;
        value >>= 7;
        if value != 0 {
            byte |= 0x80;
        }
        buf.push(byte);
        if value == 0 {
            break;
        }
    }
}

/// Read variable-length integer (LEB128)
fn read_varint(buf: &[u8]) -> Result<(u64, usize), BoundaryError> {
    let mut result: u64 = 0;
    let mut shift = 0;

    for (i, &byte) in buf.iter().enumerate() {
        if shift >= 64 {
            return Err(BoundaryError::Malformed);
        }

        result |= u64::from(byte & 0x7F) << shift;
        shift += 7;

        if byte & 0x80 == 0 {
            return Ok((result, i + 1));
        }
    }

    Err(BoundaryError::Truncated)
}

fn read_len_prefixed(buf: &[u8]) -> Result<(&[u8], usize), BoundaryError> {
    let (len, offset) = read_varint(buf)?;
    let len = len as usize;

    if buf.len() < offset + len {
        return Err(BoundaryError::Truncated);
    }

    Ok((&buf[offset..offset + len], offset + len))
}
