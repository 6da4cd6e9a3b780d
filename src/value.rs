//! Typed values for secondary indexes.
//!
//! Indexed values are serialized with a one-byte discriminator followed by a
//! canonical payload, so the integer `1` and the string `"1"` remain distinct
//! across WAL replay and snapshot reload.
//!
//! Wire layout (network byte order):
//! - `0x01` + 8-byte two's-complement integer
//! - `0x02` + 8-byte IEEE-754 bit pattern
//! - `0x03` + 4-byte length + UTF-8 bytes

use std::fmt;
use std::hash::{Hash, Hasher};

use bytes::{Buf, BufMut};
use serde_json::Value as JsonValue;

use crate::error::{CacheError, Result};

const TAG_INT: u8 = 1;
const TAG_FLOAT: u8 = 2;
const TAG_STR: u8 = 3;

/// A value an item can be indexed under.
///
/// Floats are compared and hashed by bit pattern so the type can live in a
/// `HashMap` key position.
#[derive(Debug, Clone)]
pub enum IndexValue {
    Int(i64),
    Float(f64),
    Str(String),
}

impl IndexValue {
    /// Converts a JSON value into an indexable value, rejecting shapes
    /// outside the supported set (bool, null, array, object).
    pub fn from_json(value: &JsonValue) -> Result<IndexValue> {
        match value {
            JsonValue::Number(n) => {
                if let Some(i) = n.as_i64() {
                    Ok(IndexValue::Int(i))
                } else if let Some(f) = n.as_f64() {
                    Ok(IndexValue::Float(f))
                } else {
                    Err(CacheError::InvalidInput(format!(
                        "unrepresentable numeric index value: {}",
                        n
                    )))
                }
            }
            JsonValue::String(s) => Ok(IndexValue::Str(s.clone())),
            other => Err(CacheError::InvalidInput(format!(
                "index values must be integers, floats, or strings, got {}",
                json_type_name(other)
            ))),
        }
    }

    pub fn encode(&self, buf: &mut impl BufMut) {
        match self {
            IndexValue::Int(i) => {
                buf.put_u8(TAG_INT);
                buf.put_i64(*i);
            }
            IndexValue::Float(f) => {
                buf.put_u8(TAG_FLOAT);
                buf.put_u64(f.to_bits());
            }
            IndexValue::Str(s) => {
                buf.put_u8(TAG_STR);
                buf.put_u32(s.len() as u32);
                buf.put_slice(s.as_bytes());
            }
        }
    }

    pub fn decode(buf: &mut impl Buf) -> Result<IndexValue> {
        if buf.remaining() < 1 {
            return Err(CacheError::Corruption("missing value tag".into()));
        }
        match buf.get_u8() {
            TAG_INT => {
                if buf.remaining() < 8 {
                    return Err(CacheError::Corruption("truncated integer value".into()));
                }
                Ok(IndexValue::Int(buf.get_i64()))
            }
            TAG_FLOAT => {
                if buf.remaining() < 8 {
                    return Err(CacheError::Corruption("truncated float value".into()));
                }
                Ok(IndexValue::Float(f64::from_bits(buf.get_u64())))
            }
            TAG_STR => {
                if buf.remaining() < 4 {
                    return Err(CacheError::Corruption("truncated string length".into()));
                }
                let len = buf.get_u32() as usize;
                if buf.remaining() < len {
                    return Err(CacheError::Corruption("truncated string value".into()));
                }
                let mut bytes = vec![0u8; len];
                buf.copy_to_slice(&mut bytes);
                let s = String::from_utf8(bytes)
                    .map_err(|e| CacheError::Corruption(format!("invalid UTF-8 in value: {}", e)))?;
                Ok(IndexValue::Str(s))
            }
            tag => Err(CacheError::Corruption(format!("unknown value tag: {}", tag))),
        }
    }

    pub fn encoded_len(&self) -> usize {
        match self {
            IndexValue::Int(_) => 1 + 8,
            IndexValue::Float(_) => 1 + 8,
            IndexValue::Str(s) => 1 + 4 + s.len(),
        }
    }
}

impl PartialEq for IndexValue {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (IndexValue::Int(a), IndexValue::Int(b)) => a == b,
            (IndexValue::Float(a), IndexValue::Float(b)) => a.to_bits() == b.to_bits(),
            (IndexValue::Str(a), IndexValue::Str(b)) => a == b,
            _ => false,
        }
    }
}

impl Eq for IndexValue {}

impl Hash for IndexValue {
    fn hash<H: Hasher>(&self, state: &mut H) {
        match self {
            IndexValue::Int(i) => {
                state.write_u8(TAG_INT);
                i.hash(state);
            }
            IndexValue::Float(f) => {
                state.write_u8(TAG_FLOAT);
                f.to_bits().hash(state);
            }
            IndexValue::Str(s) => {
                state.write_u8(TAG_STR);
                s.hash(state);
            }
        }
    }
}

impl fmt::Display for IndexValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IndexValue::Int(i) => write!(f, "{}", i),
            IndexValue::Float(v) => write!(f, "{}", v),
            IndexValue::Str(s) => write!(f, "{:?}", s),
        }
    }
}

fn json_type_name(value: &JsonValue) -> &'static str {
    match value {
        JsonValue::Null => "null",
        JsonValue::Bool(_) => "bool",
        JsonValue::Number(_) => "number",
        JsonValue::String(_) => "string",
        JsonValue::Array(_) => "array",
        JsonValue::Object(_) => "object",
    }
}
