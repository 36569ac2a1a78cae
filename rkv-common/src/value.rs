//! # Reply Value Model
//!
//! `RedisValue` is the decoded form of any RESP2 reply. Null bulk strings and
//! null arrays are kept distinct from their empty counterparts because the
//! server uses them with different meanings (missing key vs. empty result).
//!
//! The `into_*` projections are what call sites use when they know the reply
//! shape up front. Each one maps a `-` reply to `RkvError::Server` and any
//! other mismatch to `RkvError::UnexpectedReply`.

use std::fmt;

use bytes::Bytes;

use crate::error::{RkvError, RkvResult};

/// Decoded RESP2 reply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RedisValue {
    /// `:123`
    Integer(i64),
    /// `+OK`
    SimpleString(String),
    /// `$5\r\nhello`, with `None` for `$-1`.
    BulkString(Option<Bytes>),
    /// `-ERR ...`
    Error(String),
    /// `*2\r\n...`, with `None` for `*-1`.
    Array(Option<Vec<RedisValue>>),
}

/// Coarse shape of a reply, used in mismatch errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValueKind {
    Integer,
    SimpleString,
    /// A `+OK` status specifically.
    Ok,
    BulkString,
    NullBulkString,
    Error,
    Array,
    NullArray,
}

impl fmt::Display for ValueKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ValueKind::Integer => "integer",
            ValueKind::SimpleString => "simple string",
            ValueKind::Ok => "+OK status",
            ValueKind::BulkString => "bulk string",
            ValueKind::NullBulkString => "null bulk string",
            ValueKind::Error => "error",
            ValueKind::Array => "array",
            ValueKind::NullArray => "null array",
        };
        f.write_str(name)
    }
}

impl RedisValue {
    /// Bulk string from anything convertible to `Bytes`.
    pub fn bulk(data: impl Into<Bytes>) -> Self {
        RedisValue::BulkString(Some(data.into()))
    }

    /// Simple (status) string.
    pub fn simple(text: impl Into<String>) -> Self {
        RedisValue::SimpleString(text.into())
    }

    /// Server error value.
    pub fn error(text: impl Into<String>) -> Self {
        RedisValue::Error(text.into())
    }

    /// Non-null array.
    pub fn array(items: Vec<RedisValue>) -> Self {
        RedisValue::Array(Some(items))
    }

    pub fn kind(&self) -> ValueKind {
        match self {
            RedisValue::Integer(_) => ValueKind::Integer,
            RedisValue::SimpleString(_) => ValueKind::SimpleString,
            RedisValue::BulkString(Some(_)) => ValueKind::BulkString,
            RedisValue::BulkString(None) => ValueKind::NullBulkString,
            RedisValue::Error(_) => ValueKind::Error,
            RedisValue::Array(Some(_)) => ValueKind::Array,
            RedisValue::Array(None) => ValueKind::NullArray,
        }
    }

    /// Length per variant: element count for arrays, byte count for strings.
    ///
    /// Integers, errors and nulls have no length.
    pub fn len(&self) -> Option<usize> {
        match self {
            RedisValue::SimpleString(text) => Some(text.len()),
            RedisValue::BulkString(Some(data)) => Some(data.len()),
            RedisValue::Array(Some(items)) => Some(items.len()),
            _ => None,
        }
    }

    /// True for strings and arrays of length zero.
    pub fn is_empty(&self) -> bool {
        self.len() == Some(0)
    }

    pub fn is_null(&self) -> bool {
        matches!(self, RedisValue::BulkString(None) | RedisValue::Array(None))
    }

    pub fn is_error(&self) -> bool {
        matches!(self, RedisValue::Error(_))
    }

    /// Raw bytes of a simple or bulk string.
    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            RedisValue::SimpleString(text) => Some(text.as_bytes()),
            RedisValue::BulkString(Some(data)) => Some(data),
            _ => None,
        }
    }

    pub fn as_integer(&self) -> Option<i64> {
        match self {
            RedisValue::Integer(value) => Some(*value),
            _ => None,
        }
    }

    /// Turns an `Error` value into `RkvError::Server`, passing anything else
    /// through untouched.
    pub fn into_server_result(self) -> RkvResult<RedisValue> {
        match self {
            RedisValue::Error(message) => Err(RkvError::Server(message)),
            other => Ok(other),
        }
    }

    /// Expects a `+OK` status.
    pub fn into_ok(self) -> RkvResult<()> {
        match self {
            RedisValue::SimpleString(ref text) if text == "OK" => Ok(()),
            RedisValue::Error(message) => Err(RkvError::Server(message)),
            other => Err(mismatch(ValueKind::Ok, &other)),
        }
    }

    pub fn into_integer(self) -> RkvResult<i64> {
        match self {
            RedisValue::Integer(value) => Ok(value),
            RedisValue::Error(message) => Err(RkvError::Server(message)),
            other => Err(mismatch(ValueKind::Integer, &other)),
        }
    }

    /// Integer reply, or `None` for a null bulk/array.
    pub fn into_integer_or_null(self) -> RkvResult<Option<i64>> {
        match self {
            RedisValue::Integer(value) => Ok(Some(value)),
            RedisValue::BulkString(None) | RedisValue::Array(None) => Ok(None),
            RedisValue::Error(message) => Err(RkvError::Server(message)),
            other => Err(mismatch(ValueKind::Integer, &other)),
        }
    }

    /// Bulk payload (or simple string bytes), `None` for null.
    pub fn into_bulk(self) -> RkvResult<Option<Bytes>> {
        match self {
            RedisValue::BulkString(data) => Ok(data),
            RedisValue::SimpleString(text) => Ok(Some(Bytes::from(text))),
            RedisValue::Error(message) => Err(RkvError::Server(message)),
            other => Err(mismatch(ValueKind::BulkString, &other)),
        }
    }

    /// Non-null string reply, decoded lossily as UTF-8.
    pub fn into_string(self) -> RkvResult<String> {
        match self {
            RedisValue::SimpleString(text) => Ok(text),
            RedisValue::BulkString(Some(data)) => Ok(String::from_utf8_lossy(&data).into_owned()),
            RedisValue::Error(message) => Err(RkvError::Server(message)),
            other => Err(mismatch(ValueKind::BulkString, &other)),
        }
    }

    /// Array elements, `None` for a null array.
    pub fn into_array(self) -> RkvResult<Option<Vec<RedisValue>>> {
        match self {
            RedisValue::Array(items) => Ok(items),
            RedisValue::Error(message) => Err(RkvError::Server(message)),
            other => Err(mismatch(ValueKind::Array, &other)),
        }
    }

    /// Array of non-null strings; a null array yields an empty list.
    pub fn into_string_array(self) -> RkvResult<Vec<String>> {
        let items = self.into_array()?.unwrap_or_default();
        items.into_iter().map(RedisValue::into_string).collect()
    }

    /// Array of optional bulk payloads (MGET, HMGET style replies).
    pub fn into_bulk_array(self) -> RkvResult<Vec<Option<Bytes>>> {
        let items = self.into_array()?.unwrap_or_default();
        items.into_iter().map(RedisValue::into_bulk).collect()
    }
}

fn mismatch(expected: ValueKind, actual: &RedisValue) -> RkvError {
    RkvError::UnexpectedReply {
        expected,
        actual: actual.kind(),
    }
}

impl From<i64> for RedisValue {
    fn from(value: i64) -> Self {
        RedisValue::Integer(value)
    }
}

impl From<&str> for RedisValue {
    fn from(value: &str) -> Self {
        RedisValue::bulk(value.to_owned())
    }
}

impl From<Vec<u8>> for RedisValue {
    fn from(value: Vec<u8>) -> Self {
        RedisValue::bulk(value)
    }
}

impl fmt::Display for RedisValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RedisValue::Integer(value) => write!(f, "(integer) {}", value),
            RedisValue::SimpleString(text) => f.write_str(text),
            RedisValue::BulkString(Some(data)) => {
                write!(f, "\"{}\"", String::from_utf8_lossy(data))
            }
            RedisValue::BulkString(None) | RedisValue::Array(None) => f.write_str("(nil)"),
            RedisValue::Error(message) => write!(f, "(error) {}", message),
            RedisValue::Array(Some(items)) if items.is_empty() => f.write_str("(empty array)"),
            RedisValue::Array(Some(items)) => {
                for (idx, item) in items.iter().enumerate() {
                    if idx > 0 {
                        writeln!(f)?;
                    }
                    write!(f, "{}) {}", idx + 1, item)?;
                }
                Ok(())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_len_per_variant() {
        assert_eq!(RedisValue::Integer(7).len(), None);
        assert_eq!(RedisValue::error("ERR").len(), None);
        assert_eq!(RedisValue::simple("OK").len(), Some(2));
        assert_eq!(RedisValue::bulk("héllo").len(), Some(6));
        assert_eq!(RedisValue::BulkString(None).len(), None);
        assert_eq!(RedisValue::array(vec![1.into(), 2.into()]).len(), Some(2));
        assert_eq!(RedisValue::Array(None).len(), None);
    }

    #[test]
    fn test_null_array_differs_from_empty() {
        let null = RedisValue::Array(None);
        let empty = RedisValue::array(Vec::new());
        assert_ne!(null, empty);
        assert!(null.is_null());
        assert!(!empty.is_null());
        assert!(empty.is_empty());
    }

    #[test]
    fn test_into_ok() {
        assert!(RedisValue::simple("OK").into_ok().is_ok());
        match RedisValue::error("ERR wrong").into_ok() {
            Err(RkvError::Server(message)) => assert_eq!(message, "ERR wrong"),
            other => panic!("unexpected: {:?}", other),
        }
        match RedisValue::simple("QUEUED").into_ok() {
            Err(RkvError::UnexpectedReply { expected, actual }) => {
                assert_eq!(expected, ValueKind::Ok);
                assert_eq!(actual, ValueKind::SimpleString);
            }
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[test]
    fn test_integer_or_null() {
        assert_eq!(RedisValue::Integer(3).into_integer_or_null().unwrap(), Some(3));
        assert_eq!(RedisValue::BulkString(None).into_integer_or_null().unwrap(), None);
        assert!(matches!(
            RedisValue::bulk("3").into_integer_or_null(),
            Err(RkvError::UnexpectedReply {
                expected: ValueKind::Integer,
                actual: ValueKind::BulkString
            })
        ));
    }

    #[test]
    fn test_string_array() {
        let value = RedisValue::array(vec!["a".into(), RedisValue::simple("b")]);
        assert_eq!(value.into_string_array().unwrap(), vec!["a", "b"]);
        assert!(RedisValue::Array(None).into_string_array().unwrap().is_empty());
        let with_null = RedisValue::array(vec![RedisValue::BulkString(None)]);
        assert!(with_null.into_string_array().is_err());
    }

    #[test]
    fn test_bulk_array_keeps_nulls() {
        let value = RedisValue::array(vec!["a".into(), RedisValue::BulkString(None)]);
        assert_eq!(
            value.into_bulk_array().unwrap(),
            vec![Some(Bytes::from_static(b"a")), None]
        );
    }

    #[test]
    fn test_display() {
        let value = RedisValue::array(vec!["k".into(), 4.into()]);
        assert_eq!(value.to_string(), "1) \"k\"\n2) (integer) 4");
        assert_eq!(RedisValue::BulkString(None).to_string(), "(nil)");
    }
}
