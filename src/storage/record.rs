//! Row and key codecs
//!
//! Values flow through the engine as a small tagged union. Rows are encoded
//! as a self-describing tuple (field count, per-field type tags, bodies).
//! B-Tree keys use a separate order-preserving encoding so that plain byte
//! comparison of encoded keys matches semantic order: NULL sorts first, INT
//! sorts numerically, STR sorts bytewise.

use std::cmp::Ordering;
use std::fmt;

use byteorder::{BigEndian, ByteOrder, ReadBytesExt};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

// Row codec type tags
const TAG_NULL: u8 = 0;
const TAG_INT: u8 = 1;
const TAG_STR: u8 = 2;

// Key codec type prefixes; ordering of the prefixes is the ordering of types
const KEY_NULL: u8 = 0x01;
const KEY_INT: u8 = 0x02;
const KEY_STR: u8 = 0x03;

/// A value in the database
///
/// `Float` is runtime-only: it is produced by AVG and never stored in a
/// table. Column types are INT and STR.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Value {
    /// NULL value
    Null,
    /// Integer value (64-bit signed)
    Int(i64),
    /// String value
    Str(String),
    /// Fractional value (aggregate results only)
    Float(f64),
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Value::Null, Value::Null) => true,
            (Value::Int(a), Value::Int(b)) => a == b,
            (Value::Str(a), Value::Str(b)) => a == b,
            (Value::Float(a), Value::Float(b)) => a.to_bits() == b.to_bits(),
            (Value::Int(a), Value::Float(b)) | (Value::Float(b), Value::Int(a)) => {
                *a as f64 == *b
            }
            _ => false,
        }
    }
}

impl Value {
    /// Check if this value is NULL
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    /// Get the type name of this value (for error messages)
    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Null => "NULL",
            Value::Int(_) => "INT",
            Value::Str(_) => "STR",
            Value::Float(_) => "FLOAT",
        }
    }

    /// Compare two values. NULL compares equal to NULL and below everything
    /// else (the ordering used by keys and ORDER BY); mixing numeric and
    /// string operands is a type error.
    pub fn compare(&self, other: &Value) -> Result<Ordering> {
        match (self, other) {
            (Value::Null, Value::Null) => Ok(Ordering::Equal),
            (Value::Null, _) => Ok(Ordering::Less),
            (_, Value::Null) => Ok(Ordering::Greater),
            (Value::Int(a), Value::Int(b)) => Ok(a.cmp(b)),
            (Value::Str(a), Value::Str(b)) => Ok(a.as_bytes().cmp(b.as_bytes())),
            (Value::Float(a), Value::Float(b)) => {
                Ok(a.partial_cmp(b).unwrap_or(Ordering::Equal))
            }
            (Value::Int(a), Value::Float(b)) => Ok((*a as f64)
                .partial_cmp(b)
                .unwrap_or(Ordering::Equal)),
            (Value::Float(a), Value::Int(b)) => Ok(a
                .partial_cmp(&(*b as f64))
                .unwrap_or(Ordering::Equal)),
            (a, b) => Err(Error::TypeMismatch(a.type_name(), b.type_name())),
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => write!(f, "NULL"),
            Value::Int(i) => write!(f, "{}", i),
            Value::Str(s) => write!(f, "{}", s),
            Value::Float(x) => write!(f, "{}", x),
        }
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Int(v)
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

/// A row: a tuple whose column order matches the schema
pub type Row = Vec<Value>;

/// Encode a row. Header is the field count and one type tag per field,
/// followed by the bodies: INT fixed 8-byte big-endian signed, STR
/// u32-length-prefixed UTF-8, NULL no body.
pub fn encode_row(row: &[Value]) -> Result<Vec<u8>> {
    let mut buf = Vec::with_capacity(2 + row.len() * 9);
    buf.extend_from_slice(&(row.len() as u16).to_be_bytes());
    for value in row {
        match value {
            Value::Null => buf.push(TAG_NULL),
            Value::Int(_) => buf.push(TAG_INT),
            Value::Str(_) => buf.push(TAG_STR),
            Value::Float(_) => {
                return Err(Error::Internal(
                    "float values are not storable".to_string(),
                ))
            }
        }
    }
    for value in row {
        match value {
            Value::Null => {}
            Value::Int(i) => buf.extend_from_slice(&i.to_be_bytes()),
            Value::Str(s) => {
                buf.extend_from_slice(&(s.len() as u32).to_be_bytes());
                buf.extend_from_slice(s.as_bytes());
            }
            Value::Float(_) => unreachable!(),
        }
    }
    Ok(buf)
}

/// Decode a row previously produced by [`encode_row`].
pub fn decode_row(buf: &[u8]) -> Result<Row> {
    let mut cursor = std::io::Cursor::new(buf);
    let count = cursor
        .read_u16::<BigEndian>()
        .map_err(|_| Error::Corrupt("row header truncated".to_string()))? as usize;
    let mut tags = vec![0u8; count];
    std::io::Read::read_exact(&mut cursor, &mut tags)
        .map_err(|_| Error::Corrupt("row tags truncated".to_string()))?;

    let mut row = Vec::with_capacity(count);
    for tag in tags {
        let value = match tag {
            TAG_NULL => Value::Null,
            TAG_INT => Value::Int(
                cursor
                    .read_i64::<BigEndian>()
                    .map_err(|_| Error::Corrupt("row int truncated".to_string()))?,
            ),
            TAG_STR => {
                let len = cursor
                    .read_u32::<BigEndian>()
                    .map_err(|_| Error::Corrupt("row string length truncated".to_string()))?
                    as usize;
                let start = cursor.position() as usize;
                let end = start + len;
                if end > buf.len() {
                    return Err(Error::Corrupt("row string truncated".to_string()));
                }
                let s = std::str::from_utf8(&buf[start..end])
                    .map_err(|_| Error::Corrupt("row string is not UTF-8".to_string()))?
                    .to_string();
                cursor.set_position(end as u64);
                Value::Str(s)
            }
            other => {
                return Err(Error::Corrupt(format!("unknown row type tag {}", other)));
            }
        };
        row.push(value);
    }
    Ok(row)
}

/// Encode values as an order-preserving key: byte comparison of the result
/// matches [`Value::compare`] component-wise. Each component is
/// self-delimiting, so composite keys (index value followed by the primary
/// key) concatenate correctly.
///
/// - NULL: type prefix only (sorts before everything)
/// - INT: prefix + 8-byte big-endian with the sign bit flipped
/// - STR: prefix + bytes with 0x00 escaped as 0x00 0xFF, terminated 0x00 0x00
pub fn encode_key(values: &[Value]) -> Result<Vec<u8>> {
    let mut buf = Vec::new();
    for value in values {
        match value {
            Value::Null => buf.push(KEY_NULL),
            Value::Int(i) => {
                buf.push(KEY_INT);
                let mut bytes = [0u8; 8];
                BigEndian::write_u64(&mut bytes, (*i as u64) ^ (1u64 << 63));
                buf.extend_from_slice(&bytes);
            }
            Value::Str(s) => {
                buf.push(KEY_STR);
                for &b in s.as_bytes() {
                    if b == 0x00 {
                        buf.push(0x00);
                        buf.push(0xFF);
                    } else {
                        buf.push(b);
                    }
                }
                buf.push(0x00);
                buf.push(0x00);
            }
            Value::Float(_) => {
                return Err(Error::Internal("float values are not indexable".to_string()))
            }
        }
    }
    Ok(buf)
}

/// Decode an order-preserving key back into its components. Inverse of
/// [`encode_key`]; index scans use it to recover `(value, pk)` pairs from
/// composite index keys.
pub fn decode_key(buf: &[u8]) -> Result<Vec<Value>> {
    let mut values = Vec::new();
    let mut pos = 0;
    while pos < buf.len() {
        match buf[pos] {
            KEY_NULL => {
                values.push(Value::Null);
                pos += 1;
            }
            KEY_INT => {
                if pos + 9 > buf.len() {
                    return Err(Error::Corrupt("key int truncated".to_string()));
                }
                let raw = BigEndian::read_u64(&buf[pos + 1..pos + 9]);
                values.push(Value::Int((raw ^ (1u64 << 63)) as i64));
                pos += 9;
            }
            KEY_STR => {
                pos += 1;
                let mut bytes = Vec::new();
                loop {
                    if pos >= buf.len() {
                        return Err(Error::Corrupt("key string unterminated".to_string()));
                    }
                    if buf[pos] == 0x00 {
                        if pos + 1 >= buf.len() {
                            return Err(Error::Corrupt("key string unterminated".to_string()));
                        }
                        match buf[pos + 1] {
                            0x00 => {
                                pos += 2;
                                break;
                            }
                            0xFF => {
                                bytes.push(0x00);
                                pos += 2;
                            }
                            _ => {
                                return Err(Error::Corrupt(
                                    "bad escape in key string".to_string(),
                                ))
                            }
                        }
                    } else {
                        bytes.push(buf[pos]);
                        pos += 1;
                    }
                }
                let s = String::from_utf8(bytes)
                    .map_err(|_| Error::Corrupt("key string is not UTF-8".to_string()))?;
                values.push(Value::Str(s));
            }
            other => {
                return Err(Error::Corrupt(format!("unknown key type prefix {}", other)));
            }
        }
    }
    Ok(values)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_row_roundtrip() {
        let row = vec![
            Value::Int(42),
            Value::Str("hello".to_string()),
            Value::Null,
            Value::Int(-7),
            Value::Str(String::new()),
        ];
        let encoded = encode_row(&row).unwrap();
        assert_eq!(decode_row(&encoded).unwrap(), row);
    }

    #[test]
    fn test_row_rejects_float() {
        assert!(encode_row(&[Value::Float(1.5)]).is_err());
    }

    #[test]
    fn test_decode_rejects_garbage() {
        assert!(decode_row(&[0xFF]).is_err());
        let encoded = encode_row(&[Value::Str("abc".to_string())]).unwrap();
        assert!(decode_row(&encoded[..encoded.len() - 1]).is_err());
    }

    #[test]
    fn test_value_compare() {
        assert_eq!(
            Value::Int(5).compare(&Value::Int(3)).unwrap(),
            Ordering::Greater
        );
        assert_eq!(
            Value::Str("abc".into()).compare(&Value::Str("abd".into())).unwrap(),
            Ordering::Less
        );
        assert_eq!(Value::Null.compare(&Value::Int(0)).unwrap(), Ordering::Less);
        assert_eq!(
            Value::Int(2).compare(&Value::Float(1.5)).unwrap(),
            Ordering::Greater
        );
        assert!(Value::Int(1).compare(&Value::Str("1".into())).is_err());
    }

    fn key1(v: Value) -> Vec<u8> {
        encode_key(std::slice::from_ref(&v)).unwrap()
    }

    #[test]
    fn test_key_order_matches_semantic_order() {
        // NULL < any INT < any STR
        assert!(key1(Value::Null) < key1(Value::Int(i64::MIN)));
        assert!(key1(Value::Int(i64::MAX)) < key1(Value::Str(String::new())));

        // INT sorts numerically across the sign boundary
        let ints = [i64::MIN, -100, -1, 0, 1, 7, 100, i64::MAX];
        for pair in ints.windows(2) {
            assert!(key1(Value::Int(pair[0])) < key1(Value::Int(pair[1])));
        }

        // STR sorts bytewise, including prefixes and embedded NULs
        assert!(key1(Value::Str("a".into())) < key1(Value::Str("ab".into())));
        assert!(key1(Value::Str("a".into())) < key1(Value::Str("a\u{0}b".into())));
        assert!(key1(Value::Str("a\u{0}b".into())) < key1(Value::Str("ab".into())));
    }

    #[test]
    fn test_key_roundtrip() {
        let values = vec![
            Value::Null,
            Value::Int(-42),
            Value::Str("hello\u{0}world".to_string()),
            Value::Int(i64::MAX),
            Value::Str(String::new()),
        ];
        let encoded = encode_key(&values).unwrap();
        assert_eq!(decode_key(&encoded).unwrap(), values);
    }

    #[test]
    fn test_composite_key_order() {
        let k = |v: i64, pk: i64| encode_key(&[Value::Str("x".into()), Value::Int(v), Value::Int(pk)]);
        // Same prefix: ordered by the second then third component.
        assert!(k(1, 9).unwrap() < k(2, 0).unwrap());
        assert!(k(1, 1).unwrap() < k(1, 2).unwrap());

        // A short string component never swallows the following component.
        let a = encode_key(&[Value::Str("a".into()), Value::Int(5)]).unwrap();
        let ab = encode_key(&[Value::Str("ab".into()), Value::Int(0)]).unwrap();
        assert!(a < ab);
    }
}
