//! Canonical CBOR encoding for deterministic serialization.
//!
//! This module implements RFC 8949 Core Deterministic Encoding:
//! - Map keys sorted by encoded byte comparison
//! - Integers use smallest valid encoding
//! - Definite lengths only
//!
//! DAG nodes, manifests and log entries are all hashed over these bytes, so
//! two peers holding the same structure always derive the same identifiers.
//! Decoding is strict: input that does not re-encode to the exact same bytes
//! is rejected, which keeps one structure from having two addresses.

use ciborium::value::{Integer, Value};

use crate::error::CoreError;

/// Build an integer map key.
pub fn key(k: u64) -> Value {
    Value::Integer(k.into())
}

/// Encode a CBOR value to canonical bytes.
pub fn encode_value(value: &Value) -> Vec<u8> {
    let mut buf = Vec::new();
    encode_value_to(&mut buf, value);
    buf
}

/// Decode bytes that must already be in canonical form.
pub fn decode_canonical(bytes: &[u8]) -> Result<Value, CoreError> {
    let value: Value =
        ciborium::from_reader(bytes).map_err(|e| CoreError::DecodingError(e.to_string()))?;
    if encode_value(&value) != bytes {
        return Err(CoreError::DecodingError("non-canonical encoding".into()));
    }
    Ok(value)
}

/// Recursively encode a CBOR value.
fn encode_value_to(buf: &mut Vec<u8>, value: &Value) {
    match value {
        Value::Integer(i) => encode_integer(buf, *i),
        Value::Bytes(b) => {
            encode_uint(buf, 2, b.len() as u64);
            buf.extend_from_slice(b);
        }
        Value::Text(s) => {
            encode_uint(buf, 3, s.len() as u64);
            buf.extend_from_slice(s.as_bytes());
        }
        Value::Array(arr) => {
            encode_uint(buf, 4, arr.len() as u64);
            for item in arr {
                encode_value_to(buf, item);
            }
        }
        Value::Map(entries) => encode_map_canonical(buf, entries),
        Value::Tag(tag, inner) => {
            encode_uint(buf, 6, *tag);
            encode_value_to(buf, inner);
        }
        Value::Bool(b) => buf.push(if *b { 0xf5 } else { 0xf4 }),
        Value::Null => buf.push(0xf6),
        Value::Float(f) => {
            buf.push(0xfb);
            buf.extend_from_slice(&f.to_be_bytes());
        }
        // Value is non_exhaustive; nothing we build falls through here.
        _ => buf.push(0xf7),
    }
}

/// Encode a CBOR integer (major types 0 and 1).
fn encode_integer(buf: &mut Vec<u8>, i: Integer) {
    let n = i128::from(i);
    if n >= 0 {
        encode_uint(buf, 0, n as u64);
    } else {
        // CBOR encodes -1 as 0, -2 as 1, etc.
        encode_uint(buf, 1, (-1 - n) as u64);
    }
}

/// Encode an unsigned integer with the given major type.
fn encode_uint(buf: &mut Vec<u8>, major: u8, n: u64) {
    let mt = major << 5;
    if n < 24 {
        buf.push(mt | (n as u8));
    } else if n <= 0xff {
        buf.push(mt | 24);
        buf.push(n as u8);
    } else if n <= 0xffff {
        buf.push(mt | 25);
        buf.extend_from_slice(&(n as u16).to_be_bytes());
    } else if n <= 0xffff_ffff {
        buf.push(mt | 26);
        buf.extend_from_slice(&(n as u32).to_be_bytes());
    } else {
        buf.push(mt | 27);
        buf.extend_from_slice(&n.to_be_bytes());
    }
}

/// Encode a map canonically (major type 5), keys sorted by encoded bytes.
fn encode_map_canonical(buf: &mut Vec<u8>, entries: &[(Value, Value)]) {
    let mut pairs: Vec<(Vec<u8>, &Value)> = entries
        .iter()
        .map(|(k, v)| (encode_value(k), v))
        .collect();
    pairs.sort_by(|a, b| a.0.cmp(&b.0));

    encode_uint(buf, 5, pairs.len() as u64);
    for (key_bytes, value) in pairs {
        buf.extend_from_slice(&key_bytes);
        encode_value_to(buf, value);
    }
}

/// Typed accessor over a decoded integer-keyed map.
pub struct MapReader<'a> {
    what: &'static str,
    entries: &'a [(Value, Value)],
}

impl<'a> MapReader<'a> {
    /// Wrap a value that must be a map.
    pub fn new(what: &'static str, value: &'a Value) -> Result<Self, CoreError> {
        match value {
            Value::Map(entries) => Ok(Self { what, entries }),
            _ => Err(CoreError::DecodingError(format!("{}: expected map", what))),
        }
    }

    fn err(&self, field: &str, problem: &str) -> CoreError {
        CoreError::DecodingError(format!("{}.{}: {}", self.what, field, problem))
    }

    /// Raw lookup by integer key.
    pub fn get(&self, k: u64) -> Option<&'a Value> {
        self.entries
            .iter()
            .find(|(kv, _)| matches!(kv, Value::Integer(i) if i128::from(*i) == k as i128))
            .map(|(_, v)| v)
    }

    fn require(&self, k: u64, field: &str) -> Result<&'a Value, CoreError> {
        self.get(k).ok_or_else(|| self.err(field, "missing"))
    }

    pub fn int(&self, k: u64, field: &str) -> Result<i128, CoreError> {
        match self.require(k, field)? {
            Value::Integer(i) => Ok(i128::from(*i)),
            _ => Err(self.err(field, "expected integer")),
        }
    }

    pub fn uint(&self, k: u64, field: &str) -> Result<u64, CoreError> {
        let n = self.int(k, field)?;
        u64::try_from(n).map_err(|_| self.err(field, "out of range"))
    }

    pub fn text(&self, k: u64, field: &str) -> Result<&'a str, CoreError> {
        match self.require(k, field)? {
            Value::Text(s) => Ok(s.as_str()),
            _ => Err(self.err(field, "expected text")),
        }
    }

    pub fn bytes(&self, k: u64, field: &str) -> Result<&'a [u8], CoreError> {
        match self.require(k, field)? {
            Value::Bytes(b) => Ok(b.as_slice()),
            _ => Err(self.err(field, "expected bytes")),
        }
    }

    pub fn bytes32(&self, k: u64, field: &str) -> Result<[u8; 32], CoreError> {
        self.bytes(k, field)?
            .try_into()
            .map_err(|_| self.err(field, "expected 32 bytes"))
    }

    /// A 32-byte field that may be null.
    pub fn opt_bytes32(&self, k: u64, field: &str) -> Result<Option<[u8; 32]>, CoreError> {
        match self.get(k) {
            None | Some(Value::Null) => Ok(None),
            Some(_) => self.bytes32(k, field).map(Some),
        }
    }

    pub fn array(&self, k: u64, field: &str) -> Result<&'a [Value], CoreError> {
        match self.require(k, field)? {
            Value::Array(a) => Ok(a.as_slice()),
            _ => Err(self.err(field, "expected array")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_integer_encoding() {
        let mut buf = Vec::new();
        encode_uint(&mut buf, 0, 23);
        assert_eq!(buf, vec![0x17]);

        buf.clear();
        encode_uint(&mut buf, 0, 24);
        assert_eq!(buf, vec![0x18, 24]);

        buf.clear();
        encode_uint(&mut buf, 0, 256);
        assert_eq!(buf, vec![0x19, 0x01, 0x00]);

        buf.clear();
        encode_integer(&mut buf, Integer::from(-1i64));
        assert_eq!(buf, vec![0x20]);
    }

    #[test]
    fn test_map_key_ordering() {
        let value = Value::Map(vec![
            (key(8), Value::Integer(80.into())),
            (key(0), Value::Integer(0.into())),
            (key(5), Value::Integer(50.into())),
        ]);
        let buf = encode_value(&value);
        assert_eq!(buf, vec![0xa3, 0x00, 0x00, 0x05, 0x18, 50, 0x08, 0x18, 80]);
    }

    #[test]
    fn test_decode_canonical_roundtrip() {
        let value = Value::Map(vec![
            (key(1), Value::Text("body".into())),
            (key(0), Value::Bytes(vec![1, 2, 3])),
        ]);
        let bytes = encode_value(&value);
        let decoded = decode_canonical(&bytes).unwrap();
        let reader = MapReader::new("test", &decoded).unwrap();
        assert_eq!(reader.text(1, "name").unwrap(), "body");
        assert_eq!(reader.bytes(0, "data").unwrap(), &[1, 2, 3]);
        assert!(reader.text(9, "absent").is_err());
    }

    #[test]
    fn test_decode_rejects_non_canonical() {
        // 5 encoded with a one-byte length prefix instead of inline.
        assert!(decode_canonical(&[0x18, 0x05]).is_err());
        // Map with keys out of order.
        assert!(decode_canonical(&[0xa2, 0x01, 0x00, 0x00, 0x00]).is_err());
    }

    proptest::proptest! {
        #[test]
        fn test_map_encoding_ignores_entry_order(
            entries in proptest::collection::btree_map(0u64..1_000_000, proptest::collection::vec(0u8..=255, 0..40), 0..12),
            rotate in 0usize..12,
        ) {
            let pairs: Vec<(Value, Value)> = entries
                .iter()
                .map(|(k, v)| (key(*k), Value::Bytes(v.clone())))
                .collect();
            let mut rotated = pairs.clone();
            if !rotated.is_empty() {
                let by = rotate % rotated.len();
                rotated.rotate_left(by);
            }
            rotated.reverse();

            let a = encode_value(&Value::Map(pairs));
            let b = encode_value(&Value::Map(rotated));
            proptest::prop_assert_eq!(&a, &b);
            proptest::prop_assert!(decode_canonical(&a).is_ok());
        }
    }
}
