//! Photon GpBinary value decoder.
//!
//! The game serializes operation parameters as a flat sequence of
//! `(param_id: u8, type_tag: u8, value)` triples, where a value may itself be
//! a typed array or dictionary. This module decodes that encoding into a
//! [`Value`] tree and a [`ParameterTree`] keyed by parameter id.
//!
//! Decoding is deliberately forgiving: an unknown tag or a truncated buffer
//! aborts the current dictionary but never discards what was already decoded.
//! Callers receive the partial [`ParameterTree`] plus the error that stopped
//! the scan, matching the "skip this unit of data" philosophy of the rest of
//! the pipeline.
use std::collections::BTreeMap;
use thiserror::Error;

pub const TYPE_NIL: u8 = 42;
pub const TYPE_DICTIONARY: u8 = 68;
pub const TYPE_INT8: u8 = 98;
pub const TYPE_DOUBLE: u8 = 100;
pub const TYPE_FLOAT: u8 = 102;
pub const TYPE_INT32: u8 = 105;
pub const TYPE_INT16: u8 = 107;
pub const TYPE_INT64: u8 = 108;
pub const TYPE_BOOLEAN: u8 = 111;
pub const TYPE_STRING: u8 = 115;
pub const TYPE_BYTE_ARRAY: u8 = 120;
pub const TYPE_ARRAY: u8 = 121;

/// Decoded parameter dictionary of one request/response/event.
pub type ParameterTree = BTreeMap<u8, Value>;

/// Nesting ceiling for container values. Real traffic nests a handful of
/// levels; a crafted message could otherwise cost one stack frame per three
/// bytes of input.
const MAX_VALUE_DEPTH: u32 = 32;

#[derive(Debug, Error, Clone, PartialEq)]
pub enum ValueError {
    #[error("unknown type tag {0}")]
    UnknownTag(u8),
    #[error("buffer truncated while reading {0}")]
    Truncated(&'static str),
    #[error("value nesting deeper than {0} levels")]
    TooDeep(u32),
}

/// One decoded Photon value. Immutable once decoded.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Nil,
    Int8(i8),
    Int16(i16),
    Int32(i32),
    Int64(i64),
    Float(f32),
    Double(f64),
    Bool(bool),
    Str(String),
    Bytes(Vec<u8>),
    Array(Vec<Value>),
    // Dictionary keys are arbitrary values, so pairs instead of a map.
    Map(Vec<(Value, Value)>),
}

impl Value {
    /// Integer view across all signed widths, `None` for everything else.
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Int8(v) => Some(*v as i64),
            Value::Int16(v) => Some(*v as i64),
            Value::Int32(v) => Some(*v as i64),
            Value::Int64(v) => Some(*v),
            _ => None,
        }
    }

    /// Integer view with the signed-byte unsigned-wrap correction: the game
    /// transmits ids and amounts in [128, 255] as negative Int8 values.
    pub fn as_wrapped_i64(&self) -> Option<i64> {
        match self {
            Value::Int8(v) => Some(*v as u8 as i64),
            other => other.as_i64(),
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Str(s) => Some(s),
            _ => None,
        }
    }
}

/// Big-endian cursor over a borrowed byte slice.
pub struct ByteReader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> ByteReader<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    pub fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    fn take(&mut self, n: usize, what: &'static str) -> Result<&'a [u8], ValueError> {
        if self.remaining() < n {
            return Err(ValueError::Truncated(what));
        }
        let s = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(s)
    }

    pub fn read_u8(&mut self, what: &'static str) -> Result<u8, ValueError> {
        Ok(self.take(1, what)?[0])
    }

    pub fn read_u16(&mut self, what: &'static str) -> Result<u16, ValueError> {
        let b = self.take(2, what)?;
        Ok(u16::from_be_bytes([b[0], b[1]]))
    }

    pub fn read_i16(&mut self, what: &'static str) -> Result<i16, ValueError> {
        Ok(self.read_u16(what)? as i16)
    }

    pub fn read_u32(&mut self, what: &'static str) -> Result<u32, ValueError> {
        let b = self.take(4, what)?;
        Ok(u32::from_be_bytes([b[0], b[1], b[2], b[3]]))
    }

    pub fn read_i32(&mut self, what: &'static str) -> Result<i32, ValueError> {
        Ok(self.read_u32(what)? as i32)
    }

    pub fn read_i64(&mut self, what: &'static str) -> Result<i64, ValueError> {
        let b = self.take(8, what)?;
        let mut tmp = [0u8; 8];
        tmp.copy_from_slice(b);
        Ok(i64::from_be_bytes(tmp))
    }

    pub fn read_bytes(&mut self, n: usize, what: &'static str) -> Result<&'a [u8], ValueError> {
        self.take(n, what)
    }
}

/// Decode one value for `tag`, advancing the cursor exactly by the bytes the
/// tag requires.
pub fn decode_value(r: &mut ByteReader<'_>, tag: u8) -> Result<Value, ValueError> {
    decode_value_at(r, tag, 0)
}

fn decode_value_at(r: &mut ByteReader<'_>, tag: u8, depth: u32) -> Result<Value, ValueError> {
    if depth > MAX_VALUE_DEPTH {
        return Err(ValueError::TooDeep(MAX_VALUE_DEPTH));
    }
    match tag {
        TYPE_NIL => Ok(Value::Nil),
        TYPE_INT8 => Ok(Value::Int8(r.read_u8("int8")? as i8)),
        TYPE_INT16 => Ok(Value::Int16(r.read_i16("int16")?)),
        TYPE_INT32 => Ok(Value::Int32(r.read_i32("int32")?)),
        TYPE_INT64 => Ok(Value::Int64(r.read_i64("int64")?)),
        TYPE_FLOAT => Ok(Value::Float(f32::from_bits(r.read_u32("float32")?))),
        TYPE_DOUBLE => Ok(Value::Double(f64::from_bits(
            r.read_i64("float64")? as u64
        ))),
        TYPE_BOOLEAN => Ok(Value::Bool(r.read_u8("bool")? != 0)),
        TYPE_STRING => {
            let len = r.read_u16("string length")? as usize;
            let bytes = r.read_bytes(len, "string bytes")?;
            Ok(Value::Str(String::from_utf8_lossy(bytes).into_owned()))
        }
        TYPE_BYTE_ARRAY => {
            let len = r.read_u32("byte array length")? as usize;
            Ok(Value::Bytes(r.read_bytes(len, "byte array")?.to_vec()))
        }
        TYPE_ARRAY => {
            let len = r.read_u16("array length")? as usize;
            let elem_tag = r.read_u8("array element tag")?;
            let mut out = Vec::with_capacity(len.min(r.remaining()));
            for _ in 0..len {
                out.push(decode_value_at(r, elem_tag, depth + 1)?);
            }
            Ok(Value::Array(out))
        }
        TYPE_DICTIONARY => {
            let key_tag = r.read_u8("dict key tag")?;
            let val_tag = r.read_u8("dict value tag")?;
            let size = r.read_u16("dict size")? as usize;
            let mut out = Vec::with_capacity(size.min(r.remaining()));
            for _ in 0..size {
                let k = decode_value_at(r, key_tag, depth + 1)?;
                let v = decode_value_at(r, val_tag, depth + 1)?;
                out.push((k, v));
            }
            Ok(Value::Map(out))
        }
        other => Err(ValueError::UnknownTag(other)),
    }
}

/// Read `(param_id, tag, value)` triples until the buffer is exhausted.
///
/// An unknown tag leaves the cursor at an indeterminate position, so the scan
/// stops there; the parameters decoded so far are always returned, together
/// with the error that stopped the scan (if any).
pub fn decode_parameters(r: &mut ByteReader<'_>) -> (ParameterTree, Option<ValueError>) {
    let mut params = ParameterTree::new();
    while r.remaining() > 0 {
        let param_id = match r.read_u8("param id") {
            Ok(v) => v,
            Err(e) => return (params, Some(e)),
        };
        let tag = match r.read_u8("param tag") {
            Ok(v) => v,
            Err(e) => return (params, Some(e)),
        };
        match decode_value(r, tag) {
            Ok(v) => {
                params.insert(param_id, v);
            }
            Err(e) => return (params, Some(e)),
        }
    }
    (params, None)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn decode_one(bytes: &[u8], tag: u8) -> Value {
        let mut r = ByteReader::new(bytes);
        let v = decode_value(&mut r, tag).unwrap();
        assert_eq!(r.remaining(), 0, "cursor must consume exactly the value");
        v
    }

    #[test]
    fn scalar_roundtrips() {
        assert_eq!(decode_one(&[], TYPE_NIL), Value::Nil);
        assert_eq!(decode_one(&[0xFB], TYPE_INT8), Value::Int8(-5));
        assert_eq!(decode_one(&(-300i16).to_be_bytes(), TYPE_INT16), Value::Int16(-300));
        assert_eq!(decode_one(&70000i32.to_be_bytes(), TYPE_INT32), Value::Int32(70000));
        assert_eq!(
            decode_one(&1_700_000_000_000i64.to_be_bytes(), TYPE_INT64),
            Value::Int64(1_700_000_000_000)
        );
        assert_eq!(decode_one(&1.5f32.to_be_bytes(), TYPE_FLOAT), Value::Float(1.5));
        assert_eq!(decode_one(&(-0.25f64).to_be_bytes(), TYPE_DOUBLE), Value::Double(-0.25));
        assert_eq!(decode_one(&[0x01], TYPE_BOOLEAN), Value::Bool(true));
        assert_eq!(decode_one(&[0x00], TYPE_BOOLEAN), Value::Bool(false));
    }

    #[test]
    fn string_and_byte_array() {
        let mut buf = vec![0x00, 0x06];
        buf.extend_from_slice(b"T4_BAG");
        assert_eq!(decode_one(&buf, TYPE_STRING), Value::Str("T4_BAG".into()));

        let mut buf = 3u32.to_be_bytes().to_vec();
        buf.extend_from_slice(&[1, 2, 3]);
        assert_eq!(decode_one(&buf, TYPE_BYTE_ARRAY), Value::Bytes(vec![1, 2, 3]));
    }

    #[test]
    fn homogeneous_array() {
        // 3 x Int32
        let mut buf = vec![0x00, 0x03, TYPE_INT32];
        for v in [5i32, -1, 600] {
            buf.extend_from_slice(&v.to_be_bytes());
        }
        assert_eq!(
            decode_one(&buf, TYPE_ARRAY),
            Value::Array(vec![Value::Int32(5), Value::Int32(-1), Value::Int32(600)])
        );
    }

    #[test]
    fn typed_dictionary() {
        // {"a": 1, "b": 2} as String -> Int32
        let mut buf = vec![TYPE_STRING, TYPE_INT32, 0x00, 0x02];
        for (k, v) in [("a", 1i32), ("b", 2i32)] {
            buf.extend_from_slice(&(k.len() as u16).to_be_bytes());
            buf.extend_from_slice(k.as_bytes());
            buf.extend_from_slice(&v.to_be_bytes());
        }
        assert_eq!(
            decode_one(&buf, TYPE_DICTIONARY),
            Value::Map(vec![
                (Value::Str("a".into()), Value::Int32(1)),
                (Value::Str("b".into()), Value::Int32(2)),
            ])
        );
    }

    #[test]
    fn parameters_full_decode() {
        let mut buf = vec![0u8, TYPE_STRING, 0x00, 0x02];
        buf.extend_from_slice(b"hi");
        buf.extend_from_slice(&[255, TYPE_INT8, 0x07]);
        let (params, err) = decode_parameters(&mut ByteReader::new(&buf));
        assert!(err.is_none());
        assert_eq!(params[&0], Value::Str("hi".into()));
        assert_eq!(params[&255], Value::Int8(7));
    }

    #[test]
    fn unknown_tag_keeps_decoded_prefix() {
        let mut buf = vec![1u8, TYPE_INT8, 0x2A];
        buf.extend_from_slice(&[2u8, 0x51, 0xFF, 0xFF]); // tag 0x51 is not a thing
        let (params, err) = decode_parameters(&mut ByteReader::new(&buf));
        assert_eq!(params.len(), 1);
        assert_eq!(params[&1], Value::Int8(42));
        assert_eq!(err, Some(ValueError::UnknownTag(0x51)));
    }

    #[test]
    fn truncated_string_keeps_decoded_prefix() {
        let mut buf = vec![1u8, TYPE_INT16];
        buf.extend_from_slice(&9i16.to_be_bytes());
        buf.extend_from_slice(&[2u8, TYPE_STRING, 0x00, 0x10, b'x']); // claims 16 bytes
        let (params, err) = decode_parameters(&mut ByteReader::new(&buf));
        assert_eq!(params.len(), 1);
        assert!(matches!(err, Some(ValueError::Truncated(_))));
    }

    /// `levels` one-element arrays wrapping an empty array.
    fn nested_arrays(levels: usize) -> Vec<u8> {
        let mut buf = Vec::new();
        for _ in 0..levels {
            buf.extend_from_slice(&[0x00, 0x01, TYPE_ARRAY]);
        }
        buf.extend_from_slice(&[0x00, 0x00, TYPE_NIL]);
        buf
    }

    #[test]
    fn nesting_past_the_depth_ceiling_is_rejected() {
        let buf = nested_arrays(64);
        let mut r = ByteReader::new(&buf);
        assert_eq!(
            decode_value(&mut r, TYPE_ARRAY),
            Err(ValueError::TooDeep(MAX_VALUE_DEPTH))
        );
    }

    #[test]
    fn modest_nesting_still_decodes() {
        let v = decode_one(&nested_arrays(8), TYPE_ARRAY);
        let mut depth = 0;
        let mut cur = &v;
        while let Value::Array(inner) = cur {
            depth += 1;
            match inner.first() {
                Some(next) => cur = next,
                None => break,
            }
        }
        assert_eq!(depth, 9);
    }

    #[test]
    fn too_deep_value_keeps_decoded_prefix() {
        let mut buf = vec![1u8, TYPE_INT8, 0x05];
        buf.push(2);
        buf.push(TYPE_ARRAY);
        buf.extend_from_slice(&nested_arrays(64));
        let (params, err) = decode_parameters(&mut ByteReader::new(&buf));
        assert_eq!(params.len(), 1);
        assert_eq!(params[&1], Value::Int8(5));
        assert_eq!(err, Some(ValueError::TooDeep(MAX_VALUE_DEPTH)));
    }

    #[test]
    fn wrapped_integer_view() {
        assert_eq!(Value::Int8(-5).as_wrapped_i64(), Some(251));
        assert_eq!(Value::Int8(-128).as_wrapped_i64(), Some(128));
        assert_eq!(Value::Int8(17).as_wrapped_i64(), Some(17));
        assert_eq!(Value::Int32(-5).as_wrapped_i64(), Some(-5));
        assert_eq!(Value::Str("x".into()).as_wrapped_i64(), None);
    }
}
