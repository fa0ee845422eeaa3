use thiserror::Error;

use crate::{
    marker,
    value::{List, Map, Struct, Value},
};

/// Decoding failures. Unknown markers always fail; a well-formed stream never
/// produces one.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecodeError {
    #[error("no handler for marker 0x{0:02X}")]
    UnknownMarker(u8),
    #[error("value truncated: need {need} bytes, have {have}")]
    Truncated { need: usize, have: usize },
    #[error("string bytes are not valid utf-8")]
    Utf8,
    #[error("value nesting deeper than {0}")]
    NestingTooDeep(usize),
}

/// Compound nesting guard; real traffic is nowhere near this.
const MAX_DEPTH: usize = 64;

/// Bounds-checked cursor over encoded bytes. Every decoded value advances the
/// position by exactly the bytes that value's marker consumed.
#[derive(Clone, Debug)]
pub struct Reader<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    #[inline]
    pub fn new(bytes: &'a [u8]) -> Self {
        Self { bytes, pos: 0 }
    }

    #[inline]
    pub fn pos(&self) -> usize {
        self.pos
    }

    #[inline]
    pub fn remaining(&self) -> usize {
        self.bytes.len() - self.pos
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.pos == self.bytes.len()
    }

    #[inline]
    fn take_u8(&mut self) -> Result<u8, DecodeError> {
        let b = *self
            .bytes
            .get(self.pos)
            .ok_or(DecodeError::Truncated { need: 1, have: 0 })?;
        self.pos += 1;
        Ok(b)
    }

    #[inline]
    fn take(&mut self, n: usize) -> Result<&'a [u8], DecodeError> {
        if self.remaining() < n {
            return Err(DecodeError::Truncated { need: n, have: self.remaining() });
        }
        let span = &self.bytes[self.pos..self.pos + n];
        self.pos += n;
        Ok(span)
    }

    /// Bytes between an earlier position and the cursor. Used to carve packed
    /// compound views.
    #[inline]
    fn window(&self, start: usize) -> &'a [u8] {
        &self.bytes[start..self.pos]
    }
}

/// Decode one value at the reader's position.
#[inline]
pub fn decode_value<'a>(reader: &mut Reader<'a>) -> Result<Value<'a>, DecodeError> {
    decode_at(reader, 0)
}

/// Walk one value without keeping it, leaving the reader just past it.
#[inline]
pub fn skip_value(reader: &mut Reader<'_>) -> Result<(), DecodeError> {
    decode_at(reader, 0).map(drop)
}

/// The marker dispatch. The 256-byte marker space collapses into range arms
/// the compiler flattens to a jump; tiny forms carry their size in the low
/// nibble, explicit forms read a big-endian length first.
fn decode_at<'a>(reader: &mut Reader<'a>, depth: usize) -> Result<Value<'a>, DecodeError> {
    if depth > MAX_DEPTH {
        return Err(DecodeError::NestingTooDeep(MAX_DEPTH));
    }

    let m = reader.take_u8()?;
    let value = match m {
        // The marker byte is itself the value, reinterpreted signed.
        0x00..=0x7F | 0xF0..=0xFF => Value::Int(m as i8 as i64),

        0x80..=0x8F => decode_string(reader, (m & 0x0F) as usize)?,
        0x90..=0x9F => decode_list(reader, (m & 0x0F) as usize, depth)?,
        0xA0..=0xAF => decode_map(reader, (m & 0x0F) as usize, depth)?,
        0xB0..=0xBF => decode_struct(reader, (m & 0x0F) as usize, depth)?,

        marker::NULL => Value::Null,
        marker::FLOAT64 => {
            let raw = reader.take(8)?;
            Value::Float(f64::from_be_bytes(raw.try_into().expect("8-byte span")))
        }
        marker::BOOL_FALSE => Value::Bool(false),
        marker::BOOL_TRUE => Value::Bool(true),

        // Sign-extending big-endian loads.
        marker::INT8 => Value::Int(reader.take_u8()? as i8 as i64),
        marker::INT16 => {
            let raw = reader.take(2)?;
            Value::Int(i16::from_be_bytes(raw.try_into().expect("2-byte span")) as i64)
        }
        marker::INT32 => {
            let raw = reader.take(4)?;
            Value::Int(i32::from_be_bytes(raw.try_into().expect("4-byte span")) as i64)
        }
        marker::INT64 => {
            let raw = reader.take(8)?;
            Value::Int(i64::from_be_bytes(raw.try_into().expect("8-byte span")))
        }

        marker::BYTES8 => {
            let len = reader.take_u8()? as usize;
            Value::Bytes(reader.take(len)?)
        }
        marker::BYTES16 => {
            let len = take_u16_be(reader)? as usize;
            Value::Bytes(reader.take(len)?)
        }
        marker::BYTES32 => {
            let len = take_u32_be(reader)? as usize;
            Value::Bytes(reader.take(len)?)
        }

        marker::STRING8 => {
            let len = reader.take_u8()? as usize;
            decode_string(reader, len)?
        }
        marker::STRING16 => {
            let len = take_u16_be(reader)? as usize;
            decode_string(reader, len)?
        }
        marker::STRING32 => {
            let len = take_u32_be(reader)? as usize;
            decode_string(reader, len)?
        }

        marker::LIST8 => {
            let count = reader.take_u8()? as usize;
            decode_list(reader, count, depth)?
        }
        marker::LIST16 => {
            let count = take_u16_be(reader)? as usize;
            decode_list(reader, count, depth)?
        }
        marker::LIST32 => {
            let count = take_u32_be(reader)? as usize;
            decode_list(reader, count, depth)?
        }

        marker::MAP8 => {
            let count = reader.take_u8()? as usize;
            decode_map(reader, count, depth)?
        }
        marker::MAP16 => {
            let count = take_u16_be(reader)? as usize;
            decode_map(reader, count, depth)?
        }
        marker::MAP32 => {
            let count = take_u32_be(reader)? as usize;
            decode_map(reader, count, depth)?
        }

        marker::STRUCT8 => {
            let count = reader.take_u8()? as usize;
            decode_struct(reader, count, depth)?
        }
        marker::STRUCT16 => {
            let count = take_u16_be(reader)? as usize;
            decode_struct(reader, count, depth)?
        }

        other => return Err(DecodeError::UnknownMarker(other)),
    };

    Ok(value)
}

#[inline]
fn take_u16_be(reader: &mut Reader<'_>) -> Result<u16, DecodeError> {
    let raw = reader.take(2)?;
    Ok(u16::from_be_bytes(raw.try_into().expect("2-byte span")))
}

#[inline]
fn take_u32_be(reader: &mut Reader<'_>) -> Result<u32, DecodeError> {
    let raw = reader.take(4)?;
    Ok(u32::from_be_bytes(raw.try_into().expect("4-byte span")))
}

#[inline]
fn decode_string<'a>(reader: &mut Reader<'a>, len: usize) -> Result<Value<'a>, DecodeError> {
    let raw = reader.take(len)?;
    std::str::from_utf8(raw)
        .map(Value::String)
        .map_err(|_| DecodeError::Utf8)
}

/// Children are walked once so the cursor ends up just past the last element
/// and malformed payloads fail eagerly; the value itself stays a lazy view.
fn decode_list<'a>(
    reader: &mut Reader<'a>,
    count: usize,
    depth: usize,
) -> Result<Value<'a>, DecodeError> {
    let start = reader.pos();
    for _ in 0..count {
        decode_at(reader, depth + 1)?;
    }
    Ok(Value::List(List::Packed { bytes: reader.window(start), count }))
}

fn decode_map<'a>(
    reader: &mut Reader<'a>,
    count: usize,
    depth: usize,
) -> Result<Value<'a>, DecodeError> {
    let start = reader.pos();
    for _ in 0..count {
        decode_at(reader, depth + 1)?; // key
        decode_at(reader, depth + 1)?; // value
    }
    Ok(Value::Map(Map::Packed { bytes: reader.window(start), count }))
}

fn decode_struct<'a>(
    reader: &mut Reader<'a>,
    count: usize,
    depth: usize,
) -> Result<Value<'a>, DecodeError> {
    let tag = reader.take_u8()?;
    let start = reader.pos();
    for _ in 0..count {
        decode_at(reader, depth + 1)?;
    }
    Ok(Value::Struct(Struct {
        tag,
        fields: List::Packed { bytes: reader.window(start), count },
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn decode_all(bytes: &[u8]) -> Value<'_> {
        let mut r = Reader::new(bytes);
        let v = decode_value(&mut r).expect("decode");
        assert!(r.is_empty(), "decoder left {} bytes", r.remaining());
        v
    }

    #[test]
    fn tiny_ints_are_the_marker() {
        assert_eq!(decode_all(&[0x01]), Value::Int(1));
        assert_eq!(decode_all(&[0x7F]), Value::Int(127));
        assert_eq!(decode_all(&[0xFF]), Value::Int(-1));
        assert_eq!(decode_all(&[0xF0]), Value::Int(-16));
    }

    #[test]
    fn sized_ints_sign_extend() {
        assert_eq!(decode_all(&[0xC8, 0xC8]), Value::Int(-56));
        assert_eq!(decode_all(&[0xC9, 0x80, 0x00]), Value::Int(-32768));
        assert_eq!(
            decode_all(&[0xCB, 0x00, 0x00, 0x00, 0x00, 0x80, 0x00, 0x00, 0x00]),
            Value::Int(1 << 31)
        );
        assert_eq!(
            decode_all(&[0xCA, 0xFF, 0xFF, 0xFF, 0xFE]),
            Value::Int(-2)
        );
    }

    #[test]
    fn primitives() {
        assert_eq!(decode_all(&[0xC0]), Value::Null);
        assert_eq!(decode_all(&[0xC2]), Value::Bool(false));
        assert_eq!(decode_all(&[0xC3]), Value::Bool(true));
        assert_eq!(
            decode_all(&[0xC1, 0x3F, 0xF0, 0, 0, 0, 0, 0, 0]),
            Value::Float(1.0)
        );
    }

    #[test]
    fn strings() {
        assert_eq!(decode_all(&[0x81, 0x41]), Value::String("A"));
        assert_eq!(
            decode_all(&[0x85, 0x68, 0x65, 0x6C, 0x6C, 0x6F]),
            Value::String("hello")
        );
        let mut long = vec![0xD0, 20];
        long.extend_from_slice(&[b'x'; 20]);
        assert_eq!(decode_all(&long), Value::String("xxxxxxxxxxxxxxxxxxxx"));
    }

    #[test]
    fn invalid_utf8_fails() {
        let mut r = Reader::new(&[0x81, 0xFF]);
        assert_eq!(decode_value(&mut r), Err(DecodeError::Utf8));
    }

    #[test]
    fn map_preserves_key_order() {
        // {"x": 1, "y": "z"} from the wire.
        let bytes = [0xA2, 0x81, 0x78, 0x01, 0x81, 0x79, 0x81, 0x7A];
        let Value::Map(map) = decode_all(&bytes) else {
            panic!("expected map")
        };
        assert_eq!(map.len(), 2);
        let pairs: Vec<_> = map.iter().collect();
        assert_eq!(pairs[0], (Value::String("x"), Value::Int(1)));
        assert_eq!(pairs[1], (Value::String("y"), Value::String("z")));
        assert_eq!(map.get("x"), Value::Int(1));
        assert_eq!(map.get("y"), Value::String("z"));
        assert!(map.get("absent").is_unknown());
    }

    #[test]
    fn nested_list_view_walks_lazily() {
        // [[1, 2], "a"]
        let bytes = [0x92, 0x92, 0x01, 0x02, 0x81, 0x61];
        let Value::List(list) = decode_all(&bytes) else {
            panic!("expected list")
        };
        assert_eq!(list.len(), 2);
        let Value::List(inner) = list.get(0) else {
            panic!("expected inner list")
        };
        assert_eq!(inner.get(0), Value::Int(1));
        assert_eq!(inner.get(1), Value::Int(2));
        assert_eq!(list.get(1), Value::String("a"));
        assert!(list.get(2).is_unknown());
    }

    #[test]
    fn struct_carries_tag_and_fields() {
        // SUCCESS {"fields": ["n"]}
        let bytes = [0xB1, 0x70, 0xA1, 0x86, b'f', b'i', b'e', b'l', b'd', b's', 0x91, 0x81, b'n'];
        let Value::Struct(s) = decode_all(&bytes) else {
            panic!("expected struct")
        };
        assert_eq!(s.tag, 0x70);
        assert_eq!(s.len(), 1);
        let Value::Map(meta) = s.field(0) else {
            panic!("expected metadata map")
        };
        let Value::List(fields) = meta.get("fields") else {
            panic!("expected fields list")
        };
        assert_eq!(fields.get(0), Value::String("n"));
    }

    #[test]
    fn unknown_markers_fail() {
        for m in [0xC4u8, 0xC7, 0xCF, 0xD3, 0xD7, 0xDB, 0xDE, 0xE0, 0xEF] {
            let buf = [m];
            let mut r = Reader::new(&buf);
            assert_eq!(decode_value(&mut r), Err(DecodeError::UnknownMarker(m)), "marker {m:#X}");
        }
    }

    #[test]
    fn truncated_compound_fails() {
        // List of 3 but only 2 elements present.
        let mut r = Reader::new(&[0x93, 0x01, 0x02]);
        assert!(matches!(decode_value(&mut r), Err(DecodeError::Truncated { .. })));
    }

    #[test]
    fn exact_advance_between_values() {
        let bytes = [0x01, 0x85, b'h', b'e', b'l', b'l', b'o', 0xC3];
        let mut r = Reader::new(&bytes);
        assert_eq!(decode_value(&mut r), Ok(Value::Int(1)));
        assert_eq!(r.pos(), 1);
        assert_eq!(decode_value(&mut r), Ok(Value::String("hello")));
        assert_eq!(r.pos(), 7);
        assert_eq!(decode_value(&mut r), Ok(Value::Bool(true)));
        assert!(r.is_empty());
    }

    #[test]
    fn nesting_guard_trips() {
        let mut bytes = vec![0x91u8; 80];
        bytes.push(0x01);
        let mut r = Reader::new(&bytes);
        assert_eq!(decode_value(&mut r), Err(DecodeError::NestingTooDeep(64)));
    }
}
