use std::fmt;

use crate::decode::{Reader, decode_value, skip_value};

/// A graph-database wire value.
///
/// `Value` is a `Copy` view type. Strings and bytes borrow their storage:
/// from caller memory when building values to encode, from the receive
/// buffer (or a result's own payload) when decoded. Compound values come in
/// two shapes, a built form over plain slices and a packed form that lazily
/// re-walks the encoded bytes on iteration; see [`List`], [`Map`] and
/// [`Struct`].
///
/// A decoded `Value` is valid only while its source bytes are alive and
/// un-overwritten. Finish using views before consuming further buffer bytes.
#[derive(Clone, Copy, Debug)]
pub enum Value<'a> {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    String(&'a str),
    Bytes(&'a [u8]),
    List(List<'a>),
    Map(Map<'a>),
    Struct(Struct<'a>),
    /// Produced only for missing map keys and out-of-range accesses.
    Unknown,
}

/// Built (`Items`) or decoded (`Packed`) list payload.
#[derive(Clone, Copy, Debug)]
pub enum List<'a> {
    Items(&'a [Value<'a>]),
    /// `bytes` spans the encoded elements, marker to marker.
    Packed { bytes: &'a [u8], count: usize },
}

/// Built maps keep keys and values in two parallel slices; decoded maps point
/// at the first key's marker and re-walk pairs.
#[derive(Clone, Copy, Debug)]
pub enum Map<'a> {
    Entries { keys: &'a [Value<'a>], vals: &'a [Value<'a>] },
    Packed { bytes: &'a [u8], count: usize },
}

/// A tagged structure; the tag byte identifies the shape (message kind, node,
/// relationship, point, ...).
#[derive(Clone, Copy, Debug)]
pub struct Struct<'a> {
    pub tag: u8,
    pub fields: List<'a>,
}

impl<'a> Value<'a> {
    pub const EMPTY_MAP: Value<'static> = Value::Map(Map::Entries { keys: &[], vals: &[] });

    #[inline]
    pub fn list(items: &'a [Value<'a>]) -> Self {
        Value::List(List::Items(items))
    }

    #[inline]
    pub fn map(keys: &'a [Value<'a>], vals: &'a [Value<'a>]) -> Self {
        debug_assert_eq!(keys.len(), vals.len());
        Value::Map(Map::Entries { keys, vals })
    }

    #[inline]
    pub fn structure(tag: u8, fields: &'a [Value<'a>]) -> Self {
        Value::Struct(Struct { tag, fields: List::Items(fields) })
    }

    #[inline]
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            _ => None,
        }
    }

    #[inline]
    pub fn as_int(&self) -> Option<i64> {
        match self {
            Value::Int(i) => Some(*i),
            _ => None,
        }
    }

    #[inline]
    pub fn as_float(&self) -> Option<f64> {
        match self {
            Value::Float(f) => Some(*f),
            _ => None,
        }
    }

    #[inline]
    pub fn as_str(&self) -> Option<&'a str> {
        match self {
            Value::String(s) => Some(s),
            _ => None,
        }
    }

    #[inline]
    pub fn as_map(&self) -> Option<Map<'a>> {
        match self {
            Value::Map(m) => Some(*m),
            _ => None,
        }
    }

    #[inline]
    pub fn as_struct(&self) -> Option<Struct<'a>> {
        match self {
            Value::Struct(s) => Some(*s),
            _ => None,
        }
    }

    #[inline]
    pub fn is_unknown(&self) -> bool {
        matches!(self, Value::Unknown)
    }
}

impl<'a> List<'a> {
    #[inline]
    pub fn len(&self) -> usize {
        match self {
            List::Items(items) => items.len(),
            List::Packed { count, .. } => *count,
        }
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Element at `index`, or `Unknown` when out of range or the packed bytes
    /// are malformed.
    pub fn get(&self, index: usize) -> Value<'a> {
        match self {
            List::Items(items) => items.get(index).copied().unwrap_or(Value::Unknown),
            List::Packed { .. } => self.iter().nth(index).unwrap_or(Value::Unknown),
        }
    }

    pub fn iter(&self) -> ListIter<'a> {
        match *self {
            List::Items(items) => ListIter::Items(items.iter()),
            List::Packed { bytes, count } => ListIter::Packed { reader: Reader::new(bytes), remaining: count },
        }
    }
}

impl<'a> IntoIterator for List<'a> {
    type Item = Value<'a>;
    type IntoIter = ListIter<'a>;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}

pub enum ListIter<'a> {
    Items(std::slice::Iter<'a, Value<'a>>),
    Packed { reader: Reader<'a>, remaining: usize },
}

impl<'a> Iterator for ListIter<'a> {
    type Item = Value<'a>;

    fn next(&mut self) -> Option<Value<'a>> {
        match self {
            ListIter::Items(it) => it.next().copied(),
            ListIter::Packed { reader, remaining } => {
                if *remaining == 0 {
                    return None;
                }
                match decode_value(reader) {
                    Ok(v) => {
                        *remaining -= 1;
                        Some(v)
                    }
                    Err(_) => {
                        *remaining = 0;
                        None
                    }
                }
            }
        }
    }
}

impl<'a> Map<'a> {
    #[inline]
    pub fn len(&self) -> usize {
        match self {
            Map::Entries { keys, .. } => keys.len(),
            Map::Packed { count, .. } => *count,
        }
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Look up a value by string key. Non-string keys never match.
    pub fn get(&self, key: &str) -> Value<'a> {
        for (k, v) in self.iter() {
            if k.as_str() == Some(key) {
                return v;
            }
        }
        Value::Unknown
    }

    pub fn iter(&self) -> MapIter<'a> {
        match *self {
            Map::Entries { keys, vals } => MapIter::Entries { keys: keys.iter(), vals: vals.iter() },
            Map::Packed { bytes, count } => MapIter::Packed { reader: Reader::new(bytes), remaining: count },
        }
    }
}

impl<'a> IntoIterator for Map<'a> {
    type Item = (Value<'a>, Value<'a>);
    type IntoIter = MapIter<'a>;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}

pub enum MapIter<'a> {
    Entries { keys: std::slice::Iter<'a, Value<'a>>, vals: std::slice::Iter<'a, Value<'a>> },
    Packed { reader: Reader<'a>, remaining: usize },
}

impl<'a> Iterator for MapIter<'a> {
    type Item = (Value<'a>, Value<'a>);

    fn next(&mut self) -> Option<(Value<'a>, Value<'a>)> {
        match self {
            MapIter::Entries { keys, vals } => Some((keys.next().copied()?, vals.next().copied()?)),
            MapIter::Packed { reader, remaining } => {
                if *remaining == 0 {
                    return None;
                }
                let pair = decode_value(reader).and_then(|k| decode_value(reader).map(|v| (k, v)));
                match pair {
                    Ok(pair) => {
                        *remaining -= 1;
                        Some(pair)
                    }
                    Err(_) => {
                        *remaining = 0;
                        None
                    }
                }
            }
        }
    }
}

impl<'a> Struct<'a> {
    #[inline]
    pub fn len(&self) -> usize {
        self.fields.len()
    }

    /// Field at `index`, `Unknown` when out of range.
    #[inline]
    pub fn field(&self, index: usize) -> Value<'a> {
        self.fields.get(index)
    }
}

/// Deep structural equality: a packed compound equals a built one with the
/// same elements.
impl PartialEq for Value<'_> {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Value::Null, Value::Null) | (Value::Unknown, Value::Unknown) => true,
            (Value::Bool(a), Value::Bool(b)) => a == b,
            (Value::Int(a), Value::Int(b)) => a == b,
            (Value::Float(a), Value::Float(b)) => a.to_bits() == b.to_bits(),
            (Value::String(a), Value::String(b)) => a == b,
            (Value::Bytes(a), Value::Bytes(b)) => a == b,
            (Value::List(a), Value::List(b)) => a == b,
            (Value::Map(a), Value::Map(b)) => a == b,
            (Value::Struct(a), Value::Struct(b)) => a.tag == b.tag && a.fields == b.fields,
            _ => false,
        }
    }
}

impl PartialEq for List<'_> {
    fn eq(&self, other: &Self) -> bool {
        self.len() == other.len() && self.iter().eq(other.iter())
    }
}

impl PartialEq for Map<'_> {
    fn eq(&self, other: &Self) -> bool {
        self.len() == other.len() && self.iter().eq(other.iter())
    }
}

impl fmt::Display for Value<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => write!(f, "null"),
            Value::Bool(b) => write!(f, "{b}"),
            Value::Int(i) => write!(f, "{i}"),
            Value::Float(x) => write!(f, "{x}"),
            Value::String(s) => write!(f, "{s}"),
            Value::Bytes(b) => {
                write!(f, "[")?;
                for (i, byte) in b.iter().enumerate() {
                    if i > 0 {
                        write!(f, ",")?;
                    }
                    write!(f, "0x{byte:02X}")?;
                }
                write!(f, "]")
            }
            Value::List(l) => {
                write!(f, "[")?;
                for (i, v) in l.iter().enumerate() {
                    if i > 0 {
                        write!(f, ",")?;
                    }
                    write!(f, "{v}")?;
                }
                write!(f, "]")
            }
            Value::Map(m) => {
                write!(f, "{{")?;
                for (i, (k, v)) in m.iter().enumerate() {
                    if i > 0 {
                        write!(f, ",")?;
                    }
                    write!(f, "{k}:{v}")?;
                }
                write!(f, "}}")
            }
            Value::Struct(s) => {
                write!(f, "#{:02X}{{", s.tag)?;
                for (i, v) in s.fields.iter().enumerate() {
                    if i > 0 {
                        write!(f, ",")?;
                    }
                    write!(f, "{v}")?;
                }
                write!(f, "}}")
            }
            Value::Unknown => write!(f, "<?>"),
        }
    }
}

/// Byte length of the encoded value starting at `bytes[0]`, or `None` if the
/// bytes are malformed. Used when a packed view needs to be carved out of a
/// larger span.
pub fn encoded_len(bytes: &[u8]) -> Option<usize> {
    let mut reader = Reader::new(bytes);
    skip_value(&mut reader).ok()?;
    Some(reader.pos())
}
