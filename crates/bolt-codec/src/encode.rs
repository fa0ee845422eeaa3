use crate::{
    buffer::ByteBuffer,
    marker,
    value::{List, Map, Value},
};

/// Largest body a single chunk may carry; longer bodies are split so no
/// emitted length word is ever 0x10000 or more.
const MAX_CHUNK: usize = 0xFFFF;

/// Writes values into a [`ByteBuffer`] in the wire value format. All
/// multi-byte lengths and numerics are big-endian regardless of host order.
pub struct Encoder<'b> {
    buf: &'b mut ByteBuffer,
}

impl<'b> Encoder<'b> {
    #[inline]
    pub fn new(buf: &'b mut ByteBuffer) -> Self {
        Self { buf }
    }

    /// Encode one value at the write cursor.
    pub fn value(&mut self, v: &Value<'_>) {
        match v {
            Value::Null => self.u8(marker::NULL),
            Value::Bool(false) => self.u8(marker::BOOL_FALSE),
            Value::Bool(true) => self.u8(marker::BOOL_TRUE),
            Value::Int(i) => self.int(*i),
            Value::Float(f) => self.float(*f),
            Value::String(s) => self.string(s),
            Value::Bytes(b) => self.bytes(b),
            Value::List(l) => self.list(l),
            Value::Map(m) => self.map(m),
            Value::Struct(s) => self.strct(s.tag, &s.fields),
            // Unknown never goes on the wire; emit null so the stream stays
            // well-formed if one slips through.
            Value::Unknown => self.u8(marker::NULL),
        }
    }

    /// Frame `body` as one chunked message: `[len:BE16][body bytes][0x0000]`,
    /// splitting bodies longer than 0xFFFF into multiple chunks.
    pub fn message(&mut self, body: &Value<'_>) {
        let start = self.buf.write_pos();
        self.buf.skip(2);
        self.value(body);
        self.finish_message(start);
    }

    /// Frame a pre-encoded value as a message. The caller guarantees `bytes`
    /// is exactly one well-formed encoded value.
    pub fn packed_message(&mut self, bytes: &[u8]) {
        let start = self.buf.write_pos();
        self.buf.skip(2);
        self.buf.write(bytes);
        self.finish_message(start);
    }

    /// Frame whatever `f` encodes as one chunked message. Lets callers mix
    /// [`Encoder::value`] with pre-packed spans inside a single body.
    pub fn message_with(&mut self, f: impl FnOnce(&mut Self)) {
        let start = self.buf.write_pos();
        self.buf.skip(2);
        f(self);
        self.finish_message(start);
    }

    /// Splice a pre-encoded value into the current position, no framing.
    #[inline]
    pub fn packed(&mut self, bytes: &[u8]) {
        self.buf.write(bytes);
    }

    /// Emit a struct marker and tag; the caller follows with `field_count`
    /// encoded fields.
    pub fn struct_header(&mut self, tag: u8, field_count: usize) {
        if field_count <= 0x0F {
            self.u8(marker::TINY_STRUCT | field_count as u8);
        } else if field_count <= 0xFF {
            self.u8(marker::STRUCT8);
            self.u8(field_count as u8);
        } else {
            self.u8(marker::STRUCT16);
            self.raw(&(field_count as u16).to_be_bytes());
        }
        self.u8(tag);
    }

    fn finish_message(&mut self, start: usize) {
        let body_len = self.buf.write_pos() - start - 2;
        if body_len <= MAX_CHUNK {
            self.buf.write_at(start, &(body_len as u16).to_be_bytes());
        } else {
            self.split_chunks(start, body_len);
        }
        self.buf.write(&[0, 0]);
    }

    /// Re-chunk an oversized body in place: shift the tail right to make room
    /// for the extra headers, last chunk first so sources are never clobbered
    /// before they move.
    fn split_chunks(&mut self, start: usize, body_len: usize) {
        let n_chunks = body_len.div_ceil(MAX_CHUNK);
        let extra = (n_chunks - 1) * 2;
        self.buf.skip(extra);

        let end = self.buf.write_pos();
        let span = self.buf.span_mut(start..end);
        for i in (0..n_chunks).rev() {
            let len = (body_len - i * MAX_CHUNK).min(MAX_CHUNK);
            let src = 2 + i * MAX_CHUNK;
            let dst = 2 + i * (MAX_CHUNK + 2);
            if i > 0 {
                span.copy_within(src..src + len, dst);
            }
            span[dst - 2..dst].copy_from_slice(&(len as u16).to_be_bytes());
        }
    }

    /// Narrowest signed width that fits; -16..=127 is the marker itself.
    fn int(&mut self, v: i64) {
        if (marker::TINY_INT_MIN..=marker::TINY_INT_MAX).contains(&v) {
            self.u8(v as i8 as u8);
        } else if let Ok(v) = i8::try_from(v) {
            self.u8(marker::INT8);
            self.u8(v as u8);
        } else if let Ok(v) = i16::try_from(v) {
            self.u8(marker::INT16);
            self.raw(&v.to_be_bytes());
        } else if let Ok(v) = i32::try_from(v) {
            self.u8(marker::INT32);
            self.raw(&v.to_be_bytes());
        } else {
            self.u8(marker::INT64);
            self.raw(&v.to_be_bytes());
        }
    }

    fn float(&mut self, v: f64) {
        self.u8(marker::FLOAT64);
        self.raw(&v.to_be_bytes());
    }

    fn string(&mut self, s: &str) {
        let len = s.len();
        if len <= 0x0F {
            self.u8(marker::TINY_STRING | len as u8);
        } else if len <= 0xFF {
            self.u8(marker::STRING8);
            self.u8(len as u8);
        } else if len <= 0xFFFF {
            self.u8(marker::STRING16);
            self.raw(&(len as u16).to_be_bytes());
        } else {
            self.u8(marker::STRING32);
            self.raw(&(len as u32).to_be_bytes());
        }
        self.raw(s.as_bytes());
    }

    fn bytes(&mut self, b: &[u8]) {
        let len = b.len();
        if len <= 0xFF {
            self.u8(marker::BYTES8);
            self.u8(len as u8);
        } else if len <= 0xFFFF {
            self.u8(marker::BYTES16);
            self.raw(&(len as u16).to_be_bytes());
        } else {
            self.u8(marker::BYTES32);
            self.raw(&(len as u32).to_be_bytes());
        }
        self.raw(b);
    }

    fn list(&mut self, l: &List<'_>) {
        let count = l.len();
        if count <= 0x0F {
            self.u8(marker::TINY_LIST | count as u8);
        } else if count <= 0xFF {
            self.u8(marker::LIST8);
            self.u8(count as u8);
        } else if count <= 0xFFFF {
            self.u8(marker::LIST16);
            self.raw(&(count as u16).to_be_bytes());
        } else {
            self.u8(marker::LIST32);
            self.raw(&(count as u32).to_be_bytes());
        }
        match l {
            List::Items(items) => {
                for item in *items {
                    self.value(item);
                }
            }
            // Already in wire form, marker to marker.
            List::Packed { bytes, .. } => self.raw(bytes),
        }
    }

    fn map(&mut self, m: &Map<'_>) {
        let count = m.len();
        if count <= 0x0F {
            self.u8(marker::TINY_MAP | count as u8);
        } else if count <= 0xFF {
            self.u8(marker::MAP8);
            self.u8(count as u8);
        } else if count <= 0xFFFF {
            self.u8(marker::MAP16);
            self.raw(&(count as u16).to_be_bytes());
        } else {
            self.u8(marker::MAP32);
            self.raw(&(count as u32).to_be_bytes());
        }
        match m {
            Map::Entries { keys, vals } => {
                for (k, v) in keys.iter().zip(vals.iter()) {
                    self.value(k);
                    self.value(v);
                }
            }
            Map::Packed { bytes, .. } => self.raw(bytes),
        }
    }

    fn strct(&mut self, tag: u8, fields: &List<'_>) {
        let count = fields.len();
        if count <= 0x0F {
            self.u8(marker::TINY_STRUCT | count as u8);
            self.u8(tag);
        } else if count <= 0xFF {
            self.u8(marker::STRUCT8);
            self.u8(count as u8);
            self.u8(tag);
        } else {
            self.u8(marker::STRUCT16);
            self.raw(&(count as u16).to_be_bytes());
            self.u8(tag);
        }
        match fields {
            List::Items(items) => {
                for item in *items {
                    self.value(item);
                }
            }
            List::Packed { bytes, .. } => self.raw(bytes),
        }
    }

    #[inline]
    fn u8(&mut self, b: u8) {
        self.buf.write(&[b]);
    }

    #[inline]
    fn raw(&mut self, bytes: &[u8]) {
        self.buf.write(bytes);
    }
}

/// Encode a single value into a fresh byte vector. Convenience for command
/// parameters that cross threads pre-packed.
pub fn encode_to_vec(v: &Value<'_>) -> Vec<u8> {
    let mut buf = ByteBuffer::new();
    Encoder::new(&mut buf).value(v);
    buf.readable().to_vec()
}
