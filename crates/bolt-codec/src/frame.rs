//! Chunked message framing.
//!
//! Every message on the wire is a sequence of chunks, each prefixed by a
//! 2-byte big-endian length, closed by a zero-length chunk. A zero-length
//! chunk on its own (`00 00`) is a bare keep-alive and frames an empty body.

use thiserror::Error;

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameError {
    #[error("message body split across multiple chunks")]
    MultiChunk,
    #[error("message truncated")]
    Truncated,
}

/// Total framed length (headers + body + terminator) of the message starting
/// at `bytes[0]`, or `None` while more bytes are needed. Walks chunk headers
/// only; never inspects the body.
pub fn message_len(bytes: &[u8]) -> Option<usize> {
    let mut off = 0;
    loop {
        if off + 2 > bytes.len() {
            return None;
        }
        let chunk = u16::from_be_bytes([bytes[off], bytes[off + 1]]) as usize;
        off += 2;
        if chunk == 0 {
            return Some(off);
        }
        if off + chunk > bytes.len() {
            return None;
        }
        off += chunk;
    }
}

/// Body of a complete single-chunk message starting at `bytes[0]`.
///
/// The receive path funnels through here: multi-chunk bodies are legal on the
/// wire but surface as [`FrameError::MultiChunk`] so the caller can fail the
/// connection instead of decoding a partial value.
pub fn single_body(bytes: &[u8]) -> Result<&[u8], FrameError> {
    if bytes.len() < 2 {
        return Err(FrameError::Truncated);
    }
    let chunk = u16::from_be_bytes([bytes[0], bytes[1]]) as usize;
    if chunk == 0 {
        return Ok(&bytes[..0]);
    }
    if bytes.len() < 2 + chunk + 2 {
        return Err(FrameError::Truncated);
    }
    if bytes[2 + chunk] != 0 || bytes[2 + chunk + 1] != 0 {
        return Err(FrameError::MultiChunk);
    }
    Ok(&bytes[2..2 + chunk])
}

/// Concatenate all chunk payloads of one complete message into `out`,
/// returning the framed length consumed. Inverse of the encoder's message
/// framing regardless of where the chunk boundaries fell.
pub fn unframe(bytes: &[u8], out: &mut Vec<u8>) -> Result<usize, FrameError> {
    let mut off = 0;
    loop {
        if off + 2 > bytes.len() {
            return Err(FrameError::Truncated);
        }
        let chunk = u16::from_be_bytes([bytes[off], bytes[off + 1]]) as usize;
        off += 2;
        if chunk == 0 {
            return Ok(off);
        }
        if off + chunk > bytes.len() {
            return Err(FrameError::Truncated);
        }
        out.extend_from_slice(&bytes[off..off + chunk]);
        off += chunk;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{buffer::ByteBuffer, encode::Encoder, value::Value};

    #[test]
    fn small_message_roundtrip() {
        let mut buf = ByteBuffer::new();
        Encoder::new(&mut buf).message(&Value::String("hello"));
        let framed = buf.readable();

        // [0006][85 68 65 6C 6C 6F][0000]
        assert_eq!(framed.len(), 2 + 6 + 2);
        assert_eq!(&framed[..2], [0x00, 0x06]);
        assert_eq!(&framed[framed.len() - 2..], [0x00, 0x00]);

        assert_eq!(message_len(framed), Some(framed.len()));
        let body = single_body(framed).expect("body");
        assert_eq!(body, &[0x85, 0x68, 0x65, 0x6C, 0x6C, 0x6F]);

        let mut out = Vec::new();
        let consumed = unframe(framed, &mut out).expect("unframe");
        assert_eq!(consumed, framed.len());
        assert_eq!(out, body);
    }

    #[test]
    fn incomplete_is_recognised() {
        let mut buf = ByteBuffer::new();
        Encoder::new(&mut buf).message(&Value::String("hello"));
        let framed = buf.readable();
        for cut in 0..framed.len() {
            assert_eq!(message_len(&framed[..cut]), None, "cut at {cut}");
        }
    }

    #[test]
    fn oversized_body_splits_and_reassembles() {
        let payload = vec![0x5A_u8; 0x1_8000]; // 96 KiB, forces two chunks
        let mut buf = ByteBuffer::new();
        Encoder::new(&mut buf).message(&Value::Bytes(&payload));
        let framed = buf.readable();

        // First chunk is exactly 0xFFFF; no length word may reach 0x10000.
        assert_eq!(&framed[..2], [0xFF, 0xFF]);
        assert_eq!(message_len(framed), Some(framed.len()));
        assert_eq!(single_body(framed), Err(FrameError::MultiChunk));

        let mut body = Vec::new();
        let consumed = unframe(framed, &mut body).expect("unframe");
        assert_eq!(consumed, framed.len());

        // Reassembled body is the exact encoder output: marker + len + bytes.
        assert_eq!(body[0], 0xCE);
        assert_eq!(&body[1..5], &(payload.len() as u32).to_be_bytes()[..]);
        assert_eq!(&body[5..], &payload[..]);
    }

    #[test]
    fn keepalive_frames_empty_body() {
        let framed = [0x00, 0x00];
        assert_eq!(message_len(&framed), Some(2));
        assert_eq!(single_body(&framed), Ok(&[][..]));
    }

    #[test]
    fn back_to_back_messages_split_at_terminator() {
        let mut buf = ByteBuffer::new();
        let mut enc = Encoder::new(&mut buf);
        enc.message(&Value::Int(1));
        enc.message(&Value::Int(2));
        let framed = buf.readable();

        let first = message_len(framed).expect("first");
        assert_eq!(single_body(&framed[..first]), Ok(&[0x01][..]));
        let second = message_len(&framed[first..]).expect("second");
        assert_eq!(first + second, framed.len());
        assert_eq!(single_body(&framed[first..]), Ok(&[0x02][..]));
    }
}
