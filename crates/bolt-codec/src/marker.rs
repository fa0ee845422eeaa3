//! PackStream marker bytes.
//!
//! A marker is the first byte of every encoded value. The 0x00-0xFF space is
//! partitioned into tiny forms that carry their size in the low nibble and
//! explicit-size forms followed by a big-endian length of 1, 2 or 4 bytes.

pub const TINY_STRING: u8 = 0x80;
pub const TINY_LIST: u8 = 0x90;
pub const TINY_MAP: u8 = 0xA0;
pub const TINY_STRUCT: u8 = 0xB0;

pub const NULL: u8 = 0xC0;
pub const FLOAT64: u8 = 0xC1;
pub const BOOL_FALSE: u8 = 0xC2;
pub const BOOL_TRUE: u8 = 0xC3;

pub const INT8: u8 = 0xC8;
pub const INT16: u8 = 0xC9;
pub const INT32: u8 = 0xCA;
pub const INT64: u8 = 0xCB;

pub const BYTES8: u8 = 0xCC;
pub const BYTES16: u8 = 0xCD;
pub const BYTES32: u8 = 0xCE;

pub const STRING8: u8 = 0xD0;
pub const STRING16: u8 = 0xD1;
pub const STRING32: u8 = 0xD2;

pub const LIST8: u8 = 0xD4;
pub const LIST16: u8 = 0xD5;
pub const LIST32: u8 = 0xD6;

pub const MAP8: u8 = 0xD8;
pub const MAP16: u8 = 0xD9;
pub const MAP32: u8 = 0xDA;

pub const STRUCT8: u8 = 0xDC;
pub const STRUCT16: u8 = 0xDD;

/// Tiny ints encode the value in the marker itself: 0x00-0x7F are 0..=127,
/// 0xF0-0xFF are -16..=-1 (the marker reinterpreted as a signed byte).
pub const TINY_INT_MIN: i64 = -16;
pub const TINY_INT_MAX: i64 = 127;
