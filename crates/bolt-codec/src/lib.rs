//! Zero-copy codec for the chunked binary wire protocol of a graph database:
//! cache-aligned I/O buffers, a per-worker value pool, and a PackStream value
//! encoder/decoder.

mod buffer;
mod decode;
mod encode;
pub mod frame;
pub mod graph;
pub mod marker;
mod pool;
mod value;

pub use buffer::{ByteBuffer, MIN_CAPACITY, TAIL_SIZE};
pub use decode::{DecodeError, Reader, decode_value, skip_value};
pub use encode::{Encoder, encode_to_vec};
pub use frame::FrameError;
pub use pool::{PoolSlice, ValuePool};
pub use value::{List, ListIter, Map, MapIter, Struct, Value, encoded_len};
