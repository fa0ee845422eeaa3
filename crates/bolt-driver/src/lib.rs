//! Worker-per-connection driver core for a graph database speaking a binary,
//! chunked request/response protocol over TCP.
//!
//! A [`Pool`] round-robins over [`Cell`]s. Each cell owns one TCP connection
//! and a pair of worker threads: the encoder drains the command queue into
//! the socket, the decoder drives the per-connection state machine and posts
//! results. Queues are lock-free SPSC rings; outcomes travel as packed
//! [`Status`] words.

mod auth;
mod cell;
mod config;
mod connection;
mod histogram;
pub mod message;
mod pool;
mod queue;
mod status;
mod worker;

pub use auth::Auth;
pub use cell::{
    Callback, Cell, CellResult, Command, ResultKind, pack_params, packed_empty_map,
};
pub use config::DriverConfig;
pub use connection::{
    BoltState, Connection, HANDSHAKE_MAGIC, Outcome, ReplySink, Version, WireReader, WireWriter,
};
pub use histogram::{HIST_BUCKETS, LatencyHistogram};
pub use pool::Pool;
pub use queue::RingQueue;
pub use status::{Action, Code, Domain, Status};
