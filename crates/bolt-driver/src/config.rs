use serde::Deserialize;

use crate::auth::Auth;

/// Driver-wide configuration. One instance shared by every cell.
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct DriverConfig {
    /// `host:port` of the server.
    pub address: String,
    pub auth: Auth,
    pub user_agent: String,
    /// Cells (connections, each with its worker pair) in the pool.
    pub cells: usize,
    /// Default PULL batch size; -1 streams everything.
    pub fetch_batch: i64,
    /// Connection attempts before a cell gives up.
    pub max_tries: u32,
    /// Kernel SO_SNDBUF/SO_RCVBUF, if set.
    pub socket_buf_size: Option<usize>,
    /// Routed cluster vs standalone. The core only flags reroute requests.
    pub routed: bool,
    /// Command/result ring capacity per cell (rounded up to a power of two).
    pub queue_capacity: usize,
    /// Optional core pinning for the per-cell worker threads.
    pub encoder_core: Option<usize>,
    pub decoder_core: Option<usize>,
    /// Request SCHED_FIFO for the worker threads (needs CAP_SYS_NICE).
    pub realtime: bool,
}

impl Default for DriverConfig {
    fn default() -> Self {
        Self {
            address: "127.0.0.1:7687".to_string(),
            auth: Auth::None,
            user_agent: concat!("boltdrive/", env!("CARGO_PKG_VERSION")).to_string(),
            cells: 1,
            fetch_batch: -1,
            max_tries: 5,
            socket_buf_size: None,
            routed: false,
            queue_capacity: 8192,
            encoder_core: None,
            decoder_core: None,
            realtime: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let c = DriverConfig::default();
        assert_eq!(c.cells, 1);
        assert_eq!(c.max_tries, 5);
        assert_eq!(c.fetch_batch, -1);
        assert_eq!(c.queue_capacity, 8192);
        assert!(!c.routed);
    }

    #[test]
    fn deserializes_partial() {
        let c: DriverConfig = serde_json::from_str(
            r#"{
                "address": "10.0.0.5:7687",
                "auth": {"scheme": "basic", "principal": "neo", "credentials": "pw"},
                "cells": 4,
                "socket_buf_size": 262144
            }"#,
        )
        .unwrap();
        assert_eq!(c.address, "10.0.0.5:7687");
        assert_eq!(c.cells, 4);
        assert_eq!(c.socket_buf_size, Some(262_144));
        assert_eq!(c.auth.scheme(), "basic");
        assert_eq!(c.max_tries, 5);
    }
}
