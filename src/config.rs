//! Flat `key=value` cluster config file and the server CLI surface.
//!
//! The config file format mirrors the original implementation's
//! `MprpcConfig`: one `key=value` pair per line, `#`-prefixed comments and
//! blank lines ignored, peers enumerated as `node0ip`, `node0port`,
//! `node1ip`, `node1port`, ... terminating at the first missing `nodeNip`.

use std::collections::HashMap;
use std::path::Path;

use clap::Parser;

use crate::error::{Error, Result};

/// One cluster member as read from the config file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerAddr {
    pub ip: String,
    pub port: u16,
}

impl PeerAddr {
    pub fn socket_addr(&self) -> String {
        format!("{}:{}", self.ip, self.port)
    }
}

#[derive(Debug, Clone, Default)]
pub struct ClusterConfig {
    pub peers: Vec<PeerAddr>,
}

impl ClusterConfig {
    /// Parse a flat `key=value` file. Missing file or missing `node0ip`
    /// yields an empty peer list rather than an error — callers decide
    /// whether an empty cluster is fatal.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let raw = match std::fs::read_to_string(path.as_ref()) {
            Ok(s) => s,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => String::new(),
            Err(e) => return Err(Error::Config(format!("reading config file: {e}"))),
        };
        Ok(Self::parse(&raw))
    }

    pub fn parse(raw: &str) -> Self {
        let mut kv = HashMap::new();
        for line in raw.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            if let Some((key, value)) = line.split_once('=') {
                kv.insert(key.trim().to_string(), value.trim().to_string());
            }
        }

        let mut peers = Vec::new();
        for i in 0.. {
            let ip_key = format!("node{i}ip");
            let port_key = format!("node{i}port");
            let (Some(ip), Some(port)) = (kv.get(&ip_key), kv.get(&port_key)) else {
                break;
            };
            let Ok(port) = port.parse::<u16>() else {
                break;
            };
            peers.push(PeerAddr {
                ip: ip.clone(),
                port,
            });
        }
        Self { peers }
    }
}

/// Server CLI surface (spec §6). Exit codes: 0 success, 1 usage error
/// (handled by `clap` itself), 2 config error (raised explicitly once the
/// config file fails to resolve to a usable peer list).
#[derive(Parser, Debug, Clone)]
#[command(name = "kvraft-server")]
pub struct ServerArgs {
    /// This node's index into the config file's peer list.
    #[arg(long = "node-id")]
    pub node_id: u64,

    /// Path to the flat key=value peer config file.
    #[arg(long = "config-file")]
    pub config_file: String,

    /// Snapshot trigger threshold, in bytes of persisted raft state.
    #[arg(long = "max-raftstate-size", default_value_t = 1024 * 1024)]
    pub max_raftstate_size: usize,

    /// Directory for persisted raftstate/snapshot files and logs.
    #[arg(long = "log-dir", default_value = "./data")]
    pub log_dir: String,
}

pub const CONFIG_EXIT_CODE: i32 = 2;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_contiguous_peers() {
        let cfg = ClusterConfig::parse(
            "node0ip=127.0.0.1\nnode0port=6000\nnode1ip=127.0.0.1\nnode1port=6001\n",
        );
        assert_eq!(cfg.peers.len(), 2);
        assert_eq!(cfg.peers[1].socket_addr(), "127.0.0.1:6001");
    }

    #[test]
    fn stops_at_first_gap() {
        let cfg = ClusterConfig::parse("node0ip=127.0.0.1\nnode0port=6000\nnode2ip=127.0.0.1\nnode2port=6002\n");
        assert_eq!(cfg.peers.len(), 1);
    }

    #[test]
    fn ignores_comments_and_blank_lines() {
        let cfg = ClusterConfig::parse("# comment\n\nnode0ip=10.0.0.1\nnode0port=9000\n");
        assert_eq!(cfg.peers[0].ip, "10.0.0.1");
    }
}
