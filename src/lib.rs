//! A replicated key-value store built on a Raft-style consensus core.
//!
//! Module layout mirrors the dependency order leaves-first: `persist` and
//! `kv` have no internal dependencies, `transport` depends on neither,
//! `raft` wires persistence, the state machine, and transport together,
//! and `applier`/`server`/`client` sit on top of `raft`.

pub mod applier;
pub mod client;
pub mod config;
pub mod error;
pub mod kv;
pub mod persist;
pub mod raft;
pub mod server;
pub mod transport;

pub use error::{Error, Result};
