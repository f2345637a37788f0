//! The consensus engine: replicated log, role state machine, elections,
//! and replication (spec §4.1).

pub mod election;
pub mod log;
pub mod peer;
pub mod replication;
pub mod rpc;

pub use log::{LogEntry, LogIndex, RaftLog, Term};
pub use peer::{Peer, Role};
pub use rpc::NodeId;

use std::time::Duration;

/// Election timeout range (spec §4.1: "typical 150-300 ms").
pub const ELECTION_TIMEOUT_MIN: Duration = Duration::from_millis(150);
pub const ELECTION_TIMEOUT_MAX: Duration = Duration::from_millis(300);

/// Leader heartbeat interval, strictly below `ELECTION_TIMEOUT_MIN` (spec
/// §4.1: "typical 50 ms").
pub const HEARTBEAT_INTERVAL: Duration = Duration::from_millis(50);
