//! Per-peer RPC channel: owns one TCP connection, tracks its health as a
//! small state machine, and keeps it warm with idle-heartbeat `Ping`s
//! (spec §4.5, grounded in the original `mprpcchannel` and the teacher's
//! `networking/health` monitors).

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU32, AtomicU8, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use tokio::net::TcpStream;
use tokio::sync::Mutex as AsyncMutex;
use tokio::time::sleep;

use crate::error::{Error, Result};
use crate::raft::rpc::{NodeId, PingArgs, PingReply};
use crate::transport::framing::{read_frame, write_frame};

pub const HEARTBEAT_INTERVAL_MS: u64 = 1_000;
pub const PROBE_INTERVAL_MS: u64 = 200;
pub const MAX_FAILURES_BEFORE_DISCONNECT: u32 = 3;

/// Health of a single peer connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelHealth {
    /// Recent RPCs succeeded; heartbeats fire on the slow interval.
    Healthy,
    /// Consecutive failures observed; heartbeats fire on the fast interval
    /// to decide quickly whether to declare the peer disconnected.
    Probing,
    /// Too many consecutive failures; callers should treat RPCs to this
    /// peer as failing fast until a heartbeat succeeds again.
    Disconnected,
}

impl ChannelHealth {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => ChannelHealth::Healthy,
            1 => ChannelHealth::Probing,
            _ => ChannelHealth::Disconnected,
        }
    }
}

/// One peer's connection plus its health bookkeeping. Cheap to clone
/// (`Arc` internally) so it can be handed to both the RPC call sites and
/// the background heartbeat task.
pub struct Channel {
    node_id: NodeId,
    addr: SocketAddr,
    stream: AsyncMutex<Option<TcpStream>>,
    health: AtomicU8,
    consecutive_failures: AtomicU32,
}

impl Channel {
    pub fn new(node_id: NodeId, addr: SocketAddr) -> Arc<Self> {
        Arc::new(Self {
            node_id,
            addr,
            stream: AsyncMutex::new(None),
            health: AtomicU8::new(ChannelHealth::Healthy as u8),
            consecutive_failures: AtomicU32::new(0),
        })
    }

    pub fn node_id(&self) -> NodeId {
        self.node_id
    }

    pub fn health(&self) -> ChannelHealth {
        ChannelHealth::from_u8(self.health.load(Ordering::Acquire))
    }

    fn set_health(&self, health: ChannelHealth) {
        self.health.store(health as u8, Ordering::Release);
    }

    fn record_success(&self) {
        self.consecutive_failures.store(0, Ordering::Release);
        self.set_health(ChannelHealth::Healthy);
    }

    pub(crate) fn record_failure(&self) {
        let failures = self.consecutive_failures.fetch_add(1, Ordering::AcqRel) + 1;
        if failures >= MAX_FAILURES_BEFORE_DISCONNECT {
            self.set_health(ChannelHealth::Disconnected);
        } else {
            self.set_health(ChannelHealth::Probing);
        }
    }

    async fn ensure_connected(&self) -> Result<()> {
        let mut guard = self.stream.lock().await;
        if guard.is_some() {
            return Ok(());
        }
        let stream = TcpStream::connect(self.addr)
            .await
            .map_err(|e| Error::Transport(format!("connect to {}: {e}", self.addr)))?;
        stream.set_nodelay(true).ok();
        *guard = Some(stream);
        Ok(())
    }

    /// Send `service.method(args)` and wait for the matching reply. Closes
    /// the connection on any I/O error so the next call reconnects fresh.
    ///
    /// A `Disconnected` channel fails fast instead: spec §4.5 requires that
    /// "any call on a Disconnected channel fails fast until reconstruction"
    /// rather than retrying a socket that has already burned through
    /// `MAX_FAILURES_BEFORE_DISCONNECT`. Reconstruction means a fresh
    /// `Channel`, handed out by the pool once this one is discarded.
    pub async fn call(&self, service: &str, method: &str, args: &[u8]) -> Result<Vec<u8>> {
        if self.health() == ChannelHealth::Disconnected {
            return Err(Error::Transport(format!("channel to {} is disconnected", self.addr)));
        }
        self.ensure_connected().await?;
        let result = self.call_once(service, method, args).await;
        match &result {
            Ok(_) => self.record_success(),
            Err(_) => {
                self.record_failure();
                *self.stream.lock().await = None;
            }
        }
        result
    }

    async fn call_once(&self, service: &str, method: &str, args: &[u8]) -> Result<Vec<u8>> {
        let mut guard = self.stream.lock().await;
        let stream = guard
            .as_mut()
            .ok_or_else(|| Error::Transport("channel not connected".into()))?;
        write_frame(stream, service, method, args).await?;
        let frame = read_frame(stream).await?;
        Ok(frame.payload)
    }

    async fn ping(&self) -> Result<()> {
        let args = PingArgs { from: self.node_id };
        let encoded = bincode::encode_to_vec(&args, bincode::config::standard())?;
        let reply_bytes = self.call("Raft", "Ping", &encoded).await?;
        let (_reply, _): (PingReply, usize) = bincode::decode_from_slice(&reply_bytes, bincode::config::standard())?;
        Ok(())
    }
}

/// Spawn the idle-heartbeat task for `channel`. Captures only a `Weak`
/// reference so a dropped channel's pool entry lets this task notice and
/// exit on its next tick instead of keeping the channel alive forever
/// (spec §9 "Cyclic ownership"). Also exits as soon as the channel goes
/// `Disconnected`, rather than continuing to fire pings at a fail-fast
/// channel until the `Arc` happens to drop — a disconnected channel is
/// done until the pool discards it and a fresh one is constructed.
pub fn spawn_heartbeat(channel: &Arc<Channel>) -> tokio::task::JoinHandle<()> {
    let weak: Weak<Channel> = Arc::downgrade(channel);
    tokio::spawn(async move {
        loop {
            let Some(channel) = weak.upgrade() else {
                return;
            };
            if channel.health() == ChannelHealth::Disconnected {
                return;
            }
            let delay = match channel.health() {
                ChannelHealth::Healthy => Duration::from_millis(HEARTBEAT_INTERVAL_MS),
                _ => Duration::from_millis(PROBE_INTERVAL_MS),
            };
            drop(channel);
            sleep(delay).await;

            let Some(channel) = weak.upgrade() else {
                return;
            };
            if channel.health() == ChannelHealth::Disconnected {
                return;
            }
            let _ = channel.ping().await;
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn starts_healthy() {
        let channel = Channel::new(1, "127.0.0.1:0".parse().unwrap());
        assert_eq!(channel.health(), ChannelHealth::Healthy);
    }

    #[test]
    fn transitions_to_probing_then_disconnected_on_repeated_failure() {
        let channel = Channel::new(1, "127.0.0.1:0".parse().unwrap());
        channel.record_failure();
        assert_eq!(channel.health(), ChannelHealth::Probing);
        channel.record_failure();
        channel.record_failure();
        assert_eq!(channel.health(), ChannelHealth::Disconnected);
    }

    #[test]
    fn success_resets_to_healthy() {
        let channel = Channel::new(1, "127.0.0.1:0".parse().unwrap());
        channel.record_failure();
        channel.record_failure();
        channel.record_success();
        assert_eq!(channel.health(), ChannelHealth::Healthy);
    }

    #[tokio::test]
    async fn heartbeat_task_exits_once_channel_is_disconnected() {
        let channel = Channel::new(1, "127.0.0.1:0".parse().unwrap());
        channel.record_failure();
        channel.record_failure();
        channel.record_failure();
        assert_eq!(channel.health(), ChannelHealth::Disconnected);

        let handle = spawn_heartbeat(&channel);
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .expect("heartbeat task should exit promptly on a disconnected channel")
            .unwrap();
    }

    #[tokio::test]
    async fn disconnected_channel_fails_fast_without_reconnecting() {
        let channel = Channel::new(1, "127.0.0.1:0".parse().unwrap());
        channel.record_failure();
        channel.record_failure();
        channel.record_failure();
        assert_eq!(channel.health(), ChannelHealth::Disconnected);

        let result = channel.call("Raft", "Ping", &[]).await;
        assert!(result.is_err());
        // No connection attempt was made: the stream slot is still empty.
        assert!(channel.stream.lock().await.is_none());
    }
}
