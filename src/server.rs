//! Glue between the wire RPCs (spec §6) and the consensus core: submits
//! client ops through `Peer::submit`, waits on the `Applier` for the
//! resulting index to be applied, and answers the listening socket.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::{TcpListener, TcpStream};

use crate::applier::Applier;
use crate::error::{Error, Result};
use crate::kv::{ApplyOutcome, ClientOp, OpKind};
use crate::raft::peer::Peer;
use crate::raft::rpc::{
    AppendEntriesArgs, ClientErr, GetArgs, GetReply, InstallSnapshotArgs, KvOp, PingArgs, PingReply, PutAppendArgs,
    PutAppendReply, RequestVoteArgs,
};
use crate::transport::framing::{read_frame, write_frame};

/// Requests wait at most this long for their index to commit before
/// giving up and reporting a (transient) wrong-leader condition, so a
/// lost leadership mid-request can't hang a connection forever.
const APPLY_WAIT_TIMEOUT: Duration = Duration::from_secs(5);

pub struct KvServer {
    peer: Arc<Peer>,
    applier: Arc<Applier>,
}

impl KvServer {
    pub fn new(peer: Arc<Peer>, applier: Arc<Applier>) -> Arc<Self> {
        Arc::new(Self { peer, applier })
    }

    pub async fn serve(self: Arc<Self>, addr: SocketAddr) -> Result<()> {
        let listener = TcpListener::bind(addr).await?;
        tracing::info!(%addr, "listening for peer and client RPCs");
        loop {
            let (stream, peer_addr) = listener.accept().await?;
            let server = self.clone();
            tokio::spawn(async move {
                if let Err(e) = server.handle_connection(stream).await {
                    tracing::debug!(%peer_addr, error = %e, "connection closed");
                }
            });
        }
    }

    async fn handle_connection(&self, mut stream: TcpStream) -> Result<()> {
        loop {
            let frame = match read_frame(&mut stream).await {
                Ok(frame) => frame,
                Err(_) => return Ok(()), // peer closed the connection
            };

            let reply_bytes = self.dispatch(&frame.service, &frame.method, &frame.payload).await?;
            write_frame(&mut stream, &frame.service, &frame.method, &reply_bytes).await?;
        }
    }

    async fn dispatch(&self, service: &str, method: &str, payload: &[u8]) -> Result<Vec<u8>> {
        let cfg = bincode::config::standard();
        match (service, method) {
            ("Raft", "RequestVote") => {
                let (args, _): (RequestVoteArgs, usize) = bincode::decode_from_slice(payload, cfg)?;
                let reply = self.peer.handle_request_vote(args).await;
                Ok(bincode::encode_to_vec(&reply, cfg)?)
            }
            ("Raft", "AppendEntries") => {
                let (args, _): (AppendEntriesArgs, usize) = bincode::decode_from_slice(payload, cfg)?;
                let reply = self.peer.handle_append_entries(args).await;
                Ok(bincode::encode_to_vec(&reply, cfg)?)
            }
            ("Raft", "InstallSnapshot") => {
                let (args, _): (InstallSnapshotArgs, usize) = bincode::decode_from_slice(payload, cfg)?;
                let reply = self.peer.handle_install_snapshot(args).await;
                Ok(bincode::encode_to_vec(&reply, cfg)?)
            }
            ("Raft", "Ping") => {
                let (args, _): (PingArgs, usize) = bincode::decode_from_slice(payload, cfg)?;
                let reply = PingReply { from: args.from };
                Ok(bincode::encode_to_vec(&reply, cfg)?)
            }
            ("Kv", "Get") => {
                let (args, _): (GetArgs, usize) = bincode::decode_from_slice(payload, cfg)?;
                let reply = self.handle_get(args).await;
                Ok(bincode::encode_to_vec(&reply, cfg)?)
            }
            ("Kv", "PutAppend") => {
                let (args, _): (PutAppendArgs, usize) = bincode::decode_from_slice(payload, cfg)?;
                let reply = self.handle_put_append(args).await;
                Ok(bincode::encode_to_vec(&reply, cfg)?)
            }
            _ => Err(Error::Protocol(format!("unknown RPC {service}.{method}"))),
        }
    }

    async fn handle_get(&self, args: GetArgs) -> GetReply {
        let op = ClientOp {
            client_id: args.client_id,
            request_id: args.request_id,
            kind: OpKind::Get,
            key: args.key,
            value: String::new(),
        };
        match self.submit_and_wait(op).await {
            Ok(ApplyOutcome::Get(Some(value))) => GetReply {
                err: ClientErr::Ok,
                value,
            },
            Ok(ApplyOutcome::Get(None)) => GetReply {
                err: ClientErr::NoKey,
                value: String::new(),
            },
            Ok(_) => GetReply {
                err: ClientErr::Ok,
                value: String::new(),
            },
            Err(Error::WrongLeader) => GetReply {
                err: ClientErr::WrongLeader,
                value: String::new(),
            },
            Err(_) => GetReply {
                err: ClientErr::WrongLeader,
                value: String::new(),
            },
        }
    }

    async fn handle_put_append(&self, args: PutAppendArgs) -> PutAppendReply {
        let kind = match args.op {
            KvOp::Put => OpKind::Put,
            KvOp::Append => OpKind::Append,
        };
        let op = ClientOp {
            client_id: args.client_id,
            request_id: args.request_id,
            kind,
            key: args.key,
            value: args.value,
        };
        match self.submit_and_wait(op).await {
            Ok(_) => PutAppendReply { err: ClientErr::Ok },
            Err(_) => PutAppendReply {
                err: ClientErr::WrongLeader,
            },
        }
    }

    async fn submit_and_wait(&self, op: ClientOp) -> Result<ApplyOutcome> {
        let encoded = op.encode()?;
        let (index, submitted_term) = self.peer.submit(encoded).await?;
        let rx = self.applier.wait_for(index);

        match tokio::time::timeout(APPLY_WAIT_TIMEOUT, rx).await {
            Ok(Ok(outcome)) => Ok(outcome),
            Ok(Err(_)) => Err(Error::Internal("applier dropped waiter".into())),
            Err(_) => {
                self.applier.cancel_wait(index);
                if self.peer.current_term() != submitted_term || !self.peer.is_leader() {
                    Err(Error::WrongLeader)
                } else {
                    Err(Error::Timeout("apply wait timed out".into()))
                }
            }
        }
    }
}
