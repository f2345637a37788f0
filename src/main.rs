//! Server binary: loads the cluster config, restores persisted state, and
//! runs the consensus loops plus the client/peer RPC listener (spec §6
//! "CLI surface").

use std::collections::HashMap;
use std::process::ExitCode;
use std::sync::Arc;

use clap::Parser;

use kvraft::applier::Applier;
use kvraft::config::{ClusterConfig, ServerArgs, CONFIG_EXIT_CODE};
use kvraft::kv::memtable::BTreeStateMachine;
use kvraft::persist::FilePersister;
use kvraft::raft::peer::Peer;
use kvraft::server::KvServer;
use kvraft::transport::pool::ConnectionPool;
use kvraft::transport::TcpRaftTransport;

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt().with_target(false).with_level(true).init();

    let args = ServerArgs::parse();

    let config = match ClusterConfig::load(&args.config_file) {
        Ok(config) => config,
        Err(e) => {
            tracing::error!(error = %e, "failed to load cluster config");
            return ExitCode::from(CONFIG_EXIT_CODE as u8);
        }
    };

    if args.node_id as usize >= config.peers.len() {
        tracing::error!(node_id = args.node_id, peer_count = config.peers.len(), "node-id out of range");
        return ExitCode::from(CONFIG_EXIT_CODE as u8);
    }

    let mut peer_addrs = HashMap::new();
    for (i, peer) in config.peers.iter().enumerate() {
        let addr: std::net::SocketAddr = match peer.socket_addr().parse() {
            Ok(addr) => addr,
            Err(e) => {
                tracing::error!(error = %e, "invalid peer address in config");
                return ExitCode::from(CONFIG_EXIT_CODE as u8);
            }
        };
        peer_addrs.insert(i as u64, addr);
    }
    let my_addr = peer_addrs[&args.node_id];
    let other_ids: Vec<u64> = peer_addrs.keys().copied().filter(|&id| id != args.node_id).collect();

    let pool = Arc::new(ConnectionPool::new());
    let transport = Arc::new(TcpRaftTransport::new(pool.clone(), peer_addrs));
    let persister = Arc::new(FilePersister::new(&args.log_dir, args.node_id));
    let state_machine = Arc::new(BTreeStateMachine::new());

    let peer = match Peer::create(
        args.node_id,
        other_ids,
        persister,
        transport,
        state_machine,
        args.max_raftstate_size,
    )
    .await
    {
        Ok(peer) => peer,
        Err(e) => {
            tracing::error!(error = %e, "failed to restore persisted state");
            return ExitCode::from(CONFIG_EXIT_CODE as u8);
        }
    };

    let applier = Applier::new(peer.clone());
    tokio::spawn(applier.clone().run());
    tokio::spawn(kvraft::raft::election::election_loop(peer.clone()));
    tokio::spawn(kvraft::raft::replication::leader_loop(peer.clone()));

    let server = KvServer::new(peer, applier);
    if let Err(e) = server.serve(my_addr).await {
        tracing::error!(error = %e, "server exited");
        return ExitCode::FAILURE;
    }

    ExitCode::SUCCESS
}
