//! Durable storage for raft state and snapshots (spec §4.4).
//!
//! Writes are buffered and flushed in batches (size, time, or explicit-sync
//! triggers) to amortize `fsync` cost, but any write whose correctness a
//! pending RPC reply depends on is flushed synchronously before that reply
//! is sent. RaftState uses the fast codec; snapshots use the higher-ratio
//! one (spec §4.4, grounded in the original `Persister`).

pub mod compression;

use std::path::PathBuf;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::io::AsyncWriteExt;

use crate::error::{Error, Result};
use compression::{adaptive_compress, adaptive_decompress, Codec, CompressionStats};

const BATCH_FLUSH_SIZE: usize = 4 * 1024;
const BATCH_FLUSH_INTERVAL: Duration = Duration::from_millis(100);

/// The capability interface durable state is persisted through (spec §9
/// "Interface abstractions": `IPersistenceLayer`).
#[async_trait]
pub trait Persister: Send + Sync {
    async fn save_raft_state(&self, data: Vec<u8>) -> Result<()>;
    async fn read_raft_state(&self) -> Result<Vec<u8>>;
    async fn raft_state_size(&self) -> Result<u64>;
    async fn save(&self, raft_state: Vec<u8>, snapshot: Vec<u8>) -> Result<()>;
    async fn read_snapshot(&self) -> Result<Vec<u8>>;
    /// Force any buffered writes to disk now.
    async fn flush(&self) -> Result<()>;
}

struct PendingBuffer {
    data: Option<Vec<u8>>,
    last_flush: Instant,
}

impl PendingBuffer {
    fn new() -> Self {
        Self {
            data: None,
            last_flush: Instant::now(),
        }
    }

    fn should_flush(&self, force: bool) -> bool {
        force
            || match &self.data {
                Some(d) => d.len() >= BATCH_FLUSH_SIZE || self.last_flush.elapsed() >= BATCH_FLUSH_INTERVAL,
                None => false,
            }
    }
}

/// File-backed `Persister`. Each of raftstate/snapshot lives in its own
/// file under `dir`, compressed with the codec appropriate to its role.
pub struct FilePersister {
    raft_state_path: PathBuf,
    snapshot_path: PathBuf,
    pending_raft_state: Mutex<PendingBuffer>,
    pending_snapshot: Mutex<PendingBuffer>,
    stats: Mutex<CompressionStats>,
}

impl FilePersister {
    pub fn new(dir: impl Into<PathBuf>, node_id: u64) -> Self {
        let dir = dir.into();
        Self {
            raft_state_path: dir.join(format!("raftstate-{node_id}.dat")),
            snapshot_path: dir.join(format!("snapshot-{node_id}.dat")),
            pending_raft_state: Mutex::new(PendingBuffer::new()),
            pending_snapshot: Mutex::new(PendingBuffer::new()),
            stats: Mutex::new(CompressionStats::default()),
        }
    }

    async fn write_compressed(&self, path: &PathBuf, data: &[u8], codec: Codec) -> Result<()> {
        let compressed = adaptive_compress(data, codec);
        self.stats.lock().record(data.len(), compressed.len());
        write_file_synced(path, &compressed).await
    }

    async fn read_compressed(&self, path: &PathBuf) -> Result<Vec<u8>> {
        match tokio::fs::read(path).await {
            Ok(bytes) if bytes.is_empty() => Ok(Vec::new()),
            Ok(bytes) => Ok(adaptive_decompress(&bytes)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Vec::new()),
            Err(e) => Err(Error::Io(e)),
        }
    }

    pub fn compression_stats(&self) -> (f64, u64, u64) {
        let stats = self.stats.lock();
        (stats.ratio(), stats.saved_bytes(), stats.count())
    }

    async fn flush_raft_state(&self, force: bool) -> Result<()> {
        let data = {
            let mut pending = self.pending_raft_state.lock();
            if !pending.should_flush(force) {
                return Ok(());
            }
            let data = pending.data.take();
            pending.last_flush = Instant::now();
            data
        };
        if let Some(data) = data {
            self.write_compressed(&self.raft_state_path, &data, Codec::Fast).await?;
        }
        Ok(())
    }

    async fn flush_snapshot(&self, force: bool) -> Result<()> {
        let data = {
            let mut pending = self.pending_snapshot.lock();
            if !pending.should_flush(force) {
                return Ok(());
            }
            let data = pending.data.take();
            pending.last_flush = Instant::now();
            data
        };
        if let Some(data) = data {
            self.write_compressed(&self.snapshot_path, &data, Codec::HighRatio).await?;
        }
        Ok(())
    }
}

async fn write_file_synced(path: &PathBuf, data: &[u8]) -> Result<()> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    let mut file = tokio::fs::OpenOptions::new()
        .create(true)
        .write(true)
        .truncate(true)
        .open(path)
        .await?;
    file.write_all(data).await?;
    file.sync_all().await?;
    Ok(())
}

#[async_trait]
impl Persister for FilePersister {
    async fn save_raft_state(&self, data: Vec<u8>) -> Result<()> {
        {
            let mut pending = self.pending_raft_state.lock();
            pending.data = Some(data);
        }
        // RaftState correctness gates every RPC reply, so force a
        // synchronous flush rather than waiting on the batch window.
        self.flush_raft_state(true).await
    }

    async fn read_raft_state(&self) -> Result<Vec<u8>> {
        self.read_compressed(&self.raft_state_path).await
    }

    async fn raft_state_size(&self) -> Result<u64> {
        match tokio::fs::metadata(&self.raft_state_path).await {
            Ok(meta) => Ok(meta.len()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(0),
            Err(e) => Err(Error::Io(e)),
        }
    }

    async fn save(&self, raft_state: Vec<u8>, snapshot: Vec<u8>) -> Result<()> {
        {
            let mut pending = self.pending_raft_state.lock();
            pending.data = Some(raft_state);
        }
        {
            let mut pending = self.pending_snapshot.lock();
            pending.data = Some(snapshot);
        }
        self.flush_raft_state(true).await?;
        self.flush_snapshot(true).await
    }

    async fn read_snapshot(&self) -> Result<Vec<u8>> {
        self.read_compressed(&self.snapshot_path).await
    }

    async fn flush(&self) -> Result<()> {
        self.flush_raft_state(true).await?;
        self.flush_snapshot(true).await
    }
}
