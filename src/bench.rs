//! Load-generation binary for a running cluster (spec §6 "CLI surface":
//! `(config, concurrency, ops_per_worker, mode, putRatio)`).

use std::process::ExitCode;
use std::sync::Arc;
use std::time::Instant;

use clap::Parser;
use rand::Rng;

use kvraft::client::Clerk;
use kvraft::config::{ClusterConfig, CONFIG_EXIT_CODE};
use kvraft::transport::pool::ConnectionPool;

#[derive(Clone, Copy, Debug, clap::ValueEnum)]
enum Mode {
    Put,
    Get,
    Append,
    Mixed,
}

#[derive(Parser, Debug)]
#[command(name = "kvraft-bench")]
struct BenchArgs {
    #[arg(long = "config-file")]
    config_file: String,

    #[arg(long, default_value_t = 4)]
    concurrency: usize,

    #[arg(long = "ops-per-worker", default_value_t = 1000)]
    ops_per_worker: usize,

    #[arg(long, value_enum, default_value_t = Mode::Mixed)]
    mode: Mode,

    /// Fraction of mixed-mode ops that are writes, in `[0.0, 1.0]`.
    #[arg(long = "put-ratio", default_value_t = 0.5)]
    put_ratio: f64,
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt().with_target(false).init();
    let args = BenchArgs::parse();

    let config = match ClusterConfig::load(&args.config_file) {
        Ok(config) if !config.peers.is_empty() => config,
        Ok(_) => {
            tracing::error!("config file has no peers");
            return ExitCode::from(CONFIG_EXIT_CODE as u8);
        }
        Err(e) => {
            tracing::error!(error = %e, "failed to load cluster config");
            return ExitCode::from(CONFIG_EXIT_CODE as u8);
        }
    };

    let peers: Vec<(u64, std::net::SocketAddr)> = config
        .peers
        .iter()
        .enumerate()
        .filter_map(|(i, p)| p.socket_addr().parse().ok().map(|addr| (i as u64, addr)))
        .collect();

    let pool = Arc::new(ConnectionPool::new());
    let start = Instant::now();
    let mut workers = Vec::with_capacity(args.concurrency);

    for worker_id in 0..args.concurrency {
        let peers = peers.clone();
        let pool = pool.clone();
        let ops = args.ops_per_worker;
        let mode = args.mode;
        let put_ratio = args.put_ratio;
        workers.push(tokio::spawn(async move {
            run_worker(worker_id, peers, pool, ops, mode, put_ratio).await
        }));
    }

    let mut total_ops = 0usize;
    for worker in workers {
        match worker.await {
            Ok(count) => total_ops += count,
            Err(e) => tracing::error!(error = %e, "worker panicked"),
        }
    }

    let elapsed = start.elapsed();
    let throughput = total_ops as f64 / elapsed.as_secs_f64().max(0.001);
    tracing::info!(total_ops, elapsed_secs = elapsed.as_secs_f64(), throughput, "benchmark complete");
    println!("{total_ops} ops in {:.3}s ({throughput:.1} ops/s)", elapsed.as_secs_f64());

    ExitCode::SUCCESS
}

async fn run_worker(
    worker_id: usize,
    peers: Vec<(u64, std::net::SocketAddr)>,
    pool: Arc<ConnectionPool>,
    ops: usize,
    mode: Mode,
    put_ratio: f64,
) -> usize {
    let clerk = Clerk::new(peers, pool);
    let mut rng = rand::rng();
    let mut completed = 0usize;

    for i in 0..ops {
        let key = format!("bench-{worker_id}-{}", i % 100);
        let do_write = match mode {
            Mode::Put | Mode::Append => true,
            Mode::Get => false,
            Mode::Mixed => rng.random_bool(put_ratio),
        };

        let result = if do_write {
            match mode {
                Mode::Append => clerk.append(&key, "x").await,
                _ => clerk.put(&key, "x").await,
            }
        } else {
            clerk.get(&key).await.map(|_| ())
        };

        if result.is_ok() {
            completed += 1;
        }
    }

    completed
}
