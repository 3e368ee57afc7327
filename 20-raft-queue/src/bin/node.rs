//! Runs one node of the replicated queue behind an HTTP API.
//!
//! # Example usage
//!
//! Start a leader and two followers:
//! ```bash
//! # Terminal 1 (node 1, bootstraps the cluster)
//! cargo run --bin node -- --id 1 --raft-addr 127.0.0.1:7101 --http-addr 127.0.0.1:8101 --bootstrap
//!
//! # Terminal 2 (node 2)
//! cargo run --bin node -- --id 2 --raft-addr 127.0.0.1:7102 --http-addr 127.0.0.1:8102 \
//!   --join 127.0.0.1:8101
//!
//! # Terminal 3 (node 3)
//! cargo run --bin node -- --id 3 --raft-addr 127.0.0.1:7103 --http-addr 127.0.0.1:8103 \
//!   --join 127.0.0.1:8101
//!
//! curl -X POST 127.0.0.1:8101/send -d '{"author": "Alice", "content": "hi"}' \
//!   -H 'content-type: application/json'
//! curl 127.0.0.1:8101/receive
//! ```
//!
//! Raft state goes under `<data-dir>/node-<id>`. Restarting a node with the
//! same `--id`, `--raft-addr` and `--data-dir` (plus `--join`, which is then
//! a no-op) brings it back with its log and queue.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::net::TcpListener;
use tracing::{info, warn};

use raft_queue::http::{self, JoinRequest};
use raft_queue::{Comment, NodeConfig, RaftOptions, Store};

#[derive(Parser, Debug)]
#[command(author, version, about = "Run a node of the replicated message queue")]
struct Args {
    /// Unique, non-zero node id.
    #[arg(long)]
    id: u64,

    /// Address to bind for Raft traffic. Use port 0 for an ephemeral port.
    #[arg(long, default_value = "127.0.0.1:7101")]
    raft_addr: String,

    /// Raft address other nodes should dial, if it differs from the bound one.
    #[arg(long)]
    raft_advertise: Option<String>,

    /// Address to serve the HTTP API on.
    #[arg(long, default_value = "127.0.0.1:8101")]
    http_addr: SocketAddr,

    /// Seed a new single-node cluster with this node as leader.
    #[arg(long, alias = "leader")]
    bootstrap: bool,

    /// Base directory for raft state; each node uses its own `node-<id>` inside.
    #[arg(long, default_value = "raft-data")]
    data_dir: PathBuf,

    /// HTTP address of an existing node to ask for membership.
    #[arg(long, conflicts_with = "bootstrap")]
    join: Option<String>,

    /// Applied entries between log compactions.
    #[arg(long, default_value_t = RaftOptions::default().snapshot_threshold)]
    snapshot_threshold: u64,
}

fn init_tracing() {
    use tracing_subscriber::{EnvFilter, fmt};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = fmt().with_env_filter(filter).with_target(false).try_init();
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let args = Args::parse();

    let options = RaftOptions {
        snapshot_threshold: args.snapshot_threshold,
        ..RaftOptions::default()
    };
    let data_dir = args.data_dir.join(format!("node-{}", args.id));
    let mut config = NodeConfig::new(args.id, &args.raft_addr)
        .bootstrap(args.bootstrap)
        .data_dir(&data_dir)
        .with_options(options);
    if let Some(advertise) = &args.raft_advertise {
        config = config.advertise(advertise);
    }

    let store: Arc<Store<Comment>> = Arc::new(Store::start(config).context("starting raft node")?);
    info!(id = args.id, raft = store.raft_addr(), data_dir = %data_dir.display(), "store started");

    let listener = TcpListener::bind(args.http_addr)
        .await
        .with_context(|| format!("binding http listener on {}", args.http_addr))?;
    info!("http listening on {}", listener.local_addr()?);

    if let Some(leader) = &args.join {
        request_join(leader, args.id, store.raft_addr()).await?;
        info!(%leader, "joined cluster");
    }

    if let Err(err) = http::serve(listener, Arc::clone(&store), shutdown_signal()).await {
        warn!(error = ?err, "http server exited with error");
    }

    info!("stopping raft node");
    tokio::task::spawn_blocking(move || store.stop()).await?;
    Ok(())
}

async fn request_join(leader: &str, id: u64, raft_addr: &str) -> Result<()> {
    let request = JoinRequest {
        id,
        address: raft_addr.to_string(),
    };
    reqwest::Client::new()
        .post(format!("http://{leader}/join"))
        .json(&request)
        .send()
        .await
        .with_context(|| format!("sending join request to {leader}"))?
        .error_for_status()
        .with_context(|| format!("join rejected by {leader}"))?;
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            warn!(error = ?err, "failed to install ctrl-c handler");
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(err) => {
                warn!(error = ?err, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    info!("shutdown requested");
}
