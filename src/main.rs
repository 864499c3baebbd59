use std::collections::HashMap;
use std::sync::mpsc;
use std::time::Duration;

use clap::Parser;
use tracing_subscriber::EnvFilter;

use replicore::quorum::{QuorumPolicy, QuorumSize};
use replicore::runtime::TimerConfig;
use replicore::server::{Config, Server};

#[derive(Parser)]
#[command(about = "A replicated key-value store with tunable quorums")]
struct Args {
    /// This node's numeric ID (must be unique in the cluster).
    #[arg(long)]
    id: u64,

    /// TCP address to listen on for replication RPCs.
    #[arg(long)]
    addr: String,

    /// A peer in the form ID=ADDR. Repeat for each peer.
    #[arg(long = "peer")]
    peers: Vec<String>,

    /// Directory for persistent state (meta.json, log.jsonl, snapshot.json).
    #[arg(long)]
    data_dir: std::path::PathBuf,

    /// Acknowledgments a write needs to commit: 'majority', 'all', or a count.
    #[arg(long, default_value = "majority")]
    write_quorum: QuorumSize,

    /// Acknowledgments a strong read needs: 'majority', 'all', or a count.
    #[arg(long, default_value = "majority")]
    read_quorum: QuorumSize,

    /// Base election timeout in milliseconds; each node adds its own jitter.
    #[arg(long, default_value_t = 300)]
    election_timeout_ms: u64,

    /// Leader heartbeat interval in milliseconds.
    #[arg(long, default_value_t = 100)]
    heartbeat_interval_ms: u64,

    /// Snapshot and compact once this many entries accumulate. 0 disables.
    #[arg(long, default_value_t = 1024)]
    compact_after: usize,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();

    let mut peers: HashMap<String, String> = HashMap::new();
    for p in &args.peers {
        let (id, addr) = p
            .split_once('=')
            .ok_or_else(|| format!("--peer must be ID=ADDR, got: {p}"))?;
        peers.insert(id.to_string(), addr.to_string());
    }

    let quorum = QuorumPolicy {
        write: args.write_quorum,
        read: args.read_quorum,
    };
    if !quorum.overlap_guaranteed(peers.len() + 1) {
        tracing::warn!(
            write = %quorum.write,
            read = %quorum.read,
            "write and read quorums do not overlap; strong reads may miss recent writes"
        );
    }

    // The sending half is the embedding seam for client frontends; the bare
    // binary runs the replica without one.
    let (_client_tx, client_rx) = mpsc::channel();

    Server::start(
        Config {
            id: args.id,
            addr: args.addr,
            peers,
            data_dir: args.data_dir,
            quorum,
            timers: TimerConfig {
                election_timeout: Duration::from_millis(args.election_timeout_ms),
                heartbeat_interval: Duration::from_millis(args.heartbeat_interval_ms),
            },
            compaction_threshold: args.compact_after,
        },
        client_rx,
    )?
    .run()?;

    Ok(())
}
