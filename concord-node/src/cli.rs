use std::path::PathBuf;

use clap::{Parser, Subcommand};

#[derive(Debug, Parser)]
#[command(name = "concord-node", about = "Cluster coordination node", version)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,

    /// Directory for the consensus event log.
    #[arg(long, global = true, default_value = "logs")]
    pub log_dir: PathBuf,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Write a default node configuration.
    Init {
        #[arg(long, default_value = "config.json")]
        out: PathBuf,
        #[arg(long)]
        node_id: String,
        /// Additional bootstrap members, comma separated.
        #[arg(long, value_delimiter = ',')]
        members: Vec<String>,
        #[arg(long)]
        data_dir: Option<PathBuf>,
    },
    /// Run an in-process cluster over a simulated network.
    Simulate {
        #[arg(long, default_value_t = 5)]
        nodes: usize,
        /// Commands submitted to the leader.
        #[arg(long, default_value_t = 10)]
        commands: usize,
        #[arg(long, default_value_t = 3000)]
        duration_ms: u64,
        /// Node config whose consensus section, and member list when it has
        /// more than one entry, every simulated node shares.
        #[arg(long)]
        config: Option<PathBuf>,
        /// Persist Raft state of each node under this directory.
        #[arg(long)]
        data_dir: Option<PathBuf>,
        /// Upper bound of the random per-message latency.
        #[arg(long, default_value_t = 0)]
        latency_max_ms: u64,
        #[arg(long)]
        seed: Option<u64>,
    },
}
