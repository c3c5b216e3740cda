use std::path::Path;
use std::time::Duration;

use clap::Parser;
use tracing::info;
use tracing_subscriber::prelude::*;

use concord_common::NodeId;
use concord_node::{
    cli::{Cli, Command},
    config::{Config, MemberConfig},
    simulation::{run_simulation, SimulationConfig},
};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();
    let label = match &cli.command {
        Command::Init { node_id, .. } => node_id.clone(),
        Command::Simulate { .. } => "simulation".to_string(),
    };

    std::fs::create_dir_all(&cli.log_dir)?;
    let file_appender =
        tracing_appender::rolling::never(&cli.log_dir, format!("consensus-{}.log", label));
    let (non_blocking, _guard) = tracing_appender::non_blocking(file_appender);

    let consensus_layer = tracing_subscriber::fmt::layer()
        .with_writer(non_blocking)
        .with_ansi(false)
        .with_filter(tracing_subscriber::filter::filter_fn(|metadata| {
            metadata.target() == "consensus"
        }));

    let stdout_layer = tracing_subscriber::fmt::layer()
        .with_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,concord_node=debug".into()),
        )
        .with_filter(tracing_subscriber::filter::filter_fn(|metadata| {
            metadata.target() != "consensus"
        }));

    tracing_subscriber::registry()
        .with(consensus_layer)
        .with(stdout_layer)
        .init();

    match cli.command {
        Command::Init { out, node_id, members, data_dir } => {
            init_config(&out, node_id, members, data_dir)?;
        }
        Command::Simulate { nodes, commands, duration_ms, config, data_dir, latency_max_ms, seed } => {
            let (consensus, members, config_dir) = match config {
                Some(path) => {
                    let config = Config::load_from_file(path)?;
                    let members = config.cluster_members();
                    let members = if members.len() > 1 { members } else { Vec::new() };
                    (config.consensus, members, config.data_dir)
                }
                None => Default::default(),
            };
            let report = run_simulation(SimulationConfig {
                nodes,
                members,
                data_dir: data_dir.or(config_dir),
                commands,
                duration: Duration::from_millis(duration_ms),
                consensus,
                latency_max_ms,
                seed,
            })
            .await?;

            info!("--- SIMULATION FINISHED ---");
            println!(
                "leader: {}  submitted: {}  delivered: {}  dropped: {}",
                report.leader.as_ref().map(|l| l.as_str()).unwrap_or("none"),
                report.submitted,
                report.delivered,
                report.dropped
            );
            for node in &report.nodes {
                println!(
                    "{:<6} {:<9} term={:<3} commit={:<4} applied={:<4} active={}",
                    node.id, node.role, node.term, node.commit_index, node.applied, node.active_members
                );
            }
        }
    }
    Ok(())
}

fn init_config(
    out: &Path,
    node_id: String,
    members: Vec<String>,
    data_dir: Option<std::path::PathBuf>,
) -> Result<(), Box<dyn std::error::Error>> {
    let mut config = Config::new(NodeId::from(node_id));
    config.data_dir = data_dir;
    config.members.extend(
        members
            .into_iter()
            .filter(|m| !m.is_empty())
            .map(|m| MemberConfig { id: NodeId::from(m), weight: 1 }),
    );
    config.validate()?;
    config.save_to_file(out)?;
    info!("📝 Wrote config for {} to {}", config.node_id, out.display());
    Ok(())
}
