use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::info;

use concord_common::Result;
use concord_consensus::{storage::Persistence, FileStore, MemoryStore, StateMachine};
use concord_p2p::{Envelope, Transport};

use crate::config::Config;
use crate::runtime::coordinator::{Coordinator, VotePolicy};
use crate::runtime::maestro::{Maestro, MaestroHandle, COMMAND_CAPACITY};

/// A spawned node: its control handle and the task running its loop.
pub struct NodeRuntime {
    pub handle: MaestroHandle,
    pub task: JoinHandle<Result<()>>,
}

/// Durable store under `data_dir` when configured, in-memory otherwise.
pub fn open_store(config: &Config) -> Result<Box<dyn Persistence>> {
    match &config.data_dir {
        Some(dir) => Ok(Box::new(FileStore::open(dir.join(config.node_id.as_str()))?)),
        None => Ok(Box::new(MemoryStore::new())),
    }
}

/// Builds the coordinator for `config` and spawns its node loop.
pub fn build_runtime<T: Transport + 'static>(
    config: &Config,
    transport: T,
    inbox: mpsc::Receiver<Envelope>,
    store: Box<dyn Persistence>,
    state_machine: Box<dyn StateMachine>,
    policy: Box<dyn VotePolicy>,
) -> Result<NodeRuntime> {
    config.validate()?;
    let coordinator = Coordinator::new(
        config.node_id.clone(),
        config.consensus.clone(),
        &config.cluster_members(),
        store,
        state_machine,
        policy,
        0,
    )?;

    let (cmd_tx, cmd_rx) = mpsc::channel(COMMAND_CAPACITY);
    let maestro = Maestro::new(coordinator, transport, inbox, cmd_rx);
    let task = tokio::spawn(maestro.run());
    info!("✅ Runtime for {} spawned", config.node_id);

    Ok(NodeRuntime {
        handle: MaestroHandle::new(config.node_id.clone(), cmd_tx),
        task,
    })
}
