use futures::future::OptionFuture;
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use concord_common::{
    env::{LogIndex, ProposalKind, RoundId},
    ConcordError, NodeId, Result,
};
use concord_p2p::{Envelope, Transport};

use super::coordinator::{Coordinator, Effects, HealthReport, Outbound, TimerKind};
use super::timers::Timers;

pub const COMMAND_CAPACITY: usize = 64;

/// Requests from the outside world into a running node.
#[derive(Debug)]
pub enum MaestroCommand {
    Submit {
        command: Vec<u8>,
        reply: oneshot::Sender<Result<LogIndex>>,
    },
    Propose {
        kind: ProposalKind,
        reply: oneshot::Sender<Result<RoundId>>,
    },
    Isolate {
        member: NodeId,
        reason: String,
        reply: oneshot::Sender<Result<()>>,
    },
    ReportMalicious {
        member: NodeId,
        reason: String,
        reply: oneshot::Sender<Result<()>>,
    },
    Status {
        reply: oneshot::Sender<HealthReport>,
    },
    Shutdown,
}

/// Drives one [`Coordinator`]: feeds it inbound envelopes, timer firings and
/// local commands, and carries out the effects it returns.
pub struct Maestro<T: Transport> {
    coordinator: Coordinator,
    transport: T,
    inbox: mpsc::Receiver<Envelope>,
    commands: mpsc::Receiver<MaestroCommand>,
    timers: Timers,
    epoch: Instant,
}

impl<T: Transport + 'static> Maestro<T> {
    pub fn new(
        coordinator: Coordinator,
        transport: T,
        inbox: mpsc::Receiver<Envelope>,
        commands: mpsc::Receiver<MaestroCommand>,
    ) -> Self {
        Self {
            coordinator,
            transport,
            inbox,
            commands,
            timers: Timers::new(),
            epoch: Instant::now(),
        }
    }

    /// Milliseconds since the loop was created. All coordinator clocks use it.
    fn now_ms(&self) -> u64 {
        self.epoch.elapsed().as_millis() as u64
    }

    pub async fn run(mut self) -> Result<()> {
        let start = self.coordinator.start(self.now_ms())?;
        self.dispatch(start).await;
        info!("Maestro loop running for {}", self.coordinator.id());

        loop {
            let sleep: OptionFuture<_> = self
                .timers
                .next()
                .map(|(_, at)| tokio::time::sleep_until(at))
                .into();

            tokio::select! {
                Some(envelope) = self.inbox.recv() => {
                    let now_ms = self.now_ms();
                    match self.coordinator.handle(envelope, now_ms) {
                        Ok(effects) => self.dispatch(effects).await,
                        Err(e) => self.coordinator.log_failure("handle", &e),
                    }
                }
                command = self.commands.recv() => match command {
                    None | Some(MaestroCommand::Shutdown) => break,
                    Some(command) => self.on_command(command).await,
                },
                Some(()) = sleep => self.fire_due_timers().await,
            }
        }

        info!("🛑 Maestro for {} stopped", self.coordinator.id());
        Ok(())
    }

    async fn fire_due_timers(&mut self) {
        for timer in self.timers.take_due(Instant::now()) {
            let now_ms = self.now_ms();
            let effects = match timer {
                TimerKind::Election => match self.coordinator.on_election_timeout(now_ms) {
                    Ok(effects) => effects,
                    Err(e) => {
                        self.coordinator.log_failure("election", &e);
                        continue;
                    }
                },
                TimerKind::Heartbeat => self.coordinator.on_heartbeat_tick(now_ms),
                TimerKind::FaultScan => self.coordinator.on_fault_scan(now_ms),
                TimerKind::HealthCheck => self.coordinator.on_health_check(now_ms),
                TimerKind::VoteDeadline => self.coordinator.on_vote_deadline(now_ms),
            };
            self.dispatch(effects).await;
        }
    }

    async fn on_command(&mut self, command: MaestroCommand) {
        let now_ms = self.now_ms();
        match command {
            MaestroCommand::Submit { command, reply } => {
                let result = self.coordinator.submit_command(command, now_ms);
                let result = match result {
                    Ok((index, effects)) => {
                        self.dispatch(effects).await;
                        Ok(index)
                    }
                    Err(e) => Err(e),
                };
                let _ = reply.send(result);
            }
            MaestroCommand::Propose { kind, reply } => {
                let result = match self.coordinator.propose(kind, now_ms) {
                    Ok((round_id, effects)) => {
                        self.dispatch(effects).await;
                        Ok(round_id)
                    }
                    Err(e) => Err(e),
                };
                let _ = reply.send(result);
            }
            MaestroCommand::Isolate { member, reason, reply } => {
                let result = match self.coordinator.isolate(&member, &reason) {
                    Ok(effects) => {
                        self.dispatch(effects).await;
                        Ok(())
                    }
                    Err(e) => Err(e),
                };
                let _ = reply.send(result);
            }
            MaestroCommand::ReportMalicious { member, reason, reply } => {
                let _ = reply.send(self.coordinator.report_malicious(&member, &reason));
            }
            MaestroCommand::Status { reply } => {
                let _ = reply.send(self.coordinator.health());
            }
            MaestroCommand::Shutdown => {}
        }
    }

    async fn dispatch(&mut self, effects: Effects) {
        let now = Instant::now();
        for command in effects.timers {
            self.timers.apply(command, now);
        }
        for outbound in effects.outbound {
            let result = match outbound {
                Outbound::Broadcast(message) => {
                    debug!(target: "consensus", "EVENT:BROADCAST kind={} from={}", message.kind(), self.transport.local_id());
                    self.transport.broadcast(message).await
                }
                Outbound::Send { to, message } => self.transport.send(&to, message).await,
            };
            if let Err(e) = result {
                warn!("Outbound message from {} failed: {}", self.coordinator.id(), e);
            }
        }
    }
}

/// Cloneable control handle of a running node.
#[derive(Debug, Clone)]
pub struct MaestroHandle {
    id: NodeId,
    tx: mpsc::Sender<MaestroCommand>,
}

impl MaestroHandle {
    pub fn new(id: NodeId, tx: mpsc::Sender<MaestroCommand>) -> Self {
        Self { id, tx }
    }

    pub fn id(&self) -> &NodeId {
        &self.id
    }

    async fn request<R>(&self, make: impl FnOnce(oneshot::Sender<R>) -> MaestroCommand) -> Result<R> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(make(reply))
            .await
            .map_err(|_| ConcordError::Other(format!("node {} is not running", self.id)))?;
        rx.await
            .map_err(|_| ConcordError::Other(format!("node {} dropped the request", self.id)))
    }

    /// Appends a command to the replicated log. Only the leader accepts.
    pub async fn submit_command(&self, command: Vec<u8>) -> Result<LogIndex> {
        self.request(|reply| MaestroCommand::Submit { command, reply }).await?
    }

    pub async fn propose(&self, kind: ProposalKind) -> Result<RoundId> {
        self.request(|reply| MaestroCommand::Propose { kind, reply }).await?
    }

    pub async fn isolate(&self, member: NodeId, reason: &str) -> Result<()> {
        let reason = reason.to_string();
        self.request(|reply| MaestroCommand::Isolate { member, reason, reply })
            .await?
    }

    pub async fn report_malicious(&self, member: NodeId, reason: &str) -> Result<()> {
        let reason = reason.to_string();
        self.request(|reply| MaestroCommand::ReportMalicious { member, reason, reply })
            .await?
    }

    pub async fn status(&self) -> Result<HealthReport> {
        self.request(|reply| MaestroCommand::Status { reply }).await
    }

    pub async fn shutdown(&self) {
        let _ = self.tx.send(MaestroCommand::Shutdown).await;
    }
}
