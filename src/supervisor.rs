//! Worker supervisor
//!
//! One control loop task owns the port pool, the routing table and the set of
//! spawns in progress. Everything else talks to it through [`Supervisor`], a
//! cheap cloneable handle that sends commands and awaits replies. Since only
//! the loop touches that state, no locks are involved, and a lookup miss plus
//! the spawn it triggers happen in one step: a second request for the same
//! name arriving while the first spawn is in flight joins that spawn instead
//! of starting another.

use crate::admission::{Admission, Decision, DenyReason, MemoryReport};
use crate::ports::{PortPool, PortSlot, BASE_INDEX};
use crate::process::{LaunchSpec, SharedLauncher, SpawnError, WorkerHandle, WorkerProcess};
use crate::routing::{RoutingTable, WorkerDescriptor, WorkerInfo, WorkerState};
use serde::Serialize;
use std::collections::HashMap;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, info, warn};

/// Name under which the base worker is registered
pub const BASE_GRAPH: &str = "base";

const COMMAND_BUFFER: usize = 256;

/// Why a request could not be given a worker
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum DispatchError {
    #[error("out of ports")]
    OutOfPorts,
    #[error("out of memory")]
    OutOfMemory,
    #[error("not authorized to start a new graph")]
    NotAuthorized,
    #[error("spawn failed: {0}")]
    SpawnFailed(SpawnError),
}

impl From<DenyReason> for DispatchError {
    fn from(reason: DenyReason) -> Self {
        match reason {
            DenyReason::OutOfPorts => DispatchError::OutOfPorts,
            DenyReason::OutOfMemory => DispatchError::OutOfMemory,
            DenyReason::NotAuthorized => DispatchError::NotAuthorized,
        }
    }
}

impl From<SpawnError> for DispatchError {
    fn from(err: SpawnError) -> Self {
        match err {
            SpawnError::NoCapacity => DispatchError::OutOfPorts,
            other => DispatchError::SpawnFailed(other),
        }
    }
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TerminateError {
    /// No running graph worker by that name. The base worker is never
    /// a valid target.
    #[error("no running graph named '{0}'")]
    NotFound(String),
    #[error("graph '{0}' is still starting")]
    Starting(String),
    #[error("supervisor is not running")]
    SupervisorGone,
}

/// Settings the control loop needs besides its collaborators
#[derive(Debug, Clone)]
pub struct SupervisorSettings {
    pub startup_timeout: Duration,
    pub bind_address: Option<String>,
    pub analytics_id: Option<String>,
}

/// Point-in-time view of the supervisor
#[derive(Debug, Clone, Serialize)]
pub struct SupervisorStatus {
    /// Running workers, base first
    pub workers: Vec<WorkerInfo>,
    /// Names with a spawn in flight
    pub starting: Vec<String>,
    pub free_slots: usize,
    /// Slots available to graphs (base slot excluded)
    pub max_workers: usize,
    pub spawns_started: u64,
    pub memory: MemoryReport,
}

enum Command {
    Resolve {
        graph: String,
        authorized: bool,
        reply: oneshot::Sender<Result<WorkerInfo, DispatchError>>,
    },
    Spawn {
        graph: String,
        base: bool,
        reply: oneshot::Sender<Result<WorkerInfo, SpawnError>>,
    },
    Lookup {
        graph: String,
        reply: oneshot::Sender<Option<WorkerInfo>>,
    },
    Base {
        reply: oneshot::Sender<Option<WorkerInfo>>,
    },
    Terminate {
        graph: String,
        reply: oneshot::Sender<Result<WorkerInfo, TerminateError>>,
    },
    Status {
        reply: oneshot::Sender<SupervisorStatus>,
    },
    Shutdown {
        reply: oneshot::Sender<Vec<WorkerHandle>>,
    },
    Settled {
        graph: String,
        generation: u64,
        outcome: Result<(), SpawnError>,
    },
    Exited {
        graph: String,
        generation: u64,
        code: Option<i32>,
    },
}

/// Someone waiting on a spawn in progress
enum Waiter {
    Dispatch(oneshot::Sender<Result<WorkerInfo, DispatchError>>),
    Spawn(oneshot::Sender<Result<WorkerInfo, SpawnError>>),
}

impl Waiter {
    fn complete(self, result: Result<WorkerInfo, SpawnError>) {
        match self {
            Waiter::Dispatch(tx) => {
                let _ = tx.send(result.map_err(DispatchError::from));
            }
            Waiter::Spawn(tx) => {
                let _ = tx.send(result);
            }
        }
    }
}

/// Spawn-in-progress marker. Present from launch until readiness or failure.
struct PendingSpawn {
    slot: PortSlot,
    generation: u64,
    base: bool,
    handle: WorkerHandle,
    waiters: Vec<Waiter>,
}

/// Handle to the supervisor control loop
#[derive(Clone)]
pub struct Supervisor {
    tx: mpsc::Sender<Command>,
}

impl Supervisor {
    /// Start the control loop on the current runtime
    pub fn start(
        mut pool: PortPool,
        admission: Admission,
        launcher: SharedLauncher,
        settings: SupervisorSettings,
    ) -> Self {
        let base_slot = match pool.reserve(BASE_INDEX) {
            Ok(slot) => Some(slot),
            Err(e) => {
                error!(index = BASE_INDEX, error = %e, "Could not reserve the base worker slot");
                None
            }
        };

        let (tx, rx) = mpsc::channel(COMMAND_BUFFER);
        let control = ControlLoop {
            max_workers: pool.capacity().saturating_sub(1),
            pool,
            base_slot,
            table: RoutingTable::new(),
            pending: HashMap::new(),
            admission,
            launcher,
            settings,
            next_generation: 0,
            spawns_started: 0,
            tx: tx.downgrade(),
        };
        tokio::spawn(control.run(rx));
        Self { tx }
    }

    /// Find or start the worker for `graph`, suspending until it is ready.
    /// Admission control applies only when no worker exists or is starting.
    pub async fn resolve(&self, graph: &str, authorized: bool) -> Result<WorkerInfo, DispatchError> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::Resolve {
            graph: graph.to_string(),
            authorized,
            reply,
        })
        .await
        .map_err(|_| DispatchError::SpawnFailed(SpawnError::SupervisorGone))?;
        rx.await
            .unwrap_or(Err(DispatchError::SpawnFailed(SpawnError::SupervisorGone)))
    }

    /// Start a worker for `graph` without admission control. Returns the
    /// existing worker if one is running, or joins a spawn in progress.
    pub async fn spawn(&self, graph: &str) -> Result<WorkerInfo, SpawnError> {
        self.spawn_inner(graph, false).await
    }

    /// Start the base worker on the reserved slot
    pub async fn spawn_base(&self) -> Result<WorkerInfo, SpawnError> {
        self.spawn_inner(BASE_GRAPH, true).await
    }

    async fn spawn_inner(&self, graph: &str, base: bool) -> Result<WorkerInfo, SpawnError> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::Spawn {
            graph: graph.to_string(),
            base,
            reply,
        })
        .await
        .map_err(|_| SpawnError::SupervisorGone)?;
        rx.await.unwrap_or(Err(SpawnError::SupervisorGone))
    }

    pub async fn lookup(&self, graph: &str) -> Option<WorkerInfo> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::Lookup {
            graph: graph.to_string(),
            reply,
        })
        .await
        .ok()?;
        rx.await.ok().flatten()
    }

    pub async fn base(&self) -> Option<WorkerInfo> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::Base { reply }).await.ok()?;
        rx.await.ok().flatten()
    }

    /// Stop the worker for `graph` and reclaim its slot. Returns once the
    /// table no longer routes to it; the process may still be exiting.
    pub async fn terminate(&self, graph: &str) -> Result<WorkerInfo, TerminateError> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::Terminate {
            graph: graph.to_string(),
            reply,
        })
        .await
        .map_err(|_| TerminateError::SupervisorGone)?;
        rx.await.unwrap_or(Err(TerminateError::SupervisorGone))
    }

    pub async fn status(&self) -> Option<SupervisorStatus> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::Status { reply }).await.ok()?;
        rx.await.ok()
    }

    /// Stop every worker, base included, and wait for their processes
    pub async fn shutdown(&self) {
        let (reply, rx) = oneshot::channel();
        if self.send(Command::Shutdown { reply }).await.is_err() {
            return;
        }
        let Ok(handles) = rx.await else {
            return;
        };

        info!(count = handles.len(), "Stopping all workers");
        let tasks: Vec<_> = handles
            .into_iter()
            .map(|handle| tokio::spawn(handle.shutdown()))
            .collect();
        for task in tasks {
            let _ = task.await;
        }
    }

    async fn send(&self, command: Command) -> Result<(), mpsc::error::SendError<Command>> {
        self.tx.send(command).await
    }
}

struct ControlLoop {
    pool: PortPool,
    /// Held out of `pool` while no base worker owns it
    base_slot: Option<PortSlot>,
    table: RoutingTable,
    pending: HashMap<String, PendingSpawn>,
    admission: Admission,
    launcher: SharedLauncher,
    settings: SupervisorSettings,
    max_workers: usize,
    next_generation: u64,
    spawns_started: u64,
    /// Weak so the loop ends once every [`Supervisor`] handle is gone
    tx: mpsc::WeakSender<Command>,
}

impl ControlLoop {
    async fn run(mut self, mut rx: mpsc::Receiver<Command>) {
        debug!(max_workers = self.max_workers, "Supervisor control loop started");

        while let Some(command) = rx.recv().await {
            match command {
                Command::Resolve {
                    graph,
                    authorized,
                    reply,
                } => self.resolve(graph, authorized, reply),
                Command::Spawn { graph, base, reply } => {
                    self.spawn(graph, base, Waiter::Spawn(reply))
                }
                Command::Lookup { graph, reply } => {
                    let _ = reply.send(self.table.lookup(&graph).map(WorkerDescriptor::info));
                }
                Command::Base { reply } => {
                    let _ = reply.send(self.table.base().map(WorkerDescriptor::info));
                }
                Command::Terminate { graph, reply } => {
                    let _ = reply.send(self.terminate(&graph));
                }
                Command::Status { reply } => {
                    let _ = reply.send(self.status());
                }
                Command::Shutdown { reply } => {
                    let _ = reply.send(self.drain());
                }
                Command::Settled {
                    graph,
                    generation,
                    outcome,
                } => self.settle(graph, generation, outcome),
                Command::Exited {
                    graph,
                    generation,
                    code,
                } => self.exited(&graph, generation, code),
            }
        }

        // Dropping the remaining handles stops their workers
        let remaining = self.drain();
        debug!(count = remaining.len(), "Supervisor control loop finished");
    }

    fn resolve(
        &mut self,
        graph: String,
        authorized: bool,
        reply: oneshot::Sender<Result<WorkerInfo, DispatchError>>,
    ) {
        if let Some(worker) = self.table.lookup(&graph) {
            debug!(graph, app_port = worker.slot.app_port, "Routing to running worker");
            let _ = reply.send(Ok(worker.info()));
            return;
        }

        if let Some(pending) = self.pending.get_mut(&graph) {
            debug!(graph, "Joining spawn in progress");
            pending.waiters.push(Waiter::Dispatch(reply));
            return;
        }

        match self.admission.evaluate(&graph, &self.pool, authorized) {
            Decision::Allow => self.spawn(graph, false, Waiter::Dispatch(reply)),
            Decision::Deny(reason) => {
                let _ = reply.send(Err(reason.into()));
            }
        }
    }

    fn spawn(&mut self, graph: String, base: bool, waiter: Waiter) {
        if let Some(worker) = self.table.lookup(&graph) {
            waiter.complete(Ok(worker.info()));
            return;
        }
        if let Some(pending) = self.pending.get_mut(&graph) {
            pending.waiters.push(waiter);
            return;
        }

        let slot = if base {
            self.base_slot.take()
        } else {
            self.pool.acquire().ok()
        };
        let Some(slot) = slot else {
            warn!(graph, base, "No free port slot for new worker");
            waiter.complete(Err(SpawnError::NoCapacity));
            return;
        };

        let spec = LaunchSpec {
            graph: graph.clone(),
            slot,
            bind_address: self.settings.bind_address.clone(),
            analytics_id: self.settings.analytics_id.clone(),
        };

        let WorkerProcess {
            pid,
            ready,
            exited,
            handle,
        } = match self.launcher.launch(&spec) {
            Ok(process) => process,
            Err(e) => {
                error!(graph, error = %e, "Failed to launch worker");
                self.release(slot);
                waiter.complete(Err(e));
                return;
            }
        };

        self.next_generation += 1;
        self.spawns_started += 1;
        let generation = self.next_generation;

        info!(graph, pid, index = slot.index, app_port = slot.app_port, generation, "Worker starting");

        self.pending.insert(
            graph.clone(),
            PendingSpawn {
                slot,
                generation,
                base,
                handle,
                waiters: vec![waiter],
            },
        );

        let tx = self.tx.clone();
        let startup_timeout = self.settings.startup_timeout;
        tokio::spawn(async move {
            let outcome = match tokio::time::timeout(startup_timeout, ready).await {
                Ok(Ok(result)) => result,
                Ok(Err(_)) => Err(SpawnError::ChannelClosed),
                Err(_) => Err(SpawnError::Timeout(startup_timeout)),
            };
            let became_ready = outcome.is_ok();

            let Some(sender) = tx.upgrade() else {
                return;
            };
            let settled = Command::Settled {
                graph: graph.clone(),
                generation,
                outcome,
            };
            if sender.send(settled).await.is_err() || !became_ready {
                return;
            }
            // Release the strong sender while the worker runs
            drop(sender);

            let code = exited.await.ok().flatten();
            if let Some(sender) = tx.upgrade() {
                let _ = sender.send(Command::Exited { graph, generation, code }).await;
            }
        });
    }

    fn settle(&mut self, graph: String, generation: u64, outcome: Result<(), SpawnError>) {
        let Some(pending) = self.pending.remove(&graph) else {
            warn!(graph, generation, "Readiness outcome for unknown spawn");
            return;
        };
        if pending.generation != generation {
            warn!(graph, generation, "Readiness outcome for stale spawn");
            self.pending.insert(graph, pending);
            return;
        }

        let PendingSpawn {
            slot,
            generation,
            base,
            mut handle,
            waiters,
        } = pending;

        if let Err(e) = outcome {
            error!(graph, index = slot.index, error = %e, "Worker failed to start");
            handle.stop();
            self.release(slot);
            for waiter in waiters {
                waiter.complete(Err(e.clone()));
            }
            return;
        }

        let descriptor = WorkerDescriptor {
            name: graph.clone(),
            slot,
            state: WorkerState::Ready,
            generation,
            base,
            started_at: Instant::now(),
            handle,
        };
        let info = descriptor.info();

        let registered = if base {
            self.table.set_base(descriptor)
        } else {
            self.table.register(descriptor)
        };

        if let Err(mut rejected) = registered {
            // The pending marker makes this unreachable
            error!(graph, "Invariant violation: worker registered twice");
            rejected.handle.stop();
            self.release(rejected.slot);
            for waiter in waiters {
                waiter.complete(Err(SpawnError::Stopped));
            }
            return;
        }

        info!(
            graph,
            index = slot.index,
            app_port = slot.app_port,
            ws_port = slot.ws_port,
            waiters = waiters.len(),
            graphs = self.table.graph_count(),
            "Worker ready"
        );
        for waiter in waiters {
            waiter.complete(Ok(info.clone()));
        }
    }

    fn exited(&mut self, graph: &str, generation: u64, code: Option<i32>) {
        let Some(descriptor) = self.table.remove_exited(graph, generation) else {
            // Already terminated through the table
            return;
        };

        if descriptor.base {
            error!(graph, ?code, "Base worker exited; fallback routes are unavailable");
        } else {
            warn!(graph, ?code, index = descriptor.slot.index, "Worker exited, removing route");
        }
        self.release(descriptor.slot);
    }

    fn terminate(&mut self, graph: &str) -> Result<WorkerInfo, TerminateError> {
        let Some(mut descriptor) = self.table.remove(graph) else {
            if self.pending.contains_key(graph) {
                return Err(TerminateError::Starting(graph.to_string()));
            }
            return Err(TerminateError::NotFound(graph.to_string()));
        };

        descriptor.state = WorkerState::Terminating;
        let info = descriptor.info();
        descriptor.handle.stop();
        self.release(descriptor.slot);

        info!(graph, index = descriptor.slot.index, "Worker terminated");
        Ok(info)
    }

    fn status(&self) -> SupervisorStatus {
        let mut starting: Vec<String> = self.pending.keys().cloned().collect();
        starting.sort();

        SupervisorStatus {
            workers: self.table.workers(),
            starting,
            free_slots: self.pool.available(),
            max_workers: self.max_workers,
            spawns_started: self.spawns_started,
            memory: self.admission.memory(),
        }
    }

    /// Take every worker handle out of the loop's state
    fn drain(&mut self) -> Vec<WorkerHandle> {
        let mut handles: Vec<WorkerHandle> = Vec::new();

        for descriptor in self.table.drain() {
            self.release(descriptor.slot);
            handles.push(descriptor.handle);
        }
        let pending: Vec<PendingSpawn> = self.pending.drain().map(|(_, p)| p).collect();
        for pending in pending {
            self.release(pending.slot);
            for waiter in pending.waiters {
                waiter.complete(Err(SpawnError::Stopped));
            }
            handles.push(pending.handle);
        }
        handles
    }

    /// Hand a slot back: the base slot to its reservation, any other to the pool
    fn release(&mut self, slot: PortSlot) {
        if slot.index == BASE_INDEX {
            if self.base_slot.replace(slot).is_some() {
                error!(index = slot.index, "Invariant violation: base slot released twice");
            }
            return;
        }
        if let Err(e) = self.pool.release(slot.index) {
            error!(index = slot.index, error = %e, "Failed to reclaim port slot");
        }
    }
}
