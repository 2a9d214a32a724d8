//! Routing table: database name to running worker
//!
//! The base worker lives in its own field rather than among the graphs, so no
//! removal path can reach it.

use crate::ports::PortSlot;
use crate::process::WorkerHandle;
use serde::Serialize;
use std::collections::HashMap;
use std::time::Instant;

/// Lifecycle state of a worker
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkerState {
    /// Launched, waiting for its readiness signal
    Starting,
    /// Listener bound, accepting traffic
    Ready,
    /// Stop requested
    Terminating,
}

/// A worker owned by the routing table
#[derive(Debug)]
pub struct WorkerDescriptor {
    pub name: String,
    pub slot: PortSlot,
    pub state: WorkerState,
    /// Distinguishes successive workers started under the same name
    pub generation: u64,
    pub base: bool,
    pub started_at: Instant,
    pub handle: WorkerHandle,
}

impl WorkerDescriptor {
    pub fn info(&self) -> WorkerInfo {
        WorkerInfo {
            name: self.name.clone(),
            index: self.slot.index,
            app_port: self.slot.app_port,
            ws_port: self.slot.ws_port,
            state: self.state,
            generation: self.generation,
            pid: self.handle.pid(),
            base: self.base,
            uptime_secs: self.started_at.elapsed().as_secs(),
        }
    }
}

/// Snapshot of a worker, safe to hand out of the control loop
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct WorkerInfo {
    pub name: String,
    pub index: u16,
    pub app_port: u16,
    pub ws_port: u16,
    pub state: WorkerState,
    pub generation: u64,
    pub pid: Option<u32>,
    pub base: bool,
    pub uptime_secs: u64,
}

#[derive(Debug, Default)]
pub struct RoutingTable {
    base: Option<WorkerDescriptor>,
    graphs: HashMap<String, WorkerDescriptor>,
}

impl RoutingTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Find the worker serving `name`. The base worker answers to its own
    /// name as well.
    pub fn lookup(&self, name: &str) -> Option<&WorkerDescriptor> {
        self.graphs
            .get(name)
            .or_else(|| self.base.as_ref().filter(|b| b.name == name))
    }

    pub fn base(&self) -> Option<&WorkerDescriptor> {
        self.base.as_ref()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.lookup(name).is_some()
    }

    /// Install the base worker. First writer wins; a rejected descriptor is
    /// handed back so its owner can stop it.
    pub fn set_base(&mut self, descriptor: WorkerDescriptor) -> Result<(), WorkerDescriptor> {
        if self.base.is_some() || self.graphs.contains_key(&descriptor.name) {
            return Err(descriptor);
        }
        self.base = Some(descriptor);
        Ok(())
    }

    /// Register a graph worker. First writer wins; a rejected descriptor is
    /// handed back so its owner can stop it.
    pub fn register(&mut self, descriptor: WorkerDescriptor) -> Result<(), WorkerDescriptor> {
        if self.contains(&descriptor.name) {
            return Err(descriptor);
        }
        self.graphs.insert(descriptor.name.clone(), descriptor);
        Ok(())
    }

    /// Remove a graph worker. Never removes the base worker.
    pub fn remove(&mut self, name: &str) -> Option<WorkerDescriptor> {
        self.graphs.remove(name)
    }

    /// Remove whichever worker is `name` at `generation`, base included.
    /// Used when a worker's process has already gone away.
    pub fn remove_exited(&mut self, name: &str, generation: u64) -> Option<WorkerDescriptor> {
        if self
            .graphs
            .get(name)
            .is_some_and(|d| d.generation == generation)
        {
            return self.graphs.remove(name);
        }
        if self
            .base
            .as_ref()
            .is_some_and(|b| b.name == name && b.generation == generation)
        {
            return self.base.take();
        }
        None
    }

    /// Number of graph workers, base excluded
    pub fn graph_count(&self) -> usize {
        self.graphs.len()
    }

    /// All workers, base first, then graphs by slot index
    pub fn workers(&self) -> Vec<WorkerInfo> {
        let mut graphs: Vec<WorkerInfo> = self.graphs.values().map(WorkerDescriptor::info).collect();
        graphs.sort_by_key(|w| w.index);

        self.base.iter().map(WorkerDescriptor::info).chain(graphs).collect()
    }

    /// Empty the table, handing every descriptor to the caller
    pub fn drain(&mut self) -> Vec<WorkerDescriptor> {
        self.base.take().into_iter().chain(self.graphs.drain().map(|(_, d)| d)).collect()
    }
}
