//! Admission control for new workers
//!
//! Consulted only when a request names a database with no running worker.
//! Checks run in a fixed order and the first failing check decides.

use crate::ports::PortPool;
use serde::Serialize;
use std::sync::Arc;
use sysinfo::System;
use tracing::{debug, warn};

const BYTES_PER_MB: u64 = 1024 * 1024;

/// Source of the current memory headroom
pub trait MemorySource: Send + Sync {
    /// Memory available for new workers, in megabytes
    fn available_mb(&self) -> u64;
}

/// Samples available system memory on every call
#[derive(Debug, Default)]
pub struct SystemMemory;

impl MemorySource for SystemMemory {
    fn available_mb(&self) -> u64 {
        let mut sys = System::new();
        sys.refresh_memory();
        sys.available_memory() / BYTES_PER_MB
    }
}

/// Why a spawn was refused
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum DenyReason {
    OutOfPorts,
    OutOfMemory,
    NotAuthorized,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    Allow,
    Deny(DenyReason),
}

/// Memory headroom as seen by the admission check
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct MemoryReport {
    pub available_mb: u64,
    pub floor_mb: u64,
    pub out_of_memory: bool,
}

pub struct Admission {
    memory_floor_mb: u64,
    allow_new: bool,
    source: Arc<dyn MemorySource>,
}

impl Admission {
    pub fn new(memory_floor_mb: u64, allow_new: bool, source: Arc<dyn MemorySource>) -> Self {
        Self {
            memory_floor_mb,
            allow_new,
            source,
        }
    }

    /// Decide whether `graph` may get a new worker
    pub fn evaluate(&self, graph: &str, pool: &PortPool, authorized: bool) -> Decision {
        if pool.is_exhausted() {
            warn!(graph, "No free port slots, not spawning");
            return Decision::Deny(DenyReason::OutOfPorts);
        }

        let memory = self.memory();
        if memory.out_of_memory {
            warn!(
                graph,
                available_mb = memory.available_mb,
                floor_mb = memory.floor_mb,
                "Memory below floor, not spawning"
            );
            return Decision::Deny(DenyReason::OutOfMemory);
        }

        if self.allow_new || authorized {
            debug!(graph, allow_new = self.allow_new, authorized, "Spawn admitted");
            Decision::Allow
        } else {
            debug!(graph, "Spawn refused, caller not authorized");
            Decision::Deny(DenyReason::NotAuthorized)
        }
    }

    /// Sample memory now
    pub fn memory(&self) -> MemoryReport {
        let available_mb = self.source.available_mb();
        MemoryReport {
            available_mb,
            floor_mb: self.memory_floor_mb,
            out_of_memory: available_mb < self.memory_floor_mb,
        }
    }
}
