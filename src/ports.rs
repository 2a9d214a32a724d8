//! Port slot pool
//!
//! Every worker owns one slot: an index plus the application port and the
//! companion (websocket) port derived from it. `acquire` always hands out
//! the smallest free index, so a released index is the first one reused.

use serde::Serialize;
use std::collections::BTreeSet;
use thiserror::Error;
use tracing::error;

/// Index reserved for the always-running base worker
pub const BASE_INDEX: u16 = 0;

/// A reservable pair of ports identified by its index
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PortSlot {
    pub index: u16,
    pub app_port: u16,
    pub ws_port: u16,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum PortPoolError {
    #[error("port pool exhausted")]
    Exhausted,
    /// The index was released while already free. Two owners believed they
    /// held the same slot.
    #[error("port index {0} released twice")]
    DoubleRelease(u16),
    #[error("port index {0} is outside the pool")]
    OutOfRange(u16),
    #[error("port index {0} is already taken")]
    Taken(u16),
}

#[derive(Debug)]
pub struct PortPool {
    app_base: u16,
    ws_base: u16,
    max_index: u16,
    free: BTreeSet<u16>,
}

impl PortPool {
    /// Create a pool holding indices `0..=max_workers`. Index 0 belongs to
    /// the base worker, leaving `max_workers` slots for graphs.
    pub fn new(app_base: u16, ws_base: u16, max_workers: u16) -> Self {
        Self {
            app_base,
            ws_base,
            max_index: max_workers,
            free: (0..=max_workers).collect(),
        }
    }

    /// Take the smallest free slot. Never blocks.
    pub fn acquire(&mut self) -> Result<PortSlot, PortPoolError> {
        let index = self.free.pop_first().ok_or(PortPoolError::Exhausted)?;
        Ok(self.slot(index))
    }

    /// Take one specific index out of the pool, e.g. [`BASE_INDEX`].
    pub fn reserve(&mut self, index: u16) -> Result<PortSlot, PortPoolError> {
        if index > self.max_index {
            return Err(PortPoolError::OutOfRange(index));
        }
        if !self.free.remove(&index) {
            return Err(PortPoolError::Taken(index));
        }
        Ok(self.slot(index))
    }

    /// Return a slot's index to the pool.
    pub fn release(&mut self, index: u16) -> Result<(), PortPoolError> {
        if index > self.max_index {
            error!(index, "Released port index is outside the pool");
            return Err(PortPoolError::OutOfRange(index));
        }
        if !self.free.insert(index) {
            error!(index, "Invariant violation: port index released while already free");
            return Err(PortPoolError::DoubleRelease(index));
        }
        Ok(())
    }

    pub fn is_exhausted(&self) -> bool {
        self.free.is_empty()
    }

    pub fn available(&self) -> usize {
        self.free.len()
    }

    /// Total number of slots, base slot included
    pub fn capacity(&self) -> usize {
        usize::from(self.max_index) + 1
    }

    fn slot(&self, index: u16) -> PortSlot {
        PortSlot {
            index,
            app_port: self.app_base + index,
            ws_port: self.ws_base + index,
        }
    }
}
