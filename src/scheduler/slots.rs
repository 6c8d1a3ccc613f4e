use std::collections::HashMap;

use crate::error::{Result, SlotdError};

/// Tracks which resource slots are free and which running process owns
/// which slots.
///
/// Slot ids are `0..total`. A slot is reserved iff it appears in exactly
/// one reservation (in-flight or registered to a pid), so at all times
/// `available() + Σ owned-set sizes + in-flight reservations == total`.
/// Slots are returned to the pool exactly once, when their owner's
/// termination is observed.
#[derive(Debug)]
pub struct SlotPool {
    /// `free[id]` is true when slot `id` is unreserved.
    free: Vec<bool>,
    available: usize,
    /// Slot sets granted to running processes, keyed by pid.
    owners: HashMap<u32, Vec<u32>>,
}

impl SlotPool {
    /// A pool of `total` slots, all free. A server cannot run with zero
    /// slots, so `total == 0` is an error.
    pub fn new(total: u32) -> Result<Self> {
        if total == 0 {
            return Err(SlotdError::ZeroSlots);
        }
        Ok(Self {
            free: vec![true; total as usize],
            available: total as usize,
            owners: HashMap::new(),
        })
    }

    pub fn total(&self) -> u32 {
        self.free.len() as u32
    }

    /// Count of currently free slots.
    pub fn available(&self) -> usize {
        self.available
    }

    /// Number of processes currently holding slots.
    pub fn running(&self) -> usize {
        self.owners.len()
    }

    /// Reserve `count` free slots, lowest ids first. Returns `None` without
    /// touching any state when not enough slots are free.
    pub fn reserve(&mut self, count: u32) -> Option<Vec<u32>> {
        let count = count as usize;
        if self.available < count {
            return None;
        }
        let mut set = Vec::with_capacity(count);
        for (id, free) in self.free.iter_mut().enumerate() {
            if set.len() == count {
                break;
            }
            if *free {
                *free = false;
                set.push(id as u32);
            }
        }
        self.available -= count;
        Some(set)
    }

    /// Return a reservation that was never registered to a process, e.g.
    /// after a failed spawn.
    pub fn unreserve(&mut self, set: &[u32]) {
        for &id in set {
            let slot = &mut self.free[id as usize];
            if !*slot {
                *slot = true;
                self.available += 1;
            }
        }
    }

    /// Record that process `pid` owns `set`. Called exactly once per
    /// successful spawn, after `reserve`.
    pub fn register(&mut self, pid: u32, set: Vec<u32>) {
        tracing::debug!(pid, slots = ?set, "slots registered");
        self.owners.insert(pid, set);
    }

    /// Free the slots owned by `pid` and forget the mapping. Returns the
    /// number of slots released, or `None` if the pid is unknown, so a
    /// second release for the same pid is harmless.
    pub fn release(&mut self, pid: u32) -> Option<usize> {
        let set = self.owners.remove(&pid)?;
        let released = set.len();
        self.unreserve(&set);
        tracing::debug!(pid, released, "slots released");
        Some(released)
    }
}
