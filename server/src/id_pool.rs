//! Bounded allocator for the 8-bit ids that appear on the wire.

use std::collections::HashSet;
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum PoolError {
    #[error("id pool exhausted")]
    Exhausted,
    #[error("id {0} has been freed already")]
    DoubleFree(u8),
    #[error("id {0} does not belong to this pool")]
    OutOfRange(u8),
}

/// Free set over `[start, stop)`. Everything not in the free set is in use.
#[derive(Debug, Clone)]
pub struct IdPool {
    free: HashSet<u8>,
    start: u8,
    stop: u8,
}

impl IdPool {
    pub fn new(start: u8, stop: u8) -> Self {
        Self {
            free: (start..stop).collect(),
            start,
            stop,
        }
    }

    /// Takes an arbitrary free id. No ordering is guaranteed.
    pub fn pop(&mut self) -> Result<u8, PoolError> {
        let id = *self.free.iter().next().ok_or(PoolError::Exhausted)?;
        self.free.remove(&id);
        Ok(id)
    }

    /// Returns `id` to the free set.
    pub fn push(&mut self, id: u8) -> Result<(), PoolError> {
        if !(self.start..self.stop).contains(&id) {
            return Err(PoolError::OutOfRange(id));
        }
        if !self.free.insert(id) {
            return Err(PoolError::DoubleFree(id));
        }
        Ok(())
    }

    pub fn is_free(&self, id: u8) -> bool {
        self.free.contains(&id)
    }

    pub fn available(&self) -> usize {
        self.free.len()
    }

    pub fn capacity(&self) -> usize {
        (self.stop - self.start) as usize
    }
}
