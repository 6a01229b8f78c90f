use std::collections::BTreeSet;
use std::ops::RangeInclusive;
use crate::error::{DispatchError, Result};

/// Decoy port bookkeeping. Every live decoy holds exactly one port from the
/// range until it is released.
#[derive(Debug)]
pub struct PortAllocator {
    range: RangeInclusive<u16>,
    allocated: BTreeSet<u16>,
}

impl PortAllocator {
    pub fn new(range: RangeInclusive<u16>) -> Self {
        Self {
            range,
            allocated: BTreeSet::new(),
        }
    }

    /// Take the lowest free port
    pub fn allocate(&mut self) -> Result<u16> {
        let port = self
            .range
            .clone()
            .find(|port| !self.allocated.contains(port))
            .ok_or(DispatchError::PortExhausted {
                start: *self.range.start(),
                end: *self.range.end(),
            })?;
        self.allocated.insert(port);
        Ok(port)
    }

    /// Returns false if the port was not held
    pub fn release(&mut self, port: u16) -> bool {
        self.allocated.remove(&port)
    }

    pub fn in_use(&self) -> usize {
        self.allocated.len()
    }
}
