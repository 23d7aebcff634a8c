//! ---
//! kpg_section: "01-core-control-plane"
//! kpg_subsection: "module"
//! kpg_type: "source"
//! kpg_scope: "code"
//! kpg_description: "Deterministic host port allocation for new brokers."
//! kpg_version: "v0.1.0"
//! kpg_owner: "tbd"
//! ---
use std::collections::BTreeSet;

use crate::error::{ControlPlaneError, Result};

/// Hands out the lowest free host port at or above a base.
#[derive(Debug, Clone)]
pub struct PortAllocator {
    base: u16,
    limit: u16,
    reserved: BTreeSet<u16>,
}

impl PortAllocator {
    pub fn new(base: u16, limit: u16) -> Self {
        Self {
            base,
            limit,
            reserved: BTreeSet::new(),
        }
    }

    /// Ports that are never returned, whatever the caller passes in.
    pub fn with_reserved(mut self, ports: impl IntoIterator<Item = u16>) -> Self {
        self.reserved.extend(ports);
        self
    }

    /// First port in `[base, base + limit)` that is neither in `existing` nor reserved.
    pub fn next_port(&self, existing: &BTreeSet<u16>) -> Result<u16> {
        (0..self.limit)
            .map_while(|offset| self.base.checked_add(offset))
            .find(|candidate| !existing.contains(candidate) && !self.reserved.contains(candidate))
            .ok_or(ControlPlaneError::PortSpaceExhausted {
                base: self.base,
                limit: self.limit,
            })
    }
}
