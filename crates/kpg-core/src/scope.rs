//! ---
//! kpg_section: "01-core-control-plane"
//! kpg_subsection: "module"
//! kpg_type: "source"
//! kpg_scope: "code"
//! kpg_description: "Serialised read-modify-write access to the orchestration description."
//! kpg_version: "v0.1.0"
//! kpg_owner: "tbd"
//! ---
use tokio::sync::{Mutex, MutexGuard};
use tracing::{error, info};

use crate::description::{DescriptionStore, OrchestrationDescription};
use crate::error::{ControlPlaneError, Result};

#[derive(Debug, Default)]
struct MutationState {
    halted: Option<String>,
}

/// Owner of the description file for mutating operations.
///
/// Every add, delete, cluster delete and reset holds a [`MutationScope`] for
/// its whole read-modify-write sequence.
#[derive(Debug)]
pub struct DescriptionLock {
    store: DescriptionStore,
    state: Mutex<MutationState>,
}

impl DescriptionLock {
    pub fn new(store: DescriptionStore) -> Self {
        Self {
            store,
            state: Mutex::new(MutationState::default()),
        }
    }

    pub fn store(&self) -> &DescriptionStore {
        &self.store
    }

    pub async fn acquire(&self) -> MutationScope<'_> {
        MutationScope {
            store: &self.store,
            guard: self.state.lock().await,
        }
    }

    /// Reason mutations are halted, if they are.
    pub async fn halted(&self) -> Option<String> {
        self.state.lock().await.halted.clone()
    }
}

/// Exclusive access to the description for the lifetime of the guard.
pub struct MutationScope<'a> {
    store: &'a DescriptionStore,
    guard: MutexGuard<'a, MutationState>,
}

impl MutationScope<'_> {
    /// Fail fast when an earlier operation found the description malformed.
    pub fn ensure_writable(&self) -> Result<()> {
        match &self.guard.halted {
            Some(reason) => Err(ControlPlaneError::MalformedDescription(format!(
                "mutations halted until reset: {reason}"
            ))),
            None => Ok(()),
        }
    }

    pub fn read(&mut self) -> Result<OrchestrationDescription> {
        self.ensure_writable()?;
        let result = self.store.read();
        self.track(result)
    }

    pub fn write(&mut self, description: &OrchestrationDescription) -> Result<()> {
        self.ensure_writable()?;
        let result = self.store.write(description);
        self.track(result)
    }

    /// Read without honouring the halt flag; `None` when the file is malformed.
    pub fn read_lenient(&mut self) -> Result<Option<OrchestrationDescription>> {
        match self.store.read() {
            Ok(description) => Ok(Some(description)),
            Err(ControlPlaneError::MalformedDescription(reason)) => {
                error!(%reason, "ignoring malformed description");
                Ok(None)
            }
            Err(other) => Err(other),
        }
    }

    /// Replace the description wholesale and lift any halt.
    pub fn restore(&mut self, description: &OrchestrationDescription) -> Result<()> {
        self.store.write(description)?;
        if let Some(reason) = self.guard.halted.take() {
            info!(%reason, "description restored; mutations resumed");
        }
        Ok(())
    }

    fn track<T>(&mut self, result: Result<T>) -> Result<T> {
        if let Err(ControlPlaneError::MalformedDescription(reason)) = &result {
            error!(%reason, "orchestration description malformed; halting mutations");
            self.guard.halted = Some(reason.clone());
        }
        result
    }
}
