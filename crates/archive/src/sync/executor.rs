//! Background execution of sync runs
//!
//! Each launched run gets its own named thread and cancel token. The
//! registry of executing runs is what keeps the scheduler from resuming a
//! run twice.

use std::collections::HashMap;
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use anyhow::{Context, Result, bail};

use super::cancel::CancelToken;
use super::engine::SyncEngine;
use super::scheduler::RunLauncher;
use crate::models::{SyncRun, SyncRunId};

#[derive(Default)]
struct Registry {
    active: Mutex<HashMap<SyncRunId, CancelToken>>,
    idle: Condvar,
}

impl Registry {
    fn lock(&self) -> MutexGuard<'_, HashMap<SyncRunId, CancelToken>> {
        self.active.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Register `id`, returning its token, or `None` if it is already executing
    fn claim(&self, id: SyncRunId) -> Option<CancelToken> {
        let mut active = self.lock();
        if active.contains_key(&id) {
            return None;
        }
        let token = CancelToken::new();
        active.insert(id, token.clone());
        Some(token)
    }

    fn release(&self, id: SyncRunId) {
        let mut active = self.lock();
        active.remove(&id);
        if active.is_empty() {
            self.idle.notify_all();
        }
    }
}

/// Releases a claimed run even if execution panics
struct Claim {
    registry: Arc<Registry>,
    id: SyncRunId,
}

impl Drop for Claim {
    fn drop(&mut self) {
        self.registry.release(self.id);
    }
}

#[derive(Clone)]
pub struct RunExecutor {
    engine: Arc<SyncEngine>,
    registry: Arc<Registry>,
}

impl RunExecutor {
    pub fn new(engine: Arc<SyncEngine>) -> Self {
        Self {
            engine,
            registry: Arc::new(Registry::default()),
        }
    }

    /// Start `id` on a background thread; `false` if it is already executing
    pub fn launch(&self, id: SyncRunId) -> Result<bool> {
        let Some(cancel) = self.registry.claim(id) else {
            log::debug!("[SYNC] Run {} is already executing", id);
            return Ok(false);
        };
        let claim = Claim {
            registry: self.registry.clone(),
            id,
        };

        let engine = self.engine.clone();
        std::thread::Builder::new()
            .name(format!("sync-run-{}", id))
            .spawn(move || {
                let _claim = claim;
                match engine.execute(id, &cancel) {
                    Ok(run) => log::info!("[SYNC] Run {} finished as {}", id, run.status),
                    Err(e) => log::error!("[SYNC] Run {} could not execute: {:#}", id, e),
                }
            })
            .with_context(|| format!("Failed to spawn thread for sync run {}", id))?;

        Ok(true)
    }

    /// Execute `id` on the calling thread
    pub fn run_blocking(&self, id: SyncRunId) -> Result<SyncRun> {
        let Some(cancel) = self.registry.claim(id) else {
            bail!("Sync run {} is already executing", id);
        };
        let _claim = Claim {
            registry: self.registry.clone(),
            id,
        };
        self.engine.execute(id, &cancel)
    }

    pub fn is_active(&self, id: SyncRunId) -> bool {
        self.registry.lock().contains_key(&id)
    }

    pub fn active_runs(&self) -> Vec<SyncRunId> {
        let mut ids: Vec<SyncRunId> = self.registry.lock().keys().copied().collect();
        ids.sort();
        ids
    }

    /// Ask an executing run to stop at its next checkpoint
    pub fn cancel(&self, id: SyncRunId) -> bool {
        match self.registry.lock().get(&id) {
            Some(token) => {
                token.cancel();
                true
            }
            None => false,
        }
    }

    pub fn cancel_all(&self) {
        for token in self.registry.lock().values() {
            token.cancel();
        }
    }

    /// Block until no run is executing; `false` if `timeout` elapsed first
    pub fn wait_for_idle(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut active = self.registry.lock();
        while !active.is_empty() {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return false;
            }
            active = match self.registry.idle.wait_timeout(active, remaining) {
                Ok((guard, _)) => guard,
                Err(poisoned) => poisoned.into_inner().0,
            };
        }
        true
    }
}

impl RunLauncher for RunExecutor {
    fn is_active(&self, id: SyncRunId) -> bool {
        RunExecutor::is_active(self, id)
    }

    fn launch(&self, id: SyncRunId) -> Result<bool> {
        RunExecutor::launch(self, id)
    }
}
