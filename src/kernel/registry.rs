//! Kernel Registry - one live kernel per project
//!
//! The registry maps project ids to session slots. Each slot carries its own
//! async lock, so creation for one project never waits on another project's
//! launch. The outer map lock is only held to look up or insert a slot.
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │  KernelRegistry                                              │
//! │                                                              │
//! │   "proj-a" ──► Slot { Mutex<Option<Kernel>>, exec count }    │
//! │   "proj-b" ──► Slot { Mutex<Option<Kernel>>, exec count }    │
//! │                                                              │
//! │   get_or_create() ──► lock slot ──► reuse or launch          │
//! │   shutdown()      ──► retire slot ──► kill kernel            │
//! └──────────────────────────────────────────────────────────────┘
//! ```

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use futures_util::future::join_all;
use tokio::sync::Mutex;
use tracing::{info, warn};

use super::handle::KernelHandle;
use super::launcher::KernelLauncher;
use super::KernelError;
use crate::metrics::KERNELS_LIVE;

/// Statistics about the registry state
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegistryStats {
    /// Number of project sessions known to the registry
    pub sessions: usize,
    /// Number of sessions with a live kernel
    pub live_kernels: usize,
}

/// Per-project session state
#[derive(Default)]
struct SessionSlot {
    kernel: Mutex<Option<Arc<KernelHandle>>>,
    execution_count: AtomicU64,
    /// Set once the slot has been removed from the map by a shutdown
    retired: AtomicBool,
}

/// Owns every kernel handle, keyed by project id
pub struct KernelRegistry {
    launcher: Arc<dyn KernelLauncher>,
    slots: std::sync::Mutex<HashMap<String, Arc<SessionSlot>>>,
}

impl KernelRegistry {
    /// Create an empty registry launching kernels with `launcher`
    pub fn new(launcher: Arc<dyn KernelLauncher>) -> Self {
        Self {
            launcher,
            slots: std::sync::Mutex::new(HashMap::new()),
        }
    }

    fn slots(&self) -> std::sync::MutexGuard<'_, HashMap<String, Arc<SessionSlot>>> {
        // A poisoned map is still structurally valid
        self.slots.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn slot(&self, project_id: &str) -> Arc<SessionSlot> {
        Arc::clone(self.slots().entry(project_id.to_string()).or_default())
    }

    /// Drop a slot that never got a kernel; waiters on it re-resolve
    fn forget_empty(&self, project_id: &str, slot: &Arc<SessionSlot>) {
        let mut slots = self.slots();
        if slots.get(project_id).is_some_and(|current| Arc::ptr_eq(current, slot)) {
            slots.remove(project_id);
            slot.retired.store(true, Ordering::SeqCst);
        }
    }

    fn existing_slot(&self, project_id: &str) -> Option<Arc<SessionSlot>> {
        self.slots().get(project_id).cloned()
    }

    /// Return the project's kernel, launching one if none is live
    ///
    /// Concurrent calls for the same project serialize on the project's slot,
    /// so at most one kernel is launched. A failed launch leaves the project
    /// without a kernel and can be retried.
    pub async fn get_or_create(&self, project_id: &str) -> Result<Arc<KernelHandle>, KernelError> {
        loop {
            let slot = self.slot(project_id);
            let mut kernel = slot.kernel.lock().await;

            if slot.retired.load(Ordering::SeqCst) {
                // Lost a race with shutdown(); pick up the fresh slot
                continue;
            }

            if let Some(handle) = kernel.as_ref() {
                if handle.is_alive() {
                    return Ok(Arc::clone(handle));
                }
                warn!(project_id, kernel_id = %handle.kernel_id, "Kernel exited, replacing it");
                if let Some(dead) = kernel.take() {
                    dead.shutdown().await;
                    KERNELS_LIVE.dec();
                }
            }

            let handle = match self.launcher.launch(project_id).await {
                Ok(handle) => Arc::new(handle),
                Err(e) => {
                    if slot.execution_count.load(Ordering::SeqCst) == 0 {
                        self.forget_empty(project_id, &slot);
                    }
                    return Err(e);
                }
            };
            *kernel = Some(Arc::clone(&handle));
            KERNELS_LIVE.inc();
            info!(project_id, kernel_id = %handle.kernel_id, "Kernel registered");
            return Ok(handle);
        }
    }

    /// Whether the project currently has a registered kernel
    pub async fn contains(&self, project_id: &str) -> bool {
        match self.existing_slot(project_id) {
            Some(slot) => slot.kernel.lock().await.is_some(),
            None => false,
        }
    }

    /// Count one finished execution for the project
    pub fn record_execution(&self, project_id: &str) -> u64 {
        match self.existing_slot(project_id) {
            Some(slot) => slot.execution_count.fetch_add(1, Ordering::SeqCst) + 1,
            None => 0,
        }
    }

    /// Number of executions recorded for the project's session
    pub fn execution_count(&self, project_id: &str) -> u64 {
        self.existing_slot(project_id)
            .map(|slot| slot.execution_count.load(Ordering::SeqCst))
            .unwrap_or(0)
    }

    /// Project ids with a session in the registry
    pub fn project_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.slots().keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Terminate and forget the project's kernel and session; no-op if absent
    pub async fn shutdown(&self, project_id: &str) {
        let Some(slot) = self.slots().remove(project_id) else {
            return;
        };
        retire(project_id, &slot).await;
    }

    /// Shut down every registered kernel
    pub async fn shutdown_all(&self) {
        let slots: Vec<(String, Arc<SessionSlot>)> = self.slots().drain().collect();
        if slots.is_empty() {
            return;
        }
        info!(count = slots.len(), "Shutting down all kernels");
        join_all(slots.iter().map(|(id, slot)| retire(id, slot))).await;
        info!("All kernels shut down");
    }

    /// Get current registry statistics
    pub async fn stats(&self) -> RegistryStats {
        let slots: Vec<Arc<SessionSlot>> = self.slots().values().cloned().collect();
        let mut live_kernels = 0;
        for slot in &slots {
            if let Some(handle) = slot.kernel.lock().await.as_ref() {
                if handle.is_alive() {
                    live_kernels += 1;
                }
            }
        }
        RegistryStats {
            sessions: slots.len(),
            live_kernels,
        }
    }
}

async fn retire(project_id: &str, slot: &SessionSlot) {
    let mut kernel = slot.kernel.lock().await;
    slot.retired.store(true, Ordering::SeqCst);
    if let Some(handle) = kernel.take() {
        handle.shutdown().await;
        KERNELS_LIVE.dec();
        info!(project_id, kernel_id = %handle.kernel_id, "Kernel shut down");
    }
}
