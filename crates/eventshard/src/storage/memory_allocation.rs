use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use parking_lot::Mutex;

use crate::allocation_store::{AllocationStore, CoordinatorState};
use crate::error::ClusterError;

/// In-memory allocation store for testing.
///
/// State is kept MessagePack-encoded so every load hands out an independent copy,
/// as a real store would.
pub struct MemoryAllocationStore {
    encoded: Mutex<Option<Vec<u8>>>,
    fail_loads: AtomicUsize,
}

impl MemoryAllocationStore {
    pub fn new() -> Self {
        Self {
            encoded: Mutex::new(None),
            fail_loads: AtomicUsize::new(0),
        }
    }

    /// Make the next `count` loads fail.
    pub fn fail_next_loads(&self, count: usize) {
        self.fail_loads.store(count, Ordering::SeqCst);
    }

    /// Replace the stored state directly, bypassing the coordinator.
    pub fn overwrite(&self, state: &CoordinatorState) -> Result<(), ClusterError> {
        *self.encoded.lock() = Some(encode(state)?);
        Ok(())
    }
}

impl Default for MemoryAllocationStore {
    fn default() -> Self {
        Self::new()
    }
}

fn encode(state: &CoordinatorState) -> Result<Vec<u8>, ClusterError> {
    rmp_serde::to_vec(state).map_err(|e| ClusterError::StorageError {
        reason: format!("failed to encode coordinator state: {e}"),
        source: Some(Box::new(e)),
    })
}

#[async_trait]
impl AllocationStore for MemoryAllocationStore {
    async fn load(&self) -> Result<Option<CoordinatorState>, ClusterError> {
        let injected = self
            .fail_loads
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if injected {
            return Err(ClusterError::StorageError {
                reason: "injected load failure".to_string(),
                source: None,
            });
        }
        let encoded = self.encoded.lock().clone();
        encoded
            .map(|bytes| {
                rmp_serde::from_slice(&bytes).map_err(|e| ClusterError::StorageError {
                    reason: format!("corrupt coordinator state: {e}"),
                    source: Some(Box::new(e)),
                })
            })
            .transpose()
    }

    async fn save(&self, state: &CoordinatorState) -> Result<(), ClusterError> {
        *self.encoded.lock() = Some(encode(state)?);
        Ok(())
    }
}
