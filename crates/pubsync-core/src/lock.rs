//! In-process partition locks.

use async_trait::async_trait;
use std::collections::HashSet;
use std::sync::Mutex;

use crate::contract::RunLock;
use crate::error::SyncError;
use crate::models::Partition;

/// A [`RunLock`] that only excludes runs within the current process.
///
/// Locks are keyed by [`Partition::key`], so a category-scoped run and an
/// unscoped run of the same source and schema do not exclude each other.
#[derive(Default)]
pub struct MemoryRunLock {
    held: Mutex<HashSet<String>>,
}

impl MemoryRunLock {
    pub fn new() -> Self {
        Self::default()
    }

    /// Drops the lock on `partition` as if its lease had run out.
    pub fn expire(&self, partition: &Partition) {
        if let Ok(mut held) = self.held.lock() {
            held.remove(&partition.key());
        }
    }

    pub fn is_held(&self, partition: &Partition) -> bool {
        self.held
            .lock()
            .map(|held| held.contains(&partition.key()))
            .unwrap_or(false)
    }
}

#[async_trait]
impl RunLock for MemoryRunLock {
    async fn try_acquire(&self, partition: &Partition) -> Result<bool, SyncError> {
        let mut held = self
            .held
            .lock()
            .map_err(|_| SyncError::Persistence("run lock mutex poisoned".to_string()))?;
        Ok(held.insert(partition.key()))
    }

    async fn renew(&self, partition: &Partition) -> Result<bool, SyncError> {
        let held = self
            .held
            .lock()
            .map_err(|_| SyncError::Persistence("run lock mutex poisoned".to_string()))?;
        Ok(held.contains(&partition.key()))
    }

    async fn release(&self, partition: &Partition) -> Result<(), SyncError> {
        let mut held = self
            .held
            .lock()
            .map_err(|_| SyncError::Persistence("run lock mutex poisoned".to_string()))?;
        held.remove(&partition.key());
        Ok(())
    }
}
