//! In-memory [`ObjectStore`].
//!
//! Keeps everything behind one mutex, which makes `create_bound` trivially
//! atomic. Used by the integration tests and for dry runs; it also counts
//! flushes and writes so tests can assert on side effects.

use async_trait::async_trait;
use chrono::Utc;
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};
use uuid::Uuid;

use crate::contract::ObjectStore;
use crate::error::SyncError;
use crate::models::{Attachment, BindOutcome, CanonicalObject, Partition, SyncKey, SynchronizationRecord};

#[derive(Default)]
struct State {
    objects: HashMap<Uuid, CanonicalObject>,
    records: HashMap<SyncKey, SynchronizationRecord>,
    flushes: usize,
    object_writes: usize,
    attachment_writes: usize,
    failing_deletes: Vec<Uuid>,
}

/// Counters exposed for assertions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct StoreCounters {
    pub objects: usize,
    pub records: usize,
    pub flushes: usize,
    pub object_writes: usize,
    pub attachment_writes: usize,
}

#[derive(Default)]
pub struct MemoryStore {
    state: Mutex<State>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<MutexGuard<'_, State>, SyncError> {
        self.state
            .lock()
            .map_err(|_| SyncError::Persistence("memory store mutex poisoned".to_string()))
    }

    pub fn counters(&self) -> StoreCounters {
        self.lock()
            .map(|s| StoreCounters {
                objects: s.objects.len(),
                records: s.records.len(),
                flushes: s.flushes,
                object_writes: s.object_writes,
                attachment_writes: s.attachment_writes,
            })
            .unwrap_or_default()
    }

    /// All objects, ordered by creation time.
    pub fn objects(&self) -> Vec<CanonicalObject> {
        let mut objects: Vec<_> = self
            .lock()
            .map(|s| s.objects.values().cloned().collect())
            .unwrap_or_default();
        objects.sort_by_key(|o| o.created_at);
        objects
    }

    /// All synchronization records.
    pub fn records(&self) -> Vec<SynchronizationRecord> {
        self.lock()
            .map(|s| s.records.values().cloned().collect())
            .unwrap_or_default()
    }

    /// Makes every future deletion of `id` fail with a persistence error.
    pub fn fail_deletes_of(&self, id: Uuid) {
        if let Ok(mut state) = self.lock() {
            state.failing_deletes.push(id);
        }
    }
}

#[async_trait]
impl ObjectStore for MemoryStore {
    async fn find_sync_record(
        &self,
        key: &SyncKey,
    ) -> Result<Option<SynchronizationRecord>, SyncError> {
        Ok(self.lock()?.records.get(key).cloned())
    }

    async fn load_object(&self, id: Uuid) -> Result<Option<CanonicalObject>, SyncError> {
        Ok(self.lock()?.objects.get(&id).cloned())
    }

    async fn create_bound(
        &self,
        object: &CanonicalObject,
        key: &SyncKey,
    ) -> Result<BindOutcome, SyncError> {
        let mut state = self.lock()?;
        if let Some(existing) = state.records.get(key) {
            return Ok(BindOutcome::AlreadyBound(existing.clone()));
        }
        let record = SynchronizationRecord::new(key, object.id, object.created_at);
        state.objects.insert(object.id, object.clone());
        state.records.insert(key.clone(), record.clone());
        state.object_writes += 1;
        Ok(BindOutcome::Bound(record))
    }

    async fn update_object(&self, object: &CanonicalObject) -> Result<(), SyncError> {
        let mut state = self.lock()?;
        let stored = state.objects.get_mut(&object.id).ok_or_else(|| {
            SyncError::Persistence(format!("object {} does not exist", object.id))
        })?;
        let attachments = std::mem::take(&mut stored.attachments);
        *stored = CanonicalObject {
            attachments,
            ..object.clone()
        };
        state.object_writes += 1;
        Ok(())
    }

    async fn touch_sync_record(&self, id: Uuid) -> Result<(), SyncError> {
        let mut state = self.lock()?;
        if let Some(record) = state.records.values_mut().find(|r| r.id == id) {
            record.last_synced_at = Utc::now();
        }
        Ok(())
    }

    async fn list_partition(
        &self,
        partition: &Partition,
    ) -> Result<Vec<SynchronizationRecord>, SyncError> {
        let state = self.lock()?;
        let mut records: Vec<_> = state
            .records
            .values()
            .filter(|r| r.source == partition.source && r.schema == partition.schema)
            .filter(|r| match &partition.category {
                Some(category) => state
                    .objects
                    .get(&r.object_id)
                    .is_some_and(|o| o.category.as_deref() == Some(category.as_str())),
                None => true,
            })
            .cloned()
            .collect();
        records.sort_by(|a, b| a.external_id.cmp(&b.external_id));
        Ok(records)
    }

    async fn delete_object(&self, id: Uuid) -> Result<bool, SyncError> {
        let mut state = self.lock()?;
        if state.failing_deletes.contains(&id) {
            return Err(SyncError::Persistence(format!("cannot delete object {}", id)));
        }
        let existed = state.objects.remove(&id).is_some();
        state.records.retain(|_, r| r.object_id != id);
        Ok(existed)
    }

    async fn find_attachment(
        &self,
        object_id: Uuid,
        external_ref: &str,
    ) -> Result<Option<Attachment>, SyncError> {
        Ok(self
            .lock()?
            .objects
            .get(&object_id)
            .and_then(|o| o.attachment(external_ref).cloned()))
    }

    async fn save_attachment(&self, attachment: &Attachment) -> Result<(), SyncError> {
        let mut state = self.lock()?;
        let object = state.objects.get_mut(&attachment.object_id).ok_or_else(|| {
            SyncError::Persistence(format!("object {} does not exist", attachment.object_id))
        })?;
        match object
            .attachments
            .iter_mut()
            .find(|a| a.external_ref == attachment.external_ref)
        {
            Some(existing) => *existing = attachment.clone(),
            None => object.attachments.push(attachment.clone()),
        }
        state.attachment_writes += 1;
        Ok(())
    }

    async fn flush(&self) -> Result<(), SyncError> {
        self.lock()?.flushes += 1;
        Ok(())
    }
}
