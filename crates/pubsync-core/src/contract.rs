//! Seams between the engine and its collaborators.
//!
//! The engine never talks to HTTP, a database or a mapping engine directly; it
//! goes through the traits below. Production implementations live in the
//! `pubsync-client` and `pubsync-db` crates and in [`crate::mapping`] /
//! [`crate::schema`]; tests use [`crate::store::MemoryStore`] and the
//! `mockall`-generated `MockPageFetcher`.
//!
//! All async traits are object safe (`async_trait`) so the orchestrator can hold
//! them as `Arc<dyn ...>`.

use async_trait::async_trait;
use serde_json::{Map, Value};
use uuid::Uuid;

#[cfg(any(test, feature = "test-export-mocks"))]
use mockall::automock;

use crate::config::SourceConnection;
use crate::error::SyncError;
use crate::models::{Attachment, BindOutcome, CanonicalObject, Partition, SyncKey, SynchronizationRecord};
use crate::schema::{Operation, Violation};

/// Fetches one page of an external listing.
#[cfg_attr(any(test, feature = "test-export-mocks"), automock)]
#[async_trait]
pub trait PageFetcher: Send + Sync {
    /// Issues one GET against `endpoint` on the given source and returns the
    /// decoded body. Non-2xx responses, timeouts and undecodable bodies are
    /// errors of the fetch class.
    async fn fetch_page(
        &self,
        source: &SourceConnection,
        endpoint: &str,
        query: &[(String, String)],
    ) -> Result<Value, SyncError>;
}

/// Declarative mapping from a raw record to canonical fields.
pub trait RecordTransformer: Send + Sync {
    /// Returns true if `mapping` names a known ruleset.
    fn has_mapping(&self, mapping: &str) -> bool;

    /// Pure transformation; equal inputs always give equal outputs.
    fn transform(&self, raw: &Value, mapping: &str) -> Result<Map<String, Value>, SyncError>;
}

/// Schema validation of canonical fields.
pub trait RecordValidator: Send + Sync {
    /// Returns true if `schema` names a known schema.
    fn has_schema(&self, schema: &str) -> bool;

    /// Returns the violations found; an empty list means the record is valid.
    fn validate(&self, fields: &Map<String, Value>, schema: &str, operation: Operation)
        -> Vec<Violation>;
}

/// Persistence of canonical objects, synchronization records and attachments.
///
/// Implementations must keep (source, schema, external id) unique and must make
/// [`ObjectStore::create_bound`] atomic.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    async fn find_sync_record(&self, key: &SyncKey)
        -> Result<Option<SynchronizationRecord>, SyncError>;

    /// Loads an object together with its attachments.
    async fn load_object(&self, id: Uuid) -> Result<Option<CanonicalObject>, SyncError>;

    /// Creates `object` and binds it to `key` in one step.
    ///
    /// When the key is already bound nothing is written and the existing
    /// record is returned as [`BindOutcome::AlreadyBound`].
    async fn create_bound(
        &self,
        object: &CanonicalObject,
        key: &SyncKey,
    ) -> Result<BindOutcome, SyncError>;

    /// Overwrites the mutable columns of an existing object. Attachments are untouched.
    async fn update_object(&self, object: &CanonicalObject) -> Result<(), SyncError>;

    /// Marks a synchronization record as seen by the current run.
    async fn touch_sync_record(&self, id: Uuid) -> Result<(), SyncError>;

    /// Lists synchronization records of a partition.
    ///
    /// When the partition has a category, only records whose object carries
    /// that category are returned.
    async fn list_partition(
        &self,
        partition: &Partition,
    ) -> Result<Vec<SynchronizationRecord>, SyncError>;

    /// Deletes an object, cascading to its synchronization records and
    /// attachments. Returns false when the object did not exist.
    async fn delete_object(&self, id: Uuid) -> Result<bool, SyncError>;

    async fn find_attachment(
        &self,
        object_id: Uuid,
        external_ref: &str,
    ) -> Result<Option<Attachment>, SyncError>;

    /// Inserts or replaces an attachment keyed by (object id, external ref).
    async fn save_attachment(&self, attachment: &Attachment) -> Result<(), SyncError>;

    /// Flushes buffered writes. Stores that write through may do nothing.
    async fn flush(&self) -> Result<(), SyncError>;
}

/// Mutual exclusion of runs per partition.
#[async_trait]
pub trait RunLock: Send + Sync {
    /// Tries to take the lock; returns false when another run holds it.
    async fn try_acquire(&self, partition: &Partition) -> Result<bool, SyncError>;

    /// Extends a lock this holder took; returns false when it no longer holds it.
    async fn renew(&self, partition: &Partition) -> Result<bool, SyncError>;

    async fn release(&self, partition: &Partition) -> Result<(), SyncError>;
}
