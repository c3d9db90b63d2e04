//! Pubsync Core - synchronization engine, domain types, error handling and configuration.
//!
//! The engine pulls a complete listing from an external source, maps each
//! record onto a canonical schema, upserts it keyed by its external identifier
//! and finally deletes every previously synchronized object the source no
//! longer lists. I/O goes through the traits in [`contract`].

pub mod attachment;
pub mod config;
pub mod contract;
pub mod error;
pub mod identity;
pub mod lock;
pub mod mapping;
pub mod models;
pub mod orchestrator;
pub mod pager;
pub mod path;
pub mod reconcile;
pub mod schema;
pub mod store;
pub mod sync;

pub use attachment::{AttachmentDraft, AttachmentPolicy};
pub use config::{
    default_config_path, load_sources_config, parse_sources_config, DbConfig, HttpConfig,
    SourceConnection, SourceEntry, SourcesConfig, SyncConfig, SyncConfiguration,
};
pub use contract::{ObjectStore, PageFetcher, RecordTransformer, RecordValidator, RunLock};
pub use error::{ErrorClass, SyncError};
pub use identity::{IdentityIndex, ObjectDraft, UpsertResult};
pub use lock::MemoryRunLock;
pub use mapping::{FieldMapping, MappingCatalog};
pub use models::{
    Attachment, BindOutcome, CanonicalObject, Organization, Partition, SourceRecord, SyncKey,
    SynchronizationRecord,
};
pub use orchestrator::SyncRunOrchestrator;
pub use pager::{MoreSignal, PaginationDescriptor, PaginationStyle, SourcePager};
pub use reconcile::{ReconciliationSweeper, SweepReport};
pub use schema::{Operation, SchemaCatalog, SchemaDefinition, Violation};
pub use store::MemoryStore;
pub use sync::{
    detect_change, BatchSyncSummary, ChangeDecision, RunState, SyncOutcome, SyncRunReport,
    SyncRunResult, SyncStats,
};

#[cfg(any(test, feature = "test-export-mocks"))]
pub use contract::MockPageFetcher;
