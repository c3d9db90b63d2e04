//! Pubsync DB - PostgreSQL persistence for canonical objects.
//!
//! - [`repository`] - [`PgObjectStore`], the [`pubsync_core::ObjectStore`]
//!   backed by PostgreSQL, plus migrations and statistics
//! - [`lock`] - [`PgRunLock`], partition leases with a time-to-live

pub mod lock;
pub mod repository;

pub use lock::PgRunLock;
pub use repository::{PartitionCount, PgObjectStore, StoreStats};
