//! Partition leases in PostgreSQL.

use async_trait::async_trait;
use pubsync_core::contract::RunLock;
use pubsync_core::error::SyncError;
use pubsync_core::models::Partition;
use sqlx::{PgPool, Pool, Postgres};
use std::time::Duration;
use tracing::debug;
use uuid::Uuid;

/// [`RunLock`] backed by the `sync_locks` table.
///
/// A lease is one row per partition key. It can be taken when no row exists
/// or when the existing lease has expired, so a crashed process blocks its
/// partitions for at most `ttl`. Every instance has its own holder id and only
/// renews or releases leases it holds. Once another holder has taken an
/// expired lease, renewal by the previous holder fails.
#[derive(Clone)]
pub struct PgRunLock {
    pool: Pool<Postgres>,
    holder: Uuid,
    ttl: Duration,
}

impl PgRunLock {
    pub fn new(pool: PgPool, ttl: Duration) -> Self {
        Self {
            pool,
            holder: Uuid::new_v4(),
            ttl,
        }
    }

    pub fn holder(&self) -> Uuid {
        self.holder
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }
}

#[async_trait]
impl RunLock for PgRunLock {
    async fn try_acquire(&self, partition: &Partition) -> Result<bool, SyncError> {
        let acquired: Option<(Uuid,)> = sqlx::query_as(
            r#"
            INSERT INTO sync_locks (partition_key, holder, acquired_at, expires_at)
            VALUES ($1, $2, NOW(), NOW() + make_interval(secs => $3))
            ON CONFLICT (partition_key)
            DO UPDATE SET
                holder = EXCLUDED.holder,
                acquired_at = EXCLUDED.acquired_at,
                expires_at = EXCLUDED.expires_at
            WHERE sync_locks.expires_at < NOW()
            RETURNING holder
            "#,
        )
        .bind(partition.key())
        .bind(self.holder)
        .bind(self.ttl.as_secs_f64())
        .fetch_optional(&self.pool)
        .await
        .map_err(SyncError::DatabaseError)?;

        debug!(partition = %partition, acquired = acquired.is_some(), "Lease attempt");
        Ok(acquired.is_some())
    }

    async fn renew(&self, partition: &Partition) -> Result<bool, SyncError> {
        let renewed: Option<(Uuid,)> = sqlx::query_as(
            r#"
            UPDATE sync_locks
            SET expires_at = NOW() + make_interval(secs => $3)
            WHERE partition_key = $1 AND holder = $2
            RETURNING holder
            "#,
        )
        .bind(partition.key())
        .bind(self.holder)
        .bind(self.ttl.as_secs_f64())
        .fetch_optional(&self.pool)
        .await
        .map_err(SyncError::DatabaseError)?;

        debug!(partition = %partition, renewed = renewed.is_some(), "Lease renewal");
        Ok(renewed.is_some())
    }

    async fn release(&self, partition: &Partition) -> Result<(), SyncError> {
        sqlx::query("DELETE FROM sync_locks WHERE partition_key = $1 AND holder = $2")
            .bind(partition.key())
            .bind(self.holder)
            .execute(&self.pool)
            .await
            .map_err(SyncError::DatabaseError)?;

        Ok(())
    }
}
