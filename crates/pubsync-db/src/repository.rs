//! Canonical object store for PostgreSQL.
//!
//! # Testing
//!
//! Only row conversions are unit tested here. The engine's behavior against a
//! store is covered by the `pubsync-core` suite using the in-memory store,
//! which implements the same contract.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use pubsync_core::contract::ObjectStore;
use pubsync_core::error::SyncError;
use pubsync_core::models::{
    Attachment, BindOutcome, CanonicalObject, Organization, Partition, SyncKey,
    SynchronizationRecord,
};
use serde::Serialize;
use serde_json::{Map, Value};
use sqlx::types::Json;
use sqlx::{PgPool, Pool, Postgres};
use tracing::debug;
use uuid::Uuid;

/// Column lists for SELECT queries. Must remain const literals to ensure SQL
/// safety since format!() bypasses sqlx compile-time validation.
const OBJECT_COLUMNS: &str = "id, schema_ref, organization_id, organization, category, fields, content_hash, public_url, published_at, created_at, updated_at";
const RECORD_COLUMNS: &str =
    "id, source_ref, schema_ref, external_id, object_id, created_at, last_synced_at";
const ATTACHMENT_COLUMNS: &str = "id, object_id, external_ref, name, url, mime_type, fingerprint, extract_text, created_at, updated_at";

/// Aggregated store statistics.
#[derive(Debug, Clone, Serialize)]
pub struct StoreStats {
    pub total_objects: i64,
    pub total_records: i64,
    pub total_attachments: i64,
    pub total_sources: i64,
    pub last_sync: Option<DateTime<Utc>>,
}

/// Number of synchronized objects per (source, schema).
#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct PartitionCount {
    pub source_ref: String,
    pub schema_ref: String,
    pub objects: i64,
    pub last_synced_at: Option<DateTime<Utc>>,
}

/// [`ObjectStore`] backed by PostgreSQL.
///
/// Writes go straight to the database, so [`ObjectStore::flush`] does nothing.
///
/// # Examples
///
/// ```no_run
/// use sqlx::postgres::PgPoolOptions;
/// use pubsync_db::PgObjectStore;
///
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let pool = PgPoolOptions::new()
///     .max_connections(5)
///     .connect("postgresql://localhost/pubsync")
///     .await?;
///
/// let store = PgObjectStore::new(pool);
/// store.migrate().await?;
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct PgObjectStore {
    pool: Pool<Postgres>,
}

impl PgObjectStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Applies the embedded migrations.
    pub async fn migrate(&self) -> Result<(), SyncError> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(|e| SyncError::Persistence(format!("migration failed: {}", e)))
    }

    /// Returns aggregated store statistics.
    pub async fn get_stats(&self) -> Result<StoreStats, SyncError> {
        let row: StatsRow = sqlx::query_as(
            r#"
            SELECT
                (SELECT COUNT(*) FROM canonical_objects) as objects,
                (SELECT COUNT(*) FROM synchronization_records) as records,
                (SELECT COUNT(*) FROM attachments) as attachments,
                (SELECT COUNT(DISTINCT source_ref) FROM synchronization_records) as sources,
                (SELECT MAX(last_synced_at) FROM synchronization_records) as last_sync
            "#,
        )
        .fetch_one(&self.pool)
        .await
        .map_err(SyncError::DatabaseError)?;

        Ok(StoreStats {
            total_objects: row.objects.unwrap_or(0),
            total_records: row.records.unwrap_or(0),
            total_attachments: row.attachments.unwrap_or(0),
            total_sources: row.sources.unwrap_or(0),
            last_sync: row.last_sync,
        })
    }

    /// Returns object counts per (source, schema), ordered by source.
    pub async fn partition_counts(&self) -> Result<Vec<PartitionCount>, SyncError> {
        sqlx::query_as::<_, PartitionCount>(
            r#"
            SELECT source_ref, schema_ref, COUNT(*) as objects, MAX(last_synced_at) as last_synced_at
            FROM synchronization_records
            GROUP BY source_ref, schema_ref
            ORDER BY source_ref, schema_ref
            "#,
        )
        .fetch_all(&self.pool)
        .await
        .map_err(SyncError::DatabaseError)
    }

    async fn load_attachments(&self, object_id: Uuid) -> Result<Vec<Attachment>, SyncError> {
        let query = format!(
            "SELECT {} FROM attachments WHERE object_id = $1 ORDER BY created_at, external_ref",
            ATTACHMENT_COLUMNS
        );
        let rows = sqlx::query_as::<_, AttachmentRow>(&query)
            .bind(object_id)
            .fetch_all(&self.pool)
            .await
            .map_err(SyncError::DatabaseError)?;

        Ok(rows.into_iter().map(Attachment::from).collect())
    }
}

#[async_trait]
impl ObjectStore for PgObjectStore {
    async fn find_sync_record(
        &self,
        key: &SyncKey,
    ) -> Result<Option<SynchronizationRecord>, SyncError> {
        let query = format!(
            "SELECT {} FROM synchronization_records WHERE source_ref = $1 AND schema_ref = $2 AND external_id = $3",
            RECORD_COLUMNS
        );
        let row = sqlx::query_as::<_, RecordRow>(&query)
            .bind(&key.source)
            .bind(&key.schema)
            .bind(&key.external_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(SyncError::DatabaseError)?;

        Ok(row.map(SynchronizationRecord::from))
    }

    async fn load_object(&self, id: Uuid) -> Result<Option<CanonicalObject>, SyncError> {
        let query = format!(
            "SELECT {} FROM canonical_objects WHERE id = $1",
            OBJECT_COLUMNS
        );
        let row = sqlx::query_as::<_, ObjectRow>(&query)
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(SyncError::DatabaseError)?;

        match row {
            Some(row) => {
                let attachments = self.load_attachments(id).await?;
                Ok(Some(row.into_object(attachments)))
            }
            None => Ok(None),
        }
    }

    async fn create_bound(
        &self,
        object: &CanonicalObject,
        key: &SyncKey,
    ) -> Result<BindOutcome, SyncError> {
        let mut tx = self.pool.begin().await.map_err(SyncError::DatabaseError)?;

        sqlx::query(
            r#"
            INSERT INTO canonical_objects (
                id,
                schema_ref,
                organization_id,
                organization,
                category,
                fields,
                content_hash,
                public_url,
                published_at,
                created_at,
                updated_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
            "#,
        )
        .bind(object.id)
        .bind(&object.schema)
        .bind(&object.organization.id)
        .bind(&object.organization.name)
        .bind(&object.category)
        .bind(Json(&object.fields))
        .bind(&object.content_hash)
        .bind(&object.public_url)
        .bind(object.published_at)
        .bind(object.created_at)
        .bind(object.updated_at)
        .execute(&mut *tx)
        .await
        .map_err(SyncError::DatabaseError)?;

        let record = SynchronizationRecord::new(key, object.id, object.created_at);
        let query = format!(
            r#"
            INSERT INTO synchronization_records (
                id, source_ref, schema_ref, external_id, object_id, created_at, last_synced_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            ON CONFLICT (source_ref, schema_ref, external_id) DO NOTHING
            RETURNING {}
            "#,
            RECORD_COLUMNS
        );
        let bound = sqlx::query_as::<_, RecordRow>(&query)
            .bind(record.id)
            .bind(&record.source)
            .bind(&record.schema)
            .bind(&record.external_id)
            .bind(record.object_id)
            .bind(record.created_at)
            .bind(record.last_synced_at)
            .fetch_optional(&mut *tx)
            .await
            .map_err(SyncError::DatabaseError)?;

        match bound {
            Some(row) => {
                tx.commit().await.map_err(SyncError::DatabaseError)?;
                Ok(BindOutcome::Bound(row.into()))
            }
            None => {
                tx.rollback().await.map_err(SyncError::DatabaseError)?;
                debug!(
                    source = %key.source,
                    schema = %key.schema,
                    external_id = %key.external_id,
                    "Key already bound, discarded new object"
                );
                let existing = self.find_sync_record(key).await?.ok_or_else(|| {
                    SyncError::Persistence(format!(
                        "binding conflict for {} but no record found",
                        key.external_id
                    ))
                })?;
                Ok(BindOutcome::AlreadyBound(existing))
            }
        }
    }

    async fn update_object(&self, object: &CanonicalObject) -> Result<(), SyncError> {
        let result = sqlx::query(
            r#"
            UPDATE canonical_objects
            SET organization_id = $2,
                organization = $3,
                category = $4,
                fields = $5,
                content_hash = $6,
                public_url = $7,
                published_at = $8,
                updated_at = $9
            WHERE id = $1
            "#,
        )
        .bind(object.id)
        .bind(&object.organization.id)
        .bind(&object.organization.name)
        .bind(&object.category)
        .bind(Json(&object.fields))
        .bind(&object.content_hash)
        .bind(&object.public_url)
        .bind(object.published_at)
        .bind(object.updated_at)
        .execute(&self.pool)
        .await
        .map_err(SyncError::DatabaseError)?;

        if result.rows_affected() == 0 {
            return Err(SyncError::Persistence(format!(
                "object {} does not exist",
                object.id
            )));
        }
        Ok(())
    }

    async fn touch_sync_record(&self, id: Uuid) -> Result<(), SyncError> {
        sqlx::query(
            r#"
            UPDATE synchronization_records
            SET last_synced_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(id)
        .execute(&self.pool)
        .await
        .map_err(SyncError::DatabaseError)?;

        Ok(())
    }

    async fn list_partition(
        &self,
        partition: &Partition,
    ) -> Result<Vec<SynchronizationRecord>, SyncError> {
        let rows = match &partition.category {
            Some(category) => {
                sqlx::query_as::<_, RecordRow>(
                    r#"
                    SELECT r.id, r.source_ref, r.schema_ref, r.external_id, r.object_id,
                           r.created_at, r.last_synced_at
                    FROM synchronization_records r
                    JOIN canonical_objects o ON o.id = r.object_id
                    WHERE r.source_ref = $1 AND r.schema_ref = $2 AND o.category = $3
                    ORDER BY r.external_id
                    "#,
                )
                .bind(&partition.source)
                .bind(&partition.schema)
                .bind(category)
                .fetch_all(&self.pool)
                .await
            }
            None => {
                let query = format!(
                    "SELECT {} FROM synchronization_records WHERE source_ref = $1 AND schema_ref = $2 ORDER BY external_id",
                    RECORD_COLUMNS
                );
                sqlx::query_as::<_, RecordRow>(&query)
                    .bind(&partition.source)
                    .bind(&partition.schema)
                    .fetch_all(&self.pool)
                    .await
            }
        }
        .map_err(SyncError::DatabaseError)?;

        Ok(rows.into_iter().map(SynchronizationRecord::from).collect())
    }

    async fn delete_object(&self, id: Uuid) -> Result<bool, SyncError> {
        let result = sqlx::query("DELETE FROM canonical_objects WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(SyncError::DatabaseError)?;

        Ok(result.rows_affected() > 0)
    }

    async fn find_attachment(
        &self,
        object_id: Uuid,
        external_ref: &str,
    ) -> Result<Option<Attachment>, SyncError> {
        let query = format!(
            "SELECT {} FROM attachments WHERE object_id = $1 AND external_ref = $2",
            ATTACHMENT_COLUMNS
        );
        let row = sqlx::query_as::<_, AttachmentRow>(&query)
            .bind(object_id)
            .bind(external_ref)
            .fetch_optional(&self.pool)
            .await
            .map_err(SyncError::DatabaseError)?;

        Ok(row.map(Attachment::from))
    }

    async fn save_attachment(&self, attachment: &Attachment) -> Result<(), SyncError> {
        sqlx::query(
            r#"
            INSERT INTO attachments (
                id, object_id, external_ref, name, url, mime_type,
                fingerprint, extract_text, created_at, updated_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
            ON CONFLICT (object_id, external_ref)
            DO UPDATE SET
                name = EXCLUDED.name,
                url = EXCLUDED.url,
                mime_type = EXCLUDED.mime_type,
                fingerprint = EXCLUDED.fingerprint,
                extract_text = EXCLUDED.extract_text,
                updated_at = EXCLUDED.updated_at
            "#,
        )
        .bind(attachment.id)
        .bind(attachment.object_id)
        .bind(&attachment.external_ref)
        .bind(&attachment.name)
        .bind(&attachment.url)
        .bind(&attachment.mime_type)
        .bind(&attachment.fingerprint)
        .bind(attachment.extract_text)
        .bind(attachment.created_at)
        .bind(attachment.updated_at)
        .execute(&self.pool)
        .await
        .map_err(SyncError::DatabaseError)?;

        Ok(())
    }

    async fn flush(&self) -> Result<(), SyncError> {
        Ok(())
    }
}

/// Helper struct for deserializing stats query results
#[derive(sqlx::FromRow)]
struct StatsRow {
    objects: Option<i64>,
    records: Option<i64>,
    attachments: Option<i64>,
    sources: Option<i64>,
    last_sync: Option<DateTime<Utc>>,
}

#[derive(sqlx::FromRow)]
struct ObjectRow {
    id: Uuid,
    schema_ref: String,
    organization_id: String,
    organization: Option<String>,
    category: Option<String>,
    fields: Json<Map<String, Value>>,
    content_hash: String,
    public_url: Option<String>,
    published_at: Option<DateTime<Utc>>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl ObjectRow {
    fn into_object(self, attachments: Vec<Attachment>) -> CanonicalObject {
        CanonicalObject {
            id: self.id,
            schema: self.schema_ref,
            organization: Organization {
                id: self.organization_id,
                name: self.organization,
            },
            category: self.category,
            fields: self.fields.0,
            content_hash: self.content_hash,
            public_url: self.public_url,
            published_at: self.published_at,
            attachments,
            created_at: self.created_at,
            updated_at: self.updated_at,
        }
    }
}

#[derive(sqlx::FromRow)]
struct RecordRow {
    id: Uuid,
    source_ref: String,
    schema_ref: String,
    external_id: String,
    object_id: Uuid,
    created_at: DateTime<Utc>,
    last_synced_at: DateTime<Utc>,
}

impl From<RecordRow> for SynchronizationRecord {
    fn from(row: RecordRow) -> Self {
        Self {
            id: row.id,
            source: row.source_ref,
            schema: row.schema_ref,
            external_id: row.external_id,
            object_id: row.object_id,
            created_at: row.created_at,
            last_synced_at: row.last_synced_at,
        }
    }
}

#[derive(sqlx::FromRow)]
struct AttachmentRow {
    id: Uuid,
    object_id: Uuid,
    external_ref: String,
    name: Option<String>,
    url: Option<String>,
    mime_type: Option<String>,
    fingerprint: String,
    extract_text: bool,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl From<AttachmentRow> for Attachment {
    fn from(row: AttachmentRow) -> Self {
        Self {
            id: row.id,
            object_id: row.object_id,
            external_ref: row.external_ref,
            name: row.name,
            url: row.url,
            mime_type: row.mime_type,
            fingerprint: row.fingerprint,
            extract_text: row.extract_text,
            created_at: row.created_at,
            updated_at: row.updated_at,
        }
    }
}
