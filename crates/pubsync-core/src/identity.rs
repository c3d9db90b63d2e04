//! Identity-preserving upsert.
//!
//! The [`IdentityIndex`] is the only component that decides whether an external
//! record maps to an existing canonical object or needs a new one. It relies
//! on the store's unique (source, schema, external id) binding, so at most one
//! object ever exists per external identifier, even when two writers race.

use chrono::{DateTime, Utc};
use serde_json::{Map, Value};
use std::sync::Arc;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::attachment::AttachmentDraft;
use crate::contract::ObjectStore;
use crate::error::SyncError;
use crate::models::{Attachment, BindOutcome, CanonicalObject, Organization, SyncKey, SynchronizationRecord};
use crate::sync::{detect_change, SyncOutcome};

/// Everything needed to create or update one canonical object.
#[derive(Debug, Clone)]
pub struct ObjectDraft {
    pub schema: String,
    pub organization: Organization,
    pub category: Option<String>,
    pub fields: Map<String, Value>,
    pub attachments: Vec<AttachmentDraft>,
    /// Base of the public link; the object id is appended.
    pub portal_url: Option<String>,
    /// Set `published_at` when the object is created.
    pub auto_publish: bool,
    /// Flag newly stored attachments for text extraction.
    pub extract_text: bool,
}

/// Outcome of one upsert.
#[derive(Debug, Clone)]
pub struct UpsertResult {
    pub object: CanonicalObject,
    pub outcome: SyncOutcome,
    pub attachments_stored: usize,
    pub attachments_reused: usize,
    pub attachments_failed: usize,
}

/// Builds the public link of an object.
///
/// # Examples
///
/// ```
/// use pubsync_core::identity::public_url;
/// use uuid::Uuid;
///
/// let id = Uuid::nil();
/// assert_eq!(
///     public_url(Some("https://open.example.org/"), id).as_deref(),
///     Some("https://open.example.org/publications/00000000-0000-0000-0000-000000000000")
/// );
/// assert_eq!(public_url(None, id), None);
/// ```
pub fn public_url(portal_url: Option<&str>, id: Uuid) -> Option<String> {
    portal_url.map(|base| format!("{}/publications/{}", base.trim_end_matches('/'), id))
}

#[derive(Clone)]
pub struct IdentityIndex {
    store: Arc<dyn ObjectStore>,
}

impl IdentityIndex {
    pub fn new(store: Arc<dyn ObjectStore>) -> Self {
        Self { store }
    }

    /// Returns the synchronization record bound to `key`, if any.
    pub async fn lookup(&self, key: &SyncKey) -> Result<Option<SynchronizationRecord>, SyncError> {
        self.store.find_sync_record(key).await
    }

    /// Creates or updates the canonical object bound to `key`.
    ///
    /// Existing objects keep their id, creation time and attachments. When the
    /// content hash and object metadata are unchanged nothing is rewritten and
    /// only the synchronization record is touched.
    ///
    /// Attachment failures are logged and counted; they do not fail the upsert.
    pub async fn upsert(&self, key: &SyncKey, draft: ObjectDraft) -> Result<UpsertResult, SyncError> {
        let now = Utc::now();
        let content_hash = CanonicalObject::compute_content_hash(&draft.fields);

        let (mut object, outcome) = match self.lookup(key).await? {
            Some(record) => self.update_bound(&record, &draft, content_hash, now).await?,
            None => {
                let object = new_object(&draft, content_hash.clone(), now);
                match self.store.create_bound(&object, key).await? {
                    BindOutcome::Bound(record) => {
                        debug!(
                            external_id = %key.external_id,
                            object_id = %record.object_id,
                            "Created canonical object"
                        );
                        (object, SyncOutcome::Created)
                    }
                    BindOutcome::AlreadyBound(record) => {
                        debug!(
                            external_id = %key.external_id,
                            object_id = %record.object_id,
                            "Key bound concurrently, updating existing object"
                        );
                        self.update_bound(&record, &draft, content_hash, now).await?
                    }
                }
            }
        };

        let mut result = UpsertResult {
            object: object.clone(),
            outcome,
            attachments_stored: 0,
            attachments_reused: 0,
            attachments_failed: 0,
        };

        for attachment in &draft.attachments {
            match self
                .find_or_create_attachment(&object, attachment, draft.extract_text, now)
                .await
            {
                Ok(Some(stored)) => {
                    result.attachments_stored += 1;
                    replace_attachment(&mut object.attachments, stored);
                }
                Ok(None) => result.attachments_reused += 1,
                Err(e) => {
                    warn!(
                        external_id = %key.external_id,
                        attachment = %attachment.external_ref,
                        error = %e,
                        "Failed to store attachment"
                    );
                    result.attachments_failed += 1;
                }
            }
        }

        result.object = object;
        Ok(result)
    }

    async fn update_bound(
        &self,
        record: &SynchronizationRecord,
        draft: &ObjectDraft,
        content_hash: String,
        now: DateTime<Utc>,
    ) -> Result<(CanonicalObject, SyncOutcome), SyncError> {
        let current = self.store.load_object(record.object_id).await?.ok_or_else(|| {
            SyncError::Persistence(format!(
                "synchronization record {} points to missing object {}",
                record.id, record.object_id
            ))
        })?;

        let decision = detect_change(Some(&current.content_hash), &content_hash);
        let link = public_url(draft.portal_url.as_deref(), current.id);
        let metadata_changed = current.category != draft.category
            || current.organization != draft.organization
            || current.public_url != link;

        if !decision.needs_write && !metadata_changed {
            debug!(object_id = %current.id, reason = decision.reason, "Object unchanged");
            self.store.touch_sync_record(record.id).await?;
            return Ok((current, decision.outcome));
        }

        debug!(
            object_id = %current.id,
            reason = if decision.needs_write { decision.reason } else { "metadata changed" },
            "Rewriting object"
        );

        let updated = CanonicalObject {
            organization: draft.organization.clone(),
            category: draft.category.clone(),
            fields: draft.fields.clone(),
            content_hash,
            public_url: link,
            updated_at: now,
            ..current
        };
        self.store.update_object(&updated).await?;
        self.store.touch_sync_record(record.id).await?;

        Ok((updated, SyncOutcome::Updated))
    }

    /// Stores an attachment unless an identical one is already present.
    ///
    /// Returns the stored attachment, or `None` when the existing one was reused.
    async fn find_or_create_attachment(
        &self,
        object: &CanonicalObject,
        draft: &AttachmentDraft,
        extract_text: bool,
        now: DateTime<Utc>,
    ) -> Result<Option<Attachment>, SyncError> {
        let existing = self
            .store
            .find_attachment(object.id, &draft.external_ref)
            .await?;

        if let Some(existing) = &existing {
            if existing.fingerprint == draft.fingerprint
                && existing.name == draft.name
                && existing.mime_type == draft.mime_type
            {
                return Ok(None);
            }
        }

        let attachment = Attachment {
            id: existing.as_ref().map(|a| a.id).unwrap_or_else(Uuid::new_v4),
            object_id: object.id,
            external_ref: draft.external_ref.clone(),
            name: draft.name.clone(),
            url: draft.url.clone(),
            mime_type: draft.mime_type.clone(),
            fingerprint: draft.fingerprint.clone(),
            extract_text,
            created_at: existing.as_ref().map(|a| a.created_at).unwrap_or(now),
            updated_at: now,
        };
        self.store.save_attachment(&attachment).await?;
        Ok(Some(attachment))
    }
}

fn new_object(draft: &ObjectDraft, content_hash: String, now: DateTime<Utc>) -> CanonicalObject {
    let id = Uuid::new_v4();
    CanonicalObject {
        id,
        schema: draft.schema.clone(),
        organization: draft.organization.clone(),
        category: draft.category.clone(),
        fields: draft.fields.clone(),
        content_hash,
        public_url: public_url(draft.portal_url.as_deref(), id),
        published_at: draft.auto_publish.then_some(now),
        attachments: Vec::new(),
        created_at: now,
        updated_at: now,
    }
}

fn replace_attachment(attachments: &mut Vec<Attachment>, stored: Attachment) {
    match attachments
        .iter_mut()
        .find(|a| a.external_ref == stored.external_ref)
    {
        Some(existing) => *existing = stored,
        None => attachments.push(stored),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Partition;
    use crate::store::MemoryStore;
    use serde_json::json;

    fn draft(title: &str) -> ObjectDraft {
        ObjectDraft {
            schema: "publication".into(),
            organization: Organization {
                id: "0001".into(),
                name: Some("Gemeente".into()),
            },
            category: None,
            fields: serde_json::from_value(json!({"title": title})).unwrap(),
            attachments: Vec::new(),
            portal_url: Some("https://open.example.org".into()),
            auto_publish: false,
            extract_text: false,
        }
    }

    fn attachment(external_ref: &str, fingerprint: &str) -> AttachmentDraft {
        AttachmentDraft {
            external_ref: external_ref.into(),
            name: Some(format!("{}.pdf", external_ref)),
            url: None,
            mime_type: Some("application/pdf".into()),
            fingerprint: fingerprint.into(),
        }
    }

    fn setup() -> (Arc<MemoryStore>, IdentityIndex, SyncKey) {
        let store = Arc::new(MemoryStore::new());
        let index = IdentityIndex::new(store.clone());
        let key = Partition::new("openzaak", "publication").sync_key("zaak-1");
        (store, index, key)
    }

    #[tokio::test]
    async fn test_create_then_update_keeps_identity() {
        let (store, index, key) = setup();

        let created = index.upsert(&key, draft("First")).await.unwrap();
        assert_eq!(created.outcome, SyncOutcome::Created);
        assert_eq!(
            created.object.public_url,
            Some(format!("https://open.example.org/publications/{}", created.object.id))
        );

        let updated = index.upsert(&key, draft("Second")).await.unwrap();
        assert_eq!(updated.outcome, SyncOutcome::Updated);
        assert_eq!(updated.object.id, created.object.id);
        assert_eq!(updated.object.created_at, created.object.created_at);
        assert_eq!(updated.object.fields["title"], "Second");

        assert_eq!(store.counters().objects, 1);
        assert_eq!(store.counters().records, 1);
    }

    #[tokio::test]
    async fn test_unchanged_content_is_not_rewritten() {
        let (store, index, key) = setup();

        index.upsert(&key, draft("Same")).await.unwrap();
        let writes = store.counters().object_writes;

        let again = index.upsert(&key, draft("Same")).await.unwrap();
        assert_eq!(again.outcome, SyncOutcome::Unchanged);
        assert_eq!(store.counters().object_writes, writes);
    }

    #[tokio::test]
    async fn test_category_change_rewrites_metadata() {
        let (_store, index, key) = setup();
        index.upsert(&key, draft("Same")).await.unwrap();

        let mut recategorized = draft("Same");
        recategorized.category = Some("Convenant".into());
        let result = index.upsert(&key, recategorized).await.unwrap();
        assert_eq!(result.outcome, SyncOutcome::Updated);
        assert_eq!(result.object.category.as_deref(), Some("Convenant"));
    }

    #[tokio::test]
    async fn test_auto_publish_sets_published_at_on_create_only() {
        let (_store, index, key) = setup();
        let mut d = draft("T");
        d.auto_publish = true;
        let created = index.upsert(&key, d.clone()).await.unwrap();
        let published = created.object.published_at.unwrap();

        d.fields.insert("title".into(), json!("T2"));
        let updated = index.upsert(&key, d).await.unwrap();
        assert_eq!(updated.object.published_at, Some(published));
    }

    #[tokio::test]
    async fn test_attachments_found_or_created() {
        let (store, index, key) = setup();

        let mut d = draft("With files");
        d.extract_text = true;
        d.attachments = vec![attachment("a", "sha-a"), attachment("b", "sha-b")];
        let first = index.upsert(&key, d.clone()).await.unwrap();
        assert_eq!(first.attachments_stored, 2);
        assert_eq!(first.object.attachments.len(), 2);
        assert!(first.object.attachments.iter().all(|a| a.extract_text));

        d.attachments = vec![attachment("a", "sha-a"), attachment("b", "sha-b2")];
        let second = index.upsert(&key, d).await.unwrap();
        assert_eq!(second.attachments_reused, 1);
        assert_eq!(second.attachments_stored, 1);

        let stored = store.objects().pop().unwrap();
        assert_eq!(stored.attachments.len(), 2);
        let a = first.object.attachment("a").unwrap();
        assert_eq!(stored.attachment("a").unwrap().id, a.id);
        assert_eq!(stored.attachment("b").unwrap().fingerprint, "sha-b2");
        assert_eq!(store.counters().attachment_writes, 3);
    }

    #[tokio::test]
    async fn test_lost_bind_race_updates_existing_object() {
        let (store, index, key) = setup();
        let winner = index.upsert(&key, draft("Winner")).await.unwrap();

        // A second writer that missed the lookup still ends up on the bound object.
        let mut late = new_object(&draft("Late"), "h".into(), Utc::now());
        late.id = Uuid::new_v4();
        match store.create_bound(&late, &key).await.unwrap() {
            BindOutcome::AlreadyBound(record) => assert_eq!(record.object_id, winner.object.id),
            BindOutcome::Bound(_) => panic!("key was bound twice"),
        }
        assert_eq!(store.counters().objects, 1);
    }
}
