//! Domain types shared by the engine and its adapters.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};
use std::fmt;
use uuid::Uuid;

/// A (source, schema, optional category) partition.
///
/// The partition is the unit that is swept and locked. Two runs with the same
/// partition must never execute concurrently.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Partition {
    pub source: String,
    pub schema: String,
    pub category: Option<String>,
}

impl Partition {
    pub fn new(source: impl Into<String>, schema: impl Into<String>) -> Self {
        Self {
            source: source.into(),
            schema: schema.into(),
            category: None,
        }
    }

    pub fn with_category(mut self, category: Option<String>) -> Self {
        self.category = category;
        self
    }

    /// Stable string key, used for lock rows and log fields.
    ///
    /// # Examples
    ///
    /// ```
    /// use pubsync_core::Partition;
    ///
    /// let p = Partition::new("openzaak", "publication");
    /// assert_eq!(p.key(), "openzaak/publication");
    ///
    /// let p = p.with_category(Some("Woo-verzoek".to_string()));
    /// assert_eq!(p.key(), "openzaak/publication/Woo-verzoek");
    /// ```
    pub fn key(&self) -> String {
        match &self.category {
            Some(category) => format!("{}/{}/{}", self.source, self.schema, category),
            None => format!("{}/{}", self.source, self.schema),
        }
    }

    /// Identity key for one external record within this partition.
    pub fn sync_key(&self, external_id: impl Into<String>) -> SyncKey {
        SyncKey {
            source: self.source.clone(),
            schema: self.schema.clone(),
            external_id: external_id.into(),
        }
    }
}

impl fmt::Display for Partition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.key())
    }
}

/// Unique key of a synchronization record: (source, schema, external id).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SyncKey {
    pub source: String,
    pub schema: String,
    pub external_id: String,
}

/// One raw record returned by an external source.
#[derive(Debug, Clone, PartialEq)]
pub struct SourceRecord {
    /// Identifier read at the source's `id_path`; `None` when the record lacks one.
    pub external_id: Option<String>,
    pub body: Value,
}

impl SourceRecord {
    /// Wraps a raw body, reading its identifier at the dotted `id_path`.
    ///
    /// String and number identifiers are accepted; numbers are rendered as strings.
    ///
    /// # Examples
    ///
    /// ```
    /// use pubsync_core::SourceRecord;
    /// use serde_json::json;
    ///
    /// let record = SourceRecord::from_body(json!({"uuid": "a-1"}), "uuid");
    /// assert_eq!(record.external_id.as_deref(), Some("a-1"));
    ///
    /// let record = SourceRecord::from_body(json!({"meta": {"id": 42}}), "meta.id");
    /// assert_eq!(record.external_id.as_deref(), Some("42"));
    /// ```
    pub fn from_body(body: Value, id_path: &str) -> Self {
        let external_id = crate::path::lookup(&body, id_path).and_then(|v| match v {
            Value::String(s) if !s.is_empty() => Some(s.clone()),
            Value::Number(n) => Some(n.to_string()),
            _ => None,
        });
        Self { external_id, body }
    }
}

/// The organization every canonical object belongs to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Organization {
    /// Organization identifier (OIN).
    pub id: String,
    pub name: Option<String>,
}

/// The host platform's persisted publication.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CanonicalObject {
    pub id: Uuid,
    pub schema: String,
    pub organization: Organization,
    pub category: Option<String>,
    pub fields: Map<String, Value>,
    pub content_hash: String,
    pub public_url: Option<String>,
    pub published_at: Option<DateTime<Utc>>,
    pub attachments: Vec<Attachment>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl CanonicalObject {
    /// Computes the SHA-256 hash of a canonical field set.
    ///
    /// `serde_json::Map` keeps keys sorted, so equal field sets always serialize
    /// to the same bytes.
    pub fn compute_content_hash(fields: &Map<String, Value>) -> String {
        let mut hasher = Sha256::new();
        hasher.update(Value::Object(fields.clone()).to_string().as_bytes());
        format!("{:x}", hasher.finalize())
    }

    /// Returns the attachment with the given external reference, if any.
    pub fn attachment(&self, external_ref: &str) -> Option<&Attachment> {
        self.attachments
            .iter()
            .find(|a| a.external_ref == external_ref)
    }
}

/// Durable link between an external identifier and a canonical object.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SynchronizationRecord {
    pub id: Uuid,
    pub source: String,
    pub schema: String,
    pub external_id: String,
    pub object_id: Uuid,
    pub created_at: DateTime<Utc>,
    pub last_synced_at: DateTime<Utc>,
}

impl SynchronizationRecord {
    pub fn new(key: &SyncKey, object_id: Uuid, now: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4(),
            source: key.source.clone(),
            schema: key.schema.clone(),
            external_id: key.external_id.clone(),
            object_id,
            created_at: now,
            last_synced_at: now,
        }
    }

    pub fn key(&self) -> SyncKey {
        SyncKey {
            source: self.source.clone(),
            schema: self.schema.clone(),
            external_id: self.external_id.clone(),
        }
    }
}

/// A file reference owned by one canonical object.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Attachment {
    pub id: Uuid,
    pub object_id: Uuid,
    /// The attachment's own identifier in the external source.
    pub external_ref: String,
    pub name: Option<String>,
    pub url: Option<String>,
    pub mime_type: Option<String>,
    /// Checksum when the source provides one, otherwise the download URL.
    pub fingerprint: String,
    pub extract_text: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Result of a store attempt to create and bind a new object atomically.
#[derive(Debug, Clone)]
pub enum BindOutcome {
    /// The object and its synchronization record were created.
    Bound(SynchronizationRecord),
    /// Another writer bound this key first; nothing was written.
    AlreadyBound(SynchronizationRecord),
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_content_hash_is_stable_across_key_order() {
        let a: Map<String, Value> =
            serde_json::from_value(json!({"title": "A", "summary": "B"})).unwrap();
        let b: Map<String, Value> =
            serde_json::from_value(json!({"summary": "B", "title": "A"})).unwrap();

        let hash = CanonicalObject::compute_content_hash(&a);
        assert_eq!(hash, CanonicalObject::compute_content_hash(&b));
        assert_eq!(hash.len(), 64);
    }

    #[test]
    fn test_content_hash_changes_with_content() {
        let a: Map<String, Value> = serde_json::from_value(json!({"title": "A"})).unwrap();
        let b: Map<String, Value> = serde_json::from_value(json!({"title": "B"})).unwrap();
        assert_ne!(
            CanonicalObject::compute_content_hash(&a),
            CanonicalObject::compute_content_hash(&b)
        );
    }

    #[test]
    fn test_source_record_without_id() {
        let record = SourceRecord::from_body(json!({"title": "x"}), "id");
        assert!(record.external_id.is_none());

        let record = SourceRecord::from_body(json!({"id": ""}), "id");
        assert!(record.external_id.is_none());
    }

    #[test]
    fn test_sync_record_preserves_key() {
        let partition = Partition::new("wordpress", "publication");
        let key = partition.sync_key("post-9");
        let record = SynchronizationRecord::new(&key, Uuid::new_v4(), Utc::now());
        assert_eq!(record.key(), key);
        assert_eq!(record.created_at, record.last_synced_at);
    }
}
