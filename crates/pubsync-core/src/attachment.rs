//! File attachments carried inside canonical records.
//!
//! Mappings emit attachments as an `attachments` array of objects. Before an
//! object is stored that array is lifted out of the field set and turned into
//! [`AttachmentDraft`]s, which the identity index then finds-or-creates per
//! (object, external reference).

use serde_json::{Map, Value};
use tracing::warn;

/// Canonical field holding the attachment array.
pub const ATTACHMENTS_FIELD: &str = "attachments";

const PDF_MIME: &str = "application/pdf";

/// An attachment as described by the source, before it is bound to an object.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttachmentDraft {
    pub external_ref: String,
    pub name: Option<String>,
    pub url: Option<String>,
    pub mime_type: Option<String>,
    /// Checksum when provided, otherwise the URL, otherwise the reference.
    pub fingerprint: String,
}

impl AttachmentDraft {
    pub fn is_pdf(&self) -> bool {
        if self
            .mime_type
            .as_deref()
            .is_some_and(|m| m.eq_ignore_ascii_case(PDF_MIME))
        {
            return true;
        }
        [self.name.as_deref(), self.url.as_deref()]
            .into_iter()
            .flatten()
            .any(|s| s.to_ascii_lowercase().ends_with(".pdf"))
    }
}

/// Run-scoped attachment handling, derived from the feature flags.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AttachmentPolicy {
    /// Download URL template with an `{id}` placeholder.
    pub file_endpoint: Option<String>,
    /// Keep PDF attachments only (`allowPDFOnly`).
    pub pdf_only: bool,
    /// Flag stored attachments for text extraction (`extractTextFromDocuments`).
    pub extract_text: bool,
}

impl AttachmentPolicy {
    /// Removes the attachment array from `fields` and returns the drafts to store.
    ///
    /// Entries without a reference are dropped with a warning.
    ///
    /// # Examples
    ///
    /// ```
    /// use pubsync_core::attachment::AttachmentPolicy;
    /// use serde_json::{json, Map, Value};
    ///
    /// let policy = AttachmentPolicy {
    ///     file_endpoint: Some("https://files.example.org/{id}/download".into()),
    ///     ..Default::default()
    /// };
    /// let mut fields: Map<String, Value> = serde_json::from_value(json!({
    ///     "title": "Besluit",
    ///     "attachments": [{"ref": "doc-1", "name": "besluit.pdf"}]
    /// })).unwrap();
    ///
    /// let drafts = policy.extract(&mut fields);
    /// assert!(!fields.contains_key("attachments"));
    /// assert_eq!(drafts[0].url.as_deref(), Some("https://files.example.org/doc-1/download"));
    /// ```
    pub fn extract(&self, fields: &mut Map<String, Value>) -> Vec<AttachmentDraft> {
        let entries = match fields.remove(ATTACHMENTS_FIELD) {
            Some(Value::Array(entries)) => entries,
            Some(Value::Null) | None => return Vec::new(),
            Some(other) => vec![other],
        };

        entries
            .iter()
            .filter_map(|entry| self.draft(entry))
            .filter(|draft| !self.pdf_only || draft.is_pdf())
            .collect()
    }

    fn draft(&self, entry: &Value) -> Option<AttachmentDraft> {
        let Some(external_ref) = first_text(entry, &["ref", "id"]) else {
            warn!(entry = %entry, "Dropping attachment without a reference");
            return None;
        };

        let url = first_text(entry, &["url", "downloadUrl"]).or_else(|| {
            self.file_endpoint
                .as_ref()
                .map(|template| template.replace("{id}", &external_ref))
        });
        let checksum = first_text(entry, &["checksum", "hash"]);
        let fingerprint = checksum
            .or_else(|| url.clone())
            .unwrap_or_else(|| external_ref.clone());

        Some(AttachmentDraft {
            name: first_text(entry, &["name", "title"]),
            mime_type: first_text(entry, &["mimeType", "mime_type"]),
            url,
            fingerprint,
            external_ref,
        })
    }
}

fn first_text(entry: &Value, keys: &[&str]) -> Option<String> {
    keys.iter().find_map(|key| match entry.get(key)? {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn fields(value: Value) -> Map<String, Value> {
        serde_json::from_value(value).unwrap()
    }

    #[test]
    fn test_extract_reads_aliases_and_fingerprints() {
        let policy = AttachmentPolicy::default();
        let mut f = fields(json!({
            "attachments": [
                {"id": 7, "title": "Bijlage", "downloadUrl": "https://x/7", "mime_type": "text/plain"},
                {"ref": "b", "checksum": "sha-b"},
                {"ref": "c"}
            ]
        }));

        let drafts = policy.extract(&mut f);
        assert_eq!(drafts.len(), 3);
        assert_eq!(drafts[0].external_ref, "7");
        assert_eq!(drafts[0].name.as_deref(), Some("Bijlage"));
        assert_eq!(drafts[0].fingerprint, "https://x/7");
        assert_eq!(drafts[1].fingerprint, "sha-b");
        assert_eq!(drafts[2].fingerprint, "c");
        assert!(f.is_empty());
    }

    #[test]
    fn test_entries_without_reference_are_dropped() {
        let policy = AttachmentPolicy::default();
        let mut f = fields(json!({"attachments": [{"name": "orphan.pdf"}, {"ref": "ok"}]}));
        let drafts = policy.extract(&mut f);
        assert_eq!(drafts.len(), 1);
        assert_eq!(drafts[0].external_ref, "ok");
    }

    #[test]
    fn test_pdf_only_filter() {
        let policy = AttachmentPolicy {
            pdf_only: true,
            ..Default::default()
        };
        let mut f = fields(json!({"attachments": [
            {"ref": "a", "mimeType": "application/PDF"},
            {"ref": "b", "name": "scan.PDF"},
            {"ref": "c", "name": "sheet.xlsx"},
            {"ref": "d", "url": "https://x/d.pdf"}
        ]}));
        let refs: Vec<_> = policy
            .extract(&mut f)
            .into_iter()
            .map(|d| d.external_ref)
            .collect();
        assert_eq!(refs, vec!["a", "b", "d"]);
    }

    #[test]
    fn test_no_attachments() {
        let policy = AttachmentPolicy::default();
        let mut f = fields(json!({"title": "T", "attachments": null}));
        assert!(policy.extract(&mut f).is_empty());
        assert_eq!(f.len(), 1);
    }
}
