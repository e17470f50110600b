//! Wire and persisted data models.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// The persisted credential bundle, exactly as written to `token.json`.
///
/// This struct is the exact-shape parsing layer; the envelope-tolerant
/// claims reader lives in [`crate::claims`].
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct TokenBundle {
    /// Long-lived credential bound to this installation.
    pub device_token: String,
    /// Short-lived credential used for document API calls. Absent until the
    /// first successful renewal after registration.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_token: Option<String>,
}

/// Whether a remote node is a leaf notebook or an interior collection.
#[derive(Copy, Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub enum DocType {
    #[serde(rename = "DocumentType")]
    Notebook,
    #[serde(rename = "CollectionType")]
    Collection,
}

/// One node of the remote document tree, as returned by the listing API.
#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Document {
    pub id: String,
    pub name: String,
    #[serde(rename = "type")]
    pub doc_type: DocType,
    pub version: u64,
    /// Empty or absent for nodes at the tree root.
    #[serde(default)]
    pub parent: Option<String>,
    pub modified_at: DateTime<Utc>,
    #[serde(default)]
    pub tags: Vec<String>,
    /// Direct download URL for the notebook archive. Only populated when the
    /// listing is queried for a single document with its blob.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub blob_url: Option<String>,
}

impl Document {
    pub fn is_notebook(&self) -> bool {
        self.doc_type == DocType::Notebook
    }

    /// `parent` normalized so that "" (how the cloud spells the root) reads
    /// as `None`.
    pub fn parent_id(&self) -> Option<&str> {
        self.parent.as_deref().filter(|p| !p.is_empty())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn document_wire_shape() {
        let json = r#"{
            "id": "a1b2",
            "name": "Meeting notes",
            "type": "DocumentType",
            "version": 7,
            "parent": "",
            "modifiedAt": "2024-05-01T12:30:00Z",
            "tags": ["work"]
        }"#;
        let doc: Document = serde_json::from_str(json).unwrap();
        assert!(doc.is_notebook());
        assert_eq!(doc.parent_id(), None);
        assert_eq!(doc.version, 7);
        assert_eq!(doc.tags, vec!["work".to_string()]);
        assert_eq!(doc.blob_url, None);
    }

    #[test]
    fn collection_wire_shape() {
        let json = r#"{
            "id": "c0ff",
            "name": "Projects",
            "type": "CollectionType",
            "version": 1,
            "parent": "root1",
            "modifiedAt": "2024-05-01T12:30:00Z"
        }"#;
        let doc: Document = serde_json::from_str(json).unwrap();
        assert!(!doc.is_notebook());
        assert_eq!(doc.parent_id(), Some("root1"));
        assert!(doc.tags.is_empty());
    }

    #[test]
    fn token_bundle_roundtrips_without_user_token() {
        let bundle = TokenBundle {
            device_token: "dev".into(),
            user_token: None,
        };
        let json = serde_json::to_string(&bundle).unwrap();
        // The optional field must be omitted entirely, not null.
        assert!(!json.contains("user_token"));
        let parsed: TokenBundle = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, bundle);
    }
}
