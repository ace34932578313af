//! Store-owned document state.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;

use crate::annotation::{annotation_iri, Annotation};

/// Identity of a peer in the discovery swarm.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PeerId(String);

impl PeerId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for PeerId {
    fn from(id: &str) -> Self {
        Self(id.to_owned())
    }
}

/// A document as the store sees it.
///
/// `annotations` stays `None` until something is created, which is how
/// freshly created documents look in the store.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Document {
    /// Discovery topic for peers interested in this document
    pub target: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub annotations: Option<Vec<Annotation>>,
    /// Any other fields the store keeps
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Document {
    pub fn new(target: impl Into<String>) -> Self {
        Self {
            target: target.into(),
            annotations: None,
            extra: Map::new(),
        }
    }

    /// Annotations in order, empty when none were ever created.
    pub fn annotations(&self) -> &[Annotation] {
        self.annotations.as_deref().unwrap_or(&[])
    }

    /// Mutable sequence, created on first access.
    pub fn annotations_mut(&mut self) -> &mut Vec<Annotation> {
        self.annotations.get_or_insert_with(Vec::new)
    }

    /// Position of the annotation with `annotation_id` in `doc_url`.
    pub fn position(&self, doc_url: &str, annotation_id: &str) -> Option<usize> {
        let iri = annotation_iri(doc_url, annotation_id);
        self.annotations().iter().position(|a| a.id == iri)
    }

    pub fn find(&self, doc_url: &str, annotation_id: &str) -> Option<&Annotation> {
        self.position(doc_url, annotation_id)
            .map(|index| &self.annotations()[index])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_missing_annotations_read_as_empty() {
        let doc = Document::new("topic");
        assert!(doc.annotations().is_empty());
        assert!(doc.annotations.is_none());
    }

    #[test]
    fn test_annotations_mut_initializes() {
        let mut doc = Document::new("topic");
        doc.annotations_mut()
            .push(Annotation::new("docA", "1", json!({})));
        assert_eq!(doc.annotations().len(), 1);
    }

    #[test]
    fn test_position_matches_full_iri() {
        let mut doc = Document::new("topic");
        doc.annotations_mut()
            .push(Annotation::new("docA", "1", json!({})));
        doc.annotations_mut()
            .push(Annotation::new("docA", "2", json!({})));

        assert_eq!(doc.position("docA", "2"), Some(1));
        assert_eq!(doc.position("docB", "2"), None);
        assert!(doc.find("docA", "3").is_none());
    }

    #[test]
    fn test_extra_fields_survive_serde() {
        let value = json!({ "target": "t", "title": "Paper", "annotations": [] });
        let doc: Document = serde_json::from_value(value.clone()).unwrap();
        assert_eq!(doc.extra.get("title"), Some(&json!("Paper")));
        assert_eq!(serde_json::to_value(&doc).unwrap(), value);
    }

    #[test]
    fn test_peer_id_serializes_as_string() {
        let peer = PeerId::from("abc");
        assert_eq!(serde_json::to_value(&peer).unwrap(), json!("abc"));
        assert_eq!(peer.to_string(), "abc");
    }
}
