//! Annotation records and their JSON-LD presentation.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

/// JSON-LD context attached to annotations served over one-shot reads.
pub const DEFAULT_JSONLD_CONTEXT: &str = "http://www.w3.org/ns/anno.jsonld";

/// Value of the `type` field attached alongside the context.
pub const ANNOTATION_TYPE: &str = "Annotation";

/// Keys owned by the record itself; never taken from a caller payload.
const RESERVED_KEYS: &[&str] = &["id", "annotation_id"];

/// Build the IRI of an annotation inside a document.
pub fn annotation_iri(doc_url: &str, annotation_id: &str) -> String {
    format!("{doc_url}/annotations/{annotation_id}.jsonld")
}

/// A single annotation stored in a document.
///
/// `id` is always derived from the owning document and `annotation_id`,
/// everything else is carried in `body` without interpretation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Annotation {
    pub id: String,
    pub annotation_id: String,
    #[serde(flatten)]
    pub body: Map<String, Value>,
}

impl Annotation {
    /// Create an annotation from a caller payload.
    ///
    /// Object payloads become the body (minus `id`/`annotation_id`);
    /// `null` gives an empty body; any other value is kept under `body`.
    pub fn new(doc_url: &str, annotation_id: impl Into<String>, payload: Value) -> Self {
        let annotation_id = annotation_id.into();
        Self {
            id: annotation_iri(doc_url, &annotation_id),
            annotation_id,
            body: body_from_payload(payload),
        }
    }

    /// Create an annotation with a fresh v4 identifier.
    pub fn generate(doc_url: &str, payload: Value) -> Self {
        Self::new(doc_url, Uuid::new_v4().to_string(), payload)
    }

    /// Same identity, new body.
    pub fn replaced_with(&self, payload: Value) -> Self {
        Self {
            id: self.id.clone(),
            annotation_id: self.annotation_id.clone(),
            body: body_from_payload(payload),
        }
    }

    /// Render with `@context` and `type` attached.
    pub fn to_jsonld(&self, context: &str) -> Value {
        let mut map = self.body.clone();
        map.insert("id".into(), Value::String(self.id.clone()));
        map.insert(
            "annotation_id".into(),
            Value::String(self.annotation_id.clone()),
        );
        map.insert("@context".into(), Value::String(context.to_owned()));
        map.insert("type".into(), Value::String(ANNOTATION_TYPE.to_owned()));
        Value::Object(map)
    }

    /// Plain JSON form, as stored.
    pub fn to_value(&self) -> Value {
        let mut map = self.body.clone();
        map.insert("id".into(), Value::String(self.id.clone()));
        map.insert(
            "annotation_id".into(),
            Value::String(self.annotation_id.clone()),
        );
        Value::Object(map)
    }
}

fn body_from_payload(payload: Value) -> Map<String, Value> {
    match payload {
        Value::Object(mut map) => {
            for key in RESERVED_KEYS {
                if map.remove(*key).is_some() {
                    log::debug!("Dropping caller-supplied `{key}` from annotation payload");
                }
            }
            map
        }
        Value::Null => Map::new(),
        other => {
            let mut map = Map::new();
            map.insert("body".into(), other);
            map
        }
    }
}
