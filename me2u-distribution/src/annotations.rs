//! CRUD over one document's annotation list.
//!
//! Every write goes through a single store transaction. Lookups that miss
//! return early from inside the transaction, before anything is touched,
//! so a missing id can never turn into a write at a bogus position.

use me2u_core::{Annotation, Document};
use serde::Serialize;
use serde_json::Value;
use std::sync::Arc;
use uuid::Uuid;

use crate::protocol::{Response, ResponseCode};
use crate::store::{DocumentStore, StoreError};

/// Retries before giving up on finding an unused annotation id.
const MAX_ID_ATTEMPTS: usize = 8;

/// Source of annotation identifiers.
pub trait IdGenerator: Send + Sync {
    fn next_id(&self) -> String;
}

/// Random v4 UUIDs.
#[derive(Debug, Default, Clone, Copy)]
pub struct UuidGenerator;

impl IdGenerator for UuidGenerator {
    fn next_id(&self) -> String {
        Uuid::new_v4().to_string()
    }
}

/// Annotation CRUD bound to one document.
pub struct AnnotationCrud {
    doc_url: String,
    store: Arc<dyn DocumentStore>,
    ids: Arc<dyn IdGenerator>,
    context: String,
}

impl AnnotationCrud {
    pub fn new(
        doc_url: impl Into<String>,
        store: Arc<dyn DocumentStore>,
        ids: Arc<dyn IdGenerator>,
        context: impl Into<String>,
    ) -> Self {
        Self {
            doc_url: doc_url.into(),
            store,
            ids,
            context: context.into(),
        }
    }

    pub fn doc_url(&self) -> &str {
        &self.doc_url
    }

    /// All annotations with JSON-LD context attached. A missing document
    /// lists as empty.
    pub async fn list(&self) -> Response {
        let annotations = match self.store.read(&self.doc_url).await {
            Ok(doc) => doc
                .annotations()
                .iter()
                .map(|a| a.to_jsonld(&self.context))
                .collect(),
            Err(StoreError::NotFound(_)) => Vec::new(),
            Err(e) => return self.store_failure("list", e),
        };
        Response::ok(Value::Array(annotations))
    }

    pub async fn get(&self, annotation_id: &str) -> Response {
        let doc = match self.store.read(&self.doc_url).await {
            Ok(doc) => doc,
            Err(e) => return self.store_failure("get", e),
        };
        match doc.find(&self.doc_url, annotation_id) {
            Some(annotation) => Response::ok(annotation.to_jsonld(&self.context)),
            None => Response::not_found(),
        }
    }

    /// Append a new annotation with a fresh id.
    pub async fn create(&self, payload: Option<Value>) -> Response {
        let payload = payload.unwrap_or(Value::Null);
        let created = self
            .store
            .mutate(&self.doc_url, |doc| {
                let annotation_id = self.unused_id(doc)?;
                let annotation = Annotation::new(&self.doc_url, annotation_id, payload);
                doc.annotations_mut().push(annotation.clone());
                Some(annotation)
            })
            .await;

        match created {
            Ok(Some(annotation)) => {
                log::debug!("Created {} on {}", annotation.annotation_id, self.doc_url);
                Response::with_data(ResponseCode::Created, annotation.to_value())
            }
            Ok(None) => {
                log::error!("No unused annotation id for {} after {MAX_ID_ATTEMPTS} attempts", self.doc_url);
                Response::error("could not allocate an annotation id")
            }
            Err(e) => self.store_failure("create", e),
        }
    }

    /// Replace an annotation's body in place. Responds with the whole
    /// document as committed.
    pub async fn update(&self, annotation_id: &str, payload: Option<Value>) -> Response {
        let payload = payload.unwrap_or(Value::Null);
        let updated = self
            .store
            .mutate(&self.doc_url, |doc| {
                let Some(index) = doc.position(&self.doc_url, annotation_id) else {
                    return None;
                };
                let annotations = doc.annotations_mut();
                annotations[index] = annotations[index].replaced_with(payload);
                Some(doc.clone())
            })
            .await;

        match updated {
            Ok(Some(doc)) => {
                log::debug!("Updated {annotation_id} on {}", self.doc_url);
                encode(&doc).map_or_else(
                    |e| e,
                    |data| Response::with_data(ResponseCode::Updated, data),
                )
            }
            Ok(None) => Response::not_found(),
            Err(e) => self.store_failure("update", e),
        }
    }

    pub async fn delete(&self, annotation_id: &str) -> Response {
        let removed = self
            .store
            .mutate(&self.doc_url, |doc| {
                let Some(index) = doc.position(&self.doc_url, annotation_id) else {
                    return None;
                };
                Some(doc.annotations_mut().remove(index))
            })
            .await;

        match removed {
            Ok(Some(_)) => {
                log::debug!("Deleted {annotation_id} from {}", self.doc_url);
                Response::new(ResponseCode::Deleted)
            }
            Ok(None) => Response::not_found(),
            Err(e) => self.store_failure("delete", e),
        }
    }

    fn unused_id(&self, doc: &Document) -> Option<String> {
        for _ in 0..MAX_ID_ATTEMPTS {
            let candidate = self.ids.next_id();
            if doc.position(&self.doc_url, &candidate).is_none() {
                return Some(candidate);
            }
            log::warn!("Annotation id {candidate} already used on {}", self.doc_url);
        }
        None
    }

    fn store_failure(&self, op: &str, error: StoreError) -> Response {
        match error {
            StoreError::NotFound(_) => {
                log::debug!("{op} on missing document {}", self.doc_url);
                Response::not_found()
            }
            other => {
                log::warn!("{op} on {} failed: {other}", self.doc_url);
                Response::error(other.to_string())
            }
        }
    }
}

fn encode<T: Serialize>(value: &T) -> Result<Value, Response> {
    serde_json::to_value(value).map_err(|e| {
        log::error!("Failed to encode response: {e}");
        Response::error(e.to_string())
    })
}
