//! # me2u-core: Annotation data model
//!
//! Documents are owned by an external store and keyed by a URL-like
//! `doc_url`. Each document carries a discovery `target` and an ordered
//! list of W3C-style annotations.
//!
//! ```text
//! Document (doc_url)
//! ├── target        discovery topic shared by interested peers
//! ├── annotations   ordered, optional until the first create
//! │   └── Annotation
//! │       ├── id             <doc_url>/annotations/<annotation_id>.jsonld
//! │       ├── annotation_id  globally unique token
//! │       └── …body          caller supplied, opaque
//! └── …extra        other store-owned fields, preserved as-is
//! ```

pub mod annotation;
pub mod document;

pub use annotation::{annotation_iri, Annotation, ANNOTATION_TYPE, DEFAULT_JSONLD_CONTEXT};
pub use document::{Document, PeerId};
