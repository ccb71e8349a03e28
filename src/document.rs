//! Documents, change events and batches.
//!
//! A [`Document`] is an opaque JSON object. The pipeline only looks at two
//! fields: `_id` (the identifier) and `_rev` (the optional revision marker).

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Identifier field.
pub const ID_FIELD: &str = "_id";

/// Revision marker field.
pub const REV_FIELD: &str = "_rev";

/// Prefix shared by all design document identifiers.
pub const DESIGN_DOC_PREFIX: &str = "_design";

/// An opaque JSON document.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Document(Map<String, Value>);

impl Document {
    /// Wrap a JSON object.
    pub fn new(fields: Map<String, Value>) -> Self {
        Self(fields)
    }

    /// Build a document from any JSON value. Returns `None` for non-objects.
    pub fn from_value(value: Value) -> Option<Self> {
        match value {
            Value::Object(map) => Some(Self(map)),
            _ => None,
        }
    }

    /// Document identifier, if present.
    pub fn id(&self) -> Option<&str> {
        self.0.get(ID_FIELD).and_then(Value::as_str)
    }

    /// Revision marker, if present.
    pub fn rev(&self) -> Option<&str> {
        self.0.get(REV_FIELD).and_then(Value::as_str)
    }

    /// Whether the document carries a revision marker.
    pub fn has_rev(&self) -> bool {
        self.0.contains_key(REV_FIELD)
    }

    /// Remove the revision marker so the target assigns a fresh one.
    pub fn strip_rev(&mut self) -> Option<Value> {
        self.0.remove(REV_FIELD)
    }

    /// Whether this is a design document.
    pub fn is_design_doc(&self) -> bool {
        self.id().is_some_and(|id| id.starts_with(DESIGN_DOC_PREFIX))
    }

    pub fn get(&self, field: &str) -> Option<&Value> {
        self.0.get(field)
    }

    pub fn insert(&mut self, field: impl Into<String>, value: Value) -> Option<Value> {
        self.0.insert(field.into(), value)
    }

    pub fn remove(&mut self, field: &str) -> Option<Value> {
        self.0.remove(field)
    }

    pub fn contains(&self, field: &str) -> bool {
        self.0.contains_key(field)
    }

    pub fn fields(&self) -> &Map<String, Value> {
        &self.0
    }

    pub fn into_value(self) -> Value {
        Value::Object(self.0)
    }
}

/// One create/update/delete notification from the source's change log.
#[derive(Debug, Clone, PartialEq)]
pub struct ChangeEvent {
    /// Identifier of the changed document.
    pub id: String,
    /// Document body (absent when the feed did not include docs).
    pub doc: Option<Document>,
    /// Whether this change is a deletion.
    pub deleted: bool,
    /// Opaque sequence token for resuming the feed.
    pub seq: String,
}

impl ChangeEvent {
    /// A create/update event carrying `doc`.
    pub fn update(seq: impl Into<String>, doc: Document) -> Self {
        Self {
            id: doc.id().unwrap_or_default().to_string(),
            doc: Some(doc),
            deleted: false,
            seq: seq.into(),
        }
    }

    /// A deletion event (tombstone body included, as CouchDB does).
    pub fn deletion(seq: impl Into<String>, id: impl Into<String>, rev: impl Into<String>) -> Self {
        let id = id.into();
        let mut doc = Map::new();
        doc.insert(ID_FIELD.to_string(), Value::String(id.clone()));
        doc.insert(REV_FIELD.to_string(), Value::String(rev.into()));
        doc.insert("_deleted".to_string(), Value::Bool(true));
        Self {
            id,
            doc: Some(Document(doc)),
            deleted: true,
            seq: seq.into(),
        }
    }
}

/// An ordered group of documents written to the target in one request.
#[derive(Debug, Clone, PartialEq)]
pub struct Batch {
    docs: Vec<Document>,
    has_revision_markers: bool,
}

impl Batch {
    /// Create a batch, recording whether any document carries `_rev`.
    pub fn new(docs: Vec<Document>) -> Self {
        let has_revision_markers = docs.iter().any(Document::has_rev);
        Self {
            docs,
            has_revision_markers,
        }
    }

    pub fn docs(&self) -> &[Document] {
        &self.docs
    }

    pub fn into_docs(self) -> Vec<Document> {
        self.docs
    }

    pub fn len(&self) -> usize {
        self.docs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.docs.is_empty()
    }

    /// True when the batch must be written in "preserve existing revisions" mode.
    pub fn has_revision_markers(&self) -> bool {
        self.has_revision_markers
    }
}
