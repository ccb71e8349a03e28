//! Per-event filtering and transformation.
//!
//! Every change event passes through a [`ChangeFilter`] before it reaches the
//! batch accumulator:
//!
//! ```text
//! ChangeEvent ──▶ deletions? ──▶ has body? ──▶ design doc? ──▶ strip _rev ──▶ Transform ──▶ Document
//!                    │              │              │                            │
//!                    ▼              ▼              ▼                            ▼
//!                 dropped        dropped        dropped                      dropped (None)
//! ```
//!
//! Only documents that come out the other end are counted as "seen".

use crate::document::{ChangeEvent, Document, ID_FIELD};
use crate::error::{FirehoseError, Result};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;
use tracing::{error, warn};

/// A caller-supplied document mapping.
///
/// Returning `None` drops the document.
pub trait Transform: Send + Sync + 'static {
    fn apply(&self, doc: Document) -> Option<Document>;
}

impl<F> Transform for F
where
    F: Fn(Document) -> Option<Document> + Send + Sync + 'static,
{
    fn apply(&self, doc: Document) -> Option<Document> {
        self(doc)
    }
}

/// Why an event was dropped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Rejection {
    Deletion,
    MissingBody,
    DesignDoc,
    Transform,
}

impl Rejection {
    pub fn as_str(&self) -> &'static str {
        match self {
            Rejection::Deletion => "deletion",
            Rejection::MissingBody => "missing_body",
            Rejection::DesignDoc => "design_doc",
            Rejection::Transform => "transform",
        }
    }
}

/// Filter settings applied to each event.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FilterOptions {
    pub filter_deletions: bool,
    pub filter_design_docs: bool,
    pub reset_rev: bool,
}

/// Applies the configured filters and optional transform to change events.
#[derive(Clone)]
pub struct ChangeFilter {
    options: FilterOptions,
    transform: Option<Arc<dyn Transform>>,
}

impl std::fmt::Debug for ChangeFilter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChangeFilter")
            .field("options", &self.options)
            .field("transform", &self.transform.is_some())
            .finish()
    }
}

impl ChangeFilter {
    pub fn new(options: FilterOptions) -> Self {
        Self {
            options,
            transform: None,
        }
    }

    /// Attach a transform applied after the built-in filters.
    pub fn with_transform(mut self, transform: Arc<dyn Transform>) -> Self {
        self.transform = Some(transform);
        self
    }

    pub fn options(&self) -> FilterOptions {
        self.options
    }

    /// Run one event through the filter chain.
    pub fn apply(&self, event: ChangeEvent) -> std::result::Result<Document, Rejection> {
        if self.options.filter_deletions && event.deleted {
            return Err(Rejection::Deletion);
        }

        let Some(mut doc) = event.doc else {
            warn!(id = %event.id, seq = %event.seq, "Change event has no document body, skipping");
            return Err(Rejection::MissingBody);
        };

        self.apply_doc(&mut doc)?;

        match &self.transform {
            Some(transform) => transform.apply(doc).ok_or(Rejection::Transform),
            None => Ok(doc),
        }
    }

    /// Built-in document filters (no transform).
    fn apply_doc(&self, doc: &mut Document) -> std::result::Result<(), Rejection> {
        if self.options.filter_design_docs && doc.is_design_doc() {
            return Err(Rejection::DesignDoc);
        }
        if self.options.reset_rev {
            doc.strip_rev();
        }
        Ok(())
    }
}

/// Declarative field-level transform loaded from a JSON file.
///
/// ```json
/// {
///   "drop_fields": ["internal_notes"],
///   "rename_fields": {"userName": "user_name"},
///   "set_fields": {"migrated": true},
///   "require_fields": ["type"]
/// }
/// ```
///
/// Documents missing any of `require_fields` are dropped. Steps run in the
/// order require, drop, rename, set.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FieldTransform {
    #[serde(default)]
    pub drop_fields: Vec<String>,
    #[serde(default)]
    pub rename_fields: BTreeMap<String, String>,
    #[serde(default)]
    pub set_fields: Map<String, Value>,
    #[serde(default)]
    pub require_fields: Vec<String>,
}

impl FieldTransform {
    /// Load and validate a transform file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).inspect_err(|e| {
            error!(path = %path.display(), error = %e, "Cannot read transform file");
        })?;
        let transform: FieldTransform = serde_json::from_str(&raw).inspect_err(|e| {
            error!(path = %path.display(), error = %e, "Invalid transform file");
        })?;
        transform.validate()?;
        Ok(transform)
    }

    /// `_id` must survive the transform.
    pub fn validate(&self) -> Result<()> {
        let touches_id = self.drop_fields.iter().any(|f| f == ID_FIELD)
            || self.rename_fields.keys().any(|f| f == ID_FIELD)
            || self.rename_fields.values().any(|f| f == ID_FIELD)
            || self.set_fields.contains_key(ID_FIELD);
        if touches_id {
            return Err(FirehoseError::Config(format!(
                "transform may not drop, rename or overwrite {ID_FIELD}"
            )));
        }
        Ok(())
    }
}

impl Transform for FieldTransform {
    fn apply(&self, mut doc: Document) -> Option<Document> {
        if self.require_fields.iter().any(|f| !doc.contains(f)) {
            return None;
        }
        for field in &self.drop_fields {
            doc.remove(field);
        }
        for (from, to) in &self.rename_fields {
            if let Some(value) = doc.remove(from) {
                doc.insert(to.clone(), value);
            }
        }
        for (field, value) in &self.set_fields {
            doc.insert(field.clone(), value.clone());
        }
        Some(doc)
    }
}
