//! The document store contract.
//!
//! The store is an external, multi-version, schemaless service. Documents are JSON objects
//! addressed by `_id`; each successful write assigns a new opaque `_rev`, and a write carrying
//! a stale `_rev` fails with [`StoreError::Conflict`] instead of overwriting. Derived orderings
//! and aggregates are read back through server-materialised views.

use crate::error::{StoreError, StoreResult};
use async_trait::async_trait;
use ngs_types::Revision;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Store-native representation of a document.
pub type RawDocument = Map<String, Value>;

/// Reserved identity key.
pub const ID_KEY: &str = "_id";
/// Reserved revision key.
pub const REV_KEY: &str = "_rev";

/// Returns the `_id` of a raw document, if present.
pub fn raw_id(doc: &RawDocument) -> Option<&str> {
    doc.get(ID_KEY).and_then(Value::as_str)
}

/// Returns the `_rev` of a raw document, if present.
pub fn raw_rev(doc: &RawDocument) -> Option<&str> {
    doc.get(REV_KEY).and_then(Value::as_str)
}

/// Parameters of a view query.
///
/// Mirrors the CouchDB view query parameters the application relies on. Keys are arbitrary
/// JSON values compared with view collation (see [`crate::collate`]).
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ViewQuery {
    /// Only rows with exactly this key.
    pub key: Option<Value>,
    /// Lower bound (upper bound when `descending`).
    pub start_key: Option<Value>,
    /// Upper bound (lower bound when `descending`).
    pub end_key: Option<Value>,
    pub inclusive_end: bool,
    pub descending: bool,
    pub limit: Option<usize>,
    pub skip: usize,
    /// `None` reduces whenever the view defines a reduce function.
    pub reduce: Option<bool>,
    pub group: bool,
    pub group_level: Option<usize>,
}

impl Default for ViewQuery {
    fn default() -> Self {
        Self {
            key: None,
            start_key: None,
            end_key: None,
            inclusive_end: true,
            descending: false,
            limit: None,
            skip: 0,
            reduce: None,
            group: false,
            group_level: None,
        }
    }
}

impl ViewQuery {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn key(mut self, key: impl Into<Value>) -> Self {
        self.key = Some(key.into());
        self
    }

    pub fn range(mut self, start: impl Into<Value>, end: impl Into<Value>) -> Self {
        self.start_key = Some(start.into());
        self.end_key = Some(end.into());
        self
    }

    pub fn descending(mut self, descending: bool) -> Self {
        self.descending = descending;
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn skip(mut self, skip: usize) -> Self {
        self.skip = skip;
        self
    }

    pub fn reduce(mut self, reduce: bool) -> Self {
        self.reduce = Some(reduce);
        self
    }

    pub fn group(mut self, group: bool) -> Self {
        self.group = group;
        self
    }

    pub fn group_level(mut self, level: usize) -> Self {
        self.group_level = Some(level);
        self
    }
}

/// One row of a view result.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ViewRow {
    /// Emitting document id; absent on reduced rows.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    pub key: Value,
    pub value: Value,
}

/// Outcome of one document within a bulk save.
#[derive(Clone, Debug, PartialEq)]
pub struct BulkSaveResult {
    pub id: String,
    pub outcome: Result<Revision, StoreError>,
}

/// Contract of the external document store.
///
/// Implementations must be safe to share between concurrent units of work; callers still hold
/// one session per unit of work on top of it.
#[async_trait]
pub trait DocumentStore: Send + Sync {
    /// Name of the database this handle addresses.
    fn database_name(&self) -> &str;

    async fn database_exists(&self) -> StoreResult<bool>;

    /// Creates the database. Succeeds if it already exists.
    async fn create_database(&self) -> StoreResult<()>;

    /// Fetches the current revision of a document.
    async fn get(&self, id: &str) -> StoreResult<RawDocument>;

    /// Writes a document and returns it as stored, carrying its new `_rev`.
    ///
    /// A document without `_id` gets a store-allocated id. A document whose `_rev` is not the
    /// current revision fails with [`StoreError::Conflict`] and leaves the stored copy untouched.
    async fn save(&self, doc: RawDocument) -> StoreResult<RawDocument>;

    /// Writes many documents; each one succeeds or fails independently.
    async fn save_bulk(&self, docs: Vec<RawDocument>) -> StoreResult<Vec<BulkSaveResult>>;

    /// Deletes a document at the given revision and returns the tombstone revision.
    async fn delete(&self, id: &str, rev: &Revision) -> StoreResult<Revision>;

    /// Reads a view of a design document, ordered by key.
    ///
    /// Fails with [`StoreError::NotFound`] if the design document or the view is missing.
    async fn query(&self, design: &str, view: &str, query: &ViewQuery)
        -> StoreResult<Vec<ViewRow>>;
}
