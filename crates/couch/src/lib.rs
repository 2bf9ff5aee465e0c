//! # Couch Store
//!
//! Boundary crate for the multi-version document store the NGS application persists into.
//!
//! This crate provides:
//! - the store contract ([`DocumentStore`]): get/save/save-bulk/delete/query over raw JSON
//!   documents addressed by id and revision
//! - [`CouchDbStore`], an HTTP adapter for CouchDB
//! - [`MemoryStore`], an in-process implementation that executes compiled views natively
//! - the view compiler: declarative [`ViewSpec`]s compiled into guarded map functions and
//!   bundled into [`DesignDocument`]s
//!
//! **No domain concerns**: typed documents, the index catalog and bootstrap live in `ngs-core`.

pub mod collate;
pub mod design;
pub mod error;
pub mod http;
mod javascript;
pub mod memory;
pub mod store;
pub mod view;

pub use design::DesignDocument;
pub use error::{StoreError, StoreResult};
pub use http::{CouchConfig, CouchDbStore};
pub use memory::MemoryStore;
pub use store::{
    raw_id, raw_rev, BulkSaveResult, DocumentStore, RawDocument, ViewQuery, ViewRow, ID_KEY,
    REV_KEY,
};
pub use view::{CompiledView, Condition, DeletePolicy, Expr, MapBody, Reduce, ViewSpec};
