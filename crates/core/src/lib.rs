//! # NGS Core
//!
//! Core business logic for the NGS laboratory run tracker.
//!
//! This crate contains the typed document model and everything built on it:
//! - Typed documents (sequencer runs, pipeline runs, examinations, patients, samples,
//!   tracking forms, external records) and their store-native form
//! - Sessions with optimistic concurrency over a [`couch_store::DocumentStore`]
//! - The secondary index catalog and the idempotent bootstrap that installs it
//! - Sequencer output indexing, pipeline control and reference consistency checks
//!
//! **No API concerns**: HTTP servers and command-line parsing belong in `api-rest` and
//! `ngs-cli`.

pub mod catalog;
pub mod config;
pub mod consistency;
pub mod constants;
pub mod document;
pub mod error;
pub mod pipeline;
pub mod records;
pub mod sequencer;
pub mod session;
pub mod settings;
pub mod validation;

pub use config::{CoreConfig, StoreBackend};
pub use document::{Document, DocumentBody, DocumentMeta, DocumentType};
pub use error::{CoreError, CoreResult};
pub use pipeline::PipelineService;
pub use session::{Initialised, Session, Uninitialised};
