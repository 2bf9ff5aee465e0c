//! Document store sessions.
//!
//! A session is the unit-of-work handle through which typed documents are read and written.
//!
//! ## Architecture
//!
//! - **Type-state pattern** (Uninitialised/Initialised): document operations only exist on a
//!   session whose database has been confirmed to exist
//! - **Optimistic concurrency**: every write carries the revision it was based on; stale writes
//!   fail with `CoreError::Conflict` and are never silently overwritten
//! - Sessions are cheap and not shared between concurrent units of work; the store handle
//!   underneath is

use crate::constants::MAX_UPDATE_ATTEMPTS;
use crate::document::Document;
use crate::error::{CoreError, CoreResult};
use couch_store::{DocumentStore, RawDocument, ViewQuery, ViewRow};
use ngs_types::{DocId, Revision};
use serde_json::Value;
use std::marker::PhantomData;
use std::sync::Arc;
use tracing::{debug, warn};

// ============================================================================
// TYPE-STATE MARKERS
// ============================================================================

/// Marker type: the database has not been checked yet.
///
/// Only `connect()` and `initialise_database()` can be called in this state.
#[derive(Clone, Copy, Debug)]
pub struct Uninitialised;

/// Marker type: the database exists and documents can be read and written.
#[derive(Clone, Copy, Debug)]
pub struct Initialised;

// ============================================================================
// SESSION
// ============================================================================

/// Outcome of one document within [`Session::save_bulk`].
#[derive(Debug)]
pub struct SaveOutcome {
    pub id: DocId,
    pub result: CoreResult<Revision>,
}

/// Handle onto the document store for one unit of work.
///
/// Generic parameter `S` is either `Uninitialised` or `Initialised`.
#[derive(Clone)]
pub struct Session<S> {
    store: Arc<dyn DocumentStore>,
    state: PhantomData<S>,
}

impl Session<Uninitialised> {
    pub fn new(store: Arc<dyn DocumentStore>) -> Self {
        Self {
            store,
            state: PhantomData,
        }
    }

    /// Confirms the database exists.
    ///
    /// # Errors
    ///
    /// Returns `CoreError::NotInitialized` if the database has not been created. That error is
    /// fatal for the caller; run bootstrap instead of retrying.
    pub async fn connect(self) -> CoreResult<Session<Initialised>> {
        if !self.store.database_exists().await? {
            return Err(CoreError::NotInitialized(
                self.store.database_name().to_string(),
            ));
        }

        Ok(Session {
            store: self.store,
            state: PhantomData,
        })
    }

    /// Creates the database if it is missing, then connects.
    pub async fn initialise_database(self) -> CoreResult<Session<Initialised>> {
        if !self.store.database_exists().await? {
            debug!(database = self.store.database_name(), "creating database");
            self.store.create_database().await?;
        }

        Ok(Session {
            store: self.store,
            state: PhantomData,
        })
    }
}

impl<S> Session<S> {
    pub fn database_name(&self) -> &str {
        self.store.database_name()
    }
}

/// Document operations.
///
/// The database is still checked on every call: a store that loses its database mid-session
/// surfaces `CoreError::NotInitialized` from each operation.
impl Session<Initialised> {
    /// The underlying store handle.
    pub fn store(&self) -> &Arc<dyn DocumentStore> {
        &self.store
    }

    /// Fetches and validates a typed document.
    pub async fn get(&self, id: &DocId) -> CoreResult<Document> {
        let raw = self.store.get(id.as_str()).await?;
        Document::from_storage_form(raw)
    }

    /// Fetches a document without interpreting it.
    pub async fn get_raw(&self, id: &str) -> CoreResult<RawDocument> {
        Ok(self.store.get(id).await?)
    }

    /// Writes a typed document and returns it carrying its new revision.
    ///
    /// # Errors
    ///
    /// Returns `CoreError::Conflict` if the document's revision is not the stored one, and
    /// leaves the stored copy untouched.
    pub async fn save(&self, doc: &Document) -> CoreResult<Document> {
        let stored = self.store.save(doc.to_storage_form()?).await?;
        debug!(id = %doc.id(), document_type = %doc.document_type(), "saved document");
        Document::from_storage_form(stored)
    }

    /// Writes a document without interpreting it.
    pub async fn save_raw(&self, doc: RawDocument) -> CoreResult<RawDocument> {
        Ok(self.store.save(doc).await?)
    }

    /// Writes many documents; each one succeeds or fails on its own.
    ///
    /// Documents that cannot be serialised are reported as failed without reaching the store.
    pub async fn save_bulk(&self, docs: &[Document]) -> CoreResult<Vec<SaveOutcome>> {
        let mut outcomes: Vec<Option<SaveOutcome>> = Vec::with_capacity(docs.len());
        let mut pending = Vec::new();
        let mut pending_slots = Vec::new();

        for doc in docs {
            match doc.to_storage_form() {
                Ok(raw) => {
                    pending_slots.push(outcomes.len());
                    pending.push(raw);
                    outcomes.push(None);
                }
                Err(err) => outcomes.push(Some(SaveOutcome {
                    id: doc.id().clone(),
                    result: Err(err),
                })),
            }
        }

        if !pending.is_empty() {
            let results = self.store.save_bulk(pending).await?;
            for (slot, result) in pending_slots.into_iter().zip(results) {
                let id = docs[slot].id().clone();
                if let Err(err) = &result.outcome {
                    warn!(%id, error = %err, "bulk save rejected document");
                }
                outcomes[slot] = Some(SaveOutcome {
                    id,
                    result: result.outcome.map_err(CoreError::from),
                });
            }
        }

        Ok(outcomes
            .into_iter()
            .zip(docs)
            .map(|(outcome, doc)| {
                outcome.unwrap_or_else(|| SaveOutcome {
                    id: doc.id().clone(),
                    result: Err(CoreError::StoreUnavailable(
                        "bulk save returned fewer results than documents".into(),
                    )),
                })
            })
            .collect())
    }

    /// Hard-deletes a stored document at its current revision.
    ///
    /// # Errors
    ///
    /// Returns `CoreError::InvalidInput` for a document that was never read from the store and
    /// `CoreError::Conflict` if it changed since it was read.
    pub async fn delete(&self, doc: &Document) -> CoreResult<Revision> {
        let rev = doc.rev().ok_or_else(|| {
            CoreError::InvalidInput(format!("document {} has no revision to delete", doc.id()))
        })?;
        Ok(self.store.delete(doc.id().as_str(), rev).await?)
    }

    /// Marks a document deleted and saves it; it drops out of every view.
    pub async fn soft_delete(&self, doc: Document) -> CoreResult<Document> {
        self.save(&doc.mark_deleted()).await
    }

    /// Reads view rows.
    pub async fn query(
        &self,
        design: &str,
        view: &str,
        query: &ViewQuery,
    ) -> CoreResult<Vec<ViewRow>> {
        Ok(self.store.query(design, view, query).await?)
    }

    /// Reads only the values of view rows.
    pub async fn view_values(
        &self,
        design: &str,
        view: &str,
        query: &ViewQuery,
    ) -> CoreResult<Vec<Value>> {
        let rows = self.query(design, view, query).await?;
        Ok(rows.into_iter().map(|row| row.value).collect())
    }

    /// Reads a view whose values are whole documents and parses each one.
    pub async fn view_documents(
        &self,
        design: &str,
        view: &str,
        query: &ViewQuery,
    ) -> CoreResult<Vec<Document>> {
        self.view_values(design, view, query)
            .await?
            .into_iter()
            .map(|value| match value {
                Value::Object(raw) => Document::from_storage_form(raw),
                other => Err(CoreError::validation(
                    "",
                    format!("view {design}/{view} emitted a non-document value: {other}"),
                )),
            })
            .collect()
    }

    /// Read-modify-write of one document.
    ///
    /// Reads the current copy, applies `change` and saves. On `CoreError::Conflict` the
    /// document is re-read and `change` re-applied, up to a bounded number of attempts.
    pub async fn update<F>(&self, id: &DocId, mut change: F) -> CoreResult<Document>
    where
        F: FnMut(Document) -> CoreResult<Document>,
    {
        let mut last_conflict = None;

        for attempt in 1..=MAX_UPDATE_ATTEMPTS {
            let current = self.get(id).await?;
            let changed = change(current)?;
            if changed.id() != id {
                return Err(CoreError::InvalidInput(format!(
                    "update of {id} changed the document id to {}",
                    changed.id()
                )));
            }

            match self.save(&changed).await {
                Ok(saved) => return Ok(saved),
                Err(err @ CoreError::Conflict(_)) => {
                    debug!(%id, attempt, "conflict during update, retrying");
                    last_conflict = Some(err);
                }
                Err(err) => return Err(err),
            }
        }

        warn!(%id, "giving up update after repeated conflicts");
        Err(last_conflict.unwrap_or_else(|| CoreError::Conflict(id.to_string())))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::document::{DocumentBody, Patient, PipelineState};
    use couch_store::MemoryStore;
    use std::sync::atomic::{AtomicUsize, Ordering};

    async fn session() -> Session<Initialised> {
        let store: Arc<dyn DocumentStore> = Arc::new(MemoryStore::with_database("ngs_test"));
        Session::new(store).connect().await.expect("database exists")
    }

    fn state(progress: u8) -> DocumentBody {
        DocumentBody::PipelineState(PipelineState {
            progress,
            finish_time: None,
        })
    }

    #[tokio::test]
    async fn connect_requires_existing_database() {
        let store: Arc<dyn DocumentStore> = Arc::new(MemoryStore::new("ngs_test"));
        let err = Session::new(store.clone()).connect().await.err();
        assert!(matches!(err, Some(CoreError::NotInitialized(_))));

        let session = Session::new(store).initialise_database().await.expect("created");
        assert_eq!(session.database_name(), "ngs_test");
    }

    #[tokio::test]
    async fn save_then_get_returns_new_revision() {
        let session = session().await;
        let doc = Document::create(DocumentBody::Patient(Patient::default()));
        let saved = session.save(&doc).await.expect("saved");
        assert!(saved.rev().is_some());

        let read = session.get(doc.id()).await.expect("read");
        assert_eq!(read.rev(), saved.rev());
        assert_eq!(read.body(), doc.body());
    }

    #[tokio::test]
    async fn stale_revision_conflicts_and_keeps_stored_copy() {
        let session = session().await;
        let first = session
            .save(&Document::create(state(10)))
            .await
            .expect("saved");

        let winner = first.clone().with_body(state(50));
        session.save(&winner).await.expect("first writer wins");

        let loser = first.with_body(state(90));
        assert!(matches!(session.save(&loser).await, Err(CoreError::Conflict(_))));

        let stored = session.get(loser.id()).await.expect("read");
        assert_eq!(stored.as_pipeline_state().unwrap().progress, 50);
    }

    #[tokio::test]
    async fn update_retries_after_conflict() {
        let session = session().await;
        let saved = session
            .save(&Document::create(state(0)))
            .await
            .expect("saved");
        let id = saved.id().clone();
        let calls = AtomicUsize::new(0);
        let interferer = session.clone();

        let updated = session
            .update(&id, |doc| {
                if calls.fetch_add(1, Ordering::SeqCst) == 0 {
                    // A concurrent writer bumps the revision after our read.
                    let concurrent = doc.clone().with_body(state(5));
                    let store = interferer.store().clone();
                    let raw = concurrent.to_storage_form()?;
                    std::thread::spawn(move || {
                        tokio::runtime::Builder::new_current_thread()
                            .build()
                            .expect("runtime")
                            .block_on(store.save(raw))
                    })
                    .join()
                    .expect("thread")
                    .expect("concurrent save");
                }
                Ok(doc.with_body(state(100)))
            })
            .await
            .expect("update converges");

        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(updated.as_pipeline_state().unwrap().progress, 100);
    }

    #[tokio::test]
    async fn save_bulk_reports_each_document() {
        let session = session().await;
        let existing = session
            .save(&Document::create(state(1)))
            .await
            .expect("saved");
        // No revision: conflicts with the stored copy.
        let stale = Document::new(existing.id().clone(), state(2));
        let fresh = Document::create(state(3));

        let outcomes = session
            .save_bulk(&[fresh.clone(), stale])
            .await
            .expect("bulk save");
        assert_eq!(outcomes.len(), 2);
        assert_eq!(&outcomes[0].id, fresh.id());
        assert!(outcomes[0].result.is_ok());
        assert!(matches!(outcomes[1].result, Err(CoreError::Conflict(_))));
    }

    #[tokio::test]
    async fn delete_needs_a_revision() {
        let session = session().await;
        let doc = Document::create(state(0));
        assert!(matches!(
            session.delete(&doc).await,
            Err(CoreError::InvalidInput(_))
        ));

        let saved = session.save(&doc).await.expect("saved");
        session.delete(&saved).await.expect("deleted");
        assert!(session.get(doc.id()).await.unwrap_err().is_not_found());
    }
}
