//! In-process implementation of the document store contract.
//!
//! `MemoryStore` keeps documents in a sorted map and evaluates views with the native
//! evaluators of the [`DesignDocument`]s registered at construction. A view is only queryable
//! once its design document has also been *saved* into the store, matching a real server where
//! an uninstalled design document yields `NotFound`.
//!
//! Used by the test suites and by the demo mode of the binaries.

use crate::collate::{collate, group_key};
use crate::design::DesignDocument;
use crate::error::{StoreError, StoreResult};
use crate::store::{
    raw_id, raw_rev, BulkSaveResult, DocumentStore, RawDocument, ViewQuery, ViewRow, ID_KEY,
    REV_KEY,
};
use crate::view::Reduce;
use async_trait::async_trait;
use ngs_types::{DocId, Revision, DESIGN_PREFIX};
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::cmp::Ordering;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};
use tokio::sync::RwLock;
use tracing::debug;

/// Number of values handed to one reduce call before partial results are rereduced.
const REDUCE_BATCH: usize = 3;

#[derive(Default)]
struct MemoryState {
    created: bool,
    docs: BTreeMap<String, RawDocument>,
    /// Revision of the deletion tombstone of removed documents.
    tombstones: HashMap<String, Revision>,
}

/// In-memory document store.
pub struct MemoryStore {
    name: String,
    state: RwLock<MemoryState>,
    designs: HashMap<String, DesignDocument>,
    writes: AtomicU64,
}

impl MemoryStore {
    /// A store whose database has not been created yet.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            state: RwLock::new(MemoryState::default()),
            designs: HashMap::new(),
            writes: AtomicU64::new(0),
        }
    }

    /// A store whose database already exists.
    pub fn with_database(name: impl Into<String>) -> Self {
        Self {
            state: RwLock::new(MemoryState {
                created: true,
                ..MemoryState::default()
            }),
            ..Self::new(name)
        }
    }

    /// Registers the executable views of design documents.
    pub fn with_design_documents(mut self, designs: impl IntoIterator<Item = DesignDocument>) -> Self {
        for design in designs {
            self.designs.insert(design.name().to_string(), design);
        }
        self
    }

    /// Number of successful writes (saves, bulk saves and deletes) since construction.
    pub fn write_count(&self) -> u64 {
        self.writes.load(AtomicOrdering::SeqCst)
    }

    fn check_created(&self, state: &MemoryState) -> StoreResult<()> {
        if state.created {
            Ok(())
        } else {
            Err(StoreError::DatabaseMissing(self.name.clone()))
        }
    }

    fn next_revision(generation: u64, doc: &RawDocument) -> StoreResult<Revision> {
        let body = serde_json::to_vec(doc).map_err(|e| StoreError::Decode(e.to_string()))?;
        let digest = hex::encode(Sha256::digest(&body));
        Revision::parse(format!("{generation}-{}", &digest[..32]))
            .map_err(|e| StoreError::InvalidDocument(e.to_string()))
    }

    fn save_locked(&self, state: &mut MemoryState, mut doc: RawDocument) -> StoreResult<RawDocument> {
        let id = match raw_id(&doc) {
            Some(id) => id.to_string(),
            None => DocId::generate().into_string(),
        };
        if id.trim().is_empty() {
            return Err(StoreError::InvalidDocument("empty _id".into()));
        }
        if id.starts_with('_') && !id.starts_with(DESIGN_PREFIX) {
            return Err(StoreError::InvalidDocument(format!("reserved _id '{id}'")));
        }
        let supplied = raw_rev(&doc).map(str::to_string);

        let previous = match (state.docs.get(&id), state.tombstones.get(&id)) {
            (Some(current), _) => {
                let current_rev = raw_rev(current).map(str::to_string);
                if supplied.is_none() || supplied != current_rev {
                    return Err(StoreError::Conflict(id));
                }
                current_rev.and_then(|r| Revision::parse(r).ok())
            }
            (None, Some(tombstone)) => match &supplied {
                Some(rev) if rev != tombstone.as_str() => return Err(StoreError::Conflict(id)),
                _ => Some(tombstone.clone()),
            },
            (None, None) => {
                if supplied.is_some() {
                    return Err(StoreError::Conflict(id));
                }
                None
            }
        };

        let generation = previous.map(|r| r.generation()).unwrap_or(0) + 1;
        doc.remove(REV_KEY);
        doc.insert(ID_KEY.into(), Value::String(id.clone()));
        let rev = Self::next_revision(generation, &doc)?;
        doc.insert(REV_KEY.into(), Value::String(rev.to_string()));

        state.tombstones.remove(&id);
        state.docs.insert(id.clone(), doc.clone());
        self.writes.fetch_add(1, AtomicOrdering::SeqCst);
        debug!(id = %id, rev = %rev, "memory store saved document");
        Ok(doc)
    }

    fn reduce_rows(reducer: Reduce, rows: &[ViewRow], level: Grouping) -> Vec<ViewRow> {
        let mut groups: Vec<(Value, Vec<Value>)> = Vec::new();
        for row in rows {
            let key = match level {
                Grouping::None => Value::Null,
                Grouping::Exact => row.key.clone(),
                Grouping::Level(n) => group_key(&row.key, n),
            };
            match groups.last_mut() {
                Some((last, values)) if collate(last, &key) == Ordering::Equal => {
                    values.push(row.value.clone())
                }
                _ => groups.push((key, vec![row.value.clone()])),
            }
        }

        groups
            .into_iter()
            .map(|(key, values)| {
                let partials: Vec<Value> = values
                    .chunks(REDUCE_BATCH)
                    .map(|batch| reducer.reduce(batch))
                    .collect();
                let value = if partials.len() == 1 {
                    partials.into_iter().next().unwrap_or(Value::Null)
                } else {
                    reducer.rereduce(&partials)
                };
                ViewRow {
                    id: None,
                    key,
                    value,
                }
            })
            .collect()
    }
}

#[derive(Clone, Copy)]
enum Grouping {
    None,
    Exact,
    Level(usize),
}

fn in_range(key: &Value, query: &ViewQuery) -> bool {
    if let Some(exact) = &query.key {
        return collate(key, exact) == Ordering::Equal;
    }
    let (low, high) = if query.descending {
        (&query.end_key, &query.start_key)
    } else {
        (&query.start_key, &query.end_key)
    };
    // With `descending` the end key is the lower bound and is the one `inclusive_end` governs.
    let low_ok = match low {
        Some(low) => {
            let ord = collate(key, low);
            ord == Ordering::Greater
                || (ord == Ordering::Equal && (!query.descending || query.inclusive_end))
        }
        None => true,
    };
    let high_ok = match high {
        Some(high) => {
            let ord = collate(key, high);
            ord == Ordering::Less
                || (ord == Ordering::Equal && (query.descending || query.inclusive_end))
        }
        None => true,
    };
    low_ok && high_ok
}

#[async_trait]
impl DocumentStore for MemoryStore {
    fn database_name(&self) -> &str {
        &self.name
    }

    async fn database_exists(&self) -> StoreResult<bool> {
        Ok(self.state.read().await.created)
    }

    async fn create_database(&self) -> StoreResult<()> {
        self.state.write().await.created = true;
        Ok(())
    }

    async fn get(&self, id: &str) -> StoreResult<RawDocument> {
        let state = self.state.read().await;
        self.check_created(&state)?;
        state
            .docs
            .get(id)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(id.to_string()))
    }

    async fn save(&self, doc: RawDocument) -> StoreResult<RawDocument> {
        let mut state = self.state.write().await;
        self.check_created(&state)?;
        self.save_locked(&mut state, doc)
    }

    async fn save_bulk(&self, docs: Vec<RawDocument>) -> StoreResult<Vec<BulkSaveResult>> {
        let mut state = self.state.write().await;
        self.check_created(&state)?;

        let results = docs
            .into_iter()
            .map(|doc| {
                let id = raw_id(&doc).unwrap_or_default().to_string();
                match self.save_locked(&mut state, doc) {
                    Ok(saved) => {
                        let id = raw_id(&saved).unwrap_or_default().to_string();
                        let outcome = raw_rev(&saved)
                            .ok_or_else(|| StoreError::Decode("saved document has no _rev".into()))
                            .and_then(|rev| {
                                Revision::parse(rev)
                                    .map_err(|e| StoreError::Decode(e.to_string()))
                            });
                        BulkSaveResult { id, outcome }
                    }
                    Err(err) => BulkSaveResult {
                        id,
                        outcome: Err(err),
                    },
                }
            })
            .collect();
        Ok(results)
    }

    async fn delete(&self, id: &str, rev: &Revision) -> StoreResult<Revision> {
        let mut state = self.state.write().await;
        self.check_created(&state)?;

        let current = state
            .docs
            .get(id)
            .ok_or_else(|| StoreError::NotFound(id.to_string()))?;
        if raw_rev(current) != Some(rev.as_str()) {
            return Err(StoreError::Conflict(id.to_string()));
        }

        let mut tombstone = RawDocument::new();
        tombstone.insert(ID_KEY.into(), Value::String(id.to_string()));
        tombstone.insert("_deleted".into(), Value::Bool(true));
        let deleted_rev = Self::next_revision(rev.generation() + 1, &tombstone)?;

        state.docs.remove(id);
        state.tombstones.insert(id.to_string(), deleted_rev.clone());
        self.writes.fetch_add(1, AtomicOrdering::SeqCst);
        debug!(id = %id, rev = %deleted_rev, "memory store deleted document");
        Ok(deleted_rev)
    }

    async fn query(
        &self,
        design: &str,
        view: &str,
        query: &ViewQuery,
    ) -> StoreResult<Vec<ViewRow>> {
        let state = self.state.read().await;
        self.check_created(&state)?;

        let design_id = format!("{DESIGN_PREFIX}{design}");
        let stored = state
            .docs
            .get(&design_id)
            .ok_or_else(|| StoreError::NotFound(design_id.clone()))?;
        let installed = stored
            .get("views")
            .and_then(Value::as_object)
            .is_some_and(|views| views.contains_key(view));
        if !installed {
            return Err(StoreError::NotFound(format!("{design_id}/_view/{view}")));
        }
        let compiled = self
            .designs
            .get(design)
            .and_then(|d| d.view(view))
            .ok_or_else(|| StoreError::Http {
                status: 500,
                reason: format!("view {design}/{view} has no native evaluator"),
            })?;

        let mut rows: Vec<ViewRow> = state
            .docs
            .iter()
            .filter(|(id, _)| !id.starts_with(DESIGN_PREFIX))
            .flat_map(|(id, doc)| {
                compiled.map(doc).into_iter().map(move |(key, value)| ViewRow {
                    id: Some(id.clone()),
                    key,
                    value,
                })
            })
            .collect();

        rows.sort_by(|a, b| collate(&a.key, &b.key).then_with(|| a.id.cmp(&b.id)));
        if query.descending {
            rows.reverse();
        }
        rows.retain(|row| in_range(&row.key, query));

        let reduce = query.reduce.unwrap_or(compiled.reducer().is_some());
        let rows = if reduce {
            let reducer = compiled.reducer().ok_or_else(|| StoreError::Http {
                status: 400,
                reason: format!("view {design}/{view} has no reduce function"),
            })?;
            let grouping = match (query.group, query.group_level) {
                (_, Some(level)) => Grouping::Level(level),
                (true, None) => Grouping::Exact,
                (false, None) => Grouping::None,
            };
            if rows.is_empty() {
                rows
            } else {
                Self::reduce_rows(reducer, &rows, grouping)
            }
        } else {
            rows
        };

        Ok(rows
            .into_iter()
            .skip(query.skip)
            .take(query.limit.unwrap_or(usize::MAX))
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::view::{Expr, MapBody, ViewSpec};
    use serde_json::json;

    fn raw(value: Value) -> RawDocument {
        match value {
            Value::Object(map) => map,
            _ => panic!("test document must be an object"),
        }
    }

    fn runs_design() -> DesignDocument {
        DesignDocument::new("runs")
            .with_view(
                ViewSpec::new("by_date", MapBody::emit(Expr::field("date"), Expr::Id))
                    .for_types(["run"]),
            )
            .with_view(
                ViewSpec::new("count", MapBody::emit(Expr::field("date"), Expr::literal(1)))
                    .for_types(["run"])
                    .reduce(Reduce::Count),
            )
    }

    async fn seeded() -> MemoryStore {
        let design = runs_design();
        let store = MemoryStore::with_database("test").with_design_documents([design.clone()]);
        store.save(design.to_serializable_form()).await.unwrap();
        for (id, date) in [("a", "220103"), ("b", "220101"), ("c", "220102"), ("d", "220101")] {
            store
                .save(raw(json!({"_id": id, "document_type": "run", "date": date})))
                .await
                .unwrap();
        }
        store
    }

    #[tokio::test]
    async fn operations_fail_before_database_exists() {
        let store = MemoryStore::new("missing");
        let err = store.get("x").await.unwrap_err();
        assert_eq!(err, StoreError::DatabaseMissing("missing".into()));
        store.create_database().await.unwrap();
        assert_eq!(
            store.get("x").await.unwrap_err(),
            StoreError::NotFound("x".into())
        );
    }

    #[tokio::test]
    async fn save_assigns_increasing_revisions() {
        let store = MemoryStore::with_database("test");
        let first = store.save(raw(json!({"_id": "doc", "n": 1}))).await.unwrap();
        let rev1 = Revision::parse(raw_rev(&first).unwrap()).unwrap();
        assert_eq!(rev1.generation(), 1);

        let mut next = first.clone();
        next.insert("n".into(), json!(2));
        let second = store.save(next).await.unwrap();
        let rev2 = Revision::parse(raw_rev(&second).unwrap()).unwrap();
        assert_eq!(rev2.generation(), 2);
    }

    #[tokio::test]
    async fn stale_revision_conflicts_without_mutation() {
        let store = MemoryStore::with_database("test");
        let first = store.save(raw(json!({"_id": "doc", "n": 1}))).await.unwrap();
        let mut second = first.clone();
        second.insert("n".into(), json!(2));
        store.save(second).await.unwrap();

        let mut stale = first.clone();
        stale.insert("n".into(), json!(3));
        let err = store.save(stale).await.unwrap_err();
        assert_eq!(err, StoreError::Conflict("doc".into()));
        assert_eq!(store.get("doc").await.unwrap()["n"], json!(2));
        assert_eq!(store.write_count(), 2);
    }

    #[tokio::test]
    async fn creating_an_existing_id_without_revision_conflicts() {
        let store = MemoryStore::with_database("test");
        store.save(raw(json!({"_id": "doc"}))).await.unwrap();
        let err = store.save(raw(json!({"_id": "doc"}))).await.unwrap_err();
        assert!(matches!(err, StoreError::Conflict(_)));
    }

    #[tokio::test]
    async fn save_allocates_missing_ids() {
        let store = MemoryStore::with_database("test");
        let saved = store.save(raw(json!({"n": 1}))).await.unwrap();
        assert_eq!(raw_id(&saved).unwrap().len(), 32);
    }

    #[tokio::test]
    async fn delete_requires_current_revision() {
        let store = MemoryStore::with_database("test");
        let saved = store.save(raw(json!({"_id": "doc"}))).await.unwrap();
        let rev = Revision::parse(raw_rev(&saved).unwrap()).unwrap();
        let stale = Revision::parse("9-deadbeef").unwrap();

        assert!(matches!(
            store.delete("doc", &stale).await,
            Err(StoreError::Conflict(_))
        ));
        let tombstone = store.delete("doc", &rev).await.unwrap();
        assert_eq!(tombstone.generation(), 2);
        assert!(matches!(store.get("doc").await, Err(StoreError::NotFound(_))));

        // recreate after delete
        let again = store.save(raw(json!({"_id": "doc"}))).await.unwrap();
        assert_eq!(Revision::parse(raw_rev(&again).unwrap()).unwrap().generation(), 3);
    }

    #[tokio::test]
    async fn bulk_save_reports_partial_failure() {
        let store = MemoryStore::with_database("test");
        store.save(raw(json!({"_id": "taken"}))).await.unwrap();
        let results = store
            .save_bulk(vec![raw(json!({"_id": "fresh"})), raw(json!({"_id": "taken"}))])
            .await
            .unwrap();
        assert_eq!(results.len(), 2);
        assert!(results[0].outcome.is_ok());
        assert_eq!(results[1].id, "taken");
        assert!(matches!(results[1].outcome, Err(StoreError::Conflict(_))));
    }

    #[tokio::test]
    async fn query_orders_by_key_then_id() {
        let store = seeded().await;
        let rows = store
            .query("runs", "by_date", &ViewQuery::new())
            .await
            .unwrap();
        let ids: Vec<_> = rows.iter().map(|r| r.id.clone().unwrap()).collect();
        assert_eq!(ids, vec!["b", "d", "c", "a"]);

        let rows = store
            .query("runs", "by_date", &ViewQuery::new().descending(true).limit(2))
            .await
            .unwrap();
        let ids: Vec<_> = rows.iter().map(|r| r.id.clone().unwrap()).collect();
        assert_eq!(ids, vec!["a", "c"]);
    }

    #[tokio::test]
    async fn query_honours_key_ranges() {
        let store = seeded().await;
        let rows = store
            .query("runs", "by_date", &ViewQuery::new().range("220101", "220102"))
            .await
            .unwrap();
        assert_eq!(rows.len(), 3);

        let mut exclusive = ViewQuery::new().range("220101", "220102");
        exclusive.inclusive_end = false;
        let rows = store.query("runs", "by_date", &exclusive).await.unwrap();
        assert_eq!(rows.len(), 2);

        let rows = store
            .query("runs", "by_date", &ViewQuery::new().key("220103"))
            .await
            .unwrap();
        assert_eq!(rows[0].id.as_deref(), Some("a"));
    }

    #[tokio::test]
    async fn reduced_queries_group_by_key() {
        let store = seeded().await;
        let total = store
            .query("runs", "count", &ViewQuery::new())
            .await
            .unwrap();
        assert_eq!(total, vec![ViewRow { id: None, key: Value::Null, value: json!(4) }]);

        let grouped = store
            .query("runs", "count", &ViewQuery::new().group(true))
            .await
            .unwrap();
        assert_eq!(grouped.len(), 3);
        assert_eq!(grouped[0].key, json!("220101"));
        assert_eq!(grouped[0].value, json!(2));

        let unreduced = store
            .query("runs", "count", &ViewQuery::new().reduce(false))
            .await
            .unwrap();
        assert_eq!(unreduced.len(), 4);
    }

    #[tokio::test]
    async fn missing_design_or_view_is_not_found() {
        let store = MemoryStore::with_database("test").with_design_documents([runs_design()]);
        assert!(matches!(
            store.query("runs", "by_date", &ViewQuery::new()).await,
            Err(StoreError::NotFound(_))
        ));
        store.save(runs_design().to_serializable_form()).await.unwrap();
        assert!(matches!(
            store.query("runs", "nope", &ViewQuery::new()).await,
            Err(StoreError::NotFound(_))
        ));
    }
}
