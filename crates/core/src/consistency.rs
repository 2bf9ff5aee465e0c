//! Reference consistency between documents.
//!
//! Documents refer to each other by id only and the store enforces nothing, so a reference can
//! outlive its target. This check walks every examination and patient and reports each id that
//! does not resolve to a live document of the expected type.

use crate::catalog::{BY_STARTED_DATE, EXAMINATIONS, PATIENTS, PATIENTS_BY_ID};
use crate::document::{Document, DocumentType};
use crate::session::{Initialised, Session};
use crate::{CoreError, CoreResult};
use couch_store::ViewQuery;
use ngs_types::DocId;
use serde::Serialize;
use std::collections::HashMap;
use serde_json::Value;
use tracing::{info, warn};

/// Why a reference does not resolve.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(tag = "problem", rename_all = "snake_case")]
pub enum ReferenceProblem {
    Missing,
    Deleted,
    WrongType { found: String },
    Unreadable { reason: String },
}

/// One reference that does not resolve.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct DanglingReference {
    pub owner: DocId,
    pub field: &'static str,
    pub target: DocId,
    #[serde(flatten)]
    pub problem: ReferenceProblem,
}

fn references(doc: &Document) -> Vec<(&'static str, &DocId, DocumentType)> {
    let mut refs = Vec::new();
    if let Some(exam) = doc.as_examination() {
        refs.extend(
            exam.sequencer_runs
                .iter()
                .map(|id| ("sequencer_runs", id, DocumentType::SequencerRun)),
        );
        refs.extend(
            exam.pipeline_runs
                .iter()
                .map(|id| ("pipeline_runs", id, DocumentType::PipelineRun)),
        );
        if let Some(patient) = &exam.patient {
            refs.push(("patient", patient, DocumentType::Patient));
        }
    }
    if let Some(patient) = doc.as_patient() {
        refs.extend(
            patient
                .examinations
                .iter()
                .map(|id| ("examinations", id, DocumentType::Examination)),
        );
    }
    refs
}

async fn resolve(
    session: &Session<Initialised>,
    target: &DocId,
) -> CoreResult<Result<Document, ReferenceProblem>> {
    match session.get(target).await {
        Ok(doc) if doc.is_deleted() => Ok(Err(ReferenceProblem::Deleted)),
        Ok(doc) => Ok(Ok(doc)),
        Err(CoreError::NotFound(_)) => Ok(Err(ReferenceProblem::Missing)),
        Err(CoreError::Validation { path, message }) => Ok(Err(ReferenceProblem::Unreadable {
            reason: format!("{path}: {message}"),
        })),
        Err(err) => Err(err),
    }
}

/// Field reported when the owning document itself cannot be parsed.
pub const OWNER_DOCUMENT: &str = "document";

/// Live examinations and patients, parsed one by one.
///
/// An owner that fails to parse is returned as a [`ReferenceProblem::Unreadable`] finding
/// against itself.
async fn load_owners(
    session: &Session<Initialised>,
) -> CoreResult<(Vec<Document>, Vec<DanglingReference>)> {
    let mut rows = session
        .query(EXAMINATIONS, BY_STARTED_DATE, &ViewQuery::new())
        .await?;
    rows.extend(
        session
            .query(PATIENTS, PATIENTS_BY_ID, &ViewQuery::new())
            .await?,
    );

    let mut owners = Vec::with_capacity(rows.len());
    let mut unreadable = Vec::new();
    for row in rows {
        let Some(owner) = row.id.as_deref().and_then(|id| DocId::new(id).ok()) else {
            warn!(key = %row.key, "view row without a usable document id");
            continue;
        };
        let parsed = match row.value {
            Value::Object(raw) => Document::from_storage_form(raw),
            other => Err(CoreError::InvalidInput(format!(
                "view emitted a non-document value: {other}"
            ))),
        };
        match parsed {
            Ok(doc) => owners.push(doc),
            Err(err) => {
                warn!(owner = %owner, error = %err, "unreadable document");
                unreadable.push(DanglingReference {
                    target: owner.clone(),
                    owner,
                    field: OWNER_DOCUMENT,
                    problem: ReferenceProblem::Unreadable {
                        reason: err.to_string(),
                    },
                });
            }
        }
    }
    Ok((owners, unreadable))
}

/// Every dangling reference held by live examinations and patients.
///
/// Each target is read once however often it is referenced. Owners that cannot be parsed are
/// reported with field [`OWNER_DOCUMENT`] and do not stop the check.
pub async fn check_references(
    session: &Session<Initialised>,
) -> CoreResult<Vec<DanglingReference>> {
    let (owners, mut dangling) = load_owners(session).await?;

    let mut resolved: HashMap<DocId, Result<DocumentType, ReferenceProblem>> = HashMap::new();
    for owner in &owners {
        for (field, target, expected) in references(owner) {
            if !resolved.contains_key(target) {
                let outcome = resolve(session, target)
                    .await?
                    .map(|doc| doc.document_type());
                resolved.insert(target.clone(), outcome);
            }

            let problem = match &resolved[target] {
                Ok(found) if *found == expected => continue,
                Ok(found) => ReferenceProblem::WrongType {
                    found: found.as_str().to_string(),
                },
                Err(problem) => problem.clone(),
            };
            dangling.push(DanglingReference {
                owner: owner.id().clone(),
                field,
                target: target.clone(),
                problem,
            });
        }
    }

    info!(
        documents = owners.len(),
        targets = resolved.len(),
        dangling = dangling.len(),
        "checked references"
    );
    Ok(dangling)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::{bootstrap, design_documents};
    use crate::document::{DocumentBody, Examination, Patient, PipelineState, RunMetadata, SequencerRun};
    use crate::records::link_patient_examination;
    use chrono::Utc;
    use couch_store::{DocumentStore, MemoryStore};
    use serde_json::json;
    use std::path::PathBuf;
    use std::sync::Arc;

    async fn session() -> Session<Initialised> {
        let store: Arc<dyn DocumentStore> = Arc::new(
            MemoryStore::with_database("ngs_test").with_design_documents(design_documents()),
        );
        let session = Session::new(store).connect().await.expect("database exists");
        bootstrap(&session).await.expect("bootstrap");
        session
    }

    fn run() -> Document {
        Document::create(DocumentBody::SequencerRun(SequencerRun {
            original_path: PathBuf::from("/data/miseq/220101_M00000_0000_000000000-AAAAA"),
            name_dirty: false,
            parsed: RunMetadata::default(),
            indexed_time: Utc::now(),
            state: "unfinished".into(),
            outputs: Vec::new(),
        }))
    }

    #[tokio::test]
    async fn consistent_records_report_nothing() {
        let session = session().await;
        let run = session.save(&run()).await.unwrap();
        let mut exam = Examination::new("RNA Sarkompanel", Utc::now());
        exam.sequencer_runs.push(run.id().clone());
        let exam = session
            .save(&Document::create(DocumentBody::Examination(exam)))
            .await
            .unwrap();
        let patient = session
            .save(&Document::create(DocumentBody::Patient(Patient::default())))
            .await
            .unwrap();
        link_patient_examination(&session, patient.id(), exam.id())
            .await
            .unwrap();

        assert!(check_references(&session).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn reports_missing_deleted_and_mistyped_targets() {
        let session = session().await;
        let gone = session.save(&run()).await.unwrap();
        session.soft_delete(gone.clone()).await.unwrap();
        let state = session
            .save(&Document::create(DocumentBody::PipelineState(PipelineState::default())))
            .await
            .unwrap();
        let missing = DocId::new("never-written").unwrap();

        let mut exam = Examination::new("RNA Sarkompanel", Utc::now());
        exam.sequencer_runs = vec![gone.id().clone(), missing.clone(), missing.clone()];
        exam.pipeline_runs = vec![state.id().clone()];
        let exam = session
            .save(&Document::create(DocumentBody::Examination(exam)))
            .await
            .unwrap();

        let dangling = check_references(&session).await.unwrap();
        let problems: Vec<(&str, &DocId, &ReferenceProblem)> = dangling
            .iter()
            .map(|d| (d.field, &d.target, &d.problem))
            .collect();
        assert_eq!(
            problems,
            vec![
                ("sequencer_runs", gone.id(), &ReferenceProblem::Deleted),
                ("sequencer_runs", &missing, &ReferenceProblem::Missing),
                ("sequencer_runs", &missing, &ReferenceProblem::Missing),
                (
                    "pipeline_runs",
                    state.id(),
                    &ReferenceProblem::WrongType {
                        found: "ngs_pipeline_run".into()
                    }
                ),
            ]
        );
        assert!(dangling.iter().all(|d| &d.owner == exam.id()));
    }

    #[tokio::test]
    async fn unreadable_owner_is_reported_and_the_rest_still_checked() {
        let session = session().await;
        let missing = DocId::new("never-written").unwrap();
        let mut exam = Examination::new("RNA Sarkompanel", Utc::now());
        exam.sequencer_runs.push(missing.clone());
        let exam = session
            .save(&Document::create(DocumentBody::Examination(exam)))
            .await
            .unwrap();

        let legacy = match json!({
            "_id": "legacy",
            "document_type": "examination",
            "examinationtype": "RNA Sarkompanel",
            "started_date": "2021-06-01T00:00:00Z",
            "sequencer_runs": "gone",
        }) {
            Value::Object(map) => map,
            _ => unreachable!(),
        };
        session.save_raw(legacy).await.unwrap();

        let dangling = check_references(&session).await.unwrap();
        assert_eq!(dangling.len(), 2);

        let unreadable = dangling
            .iter()
            .find(|d| d.owner.as_str() == "legacy")
            .expect("legacy examination reported");
        assert_eq!(unreadable.field, OWNER_DOCUMENT);
        assert_eq!(unreadable.target.as_str(), "legacy");
        match &unreadable.problem {
            ReferenceProblem::Unreadable { reason } => assert!(reason.contains("sequencer_runs")),
            other => panic!("expected unreadable, got {other:?}"),
        }

        assert!(dangling.iter().any(|d| &d.owner == exam.id()
            && d.target == missing
            && d.problem == ReferenceProblem::Missing));
    }

    #[tokio::test]
    async fn deleted_owners_are_not_checked() {
        let session = session().await;
        let mut exam = Examination::new("RNA Sarkompanel", Utc::now());
        exam.sequencer_runs.push(DocId::new("never-written").unwrap());
        let exam = session
            .save(&Document::create(DocumentBody::Examination(exam)))
            .await
            .unwrap();
        session.soft_delete(exam).await.unwrap();

        assert!(check_references(&session).await.unwrap().is_empty());
    }
}
