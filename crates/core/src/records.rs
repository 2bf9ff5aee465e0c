//! Examination and patient records: linking and the queries built on the catalog views.

use crate::catalog::{
    ALL, BY_SEQUENCER_RUN, BY_STARTED_DATE, COUNT, EXAMINATIONS, FILEMAKER, MP_NUMBER,
    NEW_EXAMINATIONS, PATIENTS, PATIENT_AGGREGATION,
};
use crate::document::{Document, DocumentBody};
use crate::session::{Initialised, Session};
use crate::{CoreError, CoreResult};
use couch_store::ViewQuery;
use ngs_types::DocId;
use serde_json::{json, Value};
use std::collections::BTreeMap;
use tracing::debug;

/// Examinations that have no pipeline execution yet.
pub async fn new_examinations(session: &Session<Initialised>) -> CoreResult<Vec<Document>> {
    session
        .view_documents(EXAMINATIONS, NEW_EXAMINATIONS, &ViewQuery::new())
        .await
}

/// Number of live examinations.
pub async fn examination_count(session: &Session<Initialised>) -> CoreResult<u64> {
    let values = session
        .view_values(EXAMINATIONS, COUNT, &ViewQuery::new())
        .await?;
    Ok(values.first().and_then(Value::as_u64).unwrap_or(0))
}

/// Examinations ordered by start date, newest first when `descending`.
pub async fn examinations_by_started_date(
    session: &Session<Initialised>,
    descending: bool,
    limit: Option<usize>,
) -> CoreResult<Vec<Document>> {
    let mut query = ViewQuery::new().descending(descending);
    if let Some(limit) = limit {
        query = query.limit(limit);
    }
    session
        .view_documents(EXAMINATIONS, BY_STARTED_DATE, &query)
        .await
}

/// Ids of the examinations that reference a sequencer run.
pub async fn examinations_for_sequencer_run(
    session: &Session<Initialised>,
    run_id: &DocId,
) -> CoreResult<Vec<DocId>> {
    let rows = session
        .query(
            EXAMINATIONS,
            BY_SEQUENCER_RUN,
            &ViewQuery::new().key(run_id.as_str()),
        )
        .await?;
    rows.into_iter()
        .filter_map(|row| row.id)
        .map(|id| DocId::new(id).map_err(|e| CoreError::validation("_id", e.to_string())))
        .collect()
}

/// Examinations for a molecular pathology case number (`year`, `number`).
pub async fn examinations_by_case_number(
    session: &Session<Initialised>,
    year: i64,
    number: i64,
) -> CoreResult<Vec<Document>> {
    session
        .view_documents(
            EXAMINATIONS,
            MP_NUMBER,
            &ViewQuery::new().key(json!([year, number])),
        )
        .await
}

/// Ids of patients and examinations filed under the same name and birth date.
///
/// `birthdate` is the ISO date, as stored. Matching is exact.
pub async fn patient_candidates(
    session: &Session<Initialised>,
    lastname: &str,
    firstname: &str,
    birthdate: &str,
) -> CoreResult<Vec<String>> {
    let rows = session
        .query(
            PATIENTS,
            PATIENT_AGGREGATION,
            &ViewQuery::new().range(
                json!([lastname, firstname, birthdate]),
                json!([lastname, firstname, birthdate, {}]),
            ),
        )
        .await?;
    Ok(rows.into_iter().filter_map(|row| row.id).collect())
}

/// How many examinations were created from one external record.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RecordLinkage {
    pub record_id: String,
    /// False when examinations point at a record that was never mirrored.
    pub record_present: bool,
    pub examinations: u64,
}

impl RecordLinkage {
    /// Every mirrored record should have exactly one examination.
    pub fn is_consistent(&self) -> bool {
        self.record_present && self.examinations == 1
    }
}

/// Linkage counts for every external record, ordered by record id.
pub async fn filemaker_linkage(session: &Session<Initialised>) -> CoreResult<Vec<RecordLinkage>> {
    let rows = session
        .query(FILEMAKER, ALL, &ViewQuery::new().group(true))
        .await?;

    let mut linkage: BTreeMap<String, RecordLinkage> = BTreeMap::new();
    for row in rows {
        let (Some(record_id), Some(kind)) = (
            row.key.get(0).and_then(Value::as_str),
            row.key.get(1).and_then(Value::as_u64),
        ) else {
            debug!(key = %row.key, "skipping malformed linkage row");
            continue;
        };

        let entry = linkage
            .entry(record_id.to_string())
            .or_insert_with(|| RecordLinkage {
                record_id: record_id.to_string(),
                record_present: false,
                examinations: 0,
            });
        match kind {
            0 => entry.record_present = true,
            _ => entry.examinations += row.value.as_u64().unwrap_or(0),
        }
    }
    Ok(linkage.into_values().collect())
}

/// Links a patient and an examination in both directions.
///
/// Two single-document updates, patient first. A failure between them leaves a half-linked
/// pair that repeating the call completes; both updates are idempotent.
pub async fn link_patient_examination(
    session: &Session<Initialised>,
    patient_id: &DocId,
    examination_id: &DocId,
) -> CoreResult<(Document, Document)> {
    let current = session.get(examination_id).await?;
    if let Some(owner) = current.as_examination().and_then(|e| e.patient.as_ref()) {
        if owner != patient_id {
            return Err(CoreError::InvalidInput(format!(
                "{examination_id} is already linked to another patient"
            )));
        }
    }

    let patient = session
        .update(patient_id, |doc| match doc.body() {
            DocumentBody::Patient(p) => {
                let mut p = p.clone();
                if !p.examinations.contains(examination_id) {
                    p.examinations.push(examination_id.clone());
                }
                Ok(doc.with_body(DocumentBody::Patient(p)))
            }
            _ => Err(CoreError::InvalidInput(format!(
                "{patient_id} is not a patient"
            ))),
        })
        .await?;

    let examination = session
        .update(examination_id, |doc| match doc.body() {
            DocumentBody::Examination(e) => {
                if e.patient.as_ref().is_some_and(|p| p != patient_id) {
                    return Err(CoreError::InvalidInput(format!(
                        "{examination_id} is already linked to another patient"
                    )));
                }
                let mut e = e.clone();
                e.patient = Some(patient_id.clone());
                Ok(doc.with_body(DocumentBody::Examination(e)))
            }
            _ => Err(CoreError::InvalidInput(format!(
                "{examination_id} is not an examination"
            ))),
        })
        .await?;

    Ok((patient, examination))
}

/// Records that an examination was sequenced in a run.
pub async fn attach_sequencer_run(
    session: &Session<Initialised>,
    examination_id: &DocId,
    run_id: &DocId,
) -> CoreResult<Document> {
    session
        .update(examination_id, |doc| match doc.body() {
            DocumentBody::Examination(e) => {
                let mut e = e.clone();
                if !e.sequencer_runs.contains(run_id) {
                    e.sequencer_runs.push(run_id.clone());
                }
                Ok(doc.with_body(DocumentBody::Examination(e)))
            }
            _ => Err(CoreError::InvalidInput(format!(
                "{examination_id} is not an examination"
            ))),
        })
        .await
}
