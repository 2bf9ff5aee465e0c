//! Typed documents and their translation to and from the store-native form.
//!
//! Every typed document is a [`DocumentMeta`] (identity, revision, bookkeeping flags) plus a
//! [`DocumentBody`] tagged by `document_type`. The store-native form is a flat JSON object:
//!
//! ```text
//! { "_id", "_rev"?, "data_model_version", "dirty", "ignore_dirty", "deleted"?,
//!   "document_type", ...variant fields }
//! ```
//!
//! Reading validates types and reports the first offending field path; a document whose
//! `document_type` is missing or unknown is rejected rather than guessed.

mod entities;

pub use entities::{
    Examination, FilemakerRecord, Patient, Person, PipelineLogs, PipelineRun, PipelineState,
    PipelineStatus, RunMetadata, SequencerInputSample, SequencerRun, TrackingForm,
};

use crate::constants::DATA_MODEL_VERSION;
use crate::{CoreError, CoreResult};
use couch_store::RawDocument;
use ngs_types::{DocId, Revision};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::hash::{Hash, Hasher};

/// Discriminator values stored in `document_type`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum DocumentType {
    SequencerRun,
    PipelineRun,
    Examination,
    Patient,
    SequencerInputSample,
    TrackingForm,
    FilemakerRecord,
    PipelineState,
}

impl DocumentType {
    pub const fn as_str(self) -> &'static str {
        match self {
            DocumentType::SequencerRun => "sequencer_run",
            DocumentType::PipelineRun => "pipeline_run",
            DocumentType::Examination => "examination",
            DocumentType::Patient => "patient",
            DocumentType::SequencerInputSample => "sequencer_input_sample",
            DocumentType::TrackingForm => "tracking_form",
            DocumentType::FilemakerRecord => "filemaker_record",
            DocumentType::PipelineState => "ngs_pipeline_run",
        }
    }
}

impl fmt::Display for DocumentType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

const DOCUMENT_TYPE_KEY: &str = "document_type";

/// Variant payload of a typed document.
///
/// Written internally tagged; read through [`Document::from_storage_form`], which dispatches
/// on the tag itself so field errors keep their path.
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(tag = "document_type", rename_all = "snake_case")]
pub enum DocumentBody {
    SequencerRun(SequencerRun),
    PipelineRun(PipelineRun),
    Examination(Examination),
    Patient(Patient),
    SequencerInputSample(SequencerInputSample),
    TrackingForm(TrackingForm),
    FilemakerRecord(FilemakerRecord),
    #[serde(rename = "ngs_pipeline_run")]
    PipelineState(PipelineState),
}

impl DocumentBody {
    pub fn document_type(&self) -> DocumentType {
        match self {
            DocumentBody::SequencerRun(_) => DocumentType::SequencerRun,
            DocumentBody::PipelineRun(_) => DocumentType::PipelineRun,
            DocumentBody::Examination(_) => DocumentType::Examination,
            DocumentBody::Patient(_) => DocumentType::Patient,
            DocumentBody::SequencerInputSample(_) => DocumentType::SequencerInputSample,
            DocumentBody::TrackingForm(_) => DocumentType::TrackingForm,
            DocumentBody::FilemakerRecord(_) => DocumentType::FilemakerRecord,
            DocumentBody::PipelineState(_) => DocumentType::PipelineState,
        }
    }

    /// Parses the variant named by `document_type` from the remaining fields.
    fn from_fields(mut fields: RawDocument) -> CoreResult<Self> {
        let tag = match fields.remove(DOCUMENT_TYPE_KEY) {
            Some(Value::String(tag)) => tag,
            Some(other) => {
                return Err(CoreError::validation(
                    DOCUMENT_TYPE_KEY,
                    format!("expected a string, found {other}"),
                ))
            }
            None => {
                return Err(CoreError::validation(
                    DOCUMENT_TYPE_KEY,
                    "missing field `document_type`",
                ))
            }
        };
        let fields = Value::Object(fields);

        let body = match tag.as_str() {
            "sequencer_run" => DocumentBody::SequencerRun(parse_at_path(fields)?),
            "pipeline_run" => DocumentBody::PipelineRun(parse_at_path(fields)?),
            "examination" => DocumentBody::Examination(parse_at_path(fields)?),
            "patient" => DocumentBody::Patient(parse_at_path(fields)?),
            "sequencer_input_sample" => DocumentBody::SequencerInputSample(parse_at_path(fields)?),
            "tracking_form" => DocumentBody::TrackingForm(parse_at_path(fields)?),
            "filemaker_record" => DocumentBody::FilemakerRecord(parse_at_path(fields)?),
            "ngs_pipeline_run" => DocumentBody::PipelineState(parse_at_path(fields)?),
            other => {
                return Err(CoreError::validation(
                    DOCUMENT_TYPE_KEY,
                    format!("unknown document type '{other}'"),
                ))
            }
        };
        Ok(body)
    }
}

/// Identity, revision and bookkeeping flags shared by every typed document.
#[derive(Clone, Debug, PartialEq)]
pub struct DocumentMeta {
    id: DocId,
    rev: Option<Revision>,
    data_model_version: String,
    dirty: bool,
    ignore_dirty: bool,
    deleted: bool,
}

impl DocumentMeta {
    fn new(id: DocId) -> Self {
        Self {
            id,
            rev: None,
            data_model_version: DATA_MODEL_VERSION.into(),
            dirty: true,
            ignore_dirty: false,
            deleted: false,
        }
    }

    pub fn id(&self) -> &DocId {
        &self.id
    }

    /// `None` until the document has been read back from the store.
    pub fn rev(&self) -> Option<&Revision> {
        self.rev.as_ref()
    }

    pub fn data_model_version(&self) -> &str {
        &self.data_model_version
    }

    pub fn dirty(&self) -> bool {
        self.dirty
    }

    pub fn ignore_dirty(&self) -> bool {
        self.ignore_dirty
    }

    pub fn deleted(&self) -> bool {
        self.deleted
    }
}

/// A typed document.
///
/// Two documents are equal iff their ids are equal, whatever their revisions or contents.
/// Mutators consume the document and return the changed value.
#[derive(Clone, Debug)]
pub struct Document {
    meta: DocumentMeta,
    body: DocumentBody,
}

impl PartialEq for Document {
    fn eq(&self, other: &Self) -> bool {
        self.meta.id == other.meta.id
    }
}

impl Eq for Document {}

impl Hash for Document {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.meta.id.hash(state);
    }
}

/// Identity and bookkeeping keys of the store-native form.
#[derive(Serialize, Deserialize)]
struct MetaWire {
    #[serde(rename = "_id")]
    id: DocId,
    #[serde(rename = "_rev", default, skip_serializing_if = "Option::is_none")]
    rev: Option<Revision>,
    #[serde(default = "default_data_model_version")]
    data_model_version: String,
    #[serde(default = "default_dirty")]
    dirty: bool,
    #[serde(default)]
    ignore_dirty: bool,
    #[serde(default, skip_serializing_if = "is_false")]
    deleted: bool,
}

const META_KEYS: [&str; 6] = [
    "_id",
    "_rev",
    "data_model_version",
    "dirty",
    "ignore_dirty",
    "deleted",
];

/// Store-native shape of a typed document, for writing.
#[derive(Serialize)]
struct DocumentWire<'a> {
    #[serde(flatten)]
    meta: MetaWire,
    #[serde(flatten)]
    body: &'a DocumentBody,
}

/// Parses one value, naming the offending field on failure.
///
/// A missing field is reported at the path it was expected at.
fn parse_at_path<T: DeserializeOwned>(value: Value) -> CoreResult<T> {
    serde_path_to_error::deserialize(value).map_err(|err| {
        let message = err.inner().to_string();
        let mut path = err.path().to_string();
        if let Some(field) = message
            .strip_prefix("missing field `")
            .and_then(|rest| rest.split('`').next())
        {
            path = if path == "." {
                field.to_string()
            } else {
                format!("{path}.{field}")
            };
        }
        CoreError::validation(path, message)
    })
}

fn default_data_model_version() -> String {
    DATA_MODEL_VERSION.into()
}

fn default_dirty() -> bool {
    true
}

fn is_false(b: &bool) -> bool {
    !*b
}

impl Document {
    /// A fresh, never-stored document with a generated id. It starts dirty.
    pub fn create(body: DocumentBody) -> Self {
        Self::new(DocId::generate(), body)
    }

    /// A fresh, never-stored document with a caller-chosen id. It starts dirty.
    pub fn new(id: DocId, body: DocumentBody) -> Self {
        Self {
            meta: DocumentMeta::new(id),
            body,
        }
    }

    pub fn id(&self) -> &DocId {
        &self.meta.id
    }

    pub fn rev(&self) -> Option<&Revision> {
        self.meta.rev.as_ref()
    }

    pub fn meta(&self) -> &DocumentMeta {
        &self.meta
    }

    pub fn body(&self) -> &DocumentBody {
        &self.body
    }

    pub fn into_body(self) -> DocumentBody {
        self.body
    }

    pub fn document_type(&self) -> DocumentType {
        self.body.document_type()
    }

    /// True if reconciliation is pending and not suppressed.
    pub fn needs_reconciliation(&self) -> bool {
        self.meta.dirty && !self.meta.ignore_dirty
    }

    pub fn is_deleted(&self) -> bool {
        self.meta.deleted
    }

    /// Replaces the payload, keeping identity, revision and flags.
    pub fn with_body(mut self, body: DocumentBody) -> Self {
        self.body = body;
        self
    }

    pub fn mark_dirty(mut self) -> Self {
        self.meta.dirty = true;
        self
    }

    pub fn mark_reconciled(mut self) -> Self {
        self.meta.dirty = false;
        self
    }

    pub fn with_ignore_dirty(mut self, ignore: bool) -> Self {
        self.meta.ignore_dirty = ignore;
        self
    }

    /// Soft deletion: the document stays in the store but drops out of every view.
    pub fn mark_deleted(mut self) -> Self {
        self.meta.deleted = true;
        self
    }

    #[cfg(test)]
    fn with_rev(mut self, rev: Option<Revision>) -> Self {
        self.meta.rev = rev;
        self
    }

    pub fn as_examination(&self) -> Option<&Examination> {
        match &self.body {
            DocumentBody::Examination(e) => Some(e),
            _ => None,
        }
    }

    pub fn as_patient(&self) -> Option<&Patient> {
        match &self.body {
            DocumentBody::Patient(p) => Some(p),
            _ => None,
        }
    }

    pub fn as_sequencer_run(&self) -> Option<&SequencerRun> {
        match &self.body {
            DocumentBody::SequencerRun(r) => Some(r),
            _ => None,
        }
    }

    pub fn as_pipeline_run(&self) -> Option<&PipelineRun> {
        match &self.body {
            DocumentBody::PipelineRun(r) => Some(r),
            _ => None,
        }
    }

    pub fn as_pipeline_state(&self) -> Option<&PipelineState> {
        match &self.body {
            DocumentBody::PipelineState(s) => Some(s),
            _ => None,
        }
    }

    /// Store-native form. `_rev` is included only once the document has one.
    ///
    /// # Errors
    ///
    /// Returns `CoreError::Serialization` if a field cannot be represented as JSON, for example
    /// a non-UTF-8 path.
    pub fn to_storage_form(&self) -> CoreResult<RawDocument> {
        let wire = DocumentWire {
            meta: MetaWire {
                id: self.meta.id.clone(),
                rev: self.meta.rev.clone(),
                data_model_version: self.meta.data_model_version.clone(),
                dirty: self.meta.dirty,
                ignore_dirty: self.meta.ignore_dirty,
                deleted: self.meta.deleted,
            },
            body: &self.body,
        };

        match serde_json::to_value(wire).map_err(CoreError::Serialization)? {
            Value::Object(map) => Ok(map),
            other => Err(CoreError::validation(
                "",
                format!("document serialised to a non-object: {other}"),
            )),
        }
    }

    /// Parses the store-native form.
    ///
    /// # Errors
    ///
    /// Returns `CoreError::Validation` naming the offending field path when a field is missing
    /// or has the wrong type, or when `document_type` is missing or unknown.
    pub fn from_storage_form(mut raw: RawDocument) -> CoreResult<Self> {
        let mut meta = RawDocument::new();
        for key in META_KEYS {
            if let Some(value) = raw.remove(key) {
                meta.insert(key.to_string(), value);
            }
        }
        let meta: MetaWire = parse_at_path(Value::Object(meta))?;
        let body = DocumentBody::from_fields(raw)?;

        Ok(Self {
            meta: DocumentMeta {
                id: meta.id,
                rev: meta.rev,
                data_model_version: meta.data_model_version,
                dirty: meta.dirty,
                ignore_dirty: meta.ignore_dirty,
                deleted: meta.deleted,
            },
            body,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{NaiveDate, TimeZone, Utc};
    use serde_json::json;
    use std::path::PathBuf;

    fn raw(value: Value) -> RawDocument {
        match value {
            Value::Object(map) => map,
            _ => panic!("expected object"),
        }
    }

    fn examination() -> Examination {
        let mut exam = Examination::new(
            "DNA Panel ONCOHS",
            Utc.with_ymd_and_hms(2022, 1, 3, 8, 30, 0).unwrap(),
        );
        exam.sequencer_runs = vec![DocId::new("r1").unwrap()];
        exam.filemaker_record = Some(raw(json!({"Name": "Muster", "Jahr": 2022})));
        exam
    }

    fn round_trip(doc: &Document) -> Document {
        let stored = doc.to_storage_form().expect("serialise");
        Document::from_storage_form(stored).expect("parse")
    }

    #[test]
    fn new_documents_start_dirty_without_revision() {
        let doc = Document::create(DocumentBody::Examination(examination()));
        assert!(doc.meta().dirty());
        assert!(!doc.meta().ignore_dirty());
        assert!(doc.rev().is_none());
        assert_eq!(doc.meta().data_model_version(), DATA_MODEL_VERSION);

        let stored = doc.to_storage_form().unwrap();
        assert!(!stored.contains_key("_rev"));
        assert!(!stored.contains_key("deleted"));
        assert_eq!(stored["document_type"], json!("examination"));
        assert_eq!(stored["examinationtype"], json!("DNA Panel ONCOHS"));
        assert_eq!(stored["dirty"], json!(true));
    }

    #[test]
    fn every_variant_round_trips() {
        let when = Utc.with_ymd_and_hms(2023, 5, 17, 12, 0, 0).unwrap();
        let sample = SequencerInputSample {
            kit: "ONCOHS".into(),
            molnr: "M123/22".into(),
            concentration: 12.5,
            index1: "ACGT".into(),
            index2: "TGCA".into(),
            sample_volume: 2.5,
            sample_water: 7.5,
            is_final: true,
            repetition: false,
        };
        let mut patient = Patient {
            birthdate: NaiveDate::from_ymd_opt(1970, 1, 1),
            gender: "f".into(),
            ..Patient::default()
        };
        patient.person.names.insert("firstname".into(), "Erika".into());
        patient.person.names.insert("lastname".into(), "Muster".into());
        patient.examinations.push(DocId::new("e1").unwrap());

        let bodies = vec![
            DocumentBody::SequencerRun(SequencerRun {
                original_path: PathBuf::from("/data/miseq/220101_M00000_0000_000000000-AAAAA"),
                name_dirty: false,
                parsed: RunMetadata {
                    date: Some("220101".into()),
                    ..RunMetadata::default()
                },
                indexed_time: when,
                state: "unfinished".into(),
                outputs: vec![],
            }),
            DocumentBody::PipelineRun(PipelineRun {
                created_time: when,
                input_samples: vec![PathBuf::from("/in/a.fastq")],
                workflow: "wf.wdl".into(),
                status: PipelineStatus::Successful,
                logs: PipelineLogs {
                    stdout: "ok".into(),
                    stderr: String::new(),
                },
            }),
            DocumentBody::Examination(examination()),
            DocumentBody::Patient(patient),
            DocumentBody::SequencerInputSample(sample.clone()),
            DocumentBody::TrackingForm(TrackingForm {
                created_time: when,
                samples: vec![sample.clone(), sample],
            }),
            DocumentBody::FilemakerRecord(FilemakerRecord {
                fields: raw(json!({"Untersuchung": "RNA Sarkompanel", "Nummer": 17})),
            }),
            DocumentBody::PipelineState(PipelineState {
                progress: 40,
                finish_time: Some(when),
            }),
        ];

        for body in bodies {
            let doc = Document::create(body.clone())
                .mark_reconciled()
                .with_rev(Some(Revision::parse("3-abc").unwrap()));
            let back = round_trip(&doc);
            assert_eq!(back.body(), &body);
            assert_eq!(back.meta(), doc.meta());
        }
    }

    #[test]
    fn equality_is_by_id_only() {
        let id = DocId::new("same").unwrap();
        let a = Document::new(id.clone(), DocumentBody::Examination(examination()));
        let b = Document::new(id, DocumentBody::Patient(Patient::default()))
            .with_rev(Some(Revision::parse("9-x").unwrap()));
        assert_eq!(a, b);
        assert_ne!(a, Document::create(DocumentBody::Patient(Patient::default())));
    }

    #[test]
    fn missing_flags_take_defaults() {
        let doc = Document::from_storage_form(raw(json!({
            "_id": "p1",
            "_rev": "1-a",
            "document_type": "patient",
            "names": {"lastname": "Muster"},
        })))
        .expect("parse");
        assert!(doc.meta().dirty());
        assert!(!doc.meta().ignore_dirty());
        assert!(!doc.is_deleted());
        assert_eq!(doc.meta().data_model_version(), DATA_MODEL_VERSION);
        assert_eq!(doc.as_patient().unwrap().person.name("lastname"), Some("Muster"));
    }

    #[test]
    fn wrong_field_type_names_the_field() {
        let err = Document::from_storage_form(raw(json!({
            "_id": "x",
            "document_type": "examination",
            "dirty": "yes",
            "examinationtype": "DNA Panel ONCOHS",
            "started_date": "2022-01-03T08:30:00Z",
        })))
        .unwrap_err();
        match err {
            CoreError::Validation { path, .. } => assert_eq!(path, "dirty"),
            other => panic!("expected validation error, got {other:?}"),
        }
    }

    fn validation_path(value: Value) -> String {
        match Document::from_storage_form(raw(value)) {
            Err(CoreError::Validation { path, .. }) => path,
            other => panic!("expected validation error, got {other:?}"),
        }
    }

    #[test]
    fn missing_body_field_names_the_field() {
        let path = validation_path(json!({
            "_id": "e1",
            "document_type": "examination",
            "started_date": "2022-01-03T08:30:00Z",
        }));
        assert_eq!(path, "examinationtype");
    }

    #[test]
    fn wrong_body_field_type_names_the_field() {
        let path = validation_path(json!({
            "_id": "e1",
            "document_type": "examination",
            "examinationtype": "DNA Panel ONCOHS",
            "started_date": "2022-01-03T08:30:00Z",
            "sequencer_runs": "r1",
        }));
        assert_eq!(path, "sequencer_runs");

        let path = validation_path(json!({
            "_id": "f1",
            "document_type": "tracking_form",
            "created_time": "2022-01-03T08:30:00Z",
            "samples": [{"kit": "ONCOHS", "molnr": "M1/22", "concentration": "high"}],
        }));
        assert_eq!(path, "samples[0].concentration");
    }

    fn sample_fields() -> Value {
        json!({
            "_id": "s1",
            "document_type": "sequencer_input_sample",
            "kit": "ONCOHS",
            "molnr": "M123/22",
            "concentration": 12.5,
            "index1": "ACGT",
            "index2": "TGCA",
            "sample_volume": 2.5,
            "sample_water": 7.5,
        })
    }

    #[test]
    fn sample_final_flag_is_read_and_written() {
        let mut fields = sample_fields();
        fields["final"] = json!(true);
        let doc = Document::from_storage_form(raw(fields)).expect("parse");
        match doc.body() {
            DocumentBody::SequencerInputSample(s) => assert!(s.is_final && !s.repetition),
            other => panic!("expected a sample, got {other:?}"),
        }
        assert_eq!(doc.to_storage_form().unwrap()["final"], json!(true));
        assert_eq!(round_trip(&doc).body(), doc.body());
    }

    #[test]
    fn sample_final_flag_defaults_to_false() {
        let doc = Document::from_storage_form(raw(sample_fields())).expect("parse");
        match doc.body() {
            DocumentBody::SequencerInputSample(s) => assert!(!s.is_final),
            other => panic!("expected a sample, got {other:?}"),
        }
        assert_eq!(doc.to_storage_form().unwrap()["final"], json!(false));
    }

    #[test]
    fn legacy_timestamp_birthdate_is_accepted() {
        for stored in ["1970-01-01T00:00:00", "1970-01-01T00:00:00Z", "1970-01-01"] {
            let doc = Document::from_storage_form(raw(json!({
                "_id": "p1",
                "document_type": "patient",
                "birthdate": stored,
            })))
            .expect("parse");
            assert_eq!(
                doc.as_patient().unwrap().birthdate,
                NaiveDate::from_ymd_opt(1970, 1, 1)
            );
        }

        let path = validation_path(json!({
            "_id": "p1",
            "document_type": "patient",
            "birthdate": "first of january",
        }));
        assert_eq!(path, "birthdate");
    }

    #[test]
    fn unknown_or_missing_document_type_is_rejected() {
        for value in [
            json!({"_id": "x", "document_type": "spaceship"}),
            json!({"_id": "x", "names": {}}),
        ] {
            assert!(matches!(
                Document::from_storage_form(raw(value)),
                Err(CoreError::Validation { .. })
            ));
        }
    }

    #[test]
    fn legacy_textual_name_dirty_is_accepted() {
        let doc = Document::from_storage_form(raw(json!({
            "_id": "run",
            "document_type": "sequencer_run",
            "original_path": "/data/miseq/odd",
            "name_dirty": "False",
            "parsed": {},
            "indexed_time": "2022-11-24T14:03:12Z",
        })))
        .expect("parse");
        let run = doc.as_sequencer_run().unwrap();
        assert!(!run.name_dirty);
        assert!(run.parsed.is_empty());
        assert_eq!(run.state, "unfinished");
    }

    #[test]
    fn mutators_return_changed_values() {
        let doc = Document::create(DocumentBody::Examination(examination()));
        let id = doc.id().clone();
        let doc = doc.mark_reconciled().with_ignore_dirty(true).mark_deleted();
        assert_eq!(doc.id(), &id);
        assert!(!doc.needs_reconciliation());
        assert!(doc.is_deleted());
        assert_eq!(doc.to_storage_form().unwrap()["deleted"], json!(true));
    }
}
