//! Domain entities carried by typed documents.
//!
//! These are plain data: identity, revision and bookkeeping flags live on
//! [`DocumentMeta`](super::DocumentMeta), never here.

use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use ngs_types::DocId;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::path::PathBuf;

/// Metadata recovered from a sequencer output folder name.
///
/// All fields are absent when the name did not follow the `YYMMDD_<device>_<run>_<flowcell>`
/// convention; it then serialises as `{}`.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunMetadata {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub date: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub run_number: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub flowcell_barcode: Option<String>,
}

impl RunMetadata {
    pub fn is_empty(&self) -> bool {
        self.date.is_none()
            && self.device.is_none()
            && self.run_number.is_none()
            && self.flowcell_barcode.is_none()
    }
}

/// One sequencer output folder.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SequencerRun {
    pub original_path: PathBuf,
    /// Set when the folder name could not be parsed.
    #[serde(default, deserialize_with = "lenient_bool")]
    pub name_dirty: bool,
    #[serde(default)]
    pub parsed: RunMetadata,
    pub indexed_time: DateTime<Utc>,
    #[serde(default = "default_run_state")]
    pub state: String,
    #[serde(default)]
    pub outputs: Vec<PathBuf>,
}

impl SequencerRun {
    /// Folder name of the run, used as its display name.
    pub fn name(&self) -> Option<&str> {
        self.original_path.file_name().and_then(|n| n.to_str())
    }
}

fn default_run_state() -> String {
    "unfinished".into()
}

/// Older writers stored `name_dirty` as the strings `"True"`/`"False"`.
fn lenient_bool<'de, D>(deserializer: D) -> Result<bool, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum BoolOrText {
        Bool(bool),
        Text(String),
    }

    match BoolOrText::deserialize(deserializer)? {
        BoolOrText::Bool(b) => Ok(b),
        BoolOrText::Text(s) => match s.to_ascii_lowercase().as_str() {
            "true" => Ok(true),
            "false" => Ok(false),
            _ => Err(serde::de::Error::custom(format!(
                "expected a boolean, found '{s}'"
            ))),
        },
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PipelineStatus {
    Running,
    Error,
    Successful,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PipelineLogs {
    #[serde(default)]
    pub stdout: String,
    #[serde(default)]
    pub stderr: String,
}

/// One execution of the analysis workflow.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PipelineRun {
    pub created_time: DateTime<Utc>,
    #[serde(default)]
    pub input_samples: Vec<PathBuf>,
    pub workflow: String,
    pub status: PipelineStatus,
    #[serde(default)]
    pub logs: PipelineLogs,
}

/// One diagnostic examination (case).
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Examination {
    #[serde(rename = "examinationtype")]
    pub examination_type: String,
    pub started_date: DateTime<Utc>,
    #[serde(default)]
    pub sequencer_runs: Vec<DocId>,
    #[serde(default)]
    pub pipeline_runs: Vec<DocId>,
    /// Verbatim copy of the external laboratory record this case was created from.
    #[serde(default)]
    pub filemaker_record: Option<Map<String, Value>>,
    #[serde(default)]
    pub last_sync_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub result: Option<String>,
    #[serde(default)]
    pub patient: Option<DocId>,
}

impl Examination {
    pub fn new(examination_type: impl Into<String>, started_date: DateTime<Utc>) -> Self {
        Self {
            examination_type: examination_type.into(),
            started_date,
            sequencer_runs: Vec::new(),
            pipeline_runs: Vec::new(),
            filemaker_record: None,
            last_sync_time: None,
            result: None,
            patient: None,
        }
    }

    /// Newly created cases have no pipeline executions yet.
    pub fn awaits_pipeline(&self) -> bool {
        self.pipeline_runs.is_empty()
    }
}

/// Name parts of a person, for example `firstname` and `lastname`.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Person {
    #[serde(default)]
    pub names: BTreeMap<String, String>,
}

impl Person {
    pub fn name(&self, part: &str) -> Option<&str> {
        self.names.get(part).map(String::as_str)
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "PatientWire")]
pub struct Patient {
    #[serde(flatten)]
    pub person: Person,
    pub examinations: Vec<DocId>,
    pub birthdate: Option<NaiveDate>,
    pub gender: String,
}

/// Flat read shape of [`Patient`], so field errors keep their path.
#[derive(Deserialize)]
struct PatientWire {
    #[serde(default)]
    names: BTreeMap<String, String>,
    #[serde(default)]
    examinations: Vec<DocId>,
    #[serde(default, deserialize_with = "lenient_date")]
    birthdate: Option<NaiveDate>,
    #[serde(default)]
    gender: String,
}

impl From<PatientWire> for Patient {
    fn from(wire: PatientWire) -> Self {
        Self {
            person: Person { names: wire.names },
            examinations: wire.examinations,
            birthdate: wire.birthdate,
            gender: wire.gender,
        }
    }
}

/// Older writers stored birthdates as midnight timestamps, e.g. `1970-01-01T00:00:00`.
fn lenient_date<'de, D>(deserializer: D) -> Result<Option<NaiveDate>, D::Error>
where
    D: Deserializer<'de>,
{
    let Some(text) = Option::<String>::deserialize(deserializer)? else {
        return Ok(None);
    };

    NaiveDate::parse_from_str(&text, "%Y-%m-%d")
        .or_else(|_| {
            NaiveDateTime::parse_from_str(&text, "%Y-%m-%dT%H:%M:%S%.f").map(|dt| dt.date())
        })
        .or_else(|_| DateTime::parse_from_rfc3339(&text).map(|dt| dt.date_naive()))
        .map(Some)
        .map_err(|_| serde::de::Error::custom(format!("expected a date, found '{text}'")))
}

/// One sample loaded onto a sequencer, with its library preparation measurements.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SequencerInputSample {
    pub kit: String,
    pub molnr: String,
    pub concentration: f64,
    pub index1: String,
    pub index2: String,
    pub sample_volume: f64,
    pub sample_water: f64,
    #[serde(rename = "final", default)]
    pub is_final: bool,
    #[serde(default)]
    pub repetition: bool,
}

/// A lab tracking form; owns its samples, in loading order.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TrackingForm {
    pub created_time: DateTime<Utc>,
    #[serde(default)]
    pub samples: Vec<SequencerInputSample>,
}

/// Mirror of a record in the external laboratory database.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct FilemakerRecord {
    #[serde(flatten)]
    pub fields: Map<String, Value>,
}

/// Progress of the most recently started pipeline execution.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PipelineState {
    pub progress: u8,
    #[serde(default)]
    pub finish_time: Option<DateTime<Utc>>,
}
