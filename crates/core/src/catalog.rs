//! The fixed catalog of secondary indexes and the bootstrap that installs it.
//!
//! Each subject area is one design document. Bootstrap compares every bundle with its stored
//! copy and writes only on difference, so repeating it against an up-to-date database performs
//! no writes. Revision conflicts from a concurrent bootstrap are resolved by re-reading and
//! comparing again.

use crate::constants::FILEMAKER_EXAMINATION_TYPES;
use crate::document::DocumentType;
use crate::session::{Initialised, Session};
use crate::settings::{self, AppSettings, AppState, Singleton};
use crate::{CoreError, CoreResult};
use couch_store::{raw_rev, Condition, DesignDocument, Expr, MapBody, Reduce, ViewSpec};
use tracing::{debug, info, warn};

pub const SEQUENCER_RUNS: &str = "sequencer_runs";
pub const SAMPLES: &str = "samples";
pub const PIPELINE_RUNS: &str = "pipeline_runs";
pub const EXAMINATIONS: &str = "examinations";
pub const PATIENTS: &str = "patients";
pub const FILEMAKER: &str = "filemaker";

/// View names shared by several design documents.
pub const ALL: &str = "all";
pub const NEW_EXAMINATIONS: &str = "new_examinations";
pub const COUNT: &str = "count";
pub const BY_STARTED_DATE: &str = "by_started_date";
pub const BY_SEQUENCER_RUN: &str = "sequencer_runs";
pub const MP_NUMBER: &str = "mp_number";
pub const PATIENT_AGGREGATION: &str = "patient_aggregation";
pub const PATIENTS_BY_ID: &str = "patients";

const MAX_INSTALL_ATTEMPTS: usize = 3;

fn types(doc_types: &[DocumentType]) -> Vec<&'static str> {
    doc_types.iter().map(|t| t.as_str()).collect()
}

/// Sequencer runs by run date.
fn sequencer_runs() -> DesignDocument {
    DesignDocument::new(SEQUENCER_RUNS).with_view(
        ViewSpec::new(ALL, MapBody::emit(Expr::field("parsed.date"), Expr::Doc))
            .for_types(types(&[DocumentType::SequencerRun])),
    )
}

/// Input samples by id.
fn samples() -> DesignDocument {
    DesignDocument::new(SAMPLES).with_view(
        ViewSpec::new(ALL, MapBody::emit(Expr::Id, Expr::Doc))
            .for_types(types(&[DocumentType::SequencerInputSample])),
    )
}

/// Pipeline executions by creation time.
fn pipeline_runs() -> DesignDocument {
    DesignDocument::new(PIPELINE_RUNS).with_view(
        ViewSpec::new(ALL, MapBody::emit(Expr::field("created_time"), Expr::Doc))
            .for_types(types(&[DocumentType::PipelineRun])),
    )
}

fn examinations() -> DesignDocument {
    let examination = types(&[DocumentType::Examination]);

    DesignDocument::new(EXAMINATIONS)
        .with_view(
            ViewSpec::new(
                NEW_EXAMINATIONS,
                MapBody::when(
                    Condition::All(vec![
                        Condition::list_len_eq("pipeline_runs", 0),
                        Condition::list_len_at_least("sequencer_runs", 0),
                    ]),
                    MapBody::emit(Expr::Id, Expr::Doc),
                ),
            )
            .for_types(examination.clone()),
        )
        .with_view(
            ViewSpec::new(COUNT, MapBody::emit(Expr::Id, Expr::literal(1)))
                .for_types(examination.clone())
                .reduce(Reduce::Count),
        )
        .with_view(
            ViewSpec::new(
                BY_STARTED_DATE,
                MapBody::emit(Expr::field("started_date"), Expr::Doc),
            )
            .for_types(examination.clone()),
        )
        .with_view(
            ViewSpec::new(
                BY_SEQUENCER_RUN,
                MapBody::emit_each("sequencer_runs", Expr::Item, Expr::Id),
            )
            .for_types(examination.clone()),
        )
        .with_view(
            ViewSpec::new(
                MP_NUMBER,
                MapBody::when(
                    Condition::one_of(
                        "filemaker_record.Untersuchung",
                        FILEMAKER_EXAMINATION_TYPES.iter().copied(),
                    ),
                    MapBody::emit(
                        Expr::Array(vec![
                            Expr::field("filemaker_record.Jahr"),
                            Expr::field("filemaker_record.Mol_NR"),
                        ]),
                        Expr::Doc,
                    ),
                ),
            )
            .for_types(examination),
        )
}

fn patients() -> DesignDocument {
    let from_examination = MapBody::when(
        Condition::exists("filemaker_record"),
        MapBody::emit(
            Expr::Array(vec![
                Expr::field("filemaker_record.Name"),
                Expr::field("filemaker_record.Vorname"),
                Expr::field("filemaker_record.GBD"),
                Expr::Id,
            ]),
            Expr::Id,
        ),
    );
    let from_patient = MapBody::emit(
        Expr::Array(vec![
            Expr::field("names.lastname"),
            Expr::field("names.firstname"),
            Expr::field("birthdate"),
            Expr::Id,
        ]),
        Expr::Id,
    );

    DesignDocument::new(PATIENTS)
        .with_view(ViewSpec::new(
            PATIENT_AGGREGATION,
            MapBody::ByType(vec![
                (DocumentType::Examination.as_str().into(), from_examination),
                (DocumentType::Patient.as_str().into(), from_patient),
            ]),
        ))
        .with_view(
            ViewSpec::new(PATIENTS_BY_ID, MapBody::emit(Expr::Id, Expr::Doc))
                .for_types(types(&[DocumentType::Patient])),
        )
}

/// Per external record: one `[id, 0] -> 0` row for the record itself and one `[id, 1] -> 1`
/// row per examination created from it. Summing at group level 1 counts linked examinations.
fn filemaker() -> DesignDocument {
    DesignDocument::new(FILEMAKER).with_view(
        ViewSpec::new(
            ALL,
            MapBody::ByType(vec![
                (
                    DocumentType::FilemakerRecord.as_str().into(),
                    MapBody::emit(
                        Expr::Array(vec![Expr::Id, Expr::literal(0)]),
                        Expr::literal(0),
                    ),
                ),
                (
                    DocumentType::Examination.as_str().into(),
                    MapBody::when(
                        Condition::exists("filemaker_record._id"),
                        MapBody::emit(
                            Expr::Array(vec![
                                Expr::field("filemaker_record._id"),
                                Expr::literal(1),
                            ]),
                            Expr::literal(1),
                        ),
                    ),
                ),
            ]),
        )
        .for_types(types(&[
            DocumentType::FilemakerRecord,
            DocumentType::Examination,
        ]))
        .reduce(Reduce::ScriptSum),
    )
}

/// Every design document the application relies on.
pub fn design_documents() -> Vec<DesignDocument> {
    vec![
        sequencer_runs(),
        samples(),
        pipeline_runs(),
        examinations(),
        patients(),
        filemaker(),
    ]
}

// ============================================================================
// BOOTSTRAP
// ============================================================================

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum InstallOutcome {
    Installed,
    Updated,
    Unchanged,
}

/// What a bootstrap run changed.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct BootstrapReport {
    pub installed: Vec<String>,
    pub updated: Vec<String>,
    pub unchanged: Vec<String>,
    pub singletons_created: Vec<String>,
}

impl BootstrapReport {
    /// Number of documents written.
    pub fn writes(&self) -> usize {
        self.installed.len() + self.updated.len() + self.singletons_created.len()
    }
}

/// Installs one design document unless the stored copy already matches it.
///
/// # Errors
///
/// Returns `CoreError::Conflict` if concurrent writers keep replacing the document.
pub async fn install_design_document(
    session: &Session<Initialised>,
    ddoc: &DesignDocument,
) -> CoreResult<InstallOutcome> {
    let id = ddoc.id();

    for attempt in 1..=MAX_INSTALL_ATTEMPTS {
        let (update, outcome) = match session.get_raw(id.as_str()).await {
            Ok(stored) if ddoc.matches_stored(&stored) => return Ok(InstallOutcome::Unchanged),
            Ok(stored) => (ddoc.to_update(raw_rev(&stored)), InstallOutcome::Updated),
            Err(CoreError::NotFound(_)) => (ddoc.to_update(None), InstallOutcome::Installed),
            Err(err) => return Err(err),
        };

        match session.save_raw(update).await {
            Ok(_) => return Ok(outcome),
            Err(CoreError::Conflict(_)) => {
                debug!(%id, attempt, "design document changed concurrently, comparing again");
            }
            Err(err) => return Err(err),
        }
    }

    warn!(%id, "design document kept changing during bootstrap");
    Err(CoreError::Conflict(id.into_string()))
}

/// Installs the index catalog and the application singletons.
///
/// Idempotent: against an up-to-date database it reads but writes nothing.
pub async fn bootstrap(session: &Session<Initialised>) -> CoreResult<BootstrapReport> {
    let mut report = BootstrapReport::default();

    if settings::ensure::<AppState>(session).await? {
        report.singletons_created.push(AppState::ID.into());
    }
    if settings::ensure::<AppSettings>(session).await? {
        report.singletons_created.push(AppSettings::ID.into());
    }

    for ddoc in design_documents() {
        let name = ddoc.name().to_string();
        match install_design_document(session, &ddoc).await? {
            InstallOutcome::Installed => report.installed.push(name),
            InstallOutcome::Updated => report.updated.push(name),
            InstallOutcome::Unchanged => report.unchanged.push(name),
        }
    }

    info!(
        installed = report.installed.len(),
        updated = report.updated.len(),
        unchanged = report.unchanged.len(),
        singletons_created = report.singletons_created.len(),
        "bootstrap finished"
    );
    Ok(report)
}
