//! Indexing of sequencer output folders.
//!
//! Each sub-directory of the sequencer output directory is one run, named
//! `YYMMDD_<device>_<run number>_<flowcell>` by the instrument. Folders that break the
//! convention are still indexed, flagged `name_dirty` with empty metadata.

use crate::catalog::{ALL, SEQUENCER_RUNS};
use crate::document::{Document, DocumentBody, RunMetadata, SequencerRun};
use crate::session::{Initialised, Session};
use crate::{CoreError, CoreResult};
use chrono::{DateTime, Utc};
use couch_store::ViewQuery;
use regex::Regex;
use serde_json::Value;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;
use tracing::{info, warn};

static RUN_NAME: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"^(?P<date>\d{6})_(?P<device>[A-Za-z]+\d+)_(?P<run_number>\d{4})_(?P<flowcell>[0-9A-Za-z]+(?:-[0-9A-Za-z]+)?)$",
    )
    .expect("run name pattern is valid")
});

/// Splits a run folder name into its parts; `None` if it breaks the naming convention.
pub fn parse_run_name(name: &str) -> Option<RunMetadata> {
    let caps = RUN_NAME.captures(name)?;
    Some(RunMetadata {
        date: Some(caps["date"].to_string()),
        device: Some(caps["device"].to_string()),
        run_number: Some(caps["run_number"].to_string()),
        flowcell_barcode: Some(caps["flowcell"].to_string()),
    })
}

/// Builds the document for a run folder. It starts dirty, awaiting reconciliation.
pub fn sequencer_run(path: &Path, indexed_time: DateTime<Utc>) -> Document {
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();

    let (parsed, name_dirty) = match parse_run_name(&name) {
        Some(parsed) => (parsed, false),
        None => {
            warn!(run = %name, "run folder name does not follow the sequencer convention");
            (RunMetadata::default(), true)
        }
    };

    Document::create(DocumentBody::SequencerRun(SequencerRun {
        original_path: path.to_path_buf(),
        name_dirty,
        parsed,
        indexed_time,
        state: "unfinished".into(),
        outputs: Vec::new(),
    }))
}

/// Lists run folders directly under `dir`, sorted by name.
pub fn list_run_directories(dir: &Path) -> CoreResult<Vec<PathBuf>> {
    let mut runs = Vec::new();
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        if entry.file_type()?.is_dir() {
            runs.push(entry.path());
        }
    }
    runs.sort();
    Ok(runs)
}

/// Every indexed sequencer run, in run-date order.
pub async fn indexed_runs(session: &Session<Initialised>) -> CoreResult<Vec<Document>> {
    session
        .view_documents(SEQUENCER_RUNS, ALL, &ViewQuery::new())
        .await
}

/// Names of all indexed runs, in run-date order.
pub async fn run_names(session: &Session<Initialised>) -> CoreResult<Vec<String>> {
    Ok(indexed_runs(session)
        .await?
        .iter()
        .filter_map(|doc| doc.as_sequencer_run()?.name().map(str::to_string))
        .collect())
}

async fn indexed_paths(session: &Session<Initialised>) -> CoreResult<HashSet<PathBuf>> {
    let values = session
        .view_values(SEQUENCER_RUNS, ALL, &ViewQuery::new())
        .await?;
    Ok(values
        .iter()
        .filter_map(|v| v.get("original_path").and_then(Value::as_str))
        .map(PathBuf::from)
        .collect())
}

/// What one indexing pass did.
#[derive(Debug, Default)]
pub struct IndexReport {
    pub indexed: Vec<String>,
    /// Indexed, but flagged because the name could not be parsed.
    pub dirty: Vec<String>,
    pub already_indexed: usize,
    pub failed: Vec<(String, CoreError)>,
}

/// Indexes run folders under `dir` that are not indexed yet.
///
/// New runs are written in one bulk save; a run the store rejects is reported in
/// `failed` and does not stop the others.
pub async fn index_sequencer_output(
    session: &Session<Initialised>,
    dir: &Path,
) -> CoreResult<IndexReport> {
    let known = indexed_paths(session).await?;
    let now = Utc::now();
    let mut report = IndexReport::default();

    let mut docs = Vec::new();
    for path in list_run_directories(dir)? {
        if known.contains(&path) {
            report.already_indexed += 1;
            continue;
        }
        docs.push(sequencer_run(&path, now));
    }

    if docs.is_empty() {
        return Ok(report);
    }

    let outcomes = session.save_bulk(&docs).await?;
    for (doc, outcome) in docs.iter().zip(outcomes) {
        let Some(run) = doc.as_sequencer_run() else {
            continue;
        };
        let name = run.name().unwrap_or_default().to_string();
        match outcome.result {
            Ok(_) if run.name_dirty => report.dirty.push(name),
            Ok(_) => report.indexed.push(name),
            Err(err) => report.failed.push((name, err)),
        }
    }

    info!(
        dir = %dir.display(),
        indexed = report.indexed.len(),
        dirty = report.dirty.len(),
        already_indexed = report.already_indexed,
        failed = report.failed.len(),
        "indexed sequencer output"
    );
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::{bootstrap, design_documents};
    use couch_store::{DocumentStore, MemoryStore};
    use std::sync::Arc;

    async fn session() -> Session<Initialised> {
        let store: Arc<dyn DocumentStore> = Arc::new(
            MemoryStore::with_database("ngs_test").with_design_documents(design_documents()),
        );
        let session = Session::new(store).connect().await.expect("database exists");
        bootstrap(&session).await.expect("bootstrap");
        session
    }

    #[test]
    fn conventional_name_is_parsed() {
        let parsed = parse_run_name("220101_M00000_0000_000000000-AAAAA").expect("valid name");
        assert_eq!(parsed.date.as_deref(), Some("220101"));
        assert_eq!(parsed.device.as_deref(), Some("M00000"));
        assert_eq!(parsed.run_number.as_deref(), Some("0000"));
        assert_eq!(parsed.flowcell_barcode.as_deref(), Some("000000000-AAAAA"));
    }

    #[test]
    fn unconventional_names_are_rejected() {
        for name in ["not_a_valid_name", "2201_M00000_0000_X", "220101_M00000_12_X", ""] {
            assert!(parse_run_name(name).is_none(), "{name:?} should not parse");
        }
    }

    #[test]
    fn dirty_run_has_empty_metadata() {
        let doc = sequencer_run(Path::new("/data/miseq/not_a_valid_name"), Utc::now());
        let run = doc.as_sequencer_run().unwrap();
        assert!(run.name_dirty);
        assert!(run.parsed.is_empty());
        assert!(doc.needs_reconciliation());

        let stored = doc.to_storage_form().unwrap();
        assert_eq!(stored["parsed"], serde_json::json!({}));
    }

    #[tokio::test]
    async fn indexing_keeps_going_past_bad_names_and_skips_known_runs() {
        let dir = tempfile::tempdir().expect("tempdir");
        std::fs::create_dir(dir.path().join("220101_M00000_0000_000000000-AAAAA")).unwrap();
        std::fs::create_dir(dir.path().join("not_a_valid_name")).unwrap();
        std::fs::write(dir.path().join("SampleSheet.csv"), "not a run").unwrap();

        let session = session().await;
        let report = index_sequencer_output(&session, dir.path())
            .await
            .expect("indexing");
        assert_eq!(report.indexed, vec!["220101_M00000_0000_000000000-AAAAA"]);
        assert_eq!(report.dirty, vec!["not_a_valid_name"]);
        assert!(report.failed.is_empty());

        // Unparsed runs have a null date and collate first.
        let names = run_names(&session).await.unwrap();
        assert_eq!(
            names,
            vec!["not_a_valid_name", "220101_M00000_0000_000000000-AAAAA"]
        );

        let again = index_sequencer_output(&session, dir.path()).await.unwrap();
        assert_eq!(again.already_indexed, 2);
        assert!(again.indexed.is_empty() && again.dirty.is_empty());
        assert_eq!(indexed_runs(&session).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn missing_directory_is_an_io_error() {
        let session = session().await;
        let err = index_sequencer_output(&session, Path::new("/nonexistent/miseq"))
            .await
            .unwrap_err();
        assert!(matches!(err, CoreError::Io(_)));
    }
}
