//! Pipeline control: progress reporting and hand-off to the out-of-process worker.
//!
//! Progress lives in the `pipeline_state` singleton. Starting the pipeline resets it to 0,
//! records a running [`PipelineRun`] and spawns the configured command; when the command exits
//! the run gets its status and logs and progress is set to 100.

use crate::catalog::{ALL, PIPELINE_RUNS};
use crate::config::CoreConfig;
use crate::constants::PIPELINE_STATE_ID;
use crate::document::{
    Document, DocumentBody, PipelineLogs, PipelineRun, PipelineState, PipelineStatus,
};
use crate::session::{Initialised, Session};
use crate::{CoreError, CoreResult};
use chrono::Utc;
use couch_store::{DocumentStore, ViewQuery};
use ngs_types::DocId;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::process::Command;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

/// Handle of a started pipeline execution.
#[derive(Debug)]
pub struct PipelineHandle {
    pub run_id: DocId,
    /// Resolves once the worker exited and its outcome was recorded.
    pub completion: JoinHandle<CoreResult<PipelineStatus>>,
}

/// Pipeline operations over a document store.
#[derive(Clone)]
pub struct PipelineService {
    cfg: Arc<CoreConfig>,
    store: Arc<dyn DocumentStore>,
}

fn state_id() -> CoreResult<DocId> {
    DocId::new(PIPELINE_STATE_ID).map_err(|e| CoreError::InvalidInput(e.to_string()))
}

impl PipelineService {
    pub fn new(cfg: Arc<CoreConfig>, store: Arc<dyn DocumentStore>) -> Self {
        Self { cfg, store }
    }

    async fn session(&self) -> CoreResult<Session<Initialised>> {
        Session::new(self.store.clone()).connect().await
    }

    /// Progress of the current execution in percent.
    ///
    /// Any failure to read it, including a missing or malformed state document, reads as 0.
    pub async fn fetch_progress(&self) -> u8 {
        let result: CoreResult<u8> = async {
            let session = self.session().await?;
            let doc = session.get(&state_id()?).await?;
            doc.as_pipeline_state()
                .map(|s| s.progress.min(100))
                .ok_or_else(|| {
                    CoreError::validation("document_type", "pipeline_state is not a progress document")
                })
        }
        .await;

        match result {
            Ok(progress) => progress,
            Err(err) => {
                warn!(error = %err, "could not read pipeline progress");
                0
            }
        }
    }

    /// Every recorded execution, oldest first.
    pub async fn runs(&self) -> CoreResult<Vec<Document>> {
        self.session()
            .await?
            .view_documents(PIPELINE_RUNS, ALL, &ViewQuery::new())
            .await
    }

    /// Starts the worker on the given inputs and returns without waiting for it.
    ///
    /// # Errors
    ///
    /// Returns an error if the start could not be recorded; the worker is then not spawned.
    pub async fn start(&self, input_samples: Vec<PathBuf>) -> CoreResult<PipelineHandle> {
        let session = self.session().await?;
        write_progress(&session, 0, false).await?;

        let run = Document::create(DocumentBody::PipelineRun(PipelineRun {
            created_time: Utc::now(),
            input_samples,
            workflow: self.cfg.workflow().to_string(),
            status: PipelineStatus::Running,
            logs: PipelineLogs::default(),
        }));
        let run = session.save(&run).await?;
        let run_id = run.id().clone();
        info!(run = %run_id, command = ?self.cfg.pipeline_command(), "starting pipeline");

        let command = self.cfg.pipeline_command().to_vec();
        let completion = tokio::spawn(async move { run_worker(session, run, command).await });

        Ok(PipelineHandle { run_id, completion })
    }

    /// Stopping a running worker is not supported; the request is acknowledged and ignored.
    pub async fn stop(&self) -> CoreResult<()> {
        info!("pipeline stop requested; running workers are left to finish");
        Ok(())
    }
}

async fn run_worker(
    session: Session<Initialised>,
    run: Document,
    command: Vec<String>,
) -> CoreResult<PipelineStatus> {
    let (program, args) = command
        .split_first()
        .ok_or_else(|| CoreError::InvalidInput("pipeline command is empty".into()))?;

    let (status, logs) = match Command::new(program).args(args).output().await {
        Ok(output) => {
            let logs = PipelineLogs {
                stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
                stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
            };
            if output.status.success() {
                (PipelineStatus::Successful, logs)
            } else {
                warn!(run = %run.id(), status = %output.status, "pipeline worker failed");
                (PipelineStatus::Error, logs)
            }
        }
        Err(err) => {
            error!(run = %run.id(), error = %err, "could not spawn pipeline worker");
            (
                PipelineStatus::Error,
                PipelineLogs {
                    stdout: String::new(),
                    stderr: err.to_string(),
                },
            )
        }
    };

    session
        .update(run.id(), |doc| match doc.as_pipeline_run() {
            Some(current) => {
                let finished = PipelineRun {
                    status,
                    logs: logs.clone(),
                    ..current.clone()
                };
                Ok(doc.with_body(DocumentBody::PipelineRun(finished)))
            }
            None => Err(CoreError::validation(
                "document_type",
                format!("{} is not a pipeline run", doc.id()),
            )),
        })
        .await?;

    write_progress(&session, 100, true).await?;
    info!(run = %run.id(), ?status, "pipeline finished");
    Ok(status)
}

/// Writes the progress singleton, creating it on first use.
async fn write_progress(
    session: &Session<Initialised>,
    progress: u8,
    finished: bool,
) -> CoreResult<()> {
    let id = state_id()?;
    let body = DocumentBody::PipelineState(PipelineState {
        progress,
        finish_time: finished.then(Utc::now),
    });

    match session.get_raw(id.as_str()).await {
        Ok(_) => {
            session
                .update(&id, |doc| Ok(doc.with_body(body.clone())))
                .await?;
        }
        Err(CoreError::NotFound(_)) => {
            session.save(&Document::new(id, body)).await?;
        }
        Err(err) => return Err(err),
    }
    Ok(())
}
