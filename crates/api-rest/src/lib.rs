//! # API REST
//!
//! REST API for the NGS run tracker.
//!
//! Handles:
//! - HTTP endpoints with axum
//! - OpenAPI/Swagger documentation
//! - REST-specific concerns (JSON serialization, CORS, status codes)
//!
//! All domain behaviour lives in `ngs-core`; handlers only translate.

#![warn(rust_2018_idioms)]

use axum::{
    extract::{Path as AxumPath, State},
    http::StatusCode,
    response::Json,
    routing::{get, post},
    Router,
};
use couch_store::DocumentStore;
use ngs_core::{
    consistency::{self, ReferenceProblem},
    constants::PIPELINE_VERSION,
    records, sequencer, CoreConfig, CoreError, Document, Initialised, PipelineService, Session,
};
use ngs_types::DocId;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use utoipa::{OpenApi, ToSchema};
use utoipa_swagger_ui::SwaggerUi;

/// Application state for the REST API server.
///
/// Holds the resolved configuration and the shared store handle; every request opens its own
/// session on top of it.
#[derive(Clone)]
pub struct ApiState {
    cfg: Arc<CoreConfig>,
    store: Arc<dyn DocumentStore>,
    pipeline: PipelineService,
}

impl ApiState {
    pub fn new(cfg: Arc<CoreConfig>, store: Arc<dyn DocumentStore>) -> Self {
        Self {
            pipeline: PipelineService::new(cfg.clone(), store.clone()),
            cfg,
            store,
        }
    }

    async fn session(&self) -> Result<Session<Initialised>, ApiError> {
        Session::new(self.store.clone())
            .connect()
            .await
            .map_err(reject)
    }
}

type ApiError = (StatusCode, &'static str);

/// Maps a core error to a response status, logging the detail server-side.
fn reject(err: CoreError) -> ApiError {
    let response = match &err {
        CoreError::NotInitialized(_) => (StatusCode::SERVICE_UNAVAILABLE, "Database not initialised"),
        CoreError::NotFound(_) => (StatusCode::NOT_FOUND, "Not found"),
        CoreError::Conflict(_) => (StatusCode::CONFLICT, "Document changed concurrently"),
        CoreError::Validation { .. } | CoreError::InvalidInput(_) => {
            (StatusCode::BAD_REQUEST, "Invalid request")
        }
        CoreError::StoreUnavailable(_) | CoreError::Timeout => {
            (StatusCode::SERVICE_UNAVAILABLE, "Document store unavailable")
        }
        _ => (StatusCode::INTERNAL_SERVER_ERROR, "Internal error"),
    };
    tracing::error!(status = %response.0, error = %err, "request failed");
    response
}

fn parse_id(raw: &str) -> Result<DocId, ApiError> {
    DocId::new(raw).map_err(|_| (StatusCode::BAD_REQUEST, "Invalid document id"))
}

// ============================================================================
// DTOS
// ============================================================================

#[derive(Serialize, Deserialize, ToSchema)]
pub struct HealthRes {
    pub ok: bool,
    pub message: String,
    pub pipeline_version: String,
}

#[derive(Serialize, Deserialize, ToSchema)]
pub struct ProgressRes {
    /// Percent complete, 0 to 100.
    pub progress: u8,
}

#[derive(Serialize, Deserialize, Default, ToSchema)]
pub struct StartPipelineReq {
    #[serde(default)]
    pub input_samples: Vec<String>,
}

#[derive(Serialize, Deserialize, ToSchema)]
pub struct StartPipelineRes {
    pub run_id: String,
}

#[derive(Serialize, Deserialize, ToSchema)]
pub struct AckRes {
    pub ok: bool,
}

#[derive(Serialize, Deserialize, ToSchema)]
pub struct RunNamesRes {
    pub runs: Vec<String>,
}

#[derive(Serialize, Deserialize, ToSchema)]
pub struct IndexRunsRes {
    pub indexed: Vec<String>,
    pub dirty: Vec<String>,
    pub already_indexed: usize,
    pub failed: Vec<String>,
}

#[derive(Serialize, Deserialize, ToSchema)]
pub struct ExaminationSummary {
    pub id: String,
    pub examinationtype: String,
    pub started_date: String,
    pub sequencer_runs: Vec<String>,
    pub patient: Option<String>,
}

#[derive(Serialize, Deserialize, ToSchema)]
pub struct ExaminationsRes {
    pub count: u64,
    pub examinations: Vec<ExaminationSummary>,
}

#[derive(Serialize, Deserialize, ToSchema)]
pub struct LinkRes {
    pub patient_id: String,
    pub examination_id: String,
}

#[derive(Serialize, Deserialize, ToSchema)]
pub struct DanglingReferenceRes {
    pub owner: String,
    pub field: String,
    pub target: String,
    pub problem: String,
}

#[derive(Serialize, Deserialize, ToSchema)]
pub struct ReferencesRes {
    pub dangling: Vec<DanglingReferenceRes>,
}

#[derive(Serialize, Deserialize, ToSchema)]
pub struct LinkageRes {
    pub record_id: String,
    pub record_present: bool,
    pub examinations: u64,
}

fn summarise(doc: &Document) -> Option<ExaminationSummary> {
    let exam = doc.as_examination()?;
    Some(ExaminationSummary {
        id: doc.id().to_string(),
        examinationtype: exam.examination_type.clone(),
        started_date: exam.started_date.to_rfc3339(),
        sequencer_runs: exam.sequencer_runs.iter().map(ToString::to_string).collect(),
        patient: exam.patient.as_ref().map(ToString::to_string),
    })
}

fn describe(problem: &ReferenceProblem) -> String {
    match problem {
        ReferenceProblem::Missing => "missing".into(),
        ReferenceProblem::Deleted => "deleted".into(),
        ReferenceProblem::WrongType { found } => format!("wrong type: {found}"),
        ReferenceProblem::Unreadable { reason } => format!("unreadable: {reason}"),
    }
}

// ============================================================================
// ROUTER
// ============================================================================

#[derive(OpenApi)]
#[openapi(
    paths(
        health,
        pipeline_progress,
        start_pipeline,
        stop_pipeline,
        list_sequencer_runs,
        index_sequencer_runs,
        new_examinations,
        link_patient_examination,
        check_references,
        filemaker_linkage,
    ),
    components(schemas(
        HealthRes,
        ProgressRes,
        StartPipelineReq,
        StartPipelineRes,
        AckRes,
        RunNamesRes,
        IndexRunsRes,
        ExaminationSummary,
        ExaminationsRes,
        LinkRes,
        DanglingReferenceRes,
        ReferencesRes,
        LinkageRes,
    ))
)]
pub struct ApiDoc;

/// Builds the REST router with Swagger UI and permissive CORS.
pub fn router(state: ApiState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/pipeline/progress", get(pipeline_progress))
        .route("/pipeline/start", post(start_pipeline))
        .route("/pipeline/stop", post(stop_pipeline))
        .route("/sequencer-runs", get(list_sequencer_runs))
        .route("/sequencer-runs/index", post(index_sequencer_runs))
        .route("/examinations/new", get(new_examinations))
        .route(
            "/patients/:patient_id/examinations/:examination_id",
            post(link_patient_examination),
        )
        .route("/consistency/references", get(check_references))
        .route("/filemaker/linkage", get(filemaker_linkage))
        .merge(
            SwaggerUi::new("/swagger-ui/{_:.*}").url("/api-docs/openapi.json", ApiDoc::openapi()),
        )
        .layer(CorsLayer::permissive())
        .with_state(state)
}

// ============================================================================
// HANDLERS
// ============================================================================

#[utoipa::path(
    get,
    path = "/health",
    responses(
        (status = 200, description = "Health check response", body = HealthRes)
    )
)]
/// Health check endpoint for monitoring and load balancers.
#[axum::debug_handler]
async fn health(State(_state): State<ApiState>) -> Json<HealthRes> {
    Json(HealthRes {
        ok: true,
        message: "NGS REST API is alive".into(),
        pipeline_version: PIPELINE_VERSION.into(),
    })
}

#[utoipa::path(
    get,
    path = "/pipeline/progress",
    responses(
        (status = 200, description = "Current pipeline progress", body = ProgressRes)
    )
)]
/// Current pipeline progress.
///
/// Never fails: an unreadable progress reads as 0.
#[axum::debug_handler]
async fn pipeline_progress(State(state): State<ApiState>) -> Json<ProgressRes> {
    Json(ProgressRes {
        progress: state.pipeline.fetch_progress().await,
    })
}

#[utoipa::path(
    post,
    path = "/pipeline/start",
    request_body = StartPipelineReq,
    responses(
        (status = 202, description = "Pipeline started", body = StartPipelineRes),
        (status = 503, description = "Database not initialised or store unavailable"),
        (status = 500, description = "Internal server error")
    )
)]
/// Start the analysis pipeline without waiting for it to finish.
#[axum::debug_handler]
async fn start_pipeline(
    State(state): State<ApiState>,
    Json(req): Json<StartPipelineReq>,
) -> Result<(StatusCode, Json<StartPipelineRes>), ApiError> {
    let inputs = req.input_samples.into_iter().map(PathBuf::from).collect();
    let handle = state.pipeline.start(inputs).await.map_err(reject)?;
    Ok((
        StatusCode::ACCEPTED,
        Json(StartPipelineRes {
            run_id: handle.run_id.to_string(),
        }),
    ))
}

#[utoipa::path(
    post,
    path = "/pipeline/stop",
    responses(
        (status = 200, description = "Stop acknowledged", body = AckRes)
    )
)]
/// Stop the pipeline. Acknowledged, but running workers are left to finish.
#[axum::debug_handler]
async fn stop_pipeline(State(state): State<ApiState>) -> Result<Json<AckRes>, ApiError> {
    state.pipeline.stop().await.map_err(reject)?;
    Ok(Json(AckRes { ok: true }))
}

#[utoipa::path(
    get,
    path = "/sequencer-runs",
    responses(
        (status = 200, description = "Known sequencer run names", body = RunNamesRes),
        (status = 503, description = "Database not initialised or store unavailable")
    )
)]
#[axum::debug_handler]
async fn list_sequencer_runs(State(state): State<ApiState>) -> Result<Json<RunNamesRes>, ApiError> {
    let session = state.session().await?;
    let runs = sequencer::run_names(&session).await.map_err(reject)?;
    Ok(Json(RunNamesRes { runs }))
}

#[utoipa::path(
    post,
    path = "/sequencer-runs/index",
    responses(
        (status = 200, description = "Sequencer output indexed", body = IndexRunsRes),
        (status = 400, description = "No sequencer output directory configured"),
        (status = 500, description = "Internal server error")
    )
)]
/// Index run folders in the configured sequencer output directory.
#[axum::debug_handler]
async fn index_sequencer_runs(
    State(state): State<ApiState>,
) -> Result<Json<IndexRunsRes>, ApiError> {
    let Some(dir) = state.cfg.sequencer_output_dir() else {
        return Err((
            StatusCode::BAD_REQUEST,
            "No sequencer output directory configured",
        ));
    };
    let session = state.session().await?;
    let report = sequencer::index_sequencer_output(&session, dir)
        .await
        .map_err(reject)?;
    Ok(Json(IndexRunsRes {
        indexed: report.indexed,
        dirty: report.dirty,
        already_indexed: report.already_indexed,
        failed: report
            .failed
            .into_iter()
            .map(|(name, err)| format!("{name}: {err}"))
            .collect(),
    }))
}

#[utoipa::path(
    get,
    path = "/examinations/new",
    responses(
        (status = 200, description = "Examinations awaiting the pipeline", body = ExaminationsRes),
        (status = 503, description = "Database not initialised or store unavailable")
    )
)]
#[axum::debug_handler]
async fn new_examinations(
    State(state): State<ApiState>,
) -> Result<Json<ExaminationsRes>, ApiError> {
    let session = state.session().await?;
    let docs = records::new_examinations(&session).await.map_err(reject)?;
    let examinations: Vec<ExaminationSummary> = docs.iter().filter_map(summarise).collect();
    Ok(Json(ExaminationsRes {
        count: examinations.len() as u64,
        examinations,
    }))
}

#[utoipa::path(
    post,
    path = "/patients/{patient_id}/examinations/{examination_id}",
    params(
        ("patient_id" = String, Path, description = "Patient document id"),
        ("examination_id" = String, Path, description = "Examination document id")
    ),
    responses(
        (status = 200, description = "Patient and examination linked", body = LinkRes),
        (status = 400, description = "Bad request"),
        (status = 404, description = "Document not found"),
        (status = 409, description = "Document changed concurrently")
    )
)]
/// Link a patient and an examination in both directions.
#[axum::debug_handler]
async fn link_patient_examination(
    State(state): State<ApiState>,
    AxumPath((patient_id, examination_id)): AxumPath<(String, String)>,
) -> Result<Json<LinkRes>, ApiError> {
    let patient_id = parse_id(&patient_id)?;
    let examination_id = parse_id(&examination_id)?;
    let session = state.session().await?;
    let (patient, examination) =
        records::link_patient_examination(&session, &patient_id, &examination_id)
            .await
            .map_err(reject)?;
    Ok(Json(LinkRes {
        patient_id: patient.id().to_string(),
        examination_id: examination.id().to_string(),
    }))
}

#[utoipa::path(
    get,
    path = "/consistency/references",
    responses(
        (status = 200, description = "Dangling document references", body = ReferencesRes),
        (status = 503, description = "Database not initialised or store unavailable")
    )
)]
#[axum::debug_handler]
async fn check_references(State(state): State<ApiState>) -> Result<Json<ReferencesRes>, ApiError> {
    let session = state.session().await?;
    let dangling = consistency::check_references(&session)
        .await
        .map_err(reject)?
        .into_iter()
        .map(|d| DanglingReferenceRes {
            owner: d.owner.to_string(),
            field: d.field.to_string(),
            target: d.target.to_string(),
            problem: describe(&d.problem),
        })
        .collect();
    Ok(Json(ReferencesRes { dangling }))
}

#[utoipa::path(
    get,
    path = "/filemaker/linkage",
    responses(
        (status = 200, description = "Examinations per external record", body = [LinkageRes]),
        (status = 503, description = "Database not initialised or store unavailable")
    )
)]
#[axum::debug_handler]
async fn filemaker_linkage(State(state): State<ApiState>) -> Result<Json<Vec<LinkageRes>>, ApiError> {
    let session = state.session().await?;
    let linkage = records::filemaker_linkage(&session)
        .await
        .map_err(reject)?
        .into_iter()
        .map(|l| LinkageRes {
            record_id: l.record_id,
            record_present: l.record_present,
            examinations: l.examinations,
        })
        .collect();
    Ok(Json(linkage))
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::{to_bytes, Body};
    use axum::http::Request;
    use ngs_core::catalog::bootstrap;
    use ngs_core::document::{DocumentBody, Examination, Patient};
    use serde::de::DeserializeOwned;
    use tower::ServiceExt;

    async fn state(bootstrapped: bool) -> ApiState {
        let cfg = Arc::new(CoreConfig::demo());
        let store = cfg.open_store().expect("memory store");
        if bootstrapped {
            let session = Session::new(store.clone()).connect().await.expect("connect");
            bootstrap(&session).await.expect("bootstrap");
        }
        ApiState::new(cfg, store)
    }

    async fn call<T: DeserializeOwned>(
        app: Router,
        method: &str,
        uri: &str,
        body: Option<&str>,
    ) -> (StatusCode, Option<T>) {
        let mut request = Request::builder().method(method).uri(uri);
        if body.is_some() {
            request = request.header("content-type", "application/json");
        }
        let request = request
            .body(body.map(|b| Body::from(b.to_string())).unwrap_or_else(Body::empty))
            .expect("request");
        let response = app.oneshot(request).await.expect("response");
        let status = response.status();
        let bytes = to_bytes(response.into_body(), usize::MAX).await.expect("body");
        (status, serde_json::from_slice(&bytes).ok())
    }

    #[tokio::test]
    async fn health_reports_alive() {
        let app = router(state(true).await);
        let (status, body) = call::<HealthRes>(app, "GET", "/health", None).await;
        assert_eq!(status, StatusCode::OK);
        let body = body.expect("json body");
        assert!(body.ok);
        assert_eq!(body.pipeline_version, PIPELINE_VERSION);
    }

    #[tokio::test]
    async fn progress_starts_at_zero() {
        let app = router(state(true).await);
        let (status, body) = call::<ProgressRes>(app, "GET", "/pipeline/progress", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body.expect("json body").progress, 0);
    }

    #[tokio::test]
    async fn start_then_stop_pipeline() {
        let app = router(state(true).await);
        let (status, body) = call::<StartPipelineRes>(
            app.clone(),
            "POST",
            "/pipeline/start",
            Some(r#"{"input_samples": ["/in/s1.fastq"]}"#),
        )
        .await;
        assert_eq!(status, StatusCode::ACCEPTED);
        assert!(!body.expect("json body").run_id.is_empty());

        let (status, body) = call::<AckRes>(app, "POST", "/pipeline/stop", None).await;
        assert_eq!(status, StatusCode::OK);
        assert!(body.expect("json body").ok);
    }

    #[tokio::test]
    async fn uninitialised_database_is_unavailable() {
        let cfg = Arc::new(CoreConfig::demo());
        let store: Arc<dyn DocumentStore> = Arc::new(couch_store::MemoryStore::new("ngs_app"));
        let app = router(ApiState::new(cfg, store));
        let (status, _) = call::<serde_json::Value>(app, "GET", "/sequencer-runs", None).await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    }

    #[tokio::test]
    async fn indexing_without_directory_is_a_bad_request() {
        let app = router(state(true).await);
        let (status, _) =
            call::<serde_json::Value>(app, "POST", "/sequencer-runs/index", None).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn link_and_list_new_examinations() {
        let state = state(true).await;
        let session = state.session().await.expect("session");
        let patient = session
            .save(&Document::create(DocumentBody::Patient(Patient::default())))
            .await
            .unwrap();
        let exam = session
            .save(&Document::create(DocumentBody::Examination(Examination::new(
                "RNA Fusion Lunge",
                chrono::Utc::now(),
            ))))
            .await
            .unwrap();
        let app = router(state);

        let uri = format!("/patients/{}/examinations/{}", patient.id(), exam.id());
        let (status, body) = call::<LinkRes>(app.clone(), "POST", &uri, None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body.expect("json body").examination_id, exam.id().to_string());

        let (status, body) = call::<ExaminationsRes>(app.clone(), "GET", "/examinations/new", None).await;
        assert_eq!(status, StatusCode::OK);
        let body = body.expect("json body");
        assert_eq!(body.count, 1);
        assert_eq!(body.examinations[0].patient.as_deref(), Some(patient.id().as_str()));

        let (status, body) =
            call::<ReferencesRes>(app, "GET", "/consistency/references", None).await;
        assert_eq!(status, StatusCode::OK);
        assert!(body.expect("json body").dangling.is_empty());
    }

    #[tokio::test]
    async fn linking_unknown_documents_is_not_found() {
        let app = router(state(true).await);
        let (status, _) = call::<serde_json::Value>(
            app,
            "POST",
            "/patients/nobody/examinations/nothing",
            None,
        )
        .await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }
}
