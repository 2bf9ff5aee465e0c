//! CouchDB HTTP adapter.
//!
//! Speaks the CouchDB document and view API over `reqwest`. Every call is an independent HTTP
//! request; the adapter holds no per-request state and is safe to share.

use crate::error::{StoreError, StoreResult};
use crate::store::{
    raw_id, BulkSaveResult, DocumentStore, RawDocument, ViewQuery, ViewRow, ID_KEY, REV_KEY,
};
use async_trait::async_trait;
use ngs_types::{Revision, DESIGN_PREFIX};
use reqwest::{Method, RequestBuilder, Response, StatusCode};
use serde::Deserialize;
use serde_json::{json, Value};
use std::time::Duration;
use tracing::{debug, warn};

const MISSING_DATABASE_REASON: &str = "Database does not exist.";

/// Connection settings for a CouchDB database.
#[derive(Clone, Debug)]
pub struct CouchConfig {
    /// Server base URL, for example `http://localhost:5984`.
    pub url: String,
    pub database: String,
    pub username: Option<String>,
    pub password: Option<String>,
    /// Per-request timeout.
    pub timeout: Duration,
}

impl Default for CouchConfig {
    fn default() -> Self {
        Self {
            url: "http://localhost:5984".into(),
            database: "ngs_app".into(),
            username: None,
            password: None,
            timeout: Duration::from_secs(10),
        }
    }
}

#[derive(Deserialize)]
struct WriteResponse {
    id: String,
    rev: String,
}

#[derive(Deserialize)]
struct ViewResponse {
    rows: Vec<ViewRow>,
}

#[derive(Deserialize, Default)]
struct ErrorBody {
    #[serde(default)]
    error: String,
    #[serde(default)]
    reason: String,
}

#[derive(Deserialize)]
struct BulkRow {
    #[serde(default)]
    id: String,
    rev: Option<String>,
    error: Option<String>,
    #[serde(default)]
    reason: String,
}

/// [`DocumentStore`] backed by a CouchDB server.
#[derive(Clone)]
pub struct CouchDbStore {
    config: CouchConfig,
    client: reqwest::Client,
}

impl CouchDbStore {
    /// Builds the HTTP client. No request is made until the first operation.
    pub fn new(config: CouchConfig) -> StoreResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(config.timeout)
            .user_agent("ngs-couch-store/0.1")
            .build()
            .map_err(|e| StoreError::Unavailable(format!("failed to build HTTP client: {e}")))?;
        Ok(Self { config, client })
    }

    fn db_url(&self) -> String {
        format!(
            "{}/{}",
            self.config.url.trim_end_matches('/'),
            urlencoding::encode(&self.config.database)
        )
    }

    fn doc_url(&self, id: &str) -> String {
        match id.strip_prefix(DESIGN_PREFIX) {
            Some(name) => format!("{}/{DESIGN_PREFIX}{}", self.db_url(), urlencoding::encode(name)),
            None => format!("{}/{}", self.db_url(), urlencoding::encode(id)),
        }
    }

    fn request(&self, method: Method, url: &str) -> RequestBuilder {
        let builder = self.client.request(method, url);
        match &self.config.username {
            Some(user) => builder.basic_auth(user, self.config.password.as_deref()),
            None => builder,
        }
    }

    async fn send(&self, builder: RequestBuilder) -> StoreResult<Response> {
        builder.send().await.map_err(transport_error)
    }

    async fn error_for(&self, response: Response, context: &str) -> StoreError {
        let status = response.status();
        let body: ErrorBody = response.json().await.unwrap_or_default();
        status_error(status, body, context, &self.config.database)
    }

    async fn write(&self, builder: RequestBuilder, context: &str) -> StoreResult<WriteResponse> {
        let response = self.send(builder).await?;
        if !response.status().is_success() {
            return Err(self.error_for(response, context).await);
        }
        response
            .json()
            .await
            .map_err(|e| StoreError::Decode(e.to_string()))
    }
}

fn transport_error(err: reqwest::Error) -> StoreError {
    if err.is_timeout() {
        StoreError::Timeout
    } else {
        StoreError::Unavailable(err.to_string())
    }
}

fn status_error(status: StatusCode, body: ErrorBody, context: &str, database: &str) -> StoreError {
    match status {
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => StoreError::Unauthorized,
        StatusCode::NOT_FOUND if body.reason == MISSING_DATABASE_REASON => {
            StoreError::DatabaseMissing(database.to_string())
        }
        StatusCode::NOT_FOUND => StoreError::NotFound(context.to_string()),
        StatusCode::CONFLICT => StoreError::Conflict(context.to_string()),
        StatusCode::REQUEST_TIMEOUT | StatusCode::GATEWAY_TIMEOUT => StoreError::Timeout,
        StatusCode::SERVICE_UNAVAILABLE => StoreError::Unavailable(body.reason),
        _ => StoreError::Http {
            status: status.as_u16(),
            reason: if body.reason.is_empty() {
                body.error
            } else {
                body.reason
            },
        },
    }
}

fn bulk_error(id: &str, error: &str, reason: String) -> StoreError {
    match error {
        "conflict" => StoreError::Conflict(id.to_string()),
        "unauthorized" | "forbidden" => StoreError::Unauthorized,
        _ => StoreError::InvalidDocument(format!("{error}: {reason}")),
    }
}

/// CouchDB query-string parameters for a view query; keys are JSON encoded.
pub fn view_query_params(query: &ViewQuery) -> Vec<(&'static str, String)> {
    let mut params = Vec::new();
    if let Some(key) = &query.key {
        params.push(("key", key.to_string()));
    }
    if let Some(start) = &query.start_key {
        params.push(("startkey", start.to_string()));
    }
    if let Some(end) = &query.end_key {
        params.push(("endkey", end.to_string()));
    }
    if !query.inclusive_end {
        params.push(("inclusive_end", "false".into()));
    }
    if query.descending {
        params.push(("descending", "true".into()));
    }
    if let Some(limit) = query.limit {
        params.push(("limit", limit.to_string()));
    }
    if query.skip > 0 {
        params.push(("skip", query.skip.to_string()));
    }
    if let Some(reduce) = query.reduce {
        params.push(("reduce", reduce.to_string()));
    }
    if query.group {
        params.push(("group", "true".into()));
    }
    if let Some(level) = query.group_level {
        params.push(("group_level", level.to_string()));
    }
    params
}

#[async_trait]
impl DocumentStore for CouchDbStore {
    fn database_name(&self) -> &str {
        &self.config.database
    }

    async fn database_exists(&self) -> StoreResult<bool> {
        let response = self.send(self.request(Method::HEAD, &self.db_url())).await?;
        match response.status() {
            StatusCode::OK => Ok(true),
            StatusCode::NOT_FOUND => Ok(false),
            _ => Err(self.error_for(response, &self.config.database).await),
        }
    }

    async fn create_database(&self) -> StoreResult<()> {
        let response = self.send(self.request(Method::PUT, &self.db_url())).await?;
        match response.status() {
            StatusCode::CREATED | StatusCode::ACCEPTED => {
                debug!(database = %self.config.database, "created database");
                Ok(())
            }
            StatusCode::PRECONDITION_FAILED => Ok(()),
            _ => Err(self.error_for(response, &self.config.database).await),
        }
    }

    async fn get(&self, id: &str) -> StoreResult<RawDocument> {
        let response = self.send(self.request(Method::GET, &self.doc_url(id))).await?;
        if !response.status().is_success() {
            return Err(self.error_for(response, id).await);
        }
        response
            .json()
            .await
            .map_err(|e| StoreError::Decode(e.to_string()))
    }

    async fn save(&self, mut doc: RawDocument) -> StoreResult<RawDocument> {
        let written = match raw_id(&doc).map(str::to_string) {
            Some(id) => {
                let builder = self.request(Method::PUT, &self.doc_url(&id)).json(&doc);
                self.write(builder, &id).await?
            }
            None => {
                let builder = self.request(Method::POST, &self.db_url()).json(&doc);
                self.write(builder, "<new document>").await?
            }
        };
        debug!(id = %written.id, rev = %written.rev, "saved document");
        doc.insert(ID_KEY.into(), Value::String(written.id));
        doc.insert(REV_KEY.into(), Value::String(written.rev));
        Ok(doc)
    }

    async fn save_bulk(&self, docs: Vec<RawDocument>) -> StoreResult<Vec<BulkSaveResult>> {
        let url = format!("{}/_bulk_docs", self.db_url());
        let response = self
            .send(self.request(Method::POST, &url).json(&json!({ "docs": docs })))
            .await?;
        if !response.status().is_success() {
            return Err(self.error_for(response, "_bulk_docs").await);
        }
        let rows: Vec<BulkRow> = response
            .json()
            .await
            .map_err(|e| StoreError::Decode(e.to_string()))?;

        Ok(rows
            .into_iter()
            .map(|row| {
                let outcome = match (row.rev, row.error) {
                    (_, Some(error)) => {
                        warn!(id = %row.id, error = %error, "bulk save rejected document");
                        Err(bulk_error(&row.id, &error, row.reason))
                    }
                    (Some(rev), None) => {
                        Revision::parse(rev).map_err(|e| StoreError::Decode(e.to_string()))
                    }
                    (None, None) => Err(StoreError::Decode("bulk row without rev".into())),
                };
                BulkSaveResult {
                    id: row.id,
                    outcome,
                }
            })
            .collect())
    }

    async fn delete(&self, id: &str, rev: &Revision) -> StoreResult<Revision> {
        let builder = self
            .request(Method::DELETE, &self.doc_url(id))
            .query(&[("rev", rev.as_str())]);
        let written = self.write(builder, id).await?;
        Revision::parse(written.rev).map_err(|e| StoreError::Decode(e.to_string()))
    }

    async fn query(
        &self,
        design: &str,
        view: &str,
        query: &ViewQuery,
    ) -> StoreResult<Vec<ViewRow>> {
        let url = format!(
            "{}/{DESIGN_PREFIX}{}/_view/{}",
            self.db_url(),
            urlencoding::encode(design),
            urlencoding::encode(view)
        );
        let context = format!("{DESIGN_PREFIX}{design}/_view/{view}");
        let response = self
            .send(self.request(Method::GET, &url).query(&view_query_params(query)))
            .await?;
        if !response.status().is_success() {
            return Err(self.error_for(response, &context).await);
        }
        let body: ViewResponse = response
            .json()
            .await
            .map_err(|e| StoreError::Decode(e.to_string()))?;
        Ok(body.rows)
    }
}
