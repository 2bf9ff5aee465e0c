//! Core runtime configuration.
//!
//! Configuration is resolved once at process startup and then passed into core services behind
//! an `Arc`. Request handling never reads process-wide environment variables; binaries hand a
//! lookup function to [`CoreConfig::from_lookup`] instead.

use crate::catalog;
use crate::constants::{
    DEFAULT_COUCHDB_URL, DEFAULT_DATABASE_NAME, DEFAULT_PIPELINE_COMMAND,
    DEFAULT_STORE_TIMEOUT_SECS, DEFAULT_WORKFLOW,
};
use crate::validation::{validate_database_name, validate_pipeline_command};
use crate::{CoreError, CoreResult};
use couch_store::{CouchConfig, CouchDbStore, DocumentStore, MemoryStore};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

/// Which document store implementation backs the application.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum StoreBackend {
    #[default]
    CouchDb,
    /// Process-local store; contents are lost on exit.
    Memory,
}

impl FromStr for StoreBackend {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "couchdb" | "couch" => Ok(StoreBackend::CouchDb),
            "memory" | "mem" => Ok(StoreBackend::Memory),
            other => Err(CoreError::InvalidInput(format!(
                "unknown store backend '{other}' (expected 'couchdb' or 'memory')"
            ))),
        }
    }
}

/// Shape of the JSON configuration file deployed on lab workstations.
#[derive(Debug, Deserialize)]
pub struct ConfigFile {
    pub couchdb_user: Option<String>,
    pub couchdb_psw: Option<String>,
    /// Host name only; the CouchDB port is implied.
    pub couchdb_host: Option<String>,
    pub miseq_output_folder: Option<PathBuf>,
    pub ngs_pipeline_output: Option<PathBuf>,
}

/// Core configuration resolved at startup.
#[derive(Clone, Debug)]
pub struct CoreConfig {
    backend: StoreBackend,
    couch: CouchConfig,
    sequencer_output_dir: Option<PathBuf>,
    pipeline_output_dir: Option<PathBuf>,
    pipeline_command: Vec<String>,
    workflow: String,
}

impl CoreConfig {
    /// Create a new `CoreConfig`.
    ///
    /// # Errors
    ///
    /// Returns `CoreError::InvalidInput` if the database name is not a valid CouchDB name or the
    /// pipeline command is empty.
    pub fn new(
        backend: StoreBackend,
        couch: CouchConfig,
        sequencer_output_dir: Option<PathBuf>,
        pipeline_output_dir: Option<PathBuf>,
        pipeline_command: Vec<String>,
    ) -> CoreResult<Self> {
        validate_database_name(&couch.database)?;
        validate_pipeline_command(&pipeline_command)?;

        Ok(Self {
            backend,
            couch,
            sequencer_output_dir,
            pipeline_output_dir,
            pipeline_command,
            workflow: DEFAULT_WORKFLOW.into(),
        })
    }

    /// In-memory configuration with default names, for demos and tests.
    pub fn demo() -> Self {
        Self {
            backend: StoreBackend::Memory,
            couch: CouchConfig::default(),
            sequencer_output_dir: None,
            pipeline_output_dir: None,
            pipeline_command: default_pipeline_command(),
            workflow: DEFAULT_WORKFLOW.into(),
        }
    }

    /// Resolve configuration from key/value lookups, normally `std::env::var`.
    ///
    /// If `NGS_CONFIG` names a JSON config file it is read first; individual variables then
    /// override its values.
    ///
    /// # Errors
    ///
    /// Returns `CoreError::Io` if the config file cannot be read, `CoreError::Validation` if
    /// it is malformed and `CoreError::InvalidInput` for invalid values.
    pub fn from_lookup<F>(lookup: F) -> CoreResult<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| {
            lookup(key)
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
        };

        let file = match get("NGS_CONFIG") {
            Some(path) => Some(read_config_file(Path::new(&path))?),
            None => None,
        };

        let backend = get("NGS_STORE")
            .map(|v| v.parse::<StoreBackend>())
            .transpose()?
            .unwrap_or_default();

        let timeout_secs = get("NGS_STORE_TIMEOUT_SECS")
            .map(|v| {
                v.parse::<u64>().map_err(|_| {
                    CoreError::InvalidInput(format!("NGS_STORE_TIMEOUT_SECS '{v}' is not a number"))
                })
            })
            .transpose()?
            .unwrap_or(DEFAULT_STORE_TIMEOUT_SECS);

        let file_url = file
            .as_ref()
            .and_then(|f| f.couchdb_host.as_ref())
            .map(|host| format!("http://{host}:5984"));

        let couch = CouchConfig {
            url: get("COUCHDB_URL")
                .or(file_url)
                .unwrap_or_else(|| DEFAULT_COUCHDB_URL.into()),
            database: get("NGS_DB_NAME").unwrap_or_else(|| DEFAULT_DATABASE_NAME.into()),
            username: get("COUCHDB_USER").or_else(|| file.as_ref()?.couchdb_user.clone()),
            password: get("COUCHDB_PASSWORD").or_else(|| file.as_ref()?.couchdb_psw.clone()),
            timeout: Duration::from_secs(timeout_secs),
        };

        let sequencer_output_dir = get("MISEQ_OUTPUT_DIR")
            .map(PathBuf::from)
            .or_else(|| file.as_ref()?.miseq_output_folder.clone());
        let pipeline_output_dir = get("NGS_PIPELINE_OUTPUT_DIR")
            .map(PathBuf::from)
            .or_else(|| file.as_ref()?.ngs_pipeline_output.clone());

        let pipeline_command = get("NGS_PIPELINE_COMMAND")
            .map(|v| v.split_whitespace().map(str::to_string).collect())
            .unwrap_or_else(default_pipeline_command);

        Self::new(
            backend,
            couch,
            sequencer_output_dir,
            pipeline_output_dir,
            pipeline_command,
        )
    }

    pub fn with_workflow(mut self, workflow: impl Into<String>) -> Self {
        self.workflow = workflow.into();
        self
    }

    pub fn backend(&self) -> StoreBackend {
        self.backend
    }

    pub fn couch(&self) -> &CouchConfig {
        &self.couch
    }

    pub fn database_name(&self) -> &str {
        &self.couch.database
    }

    pub fn sequencer_output_dir(&self) -> Option<&Path> {
        self.sequencer_output_dir.as_deref()
    }

    pub fn pipeline_output_dir(&self) -> Option<&Path> {
        self.pipeline_output_dir.as_deref()
    }

    pub fn pipeline_command(&self) -> &[String] {
        &self.pipeline_command
    }

    pub fn workflow(&self) -> &str {
        &self.workflow
    }

    /// Opens the configured document store.
    ///
    /// The in-memory backend starts with its database already created and the view catalog
    /// registered for native evaluation; design documents still have to be installed by
    /// bootstrap before views can be queried.
    ///
    /// # Errors
    ///
    /// Returns an error if the HTTP client cannot be built.
    pub fn open_store(&self) -> CoreResult<Arc<dyn DocumentStore>> {
        match self.backend {
            StoreBackend::CouchDb => Ok(Arc::new(CouchDbStore::new(self.couch.clone())?)),
            StoreBackend::Memory => Ok(Arc::new(
                MemoryStore::with_database(&self.couch.database)
                    .with_design_documents(catalog::design_documents()),
            )),
        }
    }
}

fn default_pipeline_command() -> Vec<String> {
    DEFAULT_PIPELINE_COMMAND
        .iter()
        .map(|s| s.to_string())
        .collect()
}

/// Read and parse a JSON config file.
pub fn read_config_file(path: &Path) -> CoreResult<ConfigFile> {
    let text = std::fs::read_to_string(path)?;
    let de = &mut serde_json::Deserializer::from_str(&text);
    serde_path_to_error::deserialize(de).map_err(|e| {
        CoreError::validation(
            format!("{}:{}", path.display(), e.path()),
            e.inner().to_string(),
        )
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn defaults_apply_when_nothing_is_set() {
        let cfg = CoreConfig::from_lookup(lookup(&[])).expect("defaults are valid");
        assert_eq!(cfg.backend(), StoreBackend::CouchDb);
        assert_eq!(cfg.couch().url, DEFAULT_COUCHDB_URL);
        assert_eq!(cfg.database_name(), "ngs_app");
        assert_eq!(cfg.pipeline_command(), ["sleep", "5"]);
        assert_eq!(cfg.couch().timeout, Duration::from_secs(10));
        assert!(cfg.sequencer_output_dir().is_none());
    }

    #[test]
    fn environment_values_are_used() {
        let cfg = CoreConfig::from_lookup(lookup(&[
            ("NGS_STORE", "memory"),
            ("NGS_DB_NAME", "ngs_test"),
            ("MISEQ_OUTPUT_DIR", "/data/miseq"),
            ("NGS_PIPELINE_COMMAND", "true --fast"),
            ("NGS_STORE_TIMEOUT_SECS", "3"),
        ]))
        .expect("valid configuration");
        assert_eq!(cfg.backend(), StoreBackend::Memory);
        assert_eq!(cfg.database_name(), "ngs_test");
        assert_eq!(cfg.sequencer_output_dir(), Some(Path::new("/data/miseq")));
        assert_eq!(cfg.pipeline_command(), ["true", "--fast"]);
        assert_eq!(cfg.couch().timeout, Duration::from_secs(3));
    }

    #[test]
    fn invalid_values_are_rejected() {
        assert!(CoreConfig::from_lookup(lookup(&[("NGS_DB_NAME", "NGS")])).is_err());
        assert!(CoreConfig::from_lookup(lookup(&[("NGS_STORE", "redis")])).is_err());
        assert!(CoreConfig::from_lookup(lookup(&[("NGS_STORE_TIMEOUT_SECS", "soon")])).is_err());
    }

    #[test]
    fn config_file_is_read_and_overridden_by_environment() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("ngs_pipeline_config.json");
        std::fs::write(
            &path,
            r#"{
                "couchdb_user": "lab",
                "couchdb_psw": "secret",
                "couchdb_host": "couch.internal",
                "miseq_output_folder": "/mnt/miseq",
                "ngs_pipeline_output": "/mnt/pipeline"
            }"#,
        )
        .expect("write config");

        let path_str = path.to_string_lossy().to_string();
        let cfg = CoreConfig::from_lookup(lookup(&[
            ("NGS_CONFIG", path_str.as_str()),
            ("COUCHDB_USER", "override"),
        ]))
        .expect("valid configuration");

        assert_eq!(cfg.couch().url, "http://couch.internal:5984");
        assert_eq!(cfg.couch().username.as_deref(), Some("override"));
        assert_eq!(cfg.couch().password.as_deref(), Some("secret"));
        assert_eq!(cfg.sequencer_output_dir(), Some(Path::new("/mnt/miseq")));
        assert_eq!(cfg.pipeline_output_dir(), Some(Path::new("/mnt/pipeline")));
    }

    #[test]
    fn malformed_config_file_reports_path() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("bad.json");
        std::fs::write(&path, r#"{"couchdb_user": 42}"#).expect("write config");

        match read_config_file(&path) {
            Err(CoreError::Validation { path, .. }) => assert!(path.ends_with("couchdb_user")),
            other => panic!("expected validation error, got {other:?}"),
        }
    }
}
