//! Constants used throughout the NGS core crate.

/// Schema stamp written into every typed document.
pub const DATA_MODEL_VERSION: &str = "0.0.1";

/// Version reported by the pipeline dashboard.
pub const PIPELINE_VERSION: &str = "0.0.1";

/// Default CouchDB database name.
pub const DEFAULT_DATABASE_NAME: &str = "ngs_app";

/// Default CouchDB server URL.
pub const DEFAULT_COUCHDB_URL: &str = "http://localhost:5984";

/// Default per-request store timeout, in seconds.
pub const DEFAULT_STORE_TIMEOUT_SECS: u64 = 10;

/// Default workflow definition handed to the pipeline worker.
pub const DEFAULT_WORKFLOW: &str = "/data/ngs_pipeline/workflow/wdl/ngs_pipeline.wdl";

/// Default out-of-process pipeline worker command.
pub const DEFAULT_PIPELINE_COMMAND: &[&str] = &["sleep", "5"];

/// Id of the singleton pipeline progress document.
pub const PIPELINE_STATE_ID: &str = "pipeline_state";

/// Id of the singleton external-sync cursor document.
pub const APP_STATE_ID: &str = "app_state";

/// Id of the singleton scheduling settings document.
pub const APP_SETTINGS_ID: &str = "app_settings";

/// Bound on read-modify-write attempts after revision conflicts.
pub const MAX_UPDATE_ATTEMPTS: usize = 5;

/// Examination types (as named in FileMaker) that carry a molecular pathology case number.
///
/// The research panel `DNA PANEL 522` is deliberately absent.
pub const FILEMAKER_EXAMINATION_TYPES: &[&str] = &[
    "DNA Lungenpanel Qiagen - kein nNGM Fall",
    "DNA Panel ONCOHS",
    "DNA PANEL ONCOHS (Mamma)",
    "DNA PANEL ONCOHS (Melanom)",
    "DNA PANEL ONCOHS (Colon)",
    "DNA PANEL ONCOHS (GIST)",
    "DNA PANEL Multimodel PanCancer DNA",
    "DNA PANEL Multimodel PanCancer RNA",
    "NNGM Lunge Qiagen",
    "RNA Fusion Lunge",
    "RNA Sarkompanel",
];
