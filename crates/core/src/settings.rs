//! Application singleton documents.
//!
//! `app_state` holds the external-sync cursor and `app_settings` the scheduling settings. Both
//! live under fixed ids, carry no `document_type` and are created once with defaults; later
//! bootstraps never overwrite them.

use crate::constants::{APP_SETTINGS_ID, APP_STATE_ID};
use crate::session::{Initialised, Session};
use crate::{CoreError, CoreResult};
use couch_store::{RawDocument, ID_KEY, REV_KEY};
use ngs_types::Revision;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::info;

/// A document stored once under a fixed id.
pub trait Singleton: Serialize + DeserializeOwned + Default {
    const ID: &'static str;
}

/// Cursor of the external record synchronisation.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppState {
    /// Last external row already mirrored; `-1` before the first sync.
    pub last_synced_filemaker_row: i64,
    pub sync_running: bool,
}

impl Default for AppState {
    fn default() -> Self {
        Self {
            last_synced_filemaker_row: -1,
            sync_running: false,
        }
    }
}

impl Singleton for AppState {
    const ID: &'static str = APP_STATE_ID;
}

/// Pipeline scheduling settings.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppSettings {
    /// Times of day at which the pipeline is started, as `HH:MM`; `""` means unscheduled.
    pub schedule: Vec<String>,
    pub autorun_pipeline: bool,
}

impl Default for AppSettings {
    fn default() -> Self {
        Self {
            schedule: vec![String::new()],
            autorun_pipeline: true,
        }
    }
}

impl Singleton for AppSettings {
    const ID: &'static str = APP_SETTINGS_ID;
}

fn to_raw<S: Singleton>(value: &S, rev: Option<&Revision>) -> CoreResult<RawDocument> {
    let mut raw = match serde_json::to_value(value).map_err(CoreError::Serialization)? {
        Value::Object(map) => map,
        other => {
            return Err(CoreError::validation(
                S::ID,
                format!("singleton serialised to a non-object: {other}"),
            ))
        }
    };
    raw.insert(ID_KEY.into(), Value::String(S::ID.into()));
    if let Some(rev) = rev {
        raw.insert(REV_KEY.into(), Value::String(rev.to_string()));
    }
    Ok(raw)
}

/// Reads a singleton and the revision it was read at.
pub async fn load<S: Singleton>(session: &Session<Initialised>) -> CoreResult<(S, Revision)> {
    let mut raw = session.get_raw(S::ID).await?;
    let rev = raw
        .remove(REV_KEY)
        .and_then(|v| v.as_str().map(str::to_string))
        .ok_or_else(|| CoreError::validation(REV_KEY, "stored singleton has no revision"))?;
    let rev = Revision::parse(rev).map_err(|e| CoreError::validation(REV_KEY, e.to_string()))?;
    raw.remove(ID_KEY);

    let value = serde_path_to_error::deserialize(Value::Object(raw))
        .map_err(|e| CoreError::validation(e.path().to_string(), e.inner().to_string()))?;
    Ok((value, rev))
}

/// Overwrites a singleton that was read at `rev`.
///
/// # Errors
///
/// Returns `CoreError::Conflict` if it changed since.
pub async fn store<S: Singleton>(
    session: &Session<Initialised>,
    value: &S,
    rev: &Revision,
) -> CoreResult<Revision> {
    let saved = session.save_raw(to_raw(value, Some(rev))?).await?;
    let rev = saved
        .get(REV_KEY)
        .and_then(Value::as_str)
        .ok_or_else(|| CoreError::validation(REV_KEY, "store returned no revision"))?;
    Revision::parse(rev).map_err(|e| CoreError::validation(REV_KEY, e.to_string()))
}

/// Creates a singleton with its defaults unless it already exists.
///
/// Returns `true` if this call created it. Losing a creation race to another writer counts as
/// already existing.
pub async fn ensure<S: Singleton>(session: &Session<Initialised>) -> CoreResult<bool> {
    match session.get_raw(S::ID).await {
        Ok(_) => Ok(false),
        Err(CoreError::NotFound(_)) => {
            match session.save_raw(to_raw(&S::default(), None)?).await {
                Ok(_) => {
                    info!(id = S::ID, "created singleton document");
                    Ok(true)
                }
                Err(CoreError::Conflict(_)) => Ok(false),
                Err(err) => Err(err),
            }
        }
        Err(err) => Err(err),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use couch_store::{DocumentStore, MemoryStore};
    use serde_json::json;
    use std::sync::Arc;

    async fn session() -> Session<Initialised> {
        let store: Arc<dyn DocumentStore> = Arc::new(MemoryStore::with_database("ngs_test"));
        Session::new(store).connect().await.expect("database exists")
    }

    #[tokio::test]
    async fn ensure_creates_defaults_once() {
        let session = session().await;
        assert!(ensure::<AppState>(&session).await.unwrap());
        assert!(!ensure::<AppState>(&session).await.unwrap());

        let (state, _) = load::<AppState>(&session).await.unwrap();
        assert_eq!(state.last_synced_filemaker_row, -1);
        assert!(!state.sync_running);

        let raw = session.get_raw("app_state").await.unwrap();
        assert!(!raw.contains_key("document_type"));
    }

    #[tokio::test]
    async fn ensure_never_overwrites_existing_values() {
        let session = session().await;
        assert!(ensure::<AppSettings>(&session).await.unwrap());
        let (mut settings, rev) = load::<AppSettings>(&session).await.unwrap();
        assert_eq!(settings.schedule, vec![String::new()]);
        assert!(settings.autorun_pipeline);

        settings.schedule = vec!["06:30".into()];
        settings.autorun_pipeline = false;
        store(&session, &settings, &rev).await.unwrap();

        assert!(!ensure::<AppSettings>(&session).await.unwrap());
        let (reloaded, _) = load::<AppSettings>(&session).await.unwrap();
        assert_eq!(reloaded, settings);
    }

    #[tokio::test]
    async fn stale_store_conflicts() {
        let session = session().await;
        ensure::<AppState>(&session).await.unwrap();
        let (mut state, rev) = load::<AppState>(&session).await.unwrap();
        state.sync_running = true;
        store(&session, &state, &rev).await.unwrap();

        state.last_synced_filemaker_row = 12;
        assert!(matches!(
            store(&session, &state, &rev).await,
            Err(CoreError::Conflict(_))
        ));
    }

    #[tokio::test]
    async fn malformed_singleton_is_a_validation_error() {
        let session = session().await;
        let raw = match json!({"_id": "app_state", "last_synced_filemaker_row": "ten", "sync_running": false}) {
            Value::Object(map) => map,
            _ => unreachable!(),
        };
        session.save_raw(raw).await.unwrap();
        assert!(matches!(
            load::<AppState>(&session).await,
            Err(CoreError::Validation { .. })
        ));
    }
}
