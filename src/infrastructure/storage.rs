use crate::domain::models::ExtensionState;
use crate::infrastructure::error::InfraError;
use async_trait::async_trait;
use rusqlite::{Connection, OptionalExtension, params};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tokio::task;

const SCHEMA_SQL: &str = "CREATE TABLE IF NOT EXISTS kv (
    key TEXT PRIMARY KEY NOT NULL,
    value TEXT NOT NULL,
    updated_at TEXT NOT NULL
);";
const STATE_KEY: &str = "extension_state";

pub fn initialize_database(path: &Path) -> Result<(), InfraError> {
    let connection = Connection::open(path)?;
    connection.execute_batch(SCHEMA_SQL)?;
    Ok(())
}

/// Key/value document storage holding the persisted [`ExtensionState`].
#[async_trait]
pub trait SettingsStore: Send + Sync {
    async fn load(&self) -> Result<Option<ExtensionState>, InfraError>;
    async fn save(&self, state: &ExtensionState) -> Result<(), InfraError>;
}

#[derive(Debug, Clone)]
pub struct SqliteSettingsStore {
    db_path: PathBuf,
}

impl SqliteSettingsStore {
    pub fn new(db_path: impl AsRef<Path>) -> Self {
        Self {
            db_path: db_path.as_ref().to_path_buf(),
        }
    }
}

fn connect(db_path: &Path) -> Result<Connection, InfraError> {
    let connection = Connection::open(db_path)?;
    connection.execute_batch(SCHEMA_SQL)?;
    Ok(connection)
}

fn read_state(db_path: &Path) -> Result<Option<String>, InfraError> {
    let connection = connect(db_path)?;
    Ok(connection
        .query_row(
            "SELECT value FROM kv WHERE key = ?1",
            params![STATE_KEY],
            |row| row.get(0),
        )
        .optional()?)
}

fn write_state(db_path: &Path, payload: &str) -> Result<(), InfraError> {
    let connection = connect(db_path)?;
    connection.execute(
        "INSERT INTO kv (key, value, updated_at)
         VALUES (?1, ?2, ?3)
         ON CONFLICT(key) DO UPDATE SET
           value = excluded.value,
           updated_at = excluded.updated_at",
        params![STATE_KEY, payload, chrono::Utc::now().to_rfc3339()],
    )?;
    Ok(())
}

fn join_error(error: tokio::task::JoinError) -> InfraError {
    InfraError::Storage(format!("storage task failed: {error}"))
}

/// rusqlite blocks, so each call runs on the blocking pool.
#[async_trait]
impl SettingsStore for SqliteSettingsStore {
    async fn load(&self) -> Result<Option<ExtensionState>, InfraError> {
        let db_path = self.db_path.clone();
        let raw = task::spawn_blocking(move || read_state(&db_path))
            .await
            .map_err(join_error)??;

        let Some(raw) = raw else {
            return Ok(None);
        };
        let state = serde_json::from_str::<ExtensionState>(&raw).map_err(|error| {
            InfraError::Storage(format!("invalid stored {STATE_KEY}: {error}"))
        })?;
        Ok(Some(state))
    }

    async fn save(&self, state: &ExtensionState) -> Result<(), InfraError> {
        let payload = serde_json::to_string(state)?;
        let db_path = self.db_path.clone();
        task::spawn_blocking(move || write_state(&db_path, &payload))
            .await
            .map_err(join_error)?
    }
}

#[derive(Debug, Default)]
pub struct InMemorySettingsStore {
    state: Mutex<Option<ExtensionState>>,
    fail_writes: Mutex<bool>,
}

impl InMemorySettingsStore {
    pub fn with_state(state: ExtensionState) -> Self {
        Self {
            state: Mutex::new(Some(state)),
            fail_writes: Mutex::new(false),
        }
    }

    /// Makes every subsequent `save` fail, for exercising best-effort persistence.
    pub fn set_fail_writes(&self, fail: bool) {
        if let Ok(mut guard) = self.fail_writes.lock() {
            *guard = fail;
        }
    }

    pub fn snapshot(&self) -> Option<ExtensionState> {
        self.state.lock().ok().and_then(|guard| guard.clone())
    }
}

#[async_trait]
impl SettingsStore for InMemorySettingsStore {
    async fn load(&self) -> Result<Option<ExtensionState>, InfraError> {
        let state = self
            .state
            .lock()
            .map_err(|error| InfraError::Storage(format!("settings lock poisoned: {error}")))?;
        Ok(state.clone())
    }

    async fn save(&self, state: &ExtensionState) -> Result<(), InfraError> {
        let fail = self
            .fail_writes
            .lock()
            .map(|guard| *guard)
            .map_err(|error| InfraError::Storage(format!("settings lock poisoned: {error}")))?;
        if fail {
            return Err(InfraError::Storage("storage quota exceeded".to_string()));
        }
        let mut guard = self
            .state
            .lock()
            .map_err(|error| InfraError::Storage(format!("settings lock poisoned: {error}")))?;
        *guard = Some(state.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::models::Settings;

    #[tokio::test]
    async fn sqlite_store_roundtrips_state() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("ghostcal.sqlite");
        initialize_database(&path).expect("init db");
        let store = SqliteSettingsStore::new(&path);

        assert!(store.load().await.expect("load empty").is_none());

        let state = ExtensionState {
            is_authorized: true,
            settings: Settings {
                ghost_future_events: true,
                ghosted_events: vec!["Lunch".to_string()],
                ..Settings::default()
            },
            ..ExtensionState::default()
        };
        store.save(&state).await.expect("save");
        let mut updated = state.clone();
        updated.dark_mode = true;
        store.save(&updated).await.expect("overwrite");

        assert_eq!(store.load().await.expect("load"), Some(updated));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn saves_from_spawned_tasks_leave_one_document() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("ghostcal.sqlite");
        initialize_database(&path).expect("init db");
        let store = SqliteSettingsStore::new(&path);

        let writers: Vec<_> = (0..8u8)
            .map(|opacity| {
                let store = store.clone();
                tokio::spawn(async move {
                    let state = ExtensionState {
                        settings: Settings {
                            ghost_event_opacity: opacity * 10,
                            ..Settings::default()
                        },
                        ..ExtensionState::default()
                    };
                    store.save(&state).await
                })
            })
            .collect();
        for writer in writers {
            writer.await.expect("join").expect("save");
        }

        let loaded = store.load().await.expect("load").expect("state");
        assert!(loaded.settings.ghost_event_opacity <= 70);
        assert_eq!(loaded.settings.ghost_event_opacity % 10, 0);
    }

    #[tokio::test]
    async fn corrupt_document_is_storage_error() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("ghostcal.sqlite");
        initialize_database(&path).expect("init db");
        write_state(&path, "{not json").expect("raw write");

        let result = SqliteSettingsStore::new(&path).load().await;
        assert!(matches!(result, Err(InfraError::Storage(_))));
    }

    #[tokio::test]
    async fn in_memory_store_can_fail_writes() {
        let store = InMemorySettingsStore::default();
        store.set_fail_writes(true);
        assert!(store.save(&ExtensionState::default()).await.is_err());
        assert!(store.snapshot().is_none());
    }
}
