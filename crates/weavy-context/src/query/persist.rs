//! Query cache persistence.
//!
//! The dehydrated cache is written as one JSON document under
//! `weavy-<namespace>-query-cache`. A stored document is only restored when it
//! was written by the same client version and is younger than the max age.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, OnceLock};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

use super::QueryKey;
use crate::error::PersistError;
use crate::lock;

/// Synchronous key/value storage, shaped like the browser storage API.
pub trait Storage: Send + Sync + 'static {
    fn get_item(&self, key: &str) -> Result<Option<String>, PersistError>;
    fn set_item(&self, key: &str, value: &str) -> Result<(), PersistError>;
    fn remove_item(&self, key: &str) -> Result<(), PersistError>;
}

/// In-memory storage.
#[derive(Debug, Default)]
pub struct MemoryStorage {
    items: Mutex<HashMap<String, String>>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Process-wide storage shared by every context, like session storage is
    /// shared by every script on a page.
    pub fn session() -> Arc<dyn Storage> {
        static SESSION: OnceLock<Arc<MemoryStorage>> = OnceLock::new();
        SESSION.get_or_init(|| Arc::new(MemoryStorage::new())).clone()
    }
}

impl Storage for MemoryStorage {
    fn get_item(&self, key: &str) -> Result<Option<String>, PersistError> {
        Ok(lock(&self.items).get(key).cloned())
    }

    fn set_item(&self, key: &str, value: &str) -> Result<(), PersistError> {
        lock(&self.items).insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn remove_item(&self, key: &str) -> Result<(), PersistError> {
        lock(&self.items).remove(key);
        Ok(())
    }
}

/// Storage keeping one `<key>.json` file per item in a directory.
#[derive(Debug, Clone)]
pub struct FileStorage {
    dir: PathBuf,
}

impl FileStorage {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    fn path(&self, key: &str) -> PathBuf {
        self.dir.join(format!("{key}.json"))
    }
}

fn storage_error(key: &str, error: std::io::Error) -> PersistError {
    PersistError::Storage {
        key: key.to_string(),
        message: error.to_string(),
    }
}

impl Storage for FileStorage {
    fn get_item(&self, key: &str) -> Result<Option<String>, PersistError> {
        match std::fs::read_to_string(self.path(key)) {
            Ok(contents) => Ok(Some(contents)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(storage_error(key, e)),
        }
    }

    fn set_item(&self, key: &str, value: &str) -> Result<(), PersistError> {
        std::fs::create_dir_all(&self.dir).map_err(|e| storage_error(key, e))?;
        std::fs::write(self.path(key), value).map_err(|e| storage_error(key, e))
    }

    fn remove_item(&self, key: &str) -> Result<(), PersistError> {
        match std::fs::remove_file(self.path(key)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(storage_error(key, e)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct PersistedQuery {
    pub(crate) query_key: QueryKey,
    pub(crate) data: Value,
    /// Milliseconds since the epoch.
    pub(crate) data_updated_at: u64,
}

#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ClientState {
    queries: Vec<PersistedQuery>,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PersistedClient {
    timestamp: u64,
    buster: String,
    client_state: ClientState,
}

fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}

/// Writes and restores a query cache through a [`Storage`].
#[derive(Clone)]
pub struct QueryPersister {
    storage: Arc<dyn Storage>,
    key: String,
    throttle: Duration,
    max_age: Duration,
    buster: String,
}

impl std::fmt::Debug for QueryPersister {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueryPersister")
            .field("key", &self.key)
            .field("throttle", &self.throttle)
            .field("max_age", &self.max_age)
            .field("buster", &self.buster)
            .finish_non_exhaustive()
    }
}

impl QueryPersister {
    pub fn new(
        storage: Arc<dyn Storage>,
        namespace: &str,
        throttle: Duration,
        max_age: Duration,
        buster: impl Into<String>,
    ) -> Self {
        Self {
            storage,
            key: format!("weavy-{namespace}-query-cache"),
            throttle,
            max_age,
            buster: buster.into(),
        }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn throttle(&self) -> Duration {
        self.throttle
    }

    pub(crate) fn persist(&self, queries: Vec<PersistedQuery>) -> Result<(), PersistError> {
        let client = PersistedClient {
            timestamp: now_millis(),
            buster: self.buster.clone(),
            client_state: ClientState { queries },
        };
        let json = serde_json::to_string(&client)?;
        self.storage.set_item(&self.key, &json)
    }

    /// Reads the stored cache. Busted, expired or unreadable documents are
    /// removed and yield `None`.
    pub(crate) fn restore(&self) -> Result<Option<Vec<PersistedQuery>>, PersistError> {
        let Some(json) = self.storage.get_item(&self.key)? else {
            return Ok(None);
        };

        let client: PersistedClient = match serde_json::from_str(&json) {
            Ok(client) => client,
            Err(error) => {
                self.remove()?;
                return Err(error.into());
            }
        };

        let age = Duration::from_millis(now_millis().saturating_sub(client.timestamp));
        if client.buster != self.buster || age > self.max_age {
            debug!(key = %self.key, buster = %client.buster, age = ?age, "discarding persisted query cache");
            self.remove()?;
            return Ok(None);
        }
        Ok(Some(client.client_state.queries))
    }

    pub fn remove(&self) -> Result<(), PersistError> {
        self.storage.remove_item(&self.key)
    }
}
