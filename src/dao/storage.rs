use std::{
    collections::BTreeMap,
    io::ErrorKind,
    path::{Path, PathBuf},
    sync::Arc,
};

use dashmap::DashMap;
use futures::future::BoxFuture;
use thiserror::Error;
use tokio::sync::Mutex;

/// Result alias for storage operations.
pub type StorageResult<T> = Result<T, StorageError>;

/// Error raised by the local key-value backends.
#[derive(Debug, Error)]
pub enum StorageError {
    /// The backing file could not be read or written.
    #[error("storage file `{path}` is not accessible")]
    Io {
        /// File that failed.
        path: String,
        #[source]
        /// Underlying I/O error.
        source: std::io::Error,
    },
    /// The backing file does not contain a JSON object of strings.
    #[error("storage file `{path}` is corrupted")]
    Serialize {
        /// File that failed.
        path: String,
        #[source]
        /// Underlying JSON error.
        source: serde_json::Error,
    },
}

/// Asynchronous string key-value store. Each operation is atomic on its own; concurrent
/// writers are resolved last-write-wins.
pub trait KeyValueStore: Send + Sync {
    /// Read a value.
    fn get(&self, key: &str) -> BoxFuture<'static, StorageResult<Option<String>>>;
    /// Insert or overwrite a value.
    fn set(&self, key: &str, value: String) -> BoxFuture<'static, StorageResult<()>>;
    /// Remove a value; removing a missing key is not an error.
    fn remove(&self, key: &str) -> BoxFuture<'static, StorageResult<()>>;
}

/// Volatile store, handy for tests and for runs that must not touch the disk.
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    entries: Arc<DashMap<String, String>>,
}

impl MemoryStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }
}

impl KeyValueStore for MemoryStore {
    fn get(&self, key: &str) -> BoxFuture<'static, StorageResult<Option<String>>> {
        let value = self.entries.get(key).map(|entry| entry.value().clone());
        Box::pin(async move { Ok(value) })
    }

    fn set(&self, key: &str, value: String) -> BoxFuture<'static, StorageResult<()>> {
        self.entries.insert(key.to_string(), value);
        Box::pin(async { Ok(()) })
    }

    fn remove(&self, key: &str) -> BoxFuture<'static, StorageResult<()>> {
        self.entries.remove(key);
        Box::pin(async { Ok(()) })
    }
}

/// Store persisted as a single JSON object on disk.
///
/// Writes go to a sibling temporary file which is then renamed over the original, so a
/// crash mid-write never leaves a truncated file behind.
#[derive(Debug, Clone)]
pub struct FileStore {
    path: Arc<PathBuf>,
    gate: Arc<Mutex<()>>,
}

impl FileStore {
    /// Open (lazily) the store located at `path`. The file and its parent directory are
    /// created on the first write.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: Arc::new(path.into()),
            gate: Arc::new(Mutex::new(())),
        }
    }

    /// Location of the backing file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn update<F>(&self, mutate: F) -> BoxFuture<'static, StorageResult<()>>
    where
        F: FnOnce(&mut BTreeMap<String, String>) + Send + 'static,
    {
        let path = self.path.clone();
        let gate = self.gate.clone();
        Box::pin(async move {
            let _guard = gate.lock().await;
            let mut entries = read_entries(&path).await?;
            mutate(&mut entries);
            write_entries(&path, &entries).await
        })
    }
}

impl KeyValueStore for FileStore {
    fn get(&self, key: &str) -> BoxFuture<'static, StorageResult<Option<String>>> {
        let path = self.path.clone();
        let gate = self.gate.clone();
        let key = key.to_string();
        Box::pin(async move {
            let _guard = gate.lock().await;
            let mut entries = read_entries(&path).await?;
            Ok(entries.remove(&key))
        })
    }

    fn set(&self, key: &str, value: String) -> BoxFuture<'static, StorageResult<()>> {
        let key = key.to_string();
        self.update(move |entries| {
            entries.insert(key, value);
        })
    }

    fn remove(&self, key: &str) -> BoxFuture<'static, StorageResult<()>> {
        let key = key.to_string();
        self.update(move |entries| {
            entries.remove(&key);
        })
    }
}

async fn read_entries(path: &Path) -> StorageResult<BTreeMap<String, String>> {
    match tokio::fs::read_to_string(path).await {
        Ok(contents) if contents.trim().is_empty() => Ok(BTreeMap::new()),
        Ok(contents) => {
            serde_json::from_str(&contents).map_err(|source| StorageError::Serialize {
                path: path.display().to_string(),
                source,
            })
        }
        Err(err) if err.kind() == ErrorKind::NotFound => Ok(BTreeMap::new()),
        Err(source) => Err(StorageError::Io {
            path: path.display().to_string(),
            source,
        }),
    }
}

async fn write_entries(path: &Path, entries: &BTreeMap<String, String>) -> StorageResult<()> {
    let io_error = |source| StorageError::Io {
        path: path.display().to_string(),
        source,
    };

    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        tokio::fs::create_dir_all(parent).await.map_err(io_error)?;
    }

    let body = serde_json::to_vec_pretty(entries).map_err(|source| StorageError::Serialize {
        path: path.display().to_string(),
        source,
    })?;

    let tmp = path.with_extension("tmp");
    tokio::fs::write(&tmp, body).await.map_err(io_error)?;
    tokio::fs::rename(&tmp, path).await.map_err(io_error)
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    fn scratch_path() -> PathBuf {
        std::env::temp_dir()
            .join(format!("duel-client-{}", Uuid::new_v4()))
            .join("storage.json")
    }

    #[tokio::test]
    async fn memory_store_round_trip() {
        let store = MemoryStore::new();
        store.set("k", "v".into()).await.unwrap();
        assert_eq!(store.get("k").await.unwrap().as_deref(), Some("v"));
        store.remove("k").await.unwrap();
        assert_eq!(store.get("k").await.unwrap(), None);
    }

    #[tokio::test]
    async fn file_store_creates_parent_and_persists() {
        let path = scratch_path();
        let store = FileStore::new(&path);
        assert_eq!(store.get("missing").await.unwrap(), None);

        store.set("auth_token", "abc".into()).await.unwrap();
        store.set("auth_token", "def".into()).await.unwrap();

        let reopened = FileStore::new(&path);
        assert_eq!(
            reopened.get("auth_token").await.unwrap().as_deref(),
            Some("def")
        );

        reopened.remove("auth_token").await.unwrap();
        assert_eq!(store.get("auth_token").await.unwrap(), None);

        let _ = std::fs::remove_dir_all(path.parent().unwrap());
    }

    #[tokio::test]
    async fn file_store_reports_corruption() {
        let path = scratch_path();
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(&path, "not json").unwrap();

        let store = FileStore::new(&path);
        let err = store.get("any").await.unwrap_err();
        assert!(matches!(err, StorageError::Serialize { .. }));

        let _ = std::fs::remove_dir_all(path.parent().unwrap());
    }
}
