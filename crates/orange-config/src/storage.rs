//! Key-value storage collaborator.
//!
//! The stored document is a single JSON object. `set` merges top-level
//! keys, like the extension platform's local storage area.

use crate::config::FilterConfig;
use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::{Map, Value};
use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

/// Errors from a storage backend
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("Malformed storage document: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("Storage unavailable: {0}")]
    Unavailable(String),
}

/// Top-level keys touched by a `set`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StorageChange {
    pub keys: Vec<String>,
}

impl StorageChange {
    pub fn touches(&self, key: &str) -> bool {
        self.keys.iter().any(|k| k == key)
    }
}

/// Persistent key-value store holding the config document
#[async_trait]
pub trait Storage: Send + Sync {
    /// Read the whole document. An empty store yields an empty object.
    async fn get_all(&self) -> Result<Map<String, Value>, StorageError>;

    /// Merge `items` into the document by top-level key.
    async fn set(&self, items: Map<String, Value>) -> Result<(), StorageError>;

    /// Change notifications for every successful `set`.
    fn subscribe(&self) -> broadcast::Receiver<StorageChange>;
}

const CHANGE_CHANNEL_CAPACITY: usize = 32;

/// In-process storage
pub struct MemoryStorage {
    data: Mutex<Map<String, Value>>,
    changes: broadcast::Sender<StorageChange>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::with_document(Map::new())
    }

    pub fn with_document(data: Map<String, Value>) -> Self {
        let (changes, _) = broadcast::channel(CHANGE_CHANNEL_CAPACITY);
        Self {
            data: Mutex::new(data),
            changes,
        }
    }
}

impl Default for MemoryStorage {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Storage for MemoryStorage {
    async fn get_all(&self) -> Result<Map<String, Value>, StorageError> {
        Ok(self.data.lock().clone())
    }

    async fn set(&self, items: Map<String, Value>) -> Result<(), StorageError> {
        let keys: Vec<String> = items.keys().cloned().collect();
        self.data.lock().extend(items);
        let _ = self.changes.send(StorageChange { keys });
        Ok(())
    }

    fn subscribe(&self) -> broadcast::Receiver<StorageChange> {
        self.changes.subscribe()
    }
}

/// JSON file storage with atomic replace on write
pub struct FileStorage {
    path: PathBuf,
    /// Serializes read-modify-write cycles
    write_lock: tokio::sync::Mutex<()>,
    changes: broadcast::Sender<StorageChange>,
}

impl FileStorage {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        let (changes, _) = broadcast::channel(CHANGE_CHANNEL_CAPACITY);
        Self {
            path: path.into(),
            write_lock: tokio::sync::Mutex::new(()),
            changes,
        }
    }

    /// Storage file under the platform data directory.
    pub fn default_path() -> PathBuf {
        dirs::data_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("orange-filter")
            .join("storage.json")
    }

    pub fn with_default_path() -> Self {
        Self::new(Self::default_path())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn read_document(&self) -> Result<Map<String, Value>, StorageError> {
        let bytes = match tokio::fs::read(&self.path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Map::new()),
            Err(e) => return Err(e.into()),
        };
        if bytes.iter().all(u8::is_ascii_whitespace) {
            return Ok(Map::new());
        }
        match serde_json::from_slice::<Value>(&bytes)? {
            Value::Object(map) => Ok(map),
            other => Err(StorageError::Unavailable(format!(
                "expected a JSON object, found {}",
                json_kind(&other)
            ))),
        }
    }

    async fn write_document(&self, data: &Map<String, Value>) -> Result<(), StorageError> {
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let tmp = self.path.with_extension("json.tmp");
        let bytes = serde_json::to_vec_pretty(data)?;
        tokio::fs::write(&tmp, &bytes).await?;
        tokio::fs::rename(&tmp, &self.path).await?;
        debug!("Wrote {} bytes to {}", bytes.len(), self.path.display());
        Ok(())
    }
}

#[async_trait]
impl Storage for FileStorage {
    async fn get_all(&self) -> Result<Map<String, Value>, StorageError> {
        self.read_document().await
    }

    async fn set(&self, items: Map<String, Value>) -> Result<(), StorageError> {
        let _guard = self.write_lock.lock().await;
        let mut data = self.read_document().await?;
        let keys: Vec<String> = items.keys().cloned().collect();
        data.extend(items);
        self.write_document(&data).await?;
        let _ = self.changes.send(StorageChange { keys });
        Ok(())
    }

    fn subscribe(&self) -> broadcast::Receiver<StorageChange> {
        self.changes.subscribe()
    }
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}

/// Read the config merged with defaults. Never fails.
pub async fn load_config(storage: &dyn Storage) -> FilterConfig {
    match storage.get_all().await {
        Ok(data) => FilterConfig::from_stored(&Value::Object(data)),
        Err(e) => {
            warn!("Storage error, using default config: {}", e);
            FilterConfig::default()
        }
    }
}

/// Persist every section of the config.
pub async fn save_config(storage: &dyn Storage, config: &FilterConfig) -> Result<(), StorageError> {
    let Value::Object(items) = config.to_value() else {
        return Err(StorageError::Unavailable("config did not serialize to an object".into()));
    };
    storage.set(items).await?;
    info!("Saved config (version {})", config.version);
    Ok(())
}
