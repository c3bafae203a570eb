use serde::{de::DeserializeOwned, Deserialize, Serialize};
use std::collections::HashMap;
use std::marker::PhantomData;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{Mutex, RwLock};

pub const MAX_KEY_LENGTH: usize = 512;
pub const MAX_VALUE_SIZE: usize = 1024 * 1024;

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct KvKey {
    namespace: KeyNamespace,
    key: String,
}

impl KvKey {
    pub fn new(namespace: KeyNamespace, key: impl Into<String>) -> Result<Self, KvError> {
        let key = key.into();
        Self::validate_key(&key)?;
        Ok(Self { namespace, key })
    }

    pub fn raw(&self) -> String {
        format!("{}:{}", self.namespace.prefix(), self.key)
    }

    pub fn namespace(&self) -> &KeyNamespace {
        &self.namespace
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    fn validate_key(key: &str) -> Result<(), KvError> {
        if key.trim().is_empty() {
            return Err(KvError::InvalidKey {
                key: key.to_string(),
                reason: "key cannot be empty".to_string(),
            });
        }

        if key.len() > MAX_KEY_LENGTH {
            return Err(KvError::InvalidKey {
                key: key.chars().take(50).collect::<String>() + "...",
                reason: format!("key exceeds maximum length of {MAX_KEY_LENGTH} bytes"),
            });
        }

        if key.contains("..") || key.starts_with('/') || key.starts_with('\\') {
            return Err(KvError::InvalidKey {
                key: key.to_string(),
                reason: "key cannot contain path traversal sequences".to_string(),
            });
        }

        if key.chars().any(char::is_control) {
            return Err(KvError::InvalidKey {
                key: key.escape_default().to_string(),
                reason: "key contains control characters".to_string(),
            });
        }

        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum KeyNamespace {
    Session,
    Settings,
}

impl KeyNamespace {
    pub fn prefix(&self) -> &str {
        match self {
            KeyNamespace::Session => "session",
            KeyNamespace::Settings => "settings",
        }
    }
}

#[derive(Debug, Clone, Error, Serialize, Deserialize, PartialEq, Eq)]
pub enum KvError {
    #[error("invalid key '{key}': {reason}")]
    InvalidKey { key: String, reason: String },

    #[error("value too large: {size} bytes exceeds maximum of {max} bytes")]
    ValueTooLarge { size: usize, max: usize },

    #[error("storage error: {message} (retryable: {retryable})")]
    Storage { message: String, retryable: bool },

    #[error("serialization error: {message}")]
    Serialization { message: String, key: Option<String> },
}

impl KvError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, KvError::Storage { retryable: true, .. })
    }

    pub fn storage(message: impl Into<String>) -> Self {
        Self::Storage {
            message: message.into(),
            retryable: false,
        }
    }
}

/// Durable device key-value storage supplied by the host (keychain,
/// shared preferences, SQLite).
#[async_trait::async_trait]
pub trait KeyValueStore: Send + Sync {
    async fn get(&self, key: &KvKey) -> Result<Option<Vec<u8>>, KvError>;
    async fn set(&self, key: &KvKey, value: Vec<u8>) -> Result<(), KvError>;
    /// Returns whether the key existed.
    async fn delete(&self, key: &KvKey) -> Result<bool, KvError>;
}

#[async_trait::async_trait]
impl<S: KeyValueStore + ?Sized> KeyValueStore for Arc<S> {
    async fn get(&self, key: &KvKey) -> Result<Option<Vec<u8>>, KvError> {
        (**self).get(key).await
    }

    async fn set(&self, key: &KvKey, value: Vec<u8>) -> Result<(), KvError> {
        (**self).set(key, value).await
    }

    async fn delete(&self, key: &KvKey) -> Result<bool, KvError> {
        (**self).delete(key).await
    }
}

fn check_value_size(value: &[u8]) -> Result<(), KvError> {
    if value.len() > MAX_VALUE_SIZE {
        return Err(KvError::ValueTooLarge {
            size: value.len(),
            max: MAX_VALUE_SIZE,
        });
    }
    Ok(())
}

// ============================================================================
// In-memory store
// ============================================================================

#[derive(Debug, Default)]
pub struct MemoryKvStore {
    entries: RwLock<HashMap<String, Vec<u8>>>,
}

impl MemoryKvStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Writes raw bytes, bypassing typed encoding. Used to seed fixtures.
    pub async fn put_raw(&self, raw_key: impl Into<String>, value: Vec<u8>) {
        self.entries.write().await.insert(raw_key.into(), value);
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.read().await.is_empty()
    }
}

#[async_trait::async_trait]
impl KeyValueStore for MemoryKvStore {
    async fn get(&self, key: &KvKey) -> Result<Option<Vec<u8>>, KvError> {
        Ok(self.entries.read().await.get(&key.raw()).cloned())
    }

    async fn set(&self, key: &KvKey, value: Vec<u8>) -> Result<(), KvError> {
        check_value_size(&value)?;
        self.entries.write().await.insert(key.raw(), value);
        Ok(())
    }

    async fn delete(&self, key: &KvKey) -> Result<bool, KvError> {
        Ok(self.entries.write().await.remove(&key.raw()).is_some())
    }
}

// ============================================================================
// SQLite store
// ============================================================================

#[cfg(not(target_arch = "wasm32"))]
pub struct SqliteKvStore {
    conn: Mutex<rusqlite::Connection>,
}

#[cfg(not(target_arch = "wasm32"))]
impl SqliteKvStore {
    pub fn open(path: impl AsRef<std::path::Path>) -> Result<Self, KvError> {
        let conn = rusqlite::Connection::open(path).map_err(Self::map_err)?;
        Self::init(conn)
    }

    pub fn open_in_memory() -> Result<Self, KvError> {
        let conn = rusqlite::Connection::open_in_memory().map_err(Self::map_err)?;
        Self::init(conn)
    }

    fn init(conn: rusqlite::Connection) -> Result<Self, KvError> {
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS kv_entries (
                key TEXT PRIMARY KEY,
                value BLOB NOT NULL,
                version INTEGER NOT NULL DEFAULT 1,
                updated_at INTEGER NOT NULL
            );
            "#,
        )
        .map_err(Self::map_err)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Number of writes recorded for `key`, if present.
    pub async fn version(&self, key: &KvKey) -> Result<Option<u64>, KvError> {
        use rusqlite::OptionalExtension;

        let conn = self.conn.lock().await;
        let version: Option<i64> = conn
            .query_row(
                "SELECT version FROM kv_entries WHERE key = ?1",
                [key.raw()],
                |row| row.get(0),
            )
            .optional()
            .map_err(Self::map_err)?;
        Ok(version.map(|v| v as u64))
    }

    fn map_err(e: rusqlite::Error) -> KvError {
        let retryable = matches!(
            e.sqlite_error_code(),
            Some(rusqlite::ErrorCode::DatabaseBusy | rusqlite::ErrorCode::DatabaseLocked)
        );
        KvError::Storage {
            message: e.to_string(),
            retryable,
        }
    }
}

#[cfg(not(target_arch = "wasm32"))]
#[async_trait::async_trait]
impl KeyValueStore for SqliteKvStore {
    async fn get(&self, key: &KvKey) -> Result<Option<Vec<u8>>, KvError> {
        use rusqlite::OptionalExtension;

        let conn = self.conn.lock().await;
        conn.query_row(
            "SELECT value FROM kv_entries WHERE key = ?1",
            [key.raw()],
            |row| row.get::<_, Vec<u8>>(0),
        )
        .optional()
        .map_err(Self::map_err)
    }

    async fn set(&self, key: &KvKey, value: Vec<u8>) -> Result<(), KvError> {
        check_value_size(&value)?;
        let now = crate::get_current_time_ms() as i64;
        let conn = self.conn.lock().await;
        conn.execute(
            r#"
            INSERT INTO kv_entries (key, value, version, updated_at)
            VALUES (?1, ?2, 1, ?3)
            ON CONFLICT(key) DO UPDATE SET
                value = excluded.value,
                version = kv_entries.version + 1,
                updated_at = excluded.updated_at
            "#,
            rusqlite::params![key.raw(), value, now],
        )
        .map_err(Self::map_err)?;
        Ok(())
    }

    async fn delete(&self, key: &KvKey) -> Result<bool, KvError> {
        let conn = self.conn.lock().await;
        let affected = conn
            .execute("DELETE FROM kv_entries WHERE key = ?1", [key.raw()])
            .map_err(Self::map_err)?;
        Ok(affected > 0)
    }
}

// ============================================================================
// Typed access
// ============================================================================

/// JSON-encoded values of one type under one namespace.
pub struct TypedKvStore<T, S> {
    namespace: KeyNamespace,
    store: Arc<S>,
    _phantom: PhantomData<fn() -> T>,
}

impl<T, S> TypedKvStore<T, S>
where
    T: Serialize + DeserializeOwned,
    S: KeyValueStore,
{
    pub fn new(namespace: KeyNamespace, store: Arc<S>) -> Self {
        Self {
            namespace,
            store,
            _phantom: PhantomData,
        }
    }

    pub async fn load(&self, key: &str) -> Result<Option<T>, KvError> {
        let key = KvKey::new(self.namespace.clone(), key)?;
        match self.store.get(&key).await? {
            Some(bytes) => serde_json::from_slice(&bytes)
                .map(Some)
                .map_err(|e| KvError::Serialization {
                    message: e.to_string(),
                    key: Some(key.raw()),
                }),
            None => Ok(None),
        }
    }

    pub async fn save(&self, key: &str, value: &T) -> Result<(), KvError> {
        let key = KvKey::new(self.namespace.clone(), key)?;
        let data = serde_json::to_vec(value).map_err(|e| KvError::Serialization {
            message: e.to_string(),
            key: Some(key.raw()),
        })?;
        self.store.set(&key, data).await
    }

    pub async fn remove(&self, key: &str) -> Result<bool, KvError> {
        let key = KvKey::new(self.namespace.clone(), key)?;
        self.store.delete(&key).await
    }
}
