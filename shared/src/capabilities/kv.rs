use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use thiserror::Error;
use tokio::sync::RwLock;

pub const MAX_KEY_LENGTH: usize = 512;
pub const MAX_VALUE_SIZE: usize = 16 * 1024 * 1024;

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
                reason: format!("key exceeds maximum length of {} bytes", MAX_KEY_LENGTH),
            });
        }

        if key.chars().any(|c| c.is_control()) {
            return Err(KvError::InvalidKey {
                key: key.escape_debug().to_string(),
                reason: "key contains control characters".to_string(),
            });
        }

        if key.contains("..") || key.starts_with('/') || key.starts_with('\\') {
            return Err(KvError::InvalidKey {
                key: key.to_string(),
                reason: "key cannot contain path traversal sequences".to_string(),
            });
        }

        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum KeyNamespace {
    SmsQueue,
}

impl KeyNamespace {
    pub fn prefix(&self) -> &str {
        match self {
            KeyNamespace::SmsQueue => "sms_queue",
        }
    }
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum KvError {
    #[error("invalid key '{key}': {reason}")]
    InvalidKey { key: String, reason: String },

    #[error("value too large: {size} bytes exceeds maximum of {max} bytes")]
    ValueTooLarge { size: usize, max: usize },

    #[error("storage error: {message} (code: {code:?}, retryable: {retryable})")]
    Storage {
        code: StorageErrorCode,
        message: String,
        retryable: bool,
    },
}

impl KvError {
    pub fn is_retryable(&self) -> bool {
        match self {
            KvError::Storage { retryable, .. } => *retryable,
            _ => false,
        }
    }

    pub fn storage(code: StorageErrorCode, message: impl Into<String>) -> Self {
        let retryable = code.is_retryable();
        Self::Storage {
            code,
            message: message.into(),
            retryable,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StorageErrorCode {
    Unknown,
    ConnectionFailed,
    Corrupted,
    DiskFull,
    PermissionDenied,
    Busy,
    Locked,
    IoError,
}

impl StorageErrorCode {
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            StorageErrorCode::ConnectionFailed | StorageErrorCode::Busy | StorageErrorCode::Locked
        )
    }
}

/// Durable key-value primitive the queue persists through.
#[async_trait]
pub trait KeyValueStore: Send + Sync {
    async fn get(&self, key: &KvKey) -> Result<Option<Vec<u8>>, KvError>;
    async fn set(&self, key: &KvKey, value: Vec<u8>) -> Result<(), KvError>;
    async fn delete(&self, key: &KvKey) -> Result<bool, KvError>;
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

/// In-process store. Survives manager restarts within one process, which is
/// what the restart tests rely on.
#[derive(Debug, Default)]
pub struct MemoryKv {
    entries: RwLock<HashMap<String, Vec<u8>>>,
}

impl MemoryKv {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl KeyValueStore for MemoryKv {
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

#[cfg(all(feature = "sqlite", not(target_arch = "wasm32")))]
pub use self::sqlite::SqliteKv;

#[cfg(all(feature = "sqlite", not(target_arch = "wasm32")))]
mod sqlite {
    use super::{check_value_size, KeyValueStore, KvError, KvKey, StorageErrorCode};
    use async_trait::async_trait;
    use rusqlite::{params, Connection, OptionalExtension};
    use std::path::Path;
    use std::sync::Mutex;

    /// SQLite-backed store: one table, one row per key.
    pub struct SqliteKv {
        conn: Mutex<Connection>,
    }

    fn map_err(e: rusqlite::Error) -> KvError {
        let code = match &e {
            rusqlite::Error::SqliteFailure(err, _) => match err.code {
                rusqlite::ErrorCode::DatabaseBusy => StorageErrorCode::Busy,
                rusqlite::ErrorCode::DatabaseLocked => StorageErrorCode::Locked,
                rusqlite::ErrorCode::DiskFull => StorageErrorCode::DiskFull,
                rusqlite::ErrorCode::PermissionDenied | rusqlite::ErrorCode::ReadOnly => {
                    StorageErrorCode::PermissionDenied
                }
                rusqlite::ErrorCode::DatabaseCorrupt | rusqlite::ErrorCode::NotADatabase => {
                    StorageErrorCode::Corrupted
                }
                rusqlite::ErrorCode::CannotOpen => StorageErrorCode::ConnectionFailed,
                rusqlite::ErrorCode::SystemIoFailure => StorageErrorCode::IoError,
                _ => StorageErrorCode::Unknown,
            },
            _ => StorageErrorCode::Unknown,
        };
        KvError::storage(code, e.to_string())
    }

    fn poisoned() -> KvError {
        KvError::storage(StorageErrorCode::Locked, "connection mutex poisoned")
    }

    impl SqliteKv {
        pub fn open(path: &Path) -> Result<Self, KvError> {
            let conn = Connection::open(path).map_err(map_err)?;
            Self::init(conn)
        }

        pub fn open_in_memory() -> Result<Self, KvError> {
            let conn = Connection::open_in_memory().map_err(map_err)?;
            Self::init(conn)
        }

        fn init(conn: Connection) -> Result<Self, KvError> {
            conn.execute_batch(
                r#"
                PRAGMA journal_mode = WAL;
                PRAGMA synchronous = NORMAL;
                CREATE TABLE IF NOT EXISTS kv (
                    key TEXT PRIMARY KEY,
                    value BLOB NOT NULL
                );
                "#,
            )
            .map_err(map_err)?;
            Ok(Self {
                conn: Mutex::new(conn),
            })
        }
    }

    #[async_trait]
    impl KeyValueStore for SqliteKv {
        async fn get(&self, key: &KvKey) -> Result<Option<Vec<u8>>, KvError> {
            let conn = self.conn.lock().map_err(|_| poisoned())?;
            conn.query_row(
                "SELECT value FROM kv WHERE key = ?1",
                params![key.raw()],
                |row| row.get::<_, Vec<u8>>(0),
            )
            .optional()
            .map_err(map_err)
        }

        async fn set(&self, key: &KvKey, value: Vec<u8>) -> Result<(), KvError> {
            check_value_size(&value)?;
            let conn = self.conn.lock().map_err(|_| poisoned())?;
            conn.execute(
                "INSERT INTO kv (key, value) VALUES (?1, ?2)
                 ON CONFLICT(key) DO UPDATE SET value = excluded.value",
                params![key.raw(), value],
            )
            .map_err(map_err)?;
            Ok(())
        }

        async fn delete(&self, key: &KvKey) -> Result<bool, KvError> {
            let conn = self.conn.lock().map_err(|_| poisoned())?;
            let removed = conn
                .execute("DELETE FROM kv WHERE key = ?1", params![key.raw()])
                .map_err(map_err)?;
            Ok(removed > 0)
        }
    }
}
