use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::fs::File;
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use thiserror::Error;

use crate::capabilities::{KeyNamespace, KeyValueStore, KvError, KvKey};
use crate::model::QueueItem;
use crate::rate_window::RateWindow;

const CURRENT_SCHEMA_VERSION: u32 = 1;
const MAX_STATE_BYTES: usize = 16 * 1024 * 1024;
pub const MAX_PERSISTED_ITEMS: usize = 10_000;
const STATE_MAGIC: &[u8; 4] = b"SMSQ";
const STATE_KEY: &str = "state";

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("kv error: {0}")]
    Kv(#[from] KvError),

    #[error("corrupted state: {reason}")]
    Corrupted { reason: &'static str },

    #[error("integrity check failed: expected {expected}, got {actual}")]
    IntegrityCheckFailed { expected: String, actual: String },

    #[error("schema version {found} is newer than supported {max}")]
    FutureSchema { found: u32, max: u32 },

    #[error("unknown schema version: {0}")]
    UnknownSchema(u32),

    #[error("state too large: {size} bytes, max {max}")]
    StateTooLarge { size: usize, max: usize },

    #[error("too many queued items: {count}, max {max}")]
    TooManyItems { count: usize, max: usize },

    #[error("storage task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
}

impl StoreError {
    /// The stored bytes were read but do not hold a usable queue state.
    pub fn is_unreadable_state(&self) -> bool {
        matches!(
            self,
            StoreError::Serialization(_)
                | StoreError::Corrupted { .. }
                | StoreError::IntegrityCheckFailed { .. }
                | StoreError::FutureSchema { .. }
                | StoreError::UnknownSchema(_)
                | StoreError::StateTooLarge { .. }
                | StoreError::TooManyItems { .. }
        )
    }

    pub fn is_retryable(&self) -> bool {
        match self {
            StoreError::Kv(e) => e.is_retryable(),
            StoreError::Io(_) | StoreError::Task(_) => true,
            _ => false,
        }
    }
}

impl From<ciborium::de::Error<std::io::Error>> for StoreError {
    fn from(e: ciborium::de::Error<std::io::Error>) -> Self {
        StoreError::Serialization(e.to_string())
    }
}

impl From<ciborium::ser::Error<std::io::Error>> for StoreError {
    fn from(e: ciborium::ser::Error<std::io::Error>) -> Self {
        StoreError::Serialization(e.to_string())
    }
}

/// The persisted aggregate: pending items in FIFO order plus the quota window.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueState {
    pub items: VecDeque<QueueItem>,
    pub window: RateWindow,
}

impl QueueState {
    pub fn new(window: RateWindow) -> Self {
        Self {
            items: VecDeque::new(),
            window,
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>, StoreError> {
        if self.items.len() > MAX_PERSISTED_ITEMS {
            return Err(StoreError::TooManyItems {
                count: self.items.len(),
                max: MAX_PERSISTED_ITEMS,
            });
        }

        let mut payload = Vec::new();
        ciborium::into_writer(self, &mut payload)?;

        let checksum = blake3::hash(&payload);
        let envelope = StateEnvelope {
            magic: *STATE_MAGIC,
            schema_version: CURRENT_SCHEMA_VERSION,
            checksum: *checksum.as_bytes(),
            payload,
        };

        let mut bytes = Vec::new();
        ciborium::into_writer(&envelope, &mut bytes)?;
        Ok(bytes)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, StoreError> {
        if bytes.is_empty() {
            return Err(StoreError::Corrupted {
                reason: "empty state",
            });
        }
        if bytes.len() > MAX_STATE_BYTES {
            return Err(StoreError::StateTooLarge {
                size: bytes.len(),
                max: MAX_STATE_BYTES,
            });
        }

        let envelope: StateEnvelope = ciborium::from_reader(bytes)?;

        if envelope.magic != *STATE_MAGIC {
            return Err(StoreError::Corrupted {
                reason: "invalid magic bytes",
            });
        }

        if envelope.schema_version > CURRENT_SCHEMA_VERSION {
            return Err(StoreError::FutureSchema {
                found: envelope.schema_version,
                max: CURRENT_SCHEMA_VERSION,
            });
        }

        let actual = blake3::hash(&envelope.payload);
        if actual.as_bytes() != &envelope.checksum {
            return Err(StoreError::IntegrityCheckFailed {
                expected: hex::encode(envelope.checksum),
                actual: hex::encode(actual.as_bytes()),
            });
        }

        let state = match envelope.schema_version {
            CURRENT_SCHEMA_VERSION => {
                ciborium::from_reader::<QueueState, _>(&envelope.payload[..])?
            }
            other => return Err(StoreError::UnknownSchema(other)),
        };

        if state.items.len() > MAX_PERSISTED_ITEMS {
            return Err(StoreError::TooManyItems {
                count: state.items.len(),
                max: MAX_PERSISTED_ITEMS,
            });
        }

        Ok(state)
    }
}

#[derive(Serialize, Deserialize, Debug)]
struct StateEnvelope {
    magic: [u8; 4],
    schema_version: u32,
    checksum: [u8; 32],
    payload: Vec<u8>,
}

/// Durable home of the queue. Only `QueueManager` writes through it.
#[async_trait]
pub trait QueueStore: Send + Sync {
    async fn save_state(&self, state: &QueueState) -> Result<(), StoreError>;

    /// `None` when nothing was ever saved.
    async fn load_state(&self) -> Result<Option<QueueState>, StoreError>;
}

/// Single-file store with atomic replace.
#[derive(Debug, Clone)]
pub struct FileQueueStore {
    path: PathBuf,
}

impl FileQueueStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn write_atomic(path: &Path, bytes: &[u8]) -> Result<(), StoreError> {
        let tmp_path = path.with_extension("tmp");

        let mut file = File::create(&tmp_path)?;
        file.write_all(bytes)?;
        file.sync_all()?;

        std::fs::rename(&tmp_path, path)?;

        if let Some(parent) = path.parent() {
            if let Ok(dir) = File::open(parent) {
                let _ = dir.sync_all();
            }
        }

        Ok(())
    }
}

#[async_trait]
impl QueueStore for FileQueueStore {
    async fn save_state(&self, state: &QueueState) -> Result<(), StoreError> {
        let bytes = state.encode()?;
        let path = self.path.clone();
        tokio::task::spawn_blocking(move || Self::write_atomic(&path, &bytes)).await?
    }

    async fn load_state(&self) -> Result<Option<QueueState>, StoreError> {
        let path = self.path.clone();
        let bytes = tokio::task::spawn_blocking(move || match std::fs::read(&path) {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e),
        })
        .await??;

        bytes.map(|b| QueueState::decode(&b)).transpose()
    }
}

/// Stores the encoded state as one value in a key-value primitive.
pub struct KvQueueStore<K: KeyValueStore> {
    kv: K,
    key: KvKey,
}

impl<K: KeyValueStore> KvQueueStore<K> {
    pub fn new(kv: K) -> Result<Self, StoreError> {
        Ok(Self {
            kv,
            key: KvKey::new(KeyNamespace::SmsQueue, STATE_KEY)?,
        })
    }

    pub fn kv(&self) -> &K {
        &self.kv
    }
}

#[async_trait]
impl<K: KeyValueStore> QueueStore for KvQueueStore<K> {
    async fn save_state(&self, state: &QueueState) -> Result<(), StoreError> {
        let bytes = state.encode()?;
        self.kv.set(&self.key, bytes).await?;
        Ok(())
    }

    async fn load_state(&self) -> Result<Option<QueueState>, StoreError> {
        match self.kv.get(&self.key).await? {
            Some(bytes) => QueueState::decode(&bytes).map(Some),
            None => Ok(None),
        }
    }
}
