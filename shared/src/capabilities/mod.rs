//! External collaborators of the queue, expressed as traits.
//!
//! The queue never talks to the radio, the tracking backend or the device
//! settings directly; hosts plug those in through these seams.
mod kv;
mod oracle;
mod probe;
mod sender;

pub use self::kv::{
    KeyNamespace, KeyValueStore, KvError, KvKey, MemoryKv, StorageErrorCode, MAX_KEY_LENGTH,
    MAX_VALUE_SIZE,
};
#[cfg(all(feature = "sqlite", not(target_arch = "wasm32")))]
pub use self::kv::SqliteKv;
pub use self::oracle::{AlwaysRelevant, OracleError, SnapshotOracle, StatusOracle};
pub use self::probe::{
    parse_probe_output, resolve_quota_ceiling, CapacityProbe, FixedProbe, NoProbe, ProbeError,
};
pub use self::sender::{MessageSender, SendError};

