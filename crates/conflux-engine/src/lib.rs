// Partitioned write-coalescing engine.
//
// Inbound partial-update payloads are routed into one FIFO queue per logical
// row ("partition"), squashed field-wise when the queue reaches the chunk
// threshold or goes stale, diffed against the cached full row, and committed
// as a partial UPDATE with at most one in-flight commit per partition.
use serde::de::DeserializeOwned;
use serde_json::Value;
use uuid::Uuid;

pub mod merge;

mod manager;
mod watcher;

pub use manager::{EngineConfig, TableManager};
pub use watcher::PartitionWatcher;

pub type Result<T> = std::result::Result<T, EngineError>;

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("table {0} has no primary key; no partition identity is possible")]
    SchemaMapping(String),
    #[error("chunk size must be at least 1")]
    InvalidChunkSize,
    #[error("table manager already started")]
    AlreadyStarted,
    #[error(transparent)]
    Json(#[from] serde_json::Error),
    #[error(transparent)]
    Store(#[from] conflux_store::StoreError),
    #[error(transparent)]
    Transport(#[from] conflux_transport::TransportError),
}

/// Capability every managed record type provides: decode from a JSON payload
/// and expose a stable partition identity.
pub trait Resource: DeserializeOwned + Send + Sync + 'static {
    /// Deterministic string form of the record's partition identity,
    /// typically the primary key's string form.
    fn partition_key(&self) -> String;
}

/// One inbound patch, owned by its partition's queue until drained.
#[derive(Debug)]
pub struct ChangeRequest<R> {
    /// Caller-visible token for request tracking. Informational only.
    pub request_token: Uuid,
    /// The decoded record the partition key was extracted from.
    pub modified_resource: R,
    /// The raw partial-update payload as received.
    pub patch_json: Value,
    pub partition_key: String,
}
