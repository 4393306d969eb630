use crate::models::DayIdentity;
use thiserror::Error;

/// The durable store could not be read or rejected a write.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("duckdb: {0}")]
    Db(#[from] duckdb::Error),
    #[error("raw snapshot could not be encoded: {0}")]
    Encode(#[from] serde_json::Error),
    #[error("store rejected the write: {0}")]
    Rejected(String),
}

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("configuration missing: {0}")]
    ConfigurationMissing(String),
    #[error("storage failure on {identity}: {source}")]
    Storage {
        identity: DayIdentity,
        #[source]
        source: StorageError,
    },
}
