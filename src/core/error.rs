use thiserror::Error;

/// Failures of the local key/value store.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StoreError {
    #[error("store unavailable")]
    Unavailable,
    #[error("sqlite: {0}")]
    Sqlite(String),
    #[error("encode/decode: {0}")]
    Codec(String),
    #[error("database schema v{found} is newer than supported v{expected}")]
    VersionTooNew { found: u32, expected: u32 },
    #[error("invalid table name {0:?}")]
    InvalidTable(String),
    #[error("{0}")]
    Io(String),
}

impl From<rusqlite::Error> for StoreError {
    fn from(e: rusqlite::Error) -> Self {
        StoreError::Sqlite(e.to_string())
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(e: serde_json::Error) -> Self {
        StoreError::Codec(e.to_string())
    }
}

/// Outcome of a failed record load. Cloneable because one failure is shared by
/// every caller waiting on the same in-flight fetch.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum FetchError {
    /// The remote tracker has no such record (or it was deleted).
    #[error("record not found")]
    NotFound,
    /// Network or parse failure; worth a retry.
    #[error("transport error: {0}")]
    Transport(String),
    /// No attempt was made because the client is offline.
    #[error("offline")]
    Offline,
    #[error("storage error: {0}")]
    Storage(#[from] StoreError),
}

/// Errors that end a session before it starts.
#[derive(Debug, Error)]
pub enum SessionError {
    /// The account database could not be opened. Nothing works without the cache.
    #[error("local database unavailable: {0}")]
    StorageUnavailable(StoreError),
    #[error("configuration: {0}")]
    Config(String),
}
