use thiserror::Error;

#[derive(Debug, Error)]
pub enum PersistError {
    #[error("Failed to open database '{dsn}': {source}")]
    Open {
        dsn: String,
        #[source]
        source: tokio_rusqlite::Error,
    },
    #[error("Database error during {context}: {source}")]
    Call {
        context: &'static str,
        #[source]
        source: tokio_rusqlite::Error,
    },
    #[error("Failed to encode or decode {context}: {source}")]
    Decode {
        context: &'static str,
        #[source]
        source: serde_json::Error,
    },
    #[error("Test run not found: {id}")]
    NotFound { id: String },
}

pub type PersistResult<T> = Result<T, PersistError>;
