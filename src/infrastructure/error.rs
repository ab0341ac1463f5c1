use thiserror::Error;

#[derive(Debug, Error)]
pub enum InfraError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("Invalid config: {0}")]
    InvalidConfig(String),
    #[error("Invalid input: {0}")]
    InvalidInput(String),
    #[error("Storage error: {0}")]
    Storage(String),
    #[error("Credential error: {0}")]
    Credential(String),
    #[error("Not found: {0}")]
    NotFound(String),
    #[error("{0}")]
    Authentication(String),
    #[error("Remote calendar error: {0}")]
    Remote(String),
    #[error("Failed to update event: {0}")]
    Update(String),
    #[error("Injection failed: {0}")]
    Injection(String),
    #[error("Message rejected: {0}")]
    Rejected(String),
    #[error("Receiving end disconnected: {0}")]
    Disconnected(String),
}
