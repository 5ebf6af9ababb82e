/// Errors from the embedded store.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),

    #[error("migration ledger corrupt: {0}")]
    LedgerCorrupt(String),
}

impl StoreError {
    pub fn error_code(&self) -> &'static str {
        match self {
            StoreError::Sqlite(_) => "store_sqlite_error",
            StoreError::Io(_) => "store_io_error",
            StoreError::Serde(_) => "store_serde_error",
            StoreError::LedgerCorrupt(_) => "store_ledger_corrupt",
        }
    }
}
