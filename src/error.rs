//! Application-wide error types.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum AppError {
    #[error("config error: {0}")]
    Config(String),

    #[error("logger error: {0}")]
    Logger(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// Non-recoverable store failure (bad SQL, constraint other than a
    /// duplicate key, corrupt database).
    #[error("store error: {0}")]
    Store(String),

    /// Store failure that may succeed on a fresh connection
    /// (busy, locked, cannot open, I/O).
    #[error("transient store error: {0}")]
    Transient(String),

    /// Malformed input file; the message names the file.
    #[error("input error: {0}")]
    Input(String),

    #[error("tagger error: {0}")]
    Tagger(String),

    #[error("resource error: {0}")]
    Resource(String),
}

impl AppError {
    /// `true` when retrying the same logical operation on a fresh connection
    /// may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, AppError::Transient(_))
    }

    /// Classify a rusqlite failure into [`AppError::Transient`] or
    /// [`AppError::Store`], prefixing `context`.
    pub fn from_sqlite(context: &str, e: rusqlite::Error) -> Self {
        use rusqlite::ErrorCode;

        let transient = match &e {
            rusqlite::Error::SqliteFailure(f, _) => matches!(
                f.code,
                ErrorCode::DatabaseBusy
                    | ErrorCode::DatabaseLocked
                    | ErrorCode::CannotOpen
                    | ErrorCode::SystemIoFailure
            ),
            _ => false,
        };
        if transient {
            AppError::Transient(format!("{context}: {e}"))
        } else {
            AppError::Store(format!("{context}: {e}"))
        }
    }
}
