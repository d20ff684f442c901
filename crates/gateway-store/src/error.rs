//! Store error types.

use gateway_core::GatewayError;

/// Result type for store operations.
pub type Result<T> = std::result::Result<T, StoreError>;

/// Store error type.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// Database connection error.
    #[error("Database connection error: {0}")]
    Connection(String),

    /// SQL execution error.
    #[error("SQL execution error: {0}")]
    Execution(String),

    /// Row not found.
    #[error("{what} {id} not found")]
    NotFound {
        /// Kind of row
        what: &'static str,
        /// Row id
        id: i64,
    },

    /// Stored data could not be decoded.
    #[error("Corrupt row: {0}")]
    Corrupt(String),

    /// Pool error.
    #[error("Connection pool error: {0}")]
    Pool(String),

    /// Timeout error.
    #[error("Operation timed out: {0}")]
    Timeout(String),
}

impl StoreError {
    /// Create a connection error.
    pub fn connection(msg: impl Into<String>) -> Self {
        Self::Connection(msg.into())
    }

    /// Check if the error is retryable.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Connection(_) | Self::Timeout(_) | Self::Pool(_))
    }
}

impl From<sqlx::Error> for StoreError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::Configuration(e) => Self::Connection(e.to_string()),
            sqlx::Error::Database(e) => Self::Execution(e.to_string()),
            sqlx::Error::PoolTimedOut => Self::Timeout("Connection pool timed out".to_string()),
            sqlx::Error::PoolClosed => Self::Pool("Connection pool is closed".to_string()),
            sqlx::Error::ColumnDecode { index, source } => {
                Self::Corrupt(format!("column {index}: {source}"))
            }
            _ => Self::Execution(err.to_string()),
        }
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(err: serde_json::Error) -> Self {
        Self::Corrupt(err.to_string())
    }
}

impl From<StoreError> for GatewayError {
    fn from(err: StoreError) -> Self {
        Self::storage(err.to_string())
    }
}
