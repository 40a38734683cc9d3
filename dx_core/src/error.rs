/// Core error type for dbexporter
#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Database error: {0}")]
    Database(String),

    #[error("Connection lost: {0}")]
    Connection(String),

    #[error("Query failed: {0}")]
    Query(String),

    #[error("Timed out: {0}")]
    Timeout(String),

    #[error("Cancelled: {0}")]
    Cancelled(String),

    #[error("Duplicate data source name: {0}")]
    DuplicateSource(String),

    #[error("Duplicate data source host: {0}")]
    DuplicateHost(String),

    #[error("No data source could be initialized: {0}")]
    NoSources(String),

    #[error("Not initialized: {0}")]
    NotInitialized(String),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Encoding error: {0}")]
    Encode(String),
}

impl Error {
    /// Errors that must stop the exporter from serving at all
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Error::DuplicateSource(_)
                | Error::DuplicateHost(_)
                | Error::NoSources(_)
                | Error::Config(_)
        )
    }

    /// Classify a driver error into connection / timeout / query failures
    pub fn from_sqlx(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::PoolTimedOut => Error::Timeout(err.to_string()),
            sqlx::Error::Io(_)
            | sqlx::Error::Tls(_)
            | sqlx::Error::PoolClosed
            | sqlx::Error::WorkerCrashed
            | sqlx::Error::Protocol(_) => Error::Connection(err.to_string()),
            sqlx::Error::Configuration(_) => Error::Config(err.to_string()),
            other => Error::Query(other.to_string()),
        }
    }
}

impl From<config::ConfigError> for Error {
    fn from(err: config::ConfigError) -> Self {
        Error::Config(err.to_string())
    }
}

/// Result type alias
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fatal_classification() {
        assert!(Error::DuplicateHost("db1:5432/app".to_string()).is_fatal());
        assert!(Error::NoSources("all probes failed".to_string()).is_fatal());
        assert!(!Error::Timeout("ping".to_string()).is_fatal());
        assert!(!Error::Query("ORA-00942".to_string()).is_fatal());
    }

    #[test]
    fn test_sqlx_classification() {
        assert!(matches!(
            Error::from_sqlx(sqlx::Error::PoolTimedOut),
            Error::Timeout(_)
        ));
        assert!(matches!(
            Error::from_sqlx(sqlx::Error::PoolClosed),
            Error::Connection(_)
        ));
        assert!(matches!(
            Error::from_sqlx(sqlx::Error::RowNotFound),
            Error::Query(_)
        ));
    }
}
