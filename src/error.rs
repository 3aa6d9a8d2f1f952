use sqlx::error::ErrorKind;
use thiserror::Error;

/// Failure of a single feed retrieval. Always scoped to one feed.
#[derive(Debug, Error)]
pub enum FetchError {
    #[error("network error fetching {url}: {message}")]
    Network { url: String, message: String },

    #[error("{url} responded with HTTP {status}")]
    HttpStatus { url: String, status: u16 },

    #[error("malformed feed document at {url}: {message}")]
    MalformedXml { url: String, message: String },
}

impl FetchError {
    pub fn url(&self) -> &str {
        match self {
            FetchError::Network { url, .. }
            | FetchError::HttpStatus { url, .. }
            | FetchError::MalformedXml { url, .. } => url,
        }
    }
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("storage connection failure: {0}")]
    Connection(#[source] sqlx::Error),

    #[error("constraint violation: {0}")]
    Constraint(String),

    #[error("{0} not found")]
    NotFound(String),
}

impl StoreError {
    /// Whether the error leaves the store in an unknown state.
    pub fn is_fatal(&self) -> bool {
        matches!(self, StoreError::Connection(_))
    }
}

impl From<sqlx::Error> for StoreError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::RowNotFound => StoreError::NotFound("row".to_string()),
            sqlx::Error::Database(db_err)
                if matches!(
                    db_err.kind(),
                    ErrorKind::UniqueViolation
                        | ErrorKind::ForeignKeyViolation
                        | ErrorKind::NotNullViolation
                        | ErrorKind::CheckViolation
                ) =>
            {
                StoreError::Constraint(db_err.message().to_string())
            }
            other => StoreError::Connection(other),
        }
    }
}
