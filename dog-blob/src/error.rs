use thiserror::Error;

/// Result type for blob operations
pub type BlobResult<T> = Result<T, BlobError>;

/// Errors that can occur during blob operations
///
/// "Not found" and "revision did not match" are not errors: repositories and
/// clients report them as `None` / `false`.
#[derive(Error, Debug)]
pub enum BlobError {
    #[error("Invalid request: {message}")]
    Invalid { message: String },

    #[error("Digests not equal: expected {expected}, actual {actual}")]
    DigestsNotEqual { expected: String, actual: String },

    #[error("Resource too large: content exceeds {size_maximum} bytes")]
    ResourceTooLarge { size_maximum: u64 },

    #[error("Blob not found: {id}")]
    NotFound { id: String },

    #[error("Conflict: {message}")]
    Conflict { message: String },

    #[error("Operation cancelled")]
    Cancelled,

    #[error("Storage backend error: {source}")]
    Backend {
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    #[error("I/O error: {source}")]
    Io {
        #[from]
        source: std::io::Error,
    },

    #[error("Serialization error: {source}")]
    Serialization {
        #[from]
        source: serde_json::Error,
    },
}

impl BlobError {
    /// Create a backend error from any error type
    pub fn backend<E>(error: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        Self::Backend {
            source: Box::new(error),
        }
    }

    /// Create an invalid request error
    pub fn invalid<S: Into<String>>(message: S) -> Self {
        Self::Invalid {
            message: message.into(),
        }
    }

    /// Create a not found error
    pub fn not_found<S: Into<String>>(id: S) -> Self {
        Self::NotFound { id: id.into() }
    }

    /// Create a conflict error
    pub fn conflict<S: Into<String>>(message: S) -> Self {
        Self::Conflict {
            message: message.into(),
        }
    }

    /// Create a digest mismatch error carrying both values
    pub fn digests_not_equal<E: Into<String>, A: Into<String>>(expected: E, actual: A) -> Self {
        Self::DigestsNotEqual {
            expected: expected.into(),
            actual: actual.into(),
        }
    }

    /// HTTP status an API layer should answer with.
    pub fn status_code(&self) -> u16 {
        match self {
            BlobError::Invalid { .. } | BlobError::DigestsNotEqual { .. } => 400,
            BlobError::NotFound { .. } => 404,
            BlobError::Conflict { .. } => 409,
            BlobError::ResourceTooLarge { .. } => 413,
            BlobError::Cancelled => 499,
            BlobError::Backend { .. } | BlobError::Io { .. } | BlobError::Serialization { .. } => 500,
        }
    }

    /// True for integrity failures detected after content was streamed.
    pub fn is_integrity(&self) -> bool {
        matches!(
            self,
            BlobError::DigestsNotEqual { .. } | BlobError::ResourceTooLarge { .. }
        )
    }
}

#[cfg(feature = "postgres")]
impl From<sqlx::Error> for BlobError {
    fn from(err: sqlx::Error) -> Self {
        Self::backend(err)
    }
}
