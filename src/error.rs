//! Error types for spann.

use std::path::PathBuf;
use thiserror::Error;

/// Errors that can occur while building, loading, searching or mutating an index.
#[derive(Debug, Error)]
pub enum SpannError {
    /// Generic operation failure (backend build/load failure, aborted phase).
    #[error("operation failed: {0}")]
    Fail(String),

    /// Operation requires an already-built index or a non-empty store.
    #[error("index is empty")]
    EmptyIndex,

    /// Caller supplied zero vectors.
    #[error("no vectors supplied")]
    EmptyData,

    /// Vector dimension disagrees with the index dimension.
    #[error("dimension mismatch: index has {expected} dimensions, input has {actual}")]
    DimensionSizeMismatch { expected: usize, actual: usize },

    /// Delete on an absent or already-deleted id.
    #[error("vector {0} not found")]
    VectorNotFound(u32),

    /// Delete-by-content found no matching vector.
    #[error("no matching vector found")]
    ExternalAbort,

    /// Artifact could not be created.
    #[error("failed to create {path}: {source}")]
    FailedCreateFile {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Artifact could not be opened.
    #[error("failed to open {path}: {source}")]
    FailedOpenFile {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Configuration value could not be parsed.
    #[error("invalid value {value:?} for parameter {name}")]
    FailedParseValue { name: String, value: String },

    /// A growable store ran out of reserved capacity.
    #[error("capacity exceeded: requested {requested}, capacity {capacity}")]
    CapacityExceeded { requested: usize, capacity: usize },

    /// Malformed persisted data (bad magic, truncated section, corrupt record).
    #[error("format error: {0}")]
    Format(String),

    /// I/O error on an already-open artifact.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Flat status codes, one per error kind plus `Success`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCode {
    Success,
    Fail,
    EmptyIndex,
    EmptyData,
    DimensionSizeMismatch,
    VectorNotFound,
    ExternalAbort,
    FailedCreateFile,
    FailedOpenFile,
    FailedParseValue,
    CapacityExceeded,
}

impl ErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::Success => "SUCCESS",
            ErrorCode::Fail => "FAIL",
            ErrorCode::EmptyIndex => "EMPTY_INDEX",
            ErrorCode::EmptyData => "EMPTY_DATA",
            ErrorCode::DimensionSizeMismatch => "DIMENSION_SIZE_MISMATCH",
            ErrorCode::VectorNotFound => "VECTOR_NOT_FOUND",
            ErrorCode::ExternalAbort => "EXTERNAL_ABORT",
            ErrorCode::FailedCreateFile => "FAILED_CREATE_FILE",
            ErrorCode::FailedOpenFile => "FAILED_OPEN_FILE",
            ErrorCode::FailedParseValue => "FAILED_PARSE_VALUE",
            ErrorCode::CapacityExceeded => "CAPACITY_EXCEEDED",
        }
    }
}

impl SpannError {
    /// Status code for this error.
    ///
    /// Format and I/O errors on already-open artifacts collapse into `Fail`.
    pub fn code(&self) -> ErrorCode {
        match self {
            SpannError::Fail(_) | SpannError::Format(_) | SpannError::Io(_) => ErrorCode::Fail,
            SpannError::EmptyIndex => ErrorCode::EmptyIndex,
            SpannError::EmptyData => ErrorCode::EmptyData,
            SpannError::DimensionSizeMismatch { .. } => ErrorCode::DimensionSizeMismatch,
            SpannError::VectorNotFound(_) => ErrorCode::VectorNotFound,
            SpannError::ExternalAbort => ErrorCode::ExternalAbort,
            SpannError::FailedCreateFile { .. } => ErrorCode::FailedCreateFile,
            SpannError::FailedOpenFile { .. } => ErrorCode::FailedOpenFile,
            SpannError::FailedParseValue { .. } => ErrorCode::FailedParseValue,
            SpannError::CapacityExceeded { .. } => ErrorCode::CapacityExceeded,
        }
    }

    pub(crate) fn create(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        SpannError::FailedCreateFile {
            path: path.into(),
            source,
        }
    }

    pub(crate) fn open(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        SpannError::FailedOpenFile {
            path: path.into(),
            source,
        }
    }
}

impl From<postcard::Error> for SpannError {
    fn from(e: postcard::Error) -> Self {
        SpannError::Format(format!("postcard error: {e}"))
    }
}

impl From<serde_json::Error> for SpannError {
    fn from(e: serde_json::Error) -> Self {
        SpannError::Format(format!("json error: {e}"))
    }
}

impl From<toml::de::Error> for SpannError {
    fn from(e: toml::de::Error) -> Self {
        SpannError::Format(format!("toml error: {e}"))
    }
}

impl From<toml::ser::Error> for SpannError {
    fn from(e: toml::ser::Error) -> Self {
        SpannError::Format(format!("toml error: {e}"))
    }
}

/// Result type for spann operations.
pub type Result<T> = std::result::Result<T, SpannError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_match_kinds() {
        assert_eq!(SpannError::EmptyIndex.code(), ErrorCode::EmptyIndex);
        assert_eq!(SpannError::VectorNotFound(3).code(), ErrorCode::VectorNotFound);
        assert_eq!(
            SpannError::Format("bad magic".into()).code(),
            ErrorCode::Fail
        );
        assert_eq!(
            SpannError::CapacityExceeded {
                requested: 10,
                capacity: 4
            }
            .code()
            .as_str(),
            "CAPACITY_EXCEEDED"
        );
    }

    #[test]
    fn display_names_the_path() {
        let err = SpannError::open(
            "/nope/head.bin",
            std::io::Error::new(std::io::ErrorKind::NotFound, "missing"),
        );
        assert!(err.to_string().contains("/nope/head.bin"));
    }
}
