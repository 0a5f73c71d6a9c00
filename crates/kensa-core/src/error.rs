//! Error types and handling for plan compilation and test execution

use std::path::PathBuf;
use thiserror::Error;

/// Main error type for KENSA operations
#[derive(Debug, Error)]
pub enum KensaError {
    /// Profile metadata cannot be turned into a test plan
    #[error("Metadata construction error in '{profile}': {message}")]
    MetadataConstruction { profile: String, message: String },

    /// Metadata documents that fail to parse
    #[error("Metadata error in '{path}': {message}")]
    MetadataError { path: PathBuf, message: String },

    /// Configuration loading or validation errors
    #[error("Configuration error: {message}")]
    ConfigError { message: String },

    /// Transport-level failures talking to the server under test
    #[error("HTTP error: {message}")]
    HttpError { message: String },

    /// Terminology collaborator failures that are not downgraded to warnings
    #[error("Terminology error: {message}")]
    TerminologyError { message: String },

    /// File system I/O errors
    #[error("IO error for path '{path}': {source}")]
    IoError {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// JSON (de)serialization errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Execution harness errors
    #[error("Execution error: {message}")]
    ExecutionError { message: String },

    /// Generic internal errors
    #[error("Internal error: {message}")]
    InternalError { message: String },
}

/// Error kind enumeration for categorizing errors
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ErrorKind {
    Construction,
    Metadata,
    Config,
    Http,
    Terminology,
    Io,
    Json,
    Execution,
    Internal,
}

impl KensaError {
    /// Get the error kind for this error
    pub fn kind(&self) -> ErrorKind {
        match self {
            KensaError::MetadataConstruction { .. } => ErrorKind::Construction,
            KensaError::MetadataError { .. } => ErrorKind::Metadata,
            KensaError::ConfigError { .. } => ErrorKind::Config,
            KensaError::HttpError { .. } => ErrorKind::Http,
            KensaError::TerminologyError { .. } => ErrorKind::Terminology,
            KensaError::IoError { .. } => ErrorKind::Io,
            KensaError::Json(_) => ErrorKind::Json,
            KensaError::ExecutionError { .. } => ErrorKind::Execution,
            KensaError::InternalError { .. } => ErrorKind::Internal,
        }
    }

    /// Check if this error is recoverable (other profiles can still be processed)
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self.kind(),
            ErrorKind::Construction | ErrorKind::Http | ErrorKind::Terminology
        )
    }

    /// Create a metadata construction error for a profile
    pub fn construction(profile: impl Into<String>, message: impl Into<String>) -> Self {
        Self::MetadataConstruction {
            profile: profile.into(),
            message: message.into(),
        }
    }

    /// Create a metadata parse error
    pub fn metadata_error(path: impl Into<PathBuf>, message: impl Into<String>) -> Self {
        Self::MetadataError {
            path: path.into(),
            message: message.into(),
        }
    }

    /// Create a configuration error
    pub fn config_error(message: impl Into<String>) -> Self {
        Self::ConfigError {
            message: message.into(),
        }
    }

    /// Create an HTTP error
    pub fn http_error(message: impl Into<String>) -> Self {
        Self::HttpError {
            message: message.into(),
        }
    }

    /// Create a terminology error
    pub fn terminology_error(message: impl Into<String>) -> Self {
        Self::TerminologyError {
            message: message.into(),
        }
    }

    /// Create an IO error with path context
    pub fn io_error(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::IoError {
            path: path.into(),
            source,
        }
    }

    /// Create an execution error
    pub fn execution_error(message: impl Into<String>) -> Self {
        Self::ExecutionError {
            message: message.into(),
        }
    }

    /// Create an internal error
    pub fn internal_error(message: impl Into<String>) -> Self {
        Self::InternalError {
            message: message.into(),
        }
    }
}

/// Convert from std::io::Error
impl From<std::io::Error> for KensaError {
    fn from(err: std::io::Error) -> Self {
        Self::IoError {
            path: PathBuf::new(),
            source: err,
        }
    }
}

impl From<reqwest::Error> for KensaError {
    fn from(err: reqwest::Error) -> Self {
        Self::HttpError {
            message: err.to_string(),
        }
    }
}
