use std::fmt;
use std::io;
use std::path::PathBuf;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("key not found: {0}")]
    NotFound(String),

    #[error("key already exists with different content: {0}")]
    KeyExists(String),

    #[error("invalid store key '{key}': {reason}")]
    InvalidKey { key: String, reason: &'static str },

    #[error("store io error: {0}")]
    Io(#[from] io::Error),
}

/// Fatal outcomes of the exchange protocol. Each variant aborts the step.
#[derive(Debug, Error)]
pub enum ExchangeError {
    #[error("test command `{command}` failed: {reason}")]
    TestFailure { command: String, reason: String },

    #[error("failed to transfer fragment '{}' to key '{key}': {reason}", .fragment.display())]
    TransferFailure {
        fragment: PathBuf,
        key: String,
        reason: String,
    },

    #[error("expected fragment '{key}' is missing from the shared store")]
    MissingFragment { key: String },

    #[error("cannot build coverage database: {0}")]
    ReportFailure(String),

    #[error("total coverage {actual:.2}% is below the required {required:.2}%")]
    BelowThreshold { actual: f64, required: f64 },

    #[error("invalid fragment pattern '{pattern}': {reason}")]
    Pattern { pattern: String, reason: String },

    #[error("io error at '{}': {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error(transparent)]
    Store(#[from] StoreError),
}

impl ExchangeError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: io::Error) -> Self {
        ExchangeError::Io {
            path: path.into(),
            source,
        }
    }
}

pub type Result<T> = std::result::Result<T, ExchangeError>;

/// A non-fatal problem with one fragment or one reported file.
///
/// Issues are logged and skipped so the aggregate report still completes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileReportIssue {
    pub subject: String,
    pub reason: String,
}

impl FileReportIssue {
    pub fn new(subject: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            subject: subject.into(),
            reason: reason.into(),
        }
    }
}

impl fmt::Display for FileReportIssue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.subject, self.reason)
    }
}
