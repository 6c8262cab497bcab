//! Error types for the humble-vault library.

use std::fmt;

use thiserror::Error;

use crate::coordinator::JobKind;

/// Errors that can occur while indexing, storing or downloading assets.
#[derive(Error, Debug)]
pub enum Error {
    /// HTTP request error.
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// I/O error during file operations.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Error from the asset database.
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// Malformed JSON from the catalog or a cache file.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// The remote answered with a non-success status.
    #[error("{url} returned status {status}")]
    Status {
        /// Requested URL, without query string.
        url: String,
        /// HTTP status code.
        status: u16,
    },

    /// The account cannot mint trove download URLs.
    #[error("account does not have access to the Humble Trove")]
    TroveAccessDenied,

    /// No session credential is configured.
    #[error("session credential and library path are required")]
    MissingSession,

    /// A single-flight job of this kind is already running.
    #[error("{0} already in progress")]
    AlreadyRunning(JobKind),

    /// The operation was cancelled cooperatively.
    #[error("operation cancelled")]
    Cancelled,

    /// Invalid configuration value.
    #[error("configuration error: {0}")]
    Config(String),

    /// A background task panicked or was aborted.
    #[error("background task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
}

impl Error {
    /// Returns true for errors that abort a whole pass rather than one item.
    #[must_use]
    pub const fn is_fatal(&self) -> bool {
        matches!(self, Self::TroveAccessDenied | Self::MissingSession)
    }
}

/// A specialized `Result` type for humble-vault operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Why a single download target failed.
///
/// Recorded on the asset row as `download_error` via [`FailureReason::tag`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FailureReason {
    /// The request could not be sent or the stream broke.
    Request(String),
    /// The server answered with a non-2xx status.
    Status(u16),
    /// The stream ended before the declared `Content-Length`.
    SizeMismatch {
        /// Declared length.
        expected: u64,
        /// Bytes actually received.
        actual: u64,
    },
    /// A directory or file could not be created or renamed.
    Filesystem(String),
    /// A trove file has no machine name to sign a url with.
    MissingMachineName,
}

impl FailureReason {
    /// Short stable tag stored alongside the asset.
    #[must_use]
    pub fn tag(&self) -> String {
        match self {
            Self::Request(_) => "request_failed".to_string(),
            Self::Status(code) => format!("status_{code}"),
            Self::SizeMismatch { .. } => "size_mismatch".to_string(),
            Self::Filesystem(_) => "filesystem".to_string(),
            Self::MissingMachineName => "missing_machine_name".to_string(),
        }
    }
}

impl fmt::Display for FailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Request(e) => write!(f, "request failed: {e}"),
            Self::Status(code) => write!(f, "remote returned status {code}"),
            Self::SizeMismatch { expected, actual } => {
                write!(f, "download incomplete: {actual} of {expected} bytes")
            }
            Self::Filesystem(e) => write!(f, "filesystem error: {e}"),
            Self::MissingMachineName => write!(f, "trove file has no machine name"),
        }
    }
}
