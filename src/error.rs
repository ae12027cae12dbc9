use std::path::PathBuf;

use thiserror::Error;

/// Result alias for operations that can fail at the scan or persistence level.
pub type Result<T> = std::result::Result<T, ScanError>;

/// Operation-level failures.
///
/// Per-port connect failures never show up here; they are data
/// (`PortState::Closed` / `PortState::Errored`) inside the report.
#[derive(Error, Debug)]
pub enum ScanError {
    /// The request failed validation before anything was dispatched.
    #[error("invalid scan request: {0}")]
    InvalidRequest(String),

    /// The host could not be resolved to an address.
    #[error("failed to resolve host {host}: {reason}")]
    Resolution { host: String, reason: String },

    /// The record store could not be opened or written.
    #[error("failed to append to record store {}: {source}", .path.display())]
    Persistence {
        path: PathBuf,
        #[source]
        source: csv::Error,
    },
}

impl ScanError {
    /// Name of the stage that failed, for operator-facing messages.
    pub fn stage(&self) -> &'static str {
        match self {
            ScanError::InvalidRequest(_) => "request",
            ScanError::Resolution { .. } => "resolution",
            ScanError::Persistence { .. } => "persistence",
        }
    }

    pub(crate) fn persistence(path: impl Into<PathBuf>, source: impl Into<csv::Error>) -> Self {
        ScanError::Persistence {
            path: path.into(),
            source: source.into(),
        }
    }
}
