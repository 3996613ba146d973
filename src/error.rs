// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Error types for torstream.
//!
//! Library errors are typed so callers can tell a missing record from a
//! storage failure from an engine refusal. [`format_error`] renders an error
//! for the terminal with possible causes and suggested fixes.

use std::path::PathBuf;
use std::time::Duration;

use crate::download::types::{DownloadId, DownloadStatus};

/// Failure reading or writing the persisted download collection.
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("I/O error on {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to serialize downloads: {0}")]
    Serialize(#[source] serde_json::Error),

    #[error("failed to parse {path:?}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("timed out after {timeout:?} waiting for lock on {path:?}; another instance may be writing")]
    LockTimeout { path: PathBuf, timeout: Duration },

    #[error("another torstream process is using {path:?}")]
    InUse { path: PathBuf },

    #[error("storage task failed: {0}")]
    Join(String),
}

/// Failure reported by the torrent engine for a command.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum EngineError {
    /// The engine has no session for this download.
    #[error("no engine session for download {0}")]
    NotFound(DownloadId),

    /// Retryable failure; no automatic retry is performed.
    #[error("transient engine error: {0}")]
    Transient(String),

    /// Unrecoverable failure for this download.
    #[error("fatal engine error: {0}")]
    Fatal(String),
}

impl EngineError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, EngineError::NotFound(_))
    }
}

/// Failure of a registry operation.
#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("download {0} not found")]
    NotFound(DownloadId),

    #[error(transparent)]
    Storage(#[from] StorageError),
}

/// Failure of a user intent on the download manager.
#[derive(Debug, thiserror::Error)]
pub enum ManagerError {
    #[error("download {0} not found")]
    NotFound(DownloadId),

    #[error("cannot {action} download {id} while it is {status}")]
    InvalidTransition {
        id: DownloadId,
        action: &'static str,
        status: DownloadStatus,
    },

    #[error("download {0} has no content location yet")]
    NoLocation(DownloadId),

    #[error("source URI must not be empty")]
    EmptySource,

    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error(transparent)]
    Engine(#[from] EngineError),

    #[error("failed to read content at {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl From<RegistryError> for ManagerError {
    fn from(err: RegistryError) -> Self {
        match err {
            RegistryError::NotFound(id) => ManagerError::NotFound(id),
            RegistryError::Storage(e) => ManagerError::Storage(e),
        }
    }
}

impl ManagerError {
    /// The engine error carried by this failure, if any.
    pub fn engine_error(&self) -> Option<&EngineError> {
        match self {
            ManagerError::Engine(e) => Some(e),
            _ => None,
        }
    }
}

/// Formats an error message with title, causes and fixes for the terminal.
///
/// # Example
///
/// ```
/// use torstream::error::format_error;
///
/// let error = format_error(
///     "Failed to load downloads",
///     &["Download list was edited by hand"],
///     &["Inspect ~/.torstream/downloads.json"],
/// );
/// assert!(error.contains("Possible causes:"));
/// ```
pub fn format_error(title: &str, causes: &[&str], fixes: &[&str]) -> String {
    let mut output = format!("[✗] {}\n", title);

    if !causes.is_empty() {
        output.push_str("\nPossible causes:\n");
        for cause in causes {
            output.push_str(&format!("  - {}\n", cause));
        }
    }

    if !fixes.is_empty() {
        output.push_str("\nTry these fixes:\n");
        for (i, fix) in fixes.iter().enumerate() {
            output.push_str(&format!("  {}. {}\n", i + 1, fix));
        }
    }

    output
}

/// Render a manager error with hints matched to its kind.
pub fn describe_manager_error(err: &ManagerError) -> String {
    let title = err.to_string();
    match err {
        ManagerError::NotFound(_) => format_error(
            &title,
            &["The download was removed", "The id was mistyped"],
            &["List downloads: torstream list"],
        ),
        ManagerError::InvalidTransition { .. } => format_error(
            &title,
            &[],
            &["Check the current state: torstream show <id>"],
        ),
        ManagerError::NoLocation(_) => format_error(
            &title,
            &["Torrent metadata has not been received yet"],
            &["Resume the download and wait for metadata: torstream resume <id>"],
        ),
        ManagerError::Storage(StorageError::LockTimeout { .. }) => format_error(
            &title,
            &["Another torstream process is writing the download list"],
            &["Wait for the other process to finish and retry"],
        ),
        ManagerError::Storage(StorageError::InUse { .. }) => format_error(
            &title,
            &["A download is being followed in another terminal"],
            &[
                "Press Ctrl-C in the other terminal to pause it, then retry",
                "Use a separate data directory: torstream --data-dir <dir> ...",
            ],
        ),
        ManagerError::Storage(_) => format_error(
            &title,
            &["The data directory is not writable", "The download list is corrupted"],
            &["Check permissions on the data directory", "Inspect downloads.json"],
        ),
        _ => format_error(&title, &[], &[]),
    }
}
