//! Error taxonomy for the tool-call surface.
//!
//! Every tool handler returns a [`LibrarianResult`]; the dispatch layer in
//! `librarian-mcp` converts the `Err` side into a structured `{kind,
//! message}` response and never lets a panic or a bare `anyhow::Error`
//! escape to the client.

use std::path::PathBuf;
use thiserror::Error;

/// The exhaustive set of failure kinds a tool call can surface.
///
/// `ParseError` is deliberately absent: per-file parse failures are
/// recorded as diagnostics on the affected file, never as a tool-call
/// failure (see [`crate::model::FileSummary::parse_error`]).
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    InvalidArgument,
    PermissionDenied,
    NotFound,
    AlreadyExists,
    EditNotFound,
    EditAmbiguous,
    Conflict,
    Timeout,
    Cancelled,
    UnknownTaskType,
    Internal,
}

/// A structured failure carrying a [`ErrorKind`] and a human-readable message.
#[derive(Error, Debug, Clone)]
#[error("{kind:?}: {message}")]
pub struct LibrarianError {
    pub kind: ErrorKind,
    pub message: String,
}

pub type LibrarianResult<T> = Result<T, LibrarianError>;

impl LibrarianError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn invalid_argument(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::InvalidArgument, message)
    }

    pub fn permission_denied(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::PermissionDenied, message)
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::NotFound, message)
    }

    pub fn already_exists(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::AlreadyExists, message)
    }

    pub fn edit_not_found(old_text: &str) -> Self {
        Self::new(
            ErrorKind::EditNotFound,
            format!("text not found in file: {old_text:?}"),
        )
    }

    pub fn edit_ambiguous(old_text: &str, occurrences: usize) -> Self {
        Self::new(
            ErrorKind::EditAmbiguous,
            format!("text occurs {occurrences} times, expected exactly once: {old_text:?}"),
        )
    }

    pub fn conflict(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Conflict, message)
    }

    pub fn unknown_task_type(task_type: &str) -> Self {
        Self::new(
            ErrorKind::UnknownTaskType,
            format!("unrecognized task type: {task_type:?}"),
        )
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Internal, message)
    }

    pub fn path_not_in_allowlist(path: &PathBuf) -> Self {
        Self::permission_denied(format!("'{}' is outside the allow-list", path.display()))
    }
}

impl From<std::io::Error> for LibrarianError {
    fn from(err: std::io::Error) -> Self {
        match err.kind() {
            std::io::ErrorKind::NotFound => Self::not_found(err.to_string()),
            std::io::ErrorKind::PermissionDenied => Self::permission_denied(err.to_string()),
            std::io::ErrorKind::AlreadyExists => Self::already_exists(err.to_string()),
            _ => Self::internal(err.to_string()),
        }
    }
}

impl From<serde_json::Error> for LibrarianError {
    fn from(err: serde_json::Error) -> Self {
        Self::internal(format!("json error: {err}"))
    }
}
