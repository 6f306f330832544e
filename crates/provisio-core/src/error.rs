use std::fmt;
use std::io;
use std::path::PathBuf;

use thiserror::Error;

use crate::hash::ContentHash;

pub type Result<T, E = ProvisionError> = std::result::Result<T, E>;

/// Fieldless classification of [`ProvisionError`], for callers deciding
/// whether to retry with a forced policy, abort, or investigate drift.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    PathNotFound,
    PathAlreadyExists,
    HashMismatch,
    UnitUnknown,
    UnitAlreadyInstalled,
    UnitVersionMismatch,
    NotADirectory,
    DirectoryCreateFailed,
    HistoryCorrupt,
    SerializationFailure,
    InvalidInstruction,
    Io,
}

#[derive(Debug, Error)]
pub enum ProvisionError {
    #[error("path not found: {path}")]
    PathNotFound { path: String },

    #[error("path already exists: {path}")]
    PathAlreadyExists { path: String },

    #[error(
        "hash mismatch for {path}: expected {}, found {}",
        DisplayHash(.expected),
        DisplayHash(.actual)
    )]
    HashMismatch {
        path: String,
        expected: Option<ContentHash>,
        actual: Option<ContentHash>,
    },

    #[error("unit '{unit}' is not installed")]
    UnitUnknown { unit: String },

    #[error("unit '{unit}' is already installed at version {version}")]
    UnitAlreadyInstalled { unit: String, version: String },

    #[error(
        "unit '{unit}' version mismatch: expected {}, found {}",
        DisplayVersion(.expected),
        DisplayVersion(.actual)
    )]
    UnitVersionMismatch {
        unit: String,
        expected: Option<String>,
        actual: Option<String>,
    },

    #[error("not a directory: {}", .path.display())]
    NotADirectory { path: PathBuf },

    #[error("failed to create directory {}: {source}", .path.display())]
    DirectoryCreateFailed {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("history corrupt at {}: {detail}", .path.display())]
    HistoryCorrupt { path: PathBuf, detail: String },

    #[error("serialization failure: {detail}")]
    SerializationFailure { detail: String },

    #[error("invalid instruction: {detail}")]
    InvalidInstruction { detail: String },

    #[error("{action} {}: {source}", .path.display())]
    Io {
        action: &'static str,
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

impl ProvisionError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::PathNotFound { .. } => ErrorKind::PathNotFound,
            Self::PathAlreadyExists { .. } => ErrorKind::PathAlreadyExists,
            Self::HashMismatch { .. } => ErrorKind::HashMismatch,
            Self::UnitUnknown { .. } => ErrorKind::UnitUnknown,
            Self::UnitAlreadyInstalled { .. } => ErrorKind::UnitAlreadyInstalled,
            Self::UnitVersionMismatch { .. } => ErrorKind::UnitVersionMismatch,
            Self::NotADirectory { .. } => ErrorKind::NotADirectory,
            Self::DirectoryCreateFailed { .. } => ErrorKind::DirectoryCreateFailed,
            Self::HistoryCorrupt { .. } => ErrorKind::HistoryCorrupt,
            Self::SerializationFailure { .. } => ErrorKind::SerializationFailure,
            Self::InvalidInstruction { .. } => ErrorKind::InvalidInstruction,
            Self::Io { .. } => ErrorKind::Io,
        }
    }

    pub fn io(action: &'static str, path: impl Into<PathBuf>, source: io::Error) -> Self {
        Self::Io {
            action,
            path: path.into(),
            source,
        }
    }

    pub fn history_corrupt(path: impl Into<PathBuf>, detail: impl Into<String>) -> Self {
        Self::HistoryCorrupt {
            path: path.into(),
            detail: detail.into(),
        }
    }

    pub fn serialization(detail: impl Into<String>) -> Self {
        Self::SerializationFailure {
            detail: detail.into(),
        }
    }

    pub fn invalid_instruction(detail: impl Into<String>) -> Self {
        Self::InvalidInstruction {
            detail: detail.into(),
        }
    }
}

struct DisplayHash<'a>(&'a Option<ContentHash>);

impl fmt::Display for DisplayHash<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.0 {
            Some(hash) => write!(f, "{hash}"),
            None => f.write_str("<absent>"),
        }
    }
}

struct DisplayVersion<'a>(&'a Option<String>);

impl fmt::Display for DisplayVersion<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.0 {
            Some(version) => f.write_str(version),
            None => f.write_str("<none>"),
        }
    }
}
