// Copyright 2024 contributors to BeholdFS.

//! The error kinds of the tag index and filter engine (spec §7).
//!
//! The POSIX translator (`posix`) maps each variant to an errno; the
//! core itself never touches `libc`.

use thiserror::Error;

/// Crate-wide result alias, as used throughout the engine.
pub type Result<T> = std::result::Result<T, Error>;

#[non_exhaustive]
#[derive(Debug, Error)]
pub enum Error {
    /// The parser rejected a virtual path (spec §4.1 rule 6).
    #[error("malformed path: {path:?}")]
    MalformedPath { path: String },

    /// The named object does not exist in the metadata store.
    #[error("not found: {name:?}")]
    NotFound { name: String },

    /// The named object exists but is suppressed by the active filter.
    ///
    /// Distinct from `NotFound` so the POSIX translator can let
    /// directory traversal succeed while a hidden file surfaces as
    /// `EACCES` (spec §7).
    #[error("hidden by filter: {name:?}")]
    Hidden { name: String },

    /// `create` collided with an existing object.
    #[error("already exists: {name:?}")]
    Exists { name: String },

    /// A metadata file's stored major version exceeds this binary's.
    #[error("metadata version {found} is newer than the supported {supported}")]
    VersionTooNew { found: String, supported: String },

    /// An invariant was violated; this indicates a programming error.
    #[error("internal error: {message}")]
    Internal { message: String },

    /// I/O failure talking to the backing store.
    #[error("backing store I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// I/O or constraint failure talking to a metadata store.
    #[error("metadata store error: {0}")]
    Sqlite(#[from] rusqlite::Error),
}

impl Error {
    pub fn not_found(name: impl Into<String>) -> Error {
        Error::NotFound { name: name.into() }
    }

    pub fn hidden(name: impl Into<String>) -> Error {
        Error::Hidden { name: name.into() }
    }

    pub fn exists(name: impl Into<String>) -> Error {
        Error::Exists { name: name.into() }
    }

    pub fn internal(message: impl Into<String>) -> Error {
        Error::Internal {
            message: message.into(),
        }
    }

    pub fn malformed_path(path: impl Into<String>) -> Error {
        Error::MalformedPath { path: path.into() }
    }
}
