// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use crate::{DocId, Revision};
use std::path::PathBuf;

/// Represents errors that can occur in the storage engine
#[derive(Debug)]
pub enum Error {
    /// I/O error
    Io(std::io::Error),

    /// The database (or one of its tables) could not be opened
    Opening(String),

    /// The database could not be created
    Create(String),

    /// The database is already held open for writing by another handle
    Locked(PathBuf),

    /// On-disk state violates a format invariant
    ///
    /// Fatal to the current operation; not meant to be caught and continued.
    Corrupt(&'static str),

    /// State this handle (or cursor) relied on was overwritten by a writer
    ///
    /// The handle must be reopened (or closed).
    Modified(&'static str),

    /// Document does not exist
    DocNotFound(DocId),

    /// A decoded integer does not fit its target width, or a value is out
    /// of the representable range
    Range(&'static str),

    /// Caller passed an argument that violates an API contract
    InvalidArgument(&'static str),

    /// Operation is not meaningful for this object
    Unimplemented(&'static str),

    /// A table has no base file for the requested revision
    ///
    /// Drives the orchestrator's consistent-open retry loop.
    RevisionNotFound(Revision),
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "StorageError: {self:?}")
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<std::io::Error> for Error {
    fn from(value: std::io::Error) -> Self {
        Self::Io(value)
    }
}

/// Storage engine result
pub type Result<T> = std::result::Result<T, Error>;
