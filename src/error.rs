//! Crate-wide error type.
//!
//! Every fallible operation returns [`Result`].  The variants map onto the
//! four failure classes of the archive engine plus the duplicate-name case
//! raised by the entry serializer.

use std::io;
use thiserror::Error;

use crate::codec::CodecError;

#[derive(Error, Debug)]
pub enum ArchiveError {
    /// Disk path, entry index or entry name is absent.
    #[error("Not found: {0}")]
    NotFound(String),
    /// Empty name or content, misplaced separators, unsafe path.
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),
    /// The entry name is already present in the archive.
    #[error("Entry already exists: {0}")]
    AlreadyExists(String),
    /// Missing Marker signature, missing/corrupt ArchiveHeader, malformed block.
    #[error("Format error: {0}")]
    Format(String),
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

impl From<CodecError> for ArchiveError {
    fn from(e: CodecError) -> Self {
        ArchiveError::Format(e.to_string())
    }
}

impl ArchiveError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, ArchiveError::NotFound(_))
    }

    pub fn is_format(&self) -> bool {
        matches!(self, ArchiveError::Format(_))
    }
}

pub type Result<T> = std::result::Result<T, ArchiveError>;
