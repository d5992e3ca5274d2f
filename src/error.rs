//! Crate-level error type.
//!
//! Mirrors the teacher's per-module `thiserror` enums (`CodecError`,
//! `SuperblockError`) but collapsed into one enum, since every error kind
//! here is something a caller of the archive engine needs to branch on —
//! in particular [`ArchivariusError::UnrecoverableOutput`], which callers
//! MUST treat as "abort the containing operation", never as a per-entry
//! warning.

use std::io;
use std::path::PathBuf;

pub type Result<T> = std::result::Result<T, ArchivariusError>;

#[derive(thiserror::Error, Debug)]
pub enum ArchivariusError {
    #[error("corrupt file {path}: {detail}")]
    CorruptFile { path: PathBuf, detail: String },

    #[error("truncated content file {path}: expected {expected} bytes, found {found}")]
    Truncated {
        path: PathBuf,
        expected: u64,
        found: u64,
    },

    #[error("archive is encrypted but no password was supplied")]
    EncryptionKeyMissing,

    #[error("wrong password, or archive is corrupted")]
    WrongPassword,

    #[error("unsupported catalogue version {found} (this build handles up to {max})")]
    UnsupportedVersion { found: u64, max: u64 },

    #[error("I/O error on {path}: {source}")]
    IoFailure { path: PathBuf, source: io::Error },

    /// An output failure that happened *after* bytes were committed to an
    /// open content file. The containing operation (content-file writer,
    /// catalogue commit) must abort rather than retry or continue.
    #[error("unrecoverable output failure on {path}: {source}")]
    UnrecoverableOutput { path: PathBuf, source: io::Error },

    #[error("archive at {path} is locked by another process")]
    LockHeld { path: PathBuf },

    /// An internal invariant check failed. `code` identifies the assertion
    /// site so a bug report can point straight at it.
    #[error("archive is in an inconsistent state ({code}); recreate it")]
    InconsistentState { code: &'static str },

    #[error("invalid configuration or arguments: {0}")]
    UserInputError(String),
}

impl ArchivariusError {
    /// True for the one error kind that must abort the containing
    /// operation rather than be reported as a per-entry warning.
    pub fn is_unrecoverable_output(&self) -> bool {
        matches!(self, ArchivariusError::UnrecoverableOutput { .. })
    }

    pub fn io(path: impl Into<PathBuf>, source: io::Error) -> Self {
        ArchivariusError::IoFailure {
            path: path.into(),
            source,
        }
    }

    pub fn unrecoverable_output(path: impl Into<PathBuf>, source: io::Error) -> Self {
        ArchivariusError::UnrecoverableOutput {
            path: path.into(),
            source,
        }
    }
}
