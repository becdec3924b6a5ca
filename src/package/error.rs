//! Error types for fetching and installing packages.

use std::io;

use thiserror::Error;

/// Errors raised while fetching or scanning a package.
#[derive(Debug, Error)]
pub enum PackageError {
    /// Another fetch is already running on this downloader.
    #[error("Already busy with another operation.")]
    Busy,

    /// The caller canceled the fetch.
    #[error("Operation was canceled.")]
    Canceled,

    /// The archive exceeded the configured cap.
    #[error("File too large (limit {limit} bytes).")]
    TooLarge { limit: u64 },

    /// Non-success HTTP status.
    #[error("Server returned HTTP {0}.")]
    HttpStatus(reqwest::StatusCode),

    /// Transport failure.
    #[error("Network error: {0}")]
    Network(#[from] reqwest::Error),

    /// The body stream failed mid-transfer.
    #[error("Network error: {0}")]
    Transfer(io::Error),

    /// Bytes are not a readable ZIP archive.
    #[error("Not a valid zip archive: {0}")]
    InvalidArchive(#[from] zip::result::ZipError),

    /// No top-level binary passed the entry-point test.
    #[error("No valid plugin found.")]
    NoPluginFound,

    /// More than one top-level binary passed the entry-point test.
    #[error("Multiple plugin DLL candidates found: {}.", .0.join(", "))]
    MultipleCandidates(Vec<String>),

    /// A member declares or inflates to more than the member cap.
    #[error("Archive member {name} is too large (limit {limit} bytes).")]
    MemberTooLarge { name: String, limit: u64 },

    /// Named member is absent from the archive.
    #[error("Archive member not found: {0}")]
    MemberNotFound(String),

    /// Local I/O failure.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

/// Hard failures that stop an install before any member is processed.
#[derive(Debug, Error)]
pub enum InstallError {
    #[error("Operation already in progress.")]
    Busy,

    #[error("Invalid plugin descriptor or missing archive data.")]
    MissingArchive,

    #[error("Target directory is invalid.")]
    InvalidTarget,

    #[error("{0}")]
    Archive(#[from] PackageError),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}
