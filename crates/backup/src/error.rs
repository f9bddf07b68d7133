//! Backup Error Types
//!
//! Structured errors using `exn` for automatic location tracking and error
//! tree construction. Failures in a dependency crate are raised as the kind
//! naming that dependency, with the original error kept as the child.

use derive_more::{Display, Error};

/// A backup error with automatic location tracking.
pub type Error = exn::Exn<ErrorKind>;
/// Result type alias for backup operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Classifies the origin of a backup failure.
///
/// ### Operational Errors
/// - [`ErrorKind::Config`]
/// - [`ErrorKind::Corrupt`]
/// - [`ErrorKind::Locked`]
/// - [`ErrorKind::TooRecent`]
/// - [`ErrorKind::NotEnoughIncrementals`]
/// - [`ErrorKind::InvalidRoot`]
///
/// ### Dependency Errors
/// - [`ErrorKind::Catalog`]
/// - [`ErrorKind::Codec`]
/// - [`ErrorKind::Storage`]
/// - [`ErrorKind::Io`]
#[derive(Debug, Display, Error)]
pub enum ErrorKind {
    /// The configuration cannot be used to run a backup.
    #[display("invalid configuration")]
    Config,
    /// A catalog query or transaction failed.
    #[display("catalog error")]
    Catalog,
    /// Sealing or opening a block failed.
    #[display("block codec error")]
    Codec,
    /// A remote storage operation failed, after any retries.
    #[display("remote storage error")]
    Storage,
    /// A local file in the state directory or a backup root could not be used.
    #[display("local I/O error: {_0}")]
    Io(#[error(not(source))] String),
    /// The remote backup is inconsistent. Never retried.
    #[display("backup is corrupt: {_0}")]
    Corrupt(#[error(not(source))] String),
    /// Another process holds the state directory lock.
    #[display("another backup is already running (lock held on {_0})")]
    Locked(#[error(not(source))] String),
    /// The last successful run finished within the retry range.
    #[display("the backup was run too recently; next run allowed at {_0}")]
    TooRecent(#[error(not(source))] String),
    #[display("merging down needs the base plus at least one incremental, found {_0}")]
    NotEnoughIncrementals(#[error(not(source))] usize),
    /// A configured backup path is not a usable directory.
    #[display("unable to process {_0}: must be a valid directory")]
    InvalidRoot(#[error(not(source))] String),
}

impl ErrorKind {
    /// Returns `true` if retrying might succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Storage | Self::Io(_))
    }
}

pub(crate) fn io(context: impl std::fmt::Display) -> impl FnOnce() -> ErrorKind {
    move || ErrorKind::Io(context.to_string())
}
