//! Codec Error Types
//!
//! This module provides structured errors using `exn` for automatic location
//! tracking and error tree construction.

use derive_more::{Display, Error};

/// A codec error with automatic location tracking.
pub type Error = exn::Exn<ErrorKind>;
/// Result type alias for codec operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Actionable error categories.
///
/// These describe what the caller should *do*, not what went wrong internally.
#[derive(Debug, Display, Error, Clone, PartialEq, Eq)]
pub enum ErrorKind {
    /// Key material is missing, malformed, or the wrong length.
    #[display("invalid key material: {_0}")]
    InvalidKey(#[error(not(source))] String),
    /// Block size and small-file limit do not fit together.
    #[display("invalid block geometry: {_0}")]
    InvalidGeometry(#[error(not(source))] String),
    /// Block failed to decrypt, authenticate, or decompress. Don't retry with
    /// the same input.
    #[display("corrupt block: {_0}")]
    Corrupt(#[error(not(source))] String),
    /// Compressor or cipher refused the input. Used for encoding.
    #[display("encoder error")]
    Encoder,
}

impl ErrorKind {
    /// Returns `true` if retrying might succeed.
    pub fn is_retryable(&self) -> bool {
        false
    }
}
