//! Command-line Error Types

use derive_more::{Display, Error};

pub type Error = exn::Exn<ErrorKind>;
pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Display, Error)]
pub enum ErrorKind {
    /// The configuration could not be loaded or is invalid.
    #[display("configuration error")]
    Config,
    /// The configured storage backend could not be opened.
    #[display("storage backend error")]
    Storage,
    #[display("backup failed")]
    Backup,
    #[display("verification failed")]
    Verify,
}
