use derive_more::{Display, Error};

pub type Error = exn::Exn<ErrorKind>;
pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Display, Error)]
pub enum ErrorKind {
    #[display("configuration file not found: {_0}")]
    NotFound(#[error(not(source))] String),
    #[display("could not load configuration: {_0}")]
    Load(#[error(not(source))] String),
    #[display("invalid configuration: {_0}")]
    Invalid(#[error(not(source))] String),
}

impl ErrorKind {
    /// Configuration problems never go away by themselves.
    pub fn is_retryable(&self) -> bool {
        false
    }
}
