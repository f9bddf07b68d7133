pub mod backend;
pub mod error;
mod models;
mod path;
pub mod retry;

pub use crate::backend::StorageService;
pub use crate::models::{Entry, Handle, Listing};
pub use crate::path::validate_name;
pub use crate::retry::Backoff;
use std::sync::Arc;

pub type ServiceHandle = Arc<dyn StorageService + Send + Sync>;
