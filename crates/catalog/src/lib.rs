//! SQLite catalog of every filesystem object a backup has seen.
//!
//! The catalog is the backup's memory between runs: one row per file,
//! directory or symlink, pointing at the block its content was uploaded to.
//! A snapshot of the catalog file is uploaded as block 0 of every
//! incremental, so the remote copy can always be read back on its own.
//!
//! Rows are never keyed by path. Each row names its parent by id, and the
//! path of a record is the chain of names up to a row whose parent is 0.

mod db;
pub mod error;
mod models;
mod repo;

pub use crate::db::Database;
pub use crate::models::{CatalogStats, FileRecord};
pub use crate::repo::{FIRST_DATA_BLOCK, Repository};
pub use sqlx::SqliteConnection;
