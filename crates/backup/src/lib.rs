//! Incremental, encrypted, deduplicating backups.
//!
//! A run walks the configured roots, compares each directory against the
//! catalog from the previous run, and uploads new or changed content into a
//! fresh incremental folder:
//!
//! - [`diff`] classifies each directory entry as removed, unchanged,
//!   added or updated.
//! - [`engine`] drains those classifications depth-first, keeping the
//!   catalog in step and handing file content to the [`upload`]er.
//! - [`deletion`] records the blocks that no longer back any file.
//! - [`incremental`] finalises the run remotely and folds old incrementals
//!   into the base once more than the configured number exist.
//! - [`verify`] spot-checks a backup after the fact.
//!
//! [`run::Backup`] ties these together for one complete run.

pub mod blocks;
pub mod deletion;
pub mod diff;
pub mod engine;
pub mod error;
pub mod exclude;
pub mod incremental;
pub mod lock;
pub mod prebackup;
pub mod run;
pub mod runlog;
pub mod scan;
pub mod state;
pub mod upload;
pub mod verify;

pub use crate::run::{Backup, RunOptions, RunReport};
pub use crate::runlog::RunLog;
pub use crate::verify::{Verifier, VerifyReport};

/// Current time as a Unix timestamp.
pub(crate) fn now() -> i64 {
    time::OffsetDateTime::now_utc().unix_timestamp()
}
