//! Files kept in the local state directory between runs.
//!
//! | File | Purpose |
//! |---|---|
//! | `files.db` | Catalog as of the last successful run. |
//! | `files_id.dat` | The `last_backup_id` that `files.db` belongs to. |
//! | `files2.db` | Working copy for the run in progress. |
//! | `deleted.dat` | Deletion log for the run in progress. |
//! | `scratch/` | Downloads staged before they replace a local file. |

use crate::error::{ErrorKind, Result, io};
use exn::ResultExt;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};
use time::OffsetDateTime;
use time::format_description::well_known::Rfc3339;
use tracing::{debug, warn};

const COMMITTED_DB: &str = "files.db";
const WORKING_DB: &str = "files2.db";
const WORKING_JOURNAL: &str = "files2.db-journal";
const DELETION_LOG: &str = "deleted.dat";
const BACKUP_ID: &str = "files_id.dat";
const SCRATCH: &str = "scratch";
pub const RUN_LOG: &str = "last-run.log";

#[derive(Debug, Clone)]
pub struct LocalState {
    dir: PathBuf,
}

impl LocalState {
    pub async fn open(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        tokio::fs::create_dir_all(dir.join(SCRATCH)).await.or_raise(io(dir.display()))?;
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn committed_db(&self) -> PathBuf {
        self.dir.join(COMMITTED_DB)
    }

    pub fn working_db(&self) -> PathBuf {
        self.dir.join(WORKING_DB)
    }

    pub fn deletion_log(&self) -> PathBuf {
        self.dir.join(DELETION_LOG)
    }

    pub fn run_log(&self) -> PathBuf {
        self.dir.join(RUN_LOG)
    }

    /// The backup id recorded with the committed catalog, if it is readable.
    pub async fn backup_id(&self) -> Option<u64> {
        let path = self.dir.join(BACKUP_ID);
        let text = tokio::fs::read_to_string(&path).await.ok()?;
        match text.trim().parse() {
            Ok(id) => Some(id),
            Err(err) => {
                warn!(path = %path.display(), "Ignoring unreadable backup id: {err}");
                None
            },
        }
    }

    /// Refuse to run within `range` of the last successful run.
    pub async fn check_retry_range(&self, range: Duration) -> Result<()> {
        if range.is_zero() {
            return Ok(());
        }
        let Ok(modified) = tokio::fs::metadata(self.dir.join(BACKUP_ID)).await.and_then(|m| m.modified()) else {
            return Ok(());
        };
        let allowed = modified + range;
        if allowed <= SystemTime::now() {
            return Ok(());
        }
        let when = OffsetDateTime::from(allowed).format(&Rfc3339).unwrap_or_else(|_| format!("{allowed:?}"));
        exn::bail!(ErrorKind::TooRecent(when))
    }

    /// Replace the committed catalog with a downloaded snapshot. The data is
    /// staged in `scratch/` first so a failed write never leaves a torn file.
    pub async fn install_catalog(&self, data: &[u8]) -> Result<()> {
        let staged = self.dir.join(SCRATCH).join(COMMITTED_DB);
        tokio::fs::write(&staged, data).await.or_raise(io(staged.display()))?;
        let committed = self.committed_db();
        tokio::fs::rename(&staged, &committed).await.or_raise(io(committed.display()))?;
        self.remove(BACKUP_ID).await
    }

    /// Forget the committed catalog so the run starts from an empty store.
    pub async fn reset_catalog(&self) -> Result<()> {
        self.remove(COMMITTED_DB).await?;
        self.remove(BACKUP_ID).await
    }

    /// Start the working copy from the committed catalog.
    pub async fn prepare_working_copy(&self) -> Result<()> {
        self.remove(WORKING_JOURNAL).await?;
        self.remove(WORKING_DB).await?;
        let committed = self.committed_db();
        if tokio::fs::try_exists(&committed).await.or_raise(io(committed.display()))? {
            tokio::fs::copy(&committed, self.working_db()).await.or_raise(io(committed.display()))?;
        }
        Ok(())
    }

    /// Promote the working copy once the run has been finalised remotely.
    pub async fn commit(&self, backup_id: u64) -> Result<()> {
        self.remove(DELETION_LOG).await?;
        let committed = self.committed_db();
        tokio::fs::rename(self.working_db(), &committed).await.or_raise(io(committed.display()))?;
        let path = self.dir.join(BACKUP_ID);
        tokio::fs::write(&path, backup_id.to_string()).await.or_raise(io(path.display()))?;
        debug!(backup_id, "Local catalog committed");
        Ok(())
    }

    async fn remove(&self, name: &str) -> Result<()> {
        let path = self.dir.join(name);
        match tokio::fs::remove_file(&path).await {
            Err(err) if err.kind() != std::io::ErrorKind::NotFound => Err(err).or_raise(io(path.display())),
            _ => Ok(()),
        }
    }
}
