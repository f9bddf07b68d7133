//! Applying filesystem changes to the catalog, one backup root at a time.

use crate::deletion::DeletionLog;
use crate::diff::{Diff, Op};
use crate::error::{ErrorKind, Result, io};
use crate::exclude::Exclusions;
use crate::runlog::RunLog;
use crate::scan::{self, LiveEntry, Owners};
use crate::upload::Uploader;
use cumulus_catalog::{FileRecord, Repository, SqliteConnection};
use exn::ResultExt;
use std::collections::BTreeMap;
use std::path::{Component, Path, PathBuf};
use tracing::instrument;

/// How processing one backup root ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RootOutcome {
    /// Every change was applied and committed.
    Completed,
    /// The upload limit was reached; changes so far were committed.
    LimitReached,
    /// The root is not a usable directory.
    Skipped,
    /// An error rolled back every change made for this root.
    Failed,
}

/// Pending work for one directory.
struct Frame {
    path: PathBuf,
    parent_id: u64,
    diff: Diff,
}

/// Walks backup roots depth-first with an explicit stack of [`Frame`]s,
/// applying each directory's [`Diff`] to the catalog and uploading new
/// content as it goes.
pub struct Engine {
    repo: Repository,
    uploader: Uploader,
    deletions: DeletionLog,
    exclusions: Exclusions,
    owners: Owners,
    upload_limit: u64,
}

impl Engine {
    pub fn new(
        repo: Repository,
        uploader: Uploader,
        deletions: DeletionLog,
        exclusions: Exclusions,
        upload_limit: u64,
    ) -> Self {
        Self { repo, uploader, deletions, exclusions, owners: Owners::default(), upload_limit }
    }

    pub fn uploader(&self) -> &Uploader {
        &self.uploader
    }

    pub fn limit_reached(&self) -> bool {
        self.uploader.limit_reached(self.upload_limit)
    }

    /// Hand back the uploader and deletion log for finalisation.
    pub fn into_parts(self) -> (Uploader, DeletionLog) {
        (self.uploader, self.deletions)
    }

    /// Back up one root inside its own catalog transaction.
    ///
    /// Failures never escape: they roll back this root, are reported to
    /// `log`, and leave the engine ready for the next root.
    #[instrument(skip(self, log), fields(root = %root.display()))]
    pub async fn backup_root(&mut self, root: &Path, log: &mut RunLog) -> RootOutcome {
        let root = match resolve_root(root).await {
            Ok(root) => root,
            Err(err) => {
                log.notice(format!("Unable to process '{}'. {err}", root.display()));
                return RootOutcome::Skipped;
            },
        };
        match self.backup_root_inner(&root, log).await {
            Ok(outcome) => {
                // The catalog is committed; numbers that fail to reach the log stay pending.
                if let Err(err) = self.deletions.commit().await {
                    log.warning(format!("Freed blocks of '{}' not yet recorded: {err}", root.display()));
                }
                outcome
            },
            Err(err) => {
                self.deletions.discard();
                log.error(format!("Backup of '{}' aborted: {err:?}", root.display()));
                RootOutcome::Failed
            },
        }
    }

    async fn backup_root_inner(&mut self, root: &Path, log: &mut RunLog) -> Result<RootOutcome> {
        let mut tx = self.repo.begin().await.or_raise(|| ErrorKind::Catalog)?;
        let root_id = self.bootstrap(&mut tx, root).await?;
        let outcome = self.walk(&mut tx, root, root_id, log).await?;
        tx.commit().await.or_raise(|| ErrorKind::Catalog)?;
        Ok(outcome)
    }

    /// Create catalog records for the root and every ancestor that has none.
    /// Existing ancestor records are left untouched.
    async fn bootstrap(&mut self, conn: &mut SqliteConnection, root: &Path) -> Result<u64> {
        let mut parent_id = 0;
        let mut current = PathBuf::new();
        for component in root.components() {
            current.push(component);
            let name = match component {
                Component::RootDir => String::new(),
                Component::Normal(name) => name.to_string_lossy().into_owned(),
                Component::Prefix(prefix) => prefix.as_os_str().to_string_lossy().into_owned(),
                Component::CurDir | Component::ParentDir => continue,
            };
            parent_id = match self.repo.find_child(conn, parent_id, &name).await.or_raise(|| ErrorKind::Catalog)? {
                Some(existing) => existing.id,
                None => {
                    let live = scan::stat(&current, &mut self.owners).await?;
                    let record = new_record(parent_id, &LiveEntry { name, ..live });
                    self.repo.insert(conn, &record).await.or_raise(|| ErrorKind::Catalog)?
                },
            };
        }
        Ok(parent_id)
    }

    async fn walk(
        &mut self,
        conn: &mut SqliteConnection,
        root: &Path,
        root_id: u64,
        log: &mut RunLog,
    ) -> Result<RootOutcome> {
        let diff = self.diff(conn, root, root_id).await?;
        let mut stack = vec![self.frame(root.to_path_buf(), root_id, diff)];
        while let Some(frame) = stack.last_mut() {
            let Some(op) = frame.diff.next_op() else {
                stack.pop();
                continue;
            };
            let (dir, parent_id) = (frame.path.clone(), frame.parent_id);
            if let Some(child) = self.apply(conn, &dir, parent_id, op, log).await? {
                stack.push(child);
            }
            if self.limit_reached() {
                return Ok(RootOutcome::LimitReached);
            }
        }
        Ok(RootOutcome::Completed)
    }

    async fn apply(
        &mut self,
        conn: &mut SqliteConnection,
        dir: &Path,
        parent_id: u64,
        op: Op,
        log: &mut RunLog,
    ) -> Result<Option<Frame>> {
        match op {
            Op::Remove(record) => {
                let path = dir.join(&record.name);
                log.change("Remove", &path);
                let child = match record.is_dir() {
                    true => Some(self.frame(path, record.id, Diff::removals(self.stored(conn, record.id).await?))),
                    false => None,
                };
                self.repo.delete(conn, record.id).await.or_raise(|| ErrorKind::Catalog)?;
                self.release(conn, record.block_number, record.shared).await?;
                Ok(child)
            },
            Op::Traverse(record) => {
                let path = dir.join(&record.name);
                let diff = self.diff(conn, &path, record.id).await?;
                Ok(Some(self.frame(path, record.id, diff)))
            },
            Op::Add(entry) => {
                let path = dir.join(&entry.name);
                log.change("Add", &path);
                let id = self.repo.insert(conn, &new_record(parent_id, &entry)).await.or_raise(|| ErrorKind::Catalog)?;
                if entry.is_dir() {
                    let live = scan::list_dir(&path, &mut self.owners).await;
                    return Ok(Some(self.frame(path, id, Diff::additions(live))));
                }
                if entry.is_file() {
                    self.upload(conn, id, &path).await?;
                }
                Ok(None)
            },
            Op::Update(changed) => {
                let path = dir.join(&changed.stored.name);
                log.change("Update", &path);
                let record = changed.updated(crate::now());
                self.repo.update(conn, &record).await.or_raise(|| ErrorKind::Catalog)?;
                let content_changed = changed.drops_content();
                if content_changed {
                    self.release(conn, changed.stored.block_number, changed.stored.shared).await?;
                }
                if changed.live.is_dir() {
                    let diff = self.diff(conn, &path, record.id).await?;
                    return Ok(Some(self.frame(path, record.id, diff)));
                }
                if content_changed && changed.live.is_file() {
                    self.upload(conn, record.id, &path).await?;
                }
                // A directory replaced by a file or link takes its old children with it.
                match changed.stored.is_dir() {
                    true => Ok(Some(self.frame(path, record.id, Diff::removals(self.stored(conn, record.id).await?)))),
                    false => Ok(None),
                }
            },
        }
    }

    async fn upload(&mut self, conn: &mut SqliteConnection, id: u64, path: &Path) -> Result<()> {
        if let Some(placement) = self.uploader.upload_file(id, path).await? {
            self.repo
                .set_block(conn, id, placement.block_number, placement.shared, placement.real_size)
                .await
                .or_raise(|| ErrorKind::Catalog)?;
        }
        Ok(())
    }

    /// Log a block as freed once no remaining record references it. A
    /// dedicated block only ever has the one owner.
    async fn release(&mut self, conn: &mut SqliteConnection, block_number: u64, shared: bool) -> Result<()> {
        if block_number == 0 {
            return Ok(());
        }
        let remaining = match shared {
            true => self.repo.count_by_block(conn, block_number).await.or_raise(|| ErrorKind::Catalog)?,
            false => 0,
        };
        if remaining == 0 {
            self.deletions.record(block_number);
        }
        Ok(())
    }

    async fn stored(&self, conn: &mut SqliteConnection, parent_id: u64) -> Result<BTreeMap<String, FileRecord>> {
        let children = self.repo.children(conn, parent_id).await.or_raise(|| ErrorKind::Catalog)?;
        Ok(children.into_iter().map(|record| (record.name.clone(), record)).collect())
    }

    async fn diff(&mut self, conn: &mut SqliteConnection, path: &Path, id: u64) -> Result<Diff> {
        let stored = self.stored(conn, id).await?;
        let live = scan::list_dir(path, &mut self.owners).await;
        Ok(Diff::compute(stored, live))
    }

    /// Excluded entries never make it into a frame.
    fn frame(&self, path: PathBuf, parent_id: u64, mut diff: Diff) -> Frame {
        match self.exclusions.is_excluded(&path) {
            true => diff = Diff::default(),
            false => diff.retain(|name| !self.exclusions.is_excluded(&path.join(name))),
        }
        Frame { path, parent_id, diff }
    }
}

fn new_record(parent_id: u64, entry: &LiveEntry) -> FileRecord {
    FileRecord {
        parent_id,
        name: entry.name.clone(),
        symlink_target: entry.symlink_target.clone(),
        attributes: entry.attributes,
        owner: entry.owner.clone(),
        group: entry.group.clone(),
        logical_size: entry.logical_size,
        real_size: entry.logical_size,
        last_modified: entry.last_modified,
        created: entry.created,
        last_data_change: entry.last_modified,
        ..Default::default()
    }
}

async fn resolve_root(path: &Path) -> Result<PathBuf> {
    let resolved = tokio::fs::canonicalize(path).await.or_raise(io(path.display()))?;
    let metadata = tokio::fs::metadata(&resolved).await.or_raise(io(resolved.display()))?;
    if !metadata.is_dir() {
        exn::bail!(ErrorKind::InvalidRoot(path.display().to_string()));
    }
    Ok(resolved)
}
