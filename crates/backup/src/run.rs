//! One complete backup run.

use crate::blocks::{self, CATALOG_BLOCK, DELETION_LOG_BLOCK};
use crate::deletion::DeletionLog;
use crate::engine::{Engine, RootOutcome};
use crate::error::{ErrorKind, Result};
use crate::exclude::Exclusions;
use crate::incremental::Lifecycle;
use crate::lock::StateLock;
use crate::prebackup;
use crate::runlog::RunLog;
use crate::state::LocalState;
use crate::upload::Uploader;
use cumulus_catalog::{Database, Repository};
use cumulus_codec::BlockCodec;
use cumulus_config::Config;
use cumulus_storage::{Backoff, ServiceHandle};
use exn::ResultExt;
use std::time::Duration;
use tracing::instrument;

#[derive(Debug, Clone, Copy, Default)]
pub struct RunOptions {
    /// Ignore the backup retry range.
    pub force: bool,
    pub skip_prebackup: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunReport {
    pub backup_id: u64,
    pub parts_sent: usize,
    pub bytes_sent: u64,
    /// The upload limit cut the run short; the backup is incomplete.
    pub limit_reached: bool,
    pub roots_failed: usize,
    /// Snapshots kept remotely after retention was applied.
    pub incrementals: usize,
}

/// Drives a run from lock acquisition to the final merge-down.
pub struct Backup<'a> {
    config: &'a Config,
    service: ServiceHandle,
    backoff: Backoff,
}

impl<'a> Backup<'a> {
    pub fn new(config: &'a Config, service: ServiceHandle) -> Self {
        Self { config, service, backoff: Backoff::default() }
    }

    pub fn with_backoff(mut self, backoff: Backoff) -> Self {
        self.backoff = backoff;
        self
    }

    #[instrument(skip_all, fields(backend = self.service.name()))]
    pub async fn run(&self, options: RunOptions, log: &mut RunLog) -> Result<RunReport> {
        let config = self.config;
        let codec = BlockCodec::new(
            config.keys().or_raise(|| ErrorKind::Config)?,
            config.geometry().or_raise(|| ErrorKind::Config)?,
        );
        let state = LocalState::open(config.state_dir()).await?;
        let _lock = StateLock::acquire(state.dir())?;
        if !options.force {
            state.check_retry_range(Duration::from_secs(config.backup_retry_range)).await?;
        }
        if !options.skip_prebackup {
            prebackup::run_commands(&config.prebackup_commands, log).await;
        }

        let mut lifecycle = Lifecycle::open(self.service.clone(), &config.service.remote_path, self.backoff).await?;
        self.apply_retention(&mut lifecycle, &codec, log).await?;
        self.sync_catalog(&lifecycle, &state, &codec).await?;
        state.prepare_working_copy().await?;

        let db = Database::connect(state.working_db()).await.or_raise(|| ErrorKind::Catalog)?;
        let repo = Repository::from(&db);
        let catalog_next = {
            let mut conn = repo.acquire().await.or_raise(|| ErrorKind::Catalog)?;
            repo.next_block_number(&mut conn).await.or_raise(|| ErrorKind::Catalog)?
        };
        let next_block = blocks::first_free(catalog_next, lifecycle.highest_block().await?);
        let temp = lifecycle.start().await?;
        let uploader = Uploader::new(self.service.clone(), temp.clone(), codec.clone(), self.backoff, next_block);
        let deletions = DeletionLog::create(state.deletion_log()).await?;
        let exclusions = Exclusions::resolve(config.backup_exclusions.iter().cloned().chain([state.dir().to_path_buf()]));
        log.info(format!("Excluding {} paths", exclusions.len()));

        let mut engine = Engine::new(repo, uploader, deletions, exclusions, config.upload_data_limit);
        let mut report = RunReport::default();
        for root in &config.backup_paths {
            log.info(format!("Backing up '{}'", root.display()));
            match engine.backup_root(root, log).await {
                RootOutcome::Completed | RootOutcome::Skipped => {},
                RootOutcome::Failed => report.roots_failed += 1,
                RootOutcome::LimitReached => {
                    report.limit_reached = true;
                    log.warning("Upload data limit reached. The backup is incomplete.");
                    break;
                },
            }
        }

        let (mut uploader, mut deletions) = engine.into_parts();
        deletions.commit().await?;
        uploader.flush_shared().await?;
        uploader.upload_reserved(DELETION_LOG_BLOCK, deletions.path()).await?;
        db.close().await;
        uploader.upload_reserved(CATALOG_BLOCK, &state.working_db()).await?;

        report.backup_id = lifecycle.last_backup_id() + 1;
        lifecycle.finish(&temp, report.backup_id).await?;
        state.commit(report.backup_id).await?;
        self.apply_retention(&mut lifecycle, &codec, log).await?;

        report.parts_sent = uploader.parts_sent();
        report.bytes_sent = uploader.bytes_sent();
        report.incrementals = lifecycle.count();
        log.info(format!(
            "Backup {} finished: {} parts, {} bytes sent, {} incrementals kept",
            report.backup_id, report.parts_sent, report.bytes_sent, report.incrementals
        ));
        Ok(report)
    }

    async fn apply_retention(&self, lifecycle: &mut Lifecycle, codec: &BlockCodec, log: &mut RunLog) -> Result<()> {
        while lifecycle.count() > self.config.num_incrementals + 1 {
            lifecycle.merge_down(codec).await?;
            log.info(format!("Merged oldest incremental into base, {} remain", lifecycle.count()));
        }
        Ok(())
    }

    /// Make `files.db` match the newest remote snapshot when the local copy
    /// is missing or belongs to a different run.
    async fn sync_catalog(&self, lifecycle: &Lifecycle, state: &LocalState, codec: &BlockCodec) -> Result<()> {
        let local = state.backup_id().await;
        if local == Some(lifecycle.last_backup_id()) && state.committed_db().exists() {
            return Ok(());
        }
        match lifecycle.find_latest(CATALOG_BLOCK).await? {
            Some((index, parts)) => {
                tracing::info!(index, ?local, remote = lifecycle.last_backup_id(), "Fetching catalog from remote");
                let data = codec.decode_parts(&lifecycle.download(&parts).await?).or_raise(|| ErrorKind::Codec)?;
                state.install_catalog(&data).await
            },
            None => state.reset_catalog().await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::verify::Verifier;
    use cumulus_codec::SharedIndex;
    use cumulus_config::EncryptionKey;
    use cumulus_storage::StorageService;
    use cumulus_storage::backend::MockService;
    use std::collections::BTreeSet;
    use std::path::Path;
    use std::sync::Arc;

    struct Fixture {
        config: Config,
        mock: Arc<MockService>,
        source: tempfile::TempDir,
        _state: tempfile::TempDir,
    }

    fn fixture() -> Fixture {
        let source = tempfile::tempdir().unwrap();
        let state = tempfile::tempdir().unwrap();
        let config = Config {
            state_dir: state.path().to_path_buf(),
            block_size: 8192,
            small_file_limit: 1024,
            num_incrementals: 5,
            encryption_key: EncryptionKey {
                key1: "11".repeat(32),
                iv1: "22".repeat(16),
                key2: "33".repeat(32),
                iv2: "44".repeat(16),
                sign: "55".repeat(20),
            },
            backup_paths: vec![source.path().to_path_buf()],
            ..Config::default()
        };
        Fixture { config, mock: Arc::new(MockService::default()), source, _state: state }
    }

    impl Fixture {
        fn write(&self, path: &str, data: &[u8]) {
            let path = self.source.path().join(path);
            std::fs::create_dir_all(path.parent().unwrap()).unwrap();
            std::fs::write(path, data).unwrap();
        }

        async fn run(&self) -> RunReport {
            let mut log = RunLog::new();
            let backoff = Backoff { initial: Duration::from_millis(1), deadline: Duration::from_millis(5) };
            Backup::new(&self.config, self.mock.clone())
                .with_backoff(backoff)
                .run(RunOptions::default(), &mut log)
                .await
                .unwrap()
        }

        fn codec(&self) -> BlockCodec {
            BlockCodec::new(self.config.keys().unwrap(), self.config.geometry().unwrap())
        }

        async fn verify(&self) -> crate::verify::VerifyReport {
            let scratch = tempfile::tempdir().unwrap();
            let verifier = Verifier::open(self.mock.clone(), "cumulus", self.codec(), scratch.path().to_path_buf())
                .await
                .unwrap();
            verifier.run(&mut RunLog::new()).await.unwrap()
        }

        /// Remote object names inside one snapshot folder.
        async fn names(&self, index: usize) -> Vec<String> {
            let prefix = format!("cumulus/{index}/");
            self.mock.paths().await.into_iter().filter_map(|path| path.strip_prefix(&prefix).map(String::from)).collect()
        }
    }

    fn noise(len: usize, seed: u32) -> Vec<u8> {
        let mut state = seed | 1;
        (0..len)
            .map(|_| {
                state ^= state << 13;
                state ^= state >> 17;
                state ^= state << 5;
                state as u8
            })
            .collect()
    }

    /// Data block numbers among remote object names.
    fn data_blocks(names: &[String]) -> BTreeSet<u64> {
        names
            .iter()
            .filter_map(|name| blocks::parse_block_name(name))
            .map(|(block, _)| block)
            .filter(|block| *block >= blocks::RESERVED_BLOCKS)
            .collect()
    }

    #[tokio::test]
    async fn test_small_file_lands_in_shared_block_and_rerun_uploads_no_data() {
        let f = fixture();
        f.write("hello.txt", b"hello");
        let report = f.run().await;
        assert_eq!((report.backup_id, report.incrementals, report.roots_failed), (1, 1, 0));

        let db = Database::connect(f.config.state_dir.join("files.db")).await.unwrap();
        let repo = Repository::from(&db);
        let mut conn = repo.acquire().await.unwrap();
        let shared = repo.random_shared_block(&mut conn).await.unwrap().unwrap();
        let ids = repo.ids_in_shared_block(&mut conn, shared).await.unwrap();
        assert_eq!(ids.len(), 1);
        let record = repo.get(&mut conn, ids[0]).await.unwrap().unwrap();
        assert_eq!((record.name.as_str(), record.shared, record.logical_size), ("hello.txt", true, 5));
        drop(conn);
        db.close().await;

        let root = f.mock.root().await.unwrap();
        let home = f.mock.find_folder(&root, "cumulus").await.unwrap().unwrap();
        let base = f.mock.find_folder(&home, "0").await.unwrap().unwrap();
        let listing = f.mock.list(&base).await.unwrap();
        let parts = &blocks::block_list(&listing)[&shared];
        let sealed = f.mock.download(&parts[&0]).await.unwrap();
        let body = f.codec().open(&sealed).unwrap();
        let index = SharedIndex::parse(&body).unwrap();
        assert!(index.contains(record.id));
        assert_eq!(index.extract(&body, record.id).unwrap().unwrap(), b"hello");

        // Nothing changed: the second incremental only carries the catalog and deletion log.
        let report = f.run().await;
        assert_eq!(report.backup_id, 2);
        let names = f.names(1).await;
        assert!(!names.is_empty());
        assert!(names.iter().all(|name| name.starts_with("0_") || name.starts_with("1_")), "{names:?}");
    }

    #[tokio::test]
    async fn test_verify_after_several_runs() {
        let f = fixture();
        f.write("docs/a.txt", b"first");
        f.write("big.bin", &noise(20_000, 1));
        f.run().await;
        f.write("docs/b.txt", b"second");
        f.run().await;
        std::fs::remove_file(f.source.path().join("big.bin")).unwrap();
        f.write("other.bin", &noise(9_000, 2));
        f.run().await;

        let report = f.verify().await;
        assert_eq!(report.incrementals, 3);
        assert_eq!(report.snapshots.iter().map(|s| s.index).collect::<Vec<_>>(), vec![0, 1, 2]);
        assert!(report.snapshots.iter().all(|s| s.shared_block.is_some() && s.unshared_block.is_some()));
        assert_eq!(report.snapshots[2].stats.shared_files, 2);
    }

    #[tokio::test]
    async fn test_retention_merges_and_discards_freed_blocks() {
        let mut f = fixture();
        f.config.num_incrementals = 0;
        f.write("big.bin", &noise(20_000, 3));
        f.run().await;
        let first = f.names(0).await;

        f.write("big.bin", &noise(21_000, 4));
        let report = f.run().await;
        assert_eq!(report.incrementals, 1);
        let merged = f.names(0).await;
        // The replaced file's block is gone, its replacement moved into the base.
        assert!(data_blocks(&first).is_disjoint(&data_blocks(&merged)));
        assert!(!data_blocks(&merged).is_empty());
        assert!(f.names(1).await.is_empty());

        let report = f.verify().await;
        assert_eq!(report.incrementals, 1);
        assert_eq!(report.snapshots[0].stats.unshared_files, 1);
    }

    #[tokio::test]
    async fn test_parts_left_by_a_failed_root_are_never_reused() {
        let mut f = fixture();
        f.config.num_incrementals = 0;
        f.write("a.bin", &noise(9_000, 8));
        f.run().await;
        let next = data_blocks(&f.names(0).await).last().copied().unwrap() + 1;

        // The shared block holds `next`, b.bin lands in `next + 1`, then c.bin
        // fails and the root rolls back with b.bin's parts already uploaded.
        f.write("b.bin", &noise(9_000, 9));
        f.write("c.bin", &noise(9_000, 10));
        let failing = format!("{}_", next + 2);
        f.mock.fail_uploads_named(Some(failing.as_str())).await;
        let report = f.run().await;
        assert_eq!((report.roots_failed, report.incrementals), (1, 1));
        f.mock.fail_uploads_named(None).await;
        let orphaned = data_blocks(&f.names(0).await);
        assert!(orphaned.contains(&(next + 1)));

        // Later runs merge into the base without colliding with those parts.
        for _ in 0..2 {
            let report = f.run().await;
            assert_eq!((report.roots_failed, report.incrementals), (0, 1));
        }
        let merged = data_blocks(&f.names(0).await);
        assert!(merged.is_superset(&orphaned));
        assert_eq!(merged.len(), orphaned.len() + 2);

        let report = f.verify().await;
        assert_eq!(report.snapshots[0].stats.unshared_files, 3);
    }

    #[tokio::test]
    async fn test_upload_limit_and_missing_root() {
        let mut f = fixture();
        f.config.upload_data_limit = 1;
        f.config.backup_paths.insert(0, f.source.path().join("missing"));
        f.write("a.bin", &noise(9_000, 5));
        f.write("b.bin", &noise(9_000, 6));
        let mut log = RunLog::new();
        let report = Backup::new(&f.config, f.mock.clone()).run(RunOptions::default(), &mut log).await.unwrap();
        assert!(report.limit_reached);
        assert_eq!(report.roots_failed, 0);
        assert_eq!(log.filtered(Some("[Notice]")).count(), 1);
        assert_eq!(log.filtered(Some("[Warning]")).count(), 1);
        assert_eq!(log.filtered(Some("[Add]")).filter(|line| line.ends_with(".bin")).count(), 1);
    }

    #[tokio::test]
    async fn test_retry_range_and_lock() {
        let mut f = fixture();
        f.run().await;
        f.config.backup_retry_range = 3600;
        let backup = Backup::new(&f.config, f.mock.clone());
        let err = backup.run(RunOptions::default(), &mut RunLog::new()).await.unwrap_err();
        assert!(matches!(&*err, ErrorKind::TooRecent(_)));
        let forced = RunOptions { force: true, ..RunOptions::default() };
        assert_eq!(backup.run(forced, &mut RunLog::new()).await.unwrap().backup_id, 2);

        let _held = StateLock::acquire(Path::new(&f.config.state_dir)).unwrap();
        let err = backup.run(forced, &mut RunLog::new()).await.unwrap_err();
        assert!(matches!(&*err, ErrorKind::Locked(_)));
    }

    #[tokio::test]
    async fn test_lost_local_catalog_is_fetched_from_remote() {
        let f = fixture();
        f.write("keep.bin", &noise(9_000, 7));
        f.run().await;
        std::fs::remove_file(f.config.state_dir.join("files.db")).unwrap();
        std::fs::remove_file(f.config.state_dir.join("files_id.dat")).unwrap();

        // With the catalog restored nothing is uploaded again.
        f.run().await;
        let names = f.names(1).await;
        assert!(names.iter().all(|name| name.starts_with("0_") || name.starts_with("1_")), "{names:?}");
    }
}
