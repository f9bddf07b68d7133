//! Spot-checking a remote backup without modifying it.

use crate::blocks::{CATALOG_BLOCK, Parts};
use crate::error::{ErrorKind, Result, io};
use crate::incremental::Lifecycle;
use crate::runlog::RunLog;
use cumulus_catalog::{CatalogStats, Database, Repository};
use cumulus_codec::{BlockCodec, SharedIndex, inflate};
use cumulus_storage::ServiceHandle;
use cumulus_storage::backend::ReadOnlyService;
use exn::ResultExt;
use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::instrument;

/// Non-shared blocks larger than this are not downloaded for the decode check.
pub const MAX_SAMPLE_SIZE: u64 = 30_000_000;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SnapshotReport {
    pub index: usize,
    pub stats: CatalogStats,
    /// Distinct blocks the catalog references, all of them present remotely.
    pub blocks: usize,
    /// The shared block opened, with the number of entries inflated.
    pub shared_block: Option<(u64, usize)>,
    /// The dedicated block downloaded and decoded.
    pub unshared_block: Option<u64>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct VerifyReport {
    pub incrementals: usize,
    pub snapshots: Vec<SnapshotReport>,
}

/// Checks the base, a middle incremental and the latest incremental.
///
/// For each, the catalog is reassembled from the snapshot's view of the
/// remote blocks (the newest copy of every block up to that index), every
/// block it references must exist, and one random shared block and one
/// random dedicated block are downloaded and decoded.
pub struct Verifier {
    lifecycle: Lifecycle,
    codec: BlockCodec,
    scratch: PathBuf,
}

impl Verifier {
    pub async fn open(service: ServiceHandle, remote_path: &str, codec: BlockCodec, scratch: PathBuf) -> Result<Self> {
        let service: ServiceHandle = Arc::new(ReadOnlyService::new(service));
        let lifecycle = Lifecycle::inspect(service, remote_path).await?;
        Ok(Self { lifecycle, codec, scratch })
    }

    pub async fn run(&self, log: &mut RunLog) -> Result<VerifyReport> {
        let count = self.lifecycle.count();
        if count == 0 {
            exn::bail!(ErrorKind::Corrupt("no snapshots found".into()));
        }
        self.lifecycle.ensure_contiguous()?;
        let samples: BTreeSet<usize> = [0, count / 2, count - 1].into();

        let mut report = VerifyReport { incrementals: count, snapshots: Vec::new() };
        let mut visible: BTreeMap<u64, Parts> = BTreeMap::new();
        for index in 0..count {
            visible.extend(self.lifecycle.block_list(index).await?);
            if samples.contains(&index) {
                let snapshot = self.check_snapshot(index, &visible).await?;
                log.info(format!(
                    "Snapshot {index}: {} records, {} blocks verified. {}",
                    snapshot.stats.records, snapshot.blocks, snapshot.stats
                ));
                report.snapshots.push(snapshot);
            }
        }
        Ok(report)
    }

    #[instrument(skip(self, visible))]
    async fn check_snapshot(&self, index: usize, visible: &BTreeMap<u64, Parts>) -> Result<SnapshotReport> {
        let catalog = self.block(index, CATALOG_BLOCK, visible).await?;
        let path = self.scratch.join(format!("verify-{index}.db"));
        tokio::fs::write(&path, &catalog).await.or_raise(io(path.display()))?;
        let db = Database::connect(&path).await.or_raise(|| ErrorKind::Catalog)?;
        let result = self.check_catalog(index, &db, visible).await;
        db.close().await;
        tokio::fs::remove_file(&path).await.or_raise(io(path.display()))?;
        result
    }

    async fn check_catalog(
        &self,
        index: usize,
        db: &Database,
        visible: &BTreeMap<u64, Parts>,
    ) -> Result<SnapshotReport> {
        let repo = Repository::from(db);
        let mut conn = repo.acquire().await.or_raise(|| ErrorKind::Catalog)?;
        let stats = repo.stats(&mut conn).await.or_raise(|| ErrorKind::Catalog)?;

        let referenced = repo.distinct_blocks(&mut conn).await.or_raise(|| ErrorKind::Catalog)?;
        for block in referenced.iter().filter(|&&block| block > 0) {
            if !visible.contains_key(block) {
                return Err(missing(index, *block));
            }
        }

        let shared_block = match repo.random_shared_block(&mut conn).await.or_raise(|| ErrorKind::Catalog)? {
            Some(block) => {
                let sealed = self.lifecycle.download(self.parts(index, block, visible)?).await?;
                let first = sealed.first().ok_or_else(|| missing(index, block))?;
                let body = self.codec.open(first).or_raise(corrupt(index, block, 0))?;
                let shared = SharedIndex::parse(&body).or_raise(corrupt(index, block, 0))?;
                for id in repo.ids_in_shared_block(&mut conn, block).await.or_raise(|| ErrorKind::Catalog)? {
                    if !shared.contains(id) {
                        exn::bail!(ErrorKind::Corrupt(format!(
                            "snapshot {index}, block {block}: file {id} is not in the shared index"
                        )));
                    }
                }
                for id in shared.ids() {
                    shared.extract(&body, id).or_raise(corrupt(index, block, 0))?;
                }
                Some((block, shared.len()))
            },
            None => None,
        };

        let unshared_block =
            match repo.random_unshared_block(&mut conn, MAX_SAMPLE_SIZE).await.or_raise(|| ErrorKind::Catalog)? {
                Some(block) => {
                    self.block(index, block, visible).await?;
                    Some(block)
                },
                None => None,
            };

        Ok(SnapshotReport { index, stats, blocks: referenced.len(), shared_block, unshared_block })
    }

    fn parts<'a>(&self, index: usize, block: u64, visible: &'a BTreeMap<u64, Parts>) -> Result<&'a Parts> {
        visible.get(&block).ok_or_else(|| missing(index, block))
    }

    /// Download, open and inflate every part of a dedicated block.
    async fn block(&self, index: usize, block: u64, visible: &BTreeMap<u64, Parts>) -> Result<Vec<u8>> {
        let parts = self.parts(index, block, visible)?;
        let mut compressed = Vec::new();
        for (part, sealed) in parts.keys().zip(self.lifecycle.download(parts).await?) {
            compressed.extend(self.codec.open(&sealed).or_raise(corrupt(index, block, *part))?);
        }
        inflate(&compressed).or_raise(|| ErrorKind::Corrupt(format!("snapshot {index}, block {block}: inflate failed")))
    }
}

fn missing(index: usize, block: u64) -> exn::Exn<ErrorKind> {
    exn::Exn::from(ErrorKind::Corrupt(format!("snapshot {index}: block {block} is missing")))
}

fn corrupt(index: usize, block: u64, part: u64) -> impl FnOnce() -> ErrorKind {
    move || ErrorKind::Corrupt(format!("snapshot {index}, block {block}, part {part}"))
}
