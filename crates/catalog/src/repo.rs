//! Queries over the `files` table.
//!
//! Every query takes the connection to run on, so that callers can group a
//! whole root's worth of changes into one transaction (`&mut *tx`) or run a
//! one-off lookup on a pooled connection.

use crate::Database;
use crate::error::{ErrorKind, Result};
use crate::models::{CatalogStats, FileRecord, FileRow};
use exn::ResultExt;
use sqlx::pool::PoolConnection;
use sqlx::{Sqlite, SqliteConnection, SqlitePool, Transaction};
use tracing::instrument;

/// Lowest block number handed out to file content. Numbers below are
/// reserved for the catalog snapshot (0) and the deletion log (1).
pub const FIRST_DATA_BLOCK: u64 = 10;

/// Repository for [`FileRecord`]s.
#[derive(Debug, Clone)]
pub struct Repository {
    pool: SqlitePool,
}
impl From<&Database> for Repository {
    fn from(db: &Database) -> Self {
        Self { pool: db.pool().clone() }
    }
}
impl Repository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Start a transaction. Dropping it without committing rolls back.
    pub async fn begin(&self) -> Result<Transaction<'static, Sqlite>> {
        self.pool.begin().await.or_raise(|| ErrorKind::Database)
    }

    /// Borrow a connection for work outside any transaction.
    pub async fn acquire(&self) -> Result<PoolConnection<Sqlite>> {
        self.pool.acquire().await.or_raise(|| ErrorKind::Database)
    }

    fn id(value: u64, field: &'static str) -> Result<i64> {
        i64::try_from(value).or_raise(|| ErrorKind::InvalidData(field))
    }

    fn unsigned(value: i64, field: &'static str) -> Result<u64> {
        u64::try_from(value).or_raise(|| ErrorKind::InvalidData(field))
    }

    // =========================================================================
    // Get/Fetch
    // =========================================================================

    pub async fn get(&self, conn: &mut SqliteConnection, id: u64) -> Result<Option<FileRecord>> {
        let row: Option<FileRow> = sqlx::query_as(include_str!("../queries/get.sql"))
            .bind(Self::id(id, "id")?)
            .fetch_optional(conn)
            .await
            .or_raise(|| ErrorKind::Database)?;
        row.map(FileRecord::try_from).transpose()
    }

    /// All direct children of a directory record, ordered by name.
    pub async fn children(&self, conn: &mut SqliteConnection, parent_id: u64) -> Result<Vec<FileRecord>> {
        let rows: Vec<FileRow> = sqlx::query_as(include_str!("../queries/children.sql"))
            .bind(Self::id(parent_id, "parent id")?)
            .fetch_all(conn)
            .await
            .or_raise(|| ErrorKind::Database)?;
        rows.into_iter().map(FileRecord::try_from).collect()
    }

    pub async fn find_child(
        &self,
        conn: &mut SqliteConnection,
        parent_id: u64,
        name: &str,
    ) -> Result<Option<FileRecord>> {
        let row: Option<FileRow> = sqlx::query_as(include_str!("../queries/find_child.sql"))
            .bind(Self::id(parent_id, "parent id")?)
            .bind(name)
            .fetch_optional(conn)
            .await
            .or_raise(|| ErrorKind::Database)?;
        row.map(FileRecord::try_from).transpose()
    }

    // =========================================================================
    // Insert/Update/Delete
    // =========================================================================

    /// Insert a record, ignoring its `id`. Returns the newly assigned id.
    #[instrument(skip(self, conn, record), fields(name = %record.name, parent_id = record.parent_id))]
    pub async fn insert(&self, conn: &mut SqliteConnection, record: &FileRecord) -> Result<u64> {
        let row = FileRow::try_from(record)?;
        let result = sqlx::query(include_str!("../queries/insert.sql"))
            .bind(row.parent_id)
            .bind(row.block_number)
            .bind(row.shared)
            .bind(row.name)
            .bind(row.symlink_target)
            .bind(row.attributes)
            .bind(row.owner)
            .bind(row.group)
            .bind(row.logical_size)
            .bind(row.real_size)
            .bind(row.last_modified)
            .bind(row.created)
            .bind(row.last_data_change)
            .execute(conn)
            .await
            .or_raise(|| ErrorKind::Database)?;
        Self::unsigned(result.last_insert_rowid(), "id")
    }

    /// Overwrite every column of an existing record.
    #[instrument(skip(self, conn, record), fields(id = record.id))]
    pub async fn update(&self, conn: &mut SqliteConnection, record: &FileRecord) -> Result<()> {
        let row = FileRow::try_from(record)?;
        let result = sqlx::query(include_str!("../queries/update.sql"))
            .bind(row.parent_id)
            .bind(row.block_number)
            .bind(row.shared)
            .bind(row.name)
            .bind(row.symlink_target)
            .bind(row.attributes)
            .bind(row.owner)
            .bind(row.group)
            .bind(row.logical_size)
            .bind(row.real_size)
            .bind(row.last_modified)
            .bind(row.created)
            .bind(row.last_data_change)
            .bind(row.id)
            .execute(conn)
            .await
            .or_raise(|| ErrorKind::Database)?;
        if result.rows_affected() == 0 {
            exn::bail!(ErrorKind::NotFound(record.id));
        }
        Ok(())
    }

    /// Record where a file's content was uploaded.
    pub async fn set_block(
        &self,
        conn: &mut SqliteConnection,
        id: u64,
        block_number: u64,
        shared: bool,
        real_size: u64,
    ) -> Result<()> {
        let result = sqlx::query(include_str!("../queries/set_block.sql"))
            .bind(Self::id(block_number, "block number")?)
            .bind(shared)
            .bind(Self::id(real_size, "real size")?)
            .bind(Self::id(id, "id")?)
            .execute(conn)
            .await
            .or_raise(|| ErrorKind::Database)?;
        if result.rows_affected() == 0 {
            exn::bail!(ErrorKind::NotFound(id));
        }
        Ok(())
    }

    pub async fn delete(&self, conn: &mut SqliteConnection, id: u64) -> Result<()> {
        sqlx::query(include_str!("../queries/delete.sql"))
            .bind(Self::id(id, "id")?)
            .execute(conn)
            .await
            .or_raise(|| ErrorKind::Database)?;
        Ok(())
    }

    // =========================================================================
    // Blocks
    // =========================================================================

    /// Number of records still pointing at a block.
    pub async fn count_by_block(&self, conn: &mut SqliteConnection, block_number: u64) -> Result<u64> {
        let (count,): (i64,) = sqlx::query_as(include_str!("../queries/count_by_block.sql"))
            .bind(Self::id(block_number, "block number")?)
            .fetch_one(conn)
            .await
            .or_raise(|| ErrorKind::Database)?;
        Self::unsigned(count, "count")
    }

    /// The next unused block number, never below [`FIRST_DATA_BLOCK`].
    pub async fn next_block_number(&self, conn: &mut SqliteConnection) -> Result<u64> {
        let (max,): (i64,) = sqlx::query_as(include_str!("../queries/max_block.sql"))
            .fetch_one(conn)
            .await
            .or_raise(|| ErrorKind::Database)?;
        Ok((Self::unsigned(max, "block number")? + 1).max(FIRST_DATA_BLOCK))
    }

    /// Every block number referenced by at least one record.
    pub async fn distinct_blocks(&self, conn: &mut SqliteConnection) -> Result<Vec<u64>> {
        let rows: Vec<(i64,)> = sqlx::query_as(include_str!("../queries/distinct_blocks.sql"))
            .fetch_all(conn)
            .await
            .or_raise(|| ErrorKind::Database)?;
        rows.into_iter().map(|(block,)| Self::unsigned(block, "block number")).collect()
    }

    /// Ids of the records packed into a shared block.
    pub async fn ids_in_shared_block(&self, conn: &mut SqliteConnection, block_number: u64) -> Result<Vec<u64>> {
        let rows: Vec<(i64,)> = sqlx::query_as(include_str!("../queries/ids_in_shared_block.sql"))
            .bind(Self::id(block_number, "block number")?)
            .fetch_all(conn)
            .await
            .or_raise(|| ErrorKind::Database)?;
        rows.into_iter().map(|(id,)| Self::unsigned(id, "id")).collect()
    }

    /// A random shared data block, if any exist.
    pub async fn random_shared_block(&self, conn: &mut SqliteConnection) -> Result<Option<u64>> {
        let row: Option<(i64,)> = sqlx::query_as(include_str!("../queries/random_shared_block.sql"))
            .bind(Self::id(FIRST_DATA_BLOCK, "block number")?)
            .fetch_optional(conn)
            .await
            .or_raise(|| ErrorKind::Database)?;
        row.map(|(block,)| Self::unsigned(block, "block number")).transpose()
    }

    /// A random non-shared data block whose file is smaller than `max_size`.
    pub async fn random_unshared_block(&self, conn: &mut SqliteConnection, max_size: u64) -> Result<Option<u64>> {
        let row: Option<(i64,)> = sqlx::query_as(include_str!("../queries/random_unshared_block.sql"))
            .bind(Self::id(FIRST_DATA_BLOCK, "block number")?)
            .bind(Self::id(max_size, "size")?)
            .fetch_optional(conn)
            .await
            .or_raise(|| ErrorKind::Database)?;
        row.map(|(block,)| Self::unsigned(block, "block number")).transpose()
    }

    pub async fn stats(&self, conn: &mut SqliteConnection) -> Result<CatalogStats> {
        sqlx::query_as(include_str!("../queries/stats.sql")).fetch_one(conn).await.or_raise(|| ErrorKind::Database)
    }
}
