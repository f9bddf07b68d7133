use derive_more::Display;

/// Record counts by kind, as reported by verification.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Display, sqlx::FromRow)]
#[display(
    "{records} records: {symlinks} symlinks, {folders} folders, {shared_files} shared files, \
     {unshared_files} non-shared files, {empty_files} empty files"
)]
pub struct CatalogStats {
    pub records: i64,
    pub symlinks: i64,
    pub folders: i64,
    pub shared_files: i64,
    pub unshared_files: i64,
    pub empty_files: i64,
}
