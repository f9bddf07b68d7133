mod file;
mod stats;

pub use self::file::FileRecord;
pub(crate) use self::file::FileRow;
pub use self::stats::CatalogStats;
