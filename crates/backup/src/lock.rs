use crate::error::{ErrorKind, Result, io};
use exn::ResultExt;
use fs4::FileExt;
use std::fs::File;
use std::path::{Path, PathBuf};

pub const LOCK_FILE: &str = "cumulus.lock";

/// Exclusive advisory lock on the state directory, released on drop.
#[derive(Debug)]
pub struct StateLock {
    file: File,
    path: PathBuf,
}

impl StateLock {
    /// Take the lock, failing at once if another process holds it.
    pub fn acquire(state_dir: &Path) -> Result<Self> {
        let path = state_dir.join(LOCK_FILE);
        let file = std::fs::OpenOptions::new()
            .create(true)
            .truncate(false)
            .read(true)
            .write(true)
            .open(&path)
            .or_raise(io(path.display()))?;
        match file.try_lock_exclusive() {
            Ok(()) => Ok(Self { file, path }),
            Err(err) if is_contended(&err) => exn::bail!(ErrorKind::Locked(path.display().to_string())),
            Err(err) => Err(err).or_raise(io(path.display())),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for StateLock {
    fn drop(&mut self) {
        if let Err(err) = FileExt::unlock(&self.file) {
            tracing::warn!(path = %self.path.display(), "Unable to release lock: {err}");
        }
    }
}

fn is_contended(err: &std::io::Error) -> bool {
    err.kind() == std::io::ErrorKind::WouldBlock || err.raw_os_error() == fs4::lock_contended_error().raw_os_error()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_second_holder_is_refused() {
        let dir = tempfile::tempdir().unwrap();
        let first = StateLock::acquire(dir.path()).unwrap();
        let err = StateLock::acquire(dir.path()).unwrap_err();
        assert!(matches!(&*err, ErrorKind::Locked(_)));
        drop(first);
        assert!(StateLock::acquire(dir.path()).is_ok());
    }
}
