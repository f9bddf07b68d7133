//! Local filesystem storage service.
//!
//! Folders are directories and objects are regular files beneath a configured
//! root directory, which may equally be a mounted network share. Handles are
//! root-relative paths using `/` separators; the root itself is the empty
//! handle.

use crate::error::{ErrorKind, Result};
use crate::models::{Entry, Handle, Listing};
use crate::path::{validate as validate_path, validate_name};
use crate::{ServiceHandle, StorageService};
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::fs::create_dir_all as sync_create_dir;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::fs;

/// Local filesystem storage service.
///
/// # Examples
///
/// ```no_run
/// use cumulus_storage::backend::LocalService;
///
/// # fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let service = LocalService::new("nfs", "/mnt/backups")?;
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct LocalService {
    name: String,
    root: PathBuf,
}
impl LocalService {
    /// Create a new local filesystem service.
    ///
    /// # Errors
    ///
    /// Returns an error if the path is not absolute or exists but is not a
    /// directory.
    pub fn new(name: impl Into<String>, root: impl AsRef<Path>) -> Result<Self> {
        let root = root.as_ref().to_path_buf();
        if !root.is_absolute() {
            exn::bail!(ErrorKind::InvalidOption(format!("root must be absolute: {}", root.display())));
        }
        if root.exists() {
            if !root.is_dir() {
                exn::bail!(ErrorKind::InvalidOption(format!("root is not a directory: {}", root.display())));
            }
        } else {
            // Non-async: it only happens once at startup.
            sync_create_dir(&root).map_err(|e| Self::map_io_error(e, &root.display().to_string()))?;
        }
        Ok(Self { name: name.into(), root })
    }

    /// Registry constructor. Requires the `root` option.
    pub fn from_options(options: &BTreeMap<String, String>) -> Result<ServiceHandle> {
        let root = options
            .get("root")
            .ok_or_else(|| exn::Exn::from(ErrorKind::InvalidOption("local backend requires `root`".into())))?;
        Ok(Arc::new(Self::new("local", root)?))
    }

    fn absolute_path(&self, handle: &Handle) -> Result<PathBuf> {
        Ok(self.root.join(validate_path(handle.as_str())?))
    }

    fn child(parent: &Handle, name: &str) -> Handle {
        match parent.as_str() {
            "" => Handle::new(name),
            parent => Handle::new(format!("{parent}/{name}")),
        }
    }

    fn parent(handle: &Handle) -> Handle {
        match handle.as_str().rsplit_once('/') {
            Some((parent, _)) => Handle::new(parent),
            None => Handle::new(""),
        }
    }

    fn file_name(handle: &Handle) -> Result<&str> {
        match handle.as_str().rsplit('/').next() {
            Some(name) if !name.is_empty() => Ok(name),
            _ => exn::bail!(ErrorKind::InvalidName(handle.to_string())),
        }
    }

    fn map_io_error(e: std::io::Error, object: &str) -> ErrorKind {
        match e.kind() {
            std::io::ErrorKind::NotFound => ErrorKind::NotFound(object.to_string()),
            std::io::ErrorKind::PermissionDenied => ErrorKind::PermissionDenied(object.to_string()),
            std::io::ErrorKind::AlreadyExists => ErrorKind::AlreadyExists(object.to_string()),
            _ => ErrorKind::Io(e),
        }
    }

    /// Move `from` to `to`, refusing to clobber an existing object.
    async fn relocate(&self, from: &Handle, to: Handle) -> Result<Handle> {
        let from_path = self.absolute_path(from)?;
        let to_path = self.absolute_path(&to)?;
        if fs::try_exists(&to_path).await.map_err(ErrorKind::Io)? {
            exn::bail!(ErrorKind::AlreadyExists(to.to_string()));
        }
        fs::rename(&from_path, &to_path).await.map_err(|e| Self::map_io_error(e, from.as_str()))?;
        Ok(to)
    }
}

#[async_trait]
impl StorageService for LocalService {
    fn name(&self) -> &str {
        &self.name
    }

    async fn root(&self) -> Result<Handle> {
        Ok(Handle::new(""))
    }

    async fn create_folder(&self, parent: &Handle, name: &str) -> Result<Handle> {
        let handle = Self::child(parent, validate_name(name)?);
        let path = self.absolute_path(&handle)?;
        match fs::metadata(&path).await {
            Ok(metadata) if metadata.is_dir() => return Ok(handle),
            Ok(_) => exn::bail!(ErrorKind::AlreadyExists(handle.to_string())),
            Err(_) => {},
        }
        fs::create_dir(&path).await.map_err(|e| Self::map_io_error(e, handle.as_str()))?;
        Ok(handle)
    }

    async fn list(&self, folder: &Handle) -> Result<Listing> {
        let path = self.absolute_path(folder)?;
        let mut entries = fs::read_dir(&path).await.map_err(|e| Self::map_io_error(e, folder.as_str()))?;
        let mut listing = Listing::default();
        while let Some(entry) = entries.next_entry().await.map_err(ErrorKind::Io)? {
            // Names that are not valid UTF-8 were never written by us.
            let Ok(name) = entry.file_name().into_string() else {
                continue;
            };
            let metadata = entry.metadata().await.map_err(|e| Self::map_io_error(e, &name))?;
            let handle = Self::child(folder, &name);
            if metadata.is_dir() {
                listing.folders.push(Entry { name, handle, size: 0 });
            } else if metadata.is_file() {
                listing.files.push(Entry { name, handle, size: metadata.len() });
            }
        }
        listing.sort();
        Ok(listing)
    }

    async fn delete(&self, object: &Handle) -> Result<()> {
        let path = self.absolute_path(object)?;
        if path == self.root {
            exn::bail!(ErrorKind::InvalidName(object.to_string()));
        }
        let metadata = fs::metadata(&path).await.map_err(|e| Self::map_io_error(e, object.as_str()))?;
        let result = match metadata.is_dir() {
            true => fs::remove_dir_all(&path).await,
            false => fs::remove_file(&path).await,
        };
        Ok(result.map_err(|e| Self::map_io_error(e, object.as_str()))?)
    }

    async fn rename(&self, object: &Handle, name: &str) -> Result<Handle> {
        let target = Self::child(&Self::parent(object), validate_name(name)?);
        self.relocate(object, target).await
    }

    async fn move_into(&self, object: &Handle, folder: &Handle) -> Result<Handle> {
        let target = Self::child(folder, Self::file_name(object)?);
        self.relocate(object, target).await
    }

    async fn upload(&self, folder: &Handle, name: &str, data: &[u8]) -> Result<Handle> {
        let handle = Self::child(folder, validate_name(name)?);
        let path = self.absolute_path(&handle)?;
        // Write beside the target and rename, so a torn upload never leaves a
        // truncated object under the real name.
        let staging = path.with_file_name(format!(".{name}.partial"));
        fs::write(&staging, data).await.map_err(|e| Self::map_io_error(e, handle.as_str()))?;
        fs::rename(&staging, &path).await.map_err(|e| Self::map_io_error(e, handle.as_str()))?;
        Ok(handle)
    }

    async fn download(&self, object: &Handle) -> Result<Vec<u8>> {
        let path = self.absolute_path(object)?;
        Ok(fs::read(&path).await.map_err(|e| Self::map_io_error(e, object.as_str()))?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn service() -> (tempfile::TempDir, LocalService) {
        let temp_dir = tempfile::tempdir().unwrap();
        let service = LocalService::new("local", temp_dir.path()).unwrap();
        (temp_dir, service)
    }

    #[test]
    fn test_new_requires_absolute_path() {
        let temp_dir = tempfile::tempdir().unwrap();
        assert!(LocalService::new("name", temp_dir.path()).is_ok());
        assert!(LocalService::new("name", "relative/path").is_err());
        assert!(LocalService::new("name", "./relative").is_err());
    }

    #[tokio::test]
    async fn test_create_folder_is_idempotent() {
        let (_dir, service) = service();
        let root = service.root().await.unwrap();
        let first = service.create_folder(&root, "backups").await.unwrap();
        let second = service.create_folder(&root, "backups").await.unwrap();
        assert_eq!(first, second);
        assert_eq!(service.list(&root).await.unwrap().folders.len(), 1);
    }

    #[tokio::test]
    async fn test_upload_list_download() {
        let (_dir, service) = service();
        let root = service.root().await.unwrap();
        let folder = service.create_folder(&root, "0").await.unwrap();
        service.upload(&folder, "11_0.dat", b"second").await.unwrap();
        let handle = service.upload(&folder, "10_0.dat", b"first").await.unwrap();
        let listing = service.list(&folder).await.unwrap();
        let names: Vec<_> = listing.files.iter().map(|f| f.name.as_str()).collect();
        assert_eq!(names, vec!["10_0.dat", "11_0.dat"]);
        assert_eq!(listing.file("10_0.dat").unwrap().size, 5);
        assert_eq!(service.download(&handle).await.unwrap(), b"first");
    }

    #[tokio::test]
    async fn test_upload_replaces() {
        let (_dir, service) = service();
        let root = service.root().await.unwrap();
        let handle = service.upload(&root, "summary.json", b"old").await.unwrap();
        service.upload(&root, "summary.json", b"new").await.unwrap();
        assert_eq!(service.download(&handle).await.unwrap(), b"new");
        assert_eq!(service.list(&root).await.unwrap().files.len(), 1);
    }

    #[tokio::test]
    async fn test_rename_folder() {
        let (_dir, service) = service();
        let root = service.root().await.unwrap();
        let temp = service.create_folder(&root, "TEMP").await.unwrap();
        service.upload(&temp, "0_0.dat", b"db").await.unwrap();
        let renamed = service.rename(&temp, "3").await.unwrap();
        assert_eq!(renamed.as_str(), "3");
        let listing = service.list(&renamed).await.unwrap();
        assert!(listing.file("0_0.dat").is_some());
        assert!(service.find_folder(&root, "TEMP").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_rename_refuses_to_clobber() {
        let (_dir, service) = service();
        let root = service.root().await.unwrap();
        let a = service.create_folder(&root, "1").await.unwrap();
        service.create_folder(&root, "2").await.unwrap();
        let err = service.rename(&a, "2").await.unwrap_err();
        assert!(matches!(&*err, ErrorKind::AlreadyExists(_)));
    }

    #[tokio::test]
    async fn test_move_into() {
        let (_dir, service) = service();
        let root = service.root().await.unwrap();
        let one = service.create_folder(&root, "1").await.unwrap();
        let merge = service.create_folder(&root, "MERGE").await.unwrap();
        let block = service.upload(&one, "12_0.dat", b"data").await.unwrap();
        let moved = service.move_into(&block, &merge).await.unwrap();
        assert_eq!(moved.as_str(), "MERGE/12_0.dat");
        assert!(service.list(&one).await.unwrap().files.is_empty());
        assert_eq!(service.download(&moved).await.unwrap(), b"data");
    }

    #[tokio::test]
    async fn test_delete_folder_recursively() {
        let (_dir, service) = service();
        let root = service.root().await.unwrap();
        let folder = service.create_folder(&root, "MERGE").await.unwrap();
        service.upload(&folder, "1_0.dat", b"data").await.unwrap();
        service.delete(&folder).await.unwrap();
        assert!(service.list(&root).await.unwrap().folders.is_empty());
        let err = service.delete(&folder).await.unwrap_err();
        assert!(matches!(&*err, ErrorKind::NotFound(_)));
    }

    #[tokio::test]
    async fn test_handle_security() {
        let (_dir, service) = service();
        assert!(service.download(&Handle::new("../etc/passwd")).await.is_err());
        assert!(service.delete(&Handle::new("")).await.is_err());
        let root = service.root().await.unwrap();
        assert!(service.upload(&root, "../escape", b"data").await.is_err());
        assert!(service.create_folder(&root, "a/b").await.is_err());
    }
}
