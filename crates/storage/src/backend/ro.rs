//! Read-only storage service.
//!
//! Wraps another service and refuses every mutating operation, so that
//! inspection tools (verification) cannot alter a backup even by mistake.

use async_trait::async_trait;

use crate::error::{ErrorKind, Result};
use crate::models::{Handle, Listing};
use crate::{ServiceHandle, StorageService};

/// Read-only storage service.
///
/// Reads pass through to the inner service. Writes fail with
/// [`PermissionDenied`](ErrorKind::PermissionDenied) after logging a
/// [`warn event`](tracing::Event).
#[derive(Clone)]
pub struct ReadOnlyService {
    inner: ServiceHandle,
}
impl ReadOnlyService {
    pub fn new(inner: ServiceHandle) -> Self {
        Self { inner }
    }

    fn refuse<T>(operation: &str, object: &str) -> Result<T> {
        tracing::warn!(operation, object, "Refusing mutation on read-only storage service");
        exn::bail!(ErrorKind::PermissionDenied(format!("{operation} {object}")))
    }
}

#[async_trait]
impl StorageService for ReadOnlyService {
    fn name(&self) -> &str {
        self.inner.name()
    }

    async fn root(&self) -> Result<Handle> {
        self.inner.root().await
    }

    async fn create_folder(&self, parent: &Handle, name: &str) -> Result<Handle> {
        // Existing folders may still be resolved.
        match self.inner.find_folder(parent, name).await? {
            Some(handle) => Ok(handle),
            None => Self::refuse("create folder", name),
        }
    }

    async fn list(&self, folder: &Handle) -> Result<Listing> {
        self.inner.list(folder).await
    }

    async fn delete(&self, object: &Handle) -> Result<()> {
        Self::refuse("delete", object.as_str())
    }

    async fn rename(&self, object: &Handle, _name: &str) -> Result<Handle> {
        Self::refuse("rename", object.as_str())
    }

    async fn move_into(&self, object: &Handle, _folder: &Handle) -> Result<Handle> {
        Self::refuse("move", object.as_str())
    }

    async fn upload(&self, _folder: &Handle, name: &str, _data: &[u8]) -> Result<Handle> {
        Self::refuse("upload", name)
    }

    async fn download(&self, object: &Handle) -> Result<Vec<u8>> {
        self.inner.download(object).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::LocalService;
    use std::sync::Arc;

    #[tokio::test]
    async fn test_reads_pass_and_writes_fail() {
        let temp_dir = tempfile::tempdir().unwrap();
        let local = LocalService::new("local", temp_dir.path()).unwrap();
        let root = local.root().await.unwrap();
        let folder = local.create_folder(&root, "0").await.unwrap();
        let block = local.upload(&folder, "0_0.dat", b"db").await.unwrap();

        let service = ReadOnlyService::new(Arc::new(local));
        assert_eq!(service.create_folder(&root, "0").await.unwrap(), folder);
        assert_eq!(service.download(&block).await.unwrap(), b"db");
        assert_eq!(service.list(&folder).await.unwrap().files.len(), 1);

        let err = service.create_folder(&root, "TEMP").await.unwrap_err();
        assert!(matches!(&*err, ErrorKind::PermissionDenied(_)));
        assert!(service.upload(&folder, "1_0.dat", b"").await.is_err());
        assert!(service.delete(&block).await.is_err());
        assert!(service.rename(&folder, "1").await.is_err());
        assert!(service.move_into(&block, &root).await.is_err());
        assert_eq!(service.list(&root).await.unwrap().folders.len(), 1);
    }
}
