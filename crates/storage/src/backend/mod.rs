//! Storage service trait and implementations.
//!
//! This module defines the `StorageService` trait, the folder-and-object
//! interface every remote store must provide, and a registry that selects an
//! implementation by name at startup.

mod local;
#[cfg(feature = "mock")]
mod mock;
mod registry;
mod ro;

pub use self::local::LocalService;
#[cfg(feature = "mock")]
pub use self::mock::MockService;
pub use self::registry::{Constructor, Registry};
pub use self::ro::ReadOnlyService;
use crate::error::Result;
use crate::models::{Handle, Listing};
use async_trait::async_trait;

/// Unified interface for remote object stores.
///
/// The model is a tree of folders holding named objects. Every folder and
/// object is addressed by an opaque [`Handle`] issued by the service itself.
///
/// # Examples
///
/// ```no_run
/// use cumulus_storage::{StorageService, error::Result};
///
/// async fn upload_marker(service: &dyn StorageService) -> Result<()> {
///     let root = service.root().await?;
///     let folder = service.create_folder(&root, "backups").await?;
///     service.upload(&folder, "marker", b"hello").await?;
///     let listing = service.list(&folder).await?;
///     assert!(listing.file("marker").is_some());
///     Ok(())
/// }
/// ```
#[async_trait]
pub trait StorageService: Send + Sync {
    /// Name of the configured backend (used for logging only).
    fn name(&self) -> &str;

    /// Resolve the handle of the service's root folder.
    async fn root(&self) -> Result<Handle>;

    /// Create a folder under `parent`.
    ///
    /// Returns the existing folder's handle if one with the same name is
    /// already present.
    async fn create_folder(&self, parent: &Handle, name: &str) -> Result<Handle>;

    /// List the direct subfolders and files of a folder.
    async fn list(&self, folder: &Handle) -> Result<Listing>;

    /// Delete an object. Folders are deleted together with their contents.
    ///
    /// Returns [`NotFound`](crate::error::ErrorKind::NotFound) if the object
    /// does not exist.
    async fn delete(&self, object: &Handle) -> Result<()>;

    /// Rename an object (file or folder) within its current folder.
    ///
    /// Returns [`AlreadyExists`](crate::error::ErrorKind::AlreadyExists) if the
    /// new name is taken.
    async fn rename(&self, object: &Handle, name: &str) -> Result<Handle>;

    /// Move an object into another folder, keeping its name.
    async fn move_into(&self, object: &Handle, folder: &Handle) -> Result<Handle>;

    /// Upload bytes under `name` into a folder, replacing any existing object
    /// of that name.
    async fn upload(&self, folder: &Handle, name: &str, data: &[u8]) -> Result<Handle>;

    /// Download the full contents of an object.
    async fn download(&self, object: &Handle) -> Result<Vec<u8>>;

    /// Find a direct subfolder by name without creating it.
    async fn find_folder(&self, parent: &Handle, name: &str) -> Result<Option<Handle>> {
        Ok(self.list(parent).await?.folder(name).map(|entry| entry.handle.clone()))
    }
}
