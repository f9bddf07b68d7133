//! Name-keyed registry of storage service constructors.

use crate::ServiceHandle;
use crate::error::{ErrorKind, Result};
use std::collections::BTreeMap;

/// Builds a service from its configured options.
pub type Constructor = fn(&BTreeMap<String, String>) -> Result<ServiceHandle>;

/// Explicit mapping from backend name to constructor.
///
/// The default registry knows about every backend compiled into this crate.
/// Callers may register additional backends before opening one.
///
/// # Examples
///
/// ```no_run
/// use cumulus_storage::backend::Registry;
/// use std::collections::BTreeMap;
///
/// # fn example() -> cumulus_storage::error::Result<()> {
/// let options = BTreeMap::from([("root".to_string(), "/mnt/backups".to_string())]);
/// let service = Registry::default().open("local", &options)?;
/// assert_eq!(service.name(), "local");
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct Registry {
    constructors: BTreeMap<&'static str, Constructor>,
}

impl Registry {
    /// A registry with no backends.
    pub fn empty() -> Self {
        Self { constructors: BTreeMap::new() }
    }

    pub fn with(mut self, name: &'static str, constructor: Constructor) -> Self {
        self.constructors.insert(name, constructor);
        self
    }

    pub fn names(&self) -> impl Iterator<Item = &'static str> + '_ {
        self.constructors.keys().copied()
    }

    /// Construct the backend registered under `name`.
    pub fn open(&self, name: &str, options: &BTreeMap<String, String>) -> Result<ServiceHandle> {
        let constructor = self
            .constructors
            .get(name)
            .ok_or_else(|| exn::Exn::from(ErrorKind::UnknownBackend(name.to_string())))?;
        let service = constructor(options)?;
        tracing::debug!(backend = name, "Opened storage service");
        Ok(service)
    }
}

impl Default for Registry {
    fn default() -> Self {
        let registry = Self::empty().with("local", super::LocalService::from_options);
        #[cfg(feature = "mock")]
        let registry = registry.with("mock", super::MockService::from_options);
        registry
    }
}
