//! Configuration loading and validation.
//!
//! Values are layered with figment, later layers overriding earlier ones:
//! built-in defaults, then a TOML file, then `CUMULUS_` environment
//! variables (nested keys separated by `__`, e.g. `CUMULUS_SERVICE__BACKEND`).

pub mod error;
mod model;

pub use crate::model::{Config, EncryptionKey, Notification, ServiceConfig};

use crate::error::{ErrorKind, Result};
use directories::ProjectDirs;
use figment::Figment;
use figment::providers::{Env, Format, Serialized, Toml};
use std::path::{Path, PathBuf};
use tracing::debug;

const ENV_PREFIX: &str = "CUMULUS_";
const CONFIG_FILE: &str = "config.toml";

fn project_dirs() -> Option<ProjectDirs> {
    ProjectDirs::from("", "", "cumulus")
}

/// `<config_dir>/config.toml` for the current user, if a home directory is known.
pub fn default_config_path() -> Option<PathBuf> {
    project_dirs().map(|dirs| dirs.config_dir().join(CONFIG_FILE))
}

/// Build the layered figment without extracting it.
///
/// An explicit `path` must exist; the default location is optional.
pub fn figment(path: Option<&Path>) -> Result<Figment> {
    let file = match path {
        Some(path) if !path.is_file() => exn::bail!(ErrorKind::NotFound(path.display().to_string())),
        Some(path) => Some(path.to_path_buf()),
        None => default_config_path(),
    };
    let mut figment = Figment::from(Serialized::defaults(Config::default()));
    if let Some(file) = file {
        debug!(path = %file.display(), "layering configuration file");
        figment = figment.merge(Toml::file(file));
    }
    Ok(figment.merge(Env::prefixed(ENV_PREFIX).split("__")))
}

/// Load and validate the configuration.
pub fn load(path: Option<&Path>) -> Result<Config> {
    from_figment(figment(path)?)
}

/// Extract and validate a configuration from an already-built figment.
pub fn from_figment(figment: Figment) -> Result<Config> {
    let config: Config = figment.extract().map_err(|err| exn::Exn::from(ErrorKind::Load(err.to_string())))?;
    config.validate()?;
    Ok(config)
}
