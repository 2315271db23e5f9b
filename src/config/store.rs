//! Loads the project configuration file and keeps the last good copy

use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tracing::{info, warn};

use super::project::{ProjectConfig, resolve};
use crate::constants::config::FILENAME;
use crate::error::WorkspaceError;

/// Result of a [`ConfigStore::load`] call
#[derive(Debug)]
pub enum LoadOutcome {
    /// A new resolved config replaced the previous one
    Loaded,
    /// The file does not exist; the config is now absent
    Cleared,
    /// The file could not be read; the previous config is untouched
    Failed(WorkspaceError),
}

#[derive(Debug)]
pub struct ConfigStore {
    path: PathBuf,
    config: Option<Arc<ProjectConfig>>,
}

impl ConfigStore {
    pub fn new(root: &Path) -> Self {
        Self {
            path: root.join(FILENAME),
            config: None,
        }
    }

    pub fn config(&self) -> Option<&ProjectConfig> {
        self.config.as_deref()
    }

    /// Shared handle to the current config, for work that outlives a reload
    pub fn snapshot(&self) -> Option<Arc<ProjectConfig>> {
        self.config.clone()
    }

    /// Re-read the config file
    ///
    /// "Not found" is a valid state and clears the config. Any other failure
    /// keeps the last known good config.
    pub fn load(&mut self) -> LoadOutcome {
        match read_config(&self.path) {
            Ok(Some(config)) => {
                info!(
                    path = %self.path.display(),
                    units = config.units().len(),
                    "Loaded new config"
                );
                self.config = Some(Arc::new(config));
                LoadOutcome::Loaded
            }
            Ok(None) => {
                warn!(path = %self.path.display(), "Config file not found");
                self.config = None;
                LoadOutcome::Cleared
            }
            Err(err) => LoadOutcome::Failed(err),
        }
    }
}

fn read_config(path: &Path) -> Result<Option<ProjectConfig>, WorkspaceError> {
    let metadata = match fs::metadata(path) {
        Ok(metadata) => metadata,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
        Err(source) => {
            return Err(WorkspaceError::ConfigStat {
                path: path.to_path_buf(),
                source,
            });
        }
    };
    if !metadata.is_file() {
        return Err(WorkspaceError::ConfigNotAFile(path.to_path_buf()));
    }

    let contents = fs::read(path).map_err(|source| WorkspaceError::ConfigLoad {
        path: path.to_path_buf(),
        source,
    })?;
    let config: ProjectConfig =
        serde_json::from_slice(&contents).map_err(|source| WorkspaceError::ConfigParse {
            path: path.to_path_buf(),
            source,
        })?;
    Ok(Some(resolve(config)))
}
