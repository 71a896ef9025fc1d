//! Storage layout configuration

use std::path::PathBuf;

use crate::errors::AgentError;
use crate::filesys::dir::Dir;
use crate::filesys::file::File;
use crate::storage::settings::PathSettings;

/// Storage layout for the agent
#[derive(Debug, Clone)]
pub struct StorageLayout {
    /// Status records and per-environment script config
    pub agent_dir: PathBuf,

    /// Artifacts, one subdirectory per environment
    pub builds_dir: PathBuf,

    /// Rolling log files
    pub log_dir: PathBuf,

    /// Parent directory of default install targets
    pub target_default_dir: PathBuf,
}

impl StorageLayout {
    /// Lay everything out under one base directory
    pub fn new(base_dir: impl Into<PathBuf>) -> Self {
        let base_dir = base_dir.into();
        Self {
            agent_dir: base_dir.clone(),
            builds_dir: base_dir.join("builds"),
            log_dir: base_dir.join("logs"),
            target_default_dir: base_dir.join("targets"),
        }
    }

    /// Get the status record directory
    pub fn status_dir(&self) -> Dir {
        Dir::new(self.agent_dir.join("status"))
    }

    /// Get an environment's artifact directory
    pub fn env_builds_dir(&self, env_name: &str) -> Dir {
        Dir::new(self.builds_dir.join(env_name))
    }

    /// Get the script variables file handed to deploy scripts
    pub fn script_config_file(&self, env_name: &str) -> File {
        File::new(self.agent_dir.join(format!("{}_SCRIPT_CONFIG", env_name)))
    }

    /// Install target used when a goal names none
    pub fn default_target(&self, env_name: &str) -> PathBuf {
        self.target_default_dir.join(env_name)
    }

    /// Get the logs directory
    pub fn logs_dir(&self) -> Dir {
        Dir::new(self.log_dir.clone())
    }

    /// Setup the storage layout (create directories)
    pub async fn setup(&self) -> Result<(), AgentError> {
        Dir::new(self.agent_dir.clone()).create().await?;
        self.status_dir().create().await?;
        Dir::new(self.builds_dir.clone()).create().await?;
        self.logs_dir().create().await?;
        Ok(())
    }
}

impl From<&PathSettings> for StorageLayout {
    fn from(paths: &PathSettings) -> Self {
        Self {
            agent_dir: PathBuf::from(&paths.agent_dir),
            builds_dir: PathBuf::from(&paths.builds_dir),
            log_dir: PathBuf::from(&paths.log_dir),
            target_default_dir: PathBuf::from(&paths.target_default_dir),
        }
    }
}

impl Default for StorageLayout {
    fn default() -> Self {
        Self::from(&PathSettings::default())
    }
}
