//! Points the install target at a build

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info};

use crate::errors::AgentError;
use crate::filesys::dir::Dir;
use crate::process::cancel::CancelToken;
use crate::process::runner::{CommandSpec, ProcessRunner};
use crate::storage::settings::StageSettings;

/// Swaps the target symlink onto an extracted build. The link is created under
/// `<target>_tmp` and renamed over the target so it always resolves to either
/// the old or the new build.
pub struct Stager {
    runner: Arc<dyn ProcessRunner>,
    user_role: Option<String>,
    timeout: Duration,
}

impl Stager {
    pub fn new(runner: Arc<dyn ProcessRunner>, settings: &StageSettings) -> Self {
        Self {
            runner,
            user_role: settings.user_role.clone().filter(|r| !r.trim().is_empty()),
            timeout: settings.timeout_for(ping_protocol::Stage::Staging),
        }
    }

    /// Build directory the target currently points at
    pub async fn enabled_build(target: &Path) -> Option<PathBuf> {
        let meta = tokio::fs::symlink_metadata(target).await.ok()?;
        if !meta.file_type().is_symlink() {
            return None;
        }
        tokio::fs::read_link(target).await.ok()
    }

    pub async fn stage(&self, build_dir: &Path, target: &Path, cancel: &CancelToken) -> Result<(), AgentError> {
        if !Dir::new(build_dir).exists().await {
            return Err(AgentError::StorageError(format!(
                "build directory {:?} does not exist",
                build_dir
            )));
        }

        let previous = Self::enabled_build(target).await;
        if previous.as_deref() == Some(build_dir) {
            info!("{:?} already points to {:?}", target, build_dir);
            return Ok(());
        }
        if let Ok(meta) = tokio::fs::symlink_metadata(target).await {
            if !meta.file_type().is_symlink() {
                return Err(AgentError::ConfigError(format!(
                    "install target {:?} exists and is not a symlink",
                    target
                )));
            }
        }

        if let Some(role) = &self.user_role {
            let spec = CommandSpec::new("chown", self.timeout)
                .arg("-R")
                .arg(role.as_str())
                .arg(build_dir.to_string_lossy());
            self.runner.run(&spec, cancel).await?.check(&spec, &[0])?;
        }

        if let Some(parent) = target.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let tmp = tmp_link(target);
        remove_link(&tmp).await?;
        tokio::fs::symlink(build_dir, &tmp).await?;
        tokio::fs::rename(&tmp, target).await?;

        info!("{:?} points to {:?} (previously {:?})", target, build_dir, previous);
        Ok(())
    }

    /// Remove the target link, leaving the build it pointed at alone
    pub async fn unstage(target: &Path) -> Result<(), AgentError> {
        debug!("Removing install target {:?}", target);
        remove_link(target).await
    }
}

fn tmp_link(target: &Path) -> PathBuf {
    let mut name = target.as_os_str().to_os_string();
    name.push("_tmp");
    PathBuf::from(name)
}

async fn remove_link(path: &Path) -> Result<(), AgentError> {
    match tokio::fs::symlink_metadata(path).await {
        Ok(meta) if meta.file_type().is_symlink() => {
            tokio::fs::remove_file(path).await?;
            Ok(())
        }
        _ => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::process::runner::SystemRunner;

    fn stager() -> Stager {
        Stager::new(Arc::new(SystemRunner::default()), &StageSettings::default())
    }

    #[tokio::test]
    async fn test_swaps_symlink() {
        let tmp = tempfile::tempdir().unwrap();
        let b0 = tmp.path().join("builds").join("b0");
        let b1 = tmp.path().join("builds").join("b1");
        std::fs::create_dir_all(&b0).unwrap();
        std::fs::create_dir_all(&b1).unwrap();
        let target = tmp.path().join("srv").join("web");

        let stager = stager();
        stager.stage(&b0, &target, &CancelToken::never()).await.unwrap();
        assert_eq!(Stager::enabled_build(&target).await, Some(b0.clone()));

        stager.stage(&b1, &target, &CancelToken::never()).await.unwrap();
        assert_eq!(Stager::enabled_build(&target).await, Some(b1.clone()));
        assert!(!tmp_link(&target).exists());

        Stager::unstage(&target).await.unwrap();
        assert_eq!(Stager::enabled_build(&target).await, None);
        assert!(b1.is_dir());
    }

    #[tokio::test]
    async fn test_refuses_to_replace_directory() {
        let tmp = tempfile::tempdir().unwrap();
        let b1 = tmp.path().join("b1");
        let target = tmp.path().join("web");
        std::fs::create_dir_all(&b1).unwrap();
        std::fs::create_dir_all(&target).unwrap();

        let err = stager().stage(&b1, &target, &CancelToken::never()).await.unwrap_err();
        assert!(matches!(err, AgentError::ConfigError(_)));
    }

    #[tokio::test]
    async fn test_missing_build_dir() {
        let tmp = tempfile::tempdir().unwrap();
        let err = stager()
            .stage(&tmp.path().join("nope"), &tmp.path().join("web"), &CancelToken::never())
            .await
            .unwrap_err();
        assert!(matches!(err, AgentError::StorageError(_)));
    }
}
