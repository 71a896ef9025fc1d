//! Build artifacts on disk: fetch, verify, extract

use std::path::{Path, PathBuf};
use std::sync::Arc;

use ping_protocol::Build;
use tracing::{debug, info, warn};
use url::Url;

use crate::download::checksum::{self, Checksum};
use crate::download::{as_download_error, DownloaderFactory};
use crate::errors::AgentError;
use crate::filesys::dir::Dir;
use crate::filesys::file::File;
use crate::filesys::validate_component;
use crate::process::cancel::CancelToken;
use crate::process::runner::{CommandSpec, ProcessRunner};
use crate::storage::layout::StorageLayout;
use crate::storage::settings::DownloadSettings;
use crate::utils::generate_uuid;

const ARCHIVE_EXTENSIONS: &[&str] = &["tar.gz", "tar.bz2", "tar.xz", "tgz", "tar", "zip"];

/// Result of making a build available locally
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchOutcome {
    /// False when the artifact was already present and nothing was transferred
    pub downloaded: bool,
    pub build_dir: PathBuf,
}

/// Places builds under `<builds_dir>/<env>/`:
///
/// * `<build>.<ext>` the verified artifact
/// * `<build>/` its extracted contents
/// * `<build>.extracted` marker written once extraction finished
///
/// Transfers land in a `.part` file first and are only renamed into place after
/// the checksum matched.
pub struct ArtifactFetcher {
    factory: Arc<dyn DownloaderFactory>,
    runner: Arc<dyn ProcessRunner>,
    layout: StorageLayout,
    settings: DownloadSettings,
}

impl ArtifactFetcher {
    pub fn new(
        factory: Arc<dyn DownloaderFactory>,
        runner: Arc<dyn ProcessRunner>,
        layout: StorageLayout,
        settings: DownloadSettings,
    ) -> Self {
        Self {
            factory,
            runner,
            layout,
            settings,
        }
    }

    pub fn build_dir(&self, env_name: &str, build_id: &str) -> Dir {
        self.layout.env_builds_dir(env_name).subdir(build_id)
    }

    pub async fn fetch(
        &self,
        env_name: &str,
        build: &Build,
        expected: Option<&Checksum>,
        cancel: &CancelToken,
    ) -> Result<FetchOutcome, AgentError> {
        validate_component("environment name", env_name)?;
        validate_component("build id", &build.build_id)?;
        let url = build.artifact_url.as_deref().ok_or_else(|| {
            AgentError::DownloadError(format!("build {} has no artifact url", build.build_id))
        })?;

        let ext = artifact_extension(url);
        let env_dir = self.layout.env_builds_dir(env_name);
        env_dir.create().await?;
        let archive = env_dir.file(&format!("{}.{}", build.build_id, ext));
        let marker = env_dir.file(&format!("{}.extracted", build.build_id));
        let build_dir = env_dir.subdir(&build.build_id);

        let archive_ok = match expected {
            Some(checksum) => checksum::is_match(archive.path(), checksum).await,
            None => archive.exists().await,
        };

        if marker.exists().await && build_dir.exists().await && (expected.is_none() || archive_ok) {
            info!("Build {} already present for {}, skipping download", build.build_id, env_name);
            return Ok(FetchOutcome {
                downloaded: false,
                build_dir: build_dir.path().to_path_buf(),
            });
        }

        if archive_ok {
            info!("Build {} already downloaded for {}, extracting", build.build_id, env_name);
            self.extract(&archive, &build_dir, &ext, url, cancel).await?;
            marker.touch().await?;
            return Ok(FetchOutcome {
                downloaded: false,
                build_dir: build_dir.path().to_path_buf(),
            });
        }

        let part = env_dir.file(&format!("{}.{}.{}.part", build.build_id, ext, generate_uuid()));
        let downloader = self.factory.create(url)?;
        info!("Downloading build {} for {} via {}", build.build_id, env_name, downloader.name());

        if let Err(e) = self.download_verified(downloader.as_ref(), url, &part, expected, cancel).await {
            if let Err(cleanup) = part.delete().await {
                warn!("Unable to remove partial download {:?}: {}", part.path(), cleanup);
            }
            return Err(as_download_error(e));
        }

        tokio::fs::rename(part.path(), archive.path()).await?;
        marker.delete().await?;
        self.extract(&archive, &build_dir, &ext, url, cancel).await?;
        marker.touch().await?;

        Ok(FetchOutcome {
            downloaded: true,
            build_dir: build_dir.path().to_path_buf(),
        })
    }

    async fn download_verified(
        &self,
        downloader: &dyn crate::download::Downloader,
        url: &str,
        part: &File,
        expected: Option<&Checksum>,
        cancel: &CancelToken,
    ) -> Result<(), AgentError> {
        downloader.download(url, part.path(), cancel).await?;
        if let Some(checksum) = expected {
            checksum::verify(part.path(), checksum).await?;
            debug!("Checksum {} verified for {}", checksum, url);
        }
        Ok(())
    }

    async fn extract(
        &self,
        archive: &File,
        build_dir: &Dir,
        ext: &str,
        url: &str,
        cancel: &CancelToken,
    ) -> Result<(), AgentError> {
        build_dir.delete().await?;
        build_dir.create().await?;

        let archive_path = archive.path().to_string_lossy().to_string();
        let target = build_dir.path().to_string_lossy().to_string();
        let spec = match ext {
            "zip" => Some(
                CommandSpec::new(&self.settings.unzip_path, self.settings.timeout())
                    .args(["-o", "-q"])
                    .arg(archive_path)
                    .args(["-d", target.as_str()]),
            ),
            "bin" => None,
            _ => Some(
                CommandSpec::new(&self.settings.tar_path, self.settings.timeout())
                    .arg("-xf")
                    .arg(archive_path)
                    .args(["-C", target.as_str()]),
            ),
        };

        let result = match spec {
            Some(spec) => self
                .runner
                .run(&spec, cancel)
                .await
                .and_then(|output| output.check(&spec, &[0]))
                .map(|_| ()),
            None => {
                let dest = build_dir.path().join(plain_file_name(url, archive.path()));
                tokio::fs::copy(archive.path(), dest)
                    .await
                    .map(|_| ())
                    .map_err(AgentError::from)
            }
        };

        if let Err(e) = result {
            build_dir.delete().await?;
            return Err(as_download_error(e));
        }
        debug!("Extracted {:?} into {:?}", archive.path(), build_dir.path());
        Ok(())
    }

    /// Remove transfers that never completed, such as after a cancelled download
    pub async fn remove_partials(&self, env_name: &str) -> Result<(), AgentError> {
        validate_component("environment name", env_name)?;
        for path in self.layout.env_builds_dir(env_name).list_files().await? {
            let name = path.file_name().and_then(|n| n.to_str()).unwrap_or_default();
            if name.ends_with(".part") || name.ends_with(".gpg") {
                debug!("Removing partial artifact {:?}", path);
                File::new(path).delete().await?;
            }
        }
        Ok(())
    }

    /// Remove every build of an environment
    pub async fn remove_all(&self, env_name: &str) -> Result<(), AgentError> {
        validate_component("environment name", env_name)?;
        self.layout.env_builds_dir(env_name).delete().await
    }
}

/// Archive extension of an artifact URL, ignoring a trailing `.gpg`. Anything
/// that is not a known archive format is stored as `bin` and copied as is.
pub fn artifact_extension(url: &str) -> String {
    let name = file_name_of(url).to_ascii_lowercase();
    let name = name.strip_suffix(".gpg").unwrap_or(&name);
    ARCHIVE_EXTENSIONS
        .iter()
        .find(|ext| name.ends_with(&format!(".{}", ext)))
        .map(|ext| ext.to_string())
        .unwrap_or_else(|| "bin".to_string())
}

fn file_name_of(url: &str) -> String {
    let path = Url::parse(url)
        .map(|u| u.path().to_string())
        .unwrap_or_else(|_| url.to_string());
    path.rsplit('/').next().unwrap_or_default().to_string()
}

fn plain_file_name(url: &str, archive: &Path) -> String {
    let name = file_name_of(url);
    let name = name.strip_suffix(".gpg").unwrap_or(&name);
    if name.is_empty() {
        return archive
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| "artifact".to_string());
    }
    name.to_string()
}
