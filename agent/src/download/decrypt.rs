//! Encrypted artifacts, decrypted with `gpg` after download

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::info;

use crate::download::{as_download_error, Downloader};
use crate::errors::AgentError;
use crate::filesys::file::File;
use crate::process::cancel::CancelToken;
use crate::process::runner::{CommandSpec, ProcessRunner};
use crate::storage::settings::DownloadSettings;

/// Wraps another backend: fetches the ciphertext next to `dest`, then decrypts
/// it into `dest`
pub struct DecryptingDownloader {
    inner: Arc<dyn Downloader>,
    runner: Arc<dyn ProcessRunner>,
    gpg_path: String,
    timeout: Duration,
}

impl DecryptingDownloader {
    pub fn new(
        inner: Arc<dyn Downloader>,
        runner: Arc<dyn ProcessRunner>,
        settings: &DownloadSettings,
    ) -> Self {
        Self {
            inner,
            runner,
            gpg_path: settings.gpg_path.clone(),
            timeout: settings.timeout(),
        }
    }
}

fn ciphertext_path(dest: &Path) -> PathBuf {
    let mut name = dest.as_os_str().to_os_string();
    name.push(".gpg");
    PathBuf::from(name)
}

#[async_trait]
impl Downloader for DecryptingDownloader {
    fn name(&self) -> &'static str {
        "gpg"
    }

    async fn download(&self, url: &str, dest: &Path, cancel: &CancelToken) -> Result<(), AgentError> {
        let cipher = File::new(ciphertext_path(dest));
        self.inner.download(url, cipher.path(), cancel).await?;

        info!("Decrypting {:?}", cipher.path());
        let spec = CommandSpec::new(&self.gpg_path, self.timeout)
            .args(["--batch", "--yes", "--output"])
            .arg(dest.to_string_lossy())
            .arg("--decrypt")
            .arg(cipher.path().to_string_lossy());

        let result = self
            .runner
            .run(&spec, cancel)
            .await
            .and_then(|output| output.check(&spec, &[0]))
            .map(|_| ());
        cipher.delete().await?;
        result.map_err(as_download_error)
    }
}
