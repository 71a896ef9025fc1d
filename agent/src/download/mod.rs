//! Artifact downloaders selected by URL scheme

pub mod artifact;
pub mod checksum;
pub mod decrypt;
pub mod http;
pub mod local;
pub mod s3;

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use url::Url;

use crate::download::decrypt::DecryptingDownloader;
use crate::download::http::HttpDownloader;
use crate::download::local::LocalDownloader;
use crate::download::s3::S3Downloader;
use crate::errors::AgentError;
use crate::process::cancel::CancelToken;
use crate::process::runner::ProcessRunner;
use crate::storage::settings::DownloadSettings;
use crate::utils::version_info;

/// Fetches one URL into a local file
#[async_trait]
pub trait Downloader: Send + Sync {
    /// Backend name, for logs
    fn name(&self) -> &'static str;

    async fn download(&self, url: &str, dest: &Path, cancel: &CancelToken) -> Result<(), AgentError>;
}

/// Picks the downloader for a URL
pub trait DownloaderFactory: Send + Sync {
    fn create(&self, url: &str) -> Result<Arc<dyn Downloader>, AgentError>;
}

/// `s3://` goes to the object storage backend, `file://` is copied locally and
/// every other scheme is handed to the HTTP client. URLs ending in `.gpg` are
/// decrypted after download.
pub struct SchemeDownloaderFactory {
    settings: DownloadSettings,
    runner: Arc<dyn ProcessRunner>,
    http: reqwest::Client,
}

impl SchemeDownloaderFactory {
    pub fn new(settings: DownloadSettings, runner: Arc<dyn ProcessRunner>) -> Result<Self, AgentError> {
        let http = reqwest::Client::builder()
            .timeout(settings.timeout())
            .user_agent(version_info().user_agent())
            .build()?;
        Ok(Self {
            settings,
            runner,
            http,
        })
    }
}

impl DownloaderFactory for SchemeDownloaderFactory {
    fn create(&self, url: &str) -> Result<Arc<dyn Downloader>, AgentError> {
        let parsed = Url::parse(url)
            .map_err(|e| AgentError::DownloadError(format!("invalid artifact url '{}': {}", url, e)))?;

        let backend: Arc<dyn Downloader> = match parsed.scheme() {
            "s3" => Arc::new(S3Downloader::new(&self.settings, self.runner.clone())),
            "file" => Arc::new(LocalDownloader),
            _ => Arc::new(HttpDownloader::new(self.http.clone(), &self.settings)),
        };

        if is_encrypted(&parsed) {
            return Ok(Arc::new(DecryptingDownloader::new(
                backend,
                self.runner.clone(),
                &self.settings,
            )));
        }
        Ok(backend)
    }
}

fn is_encrypted(url: &Url) -> bool {
    url.path().to_ascii_lowercase().ends_with(".gpg")
}

/// Map a backend failure onto a download failure, keeping aborts, timeouts and
/// configuration problems distinguishable
pub(crate) fn as_download_error(err: AgentError) -> AgentError {
    match err {
        AgentError::Aborted(_)
        | AgentError::TimeoutError { .. }
        | AgentError::ConfigError(_)
        | AgentError::DownloadError(_)
        | AgentError::ChecksumMismatch { .. } => err,
        other => AgentError::DownloadError(other.to_string()),
    }
}
