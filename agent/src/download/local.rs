//! `file://` artifacts

use std::path::Path;

use async_trait::async_trait;
use tracing::debug;
use url::Url;

use crate::download::Downloader;
use crate::errors::AgentError;
use crate::process::cancel::CancelToken;

/// Copies artifacts already present on the host
pub struct LocalDownloader;

#[async_trait]
impl Downloader for LocalDownloader {
    fn name(&self) -> &'static str {
        "local"
    }

    async fn download(&self, url: &str, dest: &Path, cancel: &CancelToken) -> Result<(), AgentError> {
        let source = Url::parse(url)
            .ok()
            .and_then(|u| u.to_file_path().ok())
            .ok_or_else(|| AgentError::DownloadError(format!("invalid file url '{}'", url)))?;

        debug!("Copying {:?} to {:?}", source, dest);
        tokio::select! {
            result = tokio::fs::copy(&source, dest) => {
                result.map_err(|e| AgentError::DownloadError(format!("copy {:?}: {}", source, e)))?;
                Ok(())
            }
            _ = cancel.cancelled() => Err(AgentError::Aborted(format!("copy of {:?} cancelled", source))),
        }
    }
}
