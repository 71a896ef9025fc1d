//! HTTP(S) artifacts

use std::path::Path;

use async_trait::async_trait;
use tokio::io::AsyncWriteExt;
use tracing::{debug, warn};

use crate::download::Downloader;
use crate::errors::AgentError;
use crate::process::cancel::CancelToken;
use crate::storage::settings::DownloadSettings;
use crate::utils::{calc_exp_backoff, CooldownOptions};

/// Streams an artifact to disk, retrying with exponential backoff
pub struct HttpDownloader {
    client: reqwest::Client,
    allow_list: Vec<String>,
    max_tries: u32,
    cooldown: CooldownOptions,
}

impl HttpDownloader {
    pub fn new(client: reqwest::Client, settings: &DownloadSettings) -> Self {
        Self {
            client,
            allow_list: settings.http_allow_list.clone(),
            max_tries: settings.max_tries.max(1),
            cooldown: CooldownOptions::default(),
        }
    }

    pub fn with_cooldown(mut self, cooldown: CooldownOptions) -> Self {
        self.cooldown = cooldown;
        self
    }

    fn check_allowed(&self, url: &str) -> Result<(), AgentError> {
        if self.allow_list.is_empty() || self.allow_list.iter().any(|p| url.starts_with(p.as_str())) {
            return Ok(());
        }
        Err(AgentError::ConfigError(format!("'{}' is not in the HTTP download allow list", url)))
    }

    async fn fetch_once(&self, url: &str, dest: &Path, cancel: &CancelToken) -> Result<(), AgentError> {
        let mut response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| AgentError::DownloadError(format!("GET {}: {}", url, e)))?;

        if !response.status().is_success() {
            return Err(AgentError::DownloadError(format!(
                "GET {} returned {}",
                url,
                response.status()
            )));
        }

        let mut file = tokio::fs::File::create(dest).await?;
        let mut written: u64 = 0;
        loop {
            let chunk = tokio::select! {
                chunk = response.chunk() => chunk
                    .map_err(|e| AgentError::DownloadError(format!("reading {}: {}", url, e)))?,
                _ = cancel.cancelled() => {
                    return Err(AgentError::Aborted(format!("download of {} cancelled", url)));
                }
            };
            match chunk {
                Some(bytes) => {
                    file.write_all(&bytes).await?;
                    written += bytes.len() as u64;
                }
                None => break,
            }
        }
        file.sync_all().await?;
        debug!("Downloaded {} bytes from {}", written, url);
        Ok(())
    }
}

#[async_trait]
impl Downloader for HttpDownloader {
    fn name(&self) -> &'static str {
        "http"
    }

    async fn download(&self, url: &str, dest: &Path, cancel: &CancelToken) -> Result<(), AgentError> {
        self.check_allowed(url)?;

        let mut attempt = 0;
        loop {
            match self.fetch_once(url, dest, cancel).await {
                Ok(()) => return Ok(()),
                Err(e @ AgentError::Aborted(_)) => return Err(e),
                Err(e) if attempt + 1 >= self.max_tries => {
                    return Err(AgentError::DownloadError(format!(
                        "giving up on {} after {} attempts: {}",
                        url, self.max_tries, e
                    )));
                }
                Err(e) => {
                    let delay = calc_exp_backoff(&self.cooldown, attempt);
                    attempt += 1;
                    warn!(
                        "Download attempt {} of {} failed, retrying in {:?}: {}",
                        attempt, self.max_tries, delay, e
                    );
                    tokio::select! {
                        _ = tokio::time::sleep(delay) => {}
                        _ = cancel.cancelled() => {
                            return Err(AgentError::Aborted(format!("download of {} cancelled", url)));
                        }
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    use axum::{extract::State, http::StatusCode, routing::get, Router};

    async fn serve(router: Router) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, router).await.unwrap();
        });
        format!("http://{}", addr)
    }

    fn fast() -> CooldownOptions {
        CooldownOptions {
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(5),
            multiplier: 2.0,
        }
    }

    #[tokio::test]
    async fn test_downloads_after_transient_failure() {
        let hits = Arc::new(AtomicU32::new(0));
        let router = Router::new()
            .route(
                "/b1.bin",
                get(|State(hits): State<Arc<AtomicU32>>| async move {
                    if hits.fetch_add(1, Ordering::SeqCst) == 0 {
                        Err(StatusCode::SERVICE_UNAVAILABLE)
                    } else {
                        Ok("artifact-bytes")
                    }
                }),
            )
            .with_state(hits.clone());
        let base = serve(router).await;

        let tmp = tempfile::tempdir().unwrap();
        let dest = tmp.path().join("b1.bin");
        let downloader =
            HttpDownloader::new(reqwest::Client::new(), &DownloadSettings::default()).with_cooldown(fast());
        downloader
            .download(&format!("{}/b1.bin", base), &dest, &CancelToken::never())
            .await
            .unwrap();

        assert_eq!(std::fs::read(&dest).unwrap(), b"artifact-bytes");
        assert_eq!(hits.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_gives_up_after_max_tries() {
        let base = serve(Router::new()).await;
        let tmp = tempfile::tempdir().unwrap();
        let downloader =
            HttpDownloader::new(reqwest::Client::new(), &DownloadSettings::default()).with_cooldown(fast());
        let err = downloader
            .download(&format!("{}/missing", base), &tmp.path().join("x"), &CancelToken::never())
            .await
            .unwrap_err();
        assert!(matches!(err, AgentError::DownloadError(_)));
    }

    #[tokio::test]
    async fn test_allow_list_is_enforced() {
        let settings = DownloadSettings {
            http_allow_list: vec!["https://artifacts.internal/".to_string()],
            ..Default::default()
        };
        let tmp = tempfile::tempdir().unwrap();
        let err = HttpDownloader::new(reqwest::Client::new(), &settings)
            .download("https://evil.example/b1.bin", &tmp.path().join("x"), &CancelToken::never())
            .await
            .unwrap_err();
        assert!(matches!(err, AgentError::ConfigError(_)));
    }
}
