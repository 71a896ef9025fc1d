//! `s3://` artifacts via the `aws` command line client

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use secrecy::ExposeSecret;
use tracing::info;
use url::Url;

use crate::download::{as_download_error, Downloader};
use crate::errors::AgentError;
use crate::process::cancel::CancelToken;
use crate::process::runner::{CommandSpec, ProcessRunner};
use crate::storage::settings::{DownloadSettings, S3Settings};

pub struct S3Downloader {
    runner: Arc<dyn ProcessRunner>,
    settings: S3Settings,
    allow_list: Vec<String>,
    timeout: Duration,
}

impl S3Downloader {
    pub fn new(settings: &DownloadSettings, runner: Arc<dyn ProcessRunner>) -> Self {
        Self {
            runner,
            settings: settings.s3.clone(),
            allow_list: settings.s3_allow_list.clone(),
            timeout: settings.timeout(),
        }
    }

    /// Environment handed to the transfer client. Without static keys the
    /// instance profile must be explicitly allowed.
    fn credentials_env(&self) -> Result<BTreeMap<String, String>, AgentError> {
        let mut env = BTreeMap::new();
        match (&self.settings.access_key_id, &self.settings.secret_access_key) {
            (Some(key_id), Some(secret)) => {
                env.insert("AWS_ACCESS_KEY_ID".to_string(), key_id.clone());
                env.insert(
                    "AWS_SECRET_ACCESS_KEY".to_string(),
                    secret.expose_secret().to_string(),
                );
            }
            _ if self.settings.use_instance_profile => {}
            _ => {
                return Err(AgentError::ConfigError(
                    "no S3 credentials configured for s3:// artifact".to_string(),
                ))
            }
        }
        if let Some(region) = &self.settings.region {
            env.insert("AWS_DEFAULT_REGION".to_string(), region.clone());
        }
        Ok(env)
    }
}

/// Split `s3://bucket/key` into its bucket and key
pub fn parse_s3_url(url: &str) -> Result<(String, String), AgentError> {
    let parsed = Url::parse(url)
        .map_err(|e| AgentError::DownloadError(format!("invalid s3 url '{}': {}", url, e)))?;
    let bucket = parsed
        .host_str()
        .filter(|b| !b.is_empty())
        .ok_or_else(|| AgentError::DownloadError(format!("no bucket in '{}'", url)))?;
    let key = parsed.path().trim_start_matches('/');
    if key.is_empty() {
        return Err(AgentError::DownloadError(format!("no key in '{}'", url)));
    }
    Ok((bucket.to_string(), key.to_string()))
}

#[async_trait]
impl Downloader for S3Downloader {
    fn name(&self) -> &'static str {
        "s3"
    }

    async fn download(&self, url: &str, dest: &Path, cancel: &CancelToken) -> Result<(), AgentError> {
        let (bucket, key) = parse_s3_url(url)?;
        if !self.allow_list.is_empty() && !self.allow_list.contains(&bucket) {
            return Err(AgentError::ConfigError(format!(
                "bucket '{}' is not in the S3 download allow list",
                bucket
            )));
        }
        let env = self.credentials_env()?;

        info!("Fetching s3://{}/{}", bucket, key);
        let spec = CommandSpec::new(&self.settings.cli_path, self.timeout)
            .args(["s3", "cp", "--only-show-errors"])
            .arg(url)
            .arg(dest.to_string_lossy())
            .envs(&env);

        self.runner
            .run(&spec, cancel)
            .await
            .and_then(|output| output.check(&spec, &[0]))
            .map(|_| ())
            .map_err(as_download_error)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::process::runner::CommandOutput;
    use std::sync::Mutex;

    #[derive(Default)]
    struct Recording {
        calls: Mutex<Vec<CommandSpec>>,
        exit_code: i32,
    }

    #[async_trait]
    impl ProcessRunner for Recording {
        async fn run(&self, spec: &CommandSpec, _cancel: &CancelToken) -> Result<CommandOutput, AgentError> {
            self.calls.lock().unwrap().push(spec.clone());
            Ok(CommandOutput {
                exit_code: Some(self.exit_code),
                stderr: "denied".to_string(),
                ..Default::default()
            })
        }
    }

    fn settings_with_keys() -> DownloadSettings {
        let mut settings = DownloadSettings::default();
        settings.s3.access_key_id = Some("AKIA".to_string());
        settings.s3.secret_access_key = Some("secret".to_string().into());
        settings
    }

    #[test]
    fn test_parse_s3_url() {
        assert_eq!(
            parse_s3_url("s3://builds/web/b1.tar.gz").unwrap(),
            ("builds".to_string(), "web/b1.tar.gz".to_string())
        );
        assert!(parse_s3_url("s3://builds/").is_err());
    }

    #[tokio::test]
    async fn test_missing_credentials_is_config_error() {
        let runner = Arc::new(Recording::default());
        let downloader = S3Downloader::new(&DownloadSettings::default(), runner.clone());
        let err = downloader
            .download("s3://builds/b1.tar.gz", Path::new("/tmp/x"), &CancelToken::never())
            .await
            .unwrap_err();
        assert!(matches!(err, AgentError::ConfigError(_)));
        assert!(runner.calls.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_invokes_cli_with_credentials() {
        let runner = Arc::new(Recording::default());
        let downloader = S3Downloader::new(&settings_with_keys(), runner.clone());
        downloader
            .download("s3://builds/b1.tar.gz", Path::new("/tmp/x"), &CancelToken::never())
            .await
            .unwrap();

        let calls = runner.calls.lock().unwrap();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].args[..2], ["s3".to_string(), "cp".to_string()]);
        assert_eq!(calls[0].env["AWS_ACCESS_KEY_ID"], "AKIA");
        assert_eq!(calls[0].env["AWS_SECRET_ACCESS_KEY"], "secret");
    }

    #[tokio::test]
    async fn test_nonzero_exit_is_download_error() {
        let runner = Arc::new(Recording {
            exit_code: 1,
            ..Default::default()
        });
        let downloader = S3Downloader::new(&settings_with_keys(), runner);
        let err = downloader
            .download("s3://builds/b1.tar.gz", Path::new("/tmp/x"), &CancelToken::never())
            .await
            .unwrap_err();
        assert!(matches!(err, AgentError::DownloadError(_)));
    }

    #[tokio::test]
    async fn test_bucket_allow_list() {
        let mut settings = settings_with_keys();
        settings.s3_allow_list = vec!["trusted".to_string()];
        let downloader = S3Downloader::new(&settings, Arc::new(Recording::default()));
        let err = downloader
            .download("s3://builds/b1.tar.gz", Path::new("/tmp/x"), &CancelToken::never())
            .await
            .unwrap_err();
        assert!(matches!(err, AgentError::ConfigError(_)));
    }
}
