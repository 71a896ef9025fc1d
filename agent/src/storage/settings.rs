//! Settings file management

use std::collections::BTreeMap;
use std::time::Duration;

use ping_protocol::Stage;
use secrecy::SecretString;
use serde::Deserialize;

use crate::errors::AgentError;
use crate::filesys::file::File;
use crate::logs::LogLevel;

/// Agent settings
#[derive(Debug, Clone, Deserialize)]
pub struct Settings {
    /// Log level
    #[serde(default)]
    pub log_level: LogLevel,

    /// JSON formatted stdout logs
    #[serde(default)]
    pub log_json: bool,

    /// Also write logs to a daily rolling file under `paths.log_dir`
    #[serde(default = "default_true")]
    pub log_to_file: bool,

    /// Control plane configuration
    #[serde(default)]
    pub control_plane: ControlPlaneSettings,

    /// Host identity overrides
    #[serde(default)]
    pub host: HostSettings,

    /// Filesystem layout
    #[serde(default)]
    pub paths: PathSettings,

    /// Reconciliation loop timing
    #[serde(default)]
    pub reconcile: ReconcileSettings,

    /// Stage execution policy
    #[serde(default)]
    pub stages: StageSettings,

    /// Artifact download configuration
    #[serde(default)]
    pub download: DownloadSettings,

    /// Emit metrics through the log sink
    #[serde(default)]
    pub enable_metrics: bool,

    /// Local status endpoint
    #[serde(default)]
    pub status_server: StatusServerSettings,
}

fn default_true() -> bool {
    true
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            log_level: LogLevel::Info,
            log_json: false,
            log_to_file: true,
            control_plane: ControlPlaneSettings::default(),
            host: HostSettings::default(),
            paths: PathSettings::default(),
            reconcile: ReconcileSettings::default(),
            stages: StageSettings::default(),
            download: DownloadSettings::default(),
            enable_metrics: false,
            status_server: StatusServerSettings::default(),
        }
    }
}

impl Settings {
    /// Read and validate the settings file
    pub async fn load(file: &File) -> Result<Self, AgentError> {
        let settings: Settings = file
            .read_json()
            .await
            .map_err(|e| AgentError::ConfigError(format!("{:?}: {}", file.path(), e)))?;
        settings.validate()?;
        Ok(settings)
    }

    pub fn validate(&self) -> Result<(), AgentError> {
        url::Url::parse(&self.control_plane.base_url).map_err(|e| {
            AgentError::ConfigError(format!(
                "invalid control plane url '{}': {}",
                self.control_plane.base_url, e
            ))
        })?;
        if self.control_plane.max_tries == 0 {
            return Err(AgentError::ConfigError("control_plane.max_tries must be at least 1".to_string()));
        }
        if self.stages.max_retry == 0 {
            return Err(AgentError::ConfigError("stages.max_retry must be at least 1".to_string()));
        }
        if self.stages.accepted_exit_codes.is_empty() {
            return Err(AgentError::ConfigError(
                "stages.accepted_exit_codes must not be empty".to_string(),
            ));
        }
        if self.reconcile.poll_interval_secs == 0 {
            return Err(AgentError::ConfigError(
                "reconcile.poll_interval_secs must be positive".to_string(),
            ));
        }
        Ok(())
    }
}

/// Control plane settings
#[derive(Debug, Clone, Deserialize)]
pub struct ControlPlaneSettings {
    /// Base URL of the control plane service
    #[serde(default = "default_base_url")]
    pub base_url: String,

    /// API version path segment
    #[serde(default = "default_api_version")]
    pub api_version: String,

    /// Token sent as `Authorization: token <token>`
    #[serde(default)]
    pub token: Option<SecretString>,

    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,

    /// Attempts per ping before the cycle gives up
    #[serde(default = "default_max_tries")]
    pub max_tries: u32,

    /// Base delay between ping attempts
    #[serde(default = "default_retry_delay")]
    pub retry_delay_secs: u64,
}

fn default_base_url() -> String {
    "http://localhost:8080".to_string()
}

fn default_api_version() -> String {
    "v1".to_string()
}

fn default_request_timeout() -> u64 {
    30
}

fn default_max_tries() -> u32 {
    3
}

fn default_retry_delay() -> u64 {
    1
}

impl Default for ControlPlaneSettings {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            api_version: default_api_version(),
            token: None,
            request_timeout_secs: default_request_timeout(),
            max_tries: default_max_tries(),
            retry_delay_secs: default_retry_delay(),
        }
    }
}

/// Host identity overrides. Unset values are discovered at startup.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct HostSettings {
    #[serde(default)]
    pub host_id: Option<String>,

    #[serde(default)]
    pub host_name: Option<String>,

    #[serde(default)]
    pub host_ip: Option<String>,

    #[serde(default)]
    pub groups: Vec<String>,
}

/// Filesystem layout
#[derive(Debug, Clone, Deserialize)]
pub struct PathSettings {
    /// Status records and script config files
    #[serde(default = "default_agent_dir")]
    pub agent_dir: String,

    /// Downloaded and extracted builds, one subdirectory per environment
    #[serde(default = "default_builds_dir")]
    pub builds_dir: String,

    #[serde(default = "default_log_dir")]
    pub log_dir: String,

    /// Parent of `<env>` install targets when a goal names none
    #[serde(default = "default_target_dir")]
    pub target_default_dir: String,
}

fn default_agent_dir() -> String {
    "/tmp/deployd".to_string()
}

fn default_builds_dir() -> String {
    "/tmp/deployd/builds".to_string()
}

fn default_log_dir() -> String {
    "/tmp/deployd/logs".to_string()
}

fn default_target_dir() -> String {
    "/tmp".to_string()
}

impl Default for PathSettings {
    fn default() -> Self {
        Self {
            agent_dir: default_agent_dir(),
            builds_dir: default_builds_dir(),
            log_dir: default_log_dir(),
            target_default_dir: default_target_dir(),
        }
    }
}

/// Reconciliation loop timing
#[derive(Debug, Clone, Deserialize)]
pub struct ReconcileSettings {
    #[serde(default = "default_poll_interval")]
    pub poll_interval_secs: u64,

    #[serde(default = "default_initial_delay")]
    pub initial_delay_secs: u64,

    /// Sleep after a `WAIT` that carries no `wait_seconds`
    #[serde(default = "default_wait_backoff")]
    pub wait_backoff_secs: u64,

    /// Re-report interval while a stage is running
    #[serde(default = "default_heartbeat_interval")]
    pub heartbeat_interval_secs: u64,

    /// Responses handled back to back within one cycle
    #[serde(default = "default_max_steps")]
    pub max_steps_per_cycle: u32,
}

fn default_poll_interval() -> u64 {
    30
}

fn default_initial_delay() -> u64 {
    5
}

fn default_wait_backoff() -> u64 {
    300
}

fn default_heartbeat_interval() -> u64 {
    60
}

fn default_max_steps() -> u32 {
    32
}

impl Default for ReconcileSettings {
    fn default() -> Self {
        Self {
            poll_interval_secs: default_poll_interval(),
            initial_delay_secs: default_initial_delay(),
            wait_backoff_secs: default_wait_backoff(),
            heartbeat_interval_secs: default_heartbeat_interval(),
            max_steps_per_cycle: default_max_steps(),
        }
    }
}

/// Stage execution policy
#[derive(Debug, Clone, Deserialize)]
pub struct StageSettings {
    /// Failed attempts per deploy before `TOO_MANY_RETRY`
    #[serde(default = "default_max_retry")]
    pub max_retry: u32,

    /// Default per-stage script timeout
    #[serde(default = "default_process_timeout")]
    pub process_timeout_secs: u64,

    /// Per-stage timeout overrides
    #[serde(default)]
    pub stage_timeouts: BTreeMap<Stage, u64>,

    #[serde(default = "default_accepted_exit_codes")]
    pub accepted_exit_codes: Vec<i32>,

    /// Captured stdout/stderr kept per command
    #[serde(default = "default_max_tail_bytes")]
    pub max_tail_bytes: usize,

    /// Stages a HOTFIX deploy skips
    #[serde(default = "default_hotfix_skip_stages")]
    pub hotfix_skip_stages: Vec<Stage>,

    /// Fail RESTARTING when no restart script can be found
    #[serde(default = "default_true")]
    pub require_restart_script: bool,

    #[serde(default = "default_num_builds_to_retain")]
    pub num_builds_to_retain: usize,

    /// Owner given to staged builds via `chown -R`
    #[serde(default)]
    pub user_role: Option<String>,
}

fn default_max_retry() -> u32 {
    3
}

fn default_process_timeout() -> u64 {
    1800
}

fn default_accepted_exit_codes() -> Vec<i32> {
    vec![0]
}

fn default_max_tail_bytes() -> usize {
    10240
}

fn default_hotfix_skip_stages() -> Vec<Stage> {
    vec![Stage::PostDownload, Stage::PostRestart]
}

fn default_num_builds_to_retain() -> usize {
    2
}

impl Default for StageSettings {
    fn default() -> Self {
        Self {
            max_retry: default_max_retry(),
            process_timeout_secs: default_process_timeout(),
            stage_timeouts: BTreeMap::new(),
            accepted_exit_codes: default_accepted_exit_codes(),
            max_tail_bytes: default_max_tail_bytes(),
            hotfix_skip_stages: default_hotfix_skip_stages(),
            require_restart_script: true,
            num_builds_to_retain: default_num_builds_to_retain(),
            user_role: None,
        }
    }
}

impl StageSettings {
    pub fn timeout_for(&self, stage: Stage) -> Duration {
        Duration::from_secs(
            self.stage_timeouts
                .get(&stage)
                .copied()
                .unwrap_or(self.process_timeout_secs),
        )
    }
}

/// Artifact download configuration
#[derive(Debug, Clone, Deserialize)]
pub struct DownloadSettings {
    /// Timeout for one transfer
    #[serde(default = "default_download_timeout")]
    pub timeout_secs: u64,

    /// Attempts per HTTP transfer
    #[serde(default = "default_max_tries")]
    pub max_tries: u32,

    /// URL prefixes HTTP downloads must match; empty allows all
    #[serde(default)]
    pub http_allow_list: Vec<String>,

    /// Buckets S3 downloads must come from; empty allows all
    #[serde(default)]
    pub s3_allow_list: Vec<String>,

    #[serde(default)]
    pub s3: S3Settings,

    #[serde(default = "default_gpg_path")]
    pub gpg_path: String,

    #[serde(default = "default_tar_path")]
    pub tar_path: String,

    #[serde(default = "default_unzip_path")]
    pub unzip_path: String,
}

fn default_download_timeout() -> u64 {
    600
}

fn default_gpg_path() -> String {
    "gpg".to_string()
}

fn default_tar_path() -> String {
    "tar".to_string()
}

fn default_unzip_path() -> String {
    "unzip".to_string()
}

impl Default for DownloadSettings {
    fn default() -> Self {
        Self {
            timeout_secs: default_download_timeout(),
            max_tries: default_max_tries(),
            http_allow_list: Vec::new(),
            s3_allow_list: Vec::new(),
            s3: S3Settings::default(),
            gpg_path: default_gpg_path(),
            tar_path: default_tar_path(),
            unzip_path: default_unzip_path(),
        }
    }
}

impl DownloadSettings {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

/// Object storage credentials, handed to the `aws` CLI
#[derive(Debug, Clone, Deserialize)]
pub struct S3Settings {
    #[serde(default)]
    pub access_key_id: Option<String>,

    #[serde(default)]
    pub secret_access_key: Option<SecretString>,

    #[serde(default)]
    pub region: Option<String>,

    /// Let the CLI resolve credentials from the instance profile
    #[serde(default)]
    pub use_instance_profile: bool,

    #[serde(default = "default_aws_cli")]
    pub cli_path: String,
}

fn default_aws_cli() -> String {
    "aws".to_string()
}

impl Default for S3Settings {
    fn default() -> Self {
        Self {
            access_key_id: None,
            secret_access_key: None,
            region: None,
            use_instance_profile: false,
            cli_path: default_aws_cli(),
        }
    }
}

/// Local status endpoint settings
#[derive(Debug, Clone, Deserialize)]
pub struct StatusServerSettings {
    #[serde(default)]
    pub enabled: bool,

    #[serde(default = "default_server_host")]
    pub host: String,

    #[serde(default = "default_server_port")]
    pub port: u16,
}

fn default_server_host() -> String {
    "127.0.0.1".to_string()
}

fn default_server_port() -> u16 {
    8090
}

impl Default for StatusServerSettings {
    fn default() -> Self {
        Self {
            enabled: false,
            host: default_server_host(),
            port: default_server_port(),
        }
    }
}
