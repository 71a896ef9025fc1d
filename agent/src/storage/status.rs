//! Durable per-environment deploy status

use std::collections::BTreeMap;
use std::path::Path;

use chrono::{DateTime, Utc};
use ping_protocol::{Build, DeployGoal, DeployType, OpCode, PingReport, Stage, Status};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::errors::AgentError;
use crate::filesys::dir::Dir;
use crate::filesys::file::File;
use crate::filesys::validate_component;
use crate::utils::tail;

const MAX_ERROR_MESSAGE_BYTES: usize = 2048;

/// What the agent last did for one environment
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeployStatusRecord {
    pub env_name: String,

    #[serde(default)]
    pub env_id: Option<String>,

    pub deploy_id: String,

    #[serde(default)]
    pub current_stage: Stage,

    #[serde(default)]
    pub status: Status,

    #[serde(default)]
    pub retry_count: u32,

    #[serde(default)]
    pub error_code: i32,

    #[serde(default)]
    pub error_message: Option<String>,

    #[serde(default)]
    pub op_code: OpCode,

    #[serde(default)]
    pub deploy_type: DeployType,

    #[serde(default)]
    pub build: Option<Build>,

    /// Build that was serving before this deploy started, used by rollbacks
    #[serde(default)]
    pub previous_build: Option<Build>,

    #[serde(default)]
    pub stage_name: Option<String>,

    #[serde(default)]
    pub deploy_alias: Option<String>,

    pub last_updated: DateTime<Utc>,
}

impl DeployStatusRecord {
    /// Fresh record for a goal the agent has not seen before. The serving build
    /// of the record it replaces becomes the rollback candidate.
    pub fn for_goal(
        goal: &DeployGoal,
        op_code: OpCode,
        deploy_type: DeployType,
        replaced: Option<&DeployStatusRecord>,
    ) -> Self {
        let previous_build = replaced.and_then(|r| {
            if r.is_serving() {
                r.build.clone()
            } else {
                r.previous_build.clone()
            }
        });
        Self {
            env_name: goal.env_name.clone(),
            env_id: goal.env_id.clone(),
            deploy_id: goal.deploy_id.clone(),
            current_stage: Stage::Unknown,
            status: Status::Unknown,
            retry_count: 0,
            error_code: 0,
            error_message: None,
            op_code,
            deploy_type,
            build: goal.build.clone(),
            previous_build,
            stage_name: goal.stage_name.clone(),
            deploy_alias: goal.deploy_alias.clone(),
            last_updated: Utc::now(),
        }
    }

    /// Whether the record describes a build that finished deploying
    pub fn is_serving(&self) -> bool {
        self.current_stage == Stage::ServingBuild && self.status == Status::Succeeded
    }

    pub fn retries_exhausted(&self) -> bool {
        self.status == Status::TooManyRetry
    }

    /// Enter `stage`; the attempt is in flight until `succeed` or `fail`
    pub fn begin(&mut self, stage: Stage) {
        self.current_stage = stage;
        self.status = Status::Unknown;
        self.error_code = 0;
        self.error_message = None;
        self.last_updated = Utc::now();
    }

    pub fn succeed(&mut self) {
        self.status = Status::Succeeded;
        self.error_code = 0;
        self.error_message = None;
        self.last_updated = Utc::now();
    }

    /// Record a failed attempt of the current stage and return the resulting
    /// status. Aborts do not count against the retry budget.
    pub fn fail(&mut self, err: &AgentError, max_retry: u32) -> Status {
        let status = err.status();
        self.error_code = err.error_code();
        self.error_message = Some(tail(&err.to_string(), MAX_ERROR_MESSAGE_BYTES).to_string());
        self.last_updated = Utc::now();

        if status == Status::AbortedByServer {
            self.status = status;
            return status;
        }

        self.retry_count = (self.retry_count + 1).min(max_retry);
        self.status = if self.retry_count >= max_retry {
            Status::TooManyRetry
        } else {
            status
        };
        self.status
    }

    /// Overwrite the stage without running anything
    pub fn mark(&mut self, stage: Stage, status: Status) {
        self.current_stage = stage;
        self.status = status;
        self.error_code = 0;
        self.error_message = None;
        self.last_updated = Utc::now();
    }

    pub fn to_report(&self) -> PingReport {
        PingReport {
            env_name: self.env_name.clone(),
            env_id: self.env_id.clone(),
            deploy_id: Some(self.deploy_id.clone()),
            deploy_stage: self.current_stage,
            status: self.status,
            error_code: self.error_code,
            error_message: self.error_message.clone(),
            fail_count: self.retry_count,
            stage_name: self.stage_name.clone(),
            deploy_alias: self.deploy_alias.clone(),
            reported_at: self.last_updated.timestamp_millis(),
        }
    }
}

/// Environment names become file and directory names
pub fn validate_env_name(env_name: &str) -> Result<(), AgentError> {
    validate_component("environment name", env_name)
}

/// One JSON record per environment, replaced atomically on every write
#[derive(Debug, Clone)]
pub struct StatusStore {
    dir: Dir,
}

impl StatusStore {
    pub fn new(dir: Dir) -> Self {
        Self { dir }
    }

    pub fn dir(&self) -> &Dir {
        &self.dir
    }

    fn record_file(&self, env_name: &str) -> File {
        self.dir.file(&format!("{}.json", env_name))
    }

    /// Load an environment's record. Missing or unreadable records read as absent.
    pub async fn load(&self, env_name: &str) -> Option<DeployStatusRecord> {
        if validate_env_name(env_name).is_err() {
            return None;
        }
        let file = self.record_file(env_name);
        if !file.exists().await {
            return None;
        }
        match file.read_json::<DeployStatusRecord>().await {
            Ok(record) if record.env_name == env_name => Some(record),
            Ok(record) => {
                warn!(
                    "Status record {:?} belongs to '{}', ignoring it",
                    file.path(),
                    record.env_name
                );
                None
            }
            Err(e) => {
                warn!("Unreadable status record {:?}, treating as UNKNOWN: {}", file.path(), e);
                None
            }
        }
    }

    /// Load every readable record, keyed by environment name
    pub async fn load_all(&self) -> BTreeMap<String, DeployStatusRecord> {
        let mut records = BTreeMap::new();
        let files = match self.dir.list_files().await {
            Ok(files) => files,
            Err(e) => {
                warn!("Unable to list status records in {:?}: {}", self.dir.path(), e);
                return records;
            }
        };
        for path in files {
            let Some(env_name) = env_name_of(&path) else {
                continue;
            };
            if let Some(record) = self.load(&env_name).await {
                records.insert(env_name, record);
            }
        }
        records
    }

    pub async fn save(&self, record: &DeployStatusRecord) -> Result<(), AgentError> {
        validate_env_name(&record.env_name)?;
        debug!(
            "Saving status for {}: {} {} (retry {})",
            record.env_name, record.current_stage, record.status, record.retry_count
        );
        self.record_file(&record.env_name).write_json(record).await
    }

    pub async fn delete(&self, env_name: &str) -> Result<(), AgentError> {
        validate_env_name(env_name)?;
        self.record_file(env_name).delete().await
    }
}

fn env_name_of(path: &Path) -> Option<String> {
    let name = path.file_name()?.to_str()?;
    if name.starts_with('.') {
        return None;
    }
    name.strip_suffix(".json").map(str::to_string)
}
