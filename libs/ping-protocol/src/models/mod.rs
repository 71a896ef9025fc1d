//! Ping request/response models

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::codes::{DeployType, OpCode, Stage, Status};

/// A response the agent cannot act on
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProtocolError {
    #[error("op code {0} requires a deploy goal")]
    MissingGoal(OpCode),

    #[error("deploy goal for op code {0} has no environment")]
    MissingEnvironment(OpCode),
}

/// Build published by the build pipeline
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Build {
    pub build_id: String,

    #[serde(default)]
    pub build_name: Option<String>,

    #[serde(default)]
    pub artifact_url: Option<String>,

    #[serde(default)]
    pub scm_repo: Option<String>,

    #[serde(default)]
    pub scm_branch: Option<String>,

    #[serde(default)]
    pub scm_commit: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub publish_date: Option<i64>,
}

/// A script to run for a stage
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScriptHook {
    /// Shell command line
    pub command: String,

    /// Exit codes counted as success, overriding the agent's configured set
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub accepted_exit_codes: Option<Vec<i32>>,

    /// Timeout overriding the agent's per-stage timeout
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_secs: Option<u64>,
}

/// Goal the control plane wants an environment to reach
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeployGoal {
    pub deploy_id: String,

    #[serde(default)]
    pub env_id: Option<String>,

    #[serde(default)]
    pub env_name: String,

    #[serde(default)]
    pub stage_name: Option<String>,

    #[serde(default)]
    pub deploy_alias: Option<String>,

    /// Stage the agent should reach, inclusive
    #[serde(default)]
    pub deploy_stage: Option<Stage>,

    #[serde(default)]
    pub deploy_type: Option<DeployType>,

    #[serde(default)]
    pub build: Option<Build>,

    /// Expected artifact checksum, `sha1:`/`md5:`/`sha256:` prefixed or bare hex
    #[serde(default)]
    pub artifact_checksum: Option<String>,

    #[serde(default)]
    pub script_hooks: BTreeMap<Stage, Vec<ScriptHook>>,

    #[serde(default)]
    pub script_variables: BTreeMap<String, String>,

    #[serde(default)]
    pub agent_configs: BTreeMap<String, String>,

    #[serde(default)]
    pub first_deploy: bool,
}

impl DeployGoal {
    pub fn build_id(&self) -> Option<&str> {
        self.build.as_ref().map(|b| b.build_id.as_str())
    }

    /// Deploy type the op code implies. Restart, rollback and stop op codes
    /// override whatever type the goal declares.
    pub fn deploy_type_for(&self, op_code: OpCode) -> DeployType {
        match op_code {
            OpCode::Restart => DeployType::Restart,
            OpCode::Rollback => DeployType::Rollback,
            OpCode::Stop | OpCode::Terminate => DeployType::Stop,
            _ => self.deploy_type.unwrap_or_default(),
        }
    }
}

/// Status of one environment on this host
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PingReport {
    pub env_name: String,

    #[serde(default)]
    pub env_id: Option<String>,

    #[serde(default)]
    pub deploy_id: Option<String>,

    #[serde(default)]
    pub deploy_stage: Stage,

    #[serde(default)]
    pub status: Status,

    #[serde(default)]
    pub error_code: i32,

    #[serde(default)]
    pub error_message: Option<String>,

    #[serde(default)]
    pub fail_count: u32,

    #[serde(default)]
    pub stage_name: Option<String>,

    #[serde(default)]
    pub deploy_alias: Option<String>,

    /// Milliseconds since the Unix epoch
    #[serde(default)]
    pub reported_at: i64,
}

/// Request sent by the agent every cycle
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PingRequest {
    pub host_id: String,

    pub host_name: String,

    #[serde(default)]
    pub host_ip: Option<String>,

    #[serde(default)]
    pub groups: Vec<String>,

    #[serde(default)]
    pub agent_version: String,

    #[serde(default)]
    pub reports: Vec<PingReport>,
}

/// Control-plane answer to a ping
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PingResponse {
    #[serde(default)]
    pub op_code: OpCode,

    #[serde(default)]
    pub deploy_goal: Option<DeployGoal>,

    /// Server-specified backoff for `WAIT`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub wait_seconds: Option<u64>,
}

impl PingResponse {
    pub fn noop() -> Self {
        Self::default()
    }

    pub fn with_goal(op_code: OpCode, goal: DeployGoal) -> Self {
        Self {
            op_code,
            deploy_goal: Some(goal),
            wait_seconds: None,
        }
    }

    /// Reject responses whose op code cannot be carried out without a goal.
    /// `DELETE` and `TERMINATE` may name the environment by id only.
    pub fn validate(&self) -> Result<(), ProtocolError> {
        if !self.op_code.requires_goal() {
            return Ok(());
        }
        let goal = self
            .deploy_goal
            .as_ref()
            .ok_or(ProtocolError::MissingGoal(self.op_code))?;
        let by_id = matches!(self.op_code, OpCode::Delete | OpCode::Terminate)
            && goal.env_id.is_some();
        if goal.env_name.is_empty() && !by_id {
            return Err(ProtocolError::MissingEnvironment(self.op_code));
        }
        Ok(())
    }

    /// Whether `other` asks for something different from this response.
    pub fn plan_changed(&self, other: &PingResponse) -> bool {
        if self.op_code != other.op_code {
            return true;
        }
        match (&self.deploy_goal, &other.deploy_goal) {
            (Some(a), Some(b)) => a.deploy_id != b.deploy_id || a.deploy_stage != b.deploy_stage,
            (None, None) => false,
            _ => true,
        }
    }
}
