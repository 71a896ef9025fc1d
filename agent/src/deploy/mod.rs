//! Stage execution for deploy goals

pub mod cleanup;
pub mod executor;
pub mod fsm;
pub mod hooks;
pub mod stager;
pub mod transform;

use std::path::PathBuf;

use ping_protocol::{Build, DeployGoal, DeployType, OpCode};

use crate::storage::layout::StorageLayout;

/// Goal key naming the install target
pub const TARGET_CONFIG_KEY: &str = "target";

/// Everything a stage needs to know about the deploy it belongs to
#[derive(Debug, Clone)]
pub struct StageContext<'a> {
    pub goal: &'a DeployGoal,
    pub op_code: OpCode,
    pub deploy_type: DeployType,
    /// Build being deployed. For rollbacks this may come from the record
    /// rather than the goal.
    pub build: Option<&'a Build>,
    /// Symlink pointing at the serving build
    pub target: PathBuf,
}

impl<'a> StageContext<'a> {
    pub fn new(
        goal: &'a DeployGoal,
        op_code: OpCode,
        deploy_type: DeployType,
        build: Option<&'a Build>,
        layout: &StorageLayout,
    ) -> Self {
        Self {
            goal,
            op_code,
            deploy_type,
            build,
            target: resolve_target(goal, layout),
        }
    }

    pub fn env_name(&self) -> &str {
        &self.goal.env_name
    }

    pub fn build_id(&self) -> Option<&str> {
        self.build.map(|b| b.build_id.as_str())
    }
}

/// Install target for a goal: its `target` agent config, else
/// `<target_default_dir>/<env>`
pub fn resolve_target(goal: &DeployGoal, layout: &StorageLayout) -> PathBuf {
    goal.agent_configs
        .get(TARGET_CONFIG_KEY)
        .filter(|t| !t.trim().is_empty())
        .map(PathBuf::from)
        .unwrap_or_else(|| layout.default_target(&goal.env_name))
}
