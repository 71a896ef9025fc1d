//! Stage machine

use std::sync::Arc;

use ping_protocol::{DeployGoal, OpCode, Stage};
use tracing::{debug, info, warn};

use crate::deploy::fsm::{resume_point, Resume, StagePlan};
use crate::deploy::hooks::HookRunner;
use crate::deploy::stager::Stager;
use crate::deploy::transform::ScriptTransformer;
use crate::deploy::StageContext;
use crate::download::artifact::ArtifactFetcher;
use crate::download::checksum::Checksum;
use crate::errors::AgentError;
use crate::process::cancel::CancelToken;
use crate::process::runner::ProcessRunner;
use crate::storage::layout::StorageLayout;
use crate::storage::settings::StageSettings;
use crate::storage::status::{DeployStatusRecord, StatusStore};

/// Advances one environment through the stages of its plan, persisting the
/// record before and after every stage
pub struct StageMachine {
    store: StatusStore,
    fetcher: Arc<ArtifactFetcher>,
    hooks: HookRunner,
    stager: Stager,
    layout: StorageLayout,
    settings: StageSettings,
}

impl StageMachine {
    pub fn new(
        store: StatusStore,
        fetcher: Arc<ArtifactFetcher>,
        runner: Arc<dyn ProcessRunner>,
        layout: StorageLayout,
        settings: StageSettings,
    ) -> Self {
        Self {
            hooks: HookRunner::new(runner.clone(), settings.clone(), layout.clone()),
            stager: Stager::new(runner, &settings),
            store,
            fetcher,
            layout,
            settings,
        }
    }

    pub fn store(&self) -> &StatusStore {
        &self.store
    }

    pub fn fetcher(&self) -> &ArtifactFetcher {
        &self.fetcher
    }

    pub fn layout(&self) -> &StorageLayout {
        &self.layout
    }

    pub fn plan(&self, record: &DeployStatusRecord) -> StagePlan {
        StagePlan::for_type(record.deploy_type, &self.settings.hotfix_skip_stages)
    }

    /// Run the record's plan from its resume point up to the goal's target
    /// stage. Stage failures end up in the returned record; only storage and
    /// invariant failures are returned as errors.
    pub async fn execute(
        &self,
        goal: &DeployGoal,
        op_code: OpCode,
        mut record: DeployStatusRecord,
        cancel: &CancelToken,
    ) -> Result<DeployStatusRecord, AgentError> {
        let plan = self.plan(&record);
        let target = plan.target_index(goal.deploy_stage).ok_or_else(|| {
            AgentError::InvariantError(format!("empty stage plan for {}", record.deploy_type))
        })?;

        let start = match resume_point(&plan, record.current_stage, record.status, target) {
            Resume::From(index) => index,
            Resume::Done => {
                debug!(
                    "{} already at {} {}, nothing to run",
                    record.env_name, record.current_stage, record.status
                );
                return Ok(record);
            }
            Resume::Halted => {
                info!(
                    "{} exhausted its retries for deploy {}, waiting for a new goal",
                    record.env_name, record.deploy_id
                );
                return Ok(record);
            }
        };
        let stages = plan.stages().get(start..=target).ok_or_else(|| {
            AgentError::InvariantError(format!(
                "resume index {} past target {} for {}",
                start, target, record.env_name
            ))
        })?;

        let build = record.build.clone();
        let ctx = StageContext::new(goal, op_code, record.deploy_type, build.as_ref(), &self.layout);
        info!(
            "Deploying {} to {} ({}, {} stages from {})",
            ctx.build_id().unwrap_or("no build"),
            record.env_name,
            record.deploy_type,
            stages.len(),
            stages[0]
        );

        for stage in stages {
            record.begin(*stage);
            self.store.save(&record).await?;

            let result = if cancel.is_cancelled() {
                Err(AgentError::Aborted(format!("{} cancelled before start", stage)))
            } else {
                self.run_stage(*stage, &ctx, cancel).await
            };

            match result {
                Ok(()) => {
                    record.succeed();
                    self.store.save(&record).await?;
                    info!("{} {} succeeded", record.env_name, stage);
                }
                Err(e) if e.is_fatal() => return Err(e),
                Err(e) => {
                    let status = record.fail(&e, self.settings.max_retry);
                    warn!(
                        "{} {} failed with {} (attempt {} of {}): {}",
                        record.env_name, stage, status, record.retry_count, self.settings.max_retry, e
                    );
                    self.store.save(&record).await?;
                    return Ok(record);
                }
            }
        }
        Ok(record)
    }

    async fn run_stage(&self, stage: Stage, ctx: &StageContext<'_>, cancel: &CancelToken) -> Result<(), AgentError> {
        match stage {
            Stage::Downloading => {
                let build = ctx.build.ok_or_else(|| {
                    AgentError::ConfigError(format!("no build to download for {}", ctx.env_name()))
                })?;
                let expected = ctx
                    .goal
                    .artifact_checksum
                    .as_deref()
                    .filter(|c| !c.trim().is_empty())
                    .map(str::parse::<Checksum>)
                    .transpose()?;
                self.fetcher
                    .fetch(ctx.env_name(), build, expected.as_ref(), cancel)
                    .await?;
                Ok(())
            }
            Stage::Staging => {
                let build_id = ctx.build_id().ok_or_else(|| {
                    AgentError::ConfigError(format!("no build to stage for {}", ctx.env_name()))
                })?;
                let build_dir = self.fetcher.build_dir(ctx.env_name(), build_id);
                self.stager.stage(build_dir.path(), &ctx.target, cancel).await?;
                let transformer = ScriptTransformer::load(&self.layout, ctx.env_name()).await?;
                transformer.transform(&ctx.target).await?;
                Ok(())
            }
            _ => self.hooks.run(stage, ctx, cancel).await,
        }
    }

    /// Run a stage's scripts outside any plan, as termination does for STOPPING
    pub async fn run_hooks(&self, stage: Stage, ctx: &StageContext<'_>, cancel: &CancelToken) -> Result<(), AgentError> {
        self.hooks.run(stage, ctx, cancel).await
    }
}
