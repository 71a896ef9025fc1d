//! Stage pipelines per deploy type and resume decisions

use ping_protocol::{DeployType, Stage, Status};

/// Full forward pipeline
pub const DEPLOY_PIPELINE: &[Stage] = &[
    Stage::PreDownload,
    Stage::Downloading,
    Stage::PostDownload,
    Stage::Staging,
    Stage::PreRestart,
    Stage::Restarting,
    Stage::PostRestart,
    Stage::ServingBuild,
];

const RESTART_PIPELINE: &[Stage] = &[
    Stage::PreRestart,
    Stage::Restarting,
    Stage::PostRestart,
    Stage::ServingBuild,
];

const STOP_PIPELINE: &[Stage] = &[Stage::Stopping, Stage::Stopped];

/// Ordered stages a deploy type runs
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StagePlan {
    stages: Vec<Stage>,
}

impl StagePlan {
    /// Build the plan for a deploy type. `hotfix_skip` only applies to hotfixes.
    pub fn for_type(deploy_type: DeployType, hotfix_skip: &[Stage]) -> Self {
        let stages = match deploy_type {
            DeployType::Regular | DeployType::Rollback => DEPLOY_PIPELINE.to_vec(),
            DeployType::Hotfix => DEPLOY_PIPELINE
                .iter()
                .copied()
                .filter(|stage| !hotfix_skip.contains(stage))
                .collect(),
            DeployType::Restart => RESTART_PIPELINE.to_vec(),
            DeployType::Stop => STOP_PIPELINE.to_vec(),
        };
        Self { stages }
    }

    pub fn stages(&self) -> &[Stage] {
        &self.stages
    }

    pub fn terminal(&self) -> Option<Stage> {
        self.stages.last().copied()
    }

    /// Index of the last stage to run for a goal's target stage. Targets past
    /// the plan clamp to its terminal stage; a missing target, or one that
    /// precedes the whole plan, means the full plan.
    pub fn target_index(&self, target: Option<Stage>) -> Option<usize> {
        let last = self.stages.len().checked_sub(1)?;
        let Some(target) = target.filter(|t| *t != Stage::Unknown) else {
            return Some(last);
        };
        Some(
            self.stages
                .iter()
                .rposition(|stage| stage.code() <= target.code())
                .unwrap_or(last),
        )
    }
}

/// Where a deploy picks up, given what its record says
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resume {
    /// Run plan stages starting at this index
    From(usize),
    /// The target stage already succeeded
    Done,
    /// Retries are exhausted; nothing runs until a new goal arrives
    Halted,
}

/// Decide the first stage to run. A stage that succeeded is never run again;
/// a stage that was in flight or failed is retried.
pub fn resume_point(plan: &StagePlan, current: Stage, status: Status, target: usize) -> Resume {
    if status == Status::TooManyRetry {
        return Resume::Halted;
    }
    if current == Stage::Unknown {
        return Resume::From(0);
    }

    let succeeded = status == Status::Succeeded;
    let next = plan.stages().iter().position(|stage| {
        if succeeded {
            stage.code() > current.code()
        } else {
            stage.code() >= current.code()
        }
    });

    // A record at or past the target never moves backwards, rollbacks
    // included. A rollback starts over through a fresh record instead.
    match next {
        Some(index) if index <= target => Resume::From(index),
        _ => Resume::Done,
    }
}
