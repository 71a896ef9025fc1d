//! Control plane stand-in for hosts without one
//!
//! Walks a single environment through one deploy, handing out the next stage
//! each time the previous one succeeded.

use std::collections::BTreeMap;
use std::sync::Mutex;

use async_trait::async_trait;
use ping_protocol::{Build, DeployGoal, OpCode, PingReport, PingRequest, PingResponse, Stage, Status};
use tracing::info;

use crate::client::ControlPlane;
use crate::deploy::fsm::DEPLOY_PIPELINE;
use crate::errors::AgentError;
use crate::utils::generate_uuid;

/// Parameters of the one deploy to drive
#[derive(Debug, Clone)]
pub struct ServerlessDeploy {
    pub env_name: String,
    pub stage_name: String,
    pub build: Build,
    pub script_variables: BTreeMap<String, String>,
    /// Stage to start from, PRE_DOWNLOAD unless given
    pub first_stage: Option<Stage>,
}

pub struct ServerlessControlPlane {
    deploy: ServerlessDeploy,
    deploy_id: String,
    env_id: Mutex<Option<String>>,
}

impl ServerlessControlPlane {
    pub fn new(deploy: ServerlessDeploy) -> Self {
        Self {
            deploy,
            deploy_id: generate_uuid(),
            env_id: Mutex::new(None),
        }
    }

    pub fn deploy_id(&self) -> &str {
        &self.deploy_id
    }

    fn next_response(&self, report: Option<&PingReport>) -> PingResponse {
        let first = self.deploy.first_stage.unwrap_or(Stage::PreDownload);
        let Some(report) = report.filter(|r| r.deploy_id.as_deref() == Some(self.deploy_id.as_str())) else {
            return self.goal_for(first);
        };
        if report.error_code != 0 {
            info!("Deploy of {} failed at {}, stopping", self.deploy.env_name, report.deploy_stage);
            return PingResponse::noop();
        }
        match report.status {
            Status::Succeeded => {
                let next = DEPLOY_PIPELINE
                    .iter()
                    .position(|s| *s == report.deploy_stage)
                    .and_then(|i| DEPLOY_PIPELINE.get(i + 1));
                match next {
                    Some(stage) => self.goal_for(*stage),
                    None => {
                        info!("{} is serving {}", self.deploy.env_name, self.deploy.build.build_id);
                        PingResponse::noop()
                    }
                }
            }
            Status::Unknown => self.goal_for(report.deploy_stage),
            _ => PingResponse::noop(),
        }
    }

    fn goal_for(&self, stage: Stage) -> PingResponse {
        let env_id = self
            .env_id
            .lock()
            .map(|mut id| id.get_or_insert_with(generate_uuid).clone())
            .unwrap_or_else(|_| generate_uuid());
        let script_variables = if stage == Stage::PreDownload {
            self.deploy.script_variables.clone()
        } else {
            BTreeMap::new()
        };
        let goal = DeployGoal {
            deploy_id: self.deploy_id.clone(),
            env_id: Some(env_id),
            env_name: self.deploy.env_name.clone(),
            stage_name: Some(self.deploy.stage_name.clone()),
            deploy_stage: Some(stage),
            build: Some(self.deploy.build.clone()),
            script_variables,
            ..Default::default()
        };
        PingResponse::with_goal(OpCode::Deploy, goal)
    }
}

#[async_trait]
impl ControlPlane for ServerlessControlPlane {
    async fn send_reports(&self, request: &PingRequest) -> Result<PingResponse, AgentError> {
        let report = request
            .reports
            .iter()
            .find(|r| r.env_name == self.deploy.env_name);
        if let (Some(report), Ok(mut env_id)) = (report, self.env_id.lock()) {
            if report.env_id.is_some() && env_id.is_none() {
                *env_id = report.env_id.clone();
            }
        }
        Ok(self.next_response(report))
    }
}
