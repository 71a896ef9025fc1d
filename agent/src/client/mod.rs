//! Control plane clients

pub mod rest;
pub mod serverless;

use async_trait::async_trait;
use ping_protocol::{PingRequest, PingResponse};

use crate::errors::AgentError;

/// Exchanges status reports for the control plane's next instruction
#[async_trait]
pub trait ControlPlane: Send + Sync {
    async fn send_reports(&self, request: &PingRequest) -> Result<PingResponse, AgentError>;
}
