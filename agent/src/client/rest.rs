//! Control plane over HTTP

use async_trait::async_trait;
use ping_protocol::{PingRequest, PingResponse};
use tracing::warn;

use crate::client::ControlPlane;
use crate::errors::AgentError;
use crate::http::client::HttpClient;
use crate::storage::settings::ControlPlaneSettings;
use crate::utils::{calc_exp_backoff, CooldownOptions};

pub const PING_PATH: &str = "/system/ping";

/// Posts ping requests, retrying transport failures a bounded number of times
pub struct RestControlPlane {
    http: HttpClient,
    max_tries: u32,
    cooldown: CooldownOptions,
}

impl RestControlPlane {
    pub fn new(settings: &ControlPlaneSettings) -> Result<Self, AgentError> {
        let base_delay = std::time::Duration::from_secs(settings.retry_delay_secs);
        Ok(Self {
            http: HttpClient::new(settings)?,
            max_tries: settings.max_tries.max(1),
            cooldown: CooldownOptions::doubling(base_delay, base_delay * 16),
        })
    }

    pub fn with_cooldown(mut self, cooldown: CooldownOptions) -> Self {
        self.cooldown = cooldown;
        self
    }
}

#[async_trait]
impl ControlPlane for RestControlPlane {
    async fn send_reports(&self, request: &PingRequest) -> Result<PingResponse, AgentError> {
        let mut attempt = 0;
        loop {
            match self.http.post::<PingResponse, _>(PING_PATH, request).await {
                Ok(response) => return Ok(response),
                Err(e) if attempt + 1 >= self.max_tries => {
                    return Err(AgentError::TransportError(format!(
                        "ping failed after {} attempts: {}",
                        self.max_tries, e
                    )));
                }
                Err(e) => {
                    let delay = calc_exp_backoff(&self.cooldown, attempt);
                    attempt += 1;
                    warn!(
                        "Ping attempt {} of {} failed, retrying in {:?}: {}",
                        attempt, self.max_tries, delay, e
                    );
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }
}
