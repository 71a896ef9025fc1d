//! HTTP client implementation

use std::time::Duration;

use reqwest::{header, Client};
use secrecy::{ExposeSecret, SecretString};
use serde::{de::DeserializeOwned, Serialize};
use tracing::{debug, error};

use crate::errors::AgentError;
use crate::storage::settings::ControlPlaneSettings;
use crate::utils::version_info;

/// HTTP client for the control plane
pub struct HttpClient {
    client: Client,
    base_url: String,
    api_version: String,
    token: Option<SecretString>,
}

impl HttpClient {
    /// Create a new HTTP client
    pub fn new(settings: &ControlPlaneSettings) -> Result<Self, AgentError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(settings.request_timeout_secs))
            .user_agent(version_info().user_agent())
            .build()?;

        Ok(Self {
            client,
            base_url: settings.base_url.trim_end_matches('/').to_string(),
            api_version: settings.api_version.trim_matches('/').to_string(),
            token: settings.token.clone(),
        })
    }

    /// Full URL of an API path
    pub fn url(&self, path: &str) -> String {
        format!("{}/{}{}", self.base_url, self.api_version, path)
    }

    /// Make a POST request
    pub async fn post<T: DeserializeOwned, B: Serialize>(&self, path: &str, body: &B) -> Result<T, AgentError> {
        let url = self.url(path);
        debug!("POST {}", url);

        let mut request = self.client.post(&url).json(body);
        if let Some(token) = &self.token {
            request = request.header(header::AUTHORIZATION, format!("token {}", token.expose_secret()));
        }

        let response = request
            .send()
            .await
            .map_err(|e| AgentError::TransportError(format!("POST {}: {}", url, e)))?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            error!("HTTP POST failed: {} - {}", status, body);
            return Err(AgentError::TransportError(format!("{}: {}", status, body)));
        }

        response
            .json()
            .await
            .map_err(|e| AgentError::TransportError(format!("decoding response from {}: {}", url, e)))
    }
}
