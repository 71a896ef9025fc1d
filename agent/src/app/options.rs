//! Application configuration options

use std::time::Duration;

use crate::client::serverless::ServerlessDeploy;
use crate::storage::settings::Settings;
use crate::workers::poller;

/// Main application options
#[derive(Debug, Clone)]
pub struct AppOptions {
    /// Parsed settings file
    pub settings: Settings,

    /// Lifecycle configuration
    pub lifecycle: LifecycleOptions,

    /// Drive this one deploy locally instead of asking the control plane
    pub serverless: Option<ServerlessDeploy>,

    /// Poller worker options
    pub poller: poller::Options,

    /// Server configuration
    pub server: ServerOptions,
}

impl AppOptions {
    pub fn new(settings: Settings) -> Self {
        Self {
            lifecycle: LifecycleOptions::default(),
            serverless: None,
            poller: poller::Options::from(&settings.reconcile),
            server: ServerOptions {
                enabled: settings.status_server.enabled,
                host: settings.status_server.host.clone(),
                port: settings.status_server.port,
            },
            settings,
        }
    }
}

impl Default for AppOptions {
    fn default() -> Self {
        Self::new(Settings::default())
    }
}

/// Lifecycle options for the agent
#[derive(Debug, Clone)]
pub struct LifecycleOptions {
    /// Run a single reconciliation cycle and exit
    pub once: bool,

    /// Maximum delay for graceful shutdown
    pub max_shutdown_delay: Duration,
}

impl Default for LifecycleOptions {
    fn default() -> Self {
        Self {
            once: false,
            max_shutdown_delay: Duration::from_secs(30),
        }
    }
}

/// Local HTTP server options
#[derive(Debug, Clone)]
pub struct ServerOptions {
    pub enabled: bool,

    /// Host to bind to
    pub host: String,

    /// Port to listen on
    pub port: u16,
}

impl Default for ServerOptions {
    fn default() -> Self {
        Self {
            enabled: false,
            host: "127.0.0.1".to_string(),
            port: 8090,
        }
    }
}
