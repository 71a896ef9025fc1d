//! Application state management

use std::sync::Arc;

use tracing::info;

use crate::client::ControlPlane;
use crate::deploy::executor::StageMachine;
use crate::download::artifact::ArtifactFetcher;
use crate::download::SchemeDownloaderFactory;
use crate::errors::AgentError;
use crate::process::runner::{ProcessRunner, SystemRunner};
use crate::reconcile::{Controller, ControllerOptions};
use crate::storage::layout::StorageLayout;
use crate::storage::settings::Settings;
use crate::storage::status::StatusStore;
use crate::telemetry::{metrics_sink, HostIdentity};

/// Main application state
pub struct AppState {
    /// Storage layout
    pub layout: StorageLayout,

    /// How this host reports itself
    pub identity: HostIdentity,

    /// Status records
    pub store: StatusStore,

    /// Reconciliation controller
    pub controller: Arc<Controller>,
}

impl AppState {
    /// Initialize application state
    pub async fn init(
        agent_version: &str,
        settings: &Settings,
        control_plane: Arc<dyn ControlPlane>,
    ) -> Result<Self, AgentError> {
        info!("Initializing application state...");

        let layout = StorageLayout::from(&settings.paths);
        layout.setup().await?;
        let store = StatusStore::new(layout.status_dir());

        let runner: Arc<dyn ProcessRunner> = Arc::new(SystemRunner::new(settings.stages.max_tail_bytes));
        let factory = SchemeDownloaderFactory::new(settings.download.clone(), runner.clone())?;
        let fetcher = Arc::new(ArtifactFetcher::new(
            Arc::new(factory),
            runner.clone(),
            layout.clone(),
            settings.download.clone(),
        ));
        let machine = StageMachine::new(
            store.clone(),
            fetcher,
            runner,
            layout.clone(),
            settings.stages.clone(),
        );

        let identity = HostIdentity::discover(&settings.host).await;
        let controller = Arc::new(Controller::new(
            control_plane,
            Arc::new(machine),
            identity.clone(),
            metrics_sink(settings.enable_metrics),
            ControllerOptions::new(settings, agent_version),
        ));

        Ok(Self {
            layout,
            identity,
            store,
            controller,
        })
    }

    /// Shutdown application state
    pub async fn shutdown(&self) -> Result<(), AgentError> {
        info!("Shutting down application state...");
        Ok(())
    }
}
