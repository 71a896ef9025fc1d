//! Main application run loop

use std::future::Future;
use std::sync::Arc;

use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::{error, info};

use crate::app::options::{AppOptions, LifecycleOptions};
use crate::app::state::AppState;
use crate::client::rest::RestControlPlane;
use crate::client::serverless::ServerlessControlPlane;
use crate::client::ControlPlane;
use crate::errors::AgentError;
use crate::server::serve::serve;
use crate::server::state::ServerState;
use crate::workers::poller;

/// Run the deploy agent until shutdown, a fatal error, or the end of the single
/// cycle in once mode
pub async fn run(
    agent_version: String,
    options: AppOptions,
    shutdown_signal: impl Future<Output = ()> + Send + 'static,
) -> Result<(), AgentError> {
    info!("Initializing deployd {}...", agent_version);

    // Create shutdown channel
    let (shutdown_tx, _shutdown_rx): (broadcast::Sender<()>, _) = broadcast::channel(1);
    let mut shutdown_manager = ShutdownManager::new(shutdown_tx.clone(), options.lifecycle.clone());

    let app_state = match init_app_state(&agent_version, &options, &mut shutdown_manager).await {
        Ok(state) => state,
        Err(e) => {
            error!("Failed to start agent: {}", e);
            shutdown_manager.shutdown().await?;
            return Err(e);
        }
    };

    if options.lifecycle.once {
        let result = app_state.controller.run_cycle().await;
        drop(shutdown_tx);
        shutdown_manager.shutdown().await?;
        let outcome = result?;
        info!(
            "Single cycle finished ({}) after {} steps",
            outcome.end.as_str(),
            outcome.steps
        );
        return Ok(());
    }

    // Fatal errors from workers end the process
    let (fatal_tx, mut fatal_rx) = mpsc::channel::<AgentError>(1);
    if let Err(e) = init_workers(&options, app_state, fatal_tx, &shutdown_tx, &mut shutdown_manager).await {
        error!("Failed to start workers: {}", e);
        drop(shutdown_tx);
        shutdown_manager.shutdown().await?;
        return Err(e);
    }

    let fatal = tokio::select! {
        _ = shutdown_signal => {
            info!("Shutdown signal received, shutting down...");
            None
        }
        Some(e) = fatal_rx.recv() => {
            error!("Fatal error, shutting down: {}", e);
            Some(e)
        }
    };

    // Shutdown
    drop(shutdown_tx);
    shutdown_manager.shutdown().await?;
    match fatal {
        Some(e) => Err(e),
        None => Ok(()),
    }
}

// =============================== INITIALIZATION ================================== //

async fn init_app_state(
    agent_version: &str,
    options: &AppOptions,
    shutdown_manager: &mut ShutdownManager,
) -> Result<Arc<AppState>, AgentError> {
    let control_plane: Arc<dyn ControlPlane> = match &options.serverless {
        Some(deploy) => {
            info!(
                "Serverless mode: deploying {} to {}",
                deploy.build.build_id, deploy.env_name
            );
            Arc::new(ServerlessControlPlane::new(deploy.clone()))
        }
        None => Arc::new(RestControlPlane::new(&options.settings.control_plane)?),
    };

    let app_state = Arc::new(AppState::init(agent_version, &options.settings, control_plane).await?);
    shutdown_manager.with_app_state(app_state.clone())?;
    Ok(app_state)
}

async fn init_workers(
    options: &AppOptions,
    app_state: Arc<AppState>,
    fatal_tx: mpsc::Sender<AgentError>,
    shutdown_tx: &broadcast::Sender<()>,
    shutdown_manager: &mut ShutdownManager,
) -> Result<(), AgentError> {
    if options.server.enabled {
        init_status_server(options, app_state.clone(), shutdown_manager, shutdown_tx.subscribe()).await?;
    }

    init_poller_worker(
        options.poller.clone(),
        app_state,
        fatal_tx,
        shutdown_manager,
        shutdown_tx.subscribe(),
    )
    .await
}

async fn init_poller_worker(
    options: poller::Options,
    app_state: Arc<AppState>,
    fatal_tx: mpsc::Sender<AgentError>,
    shutdown_manager: &mut ShutdownManager,
    mut shutdown_rx: broadcast::Receiver<()>,
) -> Result<(), AgentError> {
    info!("Initializing poller worker...");

    let controller = app_state.controller.clone();

    let poller_handle = tokio::spawn(async move {
        let result = poller::run(
            &options,
            controller.as_ref(),
            tokio::time::sleep,
            Box::pin(async move {
                let _ = shutdown_rx.recv().await;
            }),
        )
        .await;
        if let Err(e) = result {
            let _ = fatal_tx.send(e).await;
        }
    });

    shutdown_manager.with_poller_worker_handle(poller_handle)?;
    Ok(())
}

async fn init_status_server(
    options: &AppOptions,
    app_state: Arc<AppState>,
    shutdown_manager: &mut ShutdownManager,
    mut shutdown_rx: broadcast::Receiver<()>,
) -> Result<(), AgentError> {
    info!("Initializing local status server...");

    let server_state = ServerState::new(
        app_state.store.clone(),
        app_state.controller.clone(),
        app_state.identity.clone(),
    );

    let server_handle = serve(&options.server, Arc::new(server_state), async move {
        let _ = shutdown_rx.recv().await;
    })
    .await?;

    shutdown_manager.with_status_server_handle(server_handle)?;
    Ok(())
}

// ================================= SHUTDOWN ===================================== //

struct ShutdownManager {
    shutdown_tx: broadcast::Sender<()>,
    lifecycle_options: LifecycleOptions,
    app_state: Option<Arc<AppState>>,
    status_server_handle: Option<JoinHandle<Result<(), AgentError>>>,
    poller_worker_handle: Option<JoinHandle<()>>,
}

impl ShutdownManager {
    pub fn new(shutdown_tx: broadcast::Sender<()>, lifecycle_options: LifecycleOptions) -> Self {
        Self {
            shutdown_tx,
            lifecycle_options,
            app_state: None,
            status_server_handle: None,
            poller_worker_handle: None,
        }
    }

    pub fn with_app_state(&mut self, state: Arc<AppState>) -> Result<(), AgentError> {
        if self.app_state.is_some() {
            return Err(AgentError::ShutdownError("app_state already set".to_string()));
        }
        self.app_state = Some(state);
        Ok(())
    }

    pub fn with_poller_worker_handle(&mut self, handle: JoinHandle<()>) -> Result<(), AgentError> {
        if self.poller_worker_handle.is_some() {
            return Err(AgentError::ShutdownError("poller_handle already set".to_string()));
        }
        self.poller_worker_handle = Some(handle);
        Ok(())
    }

    pub fn with_status_server_handle(
        &mut self,
        handle: JoinHandle<Result<(), AgentError>>,
    ) -> Result<(), AgentError> {
        if self.status_server_handle.is_some() {
            return Err(AgentError::ShutdownError("server_handle already set".to_string()));
        }
        self.status_server_handle = Some(handle);
        Ok(())
    }

    pub async fn shutdown(&mut self) -> Result<(), AgentError> {
        let _ = self.shutdown_tx.send(());

        match tokio::time::timeout(self.lifecycle_options.max_shutdown_delay, self.shutdown_impl()).await {
            Ok(result) => result,
            Err(_) => {
                error!(
                    "Shutdown timed out after {:?}, forcing shutdown...",
                    self.lifecycle_options.max_shutdown_delay
                );
                std::process::exit(1);
            }
        }
    }

    async fn shutdown_impl(&mut self) -> Result<(), AgentError> {
        info!("Shutting down deployd...");

        // 1. Poller worker
        if let Some(handle) = self.poller_worker_handle.take() {
            handle.await.map_err(|e| AgentError::ShutdownError(e.to_string()))?;
        }

        // 2. Status server
        if let Some(handle) = self.status_server_handle.take() {
            handle.await.map_err(|e| AgentError::ShutdownError(e.to_string()))??;
        }

        // 3. App state
        if let Some(app_state) = self.app_state.take() {
            app_state.shutdown().await?;
        }

        info!("Shutdown complete");
        Ok(())
    }
}
