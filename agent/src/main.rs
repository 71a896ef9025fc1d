//! deployd - Entry Point
//!
//! Host deploy agent. Polls the control plane for the goal of every
//! environment on this host and runs the deploy stages that get it there.

use std::collections::HashMap;
use std::env;
use std::path::PathBuf;

use deployd::app::options::AppOptions;
use deployd::app::run::run;
use deployd::client::serverless::ServerlessDeploy;
use deployd::diagnostic::run_diagnostic;
use deployd::errors::AgentError;
use deployd::filesys::file::File;
use deployd::logs::{init_logging, LogOptions};
use deployd::storage::settings::Settings;
use deployd::storage::status::validate_env_name;
use deployd::utils::version_info;
use ping_protocol::{Build, Stage};

use tracing::{error, info, warn};

const DEFAULT_SETTINGS_PATH: &str = "/etc/deployd/settings.json";

#[tokio::main]
async fn main() {
    // Parse command line arguments
    let mut cli_args: HashMap<String, String> = HashMap::new();

    for arg in env::args().skip(1) {
        if let Some((key, value)) = arg.split_once('=') {
            // Handle --key=value format
            let clean_key = key.trim_start_matches('-');
            cli_args.insert(clean_key.to_string(), value.to_string());
        } else if arg.starts_with("--") {
            // Handle standalone flags like --version
            let clean_key = arg.trim_start_matches('-');
            cli_args.insert(clean_key.to_string(), "true".to_string());
        }
    }

    // Print version and exit
    let version = version_info();
    if cli_args.contains_key("version") {
        match serde_json::to_string_pretty(&version) {
            Ok(json) => println!("{}", json),
            Err(_) => println!("{}", version.version),
        }
        return;
    }

    let config_path = cli_args
        .get("config")
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from(DEFAULT_SETTINGS_PATH));

    // Run diagnostics
    if cli_args.contains_key("diagnostic") || cli_args.contains_key("diag") {
        if !run_diagnostic(&config_path).await {
            std::process::exit(1);
        }
        return;
    }

    // Retrieve the settings file. Only the default location may be absent.
    let settings_file = File::new(&config_path);
    let settings = if !cli_args.contains_key("config") && !settings_file.exists().await {
        eprintln!("No settings at {}, using defaults", config_path.display());
        Settings::default()
    } else {
        match Settings::load(&settings_file).await {
            Ok(settings) => settings,
            Err(e) => {
                eprintln!("Unable to read settings file: {}", e);
                std::process::exit(1);
            }
        }
    };

    // Initialize logging
    let log_options = LogOptions {
        log_level: settings.log_level.clone(),
        log_dir: settings
            .log_to_file
            .then(|| PathBuf::from(&settings.paths.log_dir)),
        json_format: settings.log_json,
        ..Default::default()
    };
    let log_guard = match init_logging(log_options) {
        Ok(guard) => guard,
        Err(e) => {
            println!("Failed to initialize logging: {e}");
            None
        }
    };

    let mut options = AppOptions::new(settings);
    options.lifecycle.once = cli_args.contains_key("once");
    if cli_args.contains_key("serverless") {
        match serverless_deploy(&cli_args) {
            Ok(deploy) => {
                options.serverless = Some(deploy);
                options.lifecycle.once = true;
            }
            Err(e) => {
                error!("Invalid serverless arguments: {}", e);
                drop(log_guard);
                std::process::exit(1);
            }
        }
    }

    info!("Running deployd with options: {:?}", options);
    if let Err(e) = run(version.version, options, await_shutdown_signal()).await {
        error!("Failed to run the agent: {e}");
        drop(log_guard);
        std::process::exit(1);
    }
}

/// Deploy described by `--env-name`, `--stage-name`, `--build` (JSON),
/// `--script-variables` (JSON) and `--first-stage`
fn serverless_deploy(cli_args: &HashMap<String, String>) -> Result<ServerlessDeploy, AgentError> {
    let env_name = cli_args
        .get("env-name")
        .cloned()
        .ok_or_else(|| AgentError::ConfigError("--env-name is required".to_string()))?;
    validate_env_name(&env_name)?;

    let build: Build = match cli_args.get("build") {
        Some(raw) => serde_json::from_str(raw)?,
        None => return Err(AgentError::ConfigError("--build is required".to_string())),
    };

    let script_variables = match cli_args.get("script-variables") {
        Some(raw) => serde_json::from_str(raw)?,
        None => Default::default(),
    };

    let first_stage = match cli_args.get("first-stage") {
        Some(name) => Some(
            Stage::from_name(name)
                .ok_or_else(|| AgentError::ConfigError(format!("unknown stage '{}'", name)))?,
        ),
        None => None,
    };

    Ok(ServerlessDeploy {
        env_name,
        stage_name: cli_args
            .get("stage-name")
            .cloned()
            .unwrap_or_else(|| "default".to_string()),
        build,
        script_variables,
        first_stage,
    })
}

async fn await_shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        match (signal(SignalKind::terminate()), signal(SignalKind::interrupt())) {
            (Ok(mut sigterm), Ok(mut sigint)) => {
                tokio::select! {
                    _ = sigterm.recv() => {
                        info!("SIGTERM received, shutting down...");
                    }
                    _ = sigint.recv() => {
                        info!("SIGINT received, shutting down...");
                    }
                }
                return;
            }
            (Err(e), _) | (_, Err(e)) => {
                warn!("Unable to install signal handlers, falling back to Ctrl+C: {}", e);
            }
        }
    }

    match tokio::signal::ctrl_c().await {
        Ok(()) => info!("Ctrl+C received, shutting down..."),
        Err(e) => {
            error!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    }
}
