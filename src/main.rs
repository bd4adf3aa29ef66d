use std::env::consts::{ARCH, FAMILY, OS};
use std::path::PathBuf;

use anyhow::{Context, Result};
use tracing::{info, trace, warn};

use media_pipeline::Pipeline;
use media_pipeline::config::{EnvConfig, init_config};
use media_pipeline::logger::{init_logger, log_system_event};

const DEFAULT_CONFIG_DIR: &str = "./config";

#[tokio::main]
async fn main() -> Result<()> {
    let env = EnvConfig::from_env().context("Invalid environment configuration")?;

    let config_dir = std::env::var("CONFIG_DIR")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from(DEFAULT_CONFIG_DIR));
    let config_manager = init_config(&config_dir)
        .await
        .with_context(|| format!("Failed to load configuration from {}", config_dir.display()))?;
    let app_config = config_manager.get_app_config();

    // Dropping the guard flushes the log file.
    let _log_guard = init_logger(&app_config.logging, app_config.paths.log_directory.as_ref())
        .context("Failed to initialize logging")?;
    log_system_information();
    info!(mode = ?env.server.mode, "Starting media pipeline");
    log_system_event("startup", &format!("database {}", env.database.path.display()));

    let pipeline = Pipeline::start(&env, &app_config)
        .await
        .context("Failed to start pipeline")?;

    let mut reloads = config_manager.subscribe();
    loop {
        tokio::select! {
            signal = tokio::signal::ctrl_c() => {
                if let Err(e) = signal {
                    warn!("Failed to listen for shutdown signal: {}", e);
                }
                break;
            }
            reload = reloads.recv() => {
                if reload.is_ok() {
                    log_system_event("config_reload", "engine settings apply after a restart");
                }
            }
        }
    }

    log_system_event("shutdown", "signal received");
    pipeline.shutdown().await;
    Ok(())
}

/// Logs information about the host for debugging.
fn log_system_information() {
    trace!("ARCH:   \"{}\"", ARCH);
    trace!("FAMILY: \"{}\"", FAMILY);
    trace!("OS:     \"{}\"", OS);
}
