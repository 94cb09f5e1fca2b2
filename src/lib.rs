pub mod api;
pub mod config;
pub mod error;
pub mod net;
pub mod scan;
pub mod tasks;
pub mod telemetry;
pub mod world;

use std::sync::Arc;

use thiserror::Error;

pub use config::{AppConfig, ConfigError};
pub use error::{classify_response, ErrorKind, FatalKind, RetryableKind, TaskError};
pub use scan::scanner::{ScanConfig, ScanError, ScanReport, ScanTarget, ZoneScanner};
pub use tasks::scheduler::{JobSpec, Scheduler, SchedulerError};
pub use tasks::shutdown::Shutdown;

use api::SharedRequestClock;
use net::ws::{Connector, WsConfig, WsConnector};
use tasks::builtin::{self, ScanEnvironment};
use telemetry::logging::LogError;

#[derive(Debug, Error)]
pub enum AppError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Log(#[from] LogError),
    #[error(transparent)]
    Scheduler(#[from] SchedulerError),
}

/// WebSocket connector honouring the configured CA bundle.
pub fn connector_for(config: &AppConfig) -> Arc<dyn Connector> {
    Arc::new(WsConnector::new(WsConfig {
        ca_file: config.ca_file.clone(),
        ..WsConfig::default()
    }))
}

pub fn scan_environment(config: &AppConfig) -> ScanEnvironment {
    ScanEnvironment {
        connector: connector_for(config),
        clock: Arc::new(SharedRequestClock::new()),
        profile: config.profile.clone(),
        token_file: config.token_file.clone(),
        scan: config.scan.clone(),
    }
}

pub fn run(args: &[String]) -> Result<(), AppError> {
    let config = AppConfig::from_args(args)?;
    telemetry::logging::init(&config.log_dir, config.log_level)?;

    let catalog = builtin::catalog(Arc::new(scan_environment(&config)));
    if let Some(thread) = config.threads.iter().find(|thread| !catalog.contains(&thread.name)) {
        return Err(SchedulerError::UnknownTask(thread.name.clone()).into());
    }
    let mut scheduler = Scheduler::new(catalog, Shutdown::new());
    for job in &config.jobs {
        scheduler.schedule_job(job.clone())?;
    }

    println!("fieldscout: {}", config.config_path.display());
    println!(
        "- profile: world {} at ({}, {})",
        config.profile.world_id, config.profile.x, config.profile.y
    );
    println!("- field: {}", config.profile.field_url);
    println!("- jobs: {}", scheduler.job_names().join(", "));
    println!(
        "- threads: {}",
        config
            .threads
            .iter()
            .map(|thread| thread.name.as_str())
            .collect::<Vec<_>>()
            .join(", ")
    );
    println!("- logs: {}", config.log_dir.display());

    for thread in &config.threads {
        scheduler.spawn_infrastructure(&thread.name, thread.args.clone())?;
    }
    log::info!(
        "starting with {} job(s) and {} thread(s)",
        config.jobs.len(),
        config.threads.len()
    );
    scheduler.run_all();
    scheduler.run()?;
    log::info!("stopped");
    Ok(())
}
