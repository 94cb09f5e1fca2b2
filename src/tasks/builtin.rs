//! Tasks the binary registers by name.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use crossbeam_channel::select;

use crate::api::{KingdomProfile, RequestClock};
use crate::config::read_token;
use crate::error::TaskError;
use crate::net::ws::Connector;
use crate::scan::scanner::{ScanConfig, ScanError, ScanTarget, ZoneScanner};
use crate::tasks::catalog::{arg_str, arg_u64, TaskArgs, TaskCatalog, TaskContext};
use crate::world::filter::{name_contains, render_matches};

pub const TASK_SCAN_KINGDOMS: &str = "scan_kingdoms";
pub const TASK_WATCH_FIELD: &str = "watch_field";

const DEFAULT_WATCH_INTERVAL_SECS: u64 = 300;

/// Everything a field task needs besides its kwargs.
pub struct ScanEnvironment {
    pub connector: Arc<dyn Connector>,
    pub clock: Arc<dyn RequestClock>,
    pub profile: KingdomProfile,
    pub token_file: PathBuf,
    pub scan: ScanConfig,
}

impl ScanEnvironment {
    fn scanner(&self, context: &TaskContext, config: ScanConfig) -> ZoneScanner {
        ZoneScanner::new(
            Arc::clone(&self.connector),
            Arc::clone(&self.clock),
            context.shutdown.clone(),
        )
        .with_config(config)
    }

    fn target(&self) -> Result<ScanTarget, TaskError> {
        Ok(ScanTarget {
            origin: self.profile.location(),
            field_url: self.profile.field_url.clone(),
            token: read_token(&self.token_file)?,
        })
    }
}

pub fn catalog(env: Arc<ScanEnvironment>) -> TaskCatalog {
    let mut catalog = TaskCatalog::new();
    let scan_env = Arc::clone(&env);
    catalog.register(TASK_SCAN_KINGDOMS, move |context, args| {
        scan_kingdoms(&scan_env, context, args)
    });
    catalog.register(TASK_WATCH_FIELD, move |context, args| {
        watch_field(&env, context, args)
    });
    catalog
}

/// kwargs: `query` (required), `max_radius`.
pub fn scan_kingdoms(env: &ScanEnvironment, context: &TaskContext, args: &TaskArgs) -> Result<(), TaskError> {
    let query = arg_str(args, "query")
        .map(str::trim)
        .filter(|query| !query.is_empty())
        .ok_or_else(|| TaskError::Failed(format!("{TASK_SCAN_KINGDOMS} needs a query")))?;
    let mut config = env.scan.clone();
    if let Some(max_radius) = arg_u64(args, "max_radius") {
        config.max_radius = u32::try_from(max_radius).unwrap_or(u32::MAX);
    }

    let target = env.target()?;
    let predicate = name_contains(query);
    let report = match env.scanner(context, config).scan(&target, &predicate) {
        Ok(report) => report,
        Err(ScanError::Cancelled) => {
            log::info!("{}: scan for {query:?} cancelled", context.name);
            return Ok(());
        }
        Err(err) => return Err(err.into()),
    };
    log::info!(target: "fieldscout::scan", "{}", render_matches(query, &report.matches));
    log::info!(
        "{}: {} match(es), {} passes to distance {}, {} zones, {} batch(es) skipped",
        context.name,
        report.matches.len(),
        report.radii_scanned,
        report.frontier_radius,
        report.zones_visited,
        report.batches_skipped
    );
    Ok(())
}

/// Infrastructure loop keeping a field session around home; kwargs:
/// `interval_secs` between re-entries.
pub fn watch_field(env: &ScanEnvironment, context: &TaskContext, args: &TaskArgs) -> Result<(), TaskError> {
    let interval = Duration::from_secs(
        arg_u64(args, "interval_secs")
            .unwrap_or(DEFAULT_WATCH_INTERVAL_SECS)
            .max(1),
    );
    let scanner = env.scanner(context, env.scan.clone());
    let watch = context.shutdown.watch();
    while context.shutdown.is_running() {
        let cycle = env
            .target()
            .and_then(|target| scanner.watch(&target, interval).map_err(TaskError::from));
        match cycle {
            Ok(kingdoms) => log::debug!("{}: cycle done, {kingdoms} kingdom(s) nearby", context.name),
            Err(TaskError::Scan(ScanError::Cancelled)) => break,
            Err(err) if err.kind().is_fatal() => return Err(err),
            Err(err) => {
                log::warn!("{}: {err}; retrying in {}s", context.name, interval.as_secs());
                select! {
                    recv(watch) -> _ => break,
                    default(interval) => {}
                }
            }
        }
    }
    Ok(())
}
