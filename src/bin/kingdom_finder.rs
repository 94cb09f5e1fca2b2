use std::sync::Arc;

use fieldscout::api::SharedRequestClock;
use fieldscout::config::{read_token, AppConfig};
use fieldscout::world::filter::{name_contains, render_matches};
use fieldscout::{connector_for, telemetry, ScanTarget, Shutdown, ZoneScanner};

const USAGE: &str = "usage: kingdom_finder <config.yaml> <query> [--json]";

fn run(args: &[String]) -> Result<(), String> {
    if args.len() < 3 {
        return Err(USAGE.to_string());
    }
    let query = args[2].trim();
    if query.is_empty() {
        return Err(USAGE.to_string());
    }
    let json = args[3..].iter().any(|arg| arg == "--json");

    let config = AppConfig::from_args(&args[..2]).map_err(|err| err.to_string())?;
    telemetry::logging::init(&config.log_dir, config.log_level).map_err(|err| err.to_string())?;
    let token = read_token(&config.token_file).map_err(|err| err.to_string())?;

    let scanner = ZoneScanner::new(
        connector_for(&config),
        Arc::new(SharedRequestClock::new()),
        Shutdown::new(),
    )
    .with_config(config.scan.clone());
    let target = ScanTarget {
        origin: config.profile.location(),
        field_url: config.profile.field_url.clone(),
        token,
    };
    let predicate = name_contains(query);
    let report = scanner
        .scan(&target, &predicate)
        .map_err(|err| format!("scan failed ({}): {err}", err.kind()))?;

    if json {
        let text = serde_json::to_string_pretty(&report).map_err(|err| err.to_string())?;
        println!("{text}");
    } else {
        println!("{}", render_matches(query, &report.matches));
        println!(
            "passes: {}, distance reached: {}, zones visited: {}, batches skipped: {}",
            report.radii_scanned, report.frontier_radius, report.zones_visited, report.batches_skipped
        );
    }
    Ok(())
}

fn main() {
    let args: Vec<String> = std::env::args().collect();
    if let Err(err) = run(&args) {
        eprintln!("kingdom_finder: {}", err);
        std::process::exit(1);
    }
}
