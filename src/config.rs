use std::path::{Path, PathBuf};
use std::time::Duration;

use log::LevelFilter;
use serde::Deserialize;
use thiserror::Error;

use crate::api::KingdomProfile;
use crate::error::ErrorKind;
use crate::scan::scanner::ScanConfig;
use crate::tasks::catalog::TaskArgs;
use crate::tasks::scheduler::JobSpec;
use crate::telemetry::logging;

pub const DEFAULT_TOKEN_FILE: &str = "data/token";
pub const DEFAULT_LOG_DIR: &str = "log";

const ENV_TOKEN_FILE: &str = "FIELDSCOUT_TOKEN_FILE";
const ENV_FIELD_URL: &str = "FIELDSCOUT_FIELD_URL";
const ENV_LOG: &str = "FIELDSCOUT_LOG";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("usage: fieldscout <config.yaml>")]
    Usage,
    #[error("read {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("parse {path}: {source}")]
    Parse {
        path: PathBuf,
        source: serde_yaml::Error,
    },
    #[error("invalid config: {0}")]
    Invalid(String),
    #[error("token file {0} is empty")]
    EmptyToken(PathBuf),
}

impl ConfigError {
    pub fn kind(&self) -> ErrorKind {
        ErrorKind::Unclassified
    }
}

#[derive(Debug, Deserialize)]
struct FileConfig {
    token_file: Option<PathBuf>,
    log_dir: Option<PathBuf>,
    profile: Option<KingdomProfile>,
    #[serde(default)]
    scan: ScanOverrides,
    #[serde(default)]
    main: MainSection,
}

/// Optional scan tuning; durations in seconds.
#[derive(Debug, Default, Deserialize)]
struct ScanOverrides {
    batch_size: Option<usize>,
    max_batches_per_pass: Option<usize>,
    max_radius: Option<u32>,
    early_stop_radius: Option<u32>,
    entered_timeout: Option<u64>,
    objects_timeout: Option<u64>,
    pacing_interval: Option<u64>,
    ca_file: Option<PathBuf>,
}

#[derive(Debug, Default, Deserialize)]
struct MainSection {
    #[serde(default)]
    jobs: Vec<JobEntry>,
    #[serde(default)]
    threads: Vec<ThreadEntry>,
}

#[derive(Debug, Deserialize)]
struct JobEntry {
    name: String,
    #[serde(default = "enabled_by_default")]
    enabled: bool,
    interval: IntervalEntry,
    #[serde(default)]
    kwargs: TaskArgs,
}

#[derive(Debug, Deserialize)]
struct IntervalEntry {
    start: u64,
    end: u64,
}

#[derive(Debug, Deserialize)]
struct ThreadEntry {
    name: String,
    #[serde(default = "enabled_by_default")]
    enabled: bool,
    #[serde(default)]
    kwargs: TaskArgs,
}

fn enabled_by_default() -> bool {
    true
}

/// A long-lived task started next to the scheduler.
#[derive(Debug, Clone, PartialEq)]
pub struct ThreadSpec {
    pub name: String,
    pub args: TaskArgs,
}

#[derive(Debug)]
pub struct AppConfig {
    pub config_path: PathBuf,
    pub token_file: PathBuf,
    pub log_dir: PathBuf,
    pub log_level: LevelFilter,
    pub profile: KingdomProfile,
    pub scan: ScanConfig,
    pub ca_file: Option<PathBuf>,
    /// Enabled jobs only.
    pub jobs: Vec<JobSpec>,
    /// Enabled threads only.
    pub threads: Vec<ThreadSpec>,
}

impl AppConfig {
    pub fn from_args(args: &[String]) -> Result<Self, ConfigError> {
        if args.len() < 2 {
            return Err(ConfigError::Usage);
        }
        Self::load(Path::new(&args[1]), &env_override)
    }

    pub fn load(path: &Path, env: &dyn Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::parse(&text, path, env)
    }

    fn parse(text: &str, path: &Path, env: &dyn Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let file: FileConfig = serde_yaml::from_str(text).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;

        let mut profile = file
            .profile
            .ok_or_else(|| ConfigError::Invalid("missing profile section".to_string()))?;
        if let Some(field_url) = env(ENV_FIELD_URL) {
            profile.field_url = field_url;
        }
        if profile.field_url.trim().is_empty() {
            return Err(ConfigError::Invalid("profile.field_url is empty".to_string()));
        }

        let token_file = env(ENV_TOKEN_FILE)
            .map(PathBuf::from)
            .or(file.token_file)
            .unwrap_or_else(|| PathBuf::from(DEFAULT_TOKEN_FILE));
        let log_dir = file.log_dir.unwrap_or_else(|| PathBuf::from(DEFAULT_LOG_DIR));
        let log_level = logging::parse_level(env(ENV_LOG).as_deref());

        let overrides = file.scan;
        let ca_file = overrides.ca_file.clone();
        let scan = scan_config(overrides);

        let mut jobs = Vec::new();
        for entry in file.main.jobs {
            if entry.name.trim().is_empty() {
                return Err(ConfigError::Invalid("job without a name".to_string()));
            }
            if !entry.enabled {
                log::debug!("job {} disabled", entry.name);
                continue;
            }
            jobs.push(JobSpec {
                name: entry.name,
                min_minutes: entry.interval.start,
                max_minutes: entry.interval.end,
                args: entry.kwargs,
            });
        }
        let mut threads = Vec::new();
        for entry in file.main.threads {
            if entry.name.trim().is_empty() {
                return Err(ConfigError::Invalid("thread without a name".to_string()));
            }
            if entry.enabled {
                threads.push(ThreadSpec {
                    name: entry.name,
                    args: entry.kwargs,
                });
            }
        }

        Ok(Self {
            config_path: path.to_path_buf(),
            token_file,
            log_dir,
            log_level,
            profile,
            scan,
            ca_file,
            jobs,
            threads,
        })
    }
}

fn scan_config(overrides: ScanOverrides) -> ScanConfig {
    let mut scan = ScanConfig::default();
    if let Some(batch_size) = overrides.batch_size {
        scan.batch_size = batch_size.max(1);
    }
    if let Some(max_batches) = overrides.max_batches_per_pass {
        scan.max_batches_per_pass = max_batches.max(1);
    }
    if let Some(max_radius) = overrides.max_radius {
        scan.max_radius = max_radius;
    }
    if let Some(early_stop_radius) = overrides.early_stop_radius {
        scan.early_stop_radius = early_stop_radius;
    }
    if let Some(secs) = overrides.entered_timeout {
        scan.entered_timeout = Duration::from_secs(secs);
    }
    if let Some(secs) = overrides.objects_timeout {
        scan.objects_timeout = Duration::from_secs(secs);
    }
    if let Some(secs) = overrides.pacing_interval {
        scan.pacing_interval = Duration::from_secs(secs);
    }
    scan
}

fn env_override(name: &str) -> Option<String> {
    std::env::var(name).ok().and_then(|value| {
        let trimmed = value.trim();
        if trimmed.is_empty() {
            None
        } else {
            Some(trimmed.to_string())
        }
    })
}

/// Reads the persisted session token; surrounding whitespace is ignored.
pub fn read_token(path: &Path) -> Result<String, ConfigError> {
    let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    let token = text.trim();
    if token.is_empty() {
        return Err(ConfigError::EmptyToken(path.to_path_buf()));
    }
    Ok(token.to_string())
}
