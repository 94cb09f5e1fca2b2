use std::collections::BTreeMap;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, OnceLock};

use log::{Level, LevelFilter, Log, Metadata, Record};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum LogError {
    #[error("log directory {path} could not be created: {source}")]
    CreateDir {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("open log {path} failed: {source}")]
    Open {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("another logger is already installed")]
    AlreadyInstalled,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Ord, PartialOrd)]
enum LogFile {
    Error,
    General,
    Scan,
    Scheduler,
    Session,
}

const LOG_FILES: [(LogFile, &str); 5] = [
    (LogFile::Error, "error.log"),
    (LogFile::General, "fieldscout.log"),
    (LogFile::Scan, "scan.log"),
    (LogFile::Scheduler, "scheduler.log"),
    (LogFile::Session, "session.log"),
];

const HEADER_LINE: &str = "-------------------------------------------------------------------------------";

const WEEKDAYS: [&str; 7] = ["Thu", "Fri", "Sat", "Sun", "Mon", "Tue", "Wed"];
const MONTHS: [&str; 12] = [
    "Jan", "Feb", "Mar", "Apr", "May", "Jun", "Jul", "Aug", "Sep", "Oct", "Nov", "Dec",
];

/// `log` backend writing one append-only file per concern.
pub struct FileLogger {
    level: LevelFilter,
    echo_stderr: bool,
    files: Mutex<BTreeMap<LogFile, File>>,
}

static LOGGER: OnceLock<FileLogger> = OnceLock::new();

/// Installs the file logger as the process-wide `log` backend. Later calls
/// are no-ops.
pub fn init(dir: &Path, level: LevelFilter) -> Result<(), LogError> {
    if LOGGER.get().is_some() {
        return Ok(());
    }
    let logger = FileLogger::open(dir, level, true)?;
    let logger = LOGGER.get_or_init(|| logger);
    log::set_logger(logger).map_err(|_| LogError::AlreadyInstalled)?;
    log::set_max_level(level);
    Ok(())
}

/// Level from a `FIELDSCOUT_LOG`-style value; unknown values fall back to info.
pub fn parse_level(value: Option<&str>) -> LevelFilter {
    value
        .and_then(|value| value.trim().parse().ok())
        .unwrap_or(LevelFilter::Info)
}

impl FileLogger {
    pub fn open(dir: &Path, level: LevelFilter, echo_stderr: bool) -> Result<Self, LogError> {
        std::fs::create_dir_all(dir).map_err(|source| LogError::CreateDir {
            path: dir.to_path_buf(),
            source,
        })?;
        let mut files = BTreeMap::new();
        for (log_file, name) in LOG_FILES {
            let path = dir.join(name);
            let mut file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(&path)
                .map_err(|source| LogError::Open {
                    path: path.clone(),
                    source,
                })?;
            if file.metadata().map(|m| m.len()).unwrap_or(0) == 0 {
                let _ = write_header(&mut file, name);
            }
            files.insert(log_file, file);
        }
        Ok(Self {
            level,
            echo_stderr,
            files: Mutex::new(files),
        })
    }

    fn write_line(&self, log_file: LogFile, line: &str) -> std::io::Result<()> {
        let mut files = self
            .files
            .lock()
            .map_err(|_| std::io::Error::new(std::io::ErrorKind::Other, "log lock poisoned"))?;
        if let Some(file) = files.get_mut(&log_file) {
            file.write_all(line.as_bytes())?;
        }
        Ok(())
    }
}

impl Log for FileLogger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= self.level
    }

    fn log(&self, record: &Record) {
        if !self.enabled(record.metadata()) {
            return;
        }
        let timestamp = format_timestamp(unix_timestamp());
        let line = format!(
            "{timestamp} [{}] {}: {}\n",
            record.level(),
            record.target(),
            record.args()
        );
        let log_file = route(record.target());
        let _ = self.write_line(log_file, &line);
        if record.level() <= Level::Warn {
            if log_file != LogFile::Error {
                let _ = self.write_line(LogFile::Error, &line);
            }
            if self.echo_stderr {
                eprint!("{line}");
            }
        }
    }

    fn flush(&self) {
        if let Ok(mut files) = self.files.lock() {
            for file in files.values_mut() {
                let _ = file.flush();
            }
        }
    }
}

fn route(target: &str) -> LogFile {
    if target.contains("::scan") {
        LogFile::Scan
    } else if target.contains("::tasks") {
        LogFile::Scheduler
    } else if target.contains("::net") {
        LogFile::Session
    } else {
        LogFile::General
    }
}

fn write_header(file: &mut File, name: &str) -> std::io::Result<()> {
    let timestamp = format_header_timestamp(unix_timestamp());
    writeln!(file, "{HEADER_LINE}")?;
    writeln!(file, "fieldscout - {name} - started {timestamp}")?;
    writeln!(file, "{HEADER_LINE}")
}

fn format_header_timestamp(ts: i64) -> String {
    let datetime = breakdown_timestamp(ts);
    let weekday = WEEKDAYS[(datetime.weekday as usize).min(6)];
    let month = MONTHS[(datetime.month as usize).saturating_sub(1).min(11)];
    format!(
        "{weekday} {month} {:>2} {:02}:{:02}:{:02} {}",
        datetime.day, datetime.hour, datetime.minute, datetime.second, datetime.year
    )
}

fn format_timestamp(ts: i64) -> String {
    let datetime = breakdown_timestamp(ts);
    format!(
        "{:02}.{:02}.{} {:02}:{:02}:{:02}",
        datetime.day, datetime.month, datetime.year, datetime.hour, datetime.minute, datetime.second
    )
}

fn unix_timestamp() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

struct DateTimeParts {
    year: i32,
    month: u32,
    day: u32,
    hour: u32,
    minute: u32,
    second: u32,
    weekday: u32,
}

fn breakdown_timestamp(ts: i64) -> DateTimeParts {
    let secs = ts.max(0);
    let days = secs / 86_400;
    let seconds_of_day = (secs % 86_400) as u32;
    let (year, month, day) = civil_from_days(days);
    DateTimeParts {
        year,
        month,
        day,
        hour: seconds_of_day / 3_600,
        minute: (seconds_of_day % 3_600) / 60,
        second: seconds_of_day % 60,
        weekday: (days % 7) as u32,
    }
}

// Howard Hinnant's days-to-civil conversion.
fn civil_from_days(days: i64) -> (i32, u32, u32) {
    let z = days + 719_468;
    let era = if z >= 0 { z } else { z - 146_096 } / 146_097;
    let doe = z - era * 146_097;
    let yoe = (doe - doe / 1_460 + doe / 36_524 - doe / 146_096) / 365;
    let y = yoe + era * 400;
    let doy = doe - (365 * yoe + yoe / 4 - yoe / 100);
    let mp = (5 * doy + 2) / 153;
    let d = doy - (153 * mp + 2) / 5 + 1;
    let m = if mp < 10 { mp + 3 } else { mp - 9 };
    let year = (y + if m <= 2 { 1 } else { 0 }) as i32;
    (year, m as u32, d as u32)
}
