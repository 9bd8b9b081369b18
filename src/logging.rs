use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::Path;
use std::sync::{Mutex, OnceLock};

use chrono::Local;
use log::{LevelFilter, Metadata, Record, SetLoggerError};
use serde::Serialize;

static LOGGER: OnceLock<FleetLogger> = OnceLock::new();

/// One line of the log file
#[derive(Debug, Serialize, Clone)]
pub struct LogMessage {
    level: String,
    target: String,
    message: String,
    timestamp: String,
}

impl LogMessage {
    fn from_record(record: &Record) -> Self {
        Self {
            level: record.level().to_string(),
            target: record.target().to_string(),
            message: record.args().to_string(),
            timestamp: Local::now().to_rfc3339(),
        }
    }
}

pub struct FleetLogger {
    level: LevelFilter,
    file: Option<Mutex<File>>,
}

/// Maps a config level name to a filter, defaulting to info.
pub fn parse_level(level: &str) -> LevelFilter {
    level.trim().parse().unwrap_or(LevelFilter::Info)
}

impl FleetLogger {
    /// Installs the logger. Lines go to stderr and, when `log_file` opens,
    /// are appended to it as JSON.
    pub fn init(level: LevelFilter, log_file: Option<&Path>) -> Result<(), SetLoggerError> {
        let file = log_file.and_then(|path| {
            OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .map_err(|e| eprintln!("Failed to open log file {:?}: {}", path, e))
                .ok()
        });

        let logger = LOGGER.get_or_init(|| FleetLogger {
            level,
            file: file.map(Mutex::new),
        });
        log::set_logger(logger).map(|()| log::set_max_level(level))
    }

    fn write_file(&self, message: &LogMessage) {
        let Some(file) = &self.file else {
            return;
        };
        let line = match serde_json::to_string(message) {
            Ok(line) => line,
            Err(e) => {
                eprintln!("Failed to serialize log message: {}", e);
                return;
            }
        };
        let mut file = file.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        if let Err(e) = writeln!(file, "{}", line) {
            eprintln!("Failed to write log file: {}", e);
        }
    }
}

impl log::Log for FleetLogger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= self.level
    }

    fn log(&self, record: &Record) {
        if self.enabled(record.metadata()) {
            let message = LogMessage::from_record(record);
            eprintln!("{} [{}] {}", Local::now().format("%H:%M:%S%.3f"), message.level, message.message);
            self.write_file(&message);
        }
    }

    fn flush(&self) {
        if let Some(file) = &self.file {
            let _ = file.lock().unwrap_or_else(|poisoned| poisoned.into_inner()).flush();
        }
    }
}
