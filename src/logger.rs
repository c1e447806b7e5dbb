use std::path::PathBuf;

use anyhow::Result;
use serde::{Deserialize, Serialize};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::prelude::*;
use tracing_subscriber::{EnvFilter, Registry, fmt};

use crate::config::OrchestratorConfig;

pub const LOG_FILE: &str = "rdfc.log";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct LogConfig {
    /// `EnvFilter` directive, e.g. `info` or `rdfc=debug,warn`.
    pub log_level: String,
    /// Daily rolling log files go here when set.
    pub log_dir: Option<PathBuf>,
    /// Write the file log as newline-delimited JSON.
    pub json: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            log_dir: None,
            json: false,
        }
    }
}

impl LogConfig {
    pub fn new(log_level: impl Into<String>, log_dir: Option<PathBuf>) -> Self {
        Self {
            log_level: log_level.into(),
            log_dir,
            json: false,
        }
    }

    pub fn json(mut self, json: bool) -> Self {
        self.json = json;
        self
    }

    fn filter(&self) -> EnvFilter {
        // RUST_LOG wins over the configured level
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&self.log_level))
    }
}

impl From<&OrchestratorConfig> for LogConfig {
    fn from(config: &OrchestratorConfig) -> Self {
        LogConfig::new(config.log_level.clone(), config.log_dir.clone())
    }
}

/// Keeps the file writer flushing; drop it last.
#[must_use]
pub struct LogGuard(Option<WorkerGuard>);

/// Install the global subscriber: stdout plus an optional rolling file.
pub fn init_tracing(config: &LogConfig) -> Result<LogGuard> {
    let stdout_layer = fmt::layer().with_target(true).with_filter(config.filter());

    let Some(dir) = &config.log_dir else {
        Registry::default().with(stdout_layer).try_init()?;
        return Ok(LogGuard(None));
    };

    std::fs::create_dir_all(dir)?;
    let appender = RollingFileAppender::new(Rotation::DAILY, dir, LOG_FILE);
    let (writer, guard) = tracing_appender::non_blocking(appender);

    if config.json {
        let file_layer = fmt::layer()
            .json()
            .with_writer(writer)
            .with_target(true)
            .with_filter(config.filter());
        Registry::default().with(stdout_layer).with(file_layer).try_init()?;
    } else {
        let file_layer = fmt::layer()
            .with_writer(writer)
            .with_ansi(false)
            .with_filter(config.filter());
        Registry::default().with(stdout_layer).with(file_layer).try_init()?;
    }
    Ok(LogGuard(Some(guard)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn follows_orchestrator_config() {
        let config = OrchestratorConfig {
            log_level: "debug".into(),
            log_dir: Some(PathBuf::from("logs")),
            ..OrchestratorConfig::default()
        };
        let log = LogConfig::from(&config).json(true);
        assert_eq!(log.log_level, "debug");
        assert_eq!(log.log_dir, Some(PathBuf::from("logs")));
        assert!(log.json);
    }

    #[test]
    fn file_logging_creates_the_directory() {
        let dir = tempfile::tempdir().unwrap();
        let log_dir = dir.path().join("logs");
        let config = LogConfig::new("info", Some(log_dir.clone()));
        // another test may have installed a subscriber already
        let _guard = init_tracing(&config);
        assert!(log_dir.is_dir());
    }
}
