// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Spool configuration.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Result, SpoolError};

/// Log levels accepted by `logging.level`.
const LOG_LEVELS: &[&str] = &["trace", "debug", "info", "warn", "error"];

/// Complete spool settings.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SpoolConfig {
    pub database: DatabaseConfig,
    pub printers: PrintersConfig,
    pub queue: QueueConfig,
    pub notifications: NotificationConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    /// SQLite database file.  `None` places it in the platform data directory.
    pub path: Option<PathBuf>,
}

/// Device session settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PrintersConfig {
    /// Interval between health-check sweeps over every registered printer.
    pub health_check_interval_secs: u64,
    /// Dial, read and write deadline for printer connections.
    pub connection_timeout_ms: u64,
}

impl Default for PrintersConfig {
    fn default() -> Self {
        Self {
            health_check_interval_secs: 30,
            connection_timeout_ms: 10_000,
        }
    }
}

impl PrintersConfig {
    pub fn health_check_interval(&self) -> Duration {
        Duration::from_secs(self.health_check_interval_secs)
    }

    pub fn connection_timeout(&self) -> Duration {
        Duration::from_millis(self.connection_timeout_ms)
    }
}

/// Job scheduler settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    /// Retry budget given to jobs submitted without an explicit limit.
    pub max_retries: u32,
    /// Base delay of the exponential retry backoff.
    pub retry_delay_ms: u64,
    /// Number of worker tasks pulling from the dispatch channel.
    pub worker_count: usize,
    /// Period of the dispatch sweep over pending jobs.
    pub dispatch_interval_ms: u64,
    /// Maximum pending jobs offered per sweep.
    pub dispatch_batch: u32,
    /// Capacity of the bounded dispatch channel.
    pub channel_capacity: usize,
    /// Fail permanent errors (bad template, missing variables) immediately
    /// instead of spending the retry budget on them.
    pub fast_fail_permanent: bool,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            retry_delay_ms: 10_000,
            worker_count: 2,
            dispatch_interval_ms: 1_000,
            dispatch_batch: 100,
            channel_capacity: 1_000,
            fast_fail_permanent: false,
        }
    }
}

impl QueueConfig {
    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }

    pub fn dispatch_interval(&self) -> Duration {
        Duration::from_millis(self.dispatch_interval_ms)
    }
}

/// Lifecycle notification settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NotificationConfig {
    /// Events buffered for the sink before new ones are dropped.
    pub capacity: usize,
    /// Persist every event to the audit log.
    pub audit_enabled: bool,
}

impl Default for NotificationConfig {
    fn default() -> Self {
        Self {
            capacity: 256,
            audit_enabled: true,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    pub format: LogFormat,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".into(),
            format: LogFormat::Text,
        }
    }
}

impl SpoolConfig {
    /// Load settings from a JSON file.  A missing file yields the defaults.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        match std::fs::read_to_string(path.as_ref()) {
            Ok(data) => Ok(serde_json::from_str(&data)?),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Self::default()),
            Err(e) => Err(SpoolError::Io(e)),
        }
    }

    /// Apply `SPOOL_*` environment overrides.
    pub fn apply_env(&mut self) -> Result<()> {
        self.apply_overrides(|key| std::env::var(key).ok())
    }

    fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<()> {
        if let Some(path) = lookup("SPOOL_DB_PATH") {
            self.database.path = Some(PathBuf::from(path));
        }
        if let Some(level) = lookup("SPOOL_LOG_LEVEL") {
            self.logging.level = level;
        }
        if let Some(format) = lookup("SPOOL_LOG_FORMAT") {
            self.logging.format = match format.as_str() {
                "json" => LogFormat::Json,
                "text" | "plain" => LogFormat::Text,
                other => {
                    return Err(SpoolError::Config(format!("unknown log format: {other}")));
                }
            };
        }
        if let Some(workers) = lookup("SPOOL_WORKERS") {
            self.queue.worker_count = workers
                .parse()
                .map_err(|e| SpoolError::Config(format!("SPOOL_WORKERS: {e}")))?;
        }
        Ok(())
    }

    /// Reject settings the spool cannot run with.
    pub fn validate(&self) -> Result<()> {
        let checks: [(bool, &str); 7] = [
            (self.queue.worker_count >= 1, "queue.worker_count must be at least 1"),
            (self.queue.channel_capacity >= 1, "queue.channel_capacity must be at least 1"),
            (self.queue.dispatch_interval_ms > 0, "queue.dispatch_interval_ms must be positive"),
            (self.queue.dispatch_batch > 0, "queue.dispatch_batch must be positive"),
            (
                self.printers.health_check_interval_secs > 0,
                "printers.health_check_interval_secs must be positive",
            ),
            (
                self.printers.connection_timeout_ms > 0,
                "printers.connection_timeout_ms must be positive",
            ),
            (self.notifications.capacity >= 1, "notifications.capacity must be at least 1"),
        ];
        if let Some((_, msg)) = checks.iter().find(|(ok, _)| !ok) {
            return Err(SpoolError::Config((*msg).to_string()));
        }
        if !LOG_LEVELS.contains(&self.logging.level.as_str()) {
            return Err(SpoolError::Config(format!(
                "invalid log level: {} (valid: {})",
                self.logging.level,
                LOG_LEVELS.join(", ")
            )));
        }
        Ok(())
    }
}
