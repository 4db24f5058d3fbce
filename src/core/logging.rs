//! Structured logging
//!
//! Sets up the global `tracing` subscriber from [`LoggingConfig`]: JSON or text lines,
//! written through a non-blocking writer to stdout or a size-rotated log file.

use crate::core::config::LoggingConfig;
use anyhow::{Context, Result};
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::Level;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

/// Keeps the background log writer alive; drop it last.
pub struct Logger {
    _guard: WorkerGuard,
}

impl Logger {
    /// Initialize the global subscriber from configuration
    pub fn init(config: &LoggingConfig) -> Result<Self> {
        let level = parse_log_level(&config.level)?;

        let env_filter = EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new(level.as_str()));

        let (writer, guard) = match config.output.as_str() {
            "stdout" => tracing_appender::non_blocking(std::io::stdout()),
            "file" => {
                let log_file = config.log_file.as_ref()
                    .context("log_file must be specified when output is 'file'")?;

                if let Some(parent) = log_file.parent() {
                    std::fs::create_dir_all(parent)
                        .context("Failed to create log directory")?;
                }

                let appender = RollingFileAppender::new(
                    log_file,
                    config.max_file_size,
                    config.max_backups,
                )?;
                tracing_appender::non_blocking(appender)
            }
            other => anyhow::bail!("Invalid output configuration: {}", other),
        };

        let fmt_layer = match config.format.as_str() {
            "json" => fmt::layer()
                .json()
                .with_writer(writer)
                .with_current_span(true)
                .with_thread_names(true)
                .with_target(true)
                .boxed(),
            "text" => fmt::layer()
                .with_writer(writer)
                .with_thread_names(true)
                .with_target(true)
                .boxed(),
            other => anyhow::bail!("Invalid format configuration: {}", other),
        };

        tracing_subscriber::registry()
            .with(env_filter)
            .with(fmt_layer)
            .try_init()
            .context("Failed to initialize tracing subscriber")?;

        tracing::info!(
            level = %config.level,
            format = %config.format,
            output = %config.output,
            "Logging system initialized"
        );

        Ok(Logger { _guard: guard })
    }
}

/// Parse log level string to tracing Level
fn parse_log_level(level: &str) -> Result<Level> {
    match level.to_lowercase().as_str() {
        "debug" => Ok(Level::DEBUG),
        "info" => Ok(Level::INFO),
        "warn" => Ok(Level::WARN),
        "error" => Ok(Level::ERROR),
        _ => anyhow::bail!("Invalid log level: {}", level),
    }
}

/// File writer that rotates to `name.1 .. name.N` once `max_file_size` would be exceeded
pub struct RollingFileAppender {
    path: PathBuf,
    max_file_size: usize,
    max_backups: usize,
    file: File,
    written: usize,
}

impl RollingFileAppender {
    pub fn new(path: &Path, max_file_size: usize, max_backups: usize) -> Result<Self> {
        let file = open_append(path)
            .with_context(|| format!("Failed to open log file {}", path.display()))?;
        let written = file.metadata().map(|m| m.len() as usize).unwrap_or(0);

        Ok(Self {
            path: path.to_path_buf(),
            max_file_size,
            max_backups,
            file,
            written,
        })
    }

    fn backup_path(&self, index: usize) -> PathBuf {
        let mut name = self.path.as_os_str().to_os_string();
        name.push(format!(".{}", index));
        PathBuf::from(name)
    }

    fn rotate(&mut self) -> std::io::Result<()> {
        self.file.flush()?;

        for i in (1..self.max_backups).rev() {
            let from = self.backup_path(i);
            if from.exists() {
                std::fs::rename(&from, self.backup_path(i + 1))?;
            }
        }
        if self.path.exists() {
            std::fs::rename(&self.path, self.backup_path(1))?;
        }

        self.file = open_append(&self.path)?;
        self.written = 0;
        Ok(())
    }
}

fn open_append(path: &Path) -> std::io::Result<File> {
    OpenOptions::new().create(true).append(true).open(path)
}

impl Write for RollingFileAppender {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        if self.written > 0 && self.written + buf.len() > self.max_file_size {
            self.rotate()?;
        }

        let written = self.file.write(buf)?;
        self.written += written;
        Ok(written)
    }

    fn flush(&mut self) -> std::io::Result<()> {
        self.file.flush()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_log_level() {
        assert!(matches!(parse_log_level("debug"), Ok(Level::DEBUG)));
        assert!(matches!(parse_log_level("INFO"), Ok(Level::INFO)));
        assert!(matches!(parse_log_level("warn"), Ok(Level::WARN)));
        assert!(matches!(parse_log_level("error"), Ok(Level::ERROR)));
        assert!(parse_log_level("invalid").is_err());
    }

    #[test]
    fn test_rolling_appender_rotates() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("mirror.log");
        let mut appender = RollingFileAppender::new(&path, 16, 2).unwrap();

        appender.write_all(b"first line 0123\n").unwrap();
        appender.write_all(b"second line 012\n").unwrap();
        appender.write_all(b"third line 0123\n").unwrap();
        appender.flush().unwrap();

        assert_eq!(std::fs::read_to_string(&path).unwrap(), "third line 0123\n");
        assert_eq!(
            std::fs::read_to_string(dir.path().join("mirror.log.1")).unwrap(),
            "second line 012\n"
        );
        assert_eq!(
            std::fs::read_to_string(dir.path().join("mirror.log.2")).unwrap(),
            "first line 0123\n"
        );
    }
}
