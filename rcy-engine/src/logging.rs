//! Process-wide tracing setup.
//!
//! `RCY_LOG` sets the filter (same syntax as `RUST_LOG`), `RCY_LOG_FORMAT=json`
//! switches stderr to JSON lines and `RCY_LOG_FILE` adds a JSON file sink.

use anyhow::{Context, Result, bail};
use std::path::{Path, PathBuf};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer, Registry, fmt};

pub const LOG_ENV: &str = "RCY_LOG";
pub const LOG_FORMAT_ENV: &str = "RCY_LOG_FORMAT";
pub const LOG_FILE_ENV: &str = "RCY_LOG_FILE";

/// Output format for the stderr layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
    #[default]
    Pretty,
    Json,
}

/// Logging configuration, usually built from the environment and then
/// adjusted from CLI flags.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogConfig {
    /// Filter directive, e.g. `info` or `rcy_engine=debug`.
    pub level: String,
    pub format: LogFormat,
    /// Emit to stderr.
    pub stderr: bool,
    /// Optional JSON log file.
    pub file: Option<PathBuf>,
}

impl LogConfig {
    pub fn from_env(default_level: &str) -> Self {
        Self::from_lookup(default_level, |key| std::env::var(key).ok())
    }

    fn from_lookup(default_level: &str, lookup: impl Fn(&str) -> Option<String>) -> Self {
        let level = lookup(LOG_ENV)
            .filter(|v| !v.trim().is_empty())
            .unwrap_or_else(|| default_level.to_string());
        let format = match lookup(LOG_FORMAT_ENV).as_deref() {
            Some("json") => LogFormat::Json,
            _ => LogFormat::Pretty,
        };
        let file = lookup(LOG_FILE_ENV)
            .filter(|v| !v.trim().is_empty())
            .map(PathBuf::from);
        Self {
            level,
            format,
            stderr: false,
            file,
        }
    }

    pub fn with_stderr(mut self) -> Self {
        self.stderr = true;
        self
    }

    pub fn with_level(mut self, level: impl Into<String>) -> Self {
        self.level = level.into();
        self
    }

    pub fn with_format(mut self, format: LogFormat) -> Self {
        self.format = format;
        self
    }

    pub fn with_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.file = Some(path.into());
        self
    }

    fn filter(&self) -> Result<EnvFilter> {
        EnvFilter::try_new(&self.level)
            .with_context(|| format!("invalid log filter '{}'", self.level))
    }
}

/// Keeps background log writers alive. Hold for the lifetime of the process.
#[must_use = "dropping the guards stops the file writer"]
pub struct LoggingGuards {
    _file: Option<WorkerGuard>,
}

type BoxedLayer = Box<dyn Layer<Registry> + Send + Sync>;

/// Install the global subscriber.
pub fn init_logging(config: &LogConfig) -> Result<LoggingGuards> {
    let mut layers: Vec<BoxedLayer> = Vec::new();

    if config.stderr {
        let layer = fmt::layer().with_writer(std::io::stderr).with_target(false);
        layers.push(match config.format {
            LogFormat::Pretty => layer.boxed(),
            LogFormat::Json => layer.json().with_current_span(true).boxed(),
        });
    }

    let mut file_guard = None;
    if let Some(path) = &config.file {
        let (dir, name) = split_log_path(path)?;
        std::fs::create_dir_all(dir)
            .with_context(|| format!("cannot create log directory {}", dir.display()))?;
        let appender = tracing_appender::rolling::never(dir, name);
        let (writer, guard) = tracing_appender::non_blocking(appender);
        layers.push(
            fmt::layer()
                .json()
                .with_current_span(true)
                .with_ansi(false)
                .with_writer(writer)
                .boxed(),
        );
        file_guard = Some(guard);
    }

    tracing_subscriber::registry()
        .with(layers)
        .with(config.filter()?)
        .try_init()
        .context("a global tracing subscriber is already installed")?;

    Ok(LoggingGuards { _file: file_guard })
}

fn split_log_path(path: &Path) -> Result<(&Path, &std::ffi::OsStr)> {
    let Some(name) = path.file_name() else {
        bail!("log file path {} has no file name", path.display());
    };
    let dir = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };
    Ok((dir, name))
}
