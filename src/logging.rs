//! Logging setup for programs that drive a pool.
//!
//! The library itself only emits `tracing` events; nothing is printed until a
//! subscriber is installed. [`init`] installs one on stderr, optionally
//! mirrored to a rolling file. Forked children inherit the subscriber, so
//! their lifecycle events land in the same outputs as the parent's.
//!
//! # Environment Variables
//!
//! - `FORKPOOL_LOG` - Log filter (overrides RUST_LOG)
//! - `FORKPOOL_LOG_LEVEL` - Log level: error, warn, info, debug, trace
//! - `FORKPOOL_LOG_FORMAT` - Output format: pretty, compact, json
//! - `FORKPOOL_LOG_FILE` - Path to log file (in addition to stderr)
//! - `RUST_LOG` - Standard Rust log filter (fallback)
//!
//! # Example
//!
//! ```no_run
//! use forkpool::logging::{LogConfig, init};
//!
//! init(LogConfig::default().with_env_overrides());
//! ```

use std::path::{Path, PathBuf};
use std::str::FromStr;

use tracing::Level;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::{
    EnvFilter,
    fmt::{self, format::FmtSpan},
    layer::SubscriberExt,
    util::SubscriberInitExt,
};

/// Log output format.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum LogFormat {
    Pretty,
    /// Single line per event (default)
    #[default]
    Compact,
    /// JSON for log aggregation
    Json,
}

impl FromStr for LogFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "pretty" | "full" => Ok(Self::Pretty),
            "compact" => Ok(Self::Compact),
            "json" => Ok(Self::Json),
            _ => Err(format!(
                "Unknown log format: '{}'. Valid options: pretty, compact, json",
                s
            )),
        }
    }
}

/// Rotation policy for the log file.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum LogRotation {
    Hourly,
    Daily,
    /// Single file, never rotated (default)
    #[default]
    Never,
}

impl FromStr for LogRotation {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "hourly" => Ok(Self::Hourly),
            "daily" => Ok(Self::Daily),
            "never" => Ok(Self::Never),
            _ => Err(format!(
                "Unknown log rotation: '{}'. Valid options: hourly, daily, never",
                s
            )),
        }
    }
}

impl From<LogRotation> for Rotation {
    fn from(rotation: LogRotation) -> Self {
        match rotation {
            LogRotation::Hourly => Rotation::HOURLY,
            LogRotation::Daily => Rotation::DAILY,
            LogRotation::Never => Rotation::NEVER,
        }
    }
}

/// Logging configuration, consumed by [`init`].
#[derive(Debug, Clone)]
pub struct LogConfig {
    /// Base level when no filter is set (default: INFO)
    pub level: Level,
    pub format: LogFormat,
    /// Mirror output to this file
    pub file_path: Option<PathBuf>,
    pub rotation: LogRotation,
    /// Custom filter directive; wins over `level`
    pub filter: Option<String>,
    /// Emit span close events with timing
    pub span_events: bool,
    /// Include thread names; children run jobs on a named thread
    pub show_thread_names: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: Level::INFO,
            format: LogFormat::Compact,
            file_path: None,
            rotation: LogRotation::Never,
            filter: None,
            span_events: false,
            show_thread_names: false,
        }
    }
}

impl LogConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_level(mut self, level: Level) -> Self {
        self.level = level;
        self
    }

    pub fn with_format(mut self, format: LogFormat) -> Self {
        self.format = format;
        self
    }

    pub fn with_file(mut self, path: PathBuf) -> Self {
        self.file_path = Some(path);
        self
    }

    pub fn with_rotation(mut self, rotation: LogRotation) -> Self {
        self.rotation = rotation;
        self
    }

    pub fn with_filter(mut self, filter: impl Into<String>) -> Self {
        self.filter = Some(filter.into());
        self
    }

    pub fn with_span_events(mut self, enabled: bool) -> Self {
        self.span_events = enabled;
        self
    }

    pub fn with_thread_names(mut self, enabled: bool) -> Self {
        self.show_thread_names = enabled;
        self
    }

    /// Apply environment variable overrides.
    ///
    /// A filter set in code is kept; `FORKPOOL_LOG` / `RUST_LOG` only fill
    /// it in when absent, and `FORKPOOL_LOG_LEVEL` only applies without any
    /// filter.
    pub fn with_env_overrides(mut self) -> Self {
        if self.filter.is_none() {
            self.filter = std::env::var("FORKPOOL_LOG")
                .or_else(|_| std::env::var("RUST_LOG"))
                .ok();
        }

        if self.filter.is_none()
            && let Ok(level) = std::env::var("FORKPOOL_LOG_LEVEL")
        {
            self.level = parse_level(&level).unwrap_or(self.level);
        }

        if let Ok(format) = std::env::var("FORKPOOL_LOG_FORMAT")
            && let Ok(format) = format.parse()
        {
            self.format = format;
        }

        if let Ok(path) = std::env::var("FORKPOOL_LOG_FILE") {
            self.file_path = Some(PathBuf::from(path));
        }

        self
    }

    fn build_filter(&self) -> EnvFilter {
        let fallback = || EnvFilter::new(self.level.to_string().to_lowercase());
        match &self.filter {
            Some(filter) => EnvFilter::try_new(filter).unwrap_or_else(|_| {
                eprintln!("Warning: Invalid log filter '{}', using default", filter);
                fallback()
            }),
            None => fallback(),
        }
    }

    fn file_appender(&self) -> Option<RollingFileAppender> {
        let path = self.file_path.as_ref()?;
        let dir = path.parent().unwrap_or(Path::new("."));
        let file_name = path
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or("forkpool.log");
        Some(RollingFileAppender::new(self.rotation.into(), dir, file_name))
    }
}

fn parse_level(s: &str) -> Option<Level> {
    match s.to_lowercase().as_str() {
        "error" => Some(Level::ERROR),
        "warn" | "warning" => Some(Level::WARN),
        "info" => Some(Level::INFO),
        "debug" => Some(Level::DEBUG),
        "trace" => Some(Level::TRACE),
        _ => None,
    }
}

/// Install the global tracing subscriber.
///
/// Subsequent calls are silently ignored.
pub fn init(config: LogConfig) {
    let filter = config.build_filter();

    // FmtSpan is not Copy
    let span_events = || {
        if config.span_events {
            FmtSpan::CLOSE
        } else {
            FmtSpan::NONE
        }
    };

    // The file layer sits directly on the filter so its type is the same in
    // every format arm below.
    let file_layer = config.file_appender().map(|appender| {
        fmt::layer()
            .with_ansi(false)
            .with_span_events(span_events())
            .with_thread_names(config.show_thread_names)
            .with_writer(appender)
    });

    let registry = tracing_subscriber::registry().with(filter).with(file_layer);

    let result = match config.format {
        LogFormat::Json => registry
            .with(
                fmt::layer()
                    .json()
                    .with_span_events(span_events())
                    .with_thread_names(config.show_thread_names)
                    .with_writer(std::io::stderr),
            )
            .try_init(),
        LogFormat::Compact => registry
            .with(
                fmt::layer()
                    .compact()
                    .with_span_events(span_events())
                    .with_thread_names(config.show_thread_names)
                    .with_writer(std::io::stderr),
            )
            .try_init(),
        LogFormat::Pretty => registry
            .with(
                fmt::layer()
                    .pretty()
                    .with_span_events(span_events())
                    .with_thread_names(config.show_thread_names)
                    .with_writer(std::io::stderr),
            )
            .try_init(),
    };

    // Already initialized
    let _ = result;
}
