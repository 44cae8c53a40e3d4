// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Logging utilities for the gfapi volume client
//!
//! Two audiences share these types. The remote client library keeps its own
//! diagnostic log, configured per volume through `Volume::set_logging` with a
//! [`LogLevel`]. The process embedding the client logs through `tracing`, and
//! the `init*` functions here install a subscriber for it with the same level
//! vocabulary.

use serde::{Deserialize, Serialize};
use std::io;
use std::path::{Path, PathBuf};
use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

// Re-export Level for convenience
pub use tracing::Level;

/// Log levels understood by the remote client library.
///
/// The discriminants are the numeric values the library expects on the wire.
#[derive(
    Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
#[repr(i32)]
pub enum LogLevel {
    /// Logging disabled
    None = 0,
    Emerg = 1,
    Alert = 2,
    Critical = 3,
    Error = 4,
    Warning = 5,
    Notice = 6,
    #[default]
    Info = 7,
    Debug = 8,
    Trace = 9,
}

impl LogLevel {
    /// Numeric level passed to the remote library.
    pub fn as_raw(self) -> i32 {
        self as i32
    }

    /// Level for a raw value, or `None` when the value is out of range.
    pub fn from_raw(raw: i32) -> Option<Self> {
        Some(match raw {
            0 => LogLevel::None,
            1 => LogLevel::Emerg,
            2 => LogLevel::Alert,
            3 => LogLevel::Critical,
            4 => LogLevel::Error,
            5 => LogLevel::Warning,
            6 => LogLevel::Notice,
            7 => LogLevel::Info,
            8 => LogLevel::Debug,
            9 => LogLevel::Trace,
            _ => return None,
        })
    }

    /// Closest `tracing` level; `None` when logging is disabled.
    pub fn tracing_level(self) -> Option<Level> {
        match self {
            LogLevel::None => None,
            LogLevel::Emerg | LogLevel::Alert | LogLevel::Critical | LogLevel::Error => {
                Some(Level::ERROR)
            }
            LogLevel::Warning => Some(Level::WARN),
            LogLevel::Notice | LogLevel::Info => Some(Level::INFO),
            LogLevel::Debug => Some(Level::DEBUG),
            LogLevel::Trace => Some(Level::TRACE),
        }
    }

    pub fn level_filter(self) -> LevelFilter {
        match self.tracing_level() {
            Some(level) => LevelFilter::from_level(level),
            None => LevelFilter::OFF,
        }
    }
}

impl std::fmt::Display for LogLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            LogLevel::None => "none",
            LogLevel::Emerg => "emerg",
            LogLevel::Alert => "alert",
            LogLevel::Critical => "critical",
            LogLevel::Error => "error",
            LogLevel::Warning => "warning",
            LogLevel::Notice => "notice",
            LogLevel::Info => "info",
            LogLevel::Debug => "debug",
            LogLevel::Trace => "trace",
        };
        f.write_str(name)
    }
}

impl std::str::FromStr for LogLevel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "none" | "off" => Ok(LogLevel::None),
            "emerg" => Ok(LogLevel::Emerg),
            "alert" => Ok(LogLevel::Alert),
            "critical" => Ok(LogLevel::Critical),
            "error" => Ok(LogLevel::Error),
            "warning" | "warn" => Ok(LogLevel::Warning),
            "notice" => Ok(LogLevel::Notice),
            "info" => Ok(LogLevel::Info),
            "debug" => Ok(LogLevel::Debug),
            "trace" => Ok(LogLevel::Trace),
            _ => Err(format!("Invalid log level: {}", s)),
        }
    }
}

/// Output format for log messages
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Human-readable plaintext format
    #[default]
    Plaintext,
    /// Structured JSON format
    Json,
}

impl std::fmt::Display for LogFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LogFormat::Plaintext => write!(f, "plaintext"),
            LogFormat::Json => write!(f, "json"),
        }
    }
}

impl std::str::FromStr for LogFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "plaintext" => Ok(LogFormat::Plaintext),
            "json" => Ok(LogFormat::Json),
            _ => Err(format!(
                "Invalid log format: {}. Use 'plaintext' or 'json'",
                s
            )),
        }
    }
}

/// Logging section of a volume configuration file
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct LoggingConfig {
    /// Verbosity, also forwarded to the remote library
    #[serde(skip_serializing_if = "Option::is_none")]
    pub level: Option<LogLevel>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub format: Option<LogFormat>,

    /// Log file; relative paths are taken relative to the standard log directory
    #[serde(skip_serializing_if = "Option::is_none")]
    pub file: Option<PathBuf>,
}

impl LoggingConfig {
    pub fn level(&self) -> LogLevel {
        self.level.unwrap_or_default()
    }

    /// Resolve the log file for `component`.
    ///
    /// An absolute `file` is used as is, a relative one is placed in the
    /// standard log directory, and without `file` the component's standard
    /// log path is used.
    pub fn resolve_log_path(&self, component: &str) -> PathBuf {
        match &self.file {
            Some(file) if file.is_absolute() => file.clone(),
            Some(file) => standard_log_dir().join(file),
            None => standard_log_path(component),
        }
    }

    /// Install a subscriber for this configuration.
    ///
    /// Logs go to stderr unless a file is configured.
    pub fn init(&self, component: &str) -> anyhow::Result<()> {
        let format = self.format.unwrap_or_default();
        if self.file.is_some() {
            init_to_file(
                component,
                self.level(),
                format,
                &self.resolve_log_path(component),
            )
        } else {
            init(component, self.level(), format)
        }
    }
}

/// Directory holding client logs
///
/// - Linux: ~/.local/share/gfapi
/// - macOS: ~/Library/Application Support/gfapi
/// - elsewhere: the platform data directory, or /tmp/gfapi as a last resort
pub fn standard_log_dir() -> PathBuf {
    let mut path = dirs::data_dir()
        .or_else(dirs::home_dir)
        .unwrap_or_else(|| PathBuf::from("/tmp"));
    path.push("gfapi");
    path
}

/// Standard log file for one component, usually a volume name
pub fn standard_log_path(component: &str) -> PathBuf {
    standard_log_dir().join(format!("{}.log", component))
}

/// Initialize logging to stderr
///
/// # Example
/// ```rust
/// use gfapi_logging::{init, LogFormat, LogLevel};
///
/// fn main() -> anyhow::Result<()> {
///     init("my-app", LogLevel::Info, LogFormat::Plaintext)?;
///     tracing::info!("Application started");
///     Ok(())
/// }
/// ```
pub fn init(component: &str, default_level: LogLevel, format: LogFormat) -> anyhow::Result<()> {
    init_with_writer(component, default_level, format, io::stderr)
}

/// Initialize logging to a file, creating its parent directory if needed
pub fn init_to_file(
    component: &str,
    default_level: LogLevel,
    format: LogFormat,
    log_path: &Path,
) -> anyhow::Result<()> {
    use std::fs;

    if let Some(parent) = log_path.parent() {
        fs::create_dir_all(parent)?;
    }

    let log_file = fs::OpenOptions::new().create(true).append(true).open(log_path)?;

    init_with_writer(component, default_level, format, log_file)
}

/// Initialize logging with a custom writer
///
/// `RUST_LOG` wins over `default_level` when it is set.
pub fn init_with_writer<W>(
    component: &str,
    default_level: LogLevel,
    format: LogFormat,
    writer: W,
) -> anyhow::Result<()>
where
    W: for<'writer> tracing_subscriber::fmt::MakeWriter<'writer> + Send + Sync + 'static,
{
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| default_filter(component, default_level));

    match format {
        LogFormat::Json => {
            let layer = tracing_subscriber::fmt::layer().with_writer(writer).json();
            #[cfg(debug_assertions)]
            let layer = layer.with_file(true).with_line_number(true);

            tracing_subscriber::registry().with(filter).with(layer).try_init()?;
        }
        LogFormat::Plaintext => {
            let layer = tracing_subscriber::fmt::layer().with_writer(writer);
            #[cfg(debug_assertions)]
            let layer = layer.with_file(true).with_line_number(true);

            tracing_subscriber::registry().with(filter).with(layer).try_init()?;
        }
    }

    Ok(())
}

fn default_filter(component: &str, level: LogLevel) -> EnvFilter {
    let filter = level.level_filter();
    EnvFilter::new(format!("{},gfapi={},{}={}", filter, filter, component, filter))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_raw_values_round_trip() {
        for raw in 0..=9 {
            let level = LogLevel::from_raw(raw).expect("level in range");
            assert_eq!(level.as_raw(), raw);
        }
        assert_eq!(LogLevel::from_raw(10), None);
        assert_eq!(LogLevel::from_raw(-1), None);
    }

    #[test]
    fn test_tracing_level_mapping() {
        assert_eq!(LogLevel::None.tracing_level(), None);
        assert_eq!(LogLevel::Critical.tracing_level(), Some(Level::ERROR));
        assert_eq!(LogLevel::Warning.tracing_level(), Some(Level::WARN));
        assert_eq!(LogLevel::Notice.tracing_level(), Some(Level::INFO));
        assert_eq!(LogLevel::Debug.tracing_level(), Some(Level::DEBUG));
        assert_eq!(LogLevel::Trace.tracing_level(), Some(Level::TRACE));
        assert_eq!(LogLevel::None.level_filter(), LevelFilter::OFF);
        assert_eq!(LogLevel::Info.level_filter(), LevelFilter::INFO);
    }

    #[test]
    fn test_log_level_display_and_parse() {
        assert_eq!(LogLevel::Warning.to_string(), "warning");
        assert_eq!("WARN".parse::<LogLevel>(), Ok(LogLevel::Warning));
        assert_eq!("off".parse::<LogLevel>(), Ok(LogLevel::None));
        assert_eq!("debug".parse::<LogLevel>(), Ok(LogLevel::Debug));
        assert!("loud".parse::<LogLevel>().is_err());
    }

    #[test]
    fn test_log_level_default() {
        let default: LogLevel = Default::default();
        assert_eq!(default, LogLevel::Info);
    }

    #[test]
    fn test_log_format_parse() {
        assert_eq!("json".parse::<LogFormat>(), Ok(LogFormat::Json));
        assert_eq!("Plaintext".parse::<LogFormat>(), Ok(LogFormat::Plaintext));
        assert!("xml".parse::<LogFormat>().is_err());
    }

    #[test]
    fn test_logging_config_serde() {
        let config: LoggingConfig =
            serde_json::from_str(r#"{ "level": "debug", "format": "json", "file": "vol.log" }"#)
                .expect("config");
        assert_eq!(config.level, Some(LogLevel::Debug));
        assert_eq!(config.format, Some(LogFormat::Json));
        assert_eq!(config.file, Some(PathBuf::from("vol.log")));

        let empty: LoggingConfig = serde_json::from_str("{}").expect("empty config");
        assert_eq!(empty, LoggingConfig::default());
        assert_eq!(empty.level(), LogLevel::Info);
    }

    #[test]
    fn test_resolve_log_path() {
        let dir = tempfile::tempdir().unwrap();
        let absolute = dir.path().join("client.log");
        let config = LoggingConfig {
            file: Some(absolute.clone()),
            ..Default::default()
        };
        assert_eq!(config.resolve_log_path("test"), absolute);

        let relative = LoggingConfig {
            file: Some(PathBuf::from("client.log")),
            ..Default::default()
        };
        assert_eq!(
            relative.resolve_log_path("test"),
            standard_log_dir().join("client.log")
        );

        let default = LoggingConfig::default();
        assert!(default.resolve_log_path("test").ends_with("gfapi/test.log"));
    }
}
