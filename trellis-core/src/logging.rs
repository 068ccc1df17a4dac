//! Logging setup for Trellis applications
//!
//! The core only emits `tracing` events; installing a subscriber is left to
//! the application. [`LogConfig`] builds one with a choice of format and
//! output. Defaults to JSON on STDOUT at INFO level.
//!
//! ```no_run
//! use trellis_core::logging::*;
//!
//! let _guard = LogConfig::new()
//!     .level(LogLevel::Debug)
//!     .format(LogFormat::Pretty)
//!     .with_targets(true)
//!     .init()
//!     .expect("logging");
//!
//! info!("Application configured with pretty logging");
//! ```

use crate::{Error, Result};
use std::io;
use std::str::FromStr;
use tracing::{Level, Subscriber};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{
    EnvFilter, Layer,
    fmt::{self, format::FmtSpan},
    layer::SubscriberExt,
    registry::LookupSpan,
    util::SubscriberInitExt,
};
use trellis_config::AppConfig;

pub use tracing::{debug, error, info, trace, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
}

impl LogLevel {
    pub fn to_tracing_level(&self) -> Level {
        match self {
            LogLevel::Trace => Level::TRACE,
            LogLevel::Debug => Level::DEBUG,
            LogLevel::Info => Level::INFO,
            LogLevel::Warn => Level::WARN,
            LogLevel::Error => Level::ERROR,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            LogLevel::Trace => "trace",
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warn => "warn",
            LogLevel::Error => "error",
        }
    }
}

impl FromStr for LogLevel {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "trace" => Ok(LogLevel::Trace),
            "debug" => Ok(LogLevel::Debug),
            "info" => Ok(LogLevel::Info),
            "warn" => Ok(LogLevel::Warn),
            "error" => Ok(LogLevel::Error),
            other => Err(Error::Configuration(format!("Unknown log level \"{}\"", other))),
        }
    }
}

/// Output format for log messages
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    /// Structured, machine-readable (default)
    Json,
    Plain,
    /// Multi-line, for development
    Pretty,
    Compact,
}

impl FromStr for LogFormat {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "json" => Ok(LogFormat::Json),
            "plain" => Ok(LogFormat::Plain),
            "pretty" => Ok(LogFormat::Pretty),
            "compact" => Ok(LogFormat::Compact),
            other => Err(Error::Configuration(format!("Unknown log format \"{}\"", other))),
        }
    }
}

/// Output destination for logs
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LogOutput {
    Stdout,
    Stderr,
    File(String),
    RollingFile {
        directory: String,
        prefix: String,
        rotation: Rotation,
    },
}

/// File rotation strategy
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Rotation {
    Minutely,
    Hourly,
    Daily,
    Never,
}

impl Rotation {
    fn to_tracing_rotation(self) -> tracing_appender::rolling::Rotation {
        match self {
            Rotation::Minutely => tracing_appender::rolling::Rotation::MINUTELY,
            Rotation::Hourly => tracing_appender::rolling::Rotation::HOURLY,
            Rotation::Daily => tracing_appender::rolling::Rotation::DAILY,
            Rotation::Never => tracing_appender::rolling::Rotation::NEVER,
        }
    }
}

#[derive(Debug, Clone)]
pub struct LogConfig {
    pub level: LogLevel,
    pub format: LogFormat,
    pub output: LogOutput,
    pub timestamps: bool,
    pub thread_ids: bool,
    /// Include the module path of each event
    pub targets: bool,
    pub file_line: bool,
    /// Emit span close events with timings
    pub spans: bool,
    pub colors: bool,
    /// Overrides `level` when set, e.g. `"trellis_core=debug,info"`
    pub env_filter: Option<String>,
}

impl LogConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Level and format taken from the application configuration
    pub fn from_app_config(config: &AppConfig) -> Result<Self> {
        Ok(Self::new()
            .level(config.log_level.parse()?)
            .format(config.log_format.parse()?))
    }

    pub fn level(mut self, level: LogLevel) -> Self {
        self.level = level;
        self
    }

    pub fn format(mut self, format: LogFormat) -> Self {
        self.format = format;
        self
    }

    pub fn output(mut self, output: LogOutput) -> Self {
        self.output = output;
        self
    }

    pub fn with_timestamps(mut self, enable: bool) -> Self {
        self.timestamps = enable;
        self
    }

    pub fn with_thread_ids(mut self, enable: bool) -> Self {
        self.thread_ids = enable;
        self
    }

    pub fn with_targets(mut self, enable: bool) -> Self {
        self.targets = enable;
        self
    }

    pub fn with_file_line(mut self, enable: bool) -> Self {
        self.file_line = enable;
        self
    }

    pub fn with_spans(mut self, enable: bool) -> Self {
        self.spans = enable;
        self
    }

    pub fn with_colors(mut self, enable: bool) -> Self {
        self.colors = enable;
        self
    }

    pub fn with_env_filter(mut self, filter: impl Into<String>) -> Self {
        self.env_filter = Some(filter.into());
        self
    }

    fn env_filter(&self) -> Result<EnvFilter> {
        match &self.env_filter {
            Some(filter) => EnvFilter::try_new(filter)
                .map_err(|e| Error::Configuration(format!("Invalid log filter \"{}\": {}", filter, e))),
            None => Ok(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(self.level.as_str()))),
        }
    }

    /// Install the global subscriber.
    ///
    /// The returned guard flushes buffered events when dropped and must be
    /// kept alive for the life of the program. Fails if a subscriber is
    /// already installed.
    pub fn init(self) -> Result<WorkerGuard> {
        let env_filter = self.env_filter()?;
        let (writer, guard) = match &self.output {
            LogOutput::Stdout => tracing_appender::non_blocking(io::stdout()),
            LogOutput::Stderr => tracing_appender::non_blocking(io::stderr()),
            LogOutput::File(path) => {
                let file = std::fs::OpenOptions::new()
                    .create(true)
                    .append(true)
                    .open(path)
                    .map_err(|e| Error::Configuration(format!("Failed to open log file {}: {}", path, e)))?;
                tracing_appender::non_blocking(file)
            }
            LogOutput::RollingFile {
                directory,
                prefix,
                rotation,
            } => tracing_appender::non_blocking(tracing_appender::rolling::RollingFileAppender::new(
                rotation.to_tracing_rotation(),
                directory,
                prefix,
            )),
        };
        self.init_with_writer(writer, env_filter)?;
        Ok(guard)
    }

    /// Like [`LogConfig::init`] but ignores an already installed subscriber
    pub fn try_init(self) -> Option<WorkerGuard> {
        self.init().ok()
    }

    fn init_with_writer<W>(&self, writer: W, env_filter: EnvFilter) -> Result<()>
    where
        W: for<'a> fmt::MakeWriter<'a> + Send + Sync + 'static,
    {
        self.subscriber(writer, env_filter)
            .try_init()
            .map_err(|e| Error::Configuration(format!("Failed to install log subscriber: {}", e)))
    }

    fn subscriber<W>(&self, writer: W, env_filter: EnvFilter) -> impl Subscriber + Send + Sync + use<W>
    where
        W: for<'a> fmt::MakeWriter<'a> + Send + Sync + 'static,
    {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(self.fmt_layer(writer))
    }

    fn fmt_layer<S, W>(&self, writer: W) -> Box<dyn Layer<S> + Send + Sync + 'static>
    where
        S: Subscriber + for<'a> LookupSpan<'a> + 'static,
        W: for<'a> fmt::MakeWriter<'a> + Send + Sync + 'static,
    {
        let fmt_span = if self.spans { FmtSpan::CLOSE } else { FmtSpan::NONE };

        // `without_time` changes the layer type, hence the boxing per format
        macro_rules! finish {
            ($layer:expr) => {
                if self.timestamps {
                    $layer.boxed()
                } else {
                    $layer.without_time().boxed()
                }
            };
        }

        match self.format {
            LogFormat::Json => finish!(
                fmt::layer()
                    .json()
                    .with_writer(writer)
                    .with_current_span(self.spans)
                    .with_span_list(self.spans)
                    .with_target(self.targets)
                    .with_thread_ids(self.thread_ids)
                    .with_file(self.file_line)
                    .with_line_number(self.file_line)
                    .with_span_events(fmt_span)
            ),
            LogFormat::Plain => finish!(
                fmt::layer()
                    .with_writer(writer)
                    .with_target(self.targets)
                    .with_thread_ids(self.thread_ids)
                    .with_file(self.file_line)
                    .with_line_number(self.file_line)
                    .with_ansi(self.colors)
                    .with_span_events(fmt_span)
            ),
            LogFormat::Pretty => finish!(
                fmt::layer()
                    .pretty()
                    .with_writer(writer)
                    .with_target(self.targets)
                    .with_thread_ids(self.thread_ids)
                    .with_file(self.file_line)
                    .with_line_number(self.file_line)
                    .with_ansi(self.colors)
                    .with_span_events(fmt_span)
            ),
            LogFormat::Compact => finish!(
                fmt::layer()
                    .compact()
                    .with_writer(writer)
                    .with_target(self.targets)
                    .with_thread_ids(self.thread_ids)
                    .with_ansi(self.colors)
                    .with_span_events(fmt_span)
            ),
        }
    }
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: LogLevel::Info,
            format: LogFormat::Json,
            output: LogOutput::Stdout,
            timestamps: true,
            thread_ids: false,
            targets: true,
            file_line: false,
            spans: false,
            colors: false,
            env_filter: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use std::sync::Arc;

    #[test]
    fn test_log_level_conversion() {
        assert_eq!(LogLevel::Trace.to_tracing_level(), Level::TRACE);
        assert_eq!(LogLevel::Warn.to_tracing_level(), Level::WARN);
        assert_eq!(LogLevel::Error.as_str(), "error");
    }

    #[test]
    fn test_parse_names() {
        assert_eq!("DEBUG".parse::<LogLevel>().unwrap(), LogLevel::Debug);
        assert_eq!("compact".parse::<LogFormat>().unwrap(), LogFormat::Compact);
        assert!("verbose".parse::<LogLevel>().is_err());
    }

    #[test]
    fn test_from_app_config() {
        let app = AppConfig {
            log_level: "warn".into(),
            log_format: "pretty".into(),
            ..AppConfig::default()
        };
        let config = LogConfig::from_app_config(&app).unwrap();
        assert_eq!(config.level, LogLevel::Warn);
        assert_eq!(config.format, LogFormat::Pretty);
        assert_eq!(config.output, LogOutput::Stdout);
    }

    /// Collects everything the subscriber writes
    #[derive(Clone, Default)]
    struct Captured(Arc<Mutex<Vec<u8>>>);

    impl io::Write for Captured {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.0.lock().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    fn capture(config: LogConfig) -> serde_json::Value {
        let out = Captured::default();
        let writer = out.clone();
        let subscriber = config.subscriber(move || writer.clone(), EnvFilter::new("info"));
        tracing::subscriber::with_default(subscriber, || info!(module = "Root", "Resolved module"));
        let line = String::from_utf8(out.0.lock().clone()).unwrap();
        serde_json::from_str(line.trim()).unwrap()
    }

    #[test]
    fn test_timestamps_follow_config() {
        let stamped = capture(LogConfig::new());
        assert!(stamped.get("timestamp").is_some());
        assert_eq!(stamped["fields"]["module"], "Root");

        let bare = capture(LogConfig::new().with_timestamps(false));
        assert!(bare.get("timestamp").is_none());
        assert_eq!(bare["fields"]["message"], "Resolved module");
    }

    #[test]
    fn test_invalid_filter_is_reported() {
        let config = LogConfig::new().with_env_filter("trellis=notalevel");
        assert!(config.env_filter().is_err());
    }
}
