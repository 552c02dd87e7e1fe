//! Logging setup with `tracing-subscriber`.
//!
//! ```rust,ignore
//! use syncbot_runtime::logging::{LoggingBuilder, SpanEvents};
//!
//! LoggingBuilder::new()
//!     .directive("syncbot_framework::sync=debug")
//!     .span_events(SpanEvents::lifecycle())
//!     .init();
//! ```
//!
//! `RUST_LOG`, when set, replaces the configured level and the quiet
//! defaults for dependencies; explicit directives still apply on top.

use std::ffi::OsStr;
use std::path::{Path, PathBuf};

use thiserror::Error;
use tracing_subscriber::fmt::MakeWriter;
use tracing_subscriber::fmt::format::FmtSpan;
use tracing_subscriber::prelude::*;
use tracing_subscriber::util::TryInitError;
use tracing_subscriber::{EnvFilter, Layer, Registry, fmt};

use crate::config::{LogFormat, LogOutput, LoggingConfig, SpanEventConfig};

/// Dependencies that log every request at `info`.
const QUIET_TARGETS: &[&str] = &["hyper=warn", "reqwest=warn", "image=warn"];

type BoxedLayer = Box<dyn Layer<Registry> + Send + Sync>;

#[derive(Debug, Error)]
pub enum LoggingError {
    #[error("file output needs a file path")]
    MissingFilePath,

    #[error(transparent)]
    Init(#[from] TryInitError),
}

/// Which span lifecycle events are logged.
///
/// Dispatch runs inside `session`, `inbound` and `plugin_init` spans, so
/// [`SpanEvents::lifecycle`] shows how long each event took end to end.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SpanEvents(FmtSpan);

impl SpanEvents {
    pub fn none() -> Self {
        Self(FmtSpan::NONE)
    }

    /// Creation and close only.
    pub fn lifecycle() -> Self {
        Self(FmtSpan::NEW | FmtSpan::CLOSE)
    }

    pub fn full() -> Self {
        Self(FmtSpan::FULL)
    }
}

impl Default for SpanEvents {
    fn default() -> Self {
        Self::none()
    }
}

impl From<&SpanEventConfig> for SpanEvents {
    fn from(config: &SpanEventConfig) -> Self {
        [
            (config.new, FmtSpan::NEW),
            (config.enter, FmtSpan::ENTER),
            (config.exit, FmtSpan::EXIT),
            (config.close, FmtSpan::CLOSE),
        ]
        .into_iter()
        .filter(|(on, _)| *on)
        .fold(Self::none(), |Self(acc), (_, span)| Self(acc | span))
    }
}

/// Installs the global subscriber described by the `[logging]` settings.
///
/// A subscriber that is already installed is kept; tests and embedding
/// applications install their own first.
pub fn init_from_config(config: &LoggingConfig) {
    match LoggingBuilder::from_config(config).try_init() {
        Ok(()) | Err(LoggingError::Init(_)) => {}
        Err(e) => eprintln!("logging not initialised: {e}"),
    }
}

/// A builder for the global subscriber.
#[derive(Debug)]
pub struct LoggingBuilder {
    level: tracing::Level,
    directives: Vec<String>,
    span_events: SpanEvents,
    format: LogFormat,
    output: LogOutput,
    file_path: Option<PathBuf>,
    with_target: bool,
    with_thread_ids: bool,
    with_file_location: bool,
}

impl Default for LoggingBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl LoggingBuilder {
    pub fn new() -> Self {
        Self {
            level: tracing::Level::INFO,
            directives: Vec::new(),
            span_events: SpanEvents::none(),
            format: LogFormat::Compact,
            output: LogOutput::Stdout,
            file_path: None,
            with_target: true,
            with_thread_ids: false,
            with_file_location: false,
        }
    }

    pub fn from_config(config: &LoggingConfig) -> Self {
        let directives = config
            .filters
            .iter()
            .map(|(module, level)| format!("{module}={level}"))
            .collect();
        Self {
            level: config.level.to_tracing_level(),
            directives,
            span_events: SpanEvents::from(&config.span_events),
            format: config.format,
            output: config.output,
            file_path: config.file_path.clone(),
            with_target: true,
            with_thread_ids: config.thread_ids,
            with_file_location: config.file_location,
        }
    }

    pub fn with_level(mut self, level: tracing::Level) -> Self {
        self.level = level;
        self
    }

    /// Adds a filter directive such as `syncbot_core::queue=trace`.
    pub fn directive(mut self, directive: impl Into<String>) -> Self {
        self.directives.push(directive.into());
        self
    }

    pub fn span_events(mut self, events: SpanEvents) -> Self {
        self.span_events = events;
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

    /// Sets the log file and switches the output to it.
    pub fn file_path(mut self, path: PathBuf) -> Self {
        self.file_path = Some(path);
        self.output = LogOutput::File;
        self
    }

    pub fn with_target(mut self, enabled: bool) -> Self {
        self.with_target = enabled;
        self
    }

    pub fn with_thread_ids(mut self, enabled: bool) -> Self {
        self.with_thread_ids = enabled;
        self
    }

    fn filter(&self) -> EnvFilter {
        let mut filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
            QUIET_TARGETS.iter().fold(
                EnvFilter::new(self.level.as_str().to_lowercase()),
                |filter, target| match target.parse() {
                    Ok(d) => filter.add_directive(d),
                    Err(_) => filter,
                },
            )
        });
        for directive in &self.directives {
            match directive.parse() {
                Ok(d) => filter = filter.add_directive(d),
                Err(e) => eprintln!("ignoring log directive '{directive}': {e}"),
            }
        }
        filter
    }

    fn layer<W>(&self, writer: W) -> BoxedLayer
    where
        W: for<'w> MakeWriter<'w> + Send + Sync + 'static,
    {
        let layer = fmt::layer()
            .with_writer(writer)
            .with_span_events(self.span_events.0.clone())
            .with_target(self.with_target)
            .with_thread_ids(self.with_thread_ids)
            .with_file(self.with_file_location)
            .with_line_number(self.with_file_location);
        match self.format {
            #[cfg(feature = "json-log")]
            LogFormat::Json => layer.json().boxed(),
            LogFormat::Compact => layer.compact().boxed(),
            LogFormat::Full => layer.boxed(),
            LogFormat::Pretty => layer.pretty().boxed(),
        }
    }

    fn output_layer(&self) -> Result<BoxedLayer, LoggingError> {
        Ok(match self.output {
            LogOutput::Stdout => self.layer(std::io::stdout),
            LogOutput::Stderr => self.layer(std::io::stderr),
            LogOutput::File => {
                let path = self.file_path.as_deref().ok_or(LoggingError::MissingFilePath)?;
                let appender = tracing_appender::rolling::never(
                    path.parent().unwrap_or_else(|| Path::new(".")),
                    path.file_name().unwrap_or_else(|| OsStr::new("syncbot.log")),
                );
                self.layer(appender)
            }
        })
    }

    pub fn init(self) {
        let _ = self.try_init();
    }

    pub fn try_init(self) -> Result<(), LoggingError> {
        let layer = self.output_layer()?;
        tracing_subscriber::registry()
            .with(layer)
            .with(self.filter())
            .try_init()?;
        Ok(())
    }
}
