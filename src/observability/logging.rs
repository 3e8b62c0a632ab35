//! Structured logging for the connector and its CLI
//!
//! ## Log Format Options
//!
//! Three output formats, selected with `LOG_FORMAT`:
//!
//! - `json` - structured JSON for log aggregation (default)
//! - `pretty` - multi-line, coloured output for development
//! - `compact` - single-line, coloured output for terminals
//!
//! ## Environment Variables
//!
//! - `LOG_LEVEL`: ERROR, WARN, INFO, DEBUG or TRACE - defaults to INFO
//! - `LOG_FORMAT`: json, pretty or compact - defaults to json
//! - `LOG_SPANS`: emit span open/close events (true/false) - defaults to false
//! - `RUST_LOG`: replaces the whole filter (env_logger syntax)
//!
//! ```bash
//! LOG_FORMAT=pretty LOG_LEVEL=DEBUG pid-connector publish --routing-key a.b < events.jsonl
//! ```

use std::env;
use tracing::Level;
use tracing_subscriber::fmt::format::FmtSpan;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Log output format options
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Json,
    Pretty,
    Compact,
}

impl LogFormat {
    /// Parse a format name; anything unknown falls back to JSON
    pub fn parse(s: &str) -> Self {
        match s.to_lowercase().as_str() {
            "pretty" => LogFormat::Pretty,
            "compact" => LogFormat::Compact,
            _ => LogFormat::Json,
        }
    }
}

/// Parse a level name; anything unknown falls back to INFO
pub fn parse_level(s: &str) -> Level {
    match s.to_uppercase().as_str() {
        "ERROR" => Level::ERROR,
        "WARN" => Level::WARN,
        "DEBUG" => Level::DEBUG,
        "TRACE" => Level::TRACE,
        _ => Level::INFO,
    }
}

/// Resolved logging options
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LogSettings {
    pub level: Level,
    pub format: LogFormat,
    pub include_spans: bool,
}

impl LogSettings {
    /// Read `LOG_LEVEL`, `LOG_FORMAT` and `LOG_SPANS`
    pub fn from_env() -> Self {
        Self::from_values(
            env::var("LOG_LEVEL").ok().as_deref(),
            env::var("LOG_FORMAT").ok().as_deref(),
            env::var("LOG_SPANS").ok().as_deref(),
        )
    }

    fn from_values(level: Option<&str>, format: Option<&str>, spans: Option<&str>) -> Self {
        Self {
            level: level.map(parse_level).unwrap_or(Level::INFO),
            format: format.map(LogFormat::parse).unwrap_or(LogFormat::Json),
            include_spans: spans.is_some_and(|s| s.eq_ignore_ascii_case("true")),
        }
    }

    /// Raise the level by `verbosity` steps (the CLI's `-v` flag)
    pub fn with_verbosity(mut self, verbosity: u8) -> Self {
        let requested = match verbosity {
            0 => return self,
            1 => Level::DEBUG,
            _ => Level::TRACE,
        };
        // More verbose levels compare greater
        self.level = self.level.max(requested);
        self
    }
}

fn span_events(include_spans: bool) -> FmtSpan {
    if include_spans {
        FmtSpan::NEW | FmtSpan::CLOSE
    } else {
        FmtSpan::NONE
    }
}

fn build_filter(level: Level) -> EnvFilter {
    if let Ok(rust_log) = env::var("RUST_LOG") {
        return EnvFilter::new(rust_log);
    }

    let mut filter = EnvFilter::new(level.to_string());
    // lapin logs every frame at debug; keep dependencies quiet
    for directive in ["lapin=warn", "amq_protocol=warn", "pinky_swear=warn", "tokio=warn"] {
        if let Ok(directive) = directive.parse() {
            filter = filter.add_directive(directive);
        }
    }
    filter
}

/// Install the global subscriber; a second call is a no-op
pub fn init_logging(settings: LogSettings) {
    let subscriber = tracing_subscriber::registry().with(build_filter(settings.level));
    let spans = span_events(settings.include_spans);

    let result = match settings.format {
        LogFormat::Json => subscriber
            .with(fmt::layer().json().with_span_events(spans))
            .try_init(),
        LogFormat::Pretty => subscriber
            .with(fmt::layer().pretty().with_ansi(true).with_span_events(spans))
            .try_init(),
        LogFormat::Compact => subscriber
            .with(
                fmt::layer()
                    .compact()
                    .with_ansi(true)
                    .with_target(false)
                    .with_span_events(spans),
            )
            .try_init(),
    };

    if let Err(e) = result {
        tracing::debug!("Logging already initialized: {}", e);
    }
}

/// Initialize logging from environment variables
pub fn init_default_logging() {
    init_logging(LogSettings::from_env());
}

/// Span around the publisher event loop
#[macro_export]
macro_rules! connector_span {
    ($($field:tt)*) => {
        tracing::info_span!("publisher_loop", $($field)*)
    };
}

/// Span around one connection attempt
#[macro_export]
macro_rules! connection_span {
    ($($field:tt)*) => {
        tracing::info_span!("broker_connection", $($field)*)
    };
}

pub use {connection_span, connector_span};
