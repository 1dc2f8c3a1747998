//! Logging setup
//!
//! Installs the global `tracing` subscriber for applications embedding
//! the library. Events carry structured fields (`message_id`,
//! `message_type`, `queue`, ...) rather than formatted strings, so the
//! JSON shape is what log aggregation wants with no extra work.
//!
//! Two environment variables drive the output:
//! - `LOG_FORMAT`: "json" for one JSON object per event, anything else
//!   for human-readable text (the default)
//! - `RUST_LOG`: the usual filter, e.g. `RUST_LOG=mc_dispatch=debug`
//!   (defaults to `info`)

use tracing_subscriber::{fmt, EnvFilter};

/// Output shape for emitted log events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
    /// Human-readable lines for development.
    #[default]
    Text,
    /// One flattened JSON object per event, for aggregation pipelines.
    Json,
}

impl LogFormat {
    fn parse(value: &str) -> Self {
        if value.eq_ignore_ascii_case("json") {
            LogFormat::Json
        } else {
            LogFormat::Text
        }
    }

    /// Resolve the format from `LOG_FORMAT`.
    pub fn from_env() -> Self {
        std::env::var("LOG_FORMAT")
            .map(|value| Self::parse(&value))
            .unwrap_or_default()
    }
}

fn env_filter() -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
}

/// Install the global subscriber using the environment's format.
///
/// Call once at startup, before any messages flow. Panics if a global
/// subscriber is already set, like every `tracing` init does.
pub fn init_logging() {
    init_with_format(LogFormat::from_env());
}

/// Install the global subscriber with an explicit format.
pub fn init_with_format(format: LogFormat) {
    match format {
        LogFormat::Json => {
            fmt()
                .json()
                .flatten_event(true)
                .with_current_span(true)
                .with_target(true)
                .with_env_filter(env_filter())
                .init();
        }
        LogFormat::Text => {
            fmt()
                .with_target(true)
                .with_env_filter(env_filter())
                .init();
        }
    }
}
