//! Process-wide structured logging.

use std::str::FromStr;

use tracing::warn;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

use crate::config::ConfigSource;
use crate::telemetry::{TelemetryLayer, TelemetryPipeline};

/// Filter used when `RUST_LOG` is absent or invalid.
pub const DEFAULT_FILTER: &str = "info";

/// Output format of the console log layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
    /// Multi-line, human readable
    #[default]
    Pretty,
    /// One JSON object per line
    Json,
}

impl FromStr for LogFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "pretty" | "text" => Ok(Self::Pretty),
            "json" => Ok(Self::Json),
            other => Err(format!("unknown log format `{other}`")),
        }
    }
}

/// Logging configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoggingSettings {
    /// Console output format
    pub format: LogFormat,
    /// `EnvFilter` directives
    pub filter: String,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            format: LogFormat::Pretty,
            filter: DEFAULT_FILTER.to_string(),
        }
    }
}

impl LoggingSettings {
    /// Reads `LOG_FORMAT` and `RUST_LOG`. Bad values fall back to defaults.
    pub fn load(source: &dyn ConfigSource) -> Self {
        let format = source.value("LOG_FORMAT").map_or(LogFormat::Pretty, |raw| {
            raw.parse().unwrap_or_else(|reason: String| {
                warn!(%reason, "using pretty log output");
                LogFormat::Pretty
            })
        });
        Self {
            format,
            filter: source
                .value("RUST_LOG")
                .unwrap_or_else(|| DEFAULT_FILTER.to_string()),
        }
    }

    fn env_filter(&self) -> EnvFilter {
        EnvFilter::try_new(&self.filter).unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER))
    }
}

/// Installs the global subscriber: filter, console output and, when a
/// pipeline is given, a [`TelemetryLayer`] feeding its log signal.
///
/// Returns `false` when a global subscriber was already set; the existing
/// one is kept.
pub fn init(settings: &LoggingSettings, pipeline: Option<&TelemetryPipeline>) -> bool {
    let json = settings.format == LogFormat::Json;
    let telemetry = pipeline.cloned().map(TelemetryLayer::new);

    tracing_subscriber::registry()
        .with(settings.env_filter())
        .with(json.then(|| {
            tracing_subscriber::fmt::layer()
                .json()
                .with_target(true)
                .with_thread_names(true)
        }))
        .with((!json).then(|| tracing_subscriber::fmt::layer().pretty()))
        .with(telemetry)
        .try_init()
        .is_ok()
}
