//! Declarative telemetry options and their lenient loader.
//!
//! Nothing in here can fail startup. A malformed value is logged at `warn`
//! and replaced by its default; an unknown exporter name selects the console
//! exporter for that signal.

use std::fmt;
use std::str::FromStr;

use nutype::nutype;
use serde::{Deserialize, Serialize};
use tracing::warn;

use super::resource::{detect_instance_id, ResourceDescriptor};
use super::sampler::SamplerPolicy;
use crate::config::ConfigSource;

/// Default OTLP gRPC collector.
pub const DEFAULT_OTLP_ENDPOINT: &str = "http://localhost:4317";
/// Default Zipkin v2 span endpoint.
pub const DEFAULT_ZIPKIN_ENDPOINT: &str = "http://localhost:9411/api/v2/spans";

/// The three telemetry signals.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SignalKind {
    /// Distributed trace spans
    Trace,
    /// Counters and histograms
    Metric,
    /// Log records
    Log,
}

impl SignalKind {
    /// Every signal, in pipeline order.
    pub const ALL: [Self; 3] = [Self::Trace, Self::Metric, Self::Log];

    const fn config_key(self) -> &'static str {
        match self {
            Self::Trace => "USE_TRACING_EXPORTER",
            Self::Metric => "USE_METRICS_EXPORTER",
            Self::Log => "USE_LOG_EXPORTER",
        }
    }
}

impl fmt::Display for SignalKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Trace => "trace",
            Self::Metric => "metric",
            Self::Log => "log",
        })
    }
}

/// Exporter families a signal can be routed to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ExporterKind {
    /// Human-readable lines on stdout
    Console,
    /// OpenTelemetry protocol over gRPC
    Otlp,
    /// Zipkin v2 JSON (traces only)
    Zipkin,
    /// Prometheus text exposition (metrics only)
    Prometheus,
    /// Exporter supplied by the host, for example a cloud monitoring agent
    VendorManaged,
}

impl ExporterKind {
    /// Whether this family can carry `signal`.
    pub const fn supports(self, signal: SignalKind) -> bool {
        match self {
            Self::Console | Self::Otlp | Self::VendorManaged => true,
            Self::Zipkin => matches!(signal, SignalKind::Trace),
            Self::Prometheus => matches!(signal, SignalKind::Metric),
        }
    }
}

impl fmt::Display for ExporterKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Console => "console",
            Self::Otlp => "otlp",
            Self::Zipkin => "zipkin",
            Self::Prometheus => "prometheus",
            Self::VendorManaged => "vendorManaged",
        })
    }
}

/// Returned when an exporter name is not recognised.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnknownExporter(pub String);

impl fmt::Display for UnknownExporter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "unknown exporter `{}`", self.0)
    }
}

impl std::error::Error for UnknownExporter {}

impl FromStr for ExporterKind {
    type Err = UnknownExporter;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().replace(['-', '_'], "").as_str() {
            "console" => Ok(Self::Console),
            "otlp" => Ok(Self::Otlp),
            "zipkin" => Ok(Self::Zipkin),
            "prometheus" => Ok(Self::Prometheus),
            "vendor" | "vendormanaged" | "azuremonitor" => Ok(Self::VendorManaged),
            _ => Err(UnknownExporter(value.trim().to_string())),
        }
    }
}

/// Absolute `http`/`https` URI of a telemetry backend.
#[nutype(
    sanitize(trim),
    validate(predicate = |uri: &str| {
        let rest = uri
            .strip_prefix("http://")
            .or_else(|| uri.strip_prefix("https://"));
        rest.is_some_and(|host| !host.is_empty() && !host.starts_with('/'))
    }),
    derive(
        Debug,
        Clone,
        PartialEq,
        Eq,
        Hash,
        AsRef,
        Deref,
        Display,
        Serialize,
        Deserialize
    )
)]
pub struct Endpoint(String);

/// Routes one signal to one exporter family.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExporterConfig {
    /// Signal being routed
    pub signal: SignalKind,
    /// Destination family
    pub kind: ExporterKind,
    /// Backend address, for families that push over the network
    pub endpoint: Option<Endpoint>,
}

impl ExporterConfig {
    /// Routes `signal` to `kind` with no endpoint.
    pub const fn new(signal: SignalKind, kind: ExporterKind) -> Self {
        Self {
            signal,
            kind,
            endpoint: None,
        }
    }

    /// Sets the backend address.
    #[must_use]
    pub fn with_endpoint(mut self, endpoint: Endpoint) -> Self {
        self.endpoint = Some(endpoint);
        self
    }

    /// Stdout exporter for `signal`.
    pub const fn console(signal: SignalKind) -> Self {
        Self::new(signal, ExporterKind::Console)
    }
}

/// How histogram-shaped instruments aggregate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HistogramAggregation {
    /// Fixed bucket boundaries
    #[default]
    Explicit,
    /// Base-2 exponential buckets with automatic scale
    Exponential,
}

impl FromStr for HistogramAggregation {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "explicit" => Ok(Self::Explicit),
            "exponential" | "base2exponential" => Ok(Self::Exponential),
            other => Err(format!("unknown histogram aggregation `{other}`")),
        }
    }
}

/// Everything the telemetry pipeline needs from configuration.
#[derive(Debug, Clone, PartialEq)]
pub struct TelemetrySettings {
    /// Logical service name
    pub service_name: String,
    /// Service version
    pub service_version: String,
    /// Instance id
    pub instance_id: String,
    /// Exporter routes, at least one per signal
    pub exporters: Vec<ExporterConfig>,
    /// Histogram aggregation applied to every histogram
    pub histogram_aggregation: HistogramAggregation,
    /// Process-wide trace sampler
    pub sampler: SamplerPolicy,
}

impl TelemetrySettings {
    /// Console exporters for every signal, always-on sampling, explicit buckets.
    pub fn defaults(service_name: impl Into<String>) -> Self {
        Self {
            service_name: service_name.into(),
            service_version: env!("CARGO_PKG_VERSION").to_string(),
            instance_id: detect_instance_id(),
            exporters: SignalKind::ALL.map(ExporterConfig::console).to_vec(),
            histogram_aggregation: HistogramAggregation::Explicit,
            sampler: SamplerPolicy::AlwaysOn,
        }
    }

    /// Reads settings from `source`, falling back to defaults value by value.
    ///
    /// `USE_*_EXPORTER` values may list several exporters separated by commas.
    pub fn load(source: &dyn ConfigSource, default_service_name: &str) -> Self {
        let mut settings = Self::defaults(default_service_name);

        if let Some(name) = source.value("SERVICE_NAME") {
            settings.service_name = name;
        }
        if let Some(version) = source.value("SERVICE_VERSION") {
            settings.service_version = version;
        }
        if let Some(instance_id) = source.value("SERVICE_INSTANCE_ID") {
            settings.instance_id = instance_id;
        }

        let otlp = endpoint_or_default(source, "OTLP_ENDPOINT", DEFAULT_OTLP_ENDPOINT);
        let zipkin = endpoint_or_default(source, "ZIPKIN_ENDPOINT", DEFAULT_ZIPKIN_ENDPOINT);

        settings.exporters = SignalKind::ALL
            .into_iter()
            .flat_map(|signal| {
                let requested = source
                    .value(signal.config_key())
                    .unwrap_or_else(|| "console".to_string());
                requested
                    .split(',')
                    .filter(|name| !name.trim().is_empty())
                    .map(|name| resolve_exporter(signal, name, otlp.as_ref(), zipkin.as_ref()))
                    .collect::<Vec<_>>()
            })
            .collect();
        for signal in SignalKind::ALL {
            if !settings.exporters.iter().any(|config| config.signal == signal) {
                settings.exporters.push(ExporterConfig::console(signal));
            }
        }

        if let Some(value) = source.value("HISTOGRAM_AGGREGATION") {
            match value.parse() {
                Ok(aggregation) => settings.histogram_aggregation = aggregation,
                Err(reason) => warn!(%reason, "using explicit histogram buckets"),
            }
        }

        if let Some(name) = source.value("TRACE_SAMPLER") {
            let argument = source.value("TRACE_SAMPLER_ARG");
            match SamplerPolicy::from_name(&name, argument.as_deref()) {
                Some(policy) => settings.sampler = policy,
                None => warn!(sampler = %name, "unknown trace sampler, using always_on"),
            }
        }

        settings
    }

    /// Builds the resource descriptor described by these settings.
    pub fn resource(&self) -> ResourceDescriptor {
        ResourceDescriptor::new(
            self.service_name.clone(),
            self.service_version.clone(),
            self.instance_id.clone(),
        )
    }

    /// Exporter routes for one signal.
    pub fn exporters_for(&self, signal: SignalKind) -> impl Iterator<Item = &ExporterConfig> {
        self.exporters
            .iter()
            .filter(move |config| config.signal == signal)
    }
}

fn endpoint_or_default(source: &dyn ConfigSource, key: &str, default: &str) -> Option<Endpoint> {
    let configured = source.value(key).and_then(|value| {
        Endpoint::try_new(value.clone())
            .map_err(|_| warn!(key, %value, default, "invalid endpoint, using default"))
            .ok()
    });
    configured.or_else(|| Endpoint::try_new(default.to_string()).ok())
}

fn resolve_exporter(
    signal: SignalKind,
    name: &str,
    otlp: Option<&Endpoint>,
    zipkin: Option<&Endpoint>,
) -> ExporterConfig {
    let kind = match name.parse::<ExporterKind>() {
        Ok(kind) if kind.supports(signal) => kind,
        Ok(kind) => {
            warn!(%signal, exporter = %kind, "exporter does not carry this signal, using console");
            ExporterKind::Console
        }
        Err(unknown) => {
            warn!(%signal, error = %unknown, "falling back to console exporter");
            ExporterKind::Console
        }
    };

    let endpoint = match kind {
        ExporterKind::Otlp => otlp.cloned(),
        ExporterKind::Zipkin => zipkin.cloned(),
        _ => None,
    };

    ExporterConfig {
        signal,
        kind,
        endpoint,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MapSource;

    fn kinds(settings: &TelemetrySettings, signal: SignalKind) -> Vec<ExporterKind> {
        settings.exporters_for(signal).map(|c| c.kind).collect()
    }

    #[test]
    fn defaults_route_every_signal_to_console() {
        let settings = TelemetrySettings::load(&MapSource::new(), "product-service");

        for signal in SignalKind::ALL {
            assert_eq!(kinds(&settings, signal), [ExporterKind::Console]);
        }
        assert_eq!(settings.service_name, "product-service");
        assert_eq!(settings.sampler, SamplerPolicy::AlwaysOn);
        assert_eq!(settings.histogram_aggregation, HistogramAggregation::Explicit);
    }

    #[test]
    fn unknown_exporter_falls_back_to_console() {
        let source = MapSource::from_iter([("USE_TRACING_EXPORTER", "jaeger-thrift")]);
        let settings = TelemetrySettings::load(&source, "svc");
        assert_eq!(kinds(&settings, SignalKind::Trace), [ExporterKind::Console]);
    }

    #[test]
    fn signal_specific_exporters_are_rejected_for_other_signals() {
        let source = MapSource::from_iter([
            ("USE_TRACING_EXPORTER", "prometheus"),
            ("USE_METRICS_EXPORTER", "zipkin"),
            ("USE_LOG_EXPORTER", "otlp"),
        ]);
        let settings = TelemetrySettings::load(&source, "svc");

        assert_eq!(kinds(&settings, SignalKind::Trace), [ExporterKind::Console]);
        assert_eq!(kinds(&settings, SignalKind::Metric), [ExporterKind::Console]);
        assert_eq!(kinds(&settings, SignalKind::Log), [ExporterKind::Otlp]);
    }

    #[test]
    fn otlp_and_zipkin_carry_their_endpoints() {
        let source = MapSource::from_iter([
            ("USE_TRACING_EXPORTER", "zipkin, otlp"),
            ("OTLP_ENDPOINT", "http://collector:4317"),
        ]);
        let settings = TelemetrySettings::load(&source, "svc");
        let traces: Vec<_> = settings.exporters_for(SignalKind::Trace).collect();

        assert_eq!(traces.len(), 2);
        assert_eq!(
            traces[0].endpoint.as_ref().map(AsRef::as_ref),
            Some(DEFAULT_ZIPKIN_ENDPOINT)
        );
        assert_eq!(
            traces[1].endpoint.as_ref().map(AsRef::as_ref),
            Some("http://collector:4317")
        );
    }

    #[test]
    fn malformed_values_keep_defaults() {
        let source = MapSource::from_iter([
            ("OTLP_ENDPOINT", "collector:4317"),
            ("USE_METRICS_EXPORTER", "otlp"),
            ("HISTOGRAM_AGGREGATION", "logarithmic"),
            ("TRACE_SAMPLER", "sometimes"),
        ]);
        let settings = TelemetrySettings::load(&source, "svc");
        let metrics: Vec<_> = settings.exporters_for(SignalKind::Metric).collect();

        assert_eq!(
            metrics[0].endpoint.as_ref().map(AsRef::as_ref),
            Some(DEFAULT_OTLP_ENDPOINT)
        );
        assert_eq!(settings.histogram_aggregation, HistogramAggregation::Explicit);
        assert_eq!(settings.sampler, SamplerPolicy::AlwaysOn);
    }

    #[test]
    fn exporter_names_are_case_and_separator_insensitive() {
        assert_eq!("OTLP".parse(), Ok(ExporterKind::Otlp));
        assert_eq!("Vendor_Managed".parse(), Ok(ExporterKind::VendorManaged));
        assert_eq!("azure-monitor".parse(), Ok(ExporterKind::VendorManaged));
        assert!("".parse::<ExporterKind>().is_err());
    }

    #[test]
    fn endpoint_requires_http_scheme_and_host() {
        assert!(Endpoint::try_new("https://otel.example.com").is_ok());
        assert!(Endpoint::try_new("http:///path").is_err());
        assert!(Endpoint::try_new("grpc://collector").is_err());
    }

    #[test]
    fn explicit_settings_are_applied() {
        let source = MapSource::from_iter([
            ("SERVICE_NAME", "catalog"),
            ("SERVICE_VERSION", "2.0.1"),
            ("SERVICE_INSTANCE_ID", "catalog-0"),
            ("HISTOGRAM_AGGREGATION", "Exponential"),
            ("TRACE_SAMPLER", "traceidratio"),
            ("TRACE_SAMPLER_ARG", "0.25"),
        ]);
        let settings = TelemetrySettings::load(&source, "svc");

        assert_eq!(
            settings.resource(),
            ResourceDescriptor::new("catalog", "2.0.1", "catalog-0")
        );
        assert_eq!(settings.histogram_aggregation, HistogramAggregation::Exponential);
        assert_eq!(settings.sampler, SamplerPolicy::TraceIdRatio(0.25));
    }
}
