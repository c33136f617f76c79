//! Zipkin v2 JSON span exporter.

use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Map, Value};

use super::SpanExporter;
use crate::errors::{ExportError, ExportResult};
use crate::telemetry::options::ExporterKind;
use crate::telemetry::records::{SpanKind, SpanRecord, SpanStatus};
use crate::telemetry::resource::ResourceDescriptor;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Posts spans to a Zipkin collector.
#[derive(Debug, Clone)]
pub struct ZipkinExporter {
    client: reqwest::Client,
    endpoint: String,
}

impl ZipkinExporter {
    /// Exporter posting to `endpoint`, for example
    /// `http://localhost:9411/api/v2/spans`.
    pub fn new(endpoint: &str) -> ExportResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|e| ExportError::Construction {
                kind: ExporterKind::Zipkin,
                reason: e.to_string(),
            })?;
        Ok(Self {
            client,
            endpoint: endpoint.to_string(),
        })
    }
}

fn to_zipkin(resource: &ResourceDescriptor, span: &SpanRecord) -> Value {
    let mut tags: Map<String, Value> = span
        .attributes
        .iter()
        .map(|(key, value)| (key.clone(), Value::String(value.clone())))
        .collect();
    tags.insert(
        "service.instance.id".into(),
        Value::String(resource.instance_id().to_string()),
    );
    tags.insert(
        "service.version".into(),
        Value::String(resource.service_version().to_string()),
    );
    tags.insert("otel.scope.name".into(), Value::String(span.source.clone()));
    if let SpanStatus::Error(description) = &span.status {
        tags.insert("error".into(), Value::String(description.clone()));
    }

    let mut value = json!({
        "traceId": span.context.trace_id().to_string(),
        "id": span.context.span_id().to_string(),
        "name": span.name,
        "timestamp": span.start.unix_micros(),
        "duration": u64::try_from(span.duration().as_micros()).unwrap_or(u64::MAX),
        "localEndpoint": { "serviceName": resource.service_name() },
        "tags": tags,
    });
    if let Some(parent) = span.parent_span_id {
        value["parentId"] = Value::String(parent.to_string());
    }
    if span.kind != SpanKind::Internal {
        value["kind"] = Value::String(span.kind.as_str().to_string());
    }
    value
}

#[async_trait]
impl SpanExporter for ZipkinExporter {
    fn name(&self) -> &'static str {
        "zipkin"
    }

    async fn export_spans(
        &self,
        resource: &ResourceDescriptor,
        spans: &[SpanRecord],
    ) -> ExportResult<()> {
        let body: Vec<Value> = spans.iter().map(|span| to_zipkin(resource, span)).collect();
        let failed = |reason: String| ExportError::Export {
            kind: ExporterKind::Zipkin,
            reason,
        };

        let response = self
            .client
            .post(&self.endpoint)
            .json(&body)
            .send()
            .await
            .map_err(|e| failed(e.to_string()))?;
        if response.status().is_success() {
            Ok(())
        } else {
            Err(failed(format!("collector answered {}", response.status())))
        }
    }
}
