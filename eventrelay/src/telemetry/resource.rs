//! Identity of the running service instance.

use std::env;
use std::sync::Arc;

use uuid::Uuid;

/// Attribute key for the logical service name.
pub const SERVICE_NAME: &str = "service.name";
/// Attribute key for the service version.
pub const SERVICE_VERSION: &str = "service.version";
/// Attribute key for the instance id.
pub const SERVICE_INSTANCE_ID: &str = "service.instance.id";

/// Name, version and instance id stamped on every emitted signal.
///
/// Built once at startup and shared by `Arc` between the pipeline and every
/// exporter. There is no way to mutate a descriptor after construction.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ResourceDescriptor {
    service_name: String,
    service_version: String,
    instance_id: String,
}

impl ResourceDescriptor {
    /// Creates a descriptor from explicit values.
    pub fn new(
        service_name: impl Into<String>,
        service_version: impl Into<String>,
        instance_id: impl Into<String>,
    ) -> Self {
        Self {
            service_name: service_name.into(),
            service_version: service_version.into(),
            instance_id: instance_id.into(),
        }
    }

    /// Creates a descriptor whose instance id is detected from the host.
    ///
    /// Uses `HOSTNAME` (or `COMPUTERNAME` on Windows) when set, otherwise a
    /// random UUID, so two replicas of one service never share an id by
    /// accident.
    pub fn detect(service_name: impl Into<String>, service_version: impl Into<String>) -> Self {
        Self::new(service_name, service_version, detect_instance_id())
    }

    /// Wraps the descriptor for sharing.
    pub fn shared(self) -> Arc<Self> {
        Arc::new(self)
    }

    /// Logical service name.
    pub fn service_name(&self) -> &str {
        &self.service_name
    }

    /// Service version.
    pub fn service_version(&self) -> &str {
        &self.service_version
    }

    /// Instance id.
    pub fn instance_id(&self) -> &str {
        &self.instance_id
    }

    /// The descriptor as semantic-convention attribute pairs.
    pub fn attributes(&self) -> [(&'static str, &str); 3] {
        [
            (SERVICE_NAME, &self.service_name),
            (SERVICE_VERSION, &self.service_version),
            (SERVICE_INSTANCE_ID, &self.instance_id),
        ]
    }
}

pub(crate) fn detect_instance_id() -> String {
    ["HOSTNAME", "COMPUTERNAME"]
        .iter()
        .filter_map(|key| env::var(key).ok())
        .map(|value| value.trim().to_string())
        .find(|value| !value.is_empty())
        .unwrap_or_else(|| Uuid::new_v4().to_string())
}
