//! Error types for `eventrelay`.
//!
//! Errors are split by subsystem so callers can tell at a glance who failed and
//! whether retrying makes sense:
//!
//! - **ConfigurationError**: fatal at startup, never retried
//! - **PublishError**: `Unreachable`/`Throttled` are transient and retried by the
//!   caller with backoff; `Serialization` is fatal to that publish call
//! - **TransportError**: faults raised by a broker driver; the adapter normalizes
//!   them before anything reaches handler code
//! - **RegistrationError**: consumer registration attempted after consumption began
//! - **HandlerError**: the only failure signal a handler can return
//! - **ExportError**: telemetry exporter construction or export failures; these
//!   are logged and never abort the process
//!
//! Delivery outcomes are not errors; see [`crate::outcome::DeliveryOutcome`].

use std::time::Duration;

use thiserror::Error;

use crate::telemetry::{ExporterKind, SignalKind};

/// Startup configuration is missing or malformed.
///
/// A process that cannot reach its broker cannot fulfil its contract, so this
/// error is surfaced to `main` and turned into a non-zero exit code.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigurationError {
    /// A required key was absent or blank.
    #[error("missing required configuration value `{key}`")]
    MissingField {
        /// The configuration key that was expected
        key: String,
    },

    /// A key was present but its value could not be used.
    #[error("invalid value for `{key}`: {reason}")]
    InvalidValue {
        /// The offending configuration key
        key: String,
        /// Why the value was rejected
        reason: String,
    },
}

impl ConfigurationError {
    pub(crate) fn missing(key: &str) -> Self {
        Self::MissingField {
            key: key.to_string(),
        }
    }

    pub(crate) fn invalid(key: &str, reason: impl Into<String>) -> Self {
        Self::InvalidValue {
            key: key.to_string(),
            reason: reason.into(),
        }
    }
}

/// Result type for configuration loading.
pub type ConfigResult<T> = Result<T, ConfigurationError>;

/// Failures converting between envelopes, wire bytes, and payload types.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EnvelopeError {
    /// The envelope could not be encoded.
    #[error("envelope serialization failed: {0}")]
    Serialization(String),

    /// Bytes received from a broker are not a valid envelope.
    #[error("envelope deserialization failed: {0}")]
    Deserialization(String),

    /// The payload does not have the shape of the requested domain type.
    #[error("payload does not match {type_name}: {reason}")]
    PayloadMismatch {
        /// Rust type the payload was mapped to
        type_name: &'static str,
        /// Decoder message
        reason: String,
    },
}

/// Result type for envelope operations.
pub type EnvelopeResult<T> = Result<T, EnvelopeError>;

/// Publishing an envelope failed.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PublishError {
    /// The broker could not be reached. Transient.
    #[error("broker unreachable: {0}")]
    Unreachable(String),

    /// The broker refused the publish because of rate limits. Transient.
    #[error("broker throttled the publish (retry after {retry_after:?})")]
    Throttled {
        /// Hint from the broker, when it supplies one
        retry_after: Option<Duration>,
    },

    /// The envelope could not be encoded. Retrying cannot help.
    #[error("envelope could not be serialized: {0}")]
    Serialization(String),
}

impl PublishError {
    /// Whether a caller should retry this publish with backoff.
    pub const fn is_transient(&self) -> bool {
        matches!(self, Self::Unreachable(_) | Self::Throttled { .. })
    }

    /// Short, stable label used in logs and metrics.
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::Unreachable(_) => "unreachable",
            Self::Throttled { .. } => "throttled",
            Self::Serialization(_) => "serialization",
        }
    }
}

impl From<EnvelopeError> for PublishError {
    fn from(error: EnvelopeError) -> Self {
        Self::Serialization(error.to_string())
    }
}

/// Result type for publish operations.
pub type PublishResult<T> = Result<T, PublishError>;

/// Faults raised by a broker driver while receiving or settling messages.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    /// The connection to the broker dropped.
    #[error("connection to broker lost: {0}")]
    ConnectionLost(String),

    /// The destination does not exist on the broker.
    #[error("unknown destination `{0}`")]
    UnknownDestination(String),

    /// A settlement referred to a delivery the broker no longer holds a lease for.
    #[error("delivery {0} is no longer leased")]
    LeaseLost(u64),

    /// The transport has been shut down.
    #[error("transport closed")]
    Closed,
}

/// Result type for transport operations.
pub type TransportResult<T> = Result<T, TransportError>;

/// Consumer registration failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum RegistrationError {
    /// Registrations are sealed once dispatching starts.
    #[error("consumer registration is closed because the bus has started consuming")]
    RegistrationClosed,
}

/// The failure signal a handler returns.
///
/// Handlers never see transport errors; they only report whether they could
/// process the envelope.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum HandlerError {
    /// Processing failed and may succeed on redelivery.
    #[error("handler fault: {0}")]
    Fault(String),

    /// The message can never be processed. It is dead-lettered without retries.
    #[error("message rejected: {0}")]
    Rejected(String),
}

impl HandlerError {
    /// Creates a retryable fault.
    pub fn fault(message: impl Into<String>) -> Self {
        Self::Fault(message.into())
    }

    /// Creates a permanent rejection.
    pub fn rejected(message: impl Into<String>) -> Self {
        Self::Rejected(message.into())
    }
}

impl From<EnvelopeError> for HandlerError {
    fn from(error: EnvelopeError) -> Self {
        Self::Rejected(error.to_string())
    }
}

/// Result type for handler invocations.
pub type HandlerResult = Result<(), HandlerError>;

/// Telemetry exporter failures. Logged, never fatal.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ExportError {
    /// The exporter family does not carry this signal.
    #[error("{kind} exporter does not support {signal} signals")]
    Unsupported {
        /// Exporter family
        kind: ExporterKind,
        /// Requested signal
        signal: SignalKind,
    },

    /// Support for the exporter was not compiled into this build.
    #[error("{kind} exporter is not available; rebuild with the `{feature}` feature")]
    NotCompiled {
        /// Exporter family
        kind: ExporterKind,
        /// Cargo feature that enables it
        feature: &'static str,
    },

    /// No vendor factory was registered on the pipeline builder.
    #[error("no vendor-managed exporter factory has been registered")]
    NoVendorFactory,

    /// The exporter could not be built (bad endpoint, client setup failure, ...).
    #[error("failed to construct {kind} exporter: {reason}")]
    Construction {
        /// Exporter family
        kind: ExporterKind,
        /// Underlying failure
        reason: String,
    },

    /// A batch could not be delivered to the backend.
    #[error("{kind} export failed: {reason}")]
    Export {
        /// Exporter family
        kind: ExporterKind,
        /// Underlying failure
        reason: String,
    },
}

/// Result type for exporter operations.
pub type ExportResult<T> = Result<T, ExportError>;
