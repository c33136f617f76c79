//! Configuration sources and broker connection settings.
//!
//! Broker settings are loaded fail-fast: a process without a usable broker
//! cannot do its job, so a missing or malformed value surfaces as a
//! [`ConfigurationError`] naming the offending key. Telemetry settings are
//! the opposite and never fail (see [`crate::telemetry::TelemetrySettings`]).

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use nutype::nutype;
use serde::{Deserialize, Serialize};

use crate::broker::Destination;
use crate::correlation::PropagationStyle;
use crate::errors::{ConfigResult, ConfigurationError};

/// A flat key/value configuration source.
pub trait ConfigSource: Send + Sync {
    /// Raw value for `key`.
    fn get(&self, key: &str) -> Option<String>;

    /// Trimmed value for `key`; blank values count as absent.
    fn value(&self, key: &str) -> Option<String> {
        self.get(key)
            .map(|value| value.trim().to_string())
            .filter(|value| !value.is_empty())
    }
}

/// Reads the process environment.
#[derive(Debug, Clone, Copy, Default)]
pub struct EnvSource;

impl ConfigSource for EnvSource {
    fn get(&self, key: &str) -> Option<String> {
        std::env::var(key).ok()
    }
}

/// In-memory source, mostly for tests.
#[derive(Debug, Clone, Default)]
pub struct MapSource(HashMap<String, String>);

impl MapSource {
    /// Creates an empty source.
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds or replaces a value.
    #[must_use]
    pub fn with(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.0.insert(key.into(), value.into());
        self
    }
}

impl<K, V> FromIterator<(K, V)> for MapSource
where
    K: Into<String>,
    V: Into<String>,
{
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Self(
            iter.into_iter()
                .map(|(key, value)| (key.into(), value.into()))
                .collect(),
        )
    }
}

impl ConfigSource for MapSource {
    fn get(&self, key: &str) -> Option<String> {
        self.0.get(key).cloned()
    }
}

/// Maximum number of messages dispatched concurrently per destination.
#[nutype(
    validate(greater_or_equal = 1, less_or_equal = 1024),
    default = 16,
    derive(
        Debug,
        Clone,
        Copy,
        PartialEq,
        Eq,
        PartialOrd,
        Ord,
        Default,
        Into,
        Serialize,
        Deserialize
    )
)]
pub struct MaxInFlight(usize);

/// Delivery attempts before a faulting message is dead-lettered.
#[nutype(
    validate(greater_or_equal = 1, less_or_equal = 100),
    default = 3,
    derive(
        Debug,
        Clone,
        Copy,
        PartialEq,
        Eq,
        PartialOrd,
        Ord,
        Default,
        Into,
        Serialize,
        Deserialize
    )
)]
pub struct MaxDeliveryAttempts(u32);

/// Broker families a bus can be configured for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum BrokerProvider {
    /// AMQP 0-9-1 broker
    #[default]
    RabbitMq,
    /// Azure Service Bus queues and topics
    AzureServiceBus,
    /// Azure Event Hubs
    EventHub,
}

impl BrokerProvider {
    /// Header style the provider's SDK uses for trace propagation.
    pub const fn propagation_style(self) -> PropagationStyle {
        match self {
            Self::RabbitMq => PropagationStyle::W3c,
            Self::AzureServiceBus | Self::EventHub => PropagationStyle::DiagnosticId,
        }
    }
}

impl fmt::Display for BrokerProvider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::RabbitMq => "rabbitmq",
            Self::AzureServiceBus => "azureservicebus",
            Self::EventHub => "eventhub",
        })
    }
}

impl FromStr for BrokerProvider {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized: String = s
            .trim()
            .chars()
            .filter(|c| !matches!(c, '-' | '_' | ' '))
            .collect::<String>()
            .to_ascii_lowercase();
        match normalized.as_str() {
            "rabbitmq" | "amqp" => Ok(Self::RabbitMq),
            "azureservicebus" | "servicebus" => Ok(Self::AzureServiceBus),
            "eventhub" | "eventhubs" => Ok(Self::EventHub),
            _ => Err(format!(
                "unknown broker provider `{s}`; expected rabbitmq, azureservicebus or eventhub"
            )),
        }
    }
}

/// A credential whose value never appears in `Debug` output.
#[derive(Clone, PartialEq, Eq)]
pub struct Secret(String);

impl Secret {
    /// Wraps a credential.
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    /// The credential itself, for handing to a driver.
    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Secret(***)")
    }
}

/// Provider-specific connection details.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BrokerConnection {
    /// RabbitMQ host and credentials
    RabbitMq {
        /// Broker host name
        host: String,
        /// AMQP port
        port: u16,
        /// User name
        username: String,
        /// Password
        password: Secret,
        /// Virtual host
        virtual_host: String,
    },
    /// Azure Service Bus namespace
    AzureServiceBus {
        /// Namespace connection string
        connection_string: Secret,
    },
    /// Azure Event Hubs namespace
    EventHub {
        /// Namespace connection string
        connection_string: Secret,
    },
}

impl BrokerConnection {
    /// Provider this connection belongs to.
    pub const fn provider(&self) -> BrokerProvider {
        match self {
            Self::RabbitMq { .. } => BrokerProvider::RabbitMq,
            Self::AzureServiceBus { .. } => BrokerProvider::AzureServiceBus,
            Self::EventHub { .. } => BrokerProvider::EventHub,
        }
    }
}

/// How each subscription consumes its destination.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConsumerSettings {
    /// In-flight dispatch limit per destination
    pub max_in_flight: MaxInFlight,
    /// Execution budget for one handler invocation
    pub handler_timeout: Duration,
    /// Attempts before a faulting message is dead-lettered
    pub max_delivery_attempts: MaxDeliveryAttempts,
    /// How long in-flight handlers may keep running after shutdown starts
    pub shutdown_grace: Duration,
}

impl Default for ConsumerSettings {
    fn default() -> Self {
        Self {
            max_in_flight: MaxInFlight::default(),
            handler_timeout: Duration::from_secs(30),
            max_delivery_attempts: MaxDeliveryAttempts::default(),
            shutdown_grace: Duration::from_secs(10),
        }
    }
}

/// Everything needed to connect to a broker and consume from it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BusSettings {
    /// Provider connection
    pub connection: BrokerConnection,
    /// Destinations to subscribe to
    pub destinations: Vec<Destination>,
    /// Consumer tuning
    pub consumer: ConsumerSettings,
}

impl BusSettings {
    /// Loads broker settings from `source`.
    ///
    /// # Errors
    ///
    /// [`ConfigurationError::MissingField`] for an absent required key and
    /// [`ConfigurationError::InvalidValue`] for a value that cannot be used.
    pub fn load(source: &dyn ConfigSource) -> ConfigResult<Self> {
        let provider = parsed_or(source, "EVENTBUS_PROVIDER", BrokerProvider::RabbitMq)?;
        let connection = match provider {
            BrokerProvider::RabbitMq => BrokerConnection::RabbitMq {
                host: required(source, "EVENTBUS_RABBITMQ_HOST")?,
                port: parsed_or(source, "EVENTBUS_RABBITMQ_PORT", 5672)?,
                username: required(source, "EVENTBUS_RABBITMQ_USERNAME")?,
                password: Secret::new(required(source, "EVENTBUS_RABBITMQ_PASSWORD")?),
                virtual_host: source
                    .value("EVENTBUS_RABBITMQ_VIRTUAL_HOST")
                    .unwrap_or_else(|| "/".to_string()),
            },
            BrokerProvider::AzureServiceBus => BrokerConnection::AzureServiceBus {
                connection_string: Secret::new(required(
                    source,
                    "EVENTBUS_SERVICEBUS_CONNECTION_STRING",
                )?),
            },
            BrokerProvider::EventHub => BrokerConnection::EventHub {
                connection_string: Secret::new(required(
                    source,
                    "EVENTBUS_EVENTHUB_CONNECTION_STRING",
                )?),
            },
        };

        let destinations = required(source, "EVENTBUS_DESTINATIONS")?
            .split(',')
            .map(str::trim)
            .filter(|entry| !entry.is_empty())
            .map(|entry| {
                entry
                    .parse::<Destination>()
                    .map_err(|reason| ConfigurationError::invalid("EVENTBUS_DESTINATIONS", reason))
            })
            .collect::<ConfigResult<Vec<_>>>()?;
        if destinations.is_empty() {
            return Err(ConfigurationError::missing("EVENTBUS_DESTINATIONS"));
        }

        Ok(Self {
            connection,
            destinations,
            consumer: ConsumerSettings::load(source)?,
        })
    }

    /// Provider of the configured connection.
    pub const fn provider(&self) -> BrokerProvider {
        self.connection.provider()
    }
}

impl ConsumerSettings {
    /// Loads consumer tuning, defaulting every absent key.
    pub fn load(source: &dyn ConfigSource) -> ConfigResult<Self> {
        let defaults = Self::default();
        let max_in_flight = match source.value("EVENTBUS_MAX_IN_FLIGHT") {
            Some(raw) => MaxInFlight::try_new(parse("EVENTBUS_MAX_IN_FLIGHT", &raw)?)
                .map_err(|e| ConfigurationError::invalid("EVENTBUS_MAX_IN_FLIGHT", e.to_string()))?,
            None => defaults.max_in_flight,
        };
        let max_delivery_attempts = match source.value("EVENTBUS_MAX_DELIVERY_ATTEMPTS") {
            Some(raw) => MaxDeliveryAttempts::try_new(parse("EVENTBUS_MAX_DELIVERY_ATTEMPTS", &raw)?)
                .map_err(|e| {
                    ConfigurationError::invalid("EVENTBUS_MAX_DELIVERY_ATTEMPTS", e.to_string())
                })?,
            None => defaults.max_delivery_attempts,
        };
        let handler_timeout = millis_or(source, "EVENTBUS_HANDLER_TIMEOUT_MS", defaults.handler_timeout)?;
        if handler_timeout.is_zero() {
            return Err(ConfigurationError::invalid(
                "EVENTBUS_HANDLER_TIMEOUT_MS",
                "must be greater than zero",
            ));
        }

        Ok(Self {
            max_in_flight,
            handler_timeout,
            max_delivery_attempts,
            shutdown_grace: millis_or(source, "EVENTBUS_SHUTDOWN_GRACE_MS", defaults.shutdown_grace)?,
        })
    }
}

fn required(source: &dyn ConfigSource, key: &str) -> ConfigResult<String> {
    source.value(key).ok_or_else(|| ConfigurationError::missing(key))
}

fn parse<T>(key: &str, raw: &str) -> ConfigResult<T>
where
    T: FromStr,
    T::Err: fmt::Display,
{
    raw.parse()
        .map_err(|e: T::Err| ConfigurationError::invalid(key, e.to_string()))
}

fn parsed_or<T>(source: &dyn ConfigSource, key: &str, default: T) -> ConfigResult<T>
where
    T: FromStr,
    T::Err: fmt::Display,
{
    source
        .value(key)
        .map_or(Ok(default), |raw| parse(key, &raw))
}

fn millis_or(source: &dyn ConfigSource, key: &str, default: Duration) -> ConfigResult<Duration> {
    source
        .value(key)
        .map_or(Ok(default), |raw| parse(key, &raw).map(Duration::from_millis))
}
