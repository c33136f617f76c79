//! Cross-process correlation context.
//!
//! A [`CorrelationContext`] is the token that lets one logical trace span a
//! publish in one process and the consume in another. It travels in
//! transport-native headers (never in the JSON body) using the W3C
//! `traceparent` encoding:
//!
//! ```text
//! 00-4bf92f3577b34da6a3ce929d0e0e4736-00f067aa0ba902b7-01
//! ^^ ^^^^^^^^^^^^^^^^^^^^^^^^^^^^^^^^ ^^^^^^^^^^^^^^^^ ^^
//! |  trace id                         parent span id   flags (01 = sampled)
//! version
//! ```
//!
//! Inside a process the context lives in a task-local scope. Anything running
//! inside [`CorrelationContext::scope`] can read it with
//! [`CorrelationContext::current`], which is how spans, log records and nested
//! publishes started by a handler link back to the message being processed.

use std::collections::BTreeMap;
use std::fmt;
use std::future::Future;

use serde::{Deserialize, Serialize};

/// W3C trace-context header.
pub const TRACEPARENT_HEADER: &str = "traceparent";
/// W3C vendor trace-state header.
pub const TRACESTATE_HEADER: &str = "tracestate";
/// Header used by Azure Service Bus and Event Hubs for the same value.
pub const DIAGNOSTIC_ID_HEADER: &str = "Diagnostic-Id";

const SUPPORTED_VERSION: &str = "00";
const FLAG_SAMPLED: u8 = 0x01;

tokio::task_local! {
    static CURRENT: CorrelationContext;
}

/// 128-bit trace identifier shared by every span of one logical operation.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TraceId(u128);

impl TraceId {
    /// Generates a random, non-zero trace id.
    pub fn random() -> Self {
        loop {
            let value = rand::random::<u128>();
            if value != 0 {
                return Self(value);
            }
        }
    }

    /// Wraps a raw value. Returns `None` for the invalid all-zero id.
    pub const fn from_u128(value: u128) -> Option<Self> {
        if value == 0 {
            None
        } else {
            Some(Self(value))
        }
    }

    /// Raw value.
    pub const fn to_u128(self) -> u128 {
        self.0
    }

    /// Big-endian bytes, as used by OTLP and Zipkin.
    pub const fn to_bytes(self) -> [u8; 16] {
        self.0.to_be_bytes()
    }

    /// The 64 low-order bits; ratio samplers decide on these.
    pub fn low_bits(self) -> u64 {
        let mut low = [0u8; 8];
        low.copy_from_slice(&self.0.to_be_bytes()[8..]);
        u64::from_be_bytes(low)
    }

    /// Parses 32 lowercase hex digits.
    pub fn from_hex(value: &str) -> Option<Self> {
        parse_hex::<16>(value).and_then(|raw| Self::from_u128(u128::from_be_bytes(raw)))
    }
}

impl fmt::Display for TraceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:032x}", self.0)
    }
}

impl fmt::Debug for TraceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "TraceId({self})")
    }
}

/// 64-bit span identifier, unique within a trace.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SpanId(u64);

impl SpanId {
    /// Generates a random, non-zero span id.
    pub fn random() -> Self {
        loop {
            let value = rand::random::<u64>();
            if value != 0 {
                return Self(value);
            }
        }
    }

    /// Wraps a raw value. Returns `None` for the invalid all-zero id.
    pub const fn from_u64(value: u64) -> Option<Self> {
        if value == 0 {
            None
        } else {
            Some(Self(value))
        }
    }

    /// Raw value.
    pub const fn to_u64(self) -> u64 {
        self.0
    }

    /// Big-endian bytes.
    pub const fn to_bytes(self) -> [u8; 8] {
        self.0.to_be_bytes()
    }

    /// Parses 16 lowercase hex digits.
    pub fn from_hex(value: &str) -> Option<Self> {
        parse_hex::<8>(value).and_then(|raw| Self::from_u64(u64::from_be_bytes(raw)))
    }
}

impl fmt::Display for SpanId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:016x}", self.0)
    }
}

impl fmt::Debug for SpanId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SpanId({self})")
    }
}

fn parse_hex<const N: usize>(value: &str) -> Option<[u8; N]> {
    let bytes = value.as_bytes();
    if bytes.len() != N * 2 {
        return None;
    }
    let mut out = [0u8; N];
    for (slot, pair) in out.iter_mut().zip(bytes.chunks_exact(2)) {
        *slot = (hex_digit(pair[0])? << 4) | hex_digit(pair[1])?;
    }
    Some(out)
}

const fn hex_digit(byte: u8) -> Option<u8> {
    match byte {
        b'0'..=b'9' => Some(byte - b'0'),
        b'a'..=b'f' => Some(byte - b'a' + 10),
        _ => None,
    }
}

/// How a transport carries the correlation token in its native headers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum PropagationStyle {
    /// `traceparent` / `tracestate` headers (AMQP application headers).
    #[default]
    W3c,
    /// `Diagnostic-Id` application property (Azure Service Bus, Event Hubs).
    DiagnosticId,
}

impl PropagationStyle {
    /// Header that carries the `traceparent` value for this style.
    pub const fn header_name(self) -> &'static str {
        match self {
            Self::W3c => TRACEPARENT_HEADER,
            Self::DiagnosticId => DIAGNOSTIC_ID_HEADER,
        }
    }
}

/// Transport-native message headers / application properties.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageHeaders(BTreeMap<String, String>);

impl MessageHeaders {
    /// Creates an empty header set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets a header, replacing any previous value.
    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.0.insert(key.into(), value.into());
    }

    /// Looks up a header by exact name.
    pub fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).map(String::as_str)
    }

    /// Removes a header, returning its value.
    pub fn remove(&mut self, key: &str) -> Option<String> {
        self.0.remove(key)
    }

    /// Iterates over all headers in key order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    /// Number of headers.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Whether there are no headers.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for MessageHeaders {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Self(
            iter.into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        )
    }
}

/// The cross-process token identifying one position in a trace.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CorrelationContext {
    trace_id: TraceId,
    span_id: SpanId,
    sampled: bool,
    trace_state: Option<String>,
}

impl CorrelationContext {
    /// Assembles a context from its parts.
    pub const fn new(trace_id: TraceId, span_id: SpanId, sampled: bool) -> Self {
        Self {
            trace_id,
            span_id,
            sampled,
            trace_state: None,
        }
    }

    /// Starts a new trace.
    pub fn new_root(sampled: bool) -> Self {
        Self::new(TraceId::random(), SpanId::random(), sampled)
    }

    /// A new span position in the same trace, inheriting sampling and state.
    #[must_use]
    pub fn child(&self) -> Self {
        Self {
            trace_id: self.trace_id,
            span_id: SpanId::random(),
            sampled: self.sampled,
            trace_state: self.trace_state.clone(),
        }
    }

    /// Replaces the sampling decision.
    #[must_use]
    pub fn with_sampled(mut self, sampled: bool) -> Self {
        self.sampled = sampled;
        self
    }

    /// Attaches vendor trace state.
    #[must_use]
    pub fn with_trace_state(mut self, trace_state: impl Into<String>) -> Self {
        self.trace_state = Some(trace_state.into());
        self
    }

    /// Trace id.
    pub const fn trace_id(&self) -> TraceId {
        self.trace_id
    }

    /// Span id.
    pub const fn span_id(&self) -> SpanId {
        self.span_id
    }

    /// Whether spans in this trace are recorded.
    pub const fn is_sampled(&self) -> bool {
        self.sampled
    }

    /// Vendor trace state, if any.
    pub fn trace_state(&self) -> Option<&str> {
        self.trace_state.as_deref()
    }

    /// Encodes as a W3C `traceparent` value.
    pub fn to_traceparent(&self) -> String {
        let flags = if self.sampled { FLAG_SAMPLED } else { 0 };
        format!(
            "{SUPPORTED_VERSION}-{}-{}-{flags:02x}",
            self.trace_id, self.span_id
        )
    }

    /// Decodes a W3C `traceparent` value. Invalid values yield `None`.
    pub fn from_traceparent(value: &str) -> Option<Self> {
        let mut parts = value.trim().split('-');
        let version = parts.next()?;
        let trace_id = TraceId::from_hex(parts.next()?)?;
        let span_id = SpanId::from_hex(parts.next()?)?;
        let flags = parse_hex::<1>(parts.next()?)?[0];

        if version.len() != 2 || version == "ff" || parse_hex::<1>(version).is_none() {
            return None;
        }
        // Version 00 has exactly four fields; later versions may append more.
        if version == SUPPORTED_VERSION && parts.next().is_some() {
            return None;
        }

        Some(Self::new(trace_id, span_id, flags & FLAG_SAMPLED != 0))
    }

    /// Writes this context into transport headers.
    pub fn inject(&self, headers: &mut MessageHeaders, style: PropagationStyle) {
        headers.insert(style.header_name(), self.to_traceparent());
        if let Some(state) = &self.trace_state {
            headers.insert(TRACESTATE_HEADER, state.clone());
        }
    }

    /// Reads a context from transport headers.
    ///
    /// Both the W3C header and `Diagnostic-Id` are accepted so a consumer does
    /// not need to know which style the producer used.
    pub fn extract(headers: &MessageHeaders) -> Option<Self> {
        let parent = headers
            .get(TRACEPARENT_HEADER)
            .or_else(|| headers.get(DIAGNOSTIC_ID_HEADER))
            .and_then(Self::from_traceparent)?;

        Some(match headers.get(TRACESTATE_HEADER) {
            Some(state) if !state.trim().is_empty() => parent.with_trace_state(state.trim()),
            _ => parent,
        })
    }

    /// The context of the enclosing [`scope`](Self::scope), if any.
    pub fn current() -> Option<Self> {
        CURRENT.try_with(Clone::clone).ok()
    }

    /// Runs `future` with this context as the ambient correlation.
    pub async fn scope<F>(self, future: F) -> F::Output
    where
        F: Future,
    {
        CURRENT.scope(self, future).await
    }
}

impl fmt::Display for CorrelationContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_traceparent())
    }
}
