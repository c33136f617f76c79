//! Delivery outcomes: what a transport should do with a message.

use std::fmt;

/// Why a message should be redelivered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RetryReason {
    /// The handler returned a fault or panicked
    HandlerFault,
    /// The handler exceeded its execution budget
    Timeout,
}

impl RetryReason {
    /// Stable label for logs, metrics and dead-letter properties.
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::HandlerFault => "HandlerFault",
            Self::Timeout => "Timeout",
        }
    }
}

impl fmt::Display for RetryReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why a message was moved to the dead-letter destination.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DeadLetterReason {
    /// The body is not a valid envelope
    Serialization,
    /// No consumer is registered for the event type
    NoHandler,
    /// The handler kept failing until the attempt ceiling
    MaxRetriesExceeded,
    /// The handler declared the message permanently unprocessable
    HandlerRejected,
}

impl DeadLetterReason {
    /// Stable label for logs, metrics and dead-letter properties.
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Serialization => "Serialization",
            Self::NoHandler => "NoHandler",
            Self::MaxRetriesExceeded => "MaxRetriesExceeded",
            Self::HandlerRejected => "HandlerRejected",
        }
    }
}

impl fmt::Display for DeadLetterReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Result of dispatching one message.
///
/// `Acknowledged` and `DeadLettered` are terminal and settle the message;
/// `Retry` leaves it for the broker to redeliver.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeliveryOutcome {
    /// Every handler succeeded
    Acknowledged,
    /// Redeliver later
    Retry {
        /// Category
        reason: RetryReason,
        /// Human-readable detail
        description: String,
    },
    /// Move to the dead-letter destination
    DeadLettered {
        /// Category
        reason: DeadLetterReason,
        /// Human-readable detail
        description: String,
    },
}

impl DeliveryOutcome {
    /// Builds a `Retry` outcome.
    pub fn retry(reason: RetryReason, description: impl Into<String>) -> Self {
        Self::Retry {
            reason,
            description: description.into(),
        }
    }

    /// Builds a `DeadLettered` outcome.
    pub fn dead_lettered(reason: DeadLetterReason, description: impl Into<String>) -> Self {
        Self::DeadLettered {
            reason,
            description: description.into(),
        }
    }

    /// Whether the transport may settle the message.
    pub const fn is_terminal(&self) -> bool {
        !matches!(self, Self::Retry { .. })
    }

    /// Retry category, if this is a retry.
    pub const fn retry_reason(&self) -> Option<RetryReason> {
        match self {
            Self::Retry { reason, .. } => Some(*reason),
            _ => None,
        }
    }

    /// Dead-letter category, if this is a dead-letter.
    pub const fn dead_letter_reason(&self) -> Option<DeadLetterReason> {
        match self {
            Self::DeadLettered { reason, .. } => Some(*reason),
            _ => None,
        }
    }

    /// Metric label: `acknowledged`, `retry` or `dead_lettered`.
    pub const fn label(&self) -> &'static str {
        match self {
            Self::Acknowledged => "acknowledged",
            Self::Retry { .. } => "retry",
            Self::DeadLettered { .. } => "dead_lettered",
        }
    }

    const fn severity(&self) -> u8 {
        match self {
            Self::Acknowledged => 0,
            Self::DeadLettered { .. } => 1,
            Self::Retry { .. } => 2,
        }
    }

    /// The less successful of two outcomes. On a tie the first one wins.
    #[must_use]
    pub fn combine(self, other: Self) -> Self {
        if other.severity() > self.severity() {
            other
        } else {
            self
        }
    }

    /// Combines the outcomes of several handlers for one message.
    ///
    /// Any `Retry` keeps the message unacknowledged; otherwise any
    /// `DeadLettered` wins over `Acknowledged`.
    pub fn least_successful(outcomes: impl IntoIterator<Item = Self>) -> Self {
        outcomes
            .into_iter()
            .reduce(Self::combine)
            .unwrap_or(Self::Acknowledged)
    }
}

impl fmt::Display for DeliveryOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Acknowledged => f.write_str("Acknowledged"),
            Self::Retry { reason, .. } => write!(f, "Retry({reason})"),
            Self::DeadLettered { reason, .. } => write!(f, "DeadLettered({reason})"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn arb_outcome() -> impl Strategy<Value = DeliveryOutcome> {
        prop_oneof![
            Just(DeliveryOutcome::Acknowledged),
            prop_oneof![Just(RetryReason::HandlerFault), Just(RetryReason::Timeout)]
                .prop_map(|reason| DeliveryOutcome::retry(reason, "r")),
            prop_oneof![
                Just(DeadLetterReason::Serialization),
                Just(DeadLetterReason::NoHandler),
                Just(DeadLetterReason::MaxRetriesExceeded),
                Just(DeadLetterReason::HandlerRejected),
            ]
            .prop_map(|reason| DeliveryOutcome::dead_lettered(reason, "d")),
        ]
    }

    #[test]
    fn retry_beats_dead_letter_beats_ack() {
        let ack = DeliveryOutcome::Acknowledged;
        let dead = DeliveryOutcome::dead_lettered(DeadLetterReason::HandlerRejected, "bad");
        let retry = DeliveryOutcome::retry(RetryReason::Timeout, "slow");

        assert_eq!(
            DeliveryOutcome::least_successful([ack.clone(), dead.clone()]),
            dead
        );
        assert_eq!(
            DeliveryOutcome::least_successful([dead, retry.clone(), ack]),
            retry
        );
    }

    #[test]
    fn no_outcomes_means_acknowledged() {
        assert_eq!(
            DeliveryOutcome::least_successful(std::iter::empty()),
            DeliveryOutcome::Acknowledged
        );
    }

    #[test]
    fn display_shows_the_reason() {
        let outcome = DeliveryOutcome::dead_lettered(DeadLetterReason::NoHandler, "none");

        assert_eq!(outcome.to_string(), "DeadLettered(NoHandler)");
        assert!(outcome.is_terminal());
        assert!(!DeliveryOutcome::retry(RetryReason::HandlerFault, "x").is_terminal());
    }

    proptest! {
        #[test]
        fn any_retry_prevents_acknowledgement(outcomes in prop::collection::vec(arb_outcome(), 1..8)) {
            let combined = DeliveryOutcome::least_successful(outcomes.clone());
            let has_retry = outcomes.iter().any(|o| !o.is_terminal());

            prop_assert_eq!(!combined.is_terminal(), has_retry);
            prop_assert!(outcomes.iter().all(|o| o.severity() <= combined.severity()));
        }
    }
}
