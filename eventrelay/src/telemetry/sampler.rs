//! Trace sampling policies.

use crate::correlation::{CorrelationContext, TraceId};

/// Decides whether a new span is recorded.
///
/// Exactly one policy is active per pipeline. Sampling is decided when a span
/// starts and the decision travels with the correlation context, so every
/// downstream process sees the same verdict for a trace.
#[derive(Debug, Clone, PartialEq, Default)]
pub enum SamplerPolicy {
    /// Record every span.
    #[default]
    AlwaysOn,
    /// Record nothing.
    AlwaysOff,
    /// Record a deterministic fraction of traces, keyed on the trace id.
    TraceIdRatio(f64),
    /// Follow the parent's decision; use the inner policy for root spans.
    ParentBased(Box<SamplerPolicy>),
}

impl SamplerPolicy {
    /// Parses the conventional sampler names (`always_on`, `always_off`,
    /// `traceidratio`, `parentbased_always_on`, `parentbased_always_off`,
    /// `parentbased_traceidratio`). Ratio samplers take `argument`, defaulting
    /// to 1.0 when it is missing or malformed.
    pub fn from_name(name: &str, argument: Option<&str>) -> Option<Self> {
        let ratio = || {
            argument
                .and_then(|value| value.trim().parse::<f64>().ok())
                .filter(|value| value.is_finite())
                .map_or(1.0, |value| value.clamp(0.0, 1.0))
        };

        match name.trim().to_ascii_lowercase().as_str() {
            "always_on" | "alwayson" => Some(Self::AlwaysOn),
            "always_off" | "alwaysoff" => Some(Self::AlwaysOff),
            "traceidratio" | "ratio" => Some(Self::TraceIdRatio(ratio())),
            "parentbased_always_on" => Some(Self::parent_based(Self::AlwaysOn)),
            "parentbased_always_off" => Some(Self::parent_based(Self::AlwaysOff)),
            "parentbased_traceidratio" => Some(Self::parent_based(Self::TraceIdRatio(ratio()))),
            _ => None,
        }
    }

    /// Wraps `root` so child spans inherit their parent's decision.
    pub fn parent_based(root: Self) -> Self {
        Self::ParentBased(Box::new(root))
    }

    /// Sampling verdict for a span in `trace_id` whose parent is `parent`.
    pub fn should_sample(&self, parent: Option<&CorrelationContext>, trace_id: TraceId) -> bool {
        match self {
            Self::AlwaysOn => true,
            Self::AlwaysOff => false,
            Self::TraceIdRatio(ratio) => ratio_admits(*ratio, trace_id),
            Self::ParentBased(root) => parent.map_or_else(
                || root.should_sample(None, trace_id),
                CorrelationContext::is_sampled,
            ),
        }
    }
}

fn ratio_admits(ratio: f64, trace_id: TraceId) -> bool {
    if ratio >= 1.0 {
        return true;
    }
    if ratio <= 0.0 || ratio.is_nan() {
        return false;
    }
    let threshold = (ratio * u64::MAX as f64) as u64;
    trace_id.low_bits() < threshold
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::correlation::SpanId;
    use proptest::prelude::*;

    fn trace(low: u64) -> TraceId {
        TraceId::from_u128((1u128 << 64) | u128::from(low)).unwrap()
    }

    #[test]
    fn parent_based_follows_the_parent() {
        let policy = SamplerPolicy::parent_based(SamplerPolicy::AlwaysOff);
        let sampled_parent =
            CorrelationContext::new(trace(1), SpanId::from_u64(1).unwrap(), true);

        assert!(policy.should_sample(Some(&sampled_parent), trace(1)));
        assert!(!policy.should_sample(None, trace(1)));
    }

    #[test]
    fn parses_conventional_names() {
        assert_eq!(
            SamplerPolicy::from_name("parentbased_traceidratio", Some("0.1")),
            Some(SamplerPolicy::parent_based(SamplerPolicy::TraceIdRatio(0.1)))
        );
        assert_eq!(
            SamplerPolicy::from_name("traceidratio", Some("7")),
            Some(SamplerPolicy::TraceIdRatio(1.0))
        );
        assert_eq!(
            SamplerPolicy::from_name("traceidratio", Some("half")),
            Some(SamplerPolicy::TraceIdRatio(1.0))
        );
        assert_eq!(SamplerPolicy::from_name("xray", None), None);
    }

    #[test]
    fn ratio_boundaries() {
        assert!(!SamplerPolicy::TraceIdRatio(0.0).should_sample(None, trace(0)));
        assert!(SamplerPolicy::TraceIdRatio(1.0).should_sample(None, trace(u64::MAX)));
        assert!(SamplerPolicy::TraceIdRatio(0.5).should_sample(None, trace(1)));
        assert!(!SamplerPolicy::TraceIdRatio(0.5).should_sample(None, trace(u64::MAX - 1)));
    }

    proptest! {
        #[test]
        fn ratio_decision_is_deterministic_per_trace(low in any::<u64>(), ratio in 0.0f64..=1.0) {
            let policy = SamplerPolicy::TraceIdRatio(ratio);
            prop_assert_eq!(
                policy.should_sample(None, trace(low)),
                policy.should_sample(None, trace(low))
            );
        }

        #[test]
        fn a_larger_ratio_never_samples_less(low in any::<u64>(), a in 0.0f64..=1.0, b in 0.0f64..=1.0) {
            let (small, large) = if a <= b { (a, b) } else { (b, a) };
            if SamplerPolicy::TraceIdRatio(small).should_sample(None, trace(low)) {
                prop_assert!(SamplerPolicy::TraceIdRatio(large).should_sample(None, trace(low)));
            }
        }
    }
}
