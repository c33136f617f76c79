//! Counters and histograms.
//!
//! Instruments aggregate in process; exporters receive cumulative snapshots on
//! every flush. Histogram aggregation is chosen once for the whole pipeline.

use std::collections::BTreeMap;
use std::sync::Arc;

use parking_lot::Mutex;

use super::options::HistogramAggregation;
use super::records::{Attributes, HistogramBuckets, HistogramData, MetricData, MetricPoint};
use crate::types::Timestamp;

/// Default explicit bucket boundaries, in the instrument's unit.
pub const DEFAULT_BOUNDARIES: [f64; 15] = [
    0.0, 5.0, 10.0, 25.0, 50.0, 75.0, 100.0, 250.0, 500.0, 750.0, 1000.0, 2500.0, 5000.0,
    7500.0, 10000.0,
];

/// Finest resolution an exponential histogram starts at.
pub const MAX_SCALE: i32 = 20;
/// Coarsest resolution an exponential histogram may fall back to.
pub const MIN_SCALE: i32 = -10;
/// Most buckets an exponential histogram keeps before downscaling.
pub const MAX_BUCKETS: usize = 160;

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
struct SeriesKey {
    name: String,
    labels: Attributes,
}

#[derive(Debug)]
struct Series {
    source: Arc<str>,
    unit: String,
    aggregator: Aggregator,
}

#[derive(Debug)]
enum Aggregator {
    Sum(u64),
    Explicit(ExplicitHistogram),
    Exponential(ExponentialHistogram),
}

/// Pipeline-owned store every instrument writes into.
#[derive(Debug)]
pub(crate) struct MetricStore {
    aggregation: HistogramAggregation,
    series: Mutex<BTreeMap<SeriesKey, Series>>,
}

impl MetricStore {
    pub(crate) fn new(aggregation: HistogramAggregation) -> Self {
        Self {
            aggregation,
            series: Mutex::new(BTreeMap::new()),
        }
    }

    fn add(&self, source: &Arc<str>, name: &str, value: u64, labels: &[(&str, &str)]) {
        let mut series = self.series.lock();
        let entry = series.entry(key(name, labels)).or_insert_with(|| Series {
            source: Arc::clone(source),
            unit: String::new(),
            aggregator: Aggregator::Sum(0),
        });
        if let Aggregator::Sum(total) = &mut entry.aggregator {
            *total = total.saturating_add(value);
        }
    }

    fn record(&self, source: &Arc<str>, name: &str, unit: &str, value: f64, labels: &[(&str, &str)]) {
        if !value.is_finite() {
            return;
        }
        let aggregation = self.aggregation;
        let mut series = self.series.lock();
        let entry = series.entry(key(name, labels)).or_insert_with(|| Series {
            source: Arc::clone(source),
            unit: unit.to_string(),
            aggregator: match aggregation {
                HistogramAggregation::Explicit => {
                    Aggregator::Explicit(ExplicitHistogram::new(DEFAULT_BOUNDARIES.to_vec()))
                }
                HistogramAggregation::Exponential => {
                    Aggregator::Exponential(ExponentialHistogram::new())
                }
            },
        });
        match &mut entry.aggregator {
            Aggregator::Explicit(histogram) => histogram.record(value),
            Aggregator::Exponential(histogram) => histogram.record(value),
            Aggregator::Sum(_) => {}
        }
    }

    /// Cumulative snapshot of every series.
    pub(crate) fn collect(&self) -> Vec<MetricPoint> {
        let timestamp = Timestamp::now();
        self.series
            .lock()
            .iter()
            .map(|(key, series)| MetricPoint {
                name: key.name.clone(),
                unit: series.unit.clone(),
                source: series.source.to_string(),
                labels: key.labels.clone(),
                timestamp,
                data: match &series.aggregator {
                    Aggregator::Sum(total) => MetricData::Sum(*total),
                    Aggregator::Explicit(histogram) => MetricData::Histogram(histogram.snapshot()),
                    Aggregator::Exponential(histogram) => {
                        MetricData::Histogram(histogram.snapshot())
                    }
                },
            })
            .collect()
    }
}

fn key(name: &str, labels: &[(&str, &str)]) -> SeriesKey {
    let mut labels: Attributes = labels
        .iter()
        .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
        .collect();
    labels.sort();
    SeriesKey {
        name: name.to_string(),
        labels,
    }
}

/// Creates instruments for one instrumentation source.
///
/// A meter for a source the pipeline does not subscribe to is inert: its
/// instruments accept values and drop them.
#[derive(Debug, Clone)]
pub struct Meter {
    source: Arc<str>,
    store: Option<Arc<MetricStore>>,
}

impl Meter {
    pub(crate) fn new(source: &str, store: Option<Arc<MetricStore>>) -> Self {
        Self {
            source: Arc::from(source),
            store,
        }
    }

    /// A meter that records nothing.
    pub fn noop(source: &str) -> Self {
        Self::new(source, None)
    }

    /// Whether values recorded through this meter reach the pipeline.
    pub const fn is_enabled(&self) -> bool {
        self.store.is_some()
    }

    /// Monotonic counter.
    pub fn counter(&self, name: &str) -> Counter {
        Counter {
            meter: self.clone(),
            name: name.to_string(),
        }
    }

    /// Histogram of values measured in `unit`.
    pub fn histogram(&self, name: &str, unit: &str) -> Histogram {
        Histogram {
            meter: self.clone(),
            name: name.to_string(),
            unit: unit.to_string(),
        }
    }
}

/// Monotonic counter instrument.
#[derive(Debug, Clone)]
pub struct Counter {
    meter: Meter,
    name: String,
}

impl Counter {
    /// Adds `value` to the series identified by `labels`.
    pub fn add(&self, value: u64, labels: &[(&str, &str)]) {
        if let Some(store) = &self.meter.store {
            store.add(&self.meter.source, &self.name, value, labels);
        }
    }
}

/// Histogram instrument.
#[derive(Debug, Clone)]
pub struct Histogram {
    meter: Meter,
    name: String,
    unit: String,
}

impl Histogram {
    /// Records one measurement. Non-finite values are ignored.
    pub fn record(&self, value: f64, labels: &[(&str, &str)]) {
        if let Some(store) = &self.meter.store {
            store.record(&self.meter.source, &self.name, &self.unit, value, labels);
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct Stats {
    count: u64,
    sum: f64,
    min: f64,
    max: f64,
}

impl Stats {
    const fn new() -> Self {
        Self {
            count: 0,
            sum: 0.0,
            min: f64::INFINITY,
            max: f64::NEG_INFINITY,
        }
    }

    fn observe(&mut self, value: f64) {
        self.count += 1;
        self.sum += value;
        self.min = self.min.min(value);
        self.max = self.max.max(value);
    }

    fn into_data(self, buckets: HistogramBuckets) -> HistogramData {
        HistogramData {
            count: self.count,
            sum: self.sum,
            min: if self.count == 0 { 0.0 } else { self.min },
            max: if self.count == 0 { 0.0 } else { self.max },
            buckets,
        }
    }
}

/// Fixed-boundary histogram; bucket `i` counts values in `(bounds[i-1], bounds[i]]`.
#[derive(Debug, Clone)]
struct ExplicitHistogram {
    bounds: Vec<f64>,
    counts: Vec<u64>,
    stats: Stats,
}

impl ExplicitHistogram {
    fn new(bounds: Vec<f64>) -> Self {
        let counts = vec![0; bounds.len() + 1];
        Self {
            bounds,
            counts,
            stats: Stats::new(),
        }
    }

    fn record(&mut self, value: f64) {
        let index = self.bounds.partition_point(|bound| *bound < value);
        self.counts[index] += 1;
        self.stats.observe(value);
    }

    fn snapshot(&self) -> HistogramData {
        self.stats.into_data(HistogramBuckets::Explicit {
            bounds: self.bounds.clone(),
            counts: self.counts.clone(),
        })
    }
}

/// Base-2 exponential histogram over positive values.
///
/// Starts at [`MAX_SCALE`] and halves its resolution whenever the span of
/// occupied buckets would exceed [`MAX_BUCKETS`].
#[derive(Debug, Clone)]
struct ExponentialHistogram {
    scale: i32,
    zero_count: u64,
    offset: i32,
    counts: Vec<u64>,
    stats: Stats,
}

impl ExponentialHistogram {
    const fn new() -> Self {
        Self {
            scale: MAX_SCALE,
            zero_count: 0,
            offset: 0,
            counts: Vec::new(),
            stats: Stats::new(),
        }
    }

    fn record(&mut self, value: f64) {
        self.stats.observe(value);
        if value <= 0.0 {
            self.zero_count += 1;
            return;
        }

        let mut index = bucket_index(value, self.scale);
        if self.counts.is_empty() {
            self.offset = index;
            self.counts.push(1);
            return;
        }

        let high = self.offset + last_index(&self.counts);
        let mut low = self.offset.min(index);
        let mut top = high.max(index);
        let mut change = 0;
        while span(low, top) > MAX_BUCKETS && self.scale - change > MIN_SCALE {
            low >>= 1;
            top >>= 1;
            change += 1;
        }
        if change > 0 {
            self.downscale(change);
            index >>= change;
        }

        if index < self.offset {
            let missing = usize::try_from(self.offset - index).unwrap_or(0);
            let mut grown = vec![0; missing];
            grown.append(&mut self.counts);
            self.counts = grown;
            self.offset = index;
        }
        let position = usize::try_from(index - self.offset).unwrap_or(0);
        if position >= self.counts.len() {
            self.counts.resize(position + 1, 0);
        }
        self.counts[position] += 1;
    }

    fn downscale(&mut self, change: i32) {
        let new_offset = self.offset >> change;
        let mut merged: Vec<u64> = Vec::new();
        for (i, count) in self.counts.iter().enumerate() {
            let index = (self.offset + to_i32(i)) >> change;
            let position = usize::try_from(index - new_offset).unwrap_or(0);
            if position >= merged.len() {
                merged.resize(position + 1, 0);
            }
            merged[position] += count;
        }
        self.offset = new_offset;
        self.counts = merged;
        self.scale -= change;
    }

    fn snapshot(&self) -> HistogramData {
        self.stats.into_data(HistogramBuckets::Exponential {
            scale: self.scale,
            zero_count: self.zero_count,
            offset: self.offset,
            counts: self.counts.clone(),
        })
    }
}

/// Index of the bucket `(base^i, base^(i+1)]` holding `value` at `scale`.
fn bucket_index(value: f64, scale: i32) -> i32 {
    let scaled = value.log2() * 2f64.powi(scale);
    (scaled.ceil() as i32).saturating_sub(1)
}

fn last_index(counts: &[u64]) -> i32 {
    to_i32(counts.len().saturating_sub(1))
}

fn to_i32(value: usize) -> i32 {
    i32::try_from(value).unwrap_or(i32::MAX)
}

fn span(low: i32, high: i32) -> usize {
    usize::try_from(i64::from(high) - i64::from(low) + 1).unwrap_or(usize::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn store(aggregation: HistogramAggregation) -> Arc<MetricStore> {
        Arc::new(MetricStore::new(aggregation))
    }

    #[test]
    fn counters_accumulate_per_label_set() {
        let store = store(HistogramAggregation::Explicit);
        let counter = Meter::new("eventrelay", Some(Arc::clone(&store))).counter("messages");

        counter.add(1, &[("outcome", "acknowledged"), ("event_type", "A")]);
        counter.add(2, &[("event_type", "A"), ("outcome", "acknowledged")]);
        counter.add(5, &[("event_type", "B"), ("outcome", "acknowledged")]);

        let points = store.collect();
        assert_eq!(points.len(), 2);
        let a = points.iter().find(|p| p.label("event_type") == Some("A")).unwrap();
        assert_eq!(a.as_sum(), Some(3));
        assert_eq!(a.labels[0].0, "event_type");
    }

    #[test]
    fn inert_meter_records_nothing() {
        let meter = Meter::noop("unregistered");
        meter.counter("x").add(1, &[]);
        meter.histogram("y", "ms").record(1.0, &[]);
        assert!(!meter.is_enabled());
    }

    #[test]
    fn explicit_buckets_have_inclusive_upper_bounds() {
        let mut histogram = ExplicitHistogram::new(DEFAULT_BOUNDARIES.to_vec());
        for value in [0.0, 5.0, 5.1, 10_000.0, 10_000.1] {
            histogram.record(value);
        }

        let data = histogram.snapshot();
        let HistogramBuckets::Explicit { counts, .. } = data.buckets else {
            panic!("expected explicit buckets");
        };
        assert_eq!(counts[0], 1);
        assert_eq!(counts[1], 1);
        assert_eq!(counts[2], 1);
        assert_eq!(counts[14], 1);
        assert_eq!(counts[15], 1);
        assert_eq!(data.count, 5);
        assert!((data.max - 10_000.1).abs() < f64::EPSILON);
    }

    #[test]
    fn exponential_histogram_counts_non_positive_values_as_zero() {
        let mut histogram = ExponentialHistogram::new();
        histogram.record(0.0);
        histogram.record(-3.0);
        histogram.record(1.5);

        let data = histogram.snapshot();
        let HistogramBuckets::Exponential {
            zero_count, counts, scale, ..
        } = data.buckets
        else {
            panic!("expected exponential buckets");
        };
        assert_eq!(zero_count, 2);
        assert_eq!(counts.iter().sum::<u64>(), 1);
        assert_eq!(scale, MAX_SCALE);
    }

    #[test]
    fn exponential_histogram_downscales_for_wide_ranges() {
        let mut histogram = ExponentialHistogram::new();
        histogram.record(1.0);
        histogram.record(1_000_000.0);

        assert!(histogram.scale < MAX_SCALE);
        assert!(histogram.counts.len() <= MAX_BUCKETS);
        assert_eq!(histogram.counts.iter().sum::<u64>(), 2);
    }

    #[test]
    fn exponential_powers_of_two_fall_on_bucket_upper_bounds() {
        // 2.0 is the upper bound of bucket 2^scale - 1 at any scale.
        assert_eq!(bucket_index(2.0, 0), 0);
        assert_eq!(bucket_index(2.0, 3), 7);
        assert_eq!(bucket_index(4.0, 0), 1);
    }

    proptest! {
        #[test]
        fn exponential_histogram_keeps_every_value(values in prop::collection::vec(1.0e-6f64..1.0e9, 1..200)) {
            let mut histogram = ExponentialHistogram::new();
            for value in &values {
                histogram.record(*value);
            }
            prop_assert!(histogram.counts.len() <= MAX_BUCKETS);
            prop_assert_eq!(histogram.counts.iter().sum::<u64>(), values.len() as u64);
        }

        #[test]
        fn every_value_lands_in_a_bucket_that_contains_it(value in 1.0e-3f64..1.0e6, scale in 0i32..8) {
            let index = bucket_index(value, scale);
            let base = 2f64.powf(2f64.powi(-scale));
            let lower = base.powi(index);
            let upper = base.powi(index + 1);
            prop_assert!(value > lower * (1.0 - 1e-9) && value <= upper * (1.0 + 1e-9));
        }
    }
}
