use std::collections::BTreeSet;

use crate::MetricType;

/// Weight contributed by a gauge, regardless of how many observations it has folded in.
///
/// Matches the number of values a gauge encodes to: last, minimum, maximum, sum, and count.
pub const GAUGE_WEIGHT: usize = 5;

/// A raw value observed for a set.
///
/// Sets only retain a 64-bit hash of each value. Integers are stored as their two's complement bit pattern, and strings
/// are hashed with xxHash64, which is stable across processes and platforms.
#[derive(Clone, Debug, Eq, Hash, PartialEq)]
pub enum SetValue {
    /// A string value.
    String(String),

    /// An integer value.
    Integer(i64),
}

impl SetValue {
    /// Returns the 64-bit hash that represents this value in a set.
    pub fn to_hash(&self) -> u64 {
        match self {
            Self::String(s) => twox_hash::XxHash64::oneshot(0, s.as_bytes()),
            Self::Integer(i) => *i as u64,
        }
    }
}

impl From<String> for SetValue {
    fn from(value: String) -> Self {
        Self::String(value)
    }
}

impl<'a> From<&'a str> for SetValue {
    fn from(value: &'a str) -> Self {
        Self::String(value.to_string())
    }
}

impl From<i64> for SetValue {
    fn from(value: i64) -> Self {
        Self::Integer(value)
    }
}

impl From<i32> for SetValue {
    fn from(value: i32) -> Self {
        Self::Integer(value.into())
    }
}

impl From<u32> for SetValue {
    fn from(value: u32) -> Self {
        Self::Integer(value.into())
    }
}

/// A single observation, resolved to the form it is aggregated in.
#[derive(Clone, Copy, Debug, PartialEq)]
pub(crate) enum MetricValue {
    Counter(f64),
    Distribution(f64),
    Set(u64),
    Gauge(f64),
}

impl MetricValue {
    pub fn metric_type(&self) -> MetricType {
        match self {
            Self::Counter(_) => MetricType::Counter,
            Self::Distribution(_) => MetricType::Distribution,
            Self::Set(_) => MetricType::Set,
            Self::Gauge(_) => MetricType::Gauge,
        }
    }
}

/// Running summary of a gauge.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct GaugeSummary {
    last: f64,
    min: f64,
    max: f64,
    sum: f64,
    count: u64,
}

impl GaugeSummary {
    /// Creates a summary from a single observation.
    pub fn new(value: f64) -> Self {
        Self {
            last: value,
            min: value,
            max: value,
            sum: value,
            count: 1,
        }
    }

    /// Creates a summary from its raw fields.
    pub fn from_parts(last: f64, min: f64, max: f64, sum: f64, count: u64) -> Self {
        Self {
            last,
            min,
            max,
            sum,
            count,
        }
    }

    /// Folds a new observation into the summary.
    pub fn observe(&mut self, value: f64) {
        self.last = value;
        self.min = self.min.min(value);
        self.max = self.max.max(value);
        self.sum += value;
        self.count += 1;
    }

    /// Returns the most recently observed value.
    pub fn last(&self) -> f64 {
        self.last
    }

    /// Returns the smallest observed value.
    pub fn min(&self) -> f64 {
        self.min
    }

    /// Returns the largest observed value.
    pub fn max(&self) -> f64 {
        self.max
    }

    /// Returns the sum of all observed values.
    pub fn sum(&self) -> f64 {
        self.sum
    }

    /// Returns the number of observations.
    pub fn count(&self) -> u64 {
        self.count
    }
}

/// Aggregated state of a single bucket.
#[derive(Clone, Debug, PartialEq)]
pub enum AggregationState {
    /// Running sum of all increments.
    Counter(f64),

    /// Every recorded value, in insertion order.
    Distribution(Vec<f64>),

    /// Hashes of the unique values recorded.
    Set(BTreeSet<u64>),

    /// Summary of all recorded values.
    Gauge(GaugeSummary),
}

impl AggregationState {
    pub(crate) fn new(value: MetricValue) -> Self {
        match value {
            MetricValue::Counter(v) => Self::Counter(v),
            MetricValue::Distribution(v) => Self::Distribution(vec![v]),
            MetricValue::Set(hash) => Self::Set(BTreeSet::from([hash])),
            MetricValue::Gauge(v) => Self::Gauge(GaugeSummary::new(v)),
        }
    }

    /// Folds a value into the state.
    ///
    /// Returns `false` if the value did not change the state, which only happens when a set already holds the value.
    pub(crate) fn add(&mut self, value: MetricValue) -> bool {
        match (self, value) {
            (Self::Counter(sum), MetricValue::Counter(v)) => {
                *sum += v;
                true
            }
            (Self::Distribution(values), MetricValue::Distribution(v)) => {
                values.push(v);
                true
            }
            (Self::Set(hashes), MetricValue::Set(hash)) => hashes.insert(hash),
            (Self::Gauge(summary), MetricValue::Gauge(v)) => {
                summary.observe(v);
                true
            }
            // Bucket keys include the metric type, so a state only ever sees values of its own type.
            _ => false,
        }
    }

    /// Returns the metric type of this state.
    pub fn metric_type(&self) -> MetricType {
        match self {
            Self::Counter(_) => MetricType::Counter,
            Self::Distribution(_) => MetricType::Distribution,
            Self::Set(_) => MetricType::Set,
            Self::Gauge(_) => MetricType::Gauge,
        }
    }

    /// Returns the weight contributed by the values held in this state.
    ///
    /// This does not include the flat cost of the bucket itself.
    pub fn weight(&self) -> usize {
        match self {
            Self::Counter(_) => 1,
            Self::Distribution(values) => values.len(),
            Self::Set(hashes) => hashes.len(),
            Self::Gauge(_) => GAUGE_WEIGHT,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counter_sums() {
        let mut state = AggregationState::new(MetricValue::Counter(1.5));
        assert!(state.add(MetricValue::Counter(2.5)));
        assert!(state.add(MetricValue::Counter(-1.0)));

        assert_eq!(state, AggregationState::Counter(3.0));
        assert_eq!(state.weight(), 1);
    }

    #[test]
    fn distribution_keeps_every_value() {
        let mut state = AggregationState::new(MetricValue::Distribution(1.0));
        state.add(MetricValue::Distribution(1.0));
        state.add(MetricValue::Distribution(3.0));

        assert_eq!(state, AggregationState::Distribution(vec![1.0, 1.0, 3.0]));
        assert_eq!(state.weight(), 3);
    }

    #[test]
    fn set_weight_is_unique_count() {
        let a = SetValue::from("alice").to_hash();
        let b = SetValue::from("bob").to_hash();

        let mut state = AggregationState::new(MetricValue::Set(a));
        assert!(state.add(MetricValue::Set(b)));
        assert!(!state.add(MetricValue::Set(a)));
        assert_eq!(state.weight(), 2);
    }

    #[test]
    fn gauge_tracks_all_fields() {
        let mut state = AggregationState::new(MetricValue::Gauge(5.0));
        state.add(MetricValue::Gauge(2.0));
        state.add(MetricValue::Gauge(9.0));
        state.add(MetricValue::Gauge(4.0));

        assert_eq!(state, AggregationState::Gauge(GaugeSummary::from_parts(4.0, 2.0, 9.0, 20.0, 4)));
        assert_eq!(state.weight(), GAUGE_WEIGHT);
    }

    #[test]
    fn mismatched_value_is_ignored() {
        let mut state = AggregationState::new(MetricValue::Counter(1.0));
        assert!(!state.add(MetricValue::Gauge(2.0)));
        assert_eq!(state, AggregationState::Counter(1.0));
    }

    #[test]
    fn set_hashes_are_stable() {
        assert_eq!(SetValue::from(42i64).to_hash(), 42);
        assert_eq!(SetValue::from(-1i64).to_hash(), u64::MAX);
        assert_eq!(SetValue::from("value").to_hash(), SetValue::from("value".to_string()).to_hash());
        assert_ne!(SetValue::from("value").to_hash(), SetValue::from("other").to_hash());
    }
}
