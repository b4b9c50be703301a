use std::{fmt, time::Duration};

use crate::{MetricUnit, TagSet};

/// Metric type.
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub enum MetricType {
    /// A monotonic sum.
    Counter,

    /// Every observed value, kept as-is.
    Distribution,

    /// Unique values.
    Set,

    /// A summary of the observed values: last, minimum, maximum, sum, and count.
    Gauge,
}

impl MetricType {
    /// Returns the single-character code used for this type in encoded payloads.
    pub const fn code(&self) -> char {
        match self {
            Self::Counter => 'c',
            Self::Distribution => 'd',
            Self::Set => 's',
            Self::Gauge => 'g',
        }
    }

    /// Returns the metric type for the given type code, if it is known.
    pub const fn from_code(code: char) -> Option<Self> {
        match code {
            'c' => Some(Self::Counter),
            'd' => Some(Self::Distribution),
            's' => Some(Self::Set),
            'g' => Some(Self::Gauge),
            _ => None,
        }
    }

    /// Returns the name of this metric type.
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Counter => "counter",
            Self::Distribution => "distribution",
            Self::Set => "set",
            Self::Gauge => "gauge",
        }
    }
}

impl fmt::Display for MetricType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The identity of an aggregation bucket.
///
/// Two observations with equal bucket keys are aggregated together. A bucket key is the combination of the metric type,
/// name, unit, tags, and the start of the rollup window the observation falls into.
#[derive(Clone, Debug, Eq, Hash, PartialEq)]
pub struct BucketKey {
    metric_type: MetricType,
    name: String,
    unit: MetricUnit,
    tags: TagSet,
    timestamp: u64,
}

impl BucketKey {
    /// Derives the bucket key for an observation.
    ///
    /// `timestamp` is the time of the observation, relative to the Unix epoch. The bucket start is aligned down to a
    /// multiple of `rollup_interval`, with a resolution of whole seconds. A rollup interval shorter than one second is
    /// treated as one second.
    pub fn derive(
        metric_type: MetricType, name: &str, unit: MetricUnit, tags: TagSet, timestamp: Duration, rollup_interval: Duration,
    ) -> Self {
        Self {
            metric_type,
            name: name.to_string(),
            unit,
            tags,
            timestamp: align_to_bucket_start(timestamp, rollup_interval),
        }
    }

    /// Returns the metric type.
    pub fn metric_type(&self) -> MetricType {
        self.metric_type
    }

    /// Returns the metric name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Returns the unit.
    pub fn unit(&self) -> &MetricUnit {
        &self.unit
    }

    /// Returns the tags.
    pub fn tags(&self) -> &TagSet {
        &self.tags
    }

    /// Returns the start of the bucket, in seconds since the Unix epoch.
    pub fn timestamp(&self) -> u64 {
        self.timestamp
    }
}

/// Aligns a timestamp down to the start of the rollup window containing it, in seconds.
pub fn align_to_bucket_start(timestamp: Duration, rollup_interval: Duration) -> u64 {
    let width = rollup_interval.as_secs().max(1);
    let secs = timestamp.as_secs();
    secs - (secs % width)
}
