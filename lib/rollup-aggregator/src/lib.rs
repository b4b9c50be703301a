//! Client-side metrics aggregation.
//!
//! Applications emit counters, distributions, sets, and gauges through a [`MetricsAggregator`], which folds them into
//! per-window buckets in memory. Buckets are periodically flushed, encoded into a compact line-based payload, and handed
//! to a [`Transport`] for delivery, which keeps the volume of data sent downstream proportional to the number of unique
//! metrics rather than the number of observations.
//!
//! The aggregator is driven entirely by its collaborators: a [`FlushScheduler`] runs deferred flushes, a [`TimeSource`]
//! provides the current time, and an optional [`BeforeEmit`] filter decides which buckets are emitted.
#![deny(missing_docs)]

mod aggregator;
pub use self::aggregator::{FlushOutcome, MetricsAggregator, MetricsAggregatorBuilder};

pub mod codec;

mod collaborators;
pub use self::collaborators::{
    BeforeEmit, FlushScheduler, LocalAggregatorSink, ScheduledTask, SystemTimeSource, TimeSource, TokioFlushScheduler,
    Transport,
};

mod config;
pub use self::config::{AggregatorConfiguration, ConfigurationError};

mod key;
pub use self::key::{align_to_bucket_start, BucketKey, MetricType};

mod scheduler;

mod state;
pub use self::state::{AggregationState, GaugeSummary, SetValue, GAUGE_WEIGHT};

mod tags;
pub use self::tags::TagSet;

mod telemetry;

#[cfg(any(test, feature = "test-util"))]
pub mod test_util;

mod unit;
pub use self::unit::{DurationUnit, FractionUnit, InformationUnit, MetricUnit};

/// A generic error.
///
/// Used where the failure comes from user-provided code, such as a [`BeforeEmit`] filter.
pub type GenericError = anyhow::Error;
