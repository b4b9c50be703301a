use std::time::Duration;

use rand::Rng as _;
use serde::Deserialize;
use snafu::{ensure, Snafu};

const fn default_rollup_interval_secs() -> u64 {
    10
}

const fn default_flush_interval_ms() -> u64 {
    5000
}

/// Largest supported rollup interval: one day.
const MAX_ROLLUP_INTERVAL_SECS: u64 = 86_400;

const fn default_max_weight() -> usize {
    100_000
}

/// A configuration error.
#[derive(Debug, Eq, PartialEq, Snafu)]
#[snafu(context(suffix(false)))]
pub enum ConfigurationError {
    /// The rollup interval was zero.
    #[snafu(display("Rollup interval must be greater than zero."))]
    ZeroRollupInterval,

    /// The rollup interval was longer than one day.
    #[snafu(display("Rollup interval must be at most {} seconds, got {}.", max_secs, actual_secs))]
    RollupIntervalTooLong {
        /// Largest supported rollup interval, in seconds.
        max_secs: u64,

        /// Configured rollup interval, in seconds.
        actual_secs: u64,
    },

    /// The flush interval was zero.
    #[snafu(display("Flush interval must be greater than zero."))]
    ZeroFlushInterval,

    /// The maximum weight was zero.
    #[snafu(display("Maximum weight must be greater than zero."))]
    ZeroMaxWeight,
}

/// Aggregator configuration.
#[derive(Clone, Debug, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct AggregatorConfiguration {
    /// Width of the aggregation window, in seconds.
    ///
    /// All observations of the same metric that fall into the same window are aggregated into a single bucket. Windows
    /// are aligned to multiples of this interval since the Unix epoch. Must be at most one day.
    ///
    /// Defaults to 10 seconds.
    #[serde(default = "default_rollup_interval_secs")]
    rollup_interval_secs: u64,

    /// How long to wait before flushing buckets, in milliseconds.
    ///
    /// When data is added and no flush is pending, a flush is scheduled to run after this interval.
    ///
    /// Defaults to 5000 milliseconds.
    #[serde(default = "default_flush_interval_ms")]
    flush_interval_ms: u64,

    /// Maximum total weight of the buffered buckets.
    ///
    /// Every bucket has a weight based on how much data it holds. Once the total weight exceeds this limit, an
    /// immediate flush is scheduled, and that flush evicts every bucket regardless of whether its window has closed.
    ///
    /// Defaults to 100,000.
    #[serde(default = "default_max_weight")]
    max_weight: usize,

    /// Additional delay after the end of a window before its buckets can be flushed, in milliseconds.
    ///
    /// Defaults to 0.
    #[serde(default)]
    flush_shift_ms: u64,

    /// Whether to pick a random flush shift.
    ///
    /// When enabled, a flush shift between zero and the rollup interval is picked once, when the aggregator is created,
    /// and `flush_shift_ms` is ignored. This spreads flushes out when many processes start at the same time.
    ///
    /// Defaults to `false`.
    #[serde(default)]
    randomize_flush_shift: bool,

    /// Whether to flush all buffered data when the aggregator is closed.
    ///
    /// Normally, any buckets still buffered when the aggregator is closed are discarded. When enabled, a final flush of
    /// every bucket, including those with open windows, is performed before closing.
    ///
    /// Defaults to `false`.
    #[serde(default)]
    flush_on_close: bool,
}

impl AggregatorConfiguration {
    /// Creates a new `AggregatorConfiguration` with default values.
    pub fn with_defaults() -> Self {
        Self {
            rollup_interval_secs: default_rollup_interval_secs(),
            flush_interval_ms: default_flush_interval_ms(),
            max_weight: default_max_weight(),
            flush_shift_ms: 0,
            randomize_flush_shift: false,
            flush_on_close: false,
        }
    }

    /// Sets the rollup interval.
    ///
    /// The interval is truncated to whole seconds.
    pub fn with_rollup_interval(mut self, rollup_interval: Duration) -> Self {
        self.rollup_interval_secs = rollup_interval.as_secs();
        self
    }

    /// Sets the flush interval.
    ///
    /// The interval is truncated to whole milliseconds.
    pub fn with_flush_interval(mut self, flush_interval: Duration) -> Self {
        self.flush_interval_ms = flush_interval.as_millis() as u64;
        self
    }

    /// Sets the maximum weight.
    pub fn with_max_weight(mut self, max_weight: usize) -> Self {
        self.max_weight = max_weight;
        self
    }

    /// Sets a fixed flush shift.
    pub fn with_flush_shift(mut self, flush_shift: Duration) -> Self {
        self.flush_shift_ms = flush_shift.as_millis() as u64;
        self.randomize_flush_shift = false;
        self
    }

    /// Sets whether a random flush shift is picked.
    pub fn with_randomized_flush_shift(mut self, randomize: bool) -> Self {
        self.randomize_flush_shift = randomize;
        self
    }

    /// Sets whether buffered data is flushed when the aggregator is closed.
    pub fn with_flush_on_close(mut self, flush_on_close: bool) -> Self {
        self.flush_on_close = flush_on_close;
        self
    }

    /// Returns the rollup interval.
    pub fn rollup_interval(&self) -> Duration {
        Duration::from_secs(self.rollup_interval_secs)
    }

    /// Returns the flush interval.
    pub fn flush_interval(&self) -> Duration {
        Duration::from_millis(self.flush_interval_ms)
    }

    /// Returns the maximum weight.
    pub fn max_weight(&self) -> usize {
        self.max_weight
    }

    /// Returns `true` if buffered data is flushed when the aggregator is closed.
    pub fn flush_on_close(&self) -> bool {
        self.flush_on_close
    }

    /// Validates the configuration.
    ///
    /// # Errors
    ///
    /// If the rollup interval, flush interval, or maximum weight is zero, or the rollup interval is longer than one day,
    /// an error is returned.
    pub fn validate(&self) -> Result<(), ConfigurationError> {
        ensure!(self.rollup_interval_secs > 0, ZeroRollupInterval);
        ensure!(
            self.rollup_interval_secs <= MAX_ROLLUP_INTERVAL_SECS,
            RollupIntervalTooLong {
                max_secs: MAX_ROLLUP_INTERVAL_SECS,
                actual_secs: self.rollup_interval_secs,
            }
        );
        ensure!(self.flush_interval_ms > 0, ZeroFlushInterval);
        ensure!(self.max_weight > 0, ZeroMaxWeight);
        Ok(())
    }

    /// Resolves the flush shift to use.
    ///
    /// When the flush shift is randomized, a new value is picked on every call.
    pub fn resolve_flush_shift(&self) -> Duration {
        if self.randomize_flush_shift {
            let rollup_ms = self.rollup_interval_secs.saturating_mul(1000).max(1);
            Duration::from_millis(rand::rng().random_range(0..rollup_ms))
        } else {
            Duration::from_millis(self.flush_shift_ms)
        }
    }
}

impl Default for AggregatorConfiguration {
    fn default() -> Self {
        Self::with_defaults()
    }
}
