//! Interfaces to the components the aggregator depends on, and default implementations of them.

use std::time::{Duration, SystemTime};

use tokio::runtime::Handle;
use tracing::trace;

use crate::{codec::EncodedMetricsBatch, BucketKey, GenericError, MetricType, MetricUnit, TagSet};

/// A task handed to a [`FlushScheduler`].
pub type ScheduledTask = Box<dyn FnOnce() + Send + 'static>;

/// Delivers encoded payloads.
///
/// Delivery is fire-and-forget from the aggregator's perspective: it never inspects the outcome, and it never retries
/// or re-queues a payload. Handling failures, timeouts, and retries is entirely up to the implementation.
pub trait Transport: Send + Sync {
    /// Captures an encoded payload for delivery.
    fn capture(&self, batch: EncodedMetricsBatch);
}

/// Runs tasks after a delay.
///
/// The aggregator keeps track of the single flush it has scheduled on its own, so implementations don't need to
/// deduplicate or cancel anything.
pub trait FlushScheduler: Send + Sync {
    /// Schedules `task` to run once, after `delay` has elapsed.
    fn schedule(&self, delay: Duration, task: ScheduledTask);
}

/// Provides the current time.
pub trait TimeSource: Send + Sync {
    /// Returns the current time, relative to the Unix epoch.
    fn now(&self) -> Duration;
}

/// Decides whether a flushed bucket is emitted.
///
/// Called once per evicted bucket during a flush. Returning `Ok(false)` drops the bucket, which is not retried. Errors
/// are logged and the bucket is emitted anyway.
pub trait BeforeEmit: Send + Sync {
    /// Returns whether the bucket with the given name and tags should be emitted.
    fn before_emit(&self, name: &str, tags: &TagSet) -> Result<bool, GenericError>;
}

impl<F> BeforeEmit for F
where
    F: Fn(&str, &TagSet) -> Result<bool, GenericError> + Send + Sync,
{
    fn before_emit(&self, name: &str, tags: &TagSet) -> Result<bool, GenericError> {
        self(name, tags)
    }
}

/// Receives every accepted observation as it is emitted.
///
/// This is used to maintain a separate, local view of the metrics (for example, to attach a summary of the metrics to
/// the current trace span). It is called synchronously, exactly once per accepted emission, before the emission call
/// returns. For sets, the forwarded value is `1.0` if the value was new to its bucket and `0.0` otherwise; for all other
/// metric types, it is the raw observed value.
pub trait LocalAggregatorSink {
    /// Adds an observation.
    fn add(&self, key: &BucketKey, metric_type: MetricType, name: &str, value: f64, unit: &MetricUnit, tags: &TagSet);
}

/// A [`TimeSource`] backed by the system clock.
#[derive(Clone, Copy, Debug, Default)]
pub struct SystemTimeSource;

impl TimeSource for SystemTimeSource {
    fn now(&self) -> Duration {
        SystemTime::now()
            .duration_since(SystemTime::UNIX_EPOCH)
            .unwrap_or_default()
    }
}

/// A [`FlushScheduler`] that runs tasks on a Tokio runtime.
///
/// Each task is spawned as its own Tokio task which sleeps for the requested delay before running. Tasks are expected to
/// be short and non-blocking, as they are run directly on a runtime worker thread.
#[derive(Clone, Debug)]
pub struct TokioFlushScheduler {
    handle: Handle,
}

impl TokioFlushScheduler {
    /// Creates a new `TokioFlushScheduler` that spawns onto the runtime behind `handle`.
    pub fn new(handle: Handle) -> Self {
        Self { handle }
    }

    /// Creates a new `TokioFlushScheduler` for the runtime of the current context.
    ///
    /// Returns `None` if not called from within a Tokio runtime.
    pub fn from_current() -> Option<Self> {
        Handle::try_current().ok().map(Self::new)
    }
}

impl FlushScheduler for TokioFlushScheduler {
    fn schedule(&self, delay: Duration, task: ScheduledTask) {
        trace!(delay_ms = delay.as_millis() as u64, "Scheduling flush.");

        self.handle.spawn(async move {
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            task();
        });
    }
}
