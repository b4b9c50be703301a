//! Deterministic collaborators for tests.

use std::{
    collections::VecDeque,
    sync::{Mutex, MutexGuard},
    time::Duration,
};

use crate::{
    codec::{decode_payload, DecodedBucket, EncodedMetricsBatch},
    collaborators::{FlushScheduler, ScheduledTask, TimeSource, Transport},
    BucketKey, LocalAggregatorSink, MetricType, MetricUnit, TagSet,
};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
}

/// A [`TimeSource`] that only moves when told to.
#[derive(Debug, Default)]
pub struct ManualClock {
    now: Mutex<Duration>,
}

impl ManualClock {
    /// Creates a new `ManualClock` set to the given time.
    pub fn new(now: Duration) -> Self {
        Self { now: Mutex::new(now) }
    }

    /// Sets the current time.
    pub fn set(&self, now: Duration) {
        *lock(&self.now) = now;
    }

    /// Advances the current time.
    pub fn advance(&self, by: Duration) {
        *lock(&self.now) += by;
    }
}

impl TimeSource for ManualClock {
    fn now(&self) -> Duration {
        *lock(&self.now)
    }
}

/// A [`FlushScheduler`] that queues tasks until they are run explicitly.
#[derive(Default)]
pub struct ManualScheduler {
    tasks: Mutex<VecDeque<(Duration, ScheduledTask)>>,
    delays: Mutex<Vec<Duration>>,
}

impl ManualScheduler {
    /// Returns the delay of every task ever scheduled, in order.
    pub fn scheduled_delays(&self) -> Vec<Duration> {
        lock(&self.delays).clone()
    }

    /// Returns the number of tasks that have not been run yet.
    pub fn pending(&self) -> usize {
        lock(&self.tasks).len()
    }

    /// Runs the oldest pending task.
    ///
    /// Returns the delay it was scheduled with, or `None` if there were no pending tasks.
    pub fn run_next(&self) -> Option<Duration> {
        // The task may schedule another one, so the lock must not be held while it runs.
        let (delay, task) = lock(&self.tasks).pop_front()?;
        task();
        Some(delay)
    }

    /// Runs pending tasks, including any they schedule, until none remain or `limit` tasks have run.
    ///
    /// Returns the number of tasks run.
    pub fn run_all(&self, limit: usize) -> usize {
        let mut runs = 0;
        while runs < limit && self.run_next().is_some() {
            runs += 1;
        }
        runs
    }
}

impl FlushScheduler for ManualScheduler {
    fn schedule(&self, delay: Duration, task: ScheduledTask) {
        lock(&self.delays).push(delay);
        lock(&self.tasks).push_back((delay, task));
    }
}

/// A [`Transport`] that keeps every captured payload.
#[derive(Debug, Default)]
pub struct RecordingTransport {
    batches: Mutex<Vec<EncodedMetricsBatch>>,
}

impl RecordingTransport {
    /// Returns every captured payload, in order.
    pub fn batches(&self) -> Vec<EncodedMetricsBatch> {
        lock(&self.batches).clone()
    }

    /// Returns the number of captured payloads.
    pub fn capture_count(&self) -> usize {
        lock(&self.batches).len()
    }

    /// Decodes every captured payload.
    ///
    /// # Panics
    ///
    /// Panics if a payload can't be decoded.
    pub fn decoded(&self) -> Vec<Vec<DecodedBucket>> {
        lock(&self.batches)
            .iter()
            .map(|batch| decode_payload(batch.payload()).expect("captured payload should decode"))
            .collect()
    }
}

impl Transport for RecordingTransport {
    fn capture(&self, batch: EncodedMetricsBatch) {
        lock(&self.batches).push(batch);
    }
}

/// An observation forwarded to a [`LocalAggregatorSink`].
#[derive(Clone, Debug, PartialEq)]
pub struct SinkObservation {
    /// Bucket the observation was aggregated into.
    pub key: BucketKey,

    /// Metric type.
    pub metric_type: MetricType,

    /// Metric name.
    pub name: String,

    /// Forwarded value.
    pub value: f64,

    /// Metric unit.
    pub unit: MetricUnit,

    /// Metric tags.
    pub tags: TagSet,
}

/// A [`LocalAggregatorSink`] that keeps every observation.
#[derive(Debug, Default)]
pub struct RecordingSink {
    observations: Mutex<Vec<SinkObservation>>,
}

impl RecordingSink {
    /// Returns every observation, in order.
    pub fn observations(&self) -> Vec<SinkObservation> {
        lock(&self.observations).clone()
    }

    /// Returns the forwarded values, in order.
    pub fn values(&self) -> Vec<f64> {
        lock(&self.observations).iter().map(|obs| obs.value).collect()
    }
}

impl LocalAggregatorSink for RecordingSink {
    fn add(&self, key: &BucketKey, metric_type: MetricType, name: &str, value: f64, unit: &MetricUnit, tags: &TagSet) {
        lock(&self.observations).push(SinkObservation {
            key: key.clone(),
            metric_type,
            name: name.to_string(),
            value,
            unit: unit.clone(),
            tags: tags.clone(),
        });
    }
}
