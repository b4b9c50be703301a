use std::{
    collections::BTreeMap,
    sync::{Arc, Mutex, MutexGuard, PoisonError, Weak},
    time::Duration,
};

use tracing::{debug, trace, warn};

use crate::{
    codec::encode_payload,
    collaborators::{BeforeEmit, FlushScheduler, LocalAggregatorSink, SystemTimeSource, TimeSource, Transport},
    config::{AggregatorConfiguration, ConfigurationError},
    scheduler::{FlushPolicy, FlushToken, FlushWindow, ScheduledFlush},
    state::MetricValue,
    telemetry::Telemetry,
    AggregationState, BucketKey, MetricType, MetricUnit, SetValue, TagSet,
};

type FastHashMap<K, V> = hashbrown::HashMap<K, V, foldhash::quality::RandomState>;

type EvictedBuckets = Vec<(BucketKey, AggregationState)>;

/// Summary of a single flush.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct FlushOutcome {
    evicted: usize,
    filtered: usize,
}

impl FlushOutcome {
    /// Returns the number of buckets removed from the store.
    pub fn evicted(&self) -> usize {
        self.evicted
    }

    /// Returns the number of evicted buckets that were dropped by the filter.
    pub fn filtered(&self) -> usize {
        self.filtered
    }

    /// Returns the number of buckets handed to the transport.
    pub fn emitted(&self) -> usize {
        self.evicted - self.filtered
    }
}

#[derive(Default)]
struct Store {
    // Keyed by bucket start, so the oldest windows are always first.
    buckets: BTreeMap<u64, FastHashMap<BucketKey, AggregationState>>,
    bucket_count: usize,
    weight: usize,
    closed: bool,
}

impl Store {
    fn drain_all(&mut self) -> EvictedBuckets {
        let buckets = std::mem::take(&mut self.buckets);
        self.bucket_count = 0;
        self.weight = 0;

        buckets.into_values().flatten().collect()
    }

    fn drain_flushable(&mut self, window: &FlushWindow, now: Duration) -> EvictedBuckets {
        let mut evicted = Vec::new();
        while let Some(entry) = self.buckets.first_entry() {
            if !window.is_flushable(*entry.key(), now) {
                break;
            }

            for (key, state) in entry.remove() {
                self.weight -= bucket_weight(&state);
                self.bucket_count -= 1;
                evicted.push((key, state));
            }
        }

        evicted
    }
}

fn bucket_weight(state: &AggregationState) -> usize {
    1 + state.weight()
}

struct Inner {
    this: Weak<Inner>,
    rollup_interval: Duration,
    window: FlushWindow,
    policy: FlushPolicy,
    flush_on_close: bool,
    store: Mutex<Store>,
    transport: Arc<dyn Transport>,
    scheduler: Arc<dyn FlushScheduler>,
    time_source: Arc<dyn TimeSource>,
    before_emit: Option<Arc<dyn BeforeEmit>>,
    telemetry: Telemetry,
}

impl Inner {
    fn lock_store(&self) -> MutexGuard<'_, Store> {
        // Store mutations can't panic partway through, so a poisoned lock still guards consistent data.
        self.store.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn record(
        &self, name: &str, value: MetricValue, unit: Option<MetricUnit>, tags: Option<&TagSet>,
        timestamp: Option<Duration>, local_sink: Option<&dyn LocalAggregatorSink>,
    ) {
        let metric_type = value.metric_type();
        if name.is_empty() {
            debug!(%metric_type, "Dropping observation with empty metric name.");
            self.telemetry.record_dropped_emission();
            return;
        }

        let timestamp = timestamp.unwrap_or_else(|| self.time_source.now());
        let key = BucketKey::derive(
            metric_type,
            name,
            unit.unwrap_or_default(),
            tags.cloned().unwrap_or_default(),
            timestamp,
            self.rollup_interval,
        );

        // The flush policy is evaluated under the lock so that nothing can be arranged once `close` has run.
        let (changed, weight, flush) = {
            let mut guard = self.lock_store();
            let store = &mut *guard;
            if store.closed {
                return;
            }

            let window = store.buckets.entry(key.timestamp()).or_default();
            let changed = match window.get_mut(&key) {
                Some(state) => {
                    let previous = state.weight();
                    let changed = state.add(value);
                    store.weight = store.weight - previous + state.weight();
                    changed
                }
                None => {
                    let state = AggregationState::new(value);
                    store.weight += bucket_weight(&state);
                    store.bucket_count += 1;
                    window.insert(key.clone(), state);
                    true
                }
            };

            self.telemetry.update_store(store.bucket_count, store.weight);
            (changed, store.weight, self.policy.arrange(store.weight))
        };

        trace!(%metric_type, metric_name = name, bucket_start = key.timestamp(), weight, "Recorded observation.");
        self.telemetry.record_emission(metric_type);

        if let Some(flush) = flush {
            self.schedule_flush(flush);
        }

        if let Some(sink) = local_sink {
            let value = match value {
                MetricValue::Counter(v) | MetricValue::Distribution(v) | MetricValue::Gauge(v) => v,
                MetricValue::Set(_) => {
                    if changed {
                        1.0
                    } else {
                        0.0
                    }
                }
            };
            sink.add(&key, metric_type, key.name(), value, key.unit(), key.tags());
        }
    }

    fn schedule_flush(&self, flush: ScheduledFlush) {
        let token = flush.token();
        let this = self.this.clone();
        self.scheduler.schedule(
            flush.delay(),
            Box::new(move || {
                if let Some(inner) = this.upgrade() {
                    inner.run_scheduled_flush(token);
                }
            }),
        );
    }

    fn run_scheduled_flush(&self, token: FlushToken) {
        if !self.policy.claim(token) {
            trace!("Skipping superseded flush.");
            return;
        }

        self.flush(false);
    }

    fn flush(&self, force: bool) -> FlushOutcome {
        let now = self.time_source.now();

        let (evicted, follow_up) = {
            let mut store = self.lock_store();
            let force = force || self.policy.is_over_weight(store.weight);
            let evicted = if force {
                store.drain_all()
            } else {
                store.drain_flushable(&self.window, now)
            };
            self.telemetry.update_store(store.bucket_count, store.weight);

            let follow_up = if store.bucket_count > 0 && !store.closed {
                self.policy.arrange(store.weight)
            } else {
                None
            };
            (evicted, follow_up)
        };

        let outcome = self.emit(evicted);

        if let Some(flush) = follow_up {
            self.schedule_flush(flush);
        }

        outcome
    }

    fn emit(&self, evicted: EvictedBuckets) -> FlushOutcome {
        if evicted.is_empty() {
            return FlushOutcome::default();
        }

        let evicted_count = evicted.len();
        let survivors = evicted
            .into_iter()
            .filter(|(key, _)| self.should_emit(key))
            .collect::<Vec<_>>();
        let filtered = evicted_count - survivors.len();

        if !survivors.is_empty() {
            let batch = encode_payload(survivors.iter().map(|(key, state)| (key, state)));
            debug!(
                buckets = batch.bucket_count(),
                filtered,
                payload_len = batch.len(),
                "Flushing buckets."
            );
            self.transport.capture(batch);
        }

        self.telemetry.record_flush(survivors.len(), filtered);

        FlushOutcome {
            evicted: evicted_count,
            filtered,
        }
    }

    fn should_emit(&self, key: &BucketKey) -> bool {
        let Some(filter) = &self.before_emit else {
            return true;
        };

        match filter.before_emit(key.name(), key.tags()) {
            Ok(emit) => emit,
            Err(e) => {
                warn!(error = %e, metric_name = key.name(), "Emit filter failed. Emitting bucket anyway.");
                self.telemetry.record_filter_error();
                true
            }
        }
    }

    fn close(&self) {
        let drained = {
            let mut store = self.lock_store();
            if store.closed {
                return;
            }
            store.closed = true;
            self.policy.cancel();
            self.telemetry.update_store(0, 0);
            store.drain_all()
        };

        if self.flush_on_close {
            let outcome = self.emit(drained);
            debug!(buckets = outcome.emitted(), "Flushed remaining buckets on close.");
        } else if !drained.is_empty() {
            debug!(buckets = drained.len(), "Discarding remaining buckets on close.");
        }
    }
}

/// Builder for [`MetricsAggregator`].
pub struct MetricsAggregatorBuilder {
    config: AggregatorConfiguration,
    transport: Arc<dyn Transport>,
    scheduler: Arc<dyn FlushScheduler>,
    time_source: Arc<dyn TimeSource>,
    before_emit: Option<Arc<dyn BeforeEmit>>,
}

impl MetricsAggregatorBuilder {
    /// Sets the time source.
    ///
    /// Defaults to [`SystemTimeSource`].
    pub fn with_time_source(mut self, time_source: Arc<dyn TimeSource>) -> Self {
        self.time_source = time_source;
        self
    }

    /// Sets the filter called for every bucket before it is emitted.
    pub fn with_before_emit<F>(mut self, filter: F) -> Self
    where
        F: BeforeEmit + 'static,
    {
        self.before_emit = Some(Arc::new(filter));
        self
    }

    /// Builds the aggregator.
    ///
    /// # Errors
    ///
    /// If the configuration is invalid, an error is returned.
    pub fn build(self) -> Result<MetricsAggregator, ConfigurationError> {
        self.config.validate()?;

        let rollup_interval = self.config.rollup_interval();
        let flush_shift = self.config.resolve_flush_shift();
        debug!(
            rollup_interval_secs = rollup_interval.as_secs(),
            flush_shift_ms = flush_shift.as_millis() as u64,
            max_weight = self.config.max_weight(),
            "Creating metrics aggregator."
        );

        let inner = Arc::new_cyclic(|this| Inner {
            this: this.clone(),
            rollup_interval,
            window: FlushWindow::new(rollup_interval, flush_shift),
            policy: FlushPolicy::new(self.config.flush_interval(), self.config.max_weight()),
            flush_on_close: self.config.flush_on_close(),
            store: Mutex::new(Store::default()),
            transport: self.transport,
            scheduler: self.scheduler,
            time_source: self.time_source,
            before_emit: self.before_emit,
            telemetry: Telemetry::new(),
        });

        Ok(MetricsAggregator { inner, flush_shift })
    }
}

/// A client-side metrics aggregator.
///
/// Observations are aggregated in memory into buckets, one per unique combination of metric type, name, unit, tags, and
/// rollup window. Buckets are flushed periodically through a [`FlushScheduler`], encoded into a single payload, and
/// handed to a [`Transport`].
///
/// ## Backpressure
///
/// Every bucket has a weight, which is a flat cost of one plus the weight of its values: one for counters, the number
/// of values for distributions, the number of unique values for sets, and a fixed [`GAUGE_WEIGHT`] for gauges. When the
/// total weight of all buffered buckets exceeds the configured maximum, a flush is scheduled to run immediately, and
/// that flush evicts every bucket, including those whose window is still open.
///
/// ## Concurrency
///
/// All operations can be called concurrently from any thread. The transport, the filter, and the local sink are never
/// called while internal locks are held.
///
/// ## Closing
///
/// Once closed, either explicitly through [`close`][Self::close] or by being dropped, the aggregator ignores all further
/// observations and never schedules another flush. Buffered buckets are discarded unless `flush_on_close` is enabled.
///
/// [`GAUGE_WEIGHT`]: crate::GAUGE_WEIGHT
pub struct MetricsAggregator {
    inner: Arc<Inner>,
    flush_shift: Duration,
}

impl MetricsAggregator {
    /// Creates a new `MetricsAggregator` with the system clock and no filter.
    ///
    /// # Errors
    ///
    /// If the configuration is invalid, an error is returned.
    pub fn new(
        config: AggregatorConfiguration, transport: Arc<dyn Transport>, scheduler: Arc<dyn FlushScheduler>,
    ) -> Result<Self, ConfigurationError> {
        Self::builder(config, transport, scheduler).build()
    }

    /// Creates a builder for a `MetricsAggregator`.
    pub fn builder(
        config: AggregatorConfiguration, transport: Arc<dyn Transport>, scheduler: Arc<dyn FlushScheduler>,
    ) -> MetricsAggregatorBuilder {
        MetricsAggregatorBuilder {
            config,
            transport,
            scheduler,
            time_source: Arc::new(SystemTimeSource),
            before_emit: None,
        }
    }

    /// Increments a counter.
    ///
    /// If `timestamp` is `None`, the current time is used.
    pub fn increment_counter(
        &self, name: &str, value: f64, unit: Option<MetricUnit>, tags: Option<&TagSet>, timestamp: Option<Duration>,
        local_sink: Option<&dyn LocalAggregatorSink>,
    ) {
        self.inner.record(
            name,
            MetricValue::Counter(value),
            unit,
            tags,
            timestamp,
            local_sink,
        );
    }

    /// Records a value in a distribution.
    ///
    /// If `timestamp` is `None`, the current time is used.
    pub fn record_distribution(
        &self, name: &str, value: f64, unit: Option<MetricUnit>, tags: Option<&TagSet>, timestamp: Option<Duration>,
        local_sink: Option<&dyn LocalAggregatorSink>,
    ) {
        self.inner.record(
            name,
            MetricValue::Distribution(value),
            unit,
            tags,
            timestamp,
            local_sink,
        );
    }

    /// Records a value in a set.
    ///
    /// The local sink, if any, receives `1.0` if the value was not yet part of the set, and `0.0` otherwise.
    ///
    /// If `timestamp` is `None`, the current time is used.
    pub fn record_set<V>(
        &self, name: &str, value: V, unit: Option<MetricUnit>, tags: Option<&TagSet>, timestamp: Option<Duration>,
        local_sink: Option<&dyn LocalAggregatorSink>,
    ) where
        V: Into<SetValue>,
    {
        let hash = value.into().to_hash();
        self.inner
            .record(name, MetricValue::Set(hash), unit, tags, timestamp, local_sink);
    }

    /// Records a gauge value.
    ///
    /// If `timestamp` is `None`, the current time is used.
    pub fn record_gauge(
        &self, name: &str, value: f64, unit: Option<MetricUnit>, tags: Option<&TagSet>, timestamp: Option<Duration>,
        local_sink: Option<&dyn LocalAggregatorSink>,
    ) {
        self.inner.record(
            name,
            MetricValue::Gauge(value),
            unit,
            tags,
            timestamp,
            local_sink,
        );
    }

    /// Flushes buckets to the transport.
    ///
    /// Without `force`, only buckets whose window has ended (plus the flush shift) are flushed, unless the store is over
    /// its maximum weight, in which case every bucket is flushed. With `force`, every bucket is flushed.
    ///
    /// Evicted buckets are passed through the filter, if any, and the survivors are encoded into a single payload. The
    /// transport is only called if at least one bucket survives.
    pub fn flush(&self, force: bool) -> FlushOutcome {
        self.inner.flush(force)
    }

    /// Closes the aggregator.
    ///
    /// Subsequent observations are ignored, and no further flushes are scheduled. Calling this more than once has no
    /// additional effect.
    pub fn close(&self) {
        self.inner.close();
    }

    /// Returns `true` if the aggregator has been closed.
    pub fn is_closed(&self) -> bool {
        self.inner.lock_store().closed
    }

    /// Returns the total weight of all buffered buckets.
    pub fn weight(&self) -> usize {
        self.inner.lock_store().weight
    }

    /// Returns the number of buffered buckets.
    pub fn bucket_count(&self) -> usize {
        self.inner.lock_store().bucket_count
    }

    /// Returns the flush shift in use.
    pub fn flush_shift(&self) -> Duration {
        self.flush_shift
    }
}

impl Drop for MetricsAggregator {
    fn drop(&mut self) {
        self.inner.close();
    }
}

#[cfg(test)]
mod tests {
    use metrics::{SharedString, Unit};
    use metrics_util::{
        debugging::{DebugValue, DebuggingRecorder},
        CompositeKey,
    };

    use super::*;
    use crate::test_util::{ManualClock, ManualScheduler, RecordingTransport};

    fn gauge_value(metrics: &[(CompositeKey, Option<Unit>, Option<SharedString>, DebugValue)], key: &str) -> f64 {
        metrics
            .iter()
            .find(|(k, _, _, _)| k.key().name() == key)
            .map(|(_, _, _, value)| match value {
                DebugValue::Gauge(value) => value.into_inner(),
                other => panic!("expected a gauge, got: {:?}", other),
            })
            .unwrap_or_else(|| panic!("no metric found with key: {}", key))
    }

    fn aggregator(config: AggregatorConfiguration) -> (MetricsAggregator, Arc<RecordingTransport>, Arc<ManualClock>) {
        let transport = Arc::new(RecordingTransport::default());
        let clock = Arc::new(ManualClock::new(Duration::from_secs(100)));
        let aggregator = MetricsAggregator::builder(config, transport.clone(), Arc::new(ManualScheduler::default()))
            .with_time_source(clock.clone())
            .build()
            .unwrap();

        (aggregator, transport, clock)
    }

    #[test]
    fn weight_accounting_per_type() {
        let (aggregator, _, _) = aggregator(AggregatorConfiguration::default());

        aggregator.increment_counter("c", 1.0, None, None, None, None);
        aggregator.increment_counter("c", 1.0, None, None, None, None);
        assert_eq!(aggregator.weight(), 2);

        aggregator.record_distribution("d", 1.0, None, None, None, None);
        aggregator.record_distribution("d", 1.0, None, None, None, None);
        aggregator.record_distribution("d", 2.0, None, None, None, None);
        assert_eq!(aggregator.weight(), 2 + 4);

        aggregator.record_set("s", "a", None, None, None, None);
        aggregator.record_set("s", "a", None, None, None, None);
        aggregator.record_set("s", "b", None, None, None, None);
        assert_eq!(aggregator.weight(), 2 + 4 + 3);

        aggregator.record_gauge("g", 1.0, None, None, None, None);
        aggregator.record_gauge("g", 7.0, None, None, None, None);
        assert_eq!(aggregator.weight(), 2 + 4 + 3 + 1 + crate::GAUGE_WEIGHT);
        assert_eq!(aggregator.bucket_count(), 4);

        aggregator.flush(true);
        assert_eq!(aggregator.weight(), 0);
        assert_eq!(aggregator.bucket_count(), 0);
    }

    #[test]
    fn partial_flush_keeps_weight_of_open_windows() {
        let (aggregator, transport, clock) = aggregator(AggregatorConfiguration::default());

        aggregator.increment_counter("old", 1.0, None, None, Some(Duration::from_secs(80)), None);
        aggregator.record_distribution("new", 1.0, None, None, Some(Duration::from_secs(100)), None);
        aggregator.record_distribution("new", 2.0, None, None, Some(Duration::from_secs(100)), None);
        assert_eq!(aggregator.weight(), 2 + 3);

        clock.set(Duration::from_secs(105));
        let outcome = aggregator.flush(false);
        assert_eq!(outcome.evicted(), 1);
        assert_eq!(outcome.emitted(), 1);
        assert_eq!(aggregator.weight(), 3);
        assert_eq!(aggregator.bucket_count(), 1);

        let decoded = transport.decoded();
        assert_eq!(decoded.len(), 1);
        assert_eq!(decoded[0][0].name, "old");
    }

    #[test]
    fn far_future_bucket_does_not_disturb_partial_flush() {
        let (aggregator, transport, _) = aggregator(AggregatorConfiguration::default());

        aggregator.increment_counter("old", 1.0, None, None, Some(Duration::from_secs(20)), None);
        aggregator.increment_counter("future", 1.0, None, None, Some(Duration::from_secs(u64::MAX)), None);
        assert_eq!(aggregator.weight(), 4);

        let outcome = aggregator.flush(false);
        assert_eq!(outcome.evicted(), 1);
        assert_eq!(aggregator.weight(), 2);
        assert_eq!(aggregator.bucket_count(), 1);

        let decoded = transport.decoded();
        assert_eq!(decoded.len(), 1);
        assert_eq!(decoded[0][0].name, "old");

        let outcome = aggregator.flush(true);
        assert_eq!(outcome.evicted(), 1);
        assert_eq!(aggregator.weight(), 0);
        assert_eq!(aggregator.bucket_count(), 0);
    }

    #[test]
    fn close_cancels_arranged_flush_and_arranges_no_more() {
        let transport = Arc::new(RecordingTransport::default());
        let scheduler = Arc::new(ManualScheduler::default());
        let config = AggregatorConfiguration::default();
        let aggregator = MetricsAggregator::builder(config, transport.clone(), scheduler.clone())
            .with_time_source(Arc::new(ManualClock::new(Duration::from_secs(100))))
            .build()
            .unwrap();

        aggregator.increment_counter("hits", 1.0, None, None, None, None);
        assert!(aggregator.inner.policy.is_scheduled());

        aggregator.close();
        assert!(!aggregator.inner.policy.is_scheduled());

        aggregator.increment_counter("hits", 1.0, None, None, None, None);
        aggregator.flush(false);
        assert_eq!(scheduler.scheduled_delays().len(), 1);

        assert_eq!(scheduler.run_all(10), 1);
        assert_eq!(scheduler.scheduled_delays().len(), 1);
        assert_eq!(transport.capture_count(), 0);
    }

    #[test]
    fn store_gauges_track_store() {
        let recorder = DebuggingRecorder::new();
        let snapshotter = recorder.snapshotter();

        let (aggregator, _, clock) =
            metrics::with_local_recorder(&recorder, || aggregator(AggregatorConfiguration::default()));

        aggregator.increment_counter("old", 1.0, None, None, Some(Duration::from_secs(80)), None);
        aggregator.record_gauge("new", 1.0, None, None, None, None);
        let metrics = snapshotter.snapshot().into_vec();
        assert_eq!(gauge_value(&metrics, "rollup_live_buckets"), 2.0);
        assert_eq!(gauge_value(&metrics, "rollup_store_weight"), (2 + 1 + crate::GAUGE_WEIGHT) as f64);

        clock.set(Duration::from_secs(105));
        aggregator.flush(false);
        let metrics = snapshotter.snapshot().into_vec();
        assert_eq!(gauge_value(&metrics, "rollup_live_buckets"), 1.0);
        assert_eq!(gauge_value(&metrics, "rollup_store_weight"), (1 + crate::GAUGE_WEIGHT) as f64);

        aggregator.close();
        let metrics = snapshotter.snapshot().into_vec();
        assert_eq!(gauge_value(&metrics, "rollup_live_buckets"), 0.0);
        assert_eq!(gauge_value(&metrics, "rollup_store_weight"), 0.0);
    }

    #[test]
    fn empty_name_is_dropped() {
        let (aggregator, _, _) = aggregator(AggregatorConfiguration::default());

        aggregator.increment_counter("", 1.0, None, None, None, None);
        assert_eq!(aggregator.bucket_count(), 0);
        assert_eq!(aggregator.weight(), 0);
    }

    #[test]
    fn invalid_configuration_fails_fast() {
        let result = MetricsAggregator::new(
            AggregatorConfiguration::default().with_max_weight(0),
            Arc::new(RecordingTransport::default()),
            Arc::new(ManualScheduler::default()),
        );
        assert!(matches!(result, Err(ConfigurationError::ZeroMaxWeight)));
    }
}
