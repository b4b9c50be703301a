use metrics::{counter, gauge, Counter, Gauge};

use crate::MetricType;

#[derive(Clone)]
struct MetricTypedCounter {
    for_counter: Counter,
    for_distribution: Counter,
    for_set: Counter,
    for_gauge: Counter,
}

impl MetricTypedCounter {
    fn new(name: &'static str) -> Self {
        Self {
            for_counter: counter!(name, "metric_type" => "counter"),
            for_distribution: counter!(name, "metric_type" => "distribution"),
            for_set: counter!(name, "metric_type" => "set"),
            for_gauge: counter!(name, "metric_type" => "gauge"),
        }
    }

    fn for_type(&self, metric_type: MetricType) -> &Counter {
        match metric_type {
            MetricType::Counter => &self.for_counter,
            MetricType::Distribution => &self.for_distribution,
            MetricType::Set => &self.for_set,
            MetricType::Gauge => &self.for_gauge,
        }
    }
}

/// Internal telemetry of an aggregator.
///
/// Handles are registered against the global `metrics` recorder when the aggregator is built. If no recorder is
/// installed, they are no-ops.
#[derive(Clone)]
pub(crate) struct Telemetry {
    emissions: MetricTypedCounter,
    emissions_dropped: Counter,
    buckets_flushed: Counter,
    buckets_filtered: Counter,
    filter_errors: Counter,
    payloads_captured: Counter,
    live_buckets: Gauge,
    store_weight: Gauge,
}

impl Telemetry {
    pub fn new() -> Self {
        Self {
            emissions: MetricTypedCounter::new("rollup_emissions_total"),
            emissions_dropped: counter!("rollup_emissions_dropped_total"),
            buckets_flushed: counter!("rollup_buckets_flushed_total"),
            buckets_filtered: counter!("rollup_buckets_filtered_total"),
            filter_errors: counter!("rollup_filter_errors_total"),
            payloads_captured: counter!("rollup_payloads_captured_total"),
            live_buckets: gauge!("rollup_live_buckets"),
            store_weight: gauge!("rollup_store_weight"),
        }
    }

    pub fn record_emission(&self, metric_type: MetricType) {
        self.emissions.for_type(metric_type).increment(1);
    }

    pub fn record_dropped_emission(&self) {
        self.emissions_dropped.increment(1);
    }

    pub fn record_flush(&self, emitted: usize, filtered: usize) {
        self.buckets_flushed.increment(emitted as u64);
        self.buckets_filtered.increment(filtered as u64);
        if emitted > 0 {
            self.payloads_captured.increment(1);
        }
    }

    pub fn record_filter_error(&self) {
        self.filter_errors.increment(1);
    }

    pub fn update_store(&self, buckets: usize, weight: usize) {
        self.live_buckets.set(buckets as f64);
        self.store_weight.set(weight as f64);
    }
}
