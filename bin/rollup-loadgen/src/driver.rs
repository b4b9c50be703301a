use std::{
    sync::Arc,
    time::{Duration, Instant},
};

use anyhow::{bail, Context as _};
use rand::{rngs::StdRng, Rng as _, SeedableRng as _};
use rollup_aggregator::{GenericError, MetricsAggregator, SetValue, TagSet, TokioFlushScheduler};
use tokio::runtime::{Builder, Runtime};
use tracing::{debug, info};

use crate::{
    config::{Config, Workload},
    transport::WriterTransport,
};

/// How long to wait for in-flight flush tasks once the aggregator is closed.
const FLUSH_TASK_DRAIN_TIMEOUT: Duration = Duration::from_secs(10);

/// Observations emitted by a single thread.
#[derive(Default)]
struct EmitterTally {
    counters: usize,
    distributions: usize,
    sets: usize,
    gauges: usize,
}

impl EmitterTally {
    fn merge(&mut self, other: EmitterTally) {
        self.counters += other.counters;
        self.distributions += other.distributions;
        self.sets += other.sets;
        self.gauges += other.gauges;
    }

    fn total(&self) -> usize {
        self.counters + self.distributions + self.sets + self.gauges
    }
}

/// Load driver.
///
/// Owns the aggregator and its collaborators, runs the emitting threads, and checks the captured output once every
/// thread has finished.
pub struct Driver {
    config: Config,
    runtime: Runtime,
    transport: Arc<WriterTransport>,
}

impl Driver {
    /// Creates a new `Driver` based on the given configuration.
    ///
    /// # Errors
    ///
    /// If the flush runtime or the output can't be created, an error is returned.
    pub fn new(config: Config) -> Result<Self, GenericError> {
        let transport = WriterTransport::from_output(config.output.as_deref())?;
        Self::with_transport(config, transport)
    }

    fn with_transport(config: Config, transport: WriterTransport) -> Result<Self, GenericError> {
        let runtime = Builder::new_multi_thread()
            .worker_threads(1)
            .thread_name("rollup-flush")
            .enable_time()
            .build()
            .context("Failed to build flush runtime.")?;

        Ok(Self {
            config,
            runtime,
            transport: Arc::new(transport),
        })
    }

    /// Runs the workload to completion.
    ///
    /// # Errors
    ///
    /// If the aggregator can't be created, the output can't be flushed, or the captured counter total doesn't match
    /// what was emitted, an error is returned.
    pub fn run(self) -> Result<(), GenericError> {
        let Self {
            config,
            runtime,
            transport,
        } = self;

        let scheduler = Arc::new(TokioFlushScheduler::new(runtime.handle().clone()));
        let aggregator = MetricsAggregator::new(config.aggregator.clone(), transport.clone(), scheduler)
            .context("Failed to create aggregator.")?;

        let workload = &config.workload;
        info!(
            threads = workload.threads.get(),
            emissions_per_thread = workload.emissions_per_thread,
            contexts = workload.contexts,
            flush_shift = ?aggregator.flush_shift(),
            "Starting emitters."
        );

        let start = Instant::now();
        let mut tally = EmitterTally::default();
        std::thread::scope(|scope| {
            let handles = (0..workload.threads.get())
                .map(|idx| {
                    let aggregator = &aggregator;
                    let seed = config.seed.wrapping_add(idx as u64);
                    scope.spawn(move || emit_workload(aggregator, workload, seed))
                })
                .collect::<Vec<_>>();

            for handle in handles {
                // Emitters only panic if the aggregator does, in which case there's nothing meaningful to report.
                if let Ok(thread_tally) = handle.join() {
                    tally.merge(thread_tally);
                }
            }
        });
        let emit_duration = start.elapsed();

        let outcome = aggregator.flush(true);
        debug!(buckets = outcome.emitted(), "Flushed remaining buckets.");
        aggregator.close();

        // A scheduled flush that started before the close may still be encoding or capturing the buckets it evicted.
        runtime.shutdown_timeout(FLUSH_TASK_DRAIN_TIMEOUT);

        transport.finish()?;
        let summary = transport.summary();

        info!(
            "Emitted {} observations ({} counters, {} distributions, {} sets, {} gauges) over {:?}.",
            tally.total(),
            tally.counters,
            tally.distributions,
            tally.sets,
            tally.gauges,
            emit_duration
        );
        info!(
            "Captured {} payloads ({} bytes) holding {} buckets, with {} write errors.",
            summary.payloads, summary.payload_bytes, summary.buckets, summary.write_errors
        );

        if summary.counter_total != tally.counters as f64 {
            bail!(
                "Captured counter total ({}) does not match the number of counter increments ({}).",
                summary.counter_total,
                tally.counters
            );
        }

        Ok(())
    }
}

fn emit_workload(aggregator: &MetricsAggregator, workload: &Workload, seed: u64) -> EmitterTally {
    let mut rng = StdRng::seed_from_u64(seed);
    let mut tally = EmitterTally::default();
    let contexts = workload.contexts.max(1);

    for _ in 0..workload.emissions_per_thread {
        let context = rng.random_range(0..contexts);
        let name = format!("loadgen.metric_{}", context);
        let tags = TagSet::from([("context", context.to_string()), ("shard", (context % 4).to_string())]);

        match rng.random_range(0..4) {
            0 => {
                aggregator.increment_counter(&name, 1.0, None, Some(&tags), None, None);
                tally.counters += 1;
            }
            1 => {
                let value = rng.random_range(0.0..1000.0);
                aggregator.record_distribution(&name, value, None, Some(&tags), None, None);
                tally.distributions += 1;
            }
            2 => {
                let value = SetValue::Integer(rng.random_range(0..100));
                aggregator.record_set(&name, value, None, Some(&tags), None, None);
                tally.sets += 1;
            }
            _ => {
                let value = rng.random_range(-50.0..50.0);
                aggregator.record_gauge(&name, value, None, Some(&tags), None, None);
                tally.gauges += 1;
            }
        }
    }

    tally
}

#[cfg(test)]
mod tests {
    use std::{io, num::NonZeroUsize};

    use rollup_aggregator::AggregatorConfiguration;

    use super::*;

    fn config(max_weight: usize) -> Config {
        Config {
            seed: 7,
            workload: Workload {
                threads: NonZeroUsize::new(4).unwrap(),
                emissions_per_thread: 5_000,
                contexts: 16,
            },
            output: None,
            aggregator: AggregatorConfiguration::default()
                .with_max_weight(max_weight)
                .with_flush_interval(Duration::from_millis(1)),
        }
    }

    #[test]
    fn captured_counters_match_emitted_with_frequent_scheduled_flushes() {
        for max_weight in [1, 64, 20_000] {
            let transport = WriterTransport::from_writer(Box::new(io::sink()));
            let driver = Driver::with_transport(config(max_weight), transport).unwrap();
            driver.run().unwrap();
        }
    }
}
