use std::{
    fs::File,
    io::{self, BufWriter, Write},
    path::Path,
    sync::Mutex,
};

use anyhow::Context as _;
use rollup_aggregator::{
    codec::{decode_payload, DecodedValues, EncodedMetricsBatch},
    GenericError, Transport,
};
use tracing::{error, trace};

/// Totals across every payload captured by a [`WriterTransport`].
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct CaptureSummary {
    pub payloads: usize,
    pub payload_bytes: usize,
    pub buckets: usize,
    pub counter_total: f64,
    pub write_errors: usize,
}

struct State {
    writer: Box<dyn Write + Send>,
    summary: CaptureSummary,
}

/// A transport that writes payloads to a file or standard output.
///
/// Every payload is also decoded, so that the totals of what was captured can be checked against what was emitted.
pub struct WriterTransport {
    state: Mutex<State>,
}

impl WriterTransport {
    /// Creates a new `WriterTransport` that writes to the given file, or to standard output if no file is given.
    ///
    /// # Errors
    ///
    /// If the file can't be created, an error is returned.
    pub fn from_output(output: Option<&Path>) -> Result<Self, GenericError> {
        let writer: Box<dyn Write + Send> = match output {
            Some(path) => {
                let file = File::create(path)
                    .with_context(|| format!("Failed to create output file '{}'.", path.display()))?;
                Box::new(BufWriter::new(file))
            }
            None => Box::new(io::stdout()),
        };

        Ok(Self::from_writer(writer))
    }

    pub(crate) fn from_writer(writer: Box<dyn Write + Send>) -> Self {
        Self {
            state: Mutex::new(State {
                writer,
                summary: CaptureSummary::default(),
            }),
        }
    }

    /// Flushes the underlying writer.
    ///
    /// # Errors
    ///
    /// If the writer can't be flushed, an error is returned.
    pub fn finish(&self) -> Result<(), GenericError> {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        state.writer.flush().context("Failed to flush output.")
    }

    /// Returns the totals of every payload captured so far.
    pub fn summary(&self) -> CaptureSummary {
        self.state.lock().unwrap_or_else(|e| e.into_inner()).summary
    }
}

impl Transport for WriterTransport {
    fn capture(&self, batch: EncodedMetricsBatch) {
        let counter_total = match decode_payload(batch.payload()) {
            Ok(buckets) => buckets
                .iter()
                .filter_map(|bucket| match bucket.values {
                    DecodedValues::Counter(sum) => Some(sum),
                    _ => None,
                })
                .sum(),
            Err(e) => {
                error!(error = %e, "Captured payload could not be decoded.");
                0.0
            }
        };

        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        if let Err(e) = state.writer.write_all(batch.payload()) {
            error!(error = %e, "Failed to write payload.");
            state.summary.write_errors += 1;
        }

        trace!(buckets = batch.bucket_count(), payload_len = batch.len(), "Captured payload.");

        state.summary.payloads += 1;
        state.summary.payload_bytes += batch.len();
        state.summary.buckets += batch.bucket_count();
        state.summary.counter_total += counter_total;
    }
}
