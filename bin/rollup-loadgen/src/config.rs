use std::{num::NonZeroUsize, path::Path, path::PathBuf};

use anyhow::Context as _;
use figment::{
    providers::{Env, Format as _, Yaml},
    Figment,
};
use rollup_aggregator::{AggregatorConfiguration, GenericError};
use serde::Deserialize;

const fn default_contexts() -> usize {
    64
}

/// Shape of the generated workload.
#[derive(Clone, Debug, Deserialize, PartialEq)]
pub struct Workload {
    /// Number of threads emitting observations concurrently.
    pub threads: NonZeroUsize,

    /// Number of observations emitted by each thread.
    pub emissions_per_thread: usize,

    /// Number of distinct metric contexts to spread observations over.
    ///
    /// Each context is a unique combination of metric name and tags. Defaults to 64.
    #[serde(default = "default_contexts")]
    pub contexts: usize,
}

#[derive(Debug, Deserialize)]
pub struct Config {
    /// A fixed source of entropy for the random number generators used by the emitting threads.
    ///
    /// Runs with the same seed and workload emit exactly the same observations, although the way they end up split
    /// into buckets and payloads still depends on timing.
    pub seed: u64,

    /// Workload to generate.
    pub workload: Workload,

    /// File to write payloads to.
    ///
    /// If not set, payloads are written to standard output.
    #[serde(default)]
    pub output: Option<PathBuf>,

    /// Aggregator configuration.
    #[serde(default)]
    pub aggregator: AggregatorConfiguration,
}

impl Config {
    /// Attempts to load a `Config` from the given file path.
    ///
    /// Environment variables prefixed with `ROLLUP_` override values from the file, with nested fields separated by a
    /// double underscore: `ROLLUP_AGGREGATOR__MAX_WEIGHT=500` sets `aggregator.max_weight`.
    ///
    /// # Errors
    ///
    /// If the file can't be read, the configuration can't be deserialized, or it is not valid, an error is returned.
    pub fn try_from_file<P>(config_path: P) -> Result<Self, GenericError>
    where
        P: AsRef<Path>,
    {
        let config_path = config_path.as_ref();
        let figment = Figment::new()
            .merge(Yaml::file_exact(config_path))
            .merge(Env::prefixed("ROLLUP_").split("__"));

        Self::from_figment(figment)
            .with_context(|| format!("Failed to load configuration from '{}'.", config_path.display()))
    }

    fn from_figment(figment: Figment) -> Result<Self, GenericError> {
        let config: Self = figment.extract().context("Failed to parse configuration.")?;
        config
            .aggregator
            .validate()
            .context("Invalid aggregator configuration.")?;

        Ok(config)
    }
}
