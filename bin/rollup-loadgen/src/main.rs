//! A deterministic load generator for the metrics aggregator.
//!
//! Emits a seeded workload of observations from several threads, lets the aggregator flush them to a file or standard
//! output, and verifies that no counter increments were lost along the way.

#![deny(warnings)]
#![deny(missing_docs)]

use rollup_aggregator::GenericError;
use tracing::{error, info};
use tracing_subscriber::{filter::LevelFilter, EnvFilter};

mod config;
use self::config::Config;

mod driver;
use self::driver::Driver;

mod transport;

fn main() {
    tracing_subscriber::fmt()
        .compact()
        .with_env_filter(
            EnvFilter::builder()
                .with_default_directive(LevelFilter::INFO.into())
                .from_env_lossy(),
        )
        .with_ansi(true)
        .with_target(true)
        .with_writer(std::io::stderr)
        .init();

    match run() {
        Ok(()) => info!("rollup-loadgen stopped."),
        Err(e) => {
            error!("{:?}", e);
            std::process::exit(1);
        }
    }
}

fn run() -> Result<(), GenericError> {
    info!("rollup-loadgen starting...");

    let Some(config_path) = std::env::args().nth(1) else {
        error!("Path to the configuration file must be passed as the first (and only) argument to `rollup-loadgen`.");
        std::process::exit(1);
    };

    let config = Config::try_from_file(&config_path)?;
    let driver = Driver::new(config)?;
    driver.run()
}
