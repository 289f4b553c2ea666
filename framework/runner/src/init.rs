use crate::cli::CloudBenchScenarioCli;
use clap::Parser;

/// Initialise the CLI and logging for a scenario binary.
pub fn init() -> CloudBenchScenarioCli {
    env_logger::init();

    CloudBenchScenarioCli::parse()
}
