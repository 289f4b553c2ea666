use std::path::PathBuf;

use anyhow::Context;
use clap::Parser;

use crate::config::{RpsConfig, RunnerConfig, SteppedRpsConfig};

#[derive(Parser, Debug, Clone, Default)]
#[command(about, long_about = None)]
pub struct CloudBenchScenarioCli {
    /// A YAML or JSON file with the runner configuration. The file extension selects the format.
    #[clap(short, long)]
    pub config: Option<PathBuf>,

    /// The runner type to configure from the command line instead of a file.
    ///
    /// One of `serial`, `constant`, `constant_for_duration` or `rps`. The remaining runner options
    /// are only used together with this flag.
    #[clap(short, long)]
    pub runner: Option<String>,

    /// The total number of iterations to run
    #[clap(short, long)]
    pub times: Option<u64>,

    /// The number of iterations to keep in flight at once
    #[clap(long)]
    pub concurrency: Option<u64>,

    /// The number of seconds to keep starting iterations for
    #[clap(long)]
    pub duration: Option<f64>,

    /// The rate to start iterations at, in iterations per second.
    ///
    /// Either a single number, such as `--rps=10`, or a stepped rate in the format
    /// `start:end:step[:duration]`. For example `--rps=1:5:1:10` starts at 1 iteration per second
    /// and adds 1 every 10 seconds until it reaches 5.
    #[clap(long, value_parser = parse_rps)]
    pub rps: Option<RpsConfig>,

    /// Seconds an iteration may run before it is recorded as timed out. 0 disables the timeout.
    #[clap(long)]
    pub timeout: Option<f64>,

    /// Limit the number of worker groups to this many CPUs
    #[clap(long)]
    pub max_cpu_count: Option<u64>,

    /// Limit the number of in-flight iterations of an rps runner
    #[clap(long)]
    pub max_concurrency: Option<u64>,

    /// Arguments passed to every iteration, as a JSON object
    #[clap(long, value_parser = parse_args)]
    pub args: Option<serde_json::Value>,

    /// Number of results to collect before handing them to the reporters
    #[clap(long, default_value = "1")]
    pub batch_size: usize,

    /// Stop starting new iterations as soon as an SLA criterion fails
    #[clap(long, default_value = "false")]
    pub abort_on_sla_failure: bool,

    /// Fail the SLA if more than this percentage of iterations fail
    #[clap(long)]
    pub sla_max_failure_percent: Option<f64>,

    /// Fail the SLA if any iteration takes longer than this many seconds
    #[clap(long)]
    pub sla_max_seconds_per_iteration: Option<f64>,

    /// Do not show a progress bar on the CLI.
    ///
    /// This is recommended for CI/CD environments where the progress bar isn't being looked at by anyone and is just adding noise to the logs.
    #[clap(long, default_value = "false")]
    pub no_progress: bool,

    /// Append a summary of the run to this file, as one JSON line
    #[clap(long)]
    pub summary_file: Option<PathBuf>,

    /// Write every iteration result to this file, as JSON lines
    #[clap(long)]
    pub results_file: Option<PathBuf>,

    /// Identifier for this run. A random one is generated if not set
    #[clap(long)]
    pub run_id: Option<String>,
}

impl CloudBenchScenarioCli {
    fn has_inline_runner_options(&self) -> bool {
        self.times.is_some()
            || self.concurrency.is_some()
            || self.duration.is_some()
            || self.rps.is_some()
            || self.timeout.is_some()
            || self.max_cpu_count.is_some()
            || self.max_concurrency.is_some()
    }

    /// Resolve the runner configuration, from `--config`, from `--runner` and its options, or
    /// falling back to `default`.
    pub fn runner_config(&self, default: Option<&RunnerConfig>) -> anyhow::Result<RunnerConfig> {
        if let Some(path) = &self.config {
            if self.runner.is_some() || self.has_inline_runner_options() {
                log::warn!(
                    "Runner options given on the command line are ignored because --config is set"
                );
            }
            return Ok(RunnerConfig::from_file(path)?);
        }

        let Some(runner) = &self.runner else {
            if self.has_inline_runner_options() {
                anyhow::bail!("Runner options were given without --runner");
            }
            return default
                .cloned()
                .context("No runner configured, use --config or --runner");
        };

        let mut config = serde_json::Map::new();
        config.insert("type".to_string(), serde_json::json!(runner));

        let mut set = |key: &str, value: Option<serde_json::Value>| {
            if let Some(value) = value {
                config.insert(key.to_string(), value);
            }
        };
        set("times", self.times.map(Into::into));
        set("concurrency", self.concurrency.map(Into::into));
        set("duration", self.duration.map(Into::into));
        set("timeout", self.timeout.map(Into::into));
        set("max_cpu_count", self.max_cpu_count.map(Into::into));
        set("max_concurrency", self.max_concurrency.map(Into::into));
        set(
            "rps",
            self.rps.map(serde_json::to_value).transpose()?,
        );

        Ok(RunnerConfig::from_json_value(serde_json::Value::Object(
            config,
        ))?)
    }
}

fn parse_rps(s: &str) -> anyhow::Result<RpsConfig> {
    if !s.contains(':') {
        let rps = s
            .parse::<f64>()
            .with_context(|| format!("Invalid rps: {s}"))?;
        return Ok(RpsConfig::Fixed(rps));
    }

    let parts = s
        .split(':')
        .map(|part| {
            part.parse::<f64>()
                .with_context(|| format!("Invalid stepped rps part '{part}' in {s}"))
        })
        .collect::<anyhow::Result<Vec<_>>>()?;

    match parts[..] {
        [start, end, step] => Ok(RpsConfig::Stepped(SteppedRpsConfig {
            start,
            end,
            step,
            duration: 1.0,
        })),
        [start, end, step, duration] => Ok(RpsConfig::Stepped(SteppedRpsConfig {
            start,
            end,
            step,
            duration,
        })),
        _ => anyhow::bail!("Stepped rps must be in the format start:end:step[:duration], got {s}"),
    }
}

fn parse_args(s: &str) -> anyhow::Result<serde_json::Value> {
    let value: serde_json::Value =
        serde_json::from_str(s).context("Scenario arguments must be valid JSON")?;
    if !value.is_object() {
        anyhow::bail!("Scenario arguments must be a JSON object");
    }
    Ok(value)
}
