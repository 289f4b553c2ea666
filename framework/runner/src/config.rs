use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::rate::RateSchedule;

/// A runner configuration that cannot be started.
///
/// These are always reported before any worker is spawned.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read runner configuration from {path}: {reason}")]
    Read { path: String, reason: String },
    #[error("Invalid runner configuration: {0}")]
    Parse(String),
    #[error("Parameter '{name}' must be {expected}, got {value}")]
    InvalidValue {
        name: &'static str,
        expected: &'static str,
        value: String,
    },
    #[error("Parameter 'concurrency' ({concurrency}) must not be greater than 'times' ({times}), the extra workers would never run an iteration")]
    ConcurrencyExceedsTimes { concurrency: u64, times: u64 },
    #[error("Parameter 'rps.end' ({end}) must be greater than or equal to 'rps.start' ({start})")]
    RpsEndBelowStart { start: f64, end: f64 },
}

/// Longest duration, timeout or stage accepted, in seconds (about 31 years).
///
/// Deadlines are computed by adding these to `Instant::now()`, which must not overflow.
const MAX_SECONDS: f64 = 1e9;

fn default_times() -> u64 {
    1
}

fn default_concurrency() -> u64 {
    1
}

fn default_duration_timeout() -> f64 {
    600.0
}

fn default_stage_duration() -> f64 {
    1.0
}

/// Executes the scenario a number of times, one after another, in the calling thread.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SerialConfig {
    #[serde(default = "default_times")]
    pub times: u64,
}

/// Executes the scenario a fixed number of times with a fixed number of iterations in flight.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ConstantConfig {
    #[serde(default = "default_times")]
    pub times: u64,
    #[serde(default = "default_concurrency")]
    pub concurrency: u64,
    /// Seconds, 0 for no timeout.
    #[serde(default)]
    pub timeout: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_cpu_count: Option<u64>,
}

/// Executes the scenario with a fixed number of iterations in flight until the duration elapses.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ConstantForDurationConfig {
    /// Seconds.
    pub duration: f64,
    #[serde(default = "default_concurrency")]
    pub concurrency: u64,
    #[serde(default = "default_duration_timeout")]
    pub timeout: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_cpu_count: Option<u64>,
}

/// Starts iterations at a target rate until `times` have been started.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RpsRunnerConfig {
    pub times: u64,
    pub rps: RpsConfig,
    #[serde(default)]
    pub timeout: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_concurrency: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_cpu_count: Option<u64>,
}

/// Either a fixed rate or a rate that increases by `step` every `duration` seconds up to `end`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RpsConfig {
    Fixed(f64),
    Stepped(SteppedRpsConfig),
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SteppedRpsConfig {
    pub start: f64,
    pub end: f64,
    pub step: f64,
    #[serde(default = "default_stage_duration")]
    pub duration: f64,
}

/// The runner section of a task, as written by the user.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RunnerConfig {
    Serial(SerialConfig),
    Constant(ConstantConfig),
    ConstantForDuration(ConstantForDurationConfig),
    Rps(RpsRunnerConfig),
}

impl RunnerConfig {
    pub fn from_yaml_str(input: &str) -> Result<Self, ConfigError> {
        serde_yaml::from_str(input).map_err(|e| ConfigError::Parse(e.to_string()))
    }

    pub fn from_json_str(input: &str) -> Result<Self, ConfigError> {
        serde_json::from_str(input).map_err(|e| ConfigError::Parse(e.to_string()))
    }

    pub fn from_json_value(value: serde_json::Value) -> Result<Self, ConfigError> {
        serde_json::from_value(value).map_err(|e| ConfigError::Parse(e.to_string()))
    }

    /// Load a configuration file, `.json` files are read as JSON and anything else as YAML.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::Read {
            path: path.display().to_string(),
            reason: e.to_string(),
        })?;

        match path.extension().and_then(|ext| ext.to_str()) {
            Some("json") => Self::from_json_str(&content),
            _ => Self::from_yaml_str(&content),
        }
    }

    pub fn to_json(&self) -> serde_json::Value {
        serde_json::to_value(self).unwrap_or(serde_json::Value::Null)
    }

    /// Check the configuration and resolve it into the [Strategy] that will run it.
    pub fn validate(&self) -> Result<Strategy, ConfigError> {
        match self {
            RunnerConfig::Serial(cfg) => Ok(Strategy::Serial {
                times: positive("times", cfg.times)?,
            }),
            RunnerConfig::Constant(cfg) => {
                let times = positive("times", cfg.times)?;
                let concurrency = positive("concurrency", cfg.concurrency)?;
                if concurrency > times {
                    return Err(ConfigError::ConcurrencyExceedsTimes { concurrency, times });
                }

                Ok(Strategy::Constant {
                    times,
                    concurrency: concurrency as usize,
                    timeout: timeout(cfg.timeout)?,
                    max_cpu_count: optional_positive("max_cpu_count", cfg.max_cpu_count)?,
                })
            }
            RunnerConfig::ConstantForDuration(cfg) => Ok(Strategy::ConstantForDuration {
                duration: duration_seconds("duration", cfg.duration)?,
                concurrency: positive("concurrency", cfg.concurrency)? as usize,
                timeout: timeout(cfg.timeout)?,
                max_cpu_count: optional_positive("max_cpu_count", cfg.max_cpu_count)?,
            }),
            RunnerConfig::Rps(cfg) => Ok(Strategy::Rps {
                times: positive("times", cfg.times)?,
                rate: rate_schedule(&cfg.rps)?,
                timeout: timeout(cfg.timeout)?,
                max_concurrency: optional_positive("max_concurrency", cfg.max_concurrency)?,
                max_cpu_count: optional_positive("max_cpu_count", cfg.max_cpu_count)?,
            }),
        }
    }
}

fn positive(name: &'static str, value: u64) -> Result<u64, ConfigError> {
    if value == 0 {
        return Err(ConfigError::InvalidValue {
            name,
            expected: "a positive integer",
            value: value.to_string(),
        });
    }

    Ok(value)
}

fn optional_positive(name: &'static str, value: Option<u64>) -> Result<Option<usize>, ConfigError> {
    value
        .map(|v| positive(name, v).map(|v| v as usize))
        .transpose()
}

fn positive_seconds(name: &'static str, value: f64) -> Result<f64, ConfigError> {
    if !value.is_finite() || value <= 0.0 {
        return Err(ConfigError::InvalidValue {
            name,
            expected: "a positive number",
            value: value.to_string(),
        });
    }

    Ok(value)
}

fn duration_seconds(name: &'static str, value: f64) -> Result<Duration, ConfigError> {
    let seconds = positive_seconds(name, value)?;
    bounded_duration(name, seconds)
}

fn bounded_duration(name: &'static str, seconds: f64) -> Result<Duration, ConfigError> {
    let out_of_range = || ConfigError::InvalidValue {
        name,
        expected: "at most 1e9 seconds",
        value: seconds.to_string(),
    };
    if seconds > MAX_SECONDS {
        return Err(out_of_range());
    }

    Duration::try_from_secs_f64(seconds).map_err(|_| out_of_range())
}

fn timeout(value: f64) -> Result<Option<Duration>, ConfigError> {
    if !value.is_finite() || value < 0.0 {
        return Err(ConfigError::InvalidValue {
            name: "timeout",
            expected: "a non-negative number",
            value: value.to_string(),
        });
    }
    if value == 0.0 {
        return Ok(None);
    }

    bounded_duration("timeout", value).map(Some)
}

fn rate_schedule(rps: &RpsConfig) -> Result<RateSchedule, ConfigError> {
    match *rps {
        RpsConfig::Fixed(rate) => Ok(RateSchedule::Fixed(positive_seconds("rps", rate)?)),
        RpsConfig::Stepped(stepped) => {
            let start = positive_seconds("rps.start", stepped.start)?;
            if !stepped.end.is_finite() || stepped.end < start {
                return Err(ConfigError::RpsEndBelowStart {
                    start,
                    end: stepped.end,
                });
            }

            Ok(RateSchedule::Stepped {
                start,
                end: stepped.end,
                step: positive_seconds("rps.step", stepped.step)?,
                stage_duration: duration_seconds("rps.duration", stepped.duration)?,
            })
        }
    }
}

/// A validated runner configuration, one variant per way of driving the scenario.
#[derive(Debug, Clone, PartialEq)]
pub enum Strategy {
    Serial {
        times: u64,
    },
    Constant {
        times: u64,
        concurrency: usize,
        timeout: Option<Duration>,
        max_cpu_count: Option<usize>,
    },
    ConstantForDuration {
        duration: Duration,
        concurrency: usize,
        timeout: Option<Duration>,
        max_cpu_count: Option<usize>,
    },
    Rps {
        times: u64,
        rate: RateSchedule,
        timeout: Option<Duration>,
        max_concurrency: Option<usize>,
        max_cpu_count: Option<usize>,
    },
}

/// The share of a run assigned to one worker group.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GroupPlan {
    pub index: usize,
    pub group_count: usize,
    /// Maximum number of iterations this group keeps in flight.
    pub concurrency: usize,
    /// Number of iterations this group starts, when the group is given a fixed share.
    pub quota: Option<u64>,
}

impl Strategy {
    pub fn name(&self) -> &'static str {
        match self {
            Strategy::Serial { .. } => "serial",
            Strategy::Constant { .. } => "constant",
            Strategy::ConstantForDuration { .. } => "constant_for_duration",
            Strategy::Rps { .. } => "rps",
        }
    }

    pub fn timeout(&self) -> Option<Duration> {
        match self {
            Strategy::Serial { .. } => None,
            Strategy::Constant { timeout, .. }
            | Strategy::ConstantForDuration { timeout, .. }
            | Strategy::Rps { timeout, .. } => *timeout,
        }
    }

    /// The total number of iterations the run will start, if it is bounded by count.
    pub fn planned_iterations(&self) -> Option<u64> {
        match self {
            Strategy::Serial { times }
            | Strategy::Constant { times, .. }
            | Strategy::Rps { times, .. } => Some(*times),
            Strategy::ConstantForDuration { .. } => None,
        }
    }

    pub fn planned_duration(&self) -> Option<Duration> {
        match self {
            Strategy::ConstantForDuration { duration, .. } => Some(*duration),
            _ => None,
        }
    }

    /// Split the run into worker groups given the number of CPUs available.
    ///
    /// The number of groups is capped by the CPU count (and `max_cpu_count`), and budgets are
    /// divided evenly with any remainder going one unit at a time to the first groups.
    pub fn worker_groups(&self, cpu_count: usize) -> Vec<GroupPlan> {
        let cpu_cap = |max_cpu_count: &Option<usize>| {
            max_cpu_count
                .map(|max| max.min(cpu_count))
                .unwrap_or(cpu_count)
                .max(1)
        };

        let (group_count, concurrency, quota) = match self {
            Strategy::Serial { times } => (1, 1, Some(*times)),
            Strategy::Constant {
                times,
                concurrency,
                max_cpu_count,
                ..
            } => {
                let groups = cpu_cap(max_cpu_count)
                    .min(*concurrency)
                    .min(clamp_to_usize(*times));
                (groups, *concurrency, None)
            }
            Strategy::ConstantForDuration {
                concurrency,
                max_cpu_count,
                ..
            } => (cpu_cap(max_cpu_count).min(*concurrency), *concurrency, None),
            Strategy::Rps {
                times,
                max_concurrency,
                max_cpu_count,
                ..
            } => {
                let max_concurrency = max_concurrency.unwrap_or(clamp_to_usize(*times));
                let groups = cpu_cap(max_cpu_count)
                    .min(max_concurrency)
                    .min(clamp_to_usize(*times));
                (groups, max_concurrency, Some(*times))
            }
        };

        let concurrency_shares = distribute(concurrency as u64, group_count);
        let quota_shares = quota.map(|total| distribute(total, group_count));

        (0..group_count)
            .map(|index| GroupPlan {
                index,
                group_count,
                concurrency: concurrency_shares[index] as usize,
                quota: quota_shares.as_ref().map(|shares| shares[index]),
            })
            .collect()
    }
}

fn clamp_to_usize(value: u64) -> usize {
    usize::try_from(value).unwrap_or(usize::MAX)
}

/// Divide `total` into `parts` shares that differ by at most one, larger shares first.
pub fn distribute(total: u64, parts: usize) -> Vec<u64> {
    if parts == 0 {
        return Vec::new();
    }

    let parts_u64 = parts as u64;
    let (share, overhead) = (total / parts_u64, total % parts_u64);
    (0..parts_u64)
        .map(|i| if i < overhead { share + 1 } else { share })
        .collect()
}

/// The number of CPUs worker groups may be spread over.
pub(crate) fn cpu_count() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
}
