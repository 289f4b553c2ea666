use itertools::Itertools;
use serde::{Deserialize, Serialize};
use sha3::Digest;
use std::collections::HashMap;
use std::io::{BufRead, Read, Write};
use std::path::PathBuf;

/// The outcome of one pass/fail criterion evaluated over the results of a run.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SlaResult {
    /// The name of the criterion, such as `failure_rate`
    pub criterion: String,
    pub success: bool,
    /// Human readable explanation of the outcome
    pub detail: String,
}

impl SlaResult {
    pub fn new(criterion: impl Into<String>, success: bool, detail: impl Into<String>) -> Self {
        Self {
            criterion: criterion.into(),
            success,
            detail: detail.into(),
        }
    }
}

/// Summary of a run
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RunSummary {
    /// The unique run id
    ///
    /// Chosen by the runner. Unique for each run.
    pub run_id: String,
    /// The name of the scenario that was run
    pub scenario_name: String,
    /// The time the run started
    ///
    /// This is a Unix timestamp in seconds.
    pub started_at: i64,
    /// The runner configuration that the run was started with, as JSON
    pub runner: serde_json::Value,
    /// The number of iteration results delivered to the consumer
    ///
    /// Timed out iterations are included, they are delivered as failed results.
    pub iterations: usize,
    /// The number of delivered results that carry an error
    pub failures: usize,
    /// Seconds from the start of the first iteration to the end of the last one
    pub load_duration: f64,
    /// Seconds the runner spent from starting the first worker to joining the last one
    pub full_duration: f64,
    /// How the run was aborted, if it was
    ///
    /// One of `soft_abort` or `hard_abort`.
    pub aborted: Option<String>,
    /// Results of the pass/fail criteria evaluated during the run
    pub sla: Vec<SlaResult>,
    /// Environment variables set for the run
    ///
    /// This won't capture all environment variables. Just the ones that the runner is aware of or
    /// that are included by the scenario itself.
    pub env: HashMap<String, String>,
    /// The version of CloudBench that was used for this run
    pub cloudbench_version: String,
}

impl RunSummary {
    /// Create a new run summary
    pub fn new(
        run_id: String,
        scenario_name: String,
        started_at: i64,
        runner: serde_json::Value,
        cloudbench_version: String,
    ) -> Self {
        Self {
            run_id,
            scenario_name,
            started_at,
            runner,
            iterations: 0,
            failures: 0,
            load_duration: 0.0,
            full_duration: 0.0,
            aborted: None,
            sla: Vec::new(),
            env: HashMap::with_capacity(0),
            cloudbench_version,
        }
    }

    /// Add an environment variable
    pub fn add_env(&mut self, key: String, value: String) {
        self.env.insert(key, value);
    }

    /// Whether every criterion passed
    pub fn passed(&self) -> bool {
        self.sla.iter().all(|r| r.success)
    }

    /// Compute a fingerprint for this run summary
    ///
    /// The fingerprint is intended to uniquely identify the configuration used to run the scenario.
    /// It uses the
    ///     - Scenario name
    ///     - Runner configuration
    ///     - Selected environment variables
    ///     - CloudBench version
    ///
    /// The fingerprint is computed using [sha3::Sha3_256].
    pub fn fingerprint(&self) -> String {
        let mut hasher = sha3::Sha3_256::new();
        Digest::update(&mut hasher, self.scenario_name.as_bytes());
        Digest::update(&mut hasher, self.runner.to_string().as_bytes());
        self.env
            .iter()
            .sorted_by_key(|(k, _)| k.to_owned())
            .for_each(|(k, v)| {
                Digest::update(&mut hasher, k.as_bytes());
                Digest::update(&mut hasher, v.as_bytes());
            });
        Digest::update(&mut hasher, self.cloudbench_version.as_bytes());

        format!("{:x}", hasher.finalize())
    }
}

/// Append the run summary to a file
///
/// The summary will be serialized to JSON and output as a single line followed by a newline. The
/// recommended file extension is `.jsonl`.
pub fn append_run_summary(run_summary: &RunSummary, path: PathBuf) -> anyhow::Result<()> {
    let mut file = std::fs::OpenOptions::new()
        .append(true)
        .create(true)
        .open(path)?;
    store_run_summary(run_summary, &mut file)?;
    file.write_all("\n".as_bytes())?;
    Ok(())
}

/// Serialize the run summary to a writer
pub fn store_run_summary<W: Write>(run_summary: &RunSummary, writer: &mut W) -> anyhow::Result<()> {
    serde_json::to_writer(writer, run_summary)?;
    Ok(())
}

/// Load a run summary from a reader
pub fn load_run_summary<R: Read>(reader: R) -> anyhow::Result<RunSummary> {
    let reader = std::io::BufReader::new(reader);
    let run_summary: RunSummary = serde_json::from_reader(reader)?;
    Ok(run_summary)
}

/// Load run summaries from a file
///
/// The file should contain one JSON object per line. This is the format produced by
/// [append_run_summary].
pub fn load_summary_runs(path: PathBuf) -> anyhow::Result<Vec<RunSummary>> {
    let file = std::fs::File::open(path)?;
    let reader = std::io::BufReader::new(file);
    let mut runs = Vec::new();
    for line in reader.lines() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        let run: RunSummary = serde_json::from_str(&line)?;
        runs.push(run);
    }
    Ok(runs)
}
