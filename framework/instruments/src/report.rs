mod jsonl_report;
mod summary_report;

use std::path::PathBuf;

use cloudbench_core::prelude::IterationResult;
use parking_lot::Mutex;

pub use jsonl_report::JsonlResultCollector;
pub use summary_report::SummaryReportCollector;

/// Receives every iteration result delivered to the consumer of a run.
pub trait ReportCollector {
    fn add_iteration(&mut self, result: &IterationResult);

    /// Called once, after the last result of the run has been added.
    fn finalize(&mut self);
}

/// Choose which collectors a [Reporter] fans results out to.
#[derive(Debug, Default)]
pub struct ReportConfig {
    scenario_name: String,
    summary: bool,
    results_file: Option<PathBuf>,
}

impl ReportConfig {
    pub fn new(scenario_name: impl Into<String>) -> Self {
        Self {
            scenario_name: scenario_name.into(),
            ..Default::default()
        }
    }

    /// Print a table of iteration and atomic action durations at the end of the run.
    pub fn enable_summary(mut self) -> Self {
        self.summary = true;
        self
    }

    /// Write every raw result to a JSON lines file.
    pub fn enable_results_file(mut self, path: PathBuf) -> Self {
        self.results_file = Some(path);
        self
    }

    pub fn init(self) -> anyhow::Result<Reporter> {
        let mut collectors: Vec<Box<dyn ReportCollector + Send>> = Vec::new();

        if self.summary {
            collectors.push(Box::new(SummaryReportCollector::new(self.scenario_name)));
        }

        if let Some(path) = self.results_file {
            collectors.push(Box::new(JsonlResultCollector::new(path)?));
        }

        Ok(Reporter {
            collectors: Mutex::new(collectors),
        })
    }
}

/// Fans results out to the configured collectors.
pub struct Reporter {
    collectors: Mutex<Vec<Box<dyn ReportCollector + Send>>>,
}

impl Reporter {
    /// A reporter with no collectors, results are dropped.
    pub fn noop() -> Self {
        Self {
            collectors: Mutex::new(Vec::new()),
        }
    }

    pub fn add_collector(&self, collector: Box<dyn ReportCollector + Send>) {
        self.collectors.lock().push(collector);
    }

    pub fn add_iteration(&self, result: &IterationResult) {
        for collector in self.collectors.lock().iter_mut() {
            collector.add_iteration(result);
        }
    }

    pub fn finalize(&self) {
        for collector in self.collectors.lock().iter_mut() {
            collector.finalize();
        }
    }
}

impl std::fmt::Debug for Reporter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Reporter")
            .field("collectors", &self.collectors.lock().len())
            .finish()
    }
}
