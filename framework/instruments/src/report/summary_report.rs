mod actions_table;

use crate::atomic::merge_atomic_actions;
use crate::report::summary_report::actions_table::ActionRow;
use crate::report::ReportCollector;
use crate::stats::DurationStats;
use cloudbench_core::prelude::IterationResult;
use tabled::settings::Style;
use tabled::Table;

#[derive(Debug, Default)]
struct ActionSamples {
    durations: Vec<f64>,
    count: usize,
    successes: usize,
}

impl ActionSamples {
    fn record(&mut self, duration: f64, success: bool) {
        self.count += 1;
        if success {
            self.successes += 1;
            self.durations.push(duration);
        }
    }

    fn to_row(&self, action: String) -> ActionRow {
        let stats = DurationStats::from_durations(&self.durations);
        ActionRow {
            action,
            min: stats.map(|s| s.min),
            median: stats.map(|s| s.median),
            p90: stats.map(|s| s.p90),
            p95: stats.map(|s| s.p95),
            max: stats.map(|s| s.max),
            avg: stats.map(|s| s.avg),
            success: if self.count == 0 {
                0.0
            } else {
                self.successes as f64 * 100.0 / self.count as f64
            },
            count: self.count,
        }
    }
}

/// Keeps duration samples in memory and prints a table of the iterations and their top level
/// atomic actions at the end of the run.
///
/// Statistics only include successful iterations (and actions), the success column shows how many
/// there were.
pub struct SummaryReportCollector {
    scenario_name: String,
    total: ActionSamples,
    actions: Vec<(String, ActionSamples)>,
}

impl SummaryReportCollector {
    pub fn new(scenario_name: impl Into<String>) -> Self {
        Self {
            scenario_name: scenario_name.into(),
            total: ActionSamples::default(),
            actions: Vec::new(),
        }
    }

    fn rows(&self) -> Vec<ActionRow> {
        self.actions
            .iter()
            .map(|(name, samples)| samples.to_row(name.clone()))
            .chain(std::iter::once(self.total.to_row("total".to_string())))
            .collect()
    }

    pub(crate) fn render(&self) -> String {
        let mut table = Table::new(self.rows());
        table.with(Style::modern());
        table.to_string()
    }
}

impl ReportCollector for SummaryReportCollector {
    fn add_iteration(&mut self, result: &IterationResult) {
        self.total.record(result.duration, !result.is_error());

        for merged in merge_atomic_actions(&result.atomic_actions, 0) {
            let position = match self.actions.iter().position(|(name, _)| *name == merged.name) {
                Some(position) => position,
                None => {
                    self.actions
                        .push((merged.name.clone(), ActionSamples::default()));
                    self.actions.len() - 1
                }
            };
            self.actions[position]
                .1
                .record(merged.duration, !merged.failed);
        }
    }

    fn finalize(&mut self) {
        println!("\nSummary of iterations for {}", self.scenario_name);
        println!("{}", self.render());
    }
}
