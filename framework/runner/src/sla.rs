use cloudbench_core::prelude::IterationResult;
use cloudbench_summary_model::SlaResult;

/// A pass/fail criterion evaluated incrementally over the results of a run.
pub trait Criterion: Send {
    fn name(&self) -> &str;

    /// Account for one more result. Returns whether the criterion still passes.
    fn add_iteration(&mut self, result: &IterationResult) -> bool;

    fn success(&self) -> bool;

    /// Human readable description of the current state.
    fn details(&self) -> String;

    fn result(&self) -> SlaResult {
        SlaResult::new(self.name(), self.success(), self.details())
    }
}

fn status(success: bool) -> &'static str {
    if success {
        "Passed"
    } else {
        "Failed"
    }
}

/// Fails once the percentage of failed iterations goes above `max_percent`.
#[derive(Debug, Clone)]
pub struct FailureRate {
    max_percent: f64,
    total: u64,
    errors: u64,
    error_rate: f64,
    success: bool,
}

impl FailureRate {
    pub fn new(max_percent: f64) -> Self {
        Self {
            max_percent,
            total: 0,
            errors: 0,
            error_rate: 0.0,
            success: true,
        }
    }
}

impl Criterion for FailureRate {
    fn name(&self) -> &str {
        "failure_rate"
    }

    fn add_iteration(&mut self, result: &IterationResult) -> bool {
        self.total += 1;
        if result.is_error() {
            self.errors += 1;
        }
        self.error_rate = self.errors as f64 * 100.0 / self.total as f64;
        self.success = self.error_rate <= self.max_percent;
        self.success
    }

    fn success(&self) -> bool {
        self.success
    }

    fn details(&self) -> String {
        format!(
            "Failure rate criteria {:.2}% <= {:.2}% - {}",
            self.error_rate,
            self.max_percent,
            status(self.success)
        )
    }
}

/// Fails once any iteration takes longer than `max_seconds`.
#[derive(Debug, Clone)]
pub struct MaxSecondsPerIteration {
    max_seconds: f64,
    max_seen: f64,
    success: bool,
}

impl MaxSecondsPerIteration {
    pub fn new(max_seconds: f64) -> Self {
        Self {
            max_seconds,
            max_seen: 0.0,
            success: true,
        }
    }
}

impl Criterion for MaxSecondsPerIteration {
    fn name(&self) -> &str {
        "max_seconds_per_iteration"
    }

    fn add_iteration(&mut self, result: &IterationResult) -> bool {
        self.max_seen = self.max_seen.max(result.duration);
        self.success = self.max_seen <= self.max_seconds;
        self.success
    }

    fn success(&self) -> bool {
        self.success
    }

    fn details(&self) -> String {
        format!(
            "Maximum seconds per iteration {:.2}s <= {:.2}s - {}",
            self.max_seen,
            self.max_seconds,
            status(self.success)
        )
    }
}

/// Evaluates every configured criterion and remembers why a run was aborted.
#[derive(Default)]
pub struct SlaChecker {
    criteria: Vec<Box<dyn Criterion>>,
    aborted_on_sla: bool,
    aborted_manually: bool,
}

impl std::fmt::Debug for SlaChecker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SlaChecker")
            .field(
                "criteria",
                &self.criteria.iter().map(|c| c.name()).collect::<Vec<_>>(),
            )
            .field("aborted_on_sla", &self.aborted_on_sla)
            .field("aborted_manually", &self.aborted_manually)
            .finish()
    }
}

impl SlaChecker {
    pub fn new(criteria: Vec<Box<dyn Criterion>>) -> Self {
        Self {
            criteria,
            ..Default::default()
        }
    }

    pub fn is_empty(&self) -> bool {
        self.criteria.is_empty()
    }

    /// Feed a result to every criterion. Returns `true` if all of them still pass.
    pub fn add_iteration(&mut self, result: &IterationResult) -> bool {
        self.criteria
            .iter_mut()
            .fold(true, |passed, c| c.add_iteration(result) && passed)
    }

    pub fn set_aborted_on_sla(&mut self) {
        self.aborted_on_sla = true;
    }

    pub fn aborted_on_sla(&self) -> bool {
        self.aborted_on_sla
    }

    pub fn set_aborted_manually(&mut self) {
        self.aborted_manually = true;
    }

    pub fn results(&self) -> Vec<SlaResult> {
        let mut results = self
            .criteria
            .iter()
            .map(|c| c.result())
            .collect::<Vec<_>>();

        if self.aborted_on_sla {
            results.push(SlaResult::new(
                "aborted_on_sla",
                false,
                "Run was aborted due to SLA failure(s).",
            ));
        }
        if self.aborted_manually {
            results.push(SlaResult::new(
                "aborted_manually",
                false,
                "Run was aborted due to abort signal.",
            ));
        }
        results
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use pretty_assertions::assert_eq;

    use super::*;

    fn result(duration: f64, failed: bool) -> IterationResult {
        let mut result = IterationResult::timed_out(0, 0.0, Duration::from_secs(1));
        result.duration = duration;
        if !failed {
            result.error = None;
        }
        result
    }

    #[test]
    fn failure_rate_is_cumulative() {
        let mut criterion = FailureRate::new(50.0);
        assert!(!criterion.add_iteration(&result(0.1, true)));
        assert!(criterion.add_iteration(&result(0.1, false)));
        assert!(criterion.add_iteration(&result(0.1, false)));
        assert_eq!(
            "Failure rate criteria 33.33% <= 50.00% - Passed",
            criterion.details()
        );
    }

    #[test]
    fn max_seconds_remembers_the_slowest_iteration() {
        let mut criterion = MaxSecondsPerIteration::new(1.0);
        assert!(criterion.add_iteration(&result(0.5, false)));
        assert!(!criterion.add_iteration(&result(1.5, false)));
        assert!(!criterion.add_iteration(&result(0.2, false)));

        let sla = criterion.result();
        assert_eq!("max_seconds_per_iteration", sla.criterion);
        assert!(!sla.success);
    }

    #[test]
    fn checker_evaluates_every_criterion() {
        let criteria: Vec<Box<dyn Criterion>> = vec![
            Box::new(FailureRate::new(0.0)),
            Box::new(MaxSecondsPerIteration::new(1.0)),
        ];
        let mut checker = SlaChecker::new(criteria);

        assert!(!checker.add_iteration(&result(2.0, true)));
        let results = checker.results();
        assert_eq!(2, results.len());
        assert!(results.iter().all(|r| !r.success));
    }

    #[test]
    fn checker_reports_abort_reasons() {
        let mut checker = SlaChecker::default();
        assert!(checker.add_iteration(&result(2.0, true)));
        assert!(checker.results().is_empty());

        checker.set_aborted_on_sla();
        checker.set_aborted_manually();
        let names = checker
            .results()
            .into_iter()
            .map(|r| r.criterion)
            .collect::<Vec<_>>();
        assert_eq!(vec!["aborted_on_sla", "aborted_manually"], names);
    }
}
