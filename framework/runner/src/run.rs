use std::sync::atomic::AtomicU64;
use std::sync::Arc;
use std::time::Instant;

use anyhow::Context;
use cloudbench_core::prelude::{AbortHandle, AbortState};
use cloudbench_instruments::ReportConfig;
use cloudbench_summary_model::{append_run_summary, RunSummary};

use crate::consumer::RunConsumer;
use crate::iteration::IterationExecutor;
use crate::monitor::start_monitor;
use crate::progress::{start_progress, ProgressPlan};
use crate::runner::ScenarioRunner;
use crate::sla::SlaChecker;
use crate::{
    context::{RunnerContext, UserValuesConstraint},
    definition::ScenarioDefinitionBuilder,
    executor::Executor,
    shutdown::start_abort_listener,
};

/// Environment variables recorded in the run summary when they are set.
const SUMMARY_ENV_VARS: &[&str] = &["RUST_LOG"];

/// Run a scenario to completion and return its summary.
///
/// The runner configuration is validated before anything else happens, so a bad configuration
/// fails without running the setup hook or any iteration. The teardown hook runs whenever setup
/// succeeded, even if the run itself failed.
pub fn run<RV: UserValuesConstraint, V: UserValuesConstraint>(
    definition: ScenarioDefinitionBuilder<RV, V>,
) -> anyhow::Result<RunSummary> {
    let definition = definition.build()?;

    log::info!(
        "Running scenario {} with the {} runner",
        definition.name,
        definition.strategy.name()
    );

    let runtime = tokio::runtime::Runtime::new().context("Failed to create Tokio runtime")?;
    let abort_handle = AbortHandle::new();
    start_abort_listener(&runtime, abort_handle.clone());
    let executor = Arc::new(Executor::new(runtime, abort_handle.clone()));

    let mut report_config = ReportConfig::new(definition.name.clone()).enable_summary();
    if let Some(path) = &definition.cli.results_file {
        report_config = report_config.enable_results_file(path.clone());
    }
    let reporter = Arc::new(report_config.init()?);

    let run_id = definition
        .cli
        .run_id
        .clone()
        .unwrap_or_else(|| nanoid::nanoid!());
    let started_at = chrono::Utc::now().timestamp();
    let full_started = Instant::now();

    let mut runner_context = RunnerContext::new(
        executor,
        reporter.clone(),
        abort_handle.clone(),
        definition.name.clone(),
        run_id.clone(),
    );

    if let Some(setup_fn) = definition.setup_fn {
        setup_fn(&mut runner_context)?;
    }

    let runner_context = Arc::new(runner_context);

    // Stopped once the runner returns, separately from the run's own abort signal.
    let observers = AbortHandle::new();
    let completed = Arc::new(AtomicU64::new(0));
    if !definition.cli.no_progress {
        start_progress(
            ProgressPlan::for_strategy(&definition.strategy, completed.clone()),
            observers.new_listener(),
        );
    }

    // Report high usage by the load generator, which might lead to a misleading outcome.
    start_monitor(observers.new_listener());

    let runner = ScenarioRunner::new(definition.strategy.clone())
        .with_batch_size(definition.batch_size)
        .with_abort_handle(abort_handle.clone());
    let iteration_executor =
        IterationExecutor::new(runner_context.clone(), definition.scenario.clone())
            .with_context_mapper(definition.context_mapper.clone())
            .with_args(definition.args.clone());
    let consumer = RunConsumer::new(
        reporter.clone(),
        SlaChecker::new(definition.criteria),
        definition.cli.abort_on_sla_failure,
        completed,
    );

    let outcome = runner.run(iteration_executor, consumer);
    observers.soft_abort();

    if let Some(teardown_fn) = definition.teardown_fn {
        // Don't crash the runner if the teardown fails. We still want the reporting to happen
        // cleanly. The hook is documented as 'best effort'
        if let Err(e) = teardown_fn(runner_context.clone()) {
            log::error!("Teardown failed: {:?}", e);
        }
    }

    reporter.finalize();

    let outcome = outcome?;
    let mut sla = outcome.consumer.into_sla();
    if outcome.abort_state != AbortState::NotAborted && !sla.aborted_on_sla() {
        sla.set_aborted_manually();
    }

    let mut summary = RunSummary::new(
        run_id,
        definition.name.clone(),
        started_at,
        definition.config.to_json(),
        env!("CARGO_PKG_VERSION").to_string(),
    );
    summary.iterations = outcome.stats.delivered;
    summary.failures = outcome.stats.failures;
    summary.load_duration = outcome.stats.load_duration();
    summary.full_duration = full_started.elapsed().as_secs_f64();
    summary.aborted = match outcome.abort_state {
        AbortState::NotAborted => None,
        AbortState::SoftAbort => Some("soft_abort".to_string()),
        AbortState::HardAbort => Some("hard_abort".to_string()),
    };
    summary.sla = sla.results();
    for key in SUMMARY_ENV_VARS {
        if let Ok(value) = std::env::var(key) {
            summary.add_env(key.to_string(), value);
        }
    }

    log::info!(
        "Scenario {} finished {} iterations with {} failures, SLA {}",
        summary.scenario_name,
        summary.iterations,
        summary.failures,
        if summary.passed() { "passed" } else { "failed" }
    );

    if let Some(path) = &definition.cli.summary_file {
        append_run_summary(&summary, path.clone())
            .with_context(|| format!("Failed to write run summary to {}", path.display()))?;
    }

    Ok(summary)
}
