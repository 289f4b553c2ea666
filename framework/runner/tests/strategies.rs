use std::collections::BTreeSet;
use std::io::BufRead;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use cloudbench_runner::prelude::{
    run, CloudBenchScenarioCli, ConfigError, IterationResult, NamedError, RpsConfig,
    ScenarioDefinitionBuilder, SteppedRpsConfig,
};
use pretty_assertions::assert_eq;

fn cli(runner: &str, results_file: &Path) -> CloudBenchScenarioCli {
    CloudBenchScenarioCli {
        runner: Some(runner.to_string()),
        batch_size: 1,
        no_progress: true,
        results_file: Some(results_file.to_path_buf()),
        ..Default::default()
    }
}

fn read_results(path: &Path) -> Vec<IterationResult> {
    let file = std::fs::File::open(path).unwrap();
    std::io::BufReader::new(file)
        .lines()
        .map(|line| serde_json::from_str(&line.unwrap()).unwrap())
        .collect()
}

fn indices(results: &[IterationResult]) -> BTreeSet<u64> {
    results.iter().map(|r| r.index).collect()
}

#[test]
fn serial_runs_every_iteration_in_order() {
    let dir = tempfile::tempdir().unwrap();
    let results_file = dir.path().join("results.jsonl");

    let scenario = ScenarioDefinitionBuilder::<(), ()>::new(
        "serial_runs_every_iteration_in_order",
        CloudBenchScenarioCli {
            times: Some(5),
            ..cli("serial", &results_file)
        },
    )
    .use_scenario(|_, _| {
        std::thread::sleep(Duration::from_millis(100));
        Ok(())
    });

    let summary = run(scenario).unwrap();
    let results = read_results(&results_file);

    assert_eq!(
        vec![0, 1, 2, 3, 4],
        results.iter().map(|r| r.index).collect::<Vec<_>>()
    );
    assert!(results.iter().all(|r| r.error.is_none()));
    assert!(results.iter().all(|r| r.duration >= 0.1));
    assert_eq!(5, summary.iterations);
    assert_eq!(0, summary.failures);
}

#[test]
fn constant_records_every_failure() {
    let dir = tempfile::tempdir().unwrap();
    let results_file = dir.path().join("results.jsonl");

    let scenario = ScenarioDefinitionBuilder::<(), ()>::new(
        "constant_records_every_failure",
        CloudBenchScenarioCli {
            times: Some(10),
            concurrency: Some(3),
            ..cli("constant", &results_file)
        },
    )
    .use_scenario(|ctx, _| -> anyhow::Result<()> {
        Err(NamedError::new("Conflict", format!("iteration {} failed", ctx.iteration())).into())
    });

    let summary = run(scenario).unwrap();
    let results = read_results(&results_file);

    assert_eq!(10, results.len());
    assert_eq!((0..10).collect::<BTreeSet<_>>(), indices(&results));
    assert!(results
        .iter()
        .all(|r| r.error.as_ref().is_some_and(|e| e.kind == "Conflict")));
    assert_eq!(10, summary.failures);
}

#[test]
fn rps_spreads_iterations_over_time() {
    let dir = tempfile::tempdir().unwrap();
    let results_file = dir.path().join("results.jsonl");

    let scenario = ScenarioDefinitionBuilder::<(), ()>::new(
        "rps_spreads_iterations_over_time",
        CloudBenchScenarioCli {
            times: Some(20),
            rps: Some(RpsConfig::Fixed(10.0)),
            ..cli("rps", &results_file)
        },
    )
    .use_scenario(|_, _| Ok(()));

    let summary = run(scenario).unwrap();
    let results = read_results(&results_file);

    assert_eq!((0..20).collect::<BTreeSet<_>>(), indices(&results));
    // The last of 20 iterations at 10 per second starts 1.9s after the first.
    assert!(
        summary.load_duration > 1.5 && summary.load_duration < 3.0,
        "load duration {}",
        summary.load_duration
    );
}

#[test]
fn constant_for_duration_stops_starting_iterations() {
    let dir = tempfile::tempdir().unwrap();
    let results_file = dir.path().join("results.jsonl");

    let scenario = ScenarioDefinitionBuilder::<(), ()>::new(
        "constant_for_duration_stops_starting_iterations",
        CloudBenchScenarioCli {
            duration: Some(0.5),
            concurrency: Some(2),
            ..cli("constant_for_duration", &results_file)
        },
    )
    .use_scenario(|_, _| {
        std::thread::sleep(Duration::from_millis(50));
        Ok(())
    });

    let summary = run(scenario).unwrap();
    let results = read_results(&results_file);

    assert_eq!(summary.iterations, results.len());
    assert_eq!((0..results.len() as u64).collect::<BTreeSet<_>>(), indices(&results));
    assert!(summary.iterations >= 4, "iterations {}", summary.iterations);
    assert!(summary.load_duration < 2.0);
    assert!(summary.aborted.is_none());
}

#[test]
fn timed_out_iterations_are_failures() {
    let dir = tempfile::tempdir().unwrap();
    let results_file = dir.path().join("results.jsonl");

    let scenario = ScenarioDefinitionBuilder::<(), ()>::new(
        "timed_out_iterations_are_failures",
        CloudBenchScenarioCli {
            times: Some(4),
            concurrency: Some(2),
            timeout: Some(0.1),
            ..cli("constant", &results_file)
        },
    )
    .use_scenario(|ctx, _| {
        if ctx.index() % 2 == 1 {
            std::thread::sleep(Duration::from_millis(500));
        }
        Ok(())
    });

    let summary = run(scenario).unwrap();
    let results = read_results(&results_file);

    assert_eq!((0..4).collect::<BTreeSet<_>>(), indices(&results));
    let timed_out = results
        .iter()
        .filter(|r| {
            r.error
                .as_ref()
                .is_some_and(|e| e.kind == "TimeoutException")
        })
        .map(|r| r.index)
        .collect::<BTreeSet<_>>();
    assert_eq!(BTreeSet::from([1, 3]), timed_out);
    assert_eq!(2, summary.failures);
}

#[test]
fn sla_failure_aborts_the_run() {
    let scenario = ScenarioDefinitionBuilder::<(), ()>::new(
        "sla_failure_aborts_the_run",
        CloudBenchScenarioCli {
            runner: Some("constant".to_string()),
            times: Some(10_000),
            concurrency: Some(2),
            abort_on_sla_failure: true,
            sla_max_failure_percent: Some(0.0),
            no_progress: true,
            batch_size: 1,
            ..Default::default()
        },
    )
    .use_scenario(|ctx, _| {
        std::thread::sleep(Duration::from_millis(1));
        if ctx.index() == 5 {
            anyhow::bail!("unlucky");
        }
        Ok(())
    });

    let summary = run(scenario).unwrap();

    assert!(summary.iterations < 10_000);
    assert_eq!(Some("soft_abort".to_string()), summary.aborted);
    assert!(!summary.passed());
    assert_eq!(
        vec!["failure_rate", "aborted_on_sla"],
        summary
            .sla
            .iter()
            .map(|r| r.criterion.as_str())
            .collect::<Vec<_>>()
    );
}

#[test]
fn scenario_can_abort_the_run() {
    let started = Arc::new(AtomicUsize::new(0));
    let counter = started.clone();

    let scenario = ScenarioDefinitionBuilder::<(), ()>::new(
        "scenario_can_abort_the_run",
        CloudBenchScenarioCli {
            runner: Some("constant".to_string()),
            times: Some(10_000),
            concurrency: Some(4),
            no_progress: true,
            batch_size: 1,
            ..Default::default()
        },
    )
    .use_scenario(move |ctx, _| {
        counter.fetch_add(1, Ordering::SeqCst);
        std::thread::sleep(Duration::from_millis(2));
        if ctx.index() == 20 {
            ctx.runner_context().abort_run();
        }
        Ok(())
    });

    let summary = run(scenario).unwrap();

    // Every started iteration is reported, even after the abort.
    assert_eq!(started.load(Ordering::SeqCst), summary.iterations);
    assert!(summary.iterations < 10_000);
    assert_eq!(Some("soft_abort".to_string()), summary.aborted);
    assert!(summary.sla.iter().any(|r| r.criterion == "aborted_manually"));
}

#[test]
fn scenario_can_force_stop_the_run() {
    let scenario = ScenarioDefinitionBuilder::<(), ()>::new(
        "scenario_can_force_stop_the_run",
        CloudBenchScenarioCli {
            runner: Some("constant".to_string()),
            times: Some(10_000),
            concurrency: Some(2),
            no_progress: true,
            batch_size: 1,
            ..Default::default()
        },
    )
    .use_scenario(|ctx, _| {
        if ctx.index() == 10 {
            ctx.runner_context().force_stop_scenario();
        }
        std::thread::sleep(Duration::from_millis(2));
        Ok(())
    });

    let summary = run(scenario).unwrap();

    assert!(summary.iterations < 10_000);
    assert_eq!(Some("hard_abort".to_string()), summary.aborted);
    assert!(summary.sla.iter().any(|r| r.criterion == "aborted_manually"));
}

#[test]
fn invalid_configs_are_rejected() {
    let concurrency_above_times = CloudBenchScenarioCli {
        runner: Some("constant".to_string()),
        times: Some(3),
        concurrency: Some(5),
        no_progress: true,
        ..Default::default()
    };
    let falling_rps = CloudBenchScenarioCli {
        runner: Some("rps".to_string()),
        times: Some(3),
        rps: Some(RpsConfig::Stepped(SteppedRpsConfig {
            start: 5.0,
            end: 3.0,
            step: 1.0,
            duration: 1.0,
        })),
        no_progress: true,
        ..Default::default()
    };

    let unschedulable_timeout = CloudBenchScenarioCli {
        runner: Some("constant".to_string()),
        times: Some(2),
        timeout: Some(1e19),
        no_progress: true,
        ..Default::default()
    };

    for cli in [concurrency_above_times, falling_rps, unschedulable_timeout] {
        let started = Arc::new(AtomicUsize::new(0));
        let counter = started.clone();
        let scenario = ScenarioDefinitionBuilder::<(), ()>::new("invalid_configs_are_rejected", cli)
            .use_scenario(move |_, _| {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            });

        let err = run(scenario).unwrap_err();
        assert!(err.downcast_ref::<ConfigError>().is_some(), "{err:?}");
        assert_eq!(0, started.load(Ordering::SeqCst));
    }
}
