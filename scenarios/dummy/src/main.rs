use std::time::Duration;

use cloudbench_runner::prelude::*;

/// Arguments accepted through `--args`, for example `--args '{"min_sleep": 0.1, "failure_every": 5}'`.
#[derive(Debug, Default, serde::Deserialize)]
#[serde(default)]
struct DummyArgs {
    min_sleep: f64,
    max_sleep: f64,
    /// Fail every nth iteration, never if 0.
    failure_every: u64,
}

#[derive(Debug, Default)]
struct ScenarioValues {
    labels: Vec<String>,
}

impl UserValuesConstraint for ScenarioValues {}

#[derive(Debug, Default)]
struct IterationValues {
    label: String,
}

impl UserValuesConstraint for IterationValues {}

fn setup(ctx: &mut RunnerContext<ScenarioValues>) -> HookResult {
    log::info!("Setting up run {}", ctx.run_id());
    ctx.get_mut().labels = vec!["small".to_string(), "medium".to_string(), "large".to_string()];
    Ok(())
}

fn teardown(ctx: std::sync::Arc<RunnerContext<ScenarioValues>>) -> HookResult {
    log::info!("Tearing down run {}", ctx.run_id());
    Ok(())
}

fn main() -> CloudBenchResult<()> {
    let builder =
        ScenarioDefinitionBuilder::<ScenarioValues, IterationValues>::new_with_init(env!(
            "CARGO_PKG_NAME"
        ))
        .with_default_config(RunnerConfig::from_yaml_str(
            "type: constant\ntimes: 20\nconcurrency: 4",
        )?)
        .with_args(serde_json::json!({"min_sleep": 0.0, "max_sleep": 0.2}))
        .use_setup(setup)
        .use_context_mapper(|runner_ctx, index| {
            let labels = &runner_ctx.get().labels;
            Ok(IterationValues {
                label: labels
                    .get(index as usize % labels.len().max(1))
                    .cloned()
                    .unwrap_or_default(),
            })
        })
        .use_scenario(|ctx, args| {
            let args: DummyArgs = args.parse()?;

            ctx.sleep_between(args.min_sleep, args.max_sleep.max(args.min_sleep))?;

            let label = ctx.get().label.clone();
            ctx.atomic("dummy.prepare", |ctx| {
                ctx.atomic("dummy.lookup", |_| {
                    std::thread::sleep(Duration::from_millis(5));
                    Ok(())
                })
            })?;

            let executor = ctx.runner_context().executor().clone();
            let value = ctx.atomic("dummy.request", |_| {
                executor.execute_in_place(async move {
                    tokio::time::sleep(Duration::from_millis(10)).await;
                    Ok(label.len())
                })
            })?;

            if args.failure_every > 0 && ctx.iteration() % args.failure_every == 0 {
                return Err(NamedError::new("DummyFailure", "Failing on purpose").into());
            }

            ctx.add_output(
                Some(OutputChart::new(
                    "Label length",
                    "StackedArea",
                    serde_json::json!([["length", value]]),
                )),
                None,
            )?;

            let mut legacy = serde_json::Map::new();
            legacy.insert("value".to_string(), serde_json::json!(value));
            Ok(legacy)
        })
        .use_teardown(teardown);

    let summary = run(builder)?;
    if !summary.passed() {
        anyhow::bail!("SLA failed for run {}", summary.run_id);
    }

    Ok(())
}
