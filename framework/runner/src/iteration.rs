use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Instant;

use cloudbench_core::prelude::{now_timestamp, AbortListener, IterationError, IterationResult};

use crate::context::{IterationContext, RunnerContext, UserValuesConstraint};
use crate::definition::{ContextMapperFn, ScenarioArgs, ScenarioFn};

/// Runs single iterations of the scenario and turns whatever happens into an [IterationResult].
///
/// Errors and panics from the context mapper or the scenario body are recorded on the result, they
/// never reach the caller.
pub struct IterationExecutor<RV: UserValuesConstraint, V: UserValuesConstraint> {
    runner_context: Arc<RunnerContext<RV>>,
    scenario: ScenarioFn<RV, V>,
    context_mapper: ContextMapperFn<RV, V>,
    args: Arc<ScenarioArgs>,
}

impl<RV: UserValuesConstraint, V: UserValuesConstraint> Clone for IterationExecutor<RV, V> {
    fn clone(&self) -> Self {
        Self {
            runner_context: self.runner_context.clone(),
            scenario: self.scenario.clone(),
            context_mapper: self.context_mapper.clone(),
            args: self.args.clone(),
        }
    }
}

impl<RV: UserValuesConstraint, V: UserValuesConstraint> IterationExecutor<RV, V> {
    pub fn new(runner_context: Arc<RunnerContext<RV>>, scenario: ScenarioFn<RV, V>) -> Self {
        Self {
            runner_context,
            scenario,
            context_mapper: Arc::new(|_: &RunnerContext<RV>, _: u64| -> anyhow::Result<V> {
                Ok(V::default())
            }),
            args: Arc::new(ScenarioArgs::default()),
        }
    }

    pub fn with_context_mapper(mut self, context_mapper: ContextMapperFn<RV, V>) -> Self {
        self.context_mapper = context_mapper;
        self
    }

    pub fn with_args(mut self, args: ScenarioArgs) -> Self {
        self.args = Arc::new(args);
        self
    }

    pub fn execute(&self, index: u64, abort_listener: &AbortListener) -> IterationResult {
        log::debug!("ITER: {} START", index + 1);

        let timestamp = now_timestamp();
        let started = Instant::now();
        let mut context = None;

        let outcome = std::panic::catch_unwind(AssertUnwindSafe(|| {
            let value = (self.context_mapper)(&self.runner_context, index)?;
            let ctx = context.insert(IterationContext::new(
                index,
                self.runner_context.clone(),
                abort_listener.clone(),
                value,
            ));
            (self.scenario)(ctx, &self.args)
        }));

        let elapsed = started.elapsed().as_secs_f64();
        let (idle_duration, mut output, atomic_actions) = context
            .map(IterationContext::into_parts)
            .unwrap_or_default();

        let error = match outcome {
            Ok(Ok(legacy_output)) => {
                output.additive.extend(legacy_output);
                None
            }
            Ok(Err(e)) => Some(IterationError::from_anyhow(&e)),
            Err(payload) => Some(IterationError::from_panic(payload.as_ref())),
        };

        match &error {
            None => log::debug!("ITER: {} END: OK", index + 1),
            Some(e) => log::debug!("ITER: {} END: Error {}", index + 1, e),
        }

        IterationResult {
            index,
            timestamp,
            duration: (elapsed - idle_duration).max(0.0),
            idle_duration,
            error,
            atomic_actions,
            output,
        }
    }
}

#[cfg(test)]
mod tests {
    use cloudbench_core::prelude::{AbortHandle, NamedError, OutputChart};
    use cloudbench_instruments::Reporter;
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::executor::Executor;

    #[derive(Debug, Default)]
    struct Tenant {
        name: String,
    }

    impl UserValuesConstraint for Tenant {}

    fn runner_context(abort_handle: &AbortHandle) -> Arc<RunnerContext<()>> {
        let runtime = tokio::runtime::Runtime::new().unwrap();
        Arc::new(RunnerContext::new(
            Arc::new(Executor::new(runtime, abort_handle.clone())),
            Arc::new(Reporter::noop()),
            abort_handle.clone(),
            "test".to_string(),
            "run".to_string(),
        ))
    }

    fn executor_for<V: UserValuesConstraint>(
        scenario: impl Fn(&mut IterationContext<(), V>, &ScenarioArgs) -> anyhow::Result<Option<OutputChart>>
            + Send
            + Sync
            + 'static,
    ) -> (IterationExecutor<(), V>, AbortHandle) {
        let abort_handle = AbortHandle::new();
        (
            IterationExecutor::new(runner_context(&abort_handle), Arc::new(scenario)),
            abort_handle,
        )
    }

    #[test]
    fn successful_iteration_excludes_idle_time() {
        let (executor, abort_handle) = executor_for::<()>(|ctx, _| {
            ctx.add_idle_duration(5.0);
            std::thread::sleep(std::time::Duration::from_millis(20));
            Ok(None)
        });

        let result = executor.execute(3, &abort_handle.new_listener());
        assert_eq!(3, result.index);
        assert!(result.error.is_none());
        assert_eq!(5.0, result.idle_duration);
        // Idle time larger than the elapsed time never gives a negative duration.
        assert_eq!(0.0, result.duration);
    }

    #[test]
    fn errors_are_recorded_with_duration() {
        let (executor, abort_handle) = executor_for::<()>(|_, _| {
            std::thread::sleep(std::time::Duration::from_millis(10));
            Err(NamedError::new("NotFound", "No such flavor").into())
        });

        let result = executor.execute(0, &abort_handle.new_listener());
        let error = result.error.unwrap();
        assert_eq!("NotFound", error.kind);
        assert_eq!("No such flavor", error.message);
        assert!(result.duration >= 0.01);
    }

    #[test]
    fn panics_are_recorded() {
        let (executor, abort_handle) = executor_for::<()>(|_, _| panic!("scenario bug"));

        let result = executor.execute(0, &abort_handle.new_listener());
        let error = result.error.unwrap();
        assert_eq!("Panic", error.kind);
        assert_eq!("scenario bug", error.message);
    }

    #[test]
    fn context_mapper_specializes_each_iteration() {
        let (executor, abort_handle) = executor_for::<Tenant>(|ctx, _| {
            if ctx.get().name == "tenant-1" {
                anyhow::bail!("bad tenant");
            }
            Ok(None)
        });
        let executor = executor.with_context_mapper(Arc::new(
            |_: &RunnerContext<()>, index: u64| -> anyhow::Result<Tenant> {
                Ok(Tenant {
                    name: format!("tenant-{}", index % 2),
                })
            },
        ));

        let listener = abort_handle.new_listener();
        assert!(executor.execute(0, &listener).error.is_none());
        assert!(executor.execute(1, &listener).error.is_some());
    }

    #[test]
    fn context_mapper_failure_is_a_failed_iteration() {
        let (executor, abort_handle) = executor_for::<()>(|_, _| Ok(None));
        let executor = executor.with_context_mapper(Arc::new(
            |_: &RunnerContext<()>, _: u64| -> anyhow::Result<()> {
                anyhow::bail!("no credentials left")
            },
        ));

        let result = executor.execute(0, &abort_handle.new_listener());
        assert_eq!("no credentials left", result.error.unwrap().message);
    }

    #[test]
    fn legacy_output_is_appended_to_additive_output() {
        let (executor, abort_handle) = executor_for::<()>(|ctx, args| {
            ctx.add_output(
                Some(OutputChart::new("Custom", "Lines", serde_json::json!([]))),
                None,
            )?;
            let mut map = serde_json::Map::new();
            map.insert(
                "size".to_string(),
                args.get("size").cloned().unwrap_or_default(),
            );
            Ok(crate::definition::IntoScenarioOutput::into_scenario_output(map))
        });
        let executor = executor.with_args(ScenarioArgs::new(serde_json::json!({"size": 3})));

        let result = executor.execute(0, &abort_handle.new_listener());
        assert_eq!(
            vec!["Custom", "Scenario output"],
            result
                .output
                .additive
                .iter()
                .map(|c| c.title.as_str())
                .collect::<Vec<_>>()
        );
    }
}
