use std::sync::Arc;

use anyhow::Context;
use cloudbench_core::prelude::OutputChart;
use serde::de::DeserializeOwned;

use crate::cli::CloudBenchScenarioCli;
use crate::config::{RunnerConfig, Strategy};
use crate::context::{IterationContext, RunnerContext, UserValuesConstraint};
use crate::sla::{Criterion, FailureRate, MaxSecondsPerIteration};

pub type HookResult = anyhow::Result<()>;

pub type GlobalHookMut<RV> = fn(&mut RunnerContext<RV>) -> HookResult;
pub type GlobalHook<RV> = fn(Arc<RunnerContext<RV>>) -> HookResult;

/// The scenario body, after its return value has been converted to legacy output.
pub type ScenarioFn<RV, V> = Arc<
    dyn Fn(&mut IterationContext<RV, V>, &ScenarioArgs) -> anyhow::Result<Option<OutputChart>>
        + Send
        + Sync,
>;

/// Produces the value an iteration works with, from the shared context and the iteration index.
pub type ContextMapperFn<RV, V> =
    Arc<dyn Fn(&RunnerContext<RV>, u64) -> anyhow::Result<V> + Send + Sync>;

/// Values a scenario body may return.
///
/// Returning a JSON object is the legacy way of reporting output. Each key becomes a series of a
/// stacked area chart added to the additive output of the iteration.
pub trait IntoScenarioOutput {
    fn into_scenario_output(self) -> Option<OutputChart>;
}

impl IntoScenarioOutput for () {
    fn into_scenario_output(self) -> Option<OutputChart> {
        None
    }
}

impl IntoScenarioOutput for serde_json::Map<String, serde_json::Value> {
    fn into_scenario_output(self) -> Option<OutputChart> {
        if self.is_empty() {
            return None;
        }

        let data = self
            .into_iter()
            .map(|(key, value)| serde_json::json!([key, value]))
            .collect();
        Some(OutputChart::new(
            "Scenario output",
            "StackedArea",
            serde_json::Value::Array(data),
        ))
    }
}

/// Arguments passed to every iteration of the scenario.
///
/// Iterations only get shared read access, so one iteration can never see changes made by another.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ScenarioArgs(serde_json::Value);

impl ScenarioArgs {
    pub fn new(value: serde_json::Value) -> Self {
        Self(value)
    }

    pub fn get(&self, key: &str) -> Option<&serde_json::Value> {
        self.0.get(key)
    }

    pub fn get_f64(&self, key: &str) -> Option<f64> {
        self.get(key).and_then(serde_json::Value::as_f64)
    }

    pub fn get_u64(&self, key: &str) -> Option<u64> {
        self.get(key).and_then(serde_json::Value::as_u64)
    }

    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.get(key).and_then(serde_json::Value::as_str)
    }

    /// Deserialize the arguments into a typed struct.
    pub fn parse<T: DeserializeOwned>(&self) -> anyhow::Result<T> {
        let value = if self.0.is_null() {
            serde_json::Value::Object(Default::default())
        } else {
            self.0.clone()
        };
        serde_json::from_value(value).context("Invalid scenario arguments")
    }

    pub fn as_value(&self) -> &serde_json::Value {
        &self.0
    }
}

/// The builder for a scenario definition.
///
/// This must be used at the start of a scenario binary to define the scenario that you want to run.
pub struct ScenarioDefinitionBuilder<RV: UserValuesConstraint, V: UserValuesConstraint> {
    /// The name of the scenario, which should be unique within the test suite.
    ///
    /// Recommended value is `env!("CARGO_PKG_NAME")`.
    name: String,
    /// This value is initialised for you and you cannot change it.
    #[doc(hidden)]
    cli: CloudBenchScenarioCli,
    /// Runner configuration used when none is given on the command line.
    default_config: Option<RunnerConfig>,
    /// Arguments used when none are given on the command line.
    default_args: Option<serde_json::Value>,
    batch_size: Option<usize>,
    criteria: Vec<Box<dyn Criterion>>,
    /// Global setup hook for this scenario. It will be run once, before any iterations start.
    setup_fn: Option<GlobalHookMut<RV>>,
    /// Builds the value for each iteration. Without one every iteration gets `V::default()`.
    context_mapper: Option<ContextMapperFn<RV, V>>,
    /// The scenario body, called once per iteration.
    scenario: Option<ScenarioFn<RV, V>>,
    /// Global teardown hook for this scenario. It will be run once, after every iteration has
    /// finished. Failures are logged and otherwise ignored.
    teardown_fn: Option<GlobalHook<RV>>,
}

pub struct ScenarioDefinition<RV: UserValuesConstraint, V: UserValuesConstraint> {
    pub name: String,
    pub cli: CloudBenchScenarioCli,
    pub config: RunnerConfig,
    pub strategy: Strategy,
    pub args: ScenarioArgs,
    pub batch_size: usize,
    pub criteria: Vec<Box<dyn Criterion>>,
    pub setup_fn: Option<GlobalHookMut<RV>>,
    pub context_mapper: ContextMapperFn<RV, V>,
    pub scenario: ScenarioFn<RV, V>,
    pub teardown_fn: Option<GlobalHook<RV>>,
}

impl<RV: UserValuesConstraint, V: UserValuesConstraint> ScenarioDefinitionBuilder<RV, V> {
    /// Initialise a new scenario definition from the scenario name and command line arguments.
    /// See the [ScenarioDefinitionBuilder::name] for more information about the name.
    pub fn new(name: &str, cli: CloudBenchScenarioCli) -> Self {
        Self {
            name: name.to_string(),
            cli,
            default_config: None,
            default_args: None,
            batch_size: None,
            criteria: Vec::new(),
            setup_fn: None,
            context_mapper: None,
            scenario: None,
            teardown_fn: None,
        }
    }

    /// Parse the command line and initialise logging, then create the builder.
    pub fn new_with_init(name: &str) -> Self {
        Self::new(name, crate::init::init())
    }

    /// Runner configuration to use when neither `--config` nor `--runner` is given.
    pub fn with_default_config(mut self, config: RunnerConfig) -> Self {
        self.default_config = Some(config);
        self
    }

    /// Scenario arguments to use when `--args` is not given.
    pub fn with_args(mut self, args: serde_json::Value) -> Self {
        self.default_args = Some(args);
        self
    }

    /// Number of results to collect before handing them to the consumer. Overrides `--batch-size`.
    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = Some(batch_size);
        self
    }

    /// Evaluate an extra pass/fail criterion over the results.
    pub fn with_criterion(mut self, criterion: Box<dyn Criterion>) -> Self {
        self.criteria.push(criterion);
        self
    }

    /// Set the global setup hook [ScenarioDefinitionBuilder::setup_fn] for this scenario.
    pub fn use_setup(mut self, setup_fn: GlobalHookMut<RV>) -> Self {
        self.setup_fn = Some(setup_fn);
        self
    }

    /// Set the context mapper [ScenarioDefinitionBuilder::context_mapper] for this scenario.
    pub fn use_context_mapper<F>(mut self, mapper: F) -> Self
    where
        F: Fn(&RunnerContext<RV>, u64) -> anyhow::Result<V> + Send + Sync + 'static,
    {
        self.context_mapper = Some(Arc::new(mapper));
        self
    }

    /// Set the scenario body [ScenarioDefinitionBuilder::scenario].
    pub fn use_scenario<R, F>(mut self, scenario: F) -> Self
    where
        R: IntoScenarioOutput,
        F: Fn(&mut IterationContext<RV, V>, &ScenarioArgs) -> anyhow::Result<R>
            + Send
            + Sync
            + 'static,
    {
        self.scenario = Some(Arc::new(
            move |ctx: &mut IterationContext<RV, V>, args: &ScenarioArgs| {
                scenario(ctx, args).map(IntoScenarioOutput::into_scenario_output)
            },
        ));
        self
    }

    /// Set the global teardown hook [ScenarioDefinitionBuilder::teardown_fn] for this scenario.
    pub fn use_teardown(mut self, teardown_fn: GlobalHook<RV>) -> Self {
        self.teardown_fn = Some(teardown_fn);
        self
    }

    pub(crate) fn build(self) -> anyhow::Result<ScenarioDefinition<RV, V>> {
        let scenario = self
            .scenario
            .ok_or_else(|| anyhow::anyhow!("No scenario body defined for {}", self.name))?;

        let config = self.cli.runner_config(self.default_config.as_ref())?;
        let strategy = config.validate()?;

        let args = self
            .cli
            .args
            .clone()
            .or(self.default_args)
            .unwrap_or(serde_json::Value::Null);

        let mut criteria = self.criteria;
        if let Some(max_percent) = self.cli.sla_max_failure_percent {
            criteria.push(Box::new(FailureRate::new(max_percent)));
        }
        if let Some(max_seconds) = self.cli.sla_max_seconds_per_iteration {
            criteria.push(Box::new(MaxSecondsPerIteration::new(max_seconds)));
        }

        let context_mapper: ContextMapperFn<RV, V> = match self.context_mapper {
            Some(mapper) => mapper,
            None => Arc::new(|_: &RunnerContext<RV>, _: u64| -> anyhow::Result<V> {
                Ok(V::default())
            }),
        };

        Ok(ScenarioDefinition {
            name: self.name,
            batch_size: self.batch_size.unwrap_or(self.cli.batch_size).max(1),
            cli: self.cli,
            config,
            strategy,
            args: ScenarioArgs::new(args),
            criteria,
            setup_fn: self.setup_fn,
            context_mapper,
            scenario,
            teardown_fn: self.teardown_fn,
        })
    }
}
