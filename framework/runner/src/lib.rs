mod cli;
mod config;
mod consumer;
mod context;
mod definition;
mod executor;
mod init;
mod iteration;
mod monitor;
mod pool;
mod progress;
mod rate;
mod run;
mod runner;
mod shutdown;
mod sink;
mod sla;
mod source;
mod types;

pub mod prelude {
    pub use crate::cli::CloudBenchScenarioCli;
    pub use crate::config::{
        distribute, ConfigError, ConstantConfig, ConstantForDurationConfig, GroupPlan, RpsConfig,
        RpsRunnerConfig, RunnerConfig, SerialConfig, SteppedRpsConfig, Strategy,
    };
    pub use crate::consumer::{CollectingConsumer, ConsumerStats, ResultConsumer};
    pub use crate::context::UserValuesConstraint;
    pub use crate::context::{IterationContext, RunnerContext};
    pub use crate::definition::{
        ContextMapperFn, HookResult, IntoScenarioOutput, ScenarioArgs, ScenarioDefinitionBuilder,
        ScenarioFn,
    };
    pub use crate::executor::Executor;
    pub use crate::iteration::IterationExecutor;
    pub use crate::rate::{Admission, Pacer, RateController, RateSchedule};
    pub use crate::run::run;
    pub use crate::runner::{RunOutcome, RunnerState, ScenarioRunner};
    pub use crate::sink::{ResultSink, SinkPoll};
    pub use crate::sla::{Criterion, FailureRate, MaxSecondsPerIteration, SlaChecker};
    pub use crate::source::{IterationSource, NextIteration};
    pub use crate::types::CloudBenchResult;

    pub use cloudbench_core::prelude::*;
    pub use cloudbench_summary_model::{RunSummary, SlaResult};
}
