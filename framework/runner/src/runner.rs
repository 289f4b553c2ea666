mod group;

use std::sync::atomic::{AtomicU8, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use cloudbench_core::prelude::{AbortHandle, AbortState, IterationCounter};

use crate::config::{cpu_count, ConfigError, RunnerConfig, Strategy};
use crate::consumer::{ConsumerLoop, ConsumerStats, ResultConsumer};
use crate::context::UserValuesConstraint;
use crate::iteration::IterationExecutor;
use crate::sink::ResultSink;
use crate::source::IterationSource;

use group::WorkerGroup;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunnerState {
    Idle,
    Running,
    /// No new iterations are being issued, in-flight ones are being joined.
    Draining,
    Done,
}

impl RunnerState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => RunnerState::Idle,
            1 => RunnerState::Running,
            2 => RunnerState::Draining,
            _ => RunnerState::Done,
        }
    }
}

#[derive(Debug, Default)]
struct StateCell {
    state: AtomicU8,
    issuing: AtomicUsize,
}

impl StateCell {
    fn get(&self) -> RunnerState {
        RunnerState::from_u8(self.state.load(Ordering::Acquire))
    }

    fn start(&self, issuing: usize) -> anyhow::Result<()> {
        self.issuing.store(issuing, Ordering::Release);
        self.state
            .compare_exchange(
                RunnerState::Idle as u8,
                RunnerState::Running as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .map(|_| ())
            .map_err(|_| anyhow::anyhow!("A scenario runner can only be run once"))
    }

    /// Called by each worker group when it stops issuing iterations.
    fn stopped_issuing(&self) {
        if self.issuing.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.begin_draining();
        }
    }

    fn begin_draining(&self) {
        if self
            .state
            .compare_exchange(
                RunnerState::Running as u8,
                RunnerState::Draining as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
        {
            log::debug!("Runner is draining");
        }
    }

    fn finish(&self) {
        self.state.store(RunnerState::Done as u8, Ordering::Release);
    }
}

/// What a finished run hands back to the caller.
#[derive(Debug)]
pub struct RunOutcome<C> {
    /// The consumer, after it has seen every result of the run.
    pub consumer: C,
    /// Number of iterations started.
    pub started: u64,
    pub stats: ConsumerStats,
    /// Time from starting the first worker to joining the last one.
    pub run_duration: Duration,
    pub abort_state: AbortState,
}

/// Drives the scenario according to a [Strategy].
///
/// A runner is run once. Abort it from any thread through [ScenarioRunner::abort_handle].
#[derive(Debug)]
pub struct ScenarioRunner {
    strategy: Strategy,
    batch_size: usize,
    cpu_count: usize,
    abort_handle: AbortHandle,
    state: Arc<StateCell>,
}

impl ScenarioRunner {
    pub fn new(strategy: Strategy) -> Self {
        Self {
            strategy,
            batch_size: 1,
            cpu_count: cpu_count(),
            abort_handle: AbortHandle::new(),
            state: Arc::new(StateCell::default()),
        }
    }

    /// Validate `config` and create a runner for it.
    pub fn from_config(config: &RunnerConfig) -> Result<Self, ConfigError> {
        Ok(Self::new(config.validate()?))
    }

    /// Number of results to collect before passing them to the consumer, 0 is treated as 1.
    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }

    /// Number of CPUs that worker groups are spread over, defaults to the available parallelism.
    pub fn with_cpu_count(mut self, cpu_count: usize) -> Self {
        self.cpu_count = cpu_count.max(1);
        self
    }

    /// Share an existing abort signal, such as one wired up to Ctrl-C.
    pub fn with_abort_handle(mut self, abort_handle: AbortHandle) -> Self {
        self.abort_handle = abort_handle;
        self
    }

    pub fn strategy(&self) -> &Strategy {
        &self.strategy
    }

    pub fn abort_handle(&self) -> AbortHandle {
        self.abort_handle.clone()
    }

    /// Stop issuing new iterations. In-flight iterations finish and are reported.
    pub fn abort(&self) {
        if self.abort_handle.soft_abort() {
            log::info!("Aborting the {} runner", self.strategy.name());
        }
    }

    pub fn state(&self) -> RunnerState {
        self.state.get()
    }

    /// Run the scenario to completion, passing every result to `consumer`.
    ///
    /// Returns once every started iteration has been delivered to the consumer. If a worker fails
    /// outside of the scenario the run is aborted, but the remaining workers are still joined and
    /// their results delivered before the error is returned.
    pub fn run<RV, V, C>(
        &self,
        executor: IterationExecutor<RV, V>,
        consumer: C,
    ) -> anyhow::Result<RunOutcome<C>>
    where
        RV: UserValuesConstraint,
        V: UserValuesConstraint,
        C: ResultConsumer + Send + 'static,
    {
        let groups = match self.strategy {
            Strategy::Serial { .. } => Vec::new(),
            _ => self.strategy.worker_groups(self.cpu_count),
        };
        self.state.start(groups.len().max(1))?;

        let sink = Arc::new(ResultSink::new(self.batch_size));
        let consumer_loop = match ConsumerLoop::spawn(sink.clone(), consumer, self.abort_handle.clone())
        {
            Ok(consumer_loop) => consumer_loop,
            Err(e) => {
                self.state.finish();
                return Err(e);
            }
        };

        log::info!(
            "Starting the {} runner with {} worker groups",
            self.strategy.name(),
            groups.len().max(1)
        );

        let counter = IterationCounter::new();
        let started_at = Instant::now();
        let started = if groups.is_empty() {
            self.run_serial(&executor, &sink, &counter)
        } else {
            self.run_groups(&executor, &sink, &counter, groups, started_at)
        };

        self.state.begin_draining();
        sink.flush();
        let consumed = consumer_loop.join();
        let run_duration = started_at.elapsed();
        self.state.finish();

        let started = started?;
        let (consumer, stats) = consumed?;
        log::info!(
            "The {} runner started {} iterations and delivered {} results in {:.3}s",
            self.strategy.name(),
            started,
            stats.delivered,
            run_duration.as_secs_f64()
        );

        Ok(RunOutcome {
            consumer,
            started,
            stats,
            run_duration,
            abort_state: self.abort_handle.state(),
        })
    }

    fn run_serial<RV: UserValuesConstraint, V: UserValuesConstraint>(
        &self,
        executor: &IterationExecutor<RV, V>,
        sink: &ResultSink,
        counter: &IterationCounter,
    ) -> anyhow::Result<u64> {
        let times = self.strategy.planned_iterations().unwrap_or(1);
        let abort_listener = self.abort_handle.new_listener();
        let mut source =
            IterationSource::new(counter.clone(), abort_listener.clone()).with_limit(times);

        let mut started = 0;
        for index in source.by_ref() {
            sink.push(executor.execute(index, &abort_listener));
            started += 1;
        }
        log::debug!("Serial runner stopped: {:?}", source.stop_reason());
        self.state.stopped_issuing();

        Ok(started)
    }

    fn run_groups<RV: UserValuesConstraint, V: UserValuesConstraint>(
        &self,
        executor: &IterationExecutor<RV, V>,
        sink: &Arc<ResultSink>,
        counter: &IterationCounter,
        groups: Vec<crate::config::GroupPlan>,
        started_at: Instant,
    ) -> anyhow::Result<u64> {
        let group_count = groups.len();
        let mut failure = None;
        let mut handles = Vec::with_capacity(group_count);

        for plan in groups {
            log::debug!(
                "Worker group {} of {}: concurrency {}, quota {:?}",
                plan.index,
                plan.group_count,
                plan.concurrency,
                plan.quota
            );

            let group = WorkerGroup {
                plan,
                strategy: self.strategy.clone(),
                executor: executor.clone(),
                sink: sink.clone(),
                counter: counter.clone(),
                abort_handle: self.abort_handle.clone(),
                state: self.state.clone(),
                started_at,
            };

            match std::thread::Builder::new()
                .name(format!("worker-{}", plan.index))
                .spawn(move || group.run())
            {
                Ok(handle) => handles.push(handle),
                Err(e) => {
                    log::error!("Failed to spawn worker group {}: {:?}", plan.index, e);
                    self.abort_handle.soft_abort();
                    failure = Some(anyhow::Error::new(e).context("Failed to spawn worker group"));
                    break;
                }
            }
        }

        for _ in handles.len()..group_count {
            self.state.stopped_issuing();
        }

        let mut started = 0;
        for (index, handle) in handles.into_iter().enumerate() {
            match handle.join() {
                Ok(Ok(group_started)) => started += group_started,
                Ok(Err(e)) => {
                    failure.get_or_insert(e);
                }
                Err(_) => {
                    failure.get_or_insert(anyhow::anyhow!("Worker group {index} panicked"));
                }
            }
        }

        failure.map_or(Ok(started), Err)
    }
}
