use std::fmt::Debug;
use std::sync::Arc;
use std::time::{Duration, Instant};

use cloudbench_core::prelude::{
    now_timestamp, AbortHandle, AbortListener, AtomicAction, Output, OutputChart,
};
use cloudbench_instruments::Reporter;
use rand::Rng;

use crate::executor::Executor;

pub trait UserValuesConstraint: Default + Debug + Send + Sync + 'static {}

impl UserValuesConstraint for () {}

/// State shared by every iteration of a run.
///
/// The value is set up by the setup hook and is read-only once the first iteration starts.
#[derive(Debug)]
pub struct RunnerContext<RV: UserValuesConstraint> {
    executor: Arc<Executor>,
    reporter: Arc<Reporter>,
    abort_handle: AbortHandle,
    scenario_name: String,
    run_id: String,
    value: RV,
}

impl<RV: UserValuesConstraint> RunnerContext<RV> {
    pub(crate) fn new(
        executor: Arc<Executor>,
        reporter: Arc<Reporter>,
        abort_handle: AbortHandle,
        scenario_name: String,
        run_id: String,
    ) -> Self {
        Self {
            executor,
            reporter,
            abort_handle,
            scenario_name,
            run_id,
            value: Default::default(),
        }
    }

    pub fn executor(&self) -> &Arc<Executor> {
        &self.executor
    }

    pub fn reporter(&self) -> Arc<Reporter> {
        self.reporter.clone()
    }

    pub fn scenario_name(&self) -> &str {
        &self.scenario_name
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    /// Stop issuing new iterations, the in-flight ones are allowed to finish.
    pub fn abort_run(&self) {
        if self.abort_handle.soft_abort() {
            log::info!("Run aborted by the scenario");
        }
    }

    /// Stop the run as soon as possible, cancelling [Executor::execute_cancellable] calls.
    pub fn force_stop_scenario(&self) {
        if self.abort_handle.hard_abort() {
            log::info!("Run force stopped by the scenario");
        }
    }

    pub fn get_mut(&mut self) -> &mut RV {
        &mut self.value
    }

    pub fn get(&self) -> &RV {
        &self.value
    }
}

/// Everything one iteration of the scenario has access to.
///
/// The value is produced for this iteration alone by the context mapper, nothing else sees it.
pub struct IterationContext<RV: UserValuesConstraint, V: UserValuesConstraint> {
    index: u64,
    runner_context: Arc<RunnerContext<RV>>,
    abort_listener: AbortListener,
    value: V,
    idle_duration: f64,
    output: Output,
    atomic_actions: Vec<AtomicAction>,
    /// Path through `atomic_actions` to the innermost action that is still running.
    open_actions: Vec<usize>,
}

impl<RV: UserValuesConstraint, V: UserValuesConstraint> IterationContext<RV, V> {
    pub(crate) fn new(
        index: u64,
        runner_context: Arc<RunnerContext<RV>>,
        abort_listener: AbortListener,
        value: V,
    ) -> Self {
        Self {
            index,
            runner_context,
            abort_listener,
            value,
            idle_duration: 0.0,
            output: Output::default(),
            atomic_actions: Vec::new(),
            open_actions: Vec::new(),
        }
    }

    /// The index claimed for this iteration, starting from 0.
    pub fn index(&self) -> u64 {
        self.index
    }

    /// The iteration number as shown to users, starting from 1.
    pub fn iteration(&self) -> u64 {
        self.index + 1
    }

    pub fn runner_context(&self) -> &Arc<RunnerContext<RV>> {
        &self.runner_context
    }

    /// Check this between long running steps to stop early when the run is aborted.
    pub fn abort_listener(&self) -> &AbortListener {
        &self.abort_listener
    }

    pub fn get_mut(&mut self) -> &mut V {
        &mut self.value
    }

    pub fn get(&self) -> &V {
        &self.value
    }

    /// Sleep for a random number of seconds between `min` and `max`.
    ///
    /// The time slept is recorded as idle and excluded from the iteration duration. The sleep ends
    /// early if the run is aborted.
    pub fn sleep_between(&mut self, min: f64, max: f64) -> anyhow::Result<()> {
        if !(min.is_finite() && max.is_finite() && 0.0 <= min && min <= max) {
            anyhow::bail!("Invalid arguments: min={min}, max={max}, expected 0 <= min <= max");
        }

        let seconds = if min == max {
            min
        } else {
            rand::thread_rng().gen_range(min..=max)
        };

        let started = Instant::now();
        self.abort_listener
            .wait_timeout(Duration::from_secs_f64(seconds));
        self.add_idle_duration(started.elapsed().as_secs_f64());

        Ok(())
    }

    /// Exclude `seconds` from the duration of this iteration.
    pub fn add_idle_duration(&mut self, seconds: f64) {
        if seconds > 0.0 {
            self.idle_duration += seconds;
        }
    }

    pub fn idle_duration(&self) -> f64 {
        self.idle_duration
    }

    /// Attach custom output to this iteration.
    pub fn add_output(
        &mut self,
        additive: Option<OutputChart>,
        complete: Option<OutputChart>,
    ) -> anyhow::Result<()> {
        if let Some(additive) = &additive {
            additive.validate("additive")?;
        }
        if let Some(complete) = &complete {
            complete.validate("complete")?;
        }

        self.output.additive.extend(additive);
        self.output.complete.extend(complete);
        Ok(())
    }

    /// Time `f` as an atomic action called `name`.
    ///
    /// Actions started inside `f` are nested under this one. The action is marked as failed if `f`
    /// returns an error, which is passed on.
    pub fn atomic<T>(
        &mut self,
        name: &str,
        f: impl FnOnce(&mut Self) -> anyhow::Result<T>,
    ) -> anyhow::Result<T> {
        let siblings = open_children(&mut self.atomic_actions, &self.open_actions);
        siblings.push(AtomicAction::new(name, now_timestamp()));
        let position = siblings.len() - 1;
        self.open_actions.push(position);

        let result = f(self);

        let path = std::mem::take(&mut self.open_actions);
        if let Some((last, parents)) = path.split_last() {
            let action = &mut open_children(&mut self.atomic_actions, parents)[*last];
            action.finished_at = Some(now_timestamp());
            action.failed = result.is_err();
            self.open_actions = parents.to_vec();
        }

        result
    }

    pub fn atomic_actions(&self) -> &[AtomicAction] {
        &self.atomic_actions
    }

    pub(crate) fn into_parts(self) -> (f64, Output, Vec<AtomicAction>) {
        (self.idle_duration, self.output, self.atomic_actions)
    }
}

fn open_children<'a>(
    actions: &'a mut Vec<AtomicAction>,
    path: &[usize],
) -> &'a mut Vec<AtomicAction> {
    let mut current = actions;
    for &i in path {
        current = &mut current[i].children;
    }
    current
}

#[cfg(test)]
mod tests {
    use cloudbench_core::prelude::AbortHandle;
    use pretty_assertions::assert_eq;

    use super::*;

    fn iteration_context(abort_handle: &AbortHandle) -> IterationContext<(), ()> {
        let runtime = tokio::runtime::Runtime::new().unwrap();
        let executor = Arc::new(Executor::new(runtime, abort_handle.clone()));
        let runner_context = Arc::new(RunnerContext::new(
            executor,
            Arc::new(Reporter::noop()),
            abort_handle.clone(),
            "test".to_string(),
            "run".to_string(),
        ));
        IterationContext::new(4, runner_context, abort_handle.new_listener(), ())
    }

    #[test]
    fn iteration_numbers_start_from_one() {
        let ctx = iteration_context(&AbortHandle::new());
        assert_eq!(4, ctx.index());
        assert_eq!(5, ctx.iteration());
    }

    #[test]
    fn nested_atomic_actions() {
        let mut ctx = iteration_context(&AbortHandle::new());

        ctx.atomic("boot", |ctx| {
            ctx.atomic("create_port", |_| Ok(()))?;
            ctx.atomic("wait_active", |_| -> anyhow::Result<()> {
                anyhow::bail!("still building")
            })
            .ok();
            Ok(())
        })
        .unwrap();
        ctx.atomic("delete", |_| Ok(())).unwrap();

        let actions = ctx.atomic_actions();
        assert_eq!(
            vec!["boot", "delete"],
            actions.iter().map(|a| a.name.as_str()).collect::<Vec<_>>()
        );
        assert!(!actions[0].failed);
        assert!(actions[0].finished_at.is_some());
        assert_eq!(2, actions[0].children.len());
        assert!(!actions[0].children[0].failed);
        assert!(actions[0].children[1].failed);
        assert!(actions[0].children[1].finished_at.is_some());
    }

    #[test]
    fn failed_atomic_action_passes_error_on() {
        let mut ctx = iteration_context(&AbortHandle::new());

        let err = ctx
            .atomic("boot", |_| -> anyhow::Result<()> { anyhow::bail!("no capacity") })
            .unwrap_err();
        assert_eq!("no capacity", err.to_string());
        assert!(ctx.atomic_actions()[0].failed);
    }

    #[test]
    fn sleep_between_validates_and_records_idle_time() {
        let mut ctx = iteration_context(&AbortHandle::new());

        assert!(ctx.sleep_between(0.2, 0.1).is_err());
        assert!(ctx.sleep_between(-1.0, 0.1).is_err());

        ctx.sleep_between(0.01, 0.02).unwrap();
        assert!(ctx.idle_duration() >= 0.01);
    }

    #[test]
    fn sleep_between_ends_on_abort() {
        let abort_handle = AbortHandle::new();
        let mut ctx = iteration_context(&abort_handle);
        abort_handle.soft_abort();

        let started = Instant::now();
        ctx.sleep_between(30.0, 30.0).unwrap();
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[test]
    fn add_output_rejects_invalid_charts() {
        let mut ctx = iteration_context(&AbortHandle::new());

        let valid = OutputChart::new("Latency", "Lines", serde_json::json!([["a", 1]]));
        ctx.add_output(Some(valid.clone()), None).unwrap();

        let invalid = OutputChart::new("", "Lines", serde_json::json!([]));
        assert!(ctx.add_output(None, Some(invalid)).is_err());

        let (_, output, _) = ctx.into_parts();
        assert_eq!(vec![valid], output.additive);
        assert!(output.complete.is_empty());
    }
}
