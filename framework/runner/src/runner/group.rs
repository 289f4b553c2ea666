use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Instant;

use cloudbench_core::prelude::{AbortHandle, AbortListener, IterationCounter};

use crate::config::{GroupPlan, Strategy};
use crate::context::UserValuesConstraint;
use crate::iteration::IterationExecutor;
use crate::pool::{ThreadPool, POLL_INTERVAL};
use crate::rate::{Admission, RateController, RateSchedule};
use crate::runner::StateCell;
use crate::sink::ResultSink;
use crate::source::{IterationSource, NextIteration};

/// One worker group of a concurrent run, driving its own pool of iteration threads.
pub(super) struct WorkerGroup<RV: UserValuesConstraint, V: UserValuesConstraint> {
    pub(super) plan: GroupPlan,
    pub(super) strategy: Strategy,
    pub(super) executor: IterationExecutor<RV, V>,
    pub(super) sink: Arc<ResultSink>,
    pub(super) counter: IterationCounter,
    pub(super) abort_handle: AbortHandle,
    pub(super) state: Arc<StateCell>,
    pub(super) started_at: Instant,
}

impl<RV: UserValuesConstraint, V: UserValuesConstraint> WorkerGroup<RV, V> {
    /// Run the group to completion, returning the number of iterations it started.
    ///
    /// Any failure aborts the whole run so the other groups stop issuing too.
    pub(super) fn run(self) -> anyhow::Result<u64> {
        let index = self.plan.index;
        let abort_handle = self.abort_handle.clone();

        let result = std::panic::catch_unwind(AssertUnwindSafe(|| self.run_pool()))
            .unwrap_or_else(|_| Err(anyhow::anyhow!("Worker group {index} panicked")));

        if let Err(e) = &result {
            log::error!("Worker group {} failed: {:?}", index, e);
            abort_handle.soft_abort();
        }
        result
    }

    fn run_pool(&self) -> anyhow::Result<u64> {
        let abort_listener = self.abort_handle.new_listener();
        let mut pool = match ThreadPool::new(
            format!("worker-{}", self.plan.index),
            self.plan.concurrency,
            self.executor.clone(),
            self.sink.clone(),
            abort_listener.clone(),
            self.strategy.timeout(),
        ) {
            Ok(pool) => pool,
            Err(e) => {
                self.state.stopped_issuing();
                return Err(e);
            }
        };

        // Catch panics here so the pool still joins its in-flight units below.
        let issued = std::panic::catch_unwind(AssertUnwindSafe(|| {
            self.issue(&mut pool, abort_listener)
        }))
        .unwrap_or_else(|_| {
            Err(anyhow::anyhow!(
                "Worker group {} panicked while issuing iterations",
                self.plan.index
            ))
        });
        self.state.stopped_issuing();

        let joined = pool.shutdown();
        issued.and(joined)
    }

    fn issue(
        &self,
        pool: &mut ThreadPool<RV, V>,
        abort_listener: AbortListener,
    ) -> anyhow::Result<()> {
        let source = IterationSource::new(self.counter.clone(), abort_listener.clone());

        match &self.strategy {
            Strategy::Serial { times } | Strategy::Constant { times, .. } => {
                self.issue_constant(pool, source.with_limit(*times))
            }
            Strategy::ConstantForDuration { duration, .. } => {
                let deadline = self.started_at.checked_add(*duration).ok_or_else(|| {
                    anyhow::anyhow!("Run duration of {:?} is out of range", duration)
                })?;
                self.issue_constant(pool, source.with_deadline(deadline))
            }
            Strategy::Rps { times, rate, .. } => {
                self.issue_rps(pool, source.with_limit(*times), *rate, abort_listener)
            }
        }
    }

    /// Keep the pool full until the source runs dry.
    fn issue_constant(
        &self,
        pool: &mut ThreadPool<RV, V>,
        mut source: IterationSource,
    ) -> anyhow::Result<()> {
        while let NextIteration::Index(index) = source.next_iteration() {
            pool.spawn(index)?;
            pool.wait_for_slot()?;
        }

        log::debug!(
            "Worker group {} stopped issuing after {} iterations: {:?}",
            self.plan.index,
            pool.started(),
            source.stop_reason()
        );
        Ok(())
    }

    /// Start this group's share of iterations at its share of the target rate.
    fn issue_rps(
        &self,
        pool: &mut ThreadPool<RV, V>,
        mut source: IterationSource,
        rate: RateSchedule,
        abort_listener: AbortListener,
    ) -> anyhow::Result<()> {
        let controller = RateController::new(rate);
        let (worker_index, worker_count) = (self.plan.index, self.plan.group_count);
        let quota = self.plan.quota.unwrap_or(u64::MAX);

        let delay = controller.start_delay(worker_index, worker_count);
        if !delay.is_zero() && abort_listener.wait_timeout(delay) {
            return Ok(());
        }

        let started = Instant::now();
        let mut pacer = controller.pacer(worker_index, worker_count);

        while pool.started() < quota {
            loop {
                pool.compact()?;
                if abort_listener.should_abort() {
                    log::debug!("Worker group {} aborted", worker_index);
                    return Ok(());
                }

                match pacer.admission(started.elapsed()) {
                    Admission::Admit if !pool.is_full() => break,
                    Admission::Admit => std::thread::sleep(POLL_INTERVAL),
                    Admission::Delay(wait) => {
                        abort_listener.wait_timeout(wait);
                    }
                }
            }

            let NextIteration::Index(index) = source.next_iteration() else {
                break;
            };
            let elapsed = started.elapsed();
            pacer.record_issued(elapsed);
            pool.spawn(index)?;

            log::debug!(
                "Worker: {} rps: {:.3} (requested rps: {:.3})",
                worker_index,
                pool.started() as f64 / elapsed.as_secs_f64().max(f64::EPSILON),
                controller.next_target_rate(elapsed, worker_index, worker_count)
            );
        }

        Ok(())
    }
}
