use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use anyhow::Context;
use cloudbench_core::prelude::{AbortHandle, IterationResult, ResultBatch};
use cloudbench_instruments::Reporter;

use crate::sink::{ResultSink, SinkPoll};
use crate::sla::SlaChecker;

const POLL_TIMEOUT: Duration = Duration::from_millis(100);

/// Receives the results of a run, one batch at a time.
///
/// Batches are delivered from a single thread, in the order they were produced.
pub trait ResultConsumer {
    fn on_batch(&mut self, batch: ResultBatch);

    /// Checked after every batch. Returning `true` aborts the run.
    fn should_abort(&self) -> bool {
        false
    }
}

/// Counts kept by the consumer thread while it delivers batches.
#[derive(Debug, Default, Clone)]
pub struct ConsumerStats {
    pub delivered: usize,
    pub batches: usize,
    pub failures: usize,
    /// Earliest start time of any delivered iteration.
    pub load_started_at: Option<f64>,
    /// Latest finish time of any delivered iteration.
    pub load_finished_at: Option<f64>,
}

impl ConsumerStats {
    fn record(&mut self, batch: &ResultBatch) {
        self.batches += 1;
        for result in batch.iter() {
            self.delivered += 1;
            if result.is_error() {
                self.failures += 1;
            }

            let started = self
                .load_started_at
                .map_or(result.timestamp, |t| t.min(result.timestamp));
            self.load_started_at = Some(started);

            let finished = self
                .load_finished_at
                .map_or(result.finished_at(), |t| t.max(result.finished_at()));
            self.load_finished_at = Some(finished);
        }
    }

    /// Time between the first iteration starting and the last one finishing.
    pub fn load_duration(&self) -> f64 {
        match (self.load_started_at, self.load_finished_at) {
            (Some(start), Some(end)) => (end - start).max(0.0),
            _ => 0.0,
        }
    }
}

/// The thread that drains the result sink into a [ResultConsumer].
pub(crate) struct ConsumerLoop<C> {
    handle: JoinHandle<(C, ConsumerStats)>,
}

impl<C: ResultConsumer + Send + 'static> ConsumerLoop<C> {
    pub(crate) fn spawn(
        sink: Arc<ResultSink>,
        mut consumer: C,
        abort_handle: AbortHandle,
    ) -> anyhow::Result<Self> {
        let handle = std::thread::Builder::new()
            .name("result-consumer".to_string())
            .spawn(move || {
                let mut stats = ConsumerStats::default();
                let mut abort_requested = false;

                loop {
                    match sink.next_batch(POLL_TIMEOUT) {
                        SinkPoll::Batch(batch) => {
                            stats.record(&batch);
                            consumer.on_batch(batch);
                        }
                        SinkPoll::Empty => {}
                        SinkPoll::Closed => break,
                    }

                    if !abort_requested && consumer.should_abort() {
                        abort_requested = true;
                        if abort_handle.soft_abort() {
                            log::info!("Result consumer requested the run to abort");
                        }
                    }
                }

                log::debug!(
                    "Result consumer finished after {} results in {} batches",
                    stats.delivered,
                    stats.batches
                );
                (consumer, stats)
            })
            .context("Failed to spawn the result consumer")?;

        Ok(Self { handle })
    }

    /// Wait for the consumer to see every batch. The sink must have been flushed first.
    pub(crate) fn join(self) -> anyhow::Result<(C, ConsumerStats)> {
        self.handle
            .join()
            .map_err(|_| anyhow::anyhow!("The result consumer panicked"))
    }
}

/// Keeps every batch it receives.
#[derive(Debug, Default)]
pub struct CollectingConsumer {
    batches: Vec<ResultBatch>,
    abort_after: Option<usize>,
    received: usize,
}

impl CollectingConsumer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Ask for the run to be aborted once `count` results have been received.
    pub fn abort_after(mut self, count: usize) -> Self {
        self.abort_after = Some(count);
        self
    }

    pub fn batches(&self) -> &[ResultBatch] {
        &self.batches
    }

    /// Every received result, in delivery order.
    pub fn results(&self) -> Vec<&IterationResult> {
        self.batches.iter().flat_map(|b| b.iter()).collect()
    }

    pub fn into_results(self) -> Vec<IterationResult> {
        self.batches
            .into_iter()
            .flat_map(ResultBatch::into_inner)
            .collect()
    }
}

impl ResultConsumer for CollectingConsumer {
    fn on_batch(&mut self, batch: ResultBatch) {
        self.received += batch.len();
        self.batches.push(batch);
    }

    fn should_abort(&self) -> bool {
        self.abort_after
            .is_some_and(|count| self.received >= count)
    }
}

/// The consumer used by scenario binaries: reports every result and evaluates the SLA.
pub(crate) struct RunConsumer {
    reporter: Arc<Reporter>,
    sla: SlaChecker,
    abort_on_sla_failure: bool,
    completed: Arc<AtomicU64>,
}

impl RunConsumer {
    pub(crate) fn new(
        reporter: Arc<Reporter>,
        sla: SlaChecker,
        abort_on_sla_failure: bool,
        completed: Arc<AtomicU64>,
    ) -> Self {
        Self {
            reporter,
            sla,
            abort_on_sla_failure,
            completed,
        }
    }

    pub(crate) fn into_sla(self) -> SlaChecker {
        self.sla
    }
}

impl ResultConsumer for RunConsumer {
    fn on_batch(&mut self, batch: ResultBatch) {
        for result in batch.iter() {
            self.reporter.add_iteration(result);
            if !self.sla.add_iteration(result) && self.abort_on_sla_failure {
                self.sla.set_aborted_on_sla();
            }
        }
        self.completed
            .fetch_add(batch.len() as u64, Ordering::Relaxed);
    }

    fn should_abort(&self) -> bool {
        self.sla.aborted_on_sla()
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::sla::{Criterion, FailureRate};

    fn result(index: u64, timestamp: f64, duration: f64, failed: bool) -> IterationResult {
        let mut result = IterationResult::timed_out(index, timestamp, Duration::from_secs(1));
        result.duration = duration;
        if !failed {
            result.error = None;
        }
        result
    }

    #[test]
    fn stats_track_load_window() {
        let mut stats = ConsumerStats::default();
        stats.record(&ResultBatch::from_unsorted(vec![
            result(1, 10.5, 1.0, false),
            result(0, 10.0, 0.5, true),
        ]));
        stats.record(&ResultBatch::from_unsorted(vec![result(2, 11.0, 2.0, false)]));

        assert_eq!(3, stats.delivered);
        assert_eq!(2, stats.batches);
        assert_eq!(1, stats.failures);
        assert_eq!(Some(10.0), stats.load_started_at);
        assert_eq!(Some(13.0), stats.load_finished_at);
        assert_eq!(3.0, stats.load_duration());
        assert_eq!(0.0, ConsumerStats::default().load_duration());
    }

    #[test]
    fn loop_delivers_everything_before_join_returns() {
        let sink = Arc::new(ResultSink::new(3));
        let abort_handle = AbortHandle::new();
        let consumer_loop =
            ConsumerLoop::spawn(sink.clone(), CollectingConsumer::new(), abort_handle.clone())
                .unwrap();

        for index in 0..10 {
            sink.push(result(index, index as f64, 0.1, false));
        }
        sink.flush();

        let (consumer, stats) = consumer_loop.join().unwrap();
        assert_eq!(10, stats.delivered);
        assert_eq!(4, consumer.batches().len());
        assert_eq!(10, consumer.into_results().len());
        assert!(!abort_handle.is_aborted());
    }

    #[test]
    fn loop_aborts_when_consumer_asks() {
        let sink = Arc::new(ResultSink::new(1));
        let abort_handle = AbortHandle::new();
        let consumer_loop = ConsumerLoop::spawn(
            sink.clone(),
            CollectingConsumer::new().abort_after(2),
            abort_handle.clone(),
        )
        .unwrap();

        sink.push(result(0, 0.0, 0.1, false));
        sink.push(result(1, 0.0, 0.1, false));
        assert!(abort_handle
            .new_listener()
            .wait_timeout(Duration::from_secs(5)));

        sink.flush();
        consumer_loop.join().unwrap();
    }

    #[test]
    fn run_consumer_reports_and_aborts_on_sla_failure() {
        let completed = Arc::new(AtomicU64::new(0));
        let mut consumer = RunConsumer::new(
            Arc::new(Reporter::noop()),
            SlaChecker::new(vec![Box::new(FailureRate::new(0.0)) as Box<dyn Criterion>]),
            true,
            completed.clone(),
        );

        consumer.on_batch(ResultBatch::from_unsorted(vec![result(0, 0.0, 0.1, false)]));
        assert!(!consumer.should_abort());

        consumer.on_batch(ResultBatch::from_unsorted(vec![result(1, 0.0, 0.1, true)]));
        assert!(consumer.should_abort());
        assert_eq!(2, completed.load(Ordering::Relaxed));

        let sla = consumer.into_sla();
        assert!(sla.results().iter().any(|r| r.criterion == "aborted_on_sla"));
    }
}
