use std::collections::VecDeque;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use anyhow::Context;
use cloudbench_core::prelude::{now_timestamp, AbortListener, IterationResult};

use crate::context::UserValuesConstraint;
use crate::iteration::IterationExecutor;
use crate::sink::ResultSink;

/// How long the admission loop sleeps between checks for finished units.
pub(crate) const POLL_INTERVAL: Duration = Duration::from_millis(1);

const PENDING: u8 = 0;
const COMPLETED: u8 = 1;
const TIMED_OUT: u8 = 2;

/// The single result slot of a unit. Whichever of the unit and the timeout monitor claims it first
/// reports the result of the iteration.
#[derive(Debug, Default)]
struct UnitSlot(AtomicU8);

impl UnitSlot {
    fn claim(&self, outcome: u8) -> bool {
        self.0
            .compare_exchange(PENDING, outcome, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    fn state(&self) -> u8 {
        self.0.load(Ordering::Acquire)
    }
}

struct InFlight {
    index: u64,
    handle: JoinHandle<()>,
    slot: Arc<UnitSlot>,
}

impl InFlight {
    /// Whether this unit no longer counts towards the concurrency ceiling.
    fn is_released(&self) -> bool {
        self.handle.is_finished() || self.slot.state() == TIMED_OUT
    }
}

/// A bounded pool of threads, one per in-flight iteration.
pub(crate) struct ThreadPool<RV: UserValuesConstraint, V: UserValuesConstraint> {
    name: String,
    concurrency: usize,
    in_flight: VecDeque<InFlight>,
    executor: IterationExecutor<RV, V>,
    sink: Arc<ResultSink>,
    abort_listener: AbortListener,
    timeout_monitor: Option<TimeoutMonitor>,
    started: u64,
    detached: u64,
}

impl<RV: UserValuesConstraint, V: UserValuesConstraint> ThreadPool<RV, V> {
    pub(crate) fn new(
        name: String,
        concurrency: usize,
        executor: IterationExecutor<RV, V>,
        sink: Arc<ResultSink>,
        abort_listener: AbortListener,
        timeout: Option<Duration>,
    ) -> anyhow::Result<Self> {
        let timeout_monitor = timeout
            .map(|timeout| TimeoutMonitor::start(&name, timeout, sink.clone()))
            .transpose()?;

        Ok(Self {
            name,
            concurrency: concurrency.max(1),
            in_flight: VecDeque::new(),
            executor,
            sink,
            abort_listener,
            timeout_monitor,
            started: 0,
            detached: 0,
        })
    }

    /// Number of iterations started by this pool.
    pub(crate) fn started(&self) -> u64 {
        self.started
    }

    /// Number of units that count towards the concurrency ceiling.
    pub(crate) fn active(&self) -> usize {
        self.in_flight.iter().filter(|u| !u.is_released()).count()
    }

    pub(crate) fn is_full(&self) -> bool {
        self.active() >= self.concurrency
    }

    /// Start iteration `index` on a new thread.
    pub(crate) fn spawn(&mut self, index: u64) -> anyhow::Result<()> {
        let slot = Arc::new(UnitSlot::default());
        let timestamp = now_timestamp();

        let handle = {
            let slot = slot.clone();
            let executor = self.executor.clone();
            let sink = self.sink.clone();
            let abort_listener = self.abort_listener.clone();
            std::thread::Builder::new()
                .name(format!("{}-iter-{}", self.name, index))
                .spawn(move || {
                    let result = executor.execute(index, &abort_listener);
                    if slot.claim(COMPLETED) {
                        sink.push(result);
                    } else {
                        log::warn!(
                            "Discarding the result of iteration {} which already timed out",
                            index + 1
                        );
                    }
                })
                .with_context(|| format!("Failed to spawn thread for iteration {}", index + 1))?
        };

        if let Some(monitor) = &self.timeout_monitor {
            monitor.watch(index, timestamp, slot.clone());
        }

        self.in_flight.push_back(InFlight {
            index,
            handle,
            slot,
        });
        self.started += 1;
        Ok(())
    }

    /// Join finished units at the head of the queue and detach timed out ones.
    pub(crate) fn compact(&mut self) -> anyhow::Result<()> {
        let mut failure = None;
        while self.in_flight.front().is_some_and(InFlight::is_released) {
            let Some(unit) = self.in_flight.pop_front() else {
                break;
            };

            if let Err(e) = self.release(unit) {
                failure.get_or_insert(e);
            }
        }

        failure.map_or(Ok(()), Err)
    }

    fn release(&mut self, unit: InFlight) -> anyhow::Result<()> {
        if !unit.handle.is_finished() {
            log::warn!(
                "Detaching the thread of iteration {} which overran its timeout",
                unit.index + 1
            );
            self.detached += 1;
            return Ok(());
        }

        unit.handle.join().map_err(|_| {
            anyhow::anyhow!(
                "Worker thread for iteration {} panicked outside the scenario",
                unit.index + 1
            )
        })
    }

    /// Block until there is room for another unit, or the run is aborted.
    pub(crate) fn wait_for_slot(&mut self) -> anyhow::Result<()> {
        loop {
            self.compact()?;
            if self.active() < self.concurrency || self.abort_listener.should_abort() {
                return Ok(());
            }
            std::thread::sleep(POLL_INTERVAL);
        }
    }

    /// Wait for every unit to finish or time out, then stop the timeout monitor.
    ///
    /// Every unit is accounted for even if some of them fail, the first failure is returned.
    pub(crate) fn shutdown(mut self) -> anyhow::Result<u64> {
        self.join_remaining().map(|_| self.started)
    }

    fn join_remaining(&mut self) -> anyhow::Result<()> {
        let mut failure = None;
        while !self.in_flight.is_empty() {
            if let Err(e) = self.compact() {
                failure.get_or_insert(e);
            }
            if !self.in_flight.is_empty() {
                std::thread::sleep(POLL_INTERVAL);
            }
        }

        if let Some(monitor) = self.timeout_monitor.take() {
            if let Err(e) = monitor.stop() {
                failure.get_or_insert(e);
            }
        }

        if self.detached > 0 {
            log::warn!(
                "{} detached {} threads that overran their timeout",
                self.name,
                self.detached
            );
            self.detached = 0;
        }

        failure.map_or(Ok(()), Err)
    }
}

/// A pool dropped without [ThreadPool::shutdown], for example while unwinding, still waits for its
/// units so their results reach the sink.
impl<RV: UserValuesConstraint, V: UserValuesConstraint> Drop for ThreadPool<RV, V> {
    fn drop(&mut self) {
        if self.in_flight.is_empty() && self.timeout_monitor.is_none() {
            return;
        }

        log::warn!(
            "{} dropped with {} units in flight, waiting for them",
            self.name,
            self.in_flight.len()
        );
        if let Err(e) = self.join_remaining() {
            log::error!("{} failed to join its units: {:?}", self.name, e);
        }
    }
}

enum Watch {
    Unit {
        index: u64,
        timestamp: f64,
        deadline: Instant,
        slot: Arc<UnitSlot>,
    },
    Stop,
}

/// Reports a timeout result for any unit that is still running at its deadline.
///
/// Every unit of a pool has the same timeout, so deadlines arrive in order and only the oldest
/// watched unit needs to be checked.
struct TimeoutMonitor {
    timeout: Duration,
    sender: mpsc::Sender<Watch>,
    handle: JoinHandle<()>,
}

impl TimeoutMonitor {
    fn start(pool_name: &str, timeout: Duration, sink: Arc<ResultSink>) -> anyhow::Result<Self> {
        let (sender, receiver) = mpsc::channel();
        let handle = std::thread::Builder::new()
            .name(format!("{pool_name}-timeout"))
            .spawn(move || watch_deadlines(receiver, timeout, sink))
            .context("Failed to start timeout monitor thread")?;

        Ok(Self {
            timeout,
            sender,
            handle,
        })
    }

    fn watch(&self, index: u64, timestamp: f64, slot: Arc<UnitSlot>) {
        let Some(deadline) = Instant::now().checked_add(self.timeout) else {
            log::warn!(
                "Timeout of {:.3}s is out of range, iteration {} is not watched",
                self.timeout.as_secs_f64(),
                index + 1
            );
            return;
        };
        let watch = Watch::Unit {
            index,
            timestamp,
            deadline,
            slot,
        };
        if self.sender.send(watch).is_err() {
            log::error!(
                "Timeout monitor has stopped, iteration {} is not watched",
                index + 1
            );
        }
    }

    fn stop(self) -> anyhow::Result<()> {
        // The monitor also stops if it finds the channel closed.
        let _ = self.sender.send(Watch::Stop);
        self.handle
            .join()
            .map_err(|_| anyhow::anyhow!("Timeout monitor thread panicked"))
    }
}

fn watch_deadlines(receiver: mpsc::Receiver<Watch>, timeout: Duration, sink: Arc<ResultSink>) {
    let mut watched: VecDeque<(u64, f64, Instant, Arc<UnitSlot>)> = VecDeque::new();

    loop {
        let message = match watched.front() {
            Some((_, _, deadline, _)) => {
                receiver.recv_timeout(deadline.saturating_duration_since(Instant::now()))
            }
            None => receiver.recv().map_err(|_| RecvTimeoutError::Disconnected),
        };

        match message {
            Ok(Watch::Unit {
                index,
                timestamp,
                deadline,
                slot,
            }) => watched.push_back((index, timestamp, deadline, slot)),
            Ok(Watch::Stop) | Err(RecvTimeoutError::Disconnected) => break,
            Err(RecvTimeoutError::Timeout) => {}
        }

        let now = Instant::now();
        while let Some((index, timestamp, deadline, slot)) = watched.front() {
            if slot.state() == COMPLETED {
                watched.pop_front();
                continue;
            }
            if *deadline > now {
                break;
            }

            if slot.claim(TIMED_OUT) {
                log::warn!(
                    "Iteration {} timed out after {:.3}s",
                    index + 1,
                    timeout.as_secs_f64()
                );
                sink.push(IterationResult::timed_out(*index, *timestamp, timeout));
            }
            watched.pop_front();
        }
    }
}
