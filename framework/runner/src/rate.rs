use std::time::Duration;

/// The total target rate of iteration starts, across all workers.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum RateSchedule {
    Fixed(f64),
    /// Starts at `start` and increases by `step` every `stage_duration`, capped at `end`.
    Stepped {
        start: f64,
        end: f64,
        step: f64,
        stage_duration: Duration,
    },
}

impl RateSchedule {
    pub fn rate_at(&self, elapsed: Duration) -> f64 {
        match *self {
            RateSchedule::Fixed(rate) => rate,
            RateSchedule::Stepped {
                start, end, step, ..
            } => (start + step * self.stage_at(elapsed) as f64).min(end),
        }
    }

    pub fn initial_rate(&self) -> f64 {
        self.rate_at(Duration::ZERO)
    }

    /// Index of the stage that `elapsed` falls in, always 0 for a fixed rate.
    pub fn stage_at(&self, elapsed: Duration) -> u64 {
        match *self {
            RateSchedule::Fixed(_) => 0,
            RateSchedule::Stepped { stage_duration, .. } => {
                (elapsed.as_secs_f64() / stage_duration.as_secs_f64()).floor() as u64
            }
        }
    }

    pub fn stage_start(&self, stage: u64) -> Duration {
        match *self {
            RateSchedule::Fixed(_) => Duration::ZERO,
            RateSchedule::Stepped { stage_duration, .. } => {
                stage_duration.saturating_mul(u32::try_from(stage).unwrap_or(u32::MAX))
            }
        }
    }

    fn next_stage_start(&self, stage: u64) -> Option<Duration> {
        match self {
            RateSchedule::Fixed(_) => None,
            RateSchedule::Stepped { .. } => Some(self.stage_start(stage + 1)),
        }
    }
}

/// Decides how fast each worker of a rate-targeted run should start iterations.
///
/// The target rate is shared equally between workers.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RateController {
    schedule: RateSchedule,
}

impl RateController {
    pub fn new(schedule: RateSchedule) -> Self {
        Self { schedule }
    }

    pub fn schedule(&self) -> &RateSchedule {
        &self.schedule
    }

    /// Iterations per second this worker should start at `elapsed` into the run.
    pub fn next_target_rate(
        &self,
        elapsed: Duration,
        _worker_index: usize,
        worker_count: usize,
    ) -> f64 {
        self.schedule.rate_at(elapsed) / worker_count.max(1) as f64
    }

    /// How long a worker waits before its first iteration, so that workers don't all start at once.
    pub fn start_delay(&self, worker_index: usize, worker_count: usize) -> Duration {
        let per_worker = self.next_target_rate(Duration::ZERO, worker_index, worker_count);
        let delay = (1.0 / per_worker) * worker_index as f64 / worker_count.max(1) as f64;
        Duration::try_from_secs_f64(delay).unwrap_or(Duration::ZERO)
    }

    pub fn pacer(&self, worker_index: usize, worker_count: usize) -> Pacer {
        Pacer {
            controller: *self,
            worker_index,
            worker_count,
            stage: 0,
            issued_in_stage: 0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Admission {
    Admit,
    /// Wait at most this long before asking again.
    Delay(Duration),
}

/// Per-worker admission control.
///
/// The achieved rate is compared with the target rate within the current stage, so a stage that
/// starts behind doesn't try to catch up the average of earlier stages.
#[derive(Debug, Clone)]
pub struct Pacer {
    controller: RateController,
    worker_index: usize,
    worker_count: usize,
    stage: u64,
    issued_in_stage: u64,
}

impl Pacer {
    /// Whether the next iteration may start `elapsed` after this worker started.
    pub fn admission(&mut self, elapsed: Duration) -> Admission {
        self.enter_stage(elapsed);
        if self.issued_in_stage == 0 {
            return Admission::Admit;
        }

        let schedule = self.controller.schedule();
        let rate = self
            .controller
            .next_target_rate(elapsed, self.worker_index, self.worker_count);
        let in_stage = elapsed
            .saturating_sub(schedule.stage_start(self.stage))
            .as_secs_f64();
        let due = self.issued_in_stage as f64 / rate;
        if in_stage >= due {
            return Admission::Admit;
        }

        let mut wait = Duration::try_from_secs_f64(due - in_stage).unwrap_or(Duration::ZERO);
        if let Some(next_stage) = schedule.next_stage_start(self.stage) {
            wait = wait.min(next_stage.saturating_sub(elapsed));
        }
        Admission::Delay(wait)
    }

    pub fn record_issued(&mut self, elapsed: Duration) {
        self.enter_stage(elapsed);
        self.issued_in_stage += 1;
    }

    fn enter_stage(&mut self, elapsed: Duration) {
        let stage = self.controller.schedule().stage_at(elapsed);
        if stage != self.stage {
            self.stage = stage;
            self.issued_in_stage = 0;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stepped() -> RateSchedule {
        RateSchedule::Stepped {
            start: 1.0,
            end: 5.0,
            step: 1.0,
            stage_duration: Duration::from_secs(10),
        }
    }

    /// Drive pacers on a simulated clock with 1ms resolution, returning the start times in ms.
    fn simulate(schedule: RateSchedule, workers: usize, until_ms: u64) -> Vec<u64> {
        let controller = RateController::new(schedule);
        let mut pacers = (0..workers)
            .map(|i| controller.pacer(i, workers))
            .collect::<Vec<_>>();

        let mut starts = Vec::new();
        for now in 0..until_ms {
            let elapsed = Duration::from_millis(now);
            for pacer in pacers.iter_mut() {
                if pacer.admission(elapsed) == Admission::Admit {
                    pacer.record_issued(elapsed);
                    starts.push(now);
                }
            }
        }
        starts
    }

    fn count_between(starts: &[u64], from_ms: u64, to_ms: u64) -> usize {
        starts.iter().filter(|t| **t >= from_ms && **t < to_ms).count()
    }

    #[test]
    fn fixed_rate_is_split_between_workers() {
        let controller = RateController::new(RateSchedule::Fixed(10.0));
        assert_eq!(2.5, controller.next_target_rate(Duration::from_secs(100), 0, 4));
        assert_eq!(10.0, controller.next_target_rate(Duration::ZERO, 0, 1));
    }

    #[test]
    fn stepped_rate_increases_and_caps() {
        let controller = RateController::new(stepped());

        let rates = [0, 9, 10, 25, 39, 40, 1000]
            .iter()
            .map(|s| controller.next_target_rate(Duration::from_secs(*s), 0, 1))
            .collect::<Vec<_>>();
        assert_eq!(vec![1.0, 1.0, 2.0, 3.0, 4.0, 5.0, 5.0], rates);
    }

    #[test]
    fn start_delay_staggers_workers() {
        let controller = RateController::new(RateSchedule::Fixed(10.0));

        assert_eq!(Duration::ZERO, controller.start_delay(0, 4));
        assert_eq!(Duration::from_millis(100), controller.start_delay(1, 4));
        assert_eq!(Duration::from_millis(300), controller.start_delay(3, 4));
    }

    #[test]
    fn fixed_rate_admission_is_evenly_spaced() {
        let starts = simulate(RateSchedule::Fixed(10.0), 1, 1_000);
        assert_eq!(10, starts.len());
        assert_eq!(vec![0, 100, 200], starts[..3].to_vec());
    }

    #[test]
    fn stepped_rate_converges_per_stage() {
        let starts = simulate(stepped(), 1, 60_000);

        assert!(count_between(&starts, 0, 10_000).abs_diff(10) <= 1);
        assert!(count_between(&starts, 10_000, 20_000).abs_diff(20) <= 1);
        assert!(count_between(&starts, 20_000, 30_000).abs_diff(30) <= 1);
        assert!(count_between(&starts, 30_000, 40_000).abs_diff(40) <= 1);
        // Capped at `end` from here on.
        assert!(count_between(&starts, 40_000, 50_000).abs_diff(50) <= 1);
        assert!(count_between(&starts, 50_000, 60_000).abs_diff(50) <= 1);
    }

    #[test]
    fn stepped_rate_converges_with_many_workers() {
        let starts = simulate(stepped(), 4, 50_000);

        let first_stage = count_between(&starts, 0, 10_000);
        let last_stage = count_between(&starts, 40_000, 50_000);
        assert!(first_stage.abs_diff(10) <= 4, "first stage: {first_stage}");
        assert!(last_stage.abs_diff(50) <= 4, "last stage: {last_stage}");
    }

    #[test]
    fn delay_does_not_cross_stage_boundary() {
        let controller = RateController::new(stepped());
        let mut pacer = controller.pacer(0, 1);

        // Ahead of the first stage's rate, the next start would be due at 12s.
        for _ in 0..12 {
            pacer.record_issued(Duration::from_millis(9_500));
        }
        assert_eq!(
            Admission::Delay(Duration::from_millis(500)),
            pacer.admission(Duration::from_millis(9_500))
        );
        assert_eq!(Admission::Admit, pacer.admission(Duration::from_secs(10)));
    }
}
