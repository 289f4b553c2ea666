use std::time::Instant;

use cloudbench_core::prelude::{AbortListener, IterationCounter};

/// What a worker should do next.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NextIteration {
    /// Run the iteration with this index.
    Index(u64),
    /// Every iteration of the run has been claimed.
    Exhausted,
    /// The configured run duration has elapsed.
    Expired,
    /// The run was aborted.
    Aborted,
}

impl NextIteration {
    fn is_terminal(&self) -> bool {
        !matches!(self, NextIteration::Index(_))
    }
}

/// Hands out iteration indices to one worker from the counter shared by the whole run.
///
/// Once it has stopped it stays stopped and reports the same reason.
#[derive(Debug, Clone)]
pub struct IterationSource {
    counter: IterationCounter,
    limit: Option<u64>,
    deadline: Option<Instant>,
    abort_listener: AbortListener,
    stopped: Option<NextIteration>,
}

impl IterationSource {
    pub fn new(counter: IterationCounter, abort_listener: AbortListener) -> Self {
        Self {
            counter,
            limit: None,
            deadline: None,
            abort_listener,
            stopped: None,
        }
    }

    /// Stop once `limit` indices have been claimed across the run.
    pub fn with_limit(mut self, limit: u64) -> Self {
        self.limit = Some(limit);
        self
    }

    /// Stop handing out indices once `deadline` has passed.
    pub fn with_deadline(mut self, deadline: Instant) -> Self {
        self.deadline = Some(deadline);
        self
    }

    pub fn next_iteration(&mut self) -> NextIteration {
        if let Some(stopped) = self.stopped {
            return stopped;
        }

        let next = if self.abort_listener.should_abort() {
            NextIteration::Aborted
        } else if self.deadline.is_some_and(|deadline| Instant::now() >= deadline) {
            NextIteration::Expired
        } else {
            match self.counter.claim(self.limit) {
                Some(index) => NextIteration::Index(index),
                None => NextIteration::Exhausted,
            }
        };

        if next.is_terminal() {
            self.stopped = Some(next);
        }
        next
    }

    /// Why this source stopped, if it has.
    pub fn stop_reason(&self) -> Option<NextIteration> {
        self.stopped
    }
}

impl Iterator for IterationSource {
    type Item = u64;

    fn next(&mut self) -> Option<Self::Item> {
        match self.next_iteration() {
            NextIteration::Index(index) => Some(index),
            _ => None,
        }
    }
}
