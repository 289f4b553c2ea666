use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// The iteration index shared by every worker of a run.
///
/// Each call to [IterationCounter::claim] hands out a distinct index, across all the threads that
/// hold a clone of the counter. No index is handed out twice and no index at or above the limit is
/// ever handed out.
#[derive(Debug, Clone, Default)]
pub struct IterationCounter {
    next: Arc<AtomicU64>,
}

impl IterationCounter {
    pub fn new() -> Self {
        Self::default()
    }

    #[cfg(test)]
    fn starting_at(base: u64) -> Self {
        Self {
            next: Arc::new(AtomicU64::new(base)),
        }
    }

    /// Claim the next iteration index.
    ///
    /// Returns `None` once `limit` indices have been claimed, or if the counter is exhausted.
    pub fn claim(&self, limit: Option<u64>) -> Option<u64> {
        self.next
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |current| match limit {
                Some(limit) if current >= limit => None,
                _ => current.checked_add(1),
            })
            .ok()
    }

    /// The number of indices claimed so far (or the next index that would be handed out).
    pub fn claimed(&self) -> u64 {
        self.next.load(Ordering::Acquire)
    }
}
