use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

/// The state of the abort signal for a run.
///
/// The state only ever moves forward: `NotAborted -> SoftAbort -> HardAbort`. Within the runner the
/// two abort kinds behave the same, no new iterations are started and in-flight iterations are
/// allowed to finish. The distinction is kept for the caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AbortState {
    NotAborted = 0,
    SoftAbort = 1,
    HardAbort = 2,
}

impl AbortState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => AbortState::NotAborted,
            1 => AbortState::SoftAbort,
            _ => AbortState::HardAbort,
        }
    }
}

#[derive(Debug, Default)]
struct AbortInner {
    state: AtomicU8,
    lock: Mutex<()>,
    wake: Condvar,
}

/// Handle used to request that a run stops issuing new iterations.
///
/// Cloning the handle shares the same underlying signal. Setting the signal is idempotent and safe
/// to do from any number of threads at once.
#[derive(Debug, Clone, Default)]
pub struct AbortHandle {
    inner: Arc<AbortInner>,
}

impl AbortHandle {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stop issuing new iterations and let the in-flight ones finish.
    ///
    /// Returns `true` if this call changed the state.
    pub fn soft_abort(&self) -> bool {
        self.transition(AbortState::SoftAbort)
    }

    /// Stop as soon as the abort is observed.
    ///
    /// Returns `true` if this call changed the state.
    pub fn hard_abort(&self) -> bool {
        self.transition(AbortState::HardAbort)
    }

    pub fn state(&self) -> AbortState {
        AbortState::from_u8(self.inner.state.load(Ordering::Acquire))
    }

    pub fn is_aborted(&self) -> bool {
        self.state() != AbortState::NotAborted
    }

    pub fn new_listener(&self) -> AbortListener {
        AbortListener {
            inner: self.inner.clone(),
        }
    }

    fn transition(&self, to: AbortState) -> bool {
        let previous = self.inner.state.fetch_max(to as u8, Ordering::AcqRel);
        if previous >= to as u8 {
            return false;
        }

        // Taking the lock before notifying means a waiter is either already parked or will see the
        // new state when it checks under the lock.
        let _guard = self.inner.lock.lock();
        self.inner.wake.notify_all();

        log::debug!(
            "Abort state changed from {:?} to {:?}",
            AbortState::from_u8(previous),
            to
        );
        true
    }
}

/// Read side of an [AbortHandle], given to every worker.
#[derive(Debug, Clone)]
pub struct AbortListener {
    inner: Arc<AbortInner>,
}

impl AbortListener {
    /// Point in time check if an abort has been requested. If this returns true then no new work
    /// should be started.
    pub fn should_abort(&self) -> bool {
        self.state() != AbortState::NotAborted
    }

    pub fn state(&self) -> AbortState {
        AbortState::from_u8(self.inner.state.load(Ordering::Acquire))
    }

    /// Sleep for up to `timeout`, waking early if an abort is requested.
    ///
    /// Returns `true` if the run has been aborted.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut guard = self.inner.lock.lock();
        while !self.should_abort() {
            if self.inner.wake.wait_until(&mut guard, deadline).timed_out() {
                break;
            }
        }

        self.should_abort()
    }
}

#[derive(derive_more::Error, derive_more::Display, Debug)]
pub struct AbortSignalError {
    msg: String,
}

impl Default for AbortSignalError {
    fn default() -> Self {
        Self {
            msg: "Execution cancelled by abort signal".to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn abort_is_idempotent() {
        let handle = AbortHandle::new();
        assert_eq!(AbortState::NotAborted, handle.state());

        assert!(handle.soft_abort());
        assert!(!handle.soft_abort());
        assert_eq!(AbortState::SoftAbort, handle.state());

        assert!(handle.hard_abort());
        assert!(!handle.hard_abort());
        // A soft abort after a hard abort must not downgrade the state
        assert!(!handle.soft_abort());
        assert_eq!(AbortState::HardAbort, handle.state());
    }

    #[test]
    fn listener_sees_abort_from_clone() {
        let handle = AbortHandle::new();
        let listener = handle.new_listener();
        assert!(!listener.should_abort());

        handle.clone().hard_abort();
        assert!(listener.should_abort());
        assert_eq!(AbortState::HardAbort, listener.state());
    }

    #[test]
    fn wait_timeout_without_abort_times_out() {
        let handle = AbortHandle::new();
        let listener = handle.new_listener();

        let started = Instant::now();
        assert!(!listener.wait_timeout(Duration::from_millis(20)));
        assert!(started.elapsed() >= Duration::from_millis(20));
    }

    #[test]
    fn wait_timeout_wakes_on_abort() {
        let handle = AbortHandle::new();
        let listener = handle.new_listener();

        let aborter = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(20));
            handle.soft_abort();
        });

        let started = Instant::now();
        assert!(listener.wait_timeout(Duration::from_secs(10)));
        assert!(started.elapsed() < Duration::from_secs(5));
        aborter.join().unwrap();
    }
}
