use std::future::Future;
use std::time::Duration;

use cloudbench_core::prelude::{AbortHandle, AbortSignalError, AbortState};

const HARD_ABORT_POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Gives synchronous scenario code access to the async runtime owned by the runner.
#[derive(Debug)]
pub struct Executor {
    runtime: tokio::runtime::Runtime,
    abort_handle: AbortHandle,
}

impl Executor {
    pub(crate) fn new(runtime: tokio::runtime::Runtime, abort_handle: AbortHandle) -> Self {
        Self {
            runtime,
            abort_handle,
        }
    }

    /// Run async code in place, blocking until it completes.
    ///
    /// The future always runs to completion, aborting the run does not cancel in-flight
    /// iterations. Use [Executor::execute_cancellable] for long waits that should end on a hard
    /// abort.
    pub fn execute_in_place<T>(
        &self,
        fut: impl Future<Output = anyhow::Result<T>>,
    ) -> anyhow::Result<T> {
        self.runtime.block_on(fut)
    }

    /// Run async code in place, giving up with an [AbortSignalError] if the run is hard aborted.
    pub fn execute_cancellable<T>(
        &self,
        fut: impl Future<Output = anyhow::Result<T>>,
    ) -> anyhow::Result<T> {
        let abort_listener = self.abort_handle.new_listener();
        self.runtime.block_on(async move {
            tokio::select! {
                result = fut => result,
                _ = async {
                    while abort_listener.state() != AbortState::HardAbort {
                        tokio::time::sleep(HARD_ABORT_POLL_INTERVAL).await;
                    }
                } => {
                    Err(anyhow::anyhow!(AbortSignalError::default()))
                },
            }
        })
    }

    /// Submit async code to be run in the background.
    ///
    /// The future is not cancelled when the run is aborted, and the runner does not wait for it
    /// before finishing.
    pub fn spawn(&self, fut: impl Future<Output = ()> + Send + 'static) {
        self.runtime.spawn(fut);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn executor() -> (Executor, AbortHandle) {
        let runtime = tokio::runtime::Runtime::new().unwrap();
        let abort_handle = AbortHandle::new();
        (Executor::new(runtime, abort_handle.clone()), abort_handle)
    }

    #[test]
    fn execute_in_place_returns_future_output() {
        let (executor, abort_handle) = executor();
        abort_handle.hard_abort();

        let value = executor
            .execute_in_place(async {
                tokio::time::sleep(Duration::from_millis(5)).await;
                Ok(7)
            })
            .unwrap();
        assert_eq!(7, value);
    }

    #[test]
    fn execute_cancellable_stops_on_hard_abort() {
        let (executor, abort_handle) = executor();
        abort_handle.soft_abort();
        assert_eq!(
            3,
            executor.execute_cancellable(async { Ok(3) }).unwrap()
        );

        abort_handle.hard_abort();
        let err = executor
            .execute_cancellable(async {
                tokio::time::sleep(Duration::from_secs(60)).await;
                Ok(())
            })
            .unwrap_err();
        assert!(err.is::<AbortSignalError>());
    }
}
