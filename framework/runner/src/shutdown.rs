use cloudbench_core::prelude::AbortHandle;
use tokio::signal;

/// Abort the run on Ctrl-C.
///
/// The first signal is a soft abort, letting in-flight iterations finish. The second is a hard
/// abort, which also cancels work running through [crate::executor::Executor::execute_cancellable].
pub(crate) fn start_abort_listener(runtime: &tokio::runtime::Runtime, abort_handle: AbortHandle) {
    runtime.spawn(async move {
        loop {
            if let Err(e) = signal::ctrl_c().await {
                log::error!("Failed to listen for Ctrl-C: {:?}", e);
                break;
            }

            if abort_handle.soft_abort() {
                println!("Received abort signal, waiting for running iterations to finish...");
            } else if abort_handle.hard_abort() {
                println!("Received second abort signal, cancelling running iterations...");
                break;
            }
        }
    });
}
