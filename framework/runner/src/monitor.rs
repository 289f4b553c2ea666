use cloudbench_core::prelude::AbortListener;
use sysinfo::{Pid, ProcessRefreshKind, ProcessesToUpdate, System};

/// Share of the host CPU, in percent, above which the load generator itself may skew results.
const HIGH_CPU_USAGE_PERCENT: f32 = 80.0;

/// Monitor the resource usage of the benchmark process and report high usage.
///
/// Note that this won't stop the run, it will just log a warning to let the user know that their
/// results might be affected by the load generator saturating the host.
///
/// The CPU usage for the process is collected every [sysinfo::MINIMUM_CPU_UPDATE_INTERVAL] and
/// checked until `stop_listener` is aborted.
pub(crate) fn start_monitor(stop_listener: AbortListener) {
    let spawned = std::thread::Builder::new()
        .name("monitor".to_string())
        .spawn(move || {
            let this_process_pid = Pid::from_u32(std::process::id());
            let mut sys = System::new();

            sys.refresh_cpu_all();
            let cpu_count = sys.cpus().len().max(1);

            loop {
                if stop_listener.wait_timeout(sysinfo::MINIMUM_CPU_UPDATE_INTERVAL) {
                    break;
                }

                sys.refresh_processes_specifics(
                    ProcessesToUpdate::Some(&[this_process_pid]),
                    true,
                    ProcessRefreshKind::nothing().with_cpu(),
                );

                let Some(process) = sys.process(this_process_pid) else {
                    log::debug!("No process info available, stopping the resource monitor");
                    break;
                };

                let usage = process.cpu_usage() / cpu_count as f32;
                if usage > HIGH_CPU_USAGE_PERCENT {
                    log::warn!(
                        "High CPU usage detected. The benchmark is using {:.2}% of the CPU, with {} available cores",
                        usage,
                        cpu_count
                    );
                }
            }
        });

    if let Err(e) = spawned {
        log::error!("Failed to start the resource monitor: {:?}", e);
    }
}
