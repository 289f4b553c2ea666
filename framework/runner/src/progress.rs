use std::cmp::min;
use std::fmt::Write;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use cloudbench_core::prelude::{AbortListener, AbortState};
use indicatif::{ProgressBar, ProgressState, ProgressStyle};

use crate::config::Strategy;

const REFRESH_INTERVAL: Duration = Duration::from_millis(500);

/// What the progress bar measures progress against.
#[derive(Debug, Clone)]
pub(crate) enum ProgressPlan {
    /// Time bounded runs show elapsed time against the planned duration.
    Duration(Duration),
    /// Count bounded runs show completed iterations against the total.
    Iterations {
        total: u64,
        completed: Arc<AtomicU64>,
    },
}

impl ProgressPlan {
    pub(crate) fn for_strategy(strategy: &Strategy, completed: Arc<AtomicU64>) -> Self {
        match (strategy.planned_duration(), strategy.planned_iterations()) {
            (Some(duration), _) => ProgressPlan::Duration(duration),
            (None, total) => ProgressPlan::Iterations {
                total: total.unwrap_or(0),
                completed,
            },
        }
    }

    fn position(&self, started: Instant) -> u64 {
        match self {
            ProgressPlan::Duration(planned) => {
                min(started.elapsed().as_secs(), planned.as_secs())
            }
            ProgressPlan::Iterations { total, completed } => {
                min(completed.load(Ordering::Relaxed), *total)
            }
        }
    }

    fn length(&self) -> u64 {
        match self {
            ProgressPlan::Duration(planned) => planned.as_secs(),
            ProgressPlan::Iterations { total, .. } => *total,
        }
    }

    fn style(&self) -> anyhow::Result<ProgressStyle> {
        let style = match self {
            ProgressPlan::Duration(planned) => {
                let planned = planned.as_secs();
                let (hours, minutes, seconds) = (planned / 3600, (planned % 3600) / 60, planned % 60);
                ProgressStyle::with_template(
                    "{spinner:.green} [{wide_bar:.cyan/blue}] [{elapsed_precise} / {planned_runtime}]",
                )?
                .with_key(
                    "planned_runtime",
                    move |_state: &ProgressState, w: &mut dyn Write| {
                        let _ = write!(w, "{:02}:{:02}:{:02}", hours, minutes, seconds);
                    },
                )
            }
            ProgressPlan::Iterations { .. } => ProgressStyle::with_template(
                "{spinner:.green} [{wide_bar:.cyan/blue}] [{pos} / {len} iterations, {elapsed_precise}]",
            )?,
        };
        Ok(style.progress_chars("#>-"))
    }
}

/// Displays a progress bar while the run is going to show the user how much is left.
///
/// The bar is cleared once `stop_listener` is aborted. A soft stop leaves the bar at its final
/// position, a hard stop clears it.
pub(crate) fn start_progress(plan: ProgressPlan, stop_listener: AbortListener) {
    let style = match plan.style() {
        Ok(style) => style,
        Err(e) => {
            log::warn!("Not showing progress, failed to set progress style: {:?}", e);
            return;
        }
    };

    let spawned = std::thread::Builder::new()
        .name("progress".to_string())
        .spawn(move || {
            let started = Instant::now();
            let pb = ProgressBar::new(plan.length());
            pb.set_style(style);

            loop {
                pb.set_position(plan.position(started));
                if stop_listener.wait_timeout(REFRESH_INTERVAL) {
                    log::trace!("Progress thread shutting down");
                    if stop_listener.state() == AbortState::HardAbort {
                        pb.finish_and_clear();
                    } else {
                        pb.set_position(plan.position(started));
                        pb.finish();
                    }
                    break;
                }
            }
        });

    if let Err(e) = spawned {
        log::error!("Failed to start progress thread: {:?}", e);
    }
}
