mod atomic;
mod report;
mod stats;

pub use atomic::{merge_atomic_actions, MergedAtomicAction};
pub use report::{
    JsonlResultCollector, ReportCollector, ReportConfig, Reporter, SummaryReportCollector,
};
pub use stats::DurationStats;
