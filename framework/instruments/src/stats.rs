/// Summary statistics over a set of durations, in seconds.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DurationStats {
    pub min: f64,
    pub median: f64,
    pub p90: f64,
    pub p95: f64,
    pub max: f64,
    pub avg: f64,
}

impl DurationStats {
    /// Compute the statistics, or `None` if there are no durations.
    pub fn from_durations(durations: &[f64]) -> Option<Self> {
        if durations.is_empty() {
            return None;
        }

        let mut sorted = durations.to_vec();
        sorted.sort_by(|a, b| a.total_cmp(b));

        Some(Self {
            min: sorted[0],
            median: percentile(&sorted, 0.5),
            p90: percentile(&sorted, 0.9),
            p95: percentile(&sorted, 0.95),
            max: sorted[sorted.len() - 1],
            avg: sorted.iter().sum::<f64>() / sorted.len() as f64,
        })
    }
}

/// Linear interpolation between the closest ranks. `sorted` must be non-empty and sorted.
fn percentile(sorted: &[f64], percent: f64) -> f64 {
    let rank = (sorted.len() - 1) as f64 * percent;
    let lower = rank.floor() as usize;
    let upper = rank.ceil() as usize;
    if lower == upper {
        return sorted[lower];
    }

    sorted[lower] + (sorted[upper] - sorted[lower]) * (rank - lower as f64)
}
