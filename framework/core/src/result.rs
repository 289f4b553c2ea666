use std::any::Any;
use std::ops::Deref;
use std::time::{Duration, SystemTime};

use serde::{Deserialize, Serialize};

use crate::abort::AbortSignalError;
use crate::error::{IterationTimeoutError, NamedError};

/// Wall clock time in seconds since the Unix epoch, the unit used for all result timestamps.
pub fn now_timestamp() -> f64 {
    SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or_default()
}

/// The error captured from a failed iteration, as `(kind, message, trace)`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IterationError {
    pub kind: String,
    pub message: String,
    pub trace: String,
}

impl IterationError {
    pub fn new(kind: impl Into<String>, message: impl Into<String>, trace: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            message: message.into(),
            trace: trace.into(),
        }
    }

    /// Format an error returned by a scenario.
    pub fn from_anyhow(err: &anyhow::Error) -> Self {
        let kind = if let Some(named) = err.downcast_ref::<NamedError>() {
            named.kind().to_string()
        } else if err.is::<IterationTimeoutError>() {
            "TimeoutException".to_string()
        } else if err.is::<AbortSignalError>() {
            "AbortSignalError".to_string()
        } else {
            "ScenarioError".to_string()
        };

        Self {
            kind,
            message: err.to_string(),
            trace: format!("{err:?}"),
        }
    }

    /// Format the payload of a panic caught while running a scenario.
    pub fn from_panic(payload: &(dyn Any + Send)) -> Self {
        let message = if let Some(msg) = payload.downcast_ref::<&str>() {
            msg.to_string()
        } else if let Some(msg) = payload.downcast_ref::<String>() {
            msg.clone()
        } else {
            "Scenario panicked".to_string()
        };

        Self {
            kind: "Panic".to_string(),
            trace: format!("panicked at: {message}"),
            message,
        }
    }
}

impl std::fmt::Display for IterationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.kind, self.message)
    }
}

/// A named, timed span within one iteration. Actions nest when one is started inside another.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AtomicAction {
    pub name: String,
    pub started_at: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<f64>,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub failed: bool,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub children: Vec<AtomicAction>,
}

impl AtomicAction {
    pub fn new(name: impl Into<String>, started_at: f64) -> Self {
        Self {
            name: name.into(),
            started_at,
            finished_at: None,
            failed: false,
            children: Vec::new(),
        }
    }

    /// Duration of the action in seconds, zero if it never finished.
    pub fn duration(&self) -> f64 {
        self.finished_at
            .map(|finished_at| (finished_at - self.started_at).max(0.0))
            .unwrap_or(0.0)
    }
}

/// One item of custom output attached to an iteration by the scenario.
///
/// The runner does not interpret the chart, it is carried through to the reporters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutputChart {
    pub title: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub chart_plugin: String,
    pub data: serde_json::Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub axis_label: Option<String>,
}

impl OutputChart {
    pub fn new(title: impl Into<String>, chart_plugin: impl Into<String>, data: serde_json::Value) -> Self {
        Self {
            title: title.into(),
            description: None,
            chart_plugin: chart_plugin.into(),
            data,
            label: None,
            axis_label: None,
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = Some(label.into());
        self
    }

    pub fn with_axis_label(mut self, axis_label: impl Into<String>) -> Self {
        self.axis_label = Some(axis_label.into());
        self
    }

    /// Check the parts of the chart that the type system cannot.
    pub fn validate(&self, output_type: &str) -> anyhow::Result<()> {
        if self.title.is_empty() {
            anyhow::bail!("{output_type} output has an empty 'title'");
        }
        if self.chart_plugin.is_empty() {
            anyhow::bail!("{output_type} output has an empty 'chart_plugin'");
        }
        if !(self.data.is_array() || self.data.is_object()) {
            anyhow::bail!(
                "Value of {output_type} output data has wrong type, should be an array or an object"
            );
        }

        Ok(())
    }
}

/// Custom data reported by a scenario, split into the two series categories.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Output {
    pub additive: Vec<OutputChart>,
    pub complete: Vec<OutputChart>,
}

impl Output {
    pub fn is_empty(&self) -> bool {
        self.additive.is_empty() && self.complete.is_empty()
    }
}

/// The outcome of a single scenario iteration.
///
/// Created once by the iteration executor and not modified afterwards.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IterationResult {
    /// The index claimed from the shared iteration counter.
    pub index: u64,
    /// Wall clock time that the iteration started.
    pub timestamp: f64,
    /// Time spent in the scenario body in seconds, excluding `idle_duration`.
    pub duration: f64,
    /// Time the scenario declared as idle, such as deliberate pauses.
    pub idle_duration: f64,
    pub error: Option<IterationError>,
    pub atomic_actions: Vec<AtomicAction>,
    pub output: Output,
}

impl IterationResult {
    /// The synthetic result recorded for an iteration that overran its deadline.
    pub fn timed_out(index: u64, timestamp: f64, timeout: Duration) -> Self {
        let err = anyhow::Error::new(IterationTimeoutError::new(timeout));
        Self {
            index,
            timestamp,
            duration: timeout.as_secs_f64(),
            idle_duration: 0.0,
            error: Some(IterationError::from_anyhow(&err)),
            atomic_actions: Vec::new(),
            output: Output::default(),
        }
    }

    pub fn is_error(&self) -> bool {
        self.error.is_some()
    }

    /// Wall clock time that the iteration finished.
    pub fn finished_at(&self) -> f64 {
        self.timestamp + self.duration + self.idle_duration
    }

    /// Top level atomic actions as `(name, duration)` in the order they were started.
    pub fn atomic_durations(&self) -> Vec<(&str, f64)> {
        self.atomic_actions
            .iter()
            .map(|action| (action.name.as_str(), action.duration()))
            .collect()
    }
}

/// Iteration results sorted by timestamp.
///
/// Batches are delivered to the consumer in any order relative to each other, only the results
/// within one batch are ordered.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ResultBatch(Vec<IterationResult>);

impl ResultBatch {
    pub fn from_unsorted(mut results: Vec<IterationResult>) -> Self {
        results.sort_by(|a, b| a.timestamp.total_cmp(&b.timestamp));
        Self(results)
    }

    pub fn into_inner(self) -> Vec<IterationResult> {
        self.0
    }
}

impl Deref for ResultBatch {
    type Target = [IterationResult];

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl IntoIterator for ResultBatch {
    type Item = IterationResult;
    type IntoIter = std::vec::IntoIter<IterationResult>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.into_iter()
    }
}
