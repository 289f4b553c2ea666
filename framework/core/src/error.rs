use std::time::Duration;

/// Return this error from a scenario to control the error type name recorded for the iteration.
///
/// Any other error is recorded under the generic `ScenarioError` kind. For example, a scenario that
/// fails because a remote resource disappeared might return `NamedError::new("NotFound", "...")` so
/// that the failure can be told apart in reports.
#[derive(derive_more::Error, derive_more::Display, Debug, Clone)]
#[display("{msg}")]
pub struct NamedError {
    kind: String,
    msg: String,
}

impl NamedError {
    pub fn new(kind: impl Into<String>, msg: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            msg: msg.into(),
        }
    }

    pub fn kind(&self) -> &str {
        &self.kind
    }
}

/// Recorded in place of an iteration result when the iteration overruns its deadline.
#[derive(derive_more::Error, derive_more::Display, Debug, Clone)]
#[display("Timeout of {:.3}s exceeded", timeout.as_secs_f64())]
pub struct IterationTimeoutError {
    timeout: Duration,
}

impl IterationTimeoutError {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }
}
