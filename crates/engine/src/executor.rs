//! Execution of a single scenario step against a driver session

use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::time::{sleep_until, timeout_at, Instant};
use tracing::{debug, warn};

use crate::assertion::{evaluate_all, AssertionFailure};
use crate::config::ExecutorConfig;
use crate::driver::{Driver, Interaction, WaitStatus};
use crate::error::{DriverError, DriverErrorKind};
use crate::metrics::SampleSummary;
use crate::model::{Action, ActionKind, MetricKind, Probe, Statistic, Step, Value};

/// Result of one step. Exactly one is recorded per step of a scenario.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum StepOutcome {
    Success,
    AssertionFailed(AssertionFailure),
    ExecutionError(ExecutionFailure),
    TimedOut { after_ms: u64 },
    /// Not run because an earlier step failed under the abort policy
    Skipped,
    /// Not run because the run was cancelled
    Cancelled,
}

impl StepOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, StepOutcome::Success)
    }

    /// True for outcomes of steps that ran and did not succeed
    pub fn is_failure(&self) -> bool {
        matches!(
            self,
            StepOutcome::AssertionFailed(_) | StepOutcome::ExecutionError(_) | StepOutcome::TimedOut { .. }
        )
    }

    pub fn name(&self) -> &'static str {
        match self {
            StepOutcome::Success => "success",
            StepOutcome::AssertionFailed(_) => "assertion_failed",
            StepOutcome::ExecutionError(_) => "execution_error",
            StepOutcome::TimedOut { .. } => "timed_out",
            StepOutcome::Skipped => "skipped",
            StepOutcome::Cancelled => "cancelled",
        }
    }
}

/// A driver failure that ended a step
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionFailure {
    pub kind: DriverErrorKind,
    pub message: String,
}

impl From<DriverError> for ExecutionFailure {
    fn from(e: DriverError) -> Self {
        Self {
            kind: e.kind,
            message: e.message,
        }
    }
}

/// Record of one step in a verdict
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepRecord {
    pub index: usize,
    pub label: String,
    pub action: ActionKind,
    pub outcome: StepOutcome,
    /// Attempts made, 0 for steps that never ran
    pub attempts: u32,
    pub duration_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observed: Option<Value>,
}

impl StepRecord {
    /// Record for a step that was never attempted
    pub fn not_run(step: &Step, outcome: StepOutcome) -> Self {
        Self {
            index: step.index,
            label: step.label(),
            action: step.action.kind(),
            outcome,
            attempts: 0,
            duration_ms: 0,
            observed: None,
        }
    }
}

enum ActionError {
    Driver(DriverError),
    /// The driver reported that a wait condition never held
    WaitTimedOut,
}

impl From<DriverError> for ActionError {
    fn from(e: DriverError) -> Self {
        ActionError::Driver(e)
    }
}

/// Runs steps with per-step timeouts and bounded retries.
#[derive(Debug, Clone)]
pub struct StepExecutor {
    retry_backoff: Duration,
    wait_grace: Duration,
}

impl Default for StepExecutor {
    fn default() -> Self {
        Self::new(&ExecutorConfig::default())
    }
}

impl StepExecutor {
    pub fn new(config: &ExecutorConfig) -> Self {
        Self {
            retry_backoff: Duration::from_millis(config.retry_backoff_ms),
            wait_grace: Duration::from_millis(config.wait_grace_ms),
        }
    }

    /// Execute `step`. Driver failures, timeouts and assertion failures are
    /// all reported in the returned record, never as errors.
    pub async fn execute(&self, step: &Step, driver: &mut dyn Driver) -> StepRecord {
        let start = Instant::now();
        let label = step.label();
        debug!("[{}] step {}: {}", driver.session_id(), step.index, label);

        // Driver-side waits get slack so their own timeout reports first.
        let grace = match step.action {
            Action::WaitFor { .. } => self.wait_grace,
            _ => Duration::ZERO,
        };
        // One deadline covers every attempt and the backoff between them.
        let deadline = start + step.timeout + grace;

        let mut attempts = 0;
        let (outcome, observed) = loop {
            attempts += 1;
            let remaining = deadline.saturating_duration_since(Instant::now()).saturating_sub(grace);
            match timeout_at(deadline, perform(&step.action, remaining, driver)).await {
                Err(_) | Ok(Err(ActionError::WaitTimedOut)) => {
                    break (timed_out(step, driver.session_id()), None);
                }
                Ok(Err(ActionError::Driver(e))) => {
                    if attempts <= step.retry.max_retries && step.retry.allows(e.kind) {
                        debug!(
                            "[{}] step {} attempt {} failed ({}), retrying",
                            driver.session_id(),
                            step.index,
                            attempts,
                            e
                        );
                        sleep_until((Instant::now() + self.retry_backoff).min(deadline)).await;
                        if Instant::now() >= deadline {
                            break (timed_out(step, driver.session_id()), None);
                        }
                        continue;
                    }
                    break (StepOutcome::ExecutionError(e.into()), None);
                }
                Ok(Ok(observed)) => {
                    let outcome = match evaluate_all(&step.assertions, &observed) {
                        Ok(()) => StepOutcome::Success,
                        Err(failure) => {
                            debug!("[{}] step {}: {}", driver.session_id(), step.index, failure);
                            StepOutcome::AssertionFailed(failure)
                        }
                    };
                    break (outcome, Some(observed));
                }
            }
        };

        StepRecord {
            index: step.index,
            label,
            action: step.action.kind(),
            outcome,
            attempts,
            duration_ms: start.elapsed().as_millis() as u64,
            observed,
        }
    }
}

fn timed_out(step: &Step, session_id: &str) -> StepOutcome {
    warn!(
        "[{}] step {} timed out after {} ms",
        session_id,
        step.index,
        step.timeout.as_millis()
    );
    StepOutcome::TimedOut {
        after_ms: step.timeout.as_millis() as u64,
    }
}

async fn perform(action: &Action, wait_timeout: Duration, driver: &mut dyn Driver) -> Result<Value, ActionError> {
    let observed = match action {
        Action::Navigate { url } => {
            driver.navigate(url).await?;
            Value::Text(url.clone())
        }
        Action::Click { selector } => {
            let handle = driver.locate(selector).await?;
            driver.interact(&handle, Interaction::Click).await?
        }
        Action::Fill { selector, value } => {
            let handle = driver.locate(selector).await?;
            driver.interact(&handle, Interaction::Fill(value.clone())).await?
        }
        Action::WaitFor { condition } => match driver.wait_for(condition, wait_timeout).await? {
            WaitStatus::Satisfied => Value::Bool(true),
            WaitStatus::TimedOut => return Err(ActionError::WaitTimedOut),
        },
        Action::ReadMetric {
            metric,
            samples,
            statistic,
        } => sample_metric(driver, *metric, *samples, *statistic).await?,
        Action::Assert { probe } => match probe {
            Probe::Text(selector) => {
                let handle = driver.locate(selector).await?;
                driver.interact(&handle, Interaction::ReadText).await?
            }
            Probe::Value(selector) => {
                let handle = driver.locate(selector).await?;
                driver.interact(&handle, Interaction::ReadValue).await?
            }
            Probe::Visible(selector) => match driver.locate(selector).await {
                Ok(handle) => driver.interact(&handle, Interaction::IsVisible).await?,
                Err(e) if e.kind == DriverErrorKind::ElementNotFound => Value::Bool(false),
                Err(e) => return Err(e.into()),
            },
            Probe::Metric(metric) => driver.read_metric(*metric).await?,
        },
    };
    Ok(observed)
}

async fn sample_metric(
    driver: &mut dyn Driver,
    metric: MetricKind,
    samples: u32,
    statistic: Statistic,
) -> Result<Value, DriverError> {
    if samples <= 1 {
        return driver.read_metric(metric).await;
    }

    let mut values = Vec::with_capacity(samples as usize);
    for _ in 0..samples {
        match driver.read_metric(metric).await? {
            Value::Number(n) => values.push(n),
            other => {
                return Err(DriverError::protocol(format!(
                    "metric {} produced a non-numeric sample {}",
                    metric.as_str(),
                    other
                )))
            }
        }
    }

    let summary = SampleSummary::from_samples(&values).ok_or_else(|| {
        DriverError::new(
            DriverErrorKind::Unsupported,
            format!("metric {} produced no finite samples", metric.as_str()),
        )
    })?;
    debug!(
        "metric {} over {} samples: mean={:.2} p95={:.2}",
        metric.as_str(),
        summary.finite_count,
        summary.mean,
        summary.p95
    );
    Ok(Value::Number(summary.get(statistic)))
}
