//! Scenario runner: drives a scenario's steps against one session and
//! always hands the session back, however the run ends.

use std::any::Any;
use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::FutureExt;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::driver::{Driver, DriverFactory};
use crate::error::{DriverError, DriverErrorKind, RunnerFault};
use crate::executor::{ExecutionFailure, StepExecutor, StepOutcome, StepRecord};
use crate::model::{Characteristic, FailurePolicy, Scenario};

/// Lifecycle of a scenario run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunState {
    Pending,
    Running,
    Completed,
    Aborted,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VerdictStatus {
    Pass,
    Fail,
}

/// Result of running one scenario
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScenarioVerdict {
    pub scenario_id: String,
    pub characteristic: Characteristic,
    pub status: VerdictStatus,
    pub final_state: RunState,
    /// One record per declared step, in step order
    pub steps: Vec<StepRecord>,
    pub duration_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
}

impl ScenarioVerdict {
    pub fn passed(&self) -> bool {
        self.status == VerdictStatus::Pass
    }

    pub fn outcomes(&self) -> impl Iterator<Item = &StepOutcome> {
        self.steps.iter().map(|r| &r.outcome)
    }

    /// First step that ran and did not succeed
    pub fn first_failure(&self) -> Option<&StepRecord> {
        self.steps.iter().find(|r| r.outcome.is_failure())
    }

    /// Verdict for a scenario whose session could not be opened
    pub fn session_unavailable(scenario: &Scenario, err: DriverError) -> Self {
        let steps = scenario
            .steps
            .iter()
            .enumerate()
            .map(|(i, step)| {
                let outcome = if i == 0 {
                    StepOutcome::ExecutionError(ExecutionFailure::from(err.clone()))
                } else {
                    StepOutcome::Skipped
                };
                StepRecord::not_run(step, outcome)
            })
            .collect();
        Self {
            scenario_id: scenario.id.clone(),
            characteristic: scenario.characteristic,
            status: VerdictStatus::Fail,
            final_state: RunState::Aborted,
            steps,
            duration_ms: 0,
            session_id: None,
        }
    }

    /// Verdict for a scenario interrupted by a runner fault. Steps recorded
    /// before the fault keep their outcomes, the step that was running gets
    /// an internal `ExecutionError` and the rest are `Skipped`.
    pub fn faulted(
        scenario: &Scenario,
        mut steps: Vec<StepRecord>,
        fault: &RunnerFault,
        session_id: Option<String>,
        duration_ms: u64,
    ) -> Self {
        steps.truncate(scenario.steps.len());
        let ran = steps.len();
        for (i, step) in scenario.steps.iter().enumerate().skip(ran) {
            let outcome = if i == ran {
                StepOutcome::ExecutionError(ExecutionFailure {
                    kind: DriverErrorKind::Internal,
                    message: fault.to_string(),
                })
            } else {
                StepOutcome::Skipped
            };
            steps.push(StepRecord::not_run(step, outcome));
        }
        Self {
            scenario_id: scenario.id.clone(),
            characteristic: scenario.characteristic,
            status: VerdictStatus::Fail,
            final_state: RunState::Aborted,
            steps,
            duration_ms,
            session_id,
        }
    }

    /// Verdict for a scenario cancelled before it started
    pub fn cancelled(scenario: &Scenario) -> Self {
        Self {
            scenario_id: scenario.id.clone(),
            characteristic: scenario.characteristic,
            status: VerdictStatus::Fail,
            final_state: RunState::Aborted,
            steps: scenario
                .steps
                .iter()
                .map(|step| StepRecord::not_run(step, StepOutcome::Cancelled))
                .collect(),
            duration_ms: 0,
            session_id: None,
        }
    }
}

/// A runner fault with the failing verdict recorded for its scenario
#[derive(Error, Debug, Clone)]
#[error("{fault}")]
pub struct FaultedRun {
    #[source]
    pub fault: RunnerFault,
    pub verdict: Box<ScenarioVerdict>,
}

impl FaultedRun {
    fn new(
        scenario: &Scenario,
        steps: Vec<StepRecord>,
        fault: RunnerFault,
        session_id: Option<String>,
        duration_ms: u64,
    ) -> Self {
        error!("{}", fault);
        let verdict = ScenarioVerdict::faulted(scenario, steps, &fault, session_id, duration_ms);
        Self {
            fault,
            verdict: Box::new(verdict),
        }
    }
}

const DEFAULT_RELEASE_TIMEOUT: Duration = Duration::from_secs(5);

/// Runs one scenario at a time on a session it is given.
#[derive(Debug, Clone)]
pub struct ScenarioRunner {
    executor: StepExecutor,
    cancel: CancellationToken,
    release_timeout: Duration,
}

impl ScenarioRunner {
    pub fn new(executor: StepExecutor) -> Self {
        Self::with_cancellation(executor, CancellationToken::new())
    }

    pub fn with_cancellation(executor: StepExecutor, cancel: CancellationToken) -> Self {
        Self {
            executor,
            cancel,
            release_timeout: DEFAULT_RELEASE_TIMEOUT,
        }
    }

    /// Bound on how long `run` waits for a session to be released
    pub fn with_release_timeout(mut self, release_timeout: Duration) -> Self {
        self.release_timeout = release_timeout;
        self
    }

    /// Token that stops runs at the next step boundary
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Run `scenario` to completion on `driver`.
    ///
    /// The session is released exactly once whether the steps complete,
    /// abort, get cancelled, or panic. Every step-level failure ends up in
    /// the verdict. A runner fault is returned as an error that still
    /// carries a failing verdict covering every step.
    pub async fn run(&self, scenario: &Scenario, mut driver: Box<dyn Driver>) -> Result<ScenarioVerdict, FaultedRun> {
        let session_id = driver.session_id().to_string();
        let start = Instant::now();
        info!("Running scenario {} ({}) on {}", scenario.id, scenario.characteristic, session_id);

        let mut steps = Vec::with_capacity(scenario.steps.len());
        let driven = AssertUnwindSafe(self.drive(scenario, driver.as_mut(), &mut steps))
            .catch_unwind()
            .await;

        self.release(driver.as_mut(), &session_id).await;
        let duration_ms = start.elapsed().as_millis() as u64;

        let final_state = match driven {
            Ok(state) => state,
            Err(panic) => {
                let fault = RunnerFault::Panicked {
                    scenario: scenario.id.clone(),
                    message: panic_message(&*panic),
                };
                return Err(FaultedRun::new(scenario, steps, fault, Some(session_id), duration_ms));
            }
        };

        if steps.len() != scenario.steps.len() {
            let fault = RunnerFault::InvariantViolated {
                scenario: scenario.id.clone(),
                message: format!("{} outcomes for {} steps", steps.len(), scenario.steps.len()),
            };
            return Err(FaultedRun::new(scenario, steps, fault, Some(session_id), duration_ms));
        }

        let status = if steps.iter().all(|r| r.outcome.is_success()) {
            VerdictStatus::Pass
        } else {
            VerdictStatus::Fail
        };
        info!(
            "Scenario {} {} in {} ms",
            scenario.id,
            if status == VerdictStatus::Pass { "passed" } else { "failed" },
            duration_ms
        );

        Ok(ScenarioVerdict {
            scenario_id: scenario.id.clone(),
            characteristic: scenario.characteristic,
            status,
            final_state,
            steps,
            duration_ms,
            session_id: Some(session_id),
        })
    }

    async fn release(&self, driver: &mut dyn Driver, session_id: &str) {
        let release = AssertUnwindSafe(driver.release()).catch_unwind();
        match timeout(self.release_timeout, release).await {
            Ok(Ok(Ok(()))) => debug!("[{}] session released", session_id),
            Ok(Ok(Err(e))) => warn!("[{}] failed to release session: {}", session_id, e),
            Ok(Err(panic)) => warn!("[{}] release panicked: {}", session_id, panic_message(&*panic)),
            Err(_) => warn!(
                "[{}] session not released within {} ms, abandoning it",
                session_id,
                self.release_timeout.as_millis()
            ),
        }
    }

    async fn drive(&self, scenario: &Scenario, driver: &mut dyn Driver, records: &mut Vec<StepRecord>) -> RunState {
        let mut state = RunState::Running;
        // Set once no further step may run; fills the remaining records.
        let mut halted: Option<StepOutcome> = None;

        for step in &scenario.steps {
            if let Some(outcome) = &halted {
                records.push(StepRecord::not_run(step, outcome.clone()));
                continue;
            }
            if self.cancel.is_cancelled() {
                info!("Scenario {} cancelled before step {}", scenario.id, step.index);
                state = RunState::Aborted;
                halted = Some(StepOutcome::Cancelled);
                records.push(StepRecord::not_run(step, StepOutcome::Cancelled));
                continue;
            }

            let record = self.executor.execute(step, driver).await;
            let failed = record.outcome.is_failure();
            records.push(record);

            if failed && scenario.failure_policy == FailurePolicy::AbortOnFirstFailure {
                debug!("Scenario {} aborting after step {}", scenario.id, step.index);
                state = RunState::Aborted;
                halted = Some(StepOutcome::Skipped);
            }
        }

        if state == RunState::Running {
            state = RunState::Completed;
        }
        state
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

/// One verdict per scenario, in input order, plus any runner faults.
#[derive(Debug, Default)]
pub struct BatchResult {
    pub verdicts: Vec<ScenarioVerdict>,
    pub faults: Vec<RunnerFault>,
}

/// Runs many scenarios, each on its own session, with bounded parallelism.
pub struct BatchRunner {
    runner: Arc<ScenarioRunner>,
    factory: Arc<dyn DriverFactory>,
    max_concurrency: usize,
}

impl BatchRunner {
    pub fn new(runner: ScenarioRunner, factory: Arc<dyn DriverFactory>, max_concurrency: usize) -> Self {
        Self {
            runner: Arc::new(runner),
            factory,
            max_concurrency: max_concurrency.max(1),
        }
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.runner.cancellation_token()
    }

    /// Run every scenario. Scenarios never share a session, and one
    /// scenario's failure or fault does not stop the others.
    pub async fn run_all(&self, scenarios: &[Scenario]) -> BatchResult {
        info!(
            "Running {} scenarios with concurrency {}",
            scenarios.len(),
            self.max_concurrency
        );
        let permits = Arc::new(Semaphore::new(self.max_concurrency));
        let mut tasks = JoinSet::new();
        let mut positions = HashMap::with_capacity(scenarios.len());

        for (position, scenario) in scenarios.iter().cloned().enumerate() {
            let runner = Arc::clone(&self.runner);
            let factory = Arc::clone(&self.factory);
            let permits = Arc::clone(&permits);
            let task = tasks.spawn(async move {
                let result = match permits.acquire_owned().await {
                    Ok(_permit) => run_one(&runner, factory.as_ref(), &scenario).await,
                    Err(_) => {
                        let fault = RunnerFault::InvariantViolated {
                            scenario: scenario.id.clone(),
                            message: "concurrency limiter closed".to_string(),
                        };
                        Err(FaultedRun::new(&scenario, Vec::new(), fault, None, 0))
                    }
                };
                (position, result)
            });
            positions.insert(task.id(), position);
        }

        let mut results = Vec::with_capacity(scenarios.len());
        while let Some(joined) = tasks.join_next_with_id().await {
            match joined {
                Ok((_, entry)) => results.push(entry),
                // A panic outside `ScenarioRunner::run`, e.g. while opening the session.
                Err(e) => {
                    let id = e.id();
                    let message = if e.is_panic() {
                        panic_message(&*e.into_panic())
                    } else {
                        e.to_string()
                    };
                    if let Some(&position) = positions.get(&id) {
                        let scenario = &scenarios[position];
                        let fault = RunnerFault::Panicked {
                            scenario: scenario.id.clone(),
                            message,
                        };
                        results.push((position, Err(FaultedRun::new(scenario, Vec::new(), fault, None, 0))));
                    } else {
                        error!("Unknown batch task {} failed: {}", id, message);
                    }
                }
            }
        }
        results.sort_by_key(|(position, _)| *position);

        let mut batch = BatchResult::default();
        for (_, result) in results {
            match result {
                Ok(verdict) => batch.verdicts.push(verdict),
                Err(faulted) => {
                    batch.faults.push(faulted.fault);
                    batch.verdicts.push(*faulted.verdict);
                }
            }
        }
        batch
    }
}

async fn run_one(
    runner: &ScenarioRunner,
    factory: &dyn DriverFactory,
    scenario: &Scenario,
) -> Result<ScenarioVerdict, FaultedRun> {
    if runner.cancel.is_cancelled() {
        return Ok(ScenarioVerdict::cancelled(scenario));
    }
    match factory.open_session().await {
        Ok(driver) => runner.run(scenario, driver).await,
        Err(e) => {
            warn!("Could not open a session for {}: {}", scenario.id, e);
            Ok(ScenarioVerdict::session_unavailable(scenario, e))
        }
    }
}
