//! Browser automation capability used by the step executor
//!
//! A [`Driver`] is one live browser session. Every method takes `&mut self`,
//! so commands against a session are issued and awaited strictly in order
//! and a session can never be shared between concurrently running
//! scenarios. Drivers report failures as [`DriverError`] and never retry.

pub mod playwright;
pub mod scripted;

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::{DriverError, DriverResult};
use crate::model::{MetricKind, Value, WaitCondition};

pub use playwright::{Browser, PlaywrightConfig, PlaywrightDriver, PlaywrightDriverFactory};
pub use scripted::{PageScript, ScriptedDriver, ScriptedDriverFactory, SessionLog, SimulatedElement};

/// Opaque reference to an element located in a session
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ElementHandle {
    pub id: String,
    pub selector: String,
}

/// What to do with a located element
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "camelCase")]
pub enum Interaction {
    /// Click; observes `Null`
    Click,
    /// Type into an input; observes the value read back afterwards
    Fill(String),
    /// Observes the element's inner text
    ReadText,
    /// Observes the element's input value
    ReadValue,
    /// Observes whether the element is visible
    IsVisible,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum WaitStatus {
    Satisfied,
    TimedOut,
}

/// One browser session.
#[async_trait]
pub trait Driver: Send {
    /// Identifier of this session, for logs
    fn session_id(&self) -> &str;

    async fn navigate(&mut self, url: &str) -> DriverResult<()>;

    /// Resolve a selector; a miss is `DriverErrorKind::ElementNotFound`.
    async fn locate(&mut self, selector: &str) -> DriverResult<ElementHandle>;

    async fn interact(&mut self, handle: &ElementHandle, interaction: Interaction) -> DriverResult<Value>;

    async fn read_metric(&mut self, metric: MetricKind) -> DriverResult<Value>;

    /// Wait until `condition` holds or `timeout` elapses.
    async fn wait_for(&mut self, condition: &WaitCondition, timeout: Duration) -> DriverResult<WaitStatus>;

    /// Close or reset the session. Called exactly once by the runner.
    async fn release(&mut self) -> DriverResult<()>;
}

/// Source of independent sessions, one per scenario execution.
#[async_trait]
pub trait DriverFactory: Send + Sync {
    async fn open_session(&self) -> DriverResult<Box<dyn Driver>>;
}

/// Convert a JSON reply value into an observed value.
pub(crate) fn observed_from_json(value: serde_json::Value) -> DriverResult<Value> {
    match value {
        serde_json::Value::Null => Ok(Value::Null),
        serde_json::Value::Bool(b) => Ok(Value::Bool(b)),
        serde_json::Value::Number(n) => n
            .as_f64()
            .map(Value::Number)
            .ok_or_else(|| DriverError::protocol(format!("number out of range: {}", n))),
        serde_json::Value::String(s) => Ok(Value::Text(s)),
        other => Err(DriverError::protocol(format!(
            "unexpected structured value: {}",
            other
        ))),
    }
}
