//! Deterministic in-memory driver
//!
//! Simulates a target page without a browser: elements with text, value
//! and visibility, queued metric samples, slow-rendering elements and
//! failure injection. Every session records what it was asked to do in a
//! shared [`SessionLog`] so callers can inspect ordering and release.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::time::{sleep, Instant};
use tracing::trace;

use super::{Driver, DriverFactory, ElementHandle, Interaction, WaitStatus};
use crate::error::{DriverError, DriverErrorKind, DriverResult};
use crate::model::{MetricKind, Value, WaitCondition};

const POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Driver operations that can be made to hang or panic
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operation {
    Navigate,
    Locate,
    Interact,
    ReadMetric,
    WaitFor,
    Release,
}

#[derive(Debug, Clone, Default)]
pub struct SimulatedElement {
    pub text: String,
    pub value: String,
    pub visible: bool,
    /// Lookups that miss before the element "renders"
    pub appears_after: u32,
    /// Interactions rejected as not interactable before one succeeds
    pub busy_for: u32,
    /// Value the field holds after any fill (e.g. a field that drops input)
    pub fixed_value: Option<String>,
}

impl SimulatedElement {
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            visible: true,
            ..Default::default()
        }
    }

    pub fn with_value(mut self, value: impl Into<String>) -> Self {
        self.value = value.into();
        self
    }

    pub fn hidden(mut self) -> Self {
        self.visible = false;
        self
    }

    pub fn appears_after(mut self, lookups: u32) -> Self {
        self.appears_after = lookups;
        self
    }

    pub fn busy_for(mut self, attempts: u32) -> Self {
        self.busy_for = attempts;
        self
    }

    pub fn rejecting_input(mut self, kept: impl Into<String>) -> Self {
        self.fixed_value = Some(kept.into());
        self
    }
}

/// Description of the simulated application a session starts from
#[derive(Debug, Clone, Default)]
pub struct PageScript {
    elements: HashMap<String, SimulatedElement>,
    metrics: HashMap<MetricKind, VecDeque<f64>>,
    failing_urls: HashSet<String>,
    hang_on: HashSet<Operation>,
    panic_on: HashSet<Operation>,
    op_delay: Duration,
}

impl PageScript {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn element(mut self, selector: impl Into<String>, element: SimulatedElement) -> Self {
        self.elements.insert(selector.into(), element);
        self
    }

    /// Queue metric samples; the last one repeats once the queue drains.
    pub fn metric(mut self, metric: MetricKind, samples: impl IntoIterator<Item = f64>) -> Self {
        self.metrics.entry(metric).or_default().extend(samples);
        self
    }

    pub fn failing_url(mut self, url: impl Into<String>) -> Self {
        self.failing_urls.insert(url.into());
        self
    }

    /// Make an operation never complete
    pub fn hang_on(mut self, op: Operation) -> Self {
        self.hang_on.insert(op);
        self
    }

    /// Make an operation panic, simulating a backend bug
    pub fn panic_on(mut self, op: Operation) -> Self {
        self.panic_on.insert(op);
        self
    }

    /// Latency added to every operation
    pub fn delay(mut self, delay: Duration) -> Self {
        self.op_delay = delay;
        self
    }
}

/// Record of one session's activity
#[derive(Debug, Clone, Default)]
pub struct SessionLog {
    pub session_id: String,
    pub operations: Vec<String>,
    pub released: bool,
    pub release_count: usize,
}

pub struct ScriptedDriver {
    session_id: String,
    script: PageScript,
    current_url: String,
    lookups: HashMap<String, u32>,
    log: Arc<Mutex<SessionLog>>,
}

impl ScriptedDriver {
    pub fn new(script: PageScript) -> Self {
        Self::with_log(
            "scripted-0".to_string(),
            script,
            Arc::new(Mutex::new(SessionLog::default())),
        )
    }

    fn with_log(session_id: String, script: PageScript, log: Arc<Mutex<SessionLog>>) -> Self {
        log.lock().session_id = session_id.clone();
        Self {
            session_id,
            script,
            current_url: String::new(),
            lookups: HashMap::new(),
            log,
        }
    }

    /// Shared handle to this session's log
    pub fn log(&self) -> Arc<Mutex<SessionLog>> {
        Arc::clone(&self.log)
    }

    async fn enter(&mut self, op: Operation, entry: String) -> DriverResult<()> {
        trace!("[{}] {}", self.session_id, entry);
        let released = {
            let mut log = self.log.lock();
            log.operations.push(entry);
            log.released
        };
        if released && op != Operation::Release {
            return Err(DriverError::new(
                DriverErrorKind::SessionClosed,
                "session already released",
            ));
        }
        if self.script.panic_on.contains(&op) {
            panic!("simulated backend panic during {:?}", op);
        }
        if self.script.hang_on.contains(&op) {
            std::future::pending::<()>().await;
        }
        if !self.script.op_delay.is_zero() {
            sleep(self.script.op_delay).await;
        }
        Ok(())
    }

    /// Lookup that honours `appears_after`
    fn lookup(&mut self, selector: &str) -> Option<&mut SimulatedElement> {
        let seen = self.lookups.entry(selector.to_string()).or_insert(0);
        *seen += 1;
        let seen = *seen;
        self.script
            .elements
            .get_mut(selector)
            .filter(|el| seen > el.appears_after)
    }

    fn condition_holds(&mut self, condition: &WaitCondition) -> bool {
        match condition {
            WaitCondition::Visible(sel) => self.lookup(sel).map(|el| el.visible).unwrap_or(false),
            WaitCondition::Hidden(sel) => self.lookup(sel).map(|el| !el.visible).unwrap_or(true),
            WaitCondition::TextContains { selector, text } => self
                .lookup(selector)
                .map(|el| el.text.contains(text.as_str()))
                .unwrap_or(false),
            WaitCondition::UrlContains(text) => self.current_url.contains(text.as_str()),
        }
    }
}

#[async_trait]
impl Driver for ScriptedDriver {
    fn session_id(&self) -> &str {
        &self.session_id
    }

    async fn navigate(&mut self, url: &str) -> DriverResult<()> {
        self.enter(Operation::Navigate, format!("navigate {}", url)).await?;
        if self.script.failing_urls.contains(url) {
            return Err(DriverError::new(
                DriverErrorKind::NavigationFailed,
                format!("net::ERR_CONNECTION_REFUSED at {}", url),
            ));
        }
        self.current_url = url.to_string();
        self.lookups.clear();
        Ok(())
    }

    async fn locate(&mut self, selector: &str) -> DriverResult<ElementHandle> {
        self.enter(Operation::Locate, format!("locate {}", selector)).await?;
        if self.lookup(selector).is_none() {
            return Err(DriverError::element_not_found(selector));
        }
        Ok(ElementHandle {
            id: format!("{}#{}", self.session_id, selector),
            selector: selector.to_string(),
        })
    }

    async fn interact(&mut self, handle: &ElementHandle, interaction: Interaction) -> DriverResult<Value> {
        self.enter(Operation::Interact, format!("interact {} {:?}", handle.selector, interaction))
            .await?;
        let element = self.script.elements.get_mut(&handle.selector).ok_or_else(|| {
            DriverError::new(DriverErrorKind::Detached, format!("{} is no longer attached", handle.selector))
        })?;

        match interaction {
            Interaction::Click | Interaction::Fill(_) if element.busy_for > 0 => {
                element.busy_for -= 1;
                Err(DriverError::new(
                    DriverErrorKind::NotInteractable,
                    format!("{} is covered by another element", handle.selector),
                ))
            }
            Interaction::Click => Ok(Value::Null),
            Interaction::Fill(value) => {
                element.value = element.fixed_value.clone().unwrap_or(value);
                Ok(Value::Text(element.value.clone()))
            }
            Interaction::ReadText => Ok(Value::Text(element.text.clone())),
            Interaction::ReadValue => Ok(Value::Text(element.value.clone())),
            Interaction::IsVisible => Ok(Value::Bool(element.visible)),
        }
    }

    async fn read_metric(&mut self, metric: MetricKind) -> DriverResult<Value> {
        self.enter(Operation::ReadMetric, format!("metric {}", metric.as_str())).await?;
        let queue = self.script.metrics.get_mut(&metric).ok_or_else(|| {
            DriverError::new(
                DriverErrorKind::Unsupported,
                format!("metric {} is not available", metric.as_str()),
            )
        })?;
        let sample = if queue.len() > 1 { queue.pop_front() } else { queue.front().copied() };
        sample.map(Value::Number).ok_or_else(|| {
            DriverError::new(DriverErrorKind::Unsupported, format!("no samples for {}", metric.as_str()))
        })
    }

    async fn wait_for(&mut self, condition: &WaitCondition, timeout: Duration) -> DriverResult<WaitStatus> {
        self.enter(Operation::WaitFor, format!("wait {}", condition)).await?;
        let deadline = Instant::now() + timeout;
        loop {
            if self.condition_holds(condition) {
                return Ok(WaitStatus::Satisfied);
            }
            if Instant::now() >= deadline {
                return Ok(WaitStatus::TimedOut);
            }
            sleep(POLL_INTERVAL).await;
        }
    }

    async fn release(&mut self) -> DriverResult<()> {
        self.enter(Operation::Release, "release".to_string()).await?;
        let mut log = self.log.lock();
        log.released = true;
        log.release_count += 1;
        Ok(())
    }
}

/// Hands out independent [`ScriptedDriver`] sessions over one script.
pub struct ScriptedDriverFactory {
    script: PageScript,
    next_id: AtomicUsize,
    sessions: Mutex<Vec<Arc<Mutex<SessionLog>>>>,
    refuse_sessions: bool,
}

impl ScriptedDriverFactory {
    pub fn new(script: PageScript) -> Self {
        Self {
            script,
            next_id: AtomicUsize::new(0),
            sessions: Mutex::new(Vec::new()),
            refuse_sessions: false,
        }
    }

    /// A factory whose sessions can never be opened
    pub fn unavailable() -> Self {
        Self {
            refuse_sessions: true,
            ..Self::new(PageScript::default())
        }
    }

    /// Snapshot of every session opened so far, in opening order
    pub fn sessions(&self) -> Vec<SessionLog> {
        self.sessions.lock().iter().map(|log| log.lock().clone()).collect()
    }
}

#[async_trait]
impl DriverFactory for ScriptedDriverFactory {
    async fn open_session(&self) -> DriverResult<Box<dyn Driver>> {
        if self.refuse_sessions {
            return Err(DriverError::new(
                DriverErrorKind::SessionClosed,
                "browser could not be launched",
            ));
        }
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let log = Arc::new(Mutex::new(SessionLog::default()));
        self.sessions.lock().push(Arc::clone(&log));
        Ok(Box::new(ScriptedDriver::with_log(
            format!("scripted-{}", id),
            self.script.clone(),
            log,
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_element_appears_after_lookups() {
        let script = PageScript::new().element("#late", SimulatedElement::new("hi").appears_after(2));
        let mut driver = ScriptedDriver::new(script);
        assert!(driver.locate("#late").await.is_err());
        assert!(driver.locate("#late").await.is_err());
        assert!(driver.locate("#late").await.is_ok());
    }

    #[tokio::test]
    async fn test_fill_reads_back_value() {
        let script = PageScript::new()
            .element("#name", SimulatedElement::new(""))
            .element("#short", SimulatedElement::new("").rejecting_input("ab"));
        let mut driver = ScriptedDriver::new(script);
        let h = driver.locate("#name").await.unwrap();
        assert_eq!(
            driver.interact(&h, Interaction::Fill("student".into())).await.unwrap(),
            Value::Text("student".into())
        );
        let h = driver.locate("#short").await.unwrap();
        assert_eq!(
            driver.interact(&h, Interaction::Fill("abcdef".into())).await.unwrap(),
            Value::Text("ab".into())
        );
    }

    #[tokio::test]
    async fn test_metric_queue_repeats_last() {
        let script = PageScript::new().metric(MetricKind::PageLoadMs, [10.0, 20.0]);
        let mut driver = ScriptedDriver::new(script);
        assert_eq!(driver.read_metric(MetricKind::PageLoadMs).await.unwrap(), Value::Number(10.0));
        assert_eq!(driver.read_metric(MetricKind::PageLoadMs).await.unwrap(), Value::Number(20.0));
        assert_eq!(driver.read_metric(MetricKind::PageLoadMs).await.unwrap(), Value::Number(20.0));
        let err = driver.read_metric(MetricKind::ConsoleErrors).await.unwrap_err();
        assert_eq!(err.kind, DriverErrorKind::Unsupported);
    }

    #[tokio::test]
    async fn test_wait_for_times_out() {
        let mut driver = ScriptedDriver::new(PageScript::new());
        let status = driver
            .wait_for(&WaitCondition::Visible("#never".into()), Duration::from_millis(30))
            .await
            .unwrap();
        assert_eq!(status, WaitStatus::TimedOut);
    }

    #[tokio::test]
    async fn test_operations_after_release_fail() {
        let mut driver = ScriptedDriver::new(PageScript::new());
        driver.release().await.unwrap();
        let err = driver.navigate("/").await.unwrap_err();
        assert_eq!(err.kind, DriverErrorKind::SessionClosed);
        let log = driver.log();
        assert!(log.lock().released);
        assert_eq!(log.lock().operations, vec!["release", "navigate /"]);
    }

    #[tokio::test]
    async fn test_factory_opens_independent_sessions() {
        let factory = ScriptedDriverFactory::new(PageScript::new());
        let mut a = factory.open_session().await.unwrap();
        let b = factory.open_session().await.unwrap();
        assert_ne!(a.session_id(), b.session_id());
        a.navigate("/a").await.unwrap();
        let sessions = factory.sessions();
        assert_eq!(sessions.len(), 2);
        assert_eq!(sessions[0].operations, vec!["navigate /a"]);
        assert!(sessions[1].operations.is_empty());
    }
}
