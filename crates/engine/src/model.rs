//! Typed in-memory scenario model
//!
//! Values of these types are only produced by the parser, which guarantees
//! every invariant checked by [`Scenario::validate`].

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{DriverErrorKind, ParseError};

/// ISO/IEC 25010 top-level quality characteristic
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Characteristic {
    Functionality,
    Reliability,
    Performance,
    Security,
    Usability,
    Maintainability,
    Portability,
}

impl Characteristic {
    pub const ALL: [Characteristic; 7] = [
        Characteristic::Functionality,
        Characteristic::Reliability,
        Characteristic::Performance,
        Characteristic::Security,
        Characteristic::Usability,
        Characteristic::Maintainability,
        Characteristic::Portability,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Characteristic::Functionality => "functionality",
            Characteristic::Reliability => "reliability",
            Characteristic::Performance => "performance",
            Characteristic::Security => "security",
            Characteristic::Usability => "usability",
            Characteristic::Maintainability => "maintainability",
            Characteristic::Portability => "portability",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|c| c.as_str() == s)
    }
}

impl fmt::Display for Characteristic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What the runner does after a step does not succeed
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum FailurePolicy {
    #[default]
    #[serde(rename = "abort")]
    AbortOnFirstFailure,
    #[serde(rename = "continue")]
    ContinueAndRecord,
}

/// A parsed routine
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Scenario {
    pub id: String,
    pub characteristic: Characteristic,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub tags: Vec<String>,
    pub failure_policy: FailurePolicy,
    pub steps: Vec<Step>,
}

impl Scenario {
    /// Check the structural invariants of a scenario.
    pub fn validate(&self) -> Result<(), ParseError> {
        if self.id.trim().is_empty() {
            return Err(ParseError::invalid("id", "must not be empty"));
        }
        if self.steps.is_empty() {
            return Err(ParseError::invalid("steps", "a scenario needs at least one step"));
        }
        for (i, step) in self.steps.iter().enumerate() {
            if step.index != i + 1 {
                return Err(ParseError::invalid(
                    format!("steps[{}]", i),
                    format!("out of sequence index {}", step.index),
                ));
            }
            if step.timeout.is_zero() {
                return Err(ParseError::invalid(
                    format!("steps[{}].timeoutMs", i),
                    "must be greater than zero",
                ));
            }
        }
        Ok(())
    }

    pub fn has_tag(&self, tag: &str) -> bool {
        self.tags.iter().any(|t| t == tag)
    }
}

/// One step of a scenario
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Step {
    /// 1-based position in the scenario
    pub index: usize,
    #[serde(default)]
    pub name: Option<String>,
    pub action: Action,
    #[serde(with = "duration_ms")]
    pub timeout: Duration,
    pub retry: RetryPolicy,
    #[serde(default)]
    pub assertions: Vec<Assertion>,
}

impl Step {
    /// Short human-readable label used in logs and verdicts
    pub fn label(&self) -> String {
        if let Some(name) = &self.name {
            return name.clone();
        }
        match &self.action {
            Action::Navigate { url } => format!("navigate:{}", url),
            Action::Click { selector } => format!("click:{}", selector),
            Action::Fill { selector, .. } => format!("fill:{}", selector),
            Action::WaitFor { condition } => format!("wait-for:{}", condition),
            Action::ReadMetric { metric, .. } => format!("read-metric:{}", metric.as_str()),
            Action::Assert { probe } => format!("assert:{}", probe),
        }
    }
}

/// Per-step retry configuration for transient driver failures
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub retry_on: Vec<DriverErrorKind>,
}

impl RetryPolicy {
    pub fn allows(&self, kind: DriverErrorKind) -> bool {
        self.retry_on.contains(&kind)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 0,
            retry_on: DriverErrorKind::DEFAULT_RETRYABLE.to_vec(),
        }
    }
}

/// The closed set of action kinds a step may use
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ActionKind {
    Navigate,
    Click,
    Fill,
    WaitFor,
    ReadMetric,
    Assert,
}

impl ActionKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ActionKind::Navigate => "navigate",
            ActionKind::Click => "click",
            ActionKind::Fill => "fill",
            ActionKind::WaitFor => "wait-for",
            ActionKind::ReadMetric => "read-metric",
            ActionKind::Assert => "assert",
        }
    }

    /// Accepts the kebab-case name and its camelCase spelling.
    pub fn parse(s: &str) -> Option<Self> {
        let kind = match s {
            "navigate" => ActionKind::Navigate,
            "click" => ActionKind::Click,
            "fill" => ActionKind::Fill,
            "wait-for" | "waitFor" => ActionKind::WaitFor,
            "read-metric" | "readMetric" => ActionKind::ReadMetric,
            "assert" => ActionKind::Assert,
            _ => return None,
        };
        Some(kind)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum Action {
    Navigate { url: String },
    Click { selector: String },
    Fill { selector: String, value: String },
    WaitFor { condition: WaitCondition },
    ReadMetric {
        metric: MetricKind,
        samples: u32,
        statistic: Statistic,
    },
    Assert { probe: Probe },
}

impl Action {
    pub fn kind(&self) -> ActionKind {
        match self {
            Action::Navigate { .. } => ActionKind::Navigate,
            Action::Click { .. } => ActionKind::Click,
            Action::Fill { .. } => ActionKind::Fill,
            Action::WaitFor { .. } => ActionKind::WaitFor,
            Action::ReadMetric { .. } => ActionKind::ReadMetric,
            Action::Assert { .. } => ActionKind::Assert,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum WaitCondition {
    Visible(String),
    Hidden(String),
    TextContains { selector: String, text: String },
    UrlContains(String),
}

impl fmt::Display for WaitCondition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WaitCondition::Visible(s) => write!(f, "visible({})", s),
            WaitCondition::Hidden(s) => write!(f, "hidden({})", s),
            WaitCondition::TextContains { selector, text } => {
                write!(f, "text({}) contains '{}'", selector, text)
            }
            WaitCondition::UrlContains(text) => write!(f, "url contains '{}'", text),
        }
    }
}

/// Where an `assert` step takes its observed value from
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Probe {
    Text(String),
    Value(String),
    Visible(String),
    Metric(MetricKind),
}

impl fmt::Display for Probe {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Probe::Text(s) => write!(f, "text({})", s),
            Probe::Value(s) => write!(f, "value({})", s),
            Probe::Visible(s) => write!(f, "visible({})", s),
            Probe::Metric(m) => write!(f, "metric({})", m.as_str()),
        }
    }
}

/// Page and network measurements a driver can report
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum MetricKind {
    PageLoadMs,
    DomContentLoadedMs,
    FirstContentfulPaintMs,
    ResponseTimeMs,
    TransferBytes,
    ResourceCount,
    ConsoleErrors,
}

impl MetricKind {
    pub const ALL: [MetricKind; 7] = [
        MetricKind::PageLoadMs,
        MetricKind::DomContentLoadedMs,
        MetricKind::FirstContentfulPaintMs,
        MetricKind::ResponseTimeMs,
        MetricKind::TransferBytes,
        MetricKind::ResourceCount,
        MetricKind::ConsoleErrors,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            MetricKind::PageLoadMs => "pageLoadMs",
            MetricKind::DomContentLoadedMs => "domContentLoadedMs",
            MetricKind::FirstContentfulPaintMs => "firstContentfulPaintMs",
            MetricKind::ResponseTimeMs => "responseTimeMs",
            MetricKind::TransferBytes => "transferBytes",
            MetricKind::ResourceCount => "resourceCount",
            MetricKind::ConsoleErrors => "consoleErrors",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|m| m.as_str() == s)
    }
}

/// Summary statistic applied to repeated metric samples
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Statistic {
    #[default]
    Mean,
    Median,
    Min,
    Max,
    P90,
    P95,
    P99,
}

impl Statistic {
    pub fn parse(s: &str) -> Option<Self> {
        let stat = match s {
            "mean" | "avg" => Statistic::Mean,
            "median" => Statistic::Median,
            "min" => Statistic::Min,
            "max" => Statistic::Max,
            "p90" => Statistic::P90,
            "p95" => Statistic::P95,
            "p99" => Statistic::P99,
            _ => return None,
        };
        Some(stat)
    }
}

/// A value observed from the application or declared in a routine
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Value {
    Null,
    Bool(bool),
    Number(f64),
    Text(String),
}

impl Value {
    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Null => "null",
            Value::Bool(_) => "bool",
            Value::Number(_) => "number",
            Value::Text(_) => "text",
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => f.write_str("null"),
            Value::Bool(b) => write!(f, "{}", b),
            Value::Number(n) => write!(f, "{}", n),
            Value::Text(s) => write!(f, "'{}'", s),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Assertion {
    #[serde(default)]
    pub label: Option<String>,
    pub comparison: Comparison,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Comparison {
    Equals(Value),
    NotEquals(Value),
    Contains(String),
    NotContains(String),
    Threshold { op: ThresholdOp, bound: f64 },
    Predicate(Predicate),
}

impl Comparison {
    /// Operator name as written in routine documents
    pub fn operator(&self) -> &'static str {
        match self {
            Comparison::Equals(_) => "equals",
            Comparison::NotEquals(_) => "notEquals",
            Comparison::Contains(_) => "contains",
            Comparison::NotContains(_) => "notContains",
            Comparison::Threshold { op, .. } => op.as_str(),
            Comparison::Predicate(p) => p.as_str(),
        }
    }

    /// The declared expected value, `Null` for predicates
    pub fn expected(&self) -> Value {
        match self {
            Comparison::Equals(v) | Comparison::NotEquals(v) => v.clone(),
            Comparison::Contains(s) | Comparison::NotContains(s) => Value::Text(s.clone()),
            Comparison::Threshold { bound, .. } => Value::Number(*bound),
            Comparison::Predicate(_) => Value::Null,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ThresholdOp {
    Gt,
    Gte,
    Lt,
    Lte,
}

impl ThresholdOp {
    pub fn as_str(&self) -> &'static str {
        match self {
            ThresholdOp::Gt => "gt",
            ThresholdOp::Gte => "gte",
            ThresholdOp::Lt => "lt",
            ThresholdOp::Lte => "lte",
        }
    }

    pub fn holds(&self, observed: f64, bound: f64) -> bool {
        match self {
            ThresholdOp::Gt => observed > bound,
            ThresholdOp::Gte => observed >= bound,
            ThresholdOp::Lt => observed < bound,
            ThresholdOp::Lte => observed <= bound,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Predicate {
    IsTrue,
    IsFalse,
    IsEmpty,
    IsNotEmpty,
}

impl Predicate {
    pub fn as_str(&self) -> &'static str {
        match self {
            Predicate::IsTrue => "isTrue",
            Predicate::IsFalse => "isFalse",
            Predicate::IsEmpty => "isEmpty",
            Predicate::IsNotEmpty => "isNotEmpty",
        }
    }
}

mod duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        u64::deserialize(d).map(Duration::from_millis)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn step(index: usize) -> Step {
        Step {
            index,
            name: None,
            action: Action::Navigate { url: "/".to_string() },
            timeout: Duration::from_millis(1000),
            retry: RetryPolicy::default(),
            assertions: vec![],
        }
    }

    #[test]
    fn test_characteristic_parse() {
        assert_eq!(Characteristic::parse("usability"), Some(Characteristic::Usability));
        assert_eq!(Characteristic::parse("Usability"), None);
        assert_eq!(Characteristic::parse("compatibility"), None);
    }

    #[test]
    fn test_validate_rejects_empty_steps() {
        let scenario = Scenario {
            id: "login".to_string(),
            characteristic: Characteristic::Security,
            description: String::new(),
            tags: vec![],
            failure_policy: FailurePolicy::AbortOnFirstFailure,
            steps: vec![],
        };
        assert!(matches!(
            scenario.validate(),
            Err(ParseError::InvalidField { field, .. }) if field == "steps"
        ));
    }

    #[test]
    fn test_validate_checks_step_sequence() {
        let scenario = Scenario {
            id: "login".to_string(),
            characteristic: Characteristic::Security,
            description: String::new(),
            tags: vec![],
            failure_policy: FailurePolicy::AbortOnFirstFailure,
            steps: vec![step(1), step(3)],
        };
        assert!(scenario.validate().is_err());
    }

    #[test]
    fn test_step_label_prefers_name() {
        let mut s = step(1);
        assert_eq!(s.label(), "navigate:/");
        s.name = Some("open home".to_string());
        assert_eq!(s.label(), "open home");
    }

    #[test]
    fn test_threshold_ops() {
        assert!(ThresholdOp::Gt.holds(2.0, 1.0));
        assert!(!ThresholdOp::Gt.holds(1.0, 1.0));
        assert!(ThresholdOp::Gte.holds(1.0, 1.0));
        assert!(ThresholdOp::Lte.holds(1.0, 1.0));
        assert!(!ThresholdOp::Lt.holds(1.0, 1.0));
    }
}
