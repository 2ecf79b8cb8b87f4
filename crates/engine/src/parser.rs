//! Declarative routine documents → [`Scenario`]
//!
//! Parsing is strict and all-or-nothing per routine: unknown fields, unknown
//! action kinds and unresolvable references reject the whole routine. The
//! only I/O in this module is [`load_routines`] / [`RoutineSource::from_file`],
//! which read documents from disk before parsing.

use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value as JsonValue};
use tracing::{debug, warn};

use crate::error::{DriverErrorKind, EngineResult, ParseError};
use crate::model::{
    Action, ActionKind, Assertion, Characteristic, Comparison, FailurePolicy, MetricKind,
    Predicate, Probe, RetryPolicy, Scenario, Statistic, Step, ThresholdOp, Value,
    WaitCondition,
};

/// Encoding of a routine document
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DocumentFormat {
    Json,
    Yaml,
}

impl DocumentFormat {
    /// Pick the format from a file extension
    pub fn from_path(path: &Path) -> Option<Self> {
        match path.extension()?.to_str()? {
            "json" => Some(DocumentFormat::Json),
            "yaml" | "yml" => Some(DocumentFormat::Yaml),
            _ => None,
        }
    }
}

/// A routine document awaiting parsing
#[derive(Debug, Clone)]
pub struct RoutineSource {
    /// Where the document came from (file path or caller-chosen name)
    pub origin: String,
    pub format: DocumentFormat,
    pub text: String,
}

impl RoutineSource {
    pub fn new(origin: impl Into<String>, format: DocumentFormat, text: impl Into<String>) -> Self {
        Self {
            origin: origin.into(),
            format,
            text: text.into(),
        }
    }

    /// Read a routine file; the format follows the extension, defaulting to JSON.
    pub fn from_file(path: &Path) -> EngineResult<Self> {
        let text = std::fs::read_to_string(path)?;
        let format = DocumentFormat::from_path(path).unwrap_or(DocumentFormat::Json);
        Ok(Self::new(path.display().to_string(), format, text))
    }
}

/// Load every `.json`, `.yaml` and `.yml` document under `dir`, sorted by path.
pub fn load_routines(dir: &Path) -> EngineResult<Vec<RoutineSource>> {
    let mut paths: Vec<PathBuf> = walkdir::WalkDir::new(dir)
        .into_iter()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_file())
        .map(|e| e.into_path())
        .filter(|p| DocumentFormat::from_path(p).is_some())
        .collect();
    paths.sort();

    let mut sources = Vec::with_capacity(paths.len());
    for path in paths {
        debug!("Loading routine document {}", path.display());
        sources.push(RoutineSource::from_file(&path)?);
    }
    Ok(sources)
}

/// A routine that failed to parse
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RejectedRoutine {
    pub origin: String,
    /// Declared id, when one could be read
    pub id: Option<String>,
    pub error: ParseError,
}

/// Result of parsing a batch of documents
#[derive(Debug, Clone, Default)]
pub struct ParsedBatch {
    pub scenarios: Vec<Scenario>,
    pub rejected: Vec<RejectedRoutine>,
}

/// Parser settings
#[derive(Debug, Clone)]
pub struct ParseOptions {
    /// Timeout for steps that do not declare `timeoutMs`
    pub default_timeout: Duration,
}

impl Default for ParseOptions {
    fn default() -> Self {
        Self {
            default_timeout: Duration::from_millis(5000),
        }
    }
}

/// Parse a single-routine document with default options
pub fn parse(document: &str, format: DocumentFormat) -> Result<Scenario, ParseError> {
    RoutineParser::default().parse(document, format)
}

#[derive(Debug, Clone, Default)]
pub struct RoutineParser {
    options: ParseOptions,
}

impl RoutineParser {
    pub fn new(options: ParseOptions) -> Self {
        Self { options }
    }

    /// Parse a document holding exactly one routine.
    pub fn parse(&self, document: &str, format: DocumentFormat) -> Result<Scenario, ParseError> {
        let root = decode(document, format)?;
        if root.contains_key("routines") {
            return Err(ParseError::MalformedDocument(
                "expected a single routine, found a batch document".to_string(),
            ));
        }
        self.parse_routine(JsonValue::Object(root), &Shared::default())
    }

    /// Parse many documents. Invalid routines are rejected individually and a
    /// repeated id rejects every occurrence after the first.
    pub fn parse_batch(&self, sources: &[RoutineSource]) -> ParsedBatch {
        let mut batch = ParsedBatch::default();
        let mut seen = HashSet::new();

        for source in sources {
            for (id, result) in self.parse_source(source) {
                let outcome = result.and_then(|scenario| {
                    if seen.insert(scenario.id.clone()) {
                        Ok(scenario)
                    } else {
                        Err(ParseError::DuplicateIdentifier(scenario.id))
                    }
                });
                match outcome {
                    Ok(scenario) => batch.scenarios.push(scenario),
                    Err(error) => {
                        warn!("Rejected routine {} ({}): {}", id.as_deref().unwrap_or("?"), source.origin, error);
                        batch.rejected.push(RejectedRoutine {
                            origin: source.origin.clone(),
                            id,
                            error,
                        });
                    }
                }
            }
        }

        debug!(
            "Parsed {} routine(s), rejected {}",
            batch.scenarios.len(),
            batch.rejected.len()
        );
        batch
    }

    fn parse_source(&self, source: &RoutineSource) -> Vec<(Option<String>, Result<Scenario, ParseError>)> {
        let mut root = match decode(&source.text, source.format) {
            Ok(root) => root,
            Err(e) => return vec![(None, Err(e))],
        };

        let Some(routines) = root.remove("routines") else {
            let id = declared_id(&root);
            return vec![(id, self.parse_routine(JsonValue::Object(root), &Shared::default()))];
        };

        let shared = match Shared::from_batch(root) {
            Ok(shared) => shared,
            Err(e) => return vec![(None, Err(e))],
        };
        let JsonValue::Array(routines) = routines else {
            return vec![(
                None,
                Err(ParseError::invalid("routines", "must be a list of routines")),
            )];
        };

        routines
            .into_iter()
            .map(|raw| {
                let id = raw.as_object().and_then(declared_id);
                (id, self.parse_routine(raw, &shared))
            })
            .collect()
    }

    fn parse_routine(&self, raw: JsonValue, shared: &Shared) -> Result<Scenario, ParseError> {
        let raw: RawRoutine = serde_json::from_value(raw)
            .map_err(|e| ParseError::MalformedDocument(e.to_string()))?;

        let id = raw.id.ok_or_else(|| ParseError::MissingField("id".to_string()))?;
        if id.trim().is_empty() {
            return Err(ParseError::invalid("id", "must not be empty"));
        }

        let characteristic = match raw.characteristic {
            None | Some(JsonValue::Null) => {
                return Err(ParseError::MissingField("characteristic".to_string()))
            }
            Some(JsonValue::String(s)) => Characteristic::parse(&s)
                .ok_or(ParseError::UnknownCharacteristic(s))?,
            Some(JsonValue::Array(_)) => {
                return Err(ParseError::invalid(
                    "characteristic",
                    "a scenario declares exactly one characteristic",
                ))
            }
            Some(other) => return Err(ParseError::UnknownCharacteristic(other.to_string())),
        };

        let failure_policy = match raw.failure_policy.as_deref() {
            None => FailurePolicy::default(),
            Some("abort") | Some("abort-on-first-failure") => FailurePolicy::AbortOnFirstFailure,
            Some("continue") | Some("continue-and-record") => FailurePolicy::ContinueAndRecord,
            Some(other) => {
                return Err(ParseError::invalid(
                    "failurePolicy",
                    format!("expected 'abort' or 'continue', got '{}'", other),
                ))
            }
        };

        let mut selectors = shared.selectors.clone();
        selectors.extend(raw.selectors);
        let mut fixtures = shared.fixtures.clone();
        fixtures.extend(raw.fixtures);
        let resolver = Resolver {
            selectors,
            fixtures,
            base_url: raw.base_url,
        };

        let raw_steps = raw.steps.ok_or_else(|| ParseError::MissingField("steps".to_string()))?;
        let steps = raw_steps
            .into_iter()
            .enumerate()
            .map(|(i, step)| self.parse_step(i, step, &resolver))
            .collect::<Result<Vec<_>, _>>()?;

        let scenario = Scenario {
            id,
            characteristic,
            description: raw.description.unwrap_or_default(),
            tags: raw.tags.unwrap_or_default(),
            failure_policy,
            steps,
        };
        scenario.validate()?;
        Ok(scenario)
    }

    fn parse_step(&self, i: usize, raw: RawStep, resolver: &Resolver) -> Result<Step, ParseError> {
        let path = format!("steps[{}]", i);
        let kind_name = raw
            .action
            .ok_or_else(|| ParseError::MissingField(format!("{}.action", path)))?;
        let kind = ActionKind::parse(&kind_name).ok_or(ParseError::UnknownActionKind(kind_name))?;

        let mut params = Params::new(raw.params, format!("{}.params", path));
        let action = match kind {
            ActionKind::Navigate => {
                let url = resolver.text(&params.path("url"), &params.required_str("url")?)?;
                Action::Navigate {
                    url: resolver.join_url(url),
                }
            }
            ActionKind::Click => Action::Click {
                selector: resolver.selector(&params.path("selector"), &params.required_str("selector")?)?,
            },
            ActionKind::Fill => Action::Fill {
                selector: resolver.selector(&params.path("selector"), &params.required_str("selector")?)?,
                value: resolver.text(&params.path("value"), &params.required_str("value")?)?,
            },
            ActionKind::WaitFor => Action::WaitFor {
                condition: parse_wait_condition(&mut params, resolver)?,
            },
            ActionKind::ReadMetric => {
                let metric = parse_metric(&params.path("metric"), &params.required_str("metric")?)?;
                let samples = params.optional_u64("samples")?.unwrap_or(1);
                if samples == 0 || samples > u64::from(u32::MAX) {
                    return Err(ParseError::invalid(params.path("samples"), "must be at least 1"));
                }
                let statistic = match params.optional_str("statistic")? {
                    None => Statistic::default(),
                    Some(s) => Statistic::parse(&s).ok_or_else(|| {
                        ParseError::invalid(params.path("statistic"), format!("unknown statistic '{}'", s))
                    })?,
                };
                Action::ReadMetric {
                    metric,
                    samples: samples as u32,
                    statistic,
                }
            }
            ActionKind::Assert => Action::Assert {
                probe: parse_probe(&mut params, resolver)?,
            },
        };
        params.finish()?;

        let timeout = match raw.timeout_ms {
            Some(0) => {
                return Err(ParseError::invalid(
                    format!("{}.timeoutMs", path),
                    "must be greater than zero",
                ))
            }
            Some(ms) => Duration::from_millis(ms),
            None => self.options.default_timeout,
        };

        let retry_on = match raw.retry_on {
            None => DriverErrorKind::DEFAULT_RETRYABLE.to_vec(),
            Some(names) => names
                .iter()
                .map(|n| {
                    DriverErrorKind::parse(n).ok_or_else(|| {
                        ParseError::invalid(format!("{}.retryOn", path), format!("unknown driver error kind '{}'", n))
                    })
                })
                .collect::<Result<Vec<_>, _>>()?,
        };

        let observed = observed_type(&action);
        let assertions = raw
            .assertions
            .into_iter()
            .enumerate()
            .map(|(j, a)| parse_assertion(&format!("{}.assertions[{}]", path, j), a, observed, resolver))
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Step {
            index: i + 1,
            name: raw.name,
            action,
            timeout,
            retry: RetryPolicy {
                max_retries: raw.retries.unwrap_or(0),
                retry_on,
            },
            assertions,
        })
    }
}

fn decode(document: &str, format: DocumentFormat) -> Result<Map<String, JsonValue>, ParseError> {
    let value: JsonValue = match format {
        DocumentFormat::Json => serde_json::from_str(document)
            .map_err(|e| ParseError::MalformedDocument(e.to_string()))?,
        DocumentFormat::Yaml => serde_yaml::from_str(document)
            .map_err(|e| ParseError::MalformedDocument(e.to_string()))?,
    };
    match value {
        JsonValue::Object(map) => Ok(map),
        other => Err(ParseError::MalformedDocument(format!(
            "top level must be a mapping, found {}",
            json_type(&other)
        ))),
    }
}

fn declared_id(map: &Map<String, JsonValue>) -> Option<String> {
    map.get("id").and_then(JsonValue::as_str).map(String::from)
}

fn json_type(v: &JsonValue) -> &'static str {
    match v {
        JsonValue::Null => "null",
        JsonValue::Bool(_) => "bool",
        JsonValue::Number(_) => "number",
        JsonValue::String(_) => "string",
        JsonValue::Array(_) => "list",
        JsonValue::Object(_) => "mapping",
    }
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields, rename_all = "camelCase")]
struct RawRoutine {
    id: Option<String>,
    characteristic: Option<JsonValue>,
    failure_policy: Option<String>,
    description: Option<String>,
    tags: Option<Vec<String>>,
    base_url: Option<String>,
    #[serde(default)]
    selectors: BTreeMap<String, String>,
    #[serde(default)]
    fixtures: BTreeMap<String, String>,
    steps: Option<Vec<RawStep>>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields, rename_all = "camelCase")]
struct RawStep {
    action: Option<String>,
    name: Option<String>,
    #[serde(default)]
    params: Map<String, JsonValue>,
    timeout_ms: Option<u64>,
    retries: Option<u32>,
    retry_on: Option<Vec<String>>,
    #[serde(default)]
    assertions: Vec<RawAssertion>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawAssertion {
    op: Option<String>,
    expected: Option<JsonValue>,
    label: Option<String>,
}

/// Selectors and fixtures declared at batch level
#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct Shared {
    #[serde(default)]
    selectors: BTreeMap<String, String>,
    #[serde(default)]
    fixtures: BTreeMap<String, String>,
}

impl Shared {
    fn from_batch(rest: Map<String, JsonValue>) -> Result<Self, ParseError> {
        serde_json::from_value(JsonValue::Object(rest))
            .map_err(|e| ParseError::MalformedDocument(e.to_string()))
    }
}

/// Name lookup for `@selector` and `${fixture}` references. Routine-level
/// entries shadow batch-level ones.
struct Resolver {
    selectors: BTreeMap<String, String>,
    fixtures: BTreeMap<String, String>,
    base_url: Option<String>,
}

impl Resolver {
    fn selector(&self, field: &str, raw: &str) -> Result<String, ParseError> {
        match raw.strip_prefix('@') {
            Some(name) => self
                .selectors
                .get(name)
                .cloned()
                .ok_or_else(|| ParseError::UnresolvedReference(format!("@{}", name))),
            None => self.text(field, raw),
        }
    }

    fn text(&self, field: &str, raw: &str) -> Result<String, ParseError> {
        let mut out = String::with_capacity(raw.len());
        let mut rest = raw;
        while let Some(start) = rest.find("${") {
            out.push_str(&rest[..start]);
            let after = &rest[start + 2..];
            let end = after
                .find('}')
                .ok_or_else(|| ParseError::invalid(field, "unterminated '${' reference"))?;
            let name = &after[..end];
            let value = self
                .fixtures
                .get(name)
                .ok_or_else(|| ParseError::UnresolvedReference(format!("${{{}}}", name)))?;
            out.push_str(value);
            rest = &after[end + 1..];
        }
        out.push_str(rest);
        Ok(out)
    }

    fn join_url(&self, url: String) -> String {
        if url.starts_with("http://") || url.starts_with("https://") {
            return url;
        }
        match &self.base_url {
            Some(base) => format!(
                "{}/{}",
                base.trim_end_matches('/'),
                url.trim_start_matches('/')
            ),
            None => url,
        }
    }
}

/// Step parameters, consumed key by key; leftovers are rejected.
struct Params {
    map: Map<String, JsonValue>,
    path: String,
}

impl Params {
    fn new(map: Map<String, JsonValue>, path: String) -> Self {
        Self { map, path }
    }

    fn path(&self, key: &str) -> String {
        format!("{}.{}", self.path, key)
    }

    fn has(&self, key: &str) -> bool {
        self.map.contains_key(key)
    }

    fn required_str(&mut self, key: &str) -> Result<String, ParseError> {
        self.optional_str(key)?
            .ok_or_else(|| ParseError::MissingField(self.path(key)))
    }

    fn optional_str(&mut self, key: &str) -> Result<Option<String>, ParseError> {
        match self.map.remove(key) {
            None => Ok(None),
            Some(JsonValue::String(s)) => Ok(Some(s)),
            Some(other) => Err(ParseError::invalid(
                self.path(key),
                format!("expected a string, found {}", json_type(&other)),
            )),
        }
    }

    fn optional_u64(&mut self, key: &str) -> Result<Option<u64>, ParseError> {
        match self.map.remove(key) {
            None => Ok(None),
            Some(v) => v.as_u64().map(Some).ok_or_else(|| {
                ParseError::invalid(self.path(key), "expected a non-negative integer")
            }),
        }
    }

    fn required_object(&mut self, key: &str) -> Result<Params, ParseError> {
        match self.map.remove(key) {
            None => Err(ParseError::MissingField(self.path(key))),
            Some(JsonValue::Object(map)) => Ok(Params::new(map, self.path(key))),
            Some(other) => Err(ParseError::invalid(
                self.path(key),
                format!("expected a mapping, found {}", json_type(&other)),
            )),
        }
    }

    /// Exactly one of `keys` must be present.
    fn exactly_one_of(&self, keys: &[&'static str]) -> Result<&'static str, ParseError> {
        let present: Vec<&'static str> = keys.iter().copied().filter(|k| self.has(k)).collect();
        match present.as_slice() {
            [one] => Ok(*one),
            [] => Err(ParseError::MissingField(format!(
                "{}.({})",
                self.path,
                keys.join("|")
            ))),
            many => Err(ParseError::invalid(
                self.path.clone(),
                format!("only one of {} may be given", many.join(", ")),
            )),
        }
    }

    fn finish(self) -> Result<(), ParseError> {
        match self.map.keys().next() {
            None => Ok(()),
            Some(key) => Err(ParseError::MalformedDocument(format!(
                "unknown parameter '{}.{}'",
                self.path, key
            ))),
        }
    }
}

fn parse_wait_condition(params: &mut Params, resolver: &Resolver) -> Result<WaitCondition, ParseError> {
    let key = params.exactly_one_of(&["visible", "hidden", "textContains", "urlContains"])?;
    let field = params.path(key);
    let condition = match key {
        "visible" => WaitCondition::Visible(resolver.selector(&field, &params.required_str(key)?)?),
        "hidden" => WaitCondition::Hidden(resolver.selector(&field, &params.required_str(key)?)?),
        "textContains" => {
            let mut inner = params.required_object(key)?;
            let selector = resolver.selector(&inner.path("selector"), &inner.required_str("selector")?)?;
            let text = resolver.text(&inner.path("text"), &inner.required_str("text")?)?;
            inner.finish()?;
            WaitCondition::TextContains { selector, text }
        }
        _ => WaitCondition::UrlContains(resolver.text(&field, &params.required_str(key)?)?),
    };
    Ok(condition)
}

fn parse_probe(params: &mut Params, resolver: &Resolver) -> Result<Probe, ParseError> {
    let key = params.exactly_one_of(&["text", "value", "visible", "metric"])?;
    let field = params.path(key);
    let raw = params.required_str(key)?;
    let probe = match key {
        "text" => Probe::Text(resolver.selector(&field, &raw)?),
        "value" => Probe::Value(resolver.selector(&field, &raw)?),
        "visible" => Probe::Visible(resolver.selector(&field, &raw)?),
        _ => Probe::Metric(parse_metric(&field, &raw)?),
    };
    Ok(probe)
}

fn parse_metric(field: &str, raw: &str) -> Result<MetricKind, ParseError> {
    MetricKind::parse(raw)
        .ok_or_else(|| ParseError::invalid(field, format!("unknown metric '{}'", raw)))
}

/// Type of the value an action produces, known before execution
fn observed_type(action: &Action) -> &'static str {
    match action {
        Action::Navigate { .. } | Action::Fill { .. } => "text",
        Action::Click { .. } => "null",
        Action::WaitFor { .. } => "bool",
        Action::ReadMetric { .. } => "number",
        Action::Assert { probe } => match probe {
            Probe::Text(_) | Probe::Value(_) => "text",
            Probe::Visible(_) => "bool",
            Probe::Metric(_) => "number",
        },
    }
}

fn parse_assertion(
    path: &str,
    raw: RawAssertion,
    observed: &'static str,
    resolver: &Resolver,
) -> Result<Assertion, ParseError> {
    let op = raw
        .op
        .ok_or_else(|| ParseError::MissingField(format!("{}.op", path)))?;
    let incompatible = |reason: String| ParseError::IncompatibleAssertion {
        field: path.to_string(),
        operator: op.clone(),
        reason,
    };
    let expected = raw.expected;
    let expected_field = format!("{}.expected", path);

    let comparison = match op.as_str() {
        "equals" | "notEquals" => {
            let json = expected.ok_or_else(|| ParseError::MissingField(expected_field.clone()))?;
            let value = match json {
                JsonValue::Null => Value::Null,
                JsonValue::Bool(b) => Value::Bool(b),
                JsonValue::Number(n) => Value::Number(
                    n.as_f64()
                        .ok_or_else(|| incompatible("expected number is out of range".to_string()))?,
                ),
                JsonValue::String(s) => Value::Text(resolver.text(&expected_field, &s)?),
                other => {
                    return Err(incompatible(format!(
                        "cannot compare against a {}",
                        json_type(&other)
                    )))
                }
            };
            if value.type_name() != observed {
                return Err(incompatible(format!(
                    "expected value is {} but this step observes {}",
                    value.type_name(),
                    observed
                )));
            }
            if op == "equals" {
                Comparison::Equals(value)
            } else {
                Comparison::NotEquals(value)
            }
        }
        "contains" | "notContains" => {
            let text = match expected {
                Some(JsonValue::String(s)) => resolver.text(&expected_field, &s)?,
                Some(other) => {
                    return Err(incompatible(format!(
                        "requires a string expected value, found {}",
                        json_type(&other)
                    )))
                }
                None => return Err(ParseError::MissingField(expected_field)),
            };
            if observed != "text" {
                return Err(incompatible(format!("requires text but this step observes {}", observed)));
            }
            if op == "contains" {
                Comparison::Contains(text)
            } else {
                Comparison::NotContains(text)
            }
        }
        "gt" | "gte" | "lt" | "lte" => {
            let bound = match expected {
                Some(JsonValue::Number(n)) => n
                    .as_f64()
                    .ok_or_else(|| incompatible("threshold is out of range".to_string()))?,
                Some(other) => {
                    return Err(incompatible(format!(
                        "requires a numeric threshold, found {}",
                        json_type(&other)
                    )))
                }
                None => return Err(ParseError::MissingField(expected_field)),
            };
            if observed != "number" {
                return Err(incompatible(format!(
                    "requires a numeric observed value but this step observes {}",
                    observed
                )));
            }
            let op = match op.as_str() {
                "gt" => ThresholdOp::Gt,
                "gte" => ThresholdOp::Gte,
                "lt" => ThresholdOp::Lt,
                _ => ThresholdOp::Lte,
            };
            Comparison::Threshold { op, bound }
        }
        "isTrue" | "isFalse" | "isEmpty" | "isNotEmpty" => {
            if expected.is_some() {
                return Err(incompatible("takes no expected value".to_string()));
            }
            let (predicate, needs) = match op.as_str() {
                "isTrue" => (Predicate::IsTrue, "bool"),
                "isFalse" => (Predicate::IsFalse, "bool"),
                "isEmpty" => (Predicate::IsEmpty, "text"),
                _ => (Predicate::IsNotEmpty, "text"),
            };
            if observed != needs {
                return Err(incompatible(format!(
                    "requires {} but this step observes {}",
                    needs, observed
                )));
            }
            Comparison::Predicate(predicate)
        }
        _ => {
            return Err(ParseError::invalid(
                format!("{}.op", path),
                format!("unknown operator '{}'", op),
            ))
        }
    };

    Ok(Assertion {
        label: raw.label,
        comparison,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_case::test_case;

    const LOGIN: &str = r##"{
        "id": "login-flow",
        "characteristic": "functionality",
        "failurePolicy": "abort",
        "baseUrl": "http://lms.local",
        "selectors": { "user": "#username" },
        "fixtures": { "name": "student01" },
        "steps": [
            { "action": "navigate", "params": { "url": "/login" } },
            {
                "action": "fill",
                "params": { "selector": "@user", "value": "${name}" },
                "timeoutMs": 2000,
                "retries": 2,
                "assertions": [ { "op": "equals", "expected": "${name}" } ]
            },
            {
                "action": "assert",
                "params": { "metric": "pageLoadMs" },
                "assertions": [ { "op": "lt", "expected": 3000, "label": "fast load" } ]
            }
        ]
    }"##;

    #[test]
    fn test_parse_json_routine() {
        let scenario = parse(LOGIN, DocumentFormat::Json).unwrap();
        assert_eq!(scenario.id, "login-flow");
        assert_eq!(scenario.characteristic, Characteristic::Functionality);
        assert_eq!(scenario.steps.len(), 3);
        assert_eq!(
            scenario.steps[0].action,
            Action::Navigate { url: "http://lms.local/login".to_string() }
        );
        assert_eq!(
            scenario.steps[1].action,
            Action::Fill { selector: "#username".to_string(), value: "student01".to_string() }
        );
        assert_eq!(scenario.steps[1].timeout, Duration::from_millis(2000));
        assert_eq!(scenario.steps[1].retry.max_retries, 2);
        assert_eq!(
            scenario.steps[1].assertions[0].comparison,
            Comparison::Equals(Value::Text("student01".to_string()))
        );
        assert_eq!(scenario.steps[2].timeout, Duration::from_millis(5000));
    }

    #[test]
    fn test_parse_yaml_routine() {
        let yaml = r#"
id: course-search
characteristic: usability
failurePolicy: continue
steps:
  - action: wait-for
    params:
      textContains:
        selector: .results
        text: Algebra
    timeoutMs: 100
  - action: readMetric
    params:
      metric: responseTimeMs
      samples: 5
      statistic: p95
"#;
        let scenario = parse(yaml, DocumentFormat::Yaml).unwrap();
        assert_eq!(scenario.failure_policy, FailurePolicy::ContinueAndRecord);
        assert_eq!(
            scenario.steps[1].action,
            Action::ReadMetric {
                metric: MetricKind::ResponseTimeMs,
                samples: 5,
                statistic: Statistic::P95,
            }
        );
    }

    #[test]
    fn test_reparse_is_structurally_equal() {
        let a = parse(LOGIN, DocumentFormat::Json).unwrap();
        let b = parse(LOGIN, DocumentFormat::Json).unwrap();
        assert_eq!(a, b);
    }

    #[test_case(r#"{"characteristic":"security","steps":[{"action":"click","params":{"selector":"a"}}]}"#,
        ParseError::MissingField("id".into()); "missing id")]
    #[test_case(r#"{"id":"x","steps":[{"action":"click","params":{"selector":"a"}}]}"#,
        ParseError::MissingField("characteristic".into()); "missing characteristic")]
    #[test_case(r#"{"id":"x","characteristic":"compatibility","steps":[]}"#,
        ParseError::UnknownCharacteristic("compatibility".into()); "unknown characteristic")]
    #[test_case(r#"{"id":"x","characteristic":"security","steps":[{"action":"hover","params":{}}]}"#,
        ParseError::UnknownActionKind("hover".into()); "unknown action")]
    #[test_case(r#"{"id":"x","characteristic":"security","steps":[{"action":"click","params":{"selector":"@nope"}}]}"#,
        ParseError::UnresolvedReference("@nope".into()); "unresolved selector")]
    #[test_case(r#"{"id":"x","characteristic":"security","steps":[{"action":"fill","params":{"selector":"a","value":"${pw}"}}]}"#,
        ParseError::UnresolvedReference("${pw}".into()); "unresolved fixture")]
    #[test_case(r#"{"id":"x","characteristic":"security","steps":[{"params":{}}]}"#,
        ParseError::MissingField("steps[0].action".into()); "missing action")]
    #[test_case(r#"{"id":"x","characteristic":"security","steps":[{"action":"navigate","params":{}}]}"#,
        ParseError::MissingField("steps[0].params.url".into()); "missing param")]
    fn test_parse_errors(doc: &str, expected: ParseError) {
        assert_eq!(parse(doc, DocumentFormat::Json).unwrap_err(), expected);
    }

    #[test]
    fn test_unknown_fields_are_rejected() {
        let doc = r#"{"id":"x","characteristic":"security","retry":3,"steps":[{"action":"click","params":{"selector":"a"}}]}"#;
        assert!(matches!(parse(doc, DocumentFormat::Json), Err(ParseError::MalformedDocument(_))));

        let doc = r#"{"id":"x","characteristic":"security","steps":[{"action":"click","params":{"selector":"a","force":true}}]}"#;
        assert!(matches!(parse(doc, DocumentFormat::Json), Err(ParseError::MalformedDocument(_))));
    }

    #[test]
    fn test_not_a_mapping_is_malformed() {
        assert!(matches!(parse("[1,2]", DocumentFormat::Json), Err(ParseError::MalformedDocument(_))));
        assert!(matches!(parse("{not json", DocumentFormat::Json), Err(ParseError::MalformedDocument(_))));
    }

    #[test_case("navigate", r#"{"url":"/"}"#, r#"{"op":"gt","expected":1}"#; "threshold on text")]
    #[test_case("read-metric", r#"{"metric":"pageLoadMs"}"#, r#"{"op":"gt","expected":"fast"}"#; "threshold with text bound")]
    #[test_case("read-metric", r#"{"metric":"pageLoadMs"}"#, r#"{"op":"contains","expected":"x"}"#; "contains on number")]
    #[test_case("assert", r##"{"visible":"#menu"}"##, r#"{"op":"isTrue","expected":true}"#; "predicate with expected")]
    #[test_case("assert", r#"{"text":"h1"}"#, r#"{"op":"equals","expected":3}"#; "equals type mismatch")]
    fn test_incompatible_assertions(action: &str, params: &str, assertion: &str) {
        let doc = format!(
            r#"{{"id":"x","characteristic":"performance","steps":[{{"action":"{}","params":{},"assertions":[{}]}}]}}"#,
            action, params, assertion
        );
        assert!(matches!(
            parse(&doc, DocumentFormat::Json),
            Err(ParseError::IncompatibleAssertion { .. })
        ));
    }

    #[test]
    fn test_zero_timeout_rejected() {
        let doc = r#"{"id":"x","characteristic":"security","steps":[{"action":"click","params":{"selector":"a"},"timeoutMs":0}]}"#;
        assert!(matches!(parse(doc, DocumentFormat::Json), Err(ParseError::InvalidField { .. })));
    }

    #[test]
    fn test_retry_on_is_configurable() {
        let doc = r#"{"id":"x","characteristic":"reliability","steps":[
            {"action":"click","params":{"selector":"a"},"retries":3,"retryOn":["detached"]}]}"#;
        let scenario = parse(doc, DocumentFormat::Json).unwrap();
        let retry = &scenario.steps[0].retry;
        assert_eq!(retry.max_retries, 3);
        assert!(retry.allows(DriverErrorKind::Detached));
        assert!(!retry.allows(DriverErrorKind::ElementNotFound));
    }

    #[test]
    fn test_batch_shares_selectors_and_rejects_duplicates() {
        let batch_doc = r##"{
            "selectors": { "search": "#q" },
            "routines": [
                { "id": "a", "characteristic": "usability",
                  "steps": [ { "action": "click", "params": { "selector": "@search" } } ] },
                { "id": "b", "characteristic": "usability",
                  "selectors": { "search": "#search-box" },
                  "steps": [ { "action": "click", "params": { "selector": "@search" } } ] },
                { "id": "a", "characteristic": "security",
                  "steps": [ { "action": "click", "params": { "selector": "x" } } ] },
                { "id": "c", "characteristic": "nonsense", "steps": [] }
            ]
        }"##;
        let single = r#"{"id":"b","characteristic":"security","steps":[{"action":"click","params":{"selector":"y"}}]}"#;
        let sources = vec![
            RoutineSource::new("batch.json", DocumentFormat::Json, batch_doc),
            RoutineSource::new("single.json", DocumentFormat::Json, single),
        ];

        let batch = RoutineParser::default().parse_batch(&sources);
        let ids: Vec<&str> = batch.scenarios.iter().map(|s| s.id.as_str()).collect();
        assert_eq!(ids, vec!["a", "b"]);
        assert_eq!(
            batch.scenarios[0].steps[0].action,
            Action::Click { selector: "#q".to_string() }
        );
        assert_eq!(
            batch.scenarios[1].steps[0].action,
            Action::Click { selector: "#search-box".to_string() }
        );

        assert_eq!(batch.rejected.len(), 3);
        assert_eq!(batch.rejected[0].error, ParseError::DuplicateIdentifier("a".to_string()));
        assert_eq!(batch.rejected[1].id.as_deref(), Some("c"));
        assert_eq!(batch.rejected[2].error, ParseError::DuplicateIdentifier("b".to_string()));
        assert_eq!(batch.rejected[2].origin, "single.json");
    }

    #[test]
    fn test_load_routines_from_dir() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("nested")).unwrap();
        std::fs::write(dir.path().join("b.json"), LOGIN).unwrap();
        std::fs::write(dir.path().join("nested/a.yml"), "id: y\n").unwrap();
        std::fs::write(dir.path().join("notes.txt"), "ignored").unwrap();

        let sources = load_routines(dir.path()).unwrap();
        assert_eq!(sources.len(), 2);
        assert_eq!(sources[0].format, DocumentFormat::Json);
        assert_eq!(sources[1].format, DocumentFormat::Yaml);
    }
}
