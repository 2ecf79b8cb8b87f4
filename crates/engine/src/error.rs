//! Error taxonomy for the scenario engine

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Rejection of a routine document. Nothing from a rejected document is run.
#[derive(Error, Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "detail", rename_all = "snake_case")]
pub enum ParseError {
    #[error("Malformed document: {0}")]
    MalformedDocument(String),

    #[error("Missing required field: {0}")]
    MissingField(String),

    #[error("Unknown action kind: {0}")]
    UnknownActionKind(String),

    #[error("Unknown quality characteristic: {0}")]
    UnknownCharacteristic(String),

    #[error("Unresolved reference: {0}")]
    UnresolvedReference(String),

    #[error("Duplicate scenario identifier: {0}")]
    DuplicateIdentifier(String),

    #[error("Invalid field {field}: {reason}")]
    InvalidField { field: String, reason: String },

    #[error("Incompatible assertion at {field}: '{operator}' {reason}")]
    IncompatibleAssertion {
        field: String,
        operator: String,
        reason: String,
    },
}

impl ParseError {
    pub(crate) fn invalid(field: impl Into<String>, reason: impl Into<String>) -> Self {
        ParseError::InvalidField {
            field: field.into(),
            reason: reason.into(),
        }
    }
}

/// Category of a failure reported by a browser backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum DriverErrorKind {
    /// Selector matched nothing (possibly not rendered yet)
    ElementNotFound,
    /// Element exists but cannot receive the interaction yet
    NotInteractable,
    NavigationFailed,
    /// Element or page went away while it was being used
    Detached,
    SessionClosed,
    Unsupported,
    /// Backend transport or bridge failure
    Protocol,
    /// The engine itself failed while the step was running
    Internal,
}

impl DriverErrorKind {
    /// Kinds retried when a step does not name its own `retryOn` list.
    pub const DEFAULT_RETRYABLE: [DriverErrorKind; 2] = [
        DriverErrorKind::ElementNotFound,
        DriverErrorKind::NotInteractable,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            DriverErrorKind::ElementNotFound => "elementNotFound",
            DriverErrorKind::NotInteractable => "notInteractable",
            DriverErrorKind::NavigationFailed => "navigationFailed",
            DriverErrorKind::Detached => "detached",
            DriverErrorKind::SessionClosed => "sessionClosed",
            DriverErrorKind::Unsupported => "unsupported",
            DriverErrorKind::Protocol => "protocol",
            DriverErrorKind::Internal => "internal",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        let kind = match s {
            "elementNotFound" => DriverErrorKind::ElementNotFound,
            "notInteractable" => DriverErrorKind::NotInteractable,
            "navigationFailed" => DriverErrorKind::NavigationFailed,
            "detached" => DriverErrorKind::Detached,
            "sessionClosed" => DriverErrorKind::SessionClosed,
            "unsupported" => DriverErrorKind::Unsupported,
            "protocol" => DriverErrorKind::Protocol,
            "internal" => DriverErrorKind::Internal,
            _ => return None,
        };
        Some(kind)
    }
}

impl fmt::Display for DriverErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Failure of a single driver operation. Drivers never retry on their own.
#[derive(Error, Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[error("{kind}: {message}")]
pub struct DriverError {
    pub kind: DriverErrorKind,
    pub message: String,
}

impl DriverError {
    pub fn new(kind: DriverErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn element_not_found(selector: &str) -> Self {
        Self::new(
            DriverErrorKind::ElementNotFound,
            format!("no element matches '{}'", selector),
        )
    }

    pub fn protocol(message: impl Into<String>) -> Self {
        Self::new(DriverErrorKind::Protocol, message)
    }
}

pub type DriverResult<T> = Result<T, DriverError>;

/// Unexpected engine-internal failure. The driver session is released
/// before one of these leaves the runner.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RunnerFault {
    #[error("Scenario '{scenario}' panicked: {message}")]
    Panicked { scenario: String, message: String },

    #[error("Invariant violated in scenario '{scenario}': {message}")]
    InvariantViolated { scenario: String, message: String },
}

/// Errors from the I/O-bearing outer layer (loading, config, results).
#[derive(Error, Debug)]
pub enum EngineError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("TOML parse error: {0}")]
    TomlDe(#[from] toml::de::Error),

    #[error("TOML write error: {0}")]
    TomlSer(#[from] toml::ser::Error),

    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("Routine rejected: {0}")]
    Parse(#[from] ParseError),

    #[error("Driver error: {0}")]
    Driver(#[from] DriverError),

    #[error("Runner fault: {0}")]
    Runner(#[from] RunnerFault),
}

pub type EngineResult<T> = Result<T, EngineError>;
