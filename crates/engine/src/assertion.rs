//! Assertion evaluation against observed values

use serde::{Deserialize, Serialize};

use crate::model::{Assertion, Comparison, Predicate, Value};

/// Why an assertion did not hold
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AssertionFailureKind {
    /// Operands were compatible but the comparison was false
    NotSatisfied,
    /// The observed value has a type the operator cannot compare
    IncompatibleOperand,
}

/// Detail of the first failing assertion of a step
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AssertionFailure {
    /// 0-based position among the step's assertions
    pub index: usize,
    pub label: Option<String>,
    pub operator: String,
    pub expected: Value,
    pub observed: Value,
    pub kind: AssertionFailureKind,
}

impl std::fmt::Display for AssertionFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = self
            .label
            .clone()
            .unwrap_or_else(|| format!("assertion #{}", self.index + 1));
        match self.kind {
            AssertionFailureKind::NotSatisfied => write!(
                f,
                "{} failed: expected {} {}, observed {}",
                name, self.operator, self.expected, self.observed
            ),
            AssertionFailureKind::IncompatibleOperand => write!(
                f,
                "{} cannot apply '{}' to observed {} value {}",
                name,
                self.operator,
                self.observed.type_name(),
                self.observed
            ),
        }
    }
}

/// Evaluate assertions in order; the first failure stops evaluation.
pub fn evaluate_all(assertions: &[Assertion], observed: &Value) -> Result<(), AssertionFailure> {
    for (index, assertion) in assertions.iter().enumerate() {
        if let Err(kind) = check(&assertion.comparison, observed) {
            return Err(AssertionFailure {
                index,
                label: assertion.label.clone(),
                operator: assertion.comparison.operator().to_string(),
                expected: assertion.comparison.expected(),
                observed: observed.clone(),
                kind,
            });
        }
    }
    Ok(())
}

fn check(comparison: &Comparison, observed: &Value) -> Result<(), AssertionFailureKind> {
    use AssertionFailureKind::{IncompatibleOperand, NotSatisfied};

    let holds = match (comparison, observed) {
        (Comparison::Equals(expected), _) | (Comparison::NotEquals(expected), _) => {
            if expected.type_name() != observed.type_name() {
                return Err(IncompatibleOperand);
            }
            let equal = expected == observed;
            matches!(comparison, Comparison::Equals(_)) == equal
        }
        (Comparison::Contains(needle), Value::Text(hay)) => hay.contains(needle.as_str()),
        (Comparison::NotContains(needle), Value::Text(hay)) => !hay.contains(needle.as_str()),
        (Comparison::Threshold { op, bound }, Value::Number(n)) => {
            if !n.is_finite() {
                return Err(IncompatibleOperand);
            }
            op.holds(*n, *bound)
        }
        (Comparison::Predicate(Predicate::IsTrue), Value::Bool(b)) => *b,
        (Comparison::Predicate(Predicate::IsFalse), Value::Bool(b)) => !*b,
        (Comparison::Predicate(Predicate::IsEmpty), Value::Text(s)) => s.trim().is_empty(),
        (Comparison::Predicate(Predicate::IsNotEmpty), Value::Text(s)) => !s.trim().is_empty(),
        _ => return Err(IncompatibleOperand),
    };

    if holds {
        Ok(())
    } else {
        Err(NotSatisfied)
    }
}
