//! Roll-up of scenario verdicts into per-characteristic assessments

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::model::Characteristic;
use crate::runner::ScenarioVerdict;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AggregateStatus {
    Pass,
    Fail,
    /// No scenario contributed to this characteristic
    NotEvaluated,
}

/// Assessment of one quality characteristic
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CharacteristicReport {
    pub characteristic: Characteristic,
    pub status: AggregateStatus,
    pub passed: usize,
    pub total: usize,
    /// passed / total, 0 when nothing contributed
    pub pass_ratio: f64,
    /// Contributing verdicts ordered by scenario id
    pub verdicts: Vec<ScenarioVerdict>,
}

impl CharacteristicReport {
    fn from_verdicts(characteristic: Characteristic, mut verdicts: Vec<ScenarioVerdict>) -> Self {
        verdicts.sort_by(|a, b| a.scenario_id.cmp(&b.scenario_id));
        let total = verdicts.len();
        let passed = verdicts.iter().filter(|v| v.passed()).count();
        let status = if total == 0 {
            AggregateStatus::NotEvaluated
        } else if passed == total {
            AggregateStatus::Pass
        } else {
            AggregateStatus::Fail
        };
        let pass_ratio = if total == 0 { 0.0 } else { passed as f64 / total as f64 };

        Self {
            characteristic,
            status,
            passed,
            total,
            pass_ratio,
            verdicts,
        }
    }
}

/// Group verdicts by characteristic. Every characteristic gets an entry;
/// the result does not depend on the order of `verdicts`.
pub fn aggregate(verdicts: &[ScenarioVerdict]) -> BTreeMap<Characteristic, CharacteristicReport> {
    let mut grouped: BTreeMap<Characteristic, Vec<ScenarioVerdict>> =
        Characteristic::ALL.iter().map(|c| (*c, Vec::new())).collect();
    for verdict in verdicts {
        grouped
            .entry(verdict.characteristic)
            .or_default()
            .push(verdict.clone());
    }

    grouped
        .into_iter()
        .map(|(characteristic, group)| (characteristic, CharacteristicReport::from_verdicts(characteristic, group)))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runner::{RunState, VerdictStatus};

    fn verdict(id: &str, characteristic: Characteristic, pass: bool) -> ScenarioVerdict {
        ScenarioVerdict {
            scenario_id: id.to_string(),
            characteristic,
            status: if pass { VerdictStatus::Pass } else { VerdictStatus::Fail },
            final_state: RunState::Completed,
            steps: vec![],
            duration_ms: 1,
            session_id: None,
        }
    }

    #[test]
    fn test_every_characteristic_reported() {
        let report = aggregate(&[]);
        assert_eq!(report.len(), Characteristic::ALL.len());
        assert!(report.values().all(|r| r.status == AggregateStatus::NotEvaluated && r.pass_ratio == 0.0));
    }

    #[test]
    fn test_one_failure_fails_characteristic() {
        let report = aggregate(&[
            verdict("U1", Characteristic::Usability, true),
            verdict("U2", Characteristic::Usability, false),
            verdict("P1", Characteristic::Performance, true),
        ]);
        let usability = &report[&Characteristic::Usability];
        assert_eq!(usability.status, AggregateStatus::Fail);
        assert_eq!(usability.pass_ratio, 0.5);
        assert_eq!(report[&Characteristic::Performance].status, AggregateStatus::Pass);
        assert_eq!(report[&Characteristic::Security].status, AggregateStatus::NotEvaluated);
    }

    #[test]
    fn test_order_independent() {
        let a = verdict("A", Characteristic::Reliability, true);
        let b = verdict("B", Characteristic::Reliability, false);
        let c = verdict("C", Characteristic::Portability, true);
        let forward = aggregate(&[a.clone(), b.clone(), c.clone()]);
        let reversed = aggregate(&[c, b, a]);
        assert_eq!(forward, reversed);
    }
}
