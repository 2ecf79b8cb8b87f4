//! Run report and its JSON artifact

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::info;
use uuid::Uuid;

use crate::aggregate::{AggregateStatus, CharacteristicReport};
use crate::error::EngineResult;
use crate::model::Characteristic;
use crate::parser::RejectedRoutine;
use crate::runner::ScenarioVerdict;

pub const RESULTS_FILE: &str = "run-results.json";

/// Everything one engine run produced
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunReport {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub total: usize,
    pub passed: usize,
    pub failed: usize,
    /// Verdicts in routine order
    pub verdicts: Vec<ScenarioVerdict>,
    pub characteristics: BTreeMap<Characteristic, CharacteristicReport>,
    /// Routines that never ran because they failed to parse
    pub rejected: Vec<RejectedRoutine>,
    /// Runner faults, rendered
    pub faults: Vec<String>,
}

impl RunReport {
    pub fn new(
        started_at: DateTime<Utc>,
        verdicts: Vec<ScenarioVerdict>,
        characteristics: BTreeMap<Characteristic, CharacteristicReport>,
        rejected: Vec<RejectedRoutine>,
        faults: Vec<String>,
    ) -> Self {
        let passed = verdicts.iter().filter(|v| v.passed()).count();
        Self {
            run_id: Uuid::new_v4(),
            started_at,
            finished_at: Utc::now(),
            total: verdicts.len(),
            passed,
            failed: verdicts.len() - passed,
            verdicts,
            characteristics,
            rejected,
            faults,
        }
    }

    /// True when nothing failed, nothing was rejected and no fault occurred
    pub fn is_clean(&self) -> bool {
        self.failed == 0 && self.rejected.is_empty() && self.faults.is_empty()
    }

    pub fn status_of(&self, characteristic: Characteristic) -> AggregateStatus {
        self.characteristics
            .get(&characteristic)
            .map(|r| r.status)
            .unwrap_or(AggregateStatus::NotEvaluated)
    }

    /// Write the report as pretty JSON into `dir`
    pub fn write_results(&self, dir: &Path) -> EngineResult<PathBuf> {
        std::fs::create_dir_all(dir)?;

        let path = dir.join(RESULTS_FILE);
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(&path, json)?;

        info!("Results written to: {}", path.display());
        Ok(path)
    }

    /// Read a report written by [`RunReport::write_results`]
    pub fn load(path: &Path) -> EngineResult<Self> {
        let content = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&content)?)
    }
}
