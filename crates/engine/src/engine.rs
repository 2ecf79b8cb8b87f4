//! End-to-end entry point: parse, run, aggregate, report

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::aggregate::aggregate;
use crate::config::EngineConfig;
use crate::driver::{DriverFactory, PlaywrightDriverFactory};
use crate::error::EngineResult;
use crate::executor::StepExecutor;
use crate::parser::{load_routines, ParsedBatch, RoutineParser, RoutineSource};
use crate::report::RunReport;
use crate::runner::{BatchRunner, ScenarioRunner};

/// Quality assessment engine
pub struct Engine {
    config: EngineConfig,
    parser: RoutineParser,
    batch: BatchRunner,
}

impl Engine {
    /// Create an engine over the given session factory
    pub fn new(config: EngineConfig, factory: Arc<dyn DriverFactory>) -> EngineResult<Self> {
        config.validate()?;
        let runner = ScenarioRunner::new(StepExecutor::new(&config.executor))
            .with_release_timeout(Duration::from_millis(config.executor.release_timeout_ms));
        Ok(Self {
            parser: RoutineParser::new(config.executor.parse_options()),
            batch: BatchRunner::new(runner, factory, config.max_concurrency),
            config,
        })
    }

    /// Create an engine that drives real browsers through Playwright
    pub fn with_playwright(config: EngineConfig) -> EngineResult<Self> {
        let factory = PlaywrightDriverFactory::new(config.playwright.clone())?;
        Self::new(config, Arc::new(factory))
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Cancelling stops every scenario at its next step boundary
    pub fn cancellation_token(&self) -> CancellationToken {
        self.batch.cancellation_token()
    }

    /// Parse `sources`, run every accepted routine and aggregate the verdicts.
    /// Rejected routines are listed in the report and never run.
    pub async fn run_documents(&self, sources: &[RoutineSource]) -> RunReport {
        let started_at = Utc::now();
        let parsed = self.parse(sources);
        self.run_parsed(started_at, parsed).await
    }

    /// Like [`Engine::run_documents`], but only routines tagged `tag` run.
    pub async fn run_tagged(&self, sources: &[RoutineSource], tag: &str) -> RunReport {
        let started_at = Utc::now();
        let mut parsed = self.parse(sources);
        parsed.scenarios.retain(|s| s.has_tag(tag));
        info!("{} routines tagged '{}'", parsed.scenarios.len(), tag);
        self.run_parsed(started_at, parsed).await
    }

    fn parse(&self, sources: &[RoutineSource]) -> ParsedBatch {
        let parsed = self.parser.parse_batch(sources);
        for rejected in &parsed.rejected {
            warn!("Rejected routine {}: {}", rejected.origin, rejected.error);
        }
        parsed
    }

    async fn run_parsed(&self, started_at: DateTime<Utc>, parsed: ParsedBatch) -> RunReport {
        let result = self.batch.run_all(&parsed.scenarios).await;
        let characteristics = aggregate(&result.verdicts);
        let report = RunReport::new(
            started_at,
            result.verdicts,
            characteristics,
            parsed.rejected,
            result.faults.iter().map(|f| f.to_string()).collect(),
        );

        info!(
            "Run {}: {} passed, {} failed, {} rejected",
            report.run_id,
            report.passed,
            report.failed,
            report.rejected.len()
        );
        report
    }

    /// Run every routine under the configured directory and write the
    /// report into the output directory.
    pub async fn run_directory(&self) -> EngineResult<RunReport> {
        let sources = load_routines(&self.config.routines_dir)?;
        info!(
            "Loaded {} routine documents from {}",
            sources.len(),
            self.config.routines_dir.display()
        );
        let report = self.run_documents(&sources).await;
        report.write_results(&self.config.output_dir)?;
        Ok(report)
    }
}
