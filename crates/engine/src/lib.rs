//! ISO/IEC 25010 quality scenario engine
//!
//! This crate runs declarative quality routines against a browser session
//! and rolls the outcomes up per quality characteristic:
//! - Parses JSON or YAML routine documents into validated scenarios
//! - Drives sessions through a pluggable [`Driver`] (Playwright or scripted)
//! - Executes steps with per-step timeouts, bounded retries and assertions
//! - Aggregates scenario verdicts into a per-characteristic assessment
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                         Engine                              │
//! ├─────────────────────────────────────────────────────────────┤
//! │  RoutineParser::parse_batch(sources) -> ParsedBatch         │
//! │  BatchRunner::run_all(scenarios)                            │
//! │    └── ScenarioRunner::run(scenario, session)               │
//! │          └── StepExecutor::execute(step, session)           │
//! │                ├── Driver: navigate/locate/interact/...     │
//! │                └── assertion::evaluate_all                  │
//! │  aggregate(verdicts) -> {characteristic: report}            │
//! │  RunReport::write_results(dir) -> run-results.json          │
//! └─────────────────────────────────────────────────────────────┘
//! ```

pub mod aggregate;
pub mod assertion;
pub mod config;
pub mod driver;
pub mod engine;
pub mod error;
pub mod executor;
pub mod metrics;
pub mod model;
pub mod parser;
pub mod report;
pub mod runner;
pub mod telemetry;

pub use aggregate::{aggregate, AggregateStatus, CharacteristicReport};
pub use config::{EngineConfig, ExecutorConfig};
pub use driver::{Driver, DriverFactory};
pub use engine::Engine;
pub use error::{DriverError, DriverErrorKind, EngineError, EngineResult, ParseError, RunnerFault};
pub use executor::{StepExecutor, StepOutcome, StepRecord};
pub use model::{Characteristic, FailurePolicy, Scenario, Step};
pub use parser::{parse, DocumentFormat, RoutineParser, RoutineSource};
pub use report::RunReport;
pub use runner::{BatchResult, BatchRunner, FaultedRun, RunState, ScenarioRunner, ScenarioVerdict, VerdictStatus};
