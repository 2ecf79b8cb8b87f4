//! End-to-end runs of routine documents against scripted sessions

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use isoqa_engine::driver::scripted::Operation;
use isoqa_engine::driver::{PageScript, ScriptedDriverFactory, SimulatedElement};
use isoqa_engine::model::MetricKind;
use isoqa_engine::report::RESULTS_FILE;
use isoqa_engine::{
    AggregateStatus, Characteristic, DocumentFormat, Engine, EngineConfig, ExecutorConfig, RoutineSource, RunReport,
    RunState, StepOutcome, VerdictStatus,
};

fn config(max_concurrency: usize) -> EngineConfig {
    EngineConfig {
        max_concurrency,
        executor: ExecutorConfig {
            retry_backoff_ms: 5,
            wait_grace_ms: 50,
            ..Default::default()
        },
        ..Default::default()
    }
}

fn portal() -> PageScript {
    PageScript::new()
        .element("#username", SimulatedElement::new("").rejecting_input("stu"))
        .element("#submit", SimulatedElement::new("Sign in"))
        .element("h1", SimulatedElement::new("Dashboard"))
        .element("#help", SimulatedElement::new("Help").hidden())
        .metric(MetricKind::PageLoadMs, [420.0, 380.0, 610.0])
}

fn yaml(origin: &str, text: &str) -> RoutineSource {
    RoutineSource::new(origin, DocumentFormat::Yaml, text)
}

async fn run(factory: ScriptedDriverFactory, max_concurrency: usize, sources: &[RoutineSource]) -> RunReport {
    let engine = Engine::new(config(max_concurrency), Arc::new(factory)).unwrap();
    engine.run_documents(sources).await
}

fn outcome_names(report: &RunReport, id: &str) -> Vec<&'static str> {
    report
        .verdicts
        .iter()
        .find(|v| v.scenario_id == id)
        .map(|v| v.outcomes().map(|o| o.name()).collect())
        .unwrap_or_default()
}

const THREE_STEPS_ABORT: &str = r##"
id: F-001
characteristic: functionality
failurePolicy: abort
baseUrl: http://lms.local
steps:
  - action: navigate
    params: { url: /login }
  - action: fill
    params: { selector: "#username", value: student01 }
    assertions:
      - { op: equals, expected: student01 }
  - action: assert
    params: { metric: pageLoadMs }
    assertions:
      - { op: gt, expected: 100 }
"##;

#[tokio::test]
async fn test_abort_policy_skips_after_failure() {
    let factory = ScriptedDriverFactory::new(portal());
    let report = run(factory, 1, &[yaml("f1.yaml", THREE_STEPS_ABORT)]).await;

    assert_eq!(outcome_names(&report, "F-001"), ["success", "assertion_failed", "skipped"]);
    let verdict = &report.verdicts[0];
    assert_eq!(verdict.status, VerdictStatus::Fail);
    assert_eq!(verdict.final_state, RunState::Aborted);
    assert_eq!(report.status_of(Characteristic::Functionality), AggregateStatus::Fail);
}

#[tokio::test]
async fn test_continue_policy_runs_remaining_steps() {
    let doc = THREE_STEPS_ABORT.replace("failurePolicy: abort", "failurePolicy: continue");
    let factory = ScriptedDriverFactory::new(portal());
    let report = run(factory, 1, &[yaml("f1.yaml", &doc)]).await;

    assert_eq!(outcome_names(&report, "F-001"), ["success", "assertion_failed", "success"]);
    assert_eq!(report.verdicts[0].status, VerdictStatus::Fail);
    assert_eq!(report.verdicts[0].final_state, RunState::Completed);
}

#[tokio::test]
async fn test_characteristic_rollup() {
    let pass = r##"
id: U-001
characteristic: usability
steps:
  - action: assert
    params: { text: h1 }
    assertions: [ { op: contains, expected: Dash } ]
"##;
    let fail = r##"
id: U-002
characteristic: usability
steps:
  - action: assert
    params: { visible: "#help" }
    assertions: [ { op: isTrue, label: help is discoverable } ]
"##;
    let factory = ScriptedDriverFactory::new(portal());
    let report = run(factory, 2, &[yaml("u1.yaml", pass), yaml("u2.yaml", fail)]).await;

    let usability = &report.characteristics[&Characteristic::Usability];
    assert_eq!(usability.status, AggregateStatus::Fail);
    assert_eq!(usability.pass_ratio, 0.5);
    assert_eq!(usability.verdicts.len(), 2);
    for characteristic in [Characteristic::Security, Characteristic::Portability] {
        let entry = &report.characteristics[&characteristic];
        assert_eq!(entry.status, AggregateStatus::NotEvaluated);
        assert_eq!(entry.pass_ratio, 0.0);
    }
}

#[tokio::test]
async fn test_unsatisfied_wait_times_out_without_retry() {
    let doc = r##"
id: R-001
characteristic: reliability
steps:
  - action: wait-for
    params: { visible: "#spinner-done" }
    timeoutMs: 100
    retries: 3
"##;
    let factory = ScriptedDriverFactory::new(portal());
    let report = run(factory, 1, &[yaml("r1.yaml", doc)]).await;

    let step = &report.verdicts[0].steps[0];
    assert_eq!(step.outcome, StepOutcome::TimedOut { after_ms: 100 });
    assert_eq!(step.attempts, 1);
}

#[tokio::test]
async fn test_metric_threshold_over_samples() {
    let doc = r##"
id: P-001
characteristic: performance
steps:
  - action: read-metric
    params: { metric: pageLoadMs, samples: 3, statistic: max }
    assertions: [ { op: lt, expected: 500, label: page loads under 500ms } ]
"##;
    let factory = ScriptedDriverFactory::new(portal());
    let report = run(factory, 1, &[yaml("p1.yaml", doc)]).await;

    match &report.verdicts[0].steps[0].outcome {
        StepOutcome::AssertionFailed(failure) => {
            assert_eq!(failure.label.as_deref(), Some("page loads under 500ms"));
            assert_eq!(failure.observed, isoqa_engine::model::Value::Number(610.0));
        }
        other => panic!("unexpected outcome {:?}", other),
    }
}

#[tokio::test]
async fn test_concurrent_scenarios_use_separate_sessions() {
    let sources: Vec<_> = (1..=4)
        .map(|n| {
            let doc = format!(
                "id: M-00{n}\ncharacteristic: maintainability\nsteps:\n  - action: navigate\n    params: {{ url: /page/{n} }}\n  - action: click\n    params: {{ selector: \"#submit\" }}\n"
            );
            yaml(&format!("m{}.yaml", n), &doc)
        })
        .collect();
    let factory = Arc::new(ScriptedDriverFactory::new(portal()));
    let engine = Engine::new(config(4), factory.clone()).unwrap();
    let report = engine.run_documents(&sources).await;

    assert_eq!(report.passed, 4);
    let ids: Vec<_> = report.verdicts.iter().map(|v| v.scenario_id.as_str()).collect();
    assert_eq!(ids, ["M-001", "M-002", "M-003", "M-004"]);

    let sessions = factory.sessions();
    assert_eq!(sessions.len(), 4);
    let distinct: HashSet<_> = sessions.iter().map(|s| s.session_id.clone()).collect();
    assert_eq!(distinct.len(), 4);
    let mut navigated = Vec::new();
    for session in &sessions {
        assert_eq!(session.release_count, 1);
        let navigations: Vec<_> = session.operations.iter().filter(|op| op.starts_with("navigate")).collect();
        assert_eq!(navigations.len(), 1);
        navigated.push(navigations[0].clone());
    }
    navigated.sort();
    assert_eq!(navigated, ["navigate /page/1", "navigate /page/2", "navigate /page/3", "navigate /page/4"]);
}

#[tokio::test]
async fn test_unavailable_session_fails_scenario() {
    let report = run(ScriptedDriverFactory::unavailable(), 1, &[yaml("f1.yaml", THREE_STEPS_ABORT)]).await;

    let verdict = &report.verdicts[0];
    assert_eq!(verdict.steps.len(), 3);
    assert!(matches!(verdict.steps[0].outcome, StepOutcome::ExecutionError(_)));
    assert!(verdict.steps[1..].iter().all(|s| s.outcome == StepOutcome::Skipped));
    assert_eq!(verdict.status, VerdictStatus::Fail);
}

#[tokio::test]
async fn test_rejected_routine_does_not_block_batch() {
    let broken = "id: S-001\ncharacteristic: security\nsteps:\n  - action: hover\n    params: {}\n";
    let factory = ScriptedDriverFactory::new(portal());
    let report = run(factory, 1, &[yaml("s1.yaml", broken), yaml("f1.yaml", THREE_STEPS_ABORT)]).await;

    assert_eq!(report.rejected.len(), 1);
    assert_eq!(report.rejected[0].origin, "s1.yaml");
    assert_eq!(report.verdicts.len(), 1);
    assert_eq!(report.status_of(Characteristic::Security), AggregateStatus::NotEvaluated);
}

#[tokio::test]
async fn test_panicking_session_is_released_and_reported() {
    let waits = r##"
id: R-002
characteristic: reliability
steps:
  - action: wait-for
    params: { visible: h1 }
"##;
    let clicks = r##"
id: R-003
characteristic: reliability
steps:
  - action: click
    params: { selector: "#submit" }
"##;
    let factory = Arc::new(ScriptedDriverFactory::new(portal().panic_on(Operation::WaitFor)));
    let engine = Engine::new(config(2), factory.clone()).unwrap();
    let report = engine.run_documents(&[yaml("r2.yaml", waits), yaml("r3.yaml", clicks)]).await;

    assert_eq!(report.faults.len(), 1);
    assert!(report.faults[0].contains("R-002"));
    assert_eq!(report.verdicts.len(), 2);
    assert_eq!(outcome_names(&report, "R-002"), ["execution_error"]);
    assert_eq!(outcome_names(&report, "R-003"), ["success"]);

    let reliability = &report.characteristics[&Characteristic::Reliability];
    assert_eq!(reliability.status, AggregateStatus::Fail);
    assert_eq!(reliability.total, 2);
    assert_eq!(reliability.pass_ratio, 0.5);
    assert!(factory.sessions().iter().all(|s| s.release_count == 1));
}

#[tokio::test]
async fn test_cancelled_run_marks_steps_cancelled() {
    let factory = Arc::new(ScriptedDriverFactory::new(portal()));
    let engine = Engine::new(config(1), factory.clone()).unwrap();
    engine.cancellation_token().cancel();
    let report = engine.run_documents(&[yaml("f1.yaml", THREE_STEPS_ABORT)]).await;

    assert!(report.verdicts[0].outcomes().all(|o| *o == StepOutcome::Cancelled));
    assert!(factory.sessions().is_empty());
}

#[tokio::test]
async fn test_run_directory_writes_results() {
    let dir = tempfile::tempdir().unwrap();
    let routines = dir.path().join("routines");
    std::fs::create_dir_all(&routines).unwrap();
    std::fs::write(routines.join("f1.yaml"), THREE_STEPS_ABORT).unwrap();
    std::fs::write(routines.join("notes.txt"), "ignored").unwrap();

    let config = EngineConfig {
        routines_dir: routines,
        output_dir: dir.path().join("out"),
        ..config(1)
    };
    let engine = Engine::new(config, Arc::new(ScriptedDriverFactory::new(portal()))).unwrap();
    let report = engine.run_directory().await.unwrap();

    let written = RunReport::load(&dir.path().join("out").join(RESULTS_FILE)).unwrap();
    assert_eq!(written.run_id, report.run_id);
    assert_eq!(written.verdicts.len(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_cancel_while_scenarios_in_flight() {
    let sources: Vec<_> = (1..=3)
        .map(|n| {
            let doc = format!(
                "id: C-00{n}\ncharacteristic: security\nfailurePolicy: continue\nsteps:\n  - action: click\n    params: {{ selector: \"#submit\" }}\n  - action: click\n    params: {{ selector: \"#submit\" }}\n  - action: click\n    params: {{ selector: \"#submit\" }}\n"
            );
            yaml(&format!("c{}.yaml", n), &doc)
        })
        .collect();
    let factory = Arc::new(ScriptedDriverFactory::new(portal().delay(Duration::from_millis(50))));
    let engine = Engine::new(config(2), factory.clone()).unwrap();
    let token = engine.cancellation_token();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(75)).await;
        token.cancel();
    });

    let report = engine.run_documents(&sources).await;

    assert_eq!(report.verdicts.len(), 3);
    assert!(report.verdicts.iter().all(|v| v.final_state == RunState::Aborted));
    let mut shapes: Vec<Vec<&str>> = report
        .verdicts
        .iter()
        .map(|v| v.outcomes().map(|o| o.name()).collect())
        .collect();
    shapes.sort();
    assert_eq!(
        shapes,
        [
            vec!["cancelled", "cancelled", "cancelled"],
            vec!["success", "cancelled", "cancelled"],
            vec!["success", "cancelled", "cancelled"],
        ]
    );

    let sessions = factory.sessions();
    assert_eq!(sessions.len(), 2);
    assert!(sessions.iter().all(|s| s.release_count == 1));
}

#[tokio::test]
async fn test_run_tagged_selects_routines() {
    let smoke = r##"
id: F-010
characteristic: functionality
tags: [smoke]
steps:
  - action: click
    params: { selector: "#submit" }
"##;
    let factory = ScriptedDriverFactory::new(portal());
    let engine = Engine::new(config(1), Arc::new(factory)).unwrap();
    let report = engine
        .run_tagged(&[yaml("f10.yaml", smoke), yaml("f1.yaml", THREE_STEPS_ABORT)], "smoke")
        .await;

    let ids: Vec<_> = report.verdicts.iter().map(|v| v.scenario_id.as_str()).collect();
    assert_eq!(ids, ["F-010"]);
    assert_eq!(report.status_of(Characteristic::Functionality), AggregateStatus::Pass);
}
