use std::{path::PathBuf, sync::Arc};

use denkwerk_evals::{
    load_cases, load_event_log, parse_event_log, EvalError, HarnessConfig, ScriptedRuntime, SkipReason,
    TestRunner, TimelineBuilder, TimelineEntry, ViolationKind,
};
use pretty_assertions::assert_eq;

fn fixture(name: &str) -> PathBuf {
    PathBuf::from(env!("CARGO_MANIFEST_DIR"))
        .join("tests")
        .join("fixtures")
        .join(name)
}

fn offline_runner() -> TestRunner {
    TestRunner::new(Arc::new(ScriptedRuntime::new(Default::default())), HarnessConfig::default())
}

#[test]
fn recorded_session_is_judged_without_a_runtime() {
    let case = load_cases(fixture("replay-case.yaml")).unwrap().remove(0).case;
    let events = load_event_log(fixture("replay-events.jsonl")).unwrap();
    let result = offline_runner().evaluate_log(&case, &events).unwrap();

    assert_eq!(result.session_id.as_deref(), Some("rec-42"));
    assert_eq!(result.duration_ms, 7_000);
    assert!(!result.passed);

    let kinds = |name: &str| -> Vec<ViolationKind> {
        result
            .verdict(name)
            .unwrap()
            .violations
            .iter()
            .map(|v| v.kind)
            .collect()
    };
    assert_eq!(kinds("tool-usage"), vec![ViolationKind::BashAntipattern]);
    assert_eq!(kinds("execution-balance"), vec![ViolationKind::ExecutionBeforeRead]);
    assert!(result.verdict("approval-gate").unwrap().passed);
    assert!(result.verdict("behavior").unwrap().passed);
    assert!(result.verdict("context-loading").unwrap().passed);
    assert_eq!(
        result.timeline.final_text(),
        Some("Renamed the loader to load_config.")
    );
}

#[test]
fn replaying_a_log_twice_builds_the_same_timeline() {
    let events = load_event_log(fixture("replay-events.jsonl")).unwrap();
    let config = HarnessConfig::default();
    let first = TimelineBuilder::from_config(&config).build(&events);
    let second = TimelineBuilder::from_config(&config).build(&events);
    assert_eq!(first, second);
    assert!(first.anomalies.is_empty());

    let (call_index, edit) = first.tool_calls().find(|(_, call)| call.name == "edit").unwrap();
    let approval = match first.get(edit.approval.unwrap()) {
        Some(TimelineEntry::ApprovalEvent(approval)) => approval,
        other => panic!("expected approval, got {other:?}"),
    };
    assert_eq!(approval.tool_call, Some(call_index));
    assert_eq!(approval.latency_ms(), Some(1_000));
}

#[test]
fn case_directories_load_sorted_by_id() {
    let files = load_cases(fixture("cases")).unwrap();
    let ids: Vec<_> = files.iter().map(|file| file.case.id.as_str()).collect();
    assert_eq!(ids, vec!["docs-001", "safety-001"]);
    assert!(files[0].script.is_none());
    assert_eq!(files[1].script.as_ref().unwrap().turns.len(), 1);
}

#[tokio::test]
async fn embedded_scripts_drive_the_scripted_runtime() {
    let file = load_cases(fixture("cases/a-safety.json")).unwrap().remove(0);
    let runtime = Arc::new(ScriptedRuntime::new(file.script.unwrap()));
    let result = offline_runner().with_runtime(runtime).run(&file.case).await.unwrap();

    assert!(result.passed, "{:#?}", result.failures());
    assert_eq!(result.timeline.approvals().count(), 1);
    assert_eq!(
        result.verdict("execution-balance").unwrap().skip_reason(),
        Some(SkipReason::NoActivity)
    );
}

#[test]
fn malformed_log_lines_report_their_position() {
    let log = "{\"at\":\"2026-01-05T10:00:00Z\",\"type\":\"turn_completed\"}\n{\"at\":\"2026-01-05T10:00:01Z\",\"type\":\"tool_started\"}\n";
    match parse_event_log(log) {
        Err(EvalError::EventLog { line, .. }) => assert_eq!(line, 2),
        other => panic!("expected an event log error, got {other:?}"),
    }
}
