use std::sync::Arc;

use futures_util::{stream::FuturesUnordered, StreamExt};
use tracing::{debug, info};

use crate::{
    config::HarnessConfig,
    error::EvalError,
    eval::{
        evaluators::EvaluatorRunner,
        executor::{SessionRecord, TestExecutor},
        report::{EvalReport, EvaluationResult, RunStatus, SkipReason, Verdict},
        scenario::TestCase,
    },
    runtime::{AgentRuntime, RawEvent, RawEventKind},
    timeline::{Timeline, TimelineBuilder},
};

/// Validates a case, runs it, builds the timeline and judges it.
#[derive(Clone)]
pub struct TestRunner {
    executor: TestExecutor,
    evaluators: Arc<EvaluatorRunner>,
    config: Arc<HarnessConfig>,
}

impl TestRunner {
    pub fn new(runtime: Arc<dyn AgentRuntime>, config: HarnessConfig) -> Self {
        let config = Arc::new(config);
        Self {
            executor: TestExecutor::new(runtime, Arc::clone(&config)),
            evaluators: Arc::new(EvaluatorRunner::default_set(&config)),
            config,
        }
    }

    pub fn with_evaluators(mut self, evaluators: EvaluatorRunner) -> Self {
        self.evaluators = Arc::new(evaluators);
        self
    }

    /// Same configuration and evaluators, different runtime.
    pub fn with_runtime(&self, runtime: Arc<dyn AgentRuntime>) -> Self {
        Self {
            executor: TestExecutor::new(runtime, Arc::clone(&self.config)),
            evaluators: Arc::clone(&self.evaluators),
            config: Arc::clone(&self.config),
        }
    }

    pub fn config(&self) -> &HarnessConfig {
        &self.config
    }

    pub async fn run(&self, case: &TestCase) -> Result<EvaluationResult, EvalError> {
        validate(case)?;
        info!(case = %case.id, agent = %case.agent, prompts = case.prompts.len(), "running test case");
        let record = self.executor.execute(case).await?;
        let result = self.judge(case, record);
        info!(
            case = %case.id,
            status = ?result.status,
            passed = result.passed,
            duration_ms = result.duration_ms,
            "test case finished"
        );
        Ok(result)
    }

    /// Runs every case, at most `concurrency` at a time. Results come back in
    /// input order.
    pub async fn run_all(&self, cases: &[TestCase]) -> Vec<Result<EvaluationResult, EvalError>> {
        let limit = self.config.concurrency.max(1);
        let mut slots: Vec<Option<Result<EvaluationResult, EvalError>>> =
            std::iter::repeat_with(|| None).take(cases.len()).collect();
        let mut pending = cases.iter().enumerate();
        let mut running = FuturesUnordered::new();

        loop {
            while running.len() < limit {
                let Some((index, case)) = pending.next() else { break };
                running.push(async move { (index, self.run(case).await) });
            }
            let Some((index, result)) = running.next().await else { break };
            slots[index] = Some(result);
        }

        slots.into_iter().flatten().collect()
    }

    /// Aggregates the successful results of [`run_all`](Self::run_all).
    pub async fn report(&self, cases: &[TestCase]) -> Result<EvalReport, EvalError> {
        let results = self
            .run_all(cases)
            .await
            .into_iter()
            .collect::<Result<Vec<_>, _>>()?;
        Ok(EvalReport::from_results(results))
    }

    /// Judges a recorded event log without a runtime.
    pub fn evaluate_log(&self, case: &TestCase, events: &[RawEvent]) -> Result<EvaluationResult, EvalError> {
        validate(case)?;
        let session_id = events.iter().find_map(|event| match &event.kind {
            RawEventKind::SessionStarted { session_id } => Some(session_id.clone()),
            _ => None,
        });
        let duration = match (events.first(), events.last()) {
            (Some(first), Some(last)) => (last.at - first.at).to_std().unwrap_or_default(),
            _ => Default::default(),
        };
        let record = SessionRecord {
            session_id,
            events: events.to_vec(),
            status: RunStatus::Completed,
            errors: Vec::new(),
            duration,
        };
        Ok(self.judge(case, record))
    }

    pub fn build_timeline(&self, events: &[RawEvent]) -> Timeline {
        TimelineBuilder::from_config(&self.config).build(events)
    }

    fn judge(&self, case: &TestCase, record: SessionRecord) -> EvaluationResult {
        let timeline = self.build_timeline(&record.events);
        if !timeline.anomalies.is_empty() {
            debug!(case = %case.id, anomalies = timeline.anomalies.len(), "timeline has anomalies");
        }

        let verdicts: Vec<Verdict> = match record.status {
            RunStatus::Completed => self.evaluators.run(&timeline, case),
            RunStatus::TimedOut => self
                .evaluators
                .run(&timeline, case)
                .into_iter()
                .map(|verdict| verdict.demote(SkipReason::Timeout))
                .collect(),
            RunStatus::RuntimeError => self.evaluators.skip_all(case, SkipReason::RuntimeError),
        };
        let passed = EvaluationResult::compute_passed(record.status, &verdicts, &record.errors);

        EvaluationResult {
            test_case_id: case.id.clone(),
            session_id: record.session_id.clone(),
            status: record.status,
            verdicts,
            passed,
            duration_ms: record.duration_ms(),
            errors: record.errors,
            timeline,
        }
    }
}

fn validate(case: &TestCase) -> Result<(), EvalError> {
    case.validate().map_err(|source| EvalError::InvalidCase {
        case: case.id.clone(),
        source,
    })
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::{
        eval::scenario::{BehaviorExpectation, CaseError},
        runtime::scripted::{ScriptedRuntime, ScriptedStep, ScriptedTurn},
        timeline::tests::{log, started, turn},
    };

    fn runner(turns: Vec<ScriptedTurn>) -> TestRunner {
        TestRunner::new(Arc::new(ScriptedRuntime::from_turns(turns)), HarnessConfig::default())
    }

    #[tokio::test]
    async fn invalid_cases_fail_before_any_session() {
        let runtime = Arc::new(ScriptedRuntime::from_turns(Vec::new()));
        let runner = TestRunner::new(runtime.clone(), HarnessConfig::default());
        let err = runner.run(&TestCase::new("empty", "coder")).await.unwrap_err();
        assert!(matches!(
            err,
            EvalError::InvalidCase {
                source: CaseError::NoPrompts,
                ..
            }
        ));
        assert_eq!(runtime.active_sessions(), 0);
    }

    #[tokio::test]
    async fn forbidden_tool_fails_the_run() {
        let runner = runner(vec![ScriptedTurn::new(vec![
            ScriptedStep::tool("bash", json!({ "command": "cargo fmt" })),
            ScriptedStep::text("formatted"),
        ])]);
        let case = TestCase::new("forbid", "coder")
            .with_prompt("format the code")
            .with_behavior(BehaviorExpectation {
                must_not_use_tools: ["bash".to_string()].into(),
                ..Default::default()
            });
        let result = runner.run(&case).await.unwrap();
        assert_eq!(result.status, RunStatus::Completed);
        assert!(!result.passed);
        let behavior = result.verdict("behavior").unwrap();
        assert_eq!(behavior.violations.len(), 1);
    }

    #[tokio::test]
    async fn run_all_preserves_input_order() {
        let runner = runner(vec![ScriptedTurn::new(vec![ScriptedStep::text("ok")])]);
        let cases: Vec<_> = (0..6)
            .map(|i| TestCase::new(format!("case-{i}"), "coder").with_prompt("hi"))
            .collect();
        let ids: Vec<_> = runner
            .run_all(&cases)
            .await
            .into_iter()
            .map(|result| result.unwrap().test_case_id)
            .collect();
        assert_eq!(ids, cases.iter().map(|c| c.id.clone()).collect::<Vec<_>>());

        let report = runner.report(&cases).await.unwrap();
        assert_eq!(report.total, 6);
        assert!(report.all_passed());
    }

    #[test]
    fn evaluates_recorded_logs() {
        let runner = runner(Vec::new());
        let events = log(vec![
            RawEventKind::SessionStarted {
                session_id: "recorded-7".to_string(),
            },
            turn(0),
            started("c1", "edit", json!({ "filePath": "src/lib.rs" })),
        ]);
        let case = TestCase::new("replay", "coder").with_prompt("Fix the bug in lib.rs");
        let result = runner.evaluate_log(&case, &events).unwrap();

        assert_eq!(result.session_id.as_deref(), Some("recorded-7"));
        assert_eq!(result.duration_ms, 2_000);
        assert!(!result.passed);
        assert!(!result.verdict("context-loading").unwrap().passed);
        assert!(!result.verdict("execution-balance").unwrap().passed);
    }
}
