use jsonschema::{Draft, JSONSchema};
use serde_json::Value;

use crate::{
    error::EvaluatorError,
    eval::{
        evaluators::{Evaluator, EvaluatorKind},
        report::{SkipReason, Verdict, Violation, ViolationKind},
        scenario::TestCase,
    },
    timeline::Timeline,
};

/// Checks the final answer and tool-call count against the expected outcome.
#[derive(Debug, Clone, Copy, Default)]
pub struct ResponseEvaluator;

impl ResponseEvaluator {
    fn check_schema(&self, schema: &Value, answer: &str, violations: &mut Vec<Violation>) -> Result<(), EvaluatorError> {
        let compiled = JSONSchema::options()
            .with_draft(Draft::Draft7)
            .compile(schema)
            .map_err(|e| EvaluatorError::Configuration(format!("response_json_schema: {e}")))?;

        let json = match serde_json::from_str::<Value>(answer.trim()) {
            Ok(json) => json,
            Err(e) => {
                violations.push(Violation::error(
                    ViolationKind::ResponseSchemaMismatch,
                    format!("final answer is not valid JSON: {e}"),
                ));
                return Ok(());
            }
        };
        if let Err(errors) = compiled.validate(&json) {
            for e in errors.take(5) {
                violations.push(Violation::error(
                    ViolationKind::ResponseSchemaMismatch,
                    format!("final answer violates schema: {e}"),
                ));
            }
        }
        Ok(())
    }
}

impl Evaluator for ResponseEvaluator {
    fn kind(&self) -> EvaluatorKind {
        EvaluatorKind::Response
    }

    fn evaluate(&self, timeline: &Timeline, case: &TestCase) -> Result<Verdict, EvaluatorError> {
        let expected = &case.expected;
        if expected.is_empty() {
            return Ok(Verdict::skipped(self.name(), SkipReason::NotConfigured));
        }

        let final_text = timeline.final_text();
        let answer = final_text.unwrap_or_default();
        let evidence: Vec<usize> = timeline
            .text_outputs()
            .filter(|(_, text)| Some(text.content.as_str()) == final_text)
            .map(|(index, _)| index)
            .take(1)
            .collect();

        let mut violations = Vec::new();
        for needle in &expected.response_contains {
            if !answer.contains(needle.as_str()) {
                violations.push(
                    Violation::error(
                        ViolationKind::ResponseMissingText,
                        format!("final answer is missing `{needle}`"),
                    )
                    .with_entries(evidence.iter().copied()),
                );
            }
        }
        for needle in &expected.response_not_contains {
            if answer.contains(needle.as_str()) {
                violations.push(
                    Violation::error(
                        ViolationKind::ResponseForbiddenText,
                        format!("final answer contains forbidden text `{needle}`"),
                    )
                    .with_entries(evidence.iter().copied()),
                );
            }
        }
        if let Some(schema) = &expected.response_json_schema {
            self.check_schema(schema, answer, &mut violations)?;
        }

        let calls = timeline.tool_calls().count();
        if let Some(min) = expected.min_tool_calls.filter(|min| calls < *min) {
            violations.push(Violation::error(
                ViolationKind::ToolCallCount,
                format!("expected at least {min} tool call(s), saw {calls}"),
            ));
        }
        if let Some(max) = expected.max_tool_calls.filter(|max| calls > *max) {
            violations.push(Violation::error(
                ViolationKind::ToolCallCount,
                format!("expected at most {max} tool call(s), saw {calls}"),
            ));
        }

        Ok(Verdict::from_violations(self.name(), violations))
    }
}
