use std::collections::BTreeMap;

use crate::{
    error::EvaluatorError,
    eval::{
        evaluators::{Evaluator, EvaluatorKind},
        report::{SkipReason, Verdict, Violation, ViolationKind},
        scenario::TestCase,
    },
    timeline::Timeline,
};

/// Generic rule engine over [`BehaviorExpectation`](crate::eval::scenario::BehaviorExpectation).
#[derive(Debug, Clone, Copy, Default)]
pub struct BehaviorEvaluator;

fn contains_name<'a>(mut names: impl Iterator<Item = &'a String>, tool: &str) -> bool {
    names.any(|name| name.eq_ignore_ascii_case(tool))
}

impl Evaluator for BehaviorEvaluator {
    fn kind(&self) -> EvaluatorKind {
        EvaluatorKind::Behavior
    }

    fn evaluate(&self, timeline: &Timeline, case: &TestCase) -> Result<Verdict, EvaluatorError> {
        let behavior = &case.behavior;
        if !behavior.has_rules() {
            return Ok(Verdict::skipped(self.name(), SkipReason::NotConfigured));
        }

        let mut violations = Vec::new();

        for forbidden in &behavior.must_not_use_tools {
            let calls: Vec<usize> = timeline
                .tool_calls()
                .filter(|(_, call)| call.is_named(forbidden))
                .map(|(index, _)| index)
                .collect();
            if !calls.is_empty() {
                violations.push(
                    Violation::error(
                        ViolationKind::ForbiddenToolUsed,
                        format!("forbidden tool `{forbidden}` was called {} time(s)", calls.len()),
                    )
                    .with_entries(calls),
                );
            }
        }

        if !behavior.may_use_tools.is_empty() {
            let mut outside: BTreeMap<String, Vec<usize>> = BTreeMap::new();
            for (index, call) in timeline.tool_calls() {
                let allowed = contains_name(behavior.may_use_tools.iter(), &call.name)
                    || contains_name(behavior.must_use_any_of.iter().flatten(), &call.name);
                let forbidden = contains_name(behavior.must_not_use_tools.iter(), &call.name);
                if !allowed && !forbidden {
                    outside.entry(call.name.to_lowercase()).or_default().push(index);
                }
            }
            for (tool, calls) in outside {
                violations.push(
                    Violation::error(
                        ViolationKind::ToolNotAllowed,
                        format!("tool `{tool}` is not in the allowed set"),
                    )
                    .with_entries(calls),
                );
            }
        }

        if !behavior.must_use_any_of.is_empty() {
            let used = |tool: &String| timeline.tool_calls().any(|(_, call)| call.is_named(tool));
            let satisfied = behavior
                .must_use_any_of
                .iter()
                .any(|set| set.iter().all(|tool| used(tool)));
            if !satisfied {
                let sets: Vec<String> = behavior
                    .must_use_any_of
                    .iter()
                    .map(|set| format!("[{}]", set.iter().cloned().collect::<Vec<_>>().join(", ")))
                    .collect();
                violations.push(Violation::error(
                    ViolationKind::ToolSetNotSatisfied,
                    format!("none of the required tool sets was used in full: {}", sets.join(" or ")),
                ));
            }
        }

        if behavior.requires_approval && timeline.approvals().next().is_none() {
            violations.push(Violation::error(
                ViolationKind::ApprovalNotRequested,
                "the agent never requested approval",
            ));
        }

        if behavior.requires_context && timeline.context_loads().next().is_none() {
            violations.push(Violation::error(
                ViolationKind::ContextNotLoaded,
                "the agent never loaded a context file",
            ));
        }

        Ok(Verdict::from_violations(self.name(), violations))
    }
}
