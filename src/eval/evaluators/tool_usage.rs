use crate::{
    error::EvaluatorError,
    eval::{
        evaluators::{Evaluator, EvaluatorKind},
        report::{Severity, SkipReason, Verdict, Violation, ViolationKind},
        scenario::TestCase,
    },
    timeline::Timeline,
    tools::{detect_shell_antipatterns, shell_command, ToolClass},
};

/// Flags shell commands that duplicate a dedicated tool.
#[derive(Debug, Clone, Copy, Default)]
pub struct ToolUsageEvaluator;

impl Evaluator for ToolUsageEvaluator {
    fn kind(&self) -> EvaluatorKind {
        EvaluatorKind::ToolUsage
    }

    fn evaluate(&self, timeline: &Timeline, case: &TestCase) -> Result<Verdict, EvaluatorError> {
        if timeline.tool_calls().next().is_none() {
            return Ok(Verdict::skipped(self.name(), SkipReason::Conversational));
        }

        let severity = if case.behavior.must_use_dedicated_tools {
            Severity::Error
        } else {
            Severity::Info
        };

        let mut violations = Vec::new();
        for (index, call) in timeline.tool_calls() {
            if call.class != ToolClass::Execute {
                continue;
            }
            let Some(command) = shell_command(&call.arguments) else {
                continue;
            };
            for found in detect_shell_antipatterns(command) {
                violations.push(
                    Violation::new(
                        ViolationKind::BashAntipattern,
                        severity,
                        format!(
                            "`{}` via {} duplicates the `{}` tool",
                            found.command, call.name, found.dedicated_tool
                        ),
                    )
                    .with_entry(index),
                );
            }
        }
        Ok(Verdict::from_violations(self.name(), violations))
    }
}
