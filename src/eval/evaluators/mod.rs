//! Independent checks over a finished [`Timeline`].
//!
//! Every evaluator reads the same immutable timeline and test case and
//! returns one [`Verdict`]. The set is closed: [`EvaluatorKind`] names every
//! registered evaluator and [`EvaluatorRunner::default_set`] builds them.

use std::panic::{catch_unwind, AssertUnwindSafe};

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::{
    config::HarnessConfig,
    error::EvaluatorError,
    eval::{
        report::{SkipReason, Verdict, Violation, ViolationKind},
        scenario::TestCase,
    },
    timeline::Timeline,
};

pub mod approval_gate;
pub mod behavior;
pub mod context_loading;
pub mod execution_balance;
pub mod response;
pub mod tool_usage;

pub use approval_gate::ApprovalGateEvaluator;
pub use behavior::BehaviorEvaluator;
pub use context_loading::{
    ContextLoadingEvaluator, ExplicitContextStrategy, HeuristicContextStrategy, InferredContext,
};
pub use execution_balance::ExecutionBalanceEvaluator;
pub use response::ResponseEvaluator;
pub use tool_usage::ToolUsageEvaluator;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "kebab-case")]
pub enum EvaluatorKind {
    ContextLoading,
    ToolUsage,
    ApprovalGate,
    Behavior,
    ExecutionBalance,
    Response,
}

impl EvaluatorKind {
    pub const ALL: [EvaluatorKind; 6] = [
        EvaluatorKind::ContextLoading,
        EvaluatorKind::ToolUsage,
        EvaluatorKind::ApprovalGate,
        EvaluatorKind::Behavior,
        EvaluatorKind::ExecutionBalance,
        EvaluatorKind::Response,
    ];

    pub fn name(self) -> &'static str {
        match self {
            EvaluatorKind::ContextLoading => "context-loading",
            EvaluatorKind::ToolUsage => "tool-usage",
            EvaluatorKind::ApprovalGate => "approval-gate",
            EvaluatorKind::Behavior => "behavior",
            EvaluatorKind::ExecutionBalance => "execution-balance",
            EvaluatorKind::Response => "response",
        }
    }
}

impl std::fmt::Display for EvaluatorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

pub trait Evaluator: Send + Sync {
    fn kind(&self) -> EvaluatorKind;

    fn name(&self) -> &'static str {
        self.kind().name()
    }

    fn evaluate(&self, timeline: &Timeline, case: &TestCase) -> Result<Verdict, EvaluatorError>;
}

/// Runs a list of evaluators in isolation from one another.
pub struct EvaluatorRunner {
    evaluators: Vec<Box<dyn Evaluator>>,
}

impl Default for EvaluatorRunner {
    fn default() -> Self {
        Self::default_set(&HarnessConfig::default())
    }
}

impl EvaluatorRunner {
    pub fn new() -> Self {
        Self {
            evaluators: Vec::new(),
        }
    }

    /// Every registered evaluator, configured from the harness config.
    pub fn default_set(config: &HarnessConfig) -> Self {
        Self::new()
            .with_evaluator(ContextLoadingEvaluator::from_config(config))
            .with_evaluator(ToolUsageEvaluator)
            .with_evaluator(ApprovalGateEvaluator)
            .with_evaluator(BehaviorEvaluator)
            .with_evaluator(ExecutionBalanceEvaluator::new(config.balance))
            .with_evaluator(ResponseEvaluator)
    }

    pub fn with_evaluator(mut self, evaluator: impl Evaluator + 'static) -> Self {
        self.evaluators.push(Box::new(evaluator));
        self
    }

    pub fn len(&self) -> usize {
        self.evaluators.len()
    }

    pub fn is_empty(&self) -> bool {
        self.evaluators.is_empty()
    }

    /// One verdict per evaluator, in registration order.
    ///
    /// An evaluator that errors or panics yields a failing verdict; the
    /// others still run.
    pub fn run(&self, timeline: &Timeline, case: &TestCase) -> Vec<Verdict> {
        self.evaluators
            .iter()
            .map(|evaluator| {
                if !case.runs(evaluator.kind()) {
                    return Verdict::skipped(evaluator.name(), SkipReason::NotSelected);
                }
                match catch_unwind(AssertUnwindSafe(|| evaluator.evaluate(timeline, case))) {
                    Ok(Ok(verdict)) => verdict,
                    Ok(Err(err)) => {
                        warn!(case = %case.id, evaluator = evaluator.name(), error = %err, "evaluator failed");
                        evaluator_error(evaluator.name(), err.to_string())
                    }
                    Err(panic) => {
                        let message = panic_message(panic.as_ref());
                        warn!(case = %case.id, evaluator = evaluator.name(), %message, "evaluator panicked");
                        evaluator_error(evaluator.name(), format!("evaluator panicked: {message}"))
                    }
                }
            })
            .collect()
    }

    /// Verdicts for a run that never produced a judgeable timeline.
    pub fn skip_all(&self, case: &TestCase, reason: SkipReason) -> Vec<Verdict> {
        self.evaluators
            .iter()
            .map(|evaluator| {
                let reason = if case.runs(evaluator.kind()) {
                    reason
                } else {
                    SkipReason::NotSelected
                };
                Verdict::skipped(evaluator.name(), reason)
            })
            .collect()
    }
}

fn evaluator_error(name: &str, message: String) -> Verdict {
    Verdict::from_violations(name, vec![Violation::error(ViolationKind::EvaluatorError, message)])
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}
