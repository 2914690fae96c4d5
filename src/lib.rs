pub mod approval;
pub mod config;
pub mod error;
pub mod eval;
pub mod runtime;
pub mod timeline;
pub mod tools;

pub use approval::{
    ApprovalDecision, ApprovalError, ApprovalMode, ApprovalRequest, ApprovalResolver, ApprovalStrategy,
};
pub use config::{BalanceBand, ContextConfig, ContextRule, HarnessConfig};
pub use error::{EvalError, EvaluatorError, RuntimeError};
pub use eval::{
    evaluators::{Evaluator, EvaluatorKind, EvaluatorRunner},
    executor::{SessionHandle, SessionRecord, TestExecutor},
    report::{
        Applicability, EvalReport, EvaluationResult, Evidence, RunStatus, Severity, SkipReason, Verdict,
        Violation, ViolationKind,
    },
    runner::TestRunner,
    scenario::{
        load_cases, load_event_log, parse_event_log, BehaviorExpectation, CaseError, CaseFile, ExpectedOutcome,
        Prompt, TestCase,
    },
};
pub use runtime::{
    scripted::{RuntimeScript, ScriptedRuntime, ScriptedStep, ScriptedTurn},
    AgentRuntime, EventStream, RawEvent, RawEventKind,
};
pub use timeline::{Anomaly, Timeline, TimelineBuilder, TimelineEntry};
pub use tools::{ToolCatalog, ToolClass};
