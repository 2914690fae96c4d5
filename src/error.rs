use thiserror::Error;

use crate::{approval::ApprovalError, eval::scenario::CaseError};

/// Errors that stop a test before or instead of producing an evaluation result.
///
/// Runtime failures and timeouts are not represented here: they end up inside
/// the [`EvaluationResult`](crate::eval::report::EvaluationResult) instead.
#[derive(Debug, Error)]
pub enum EvalError {
    #[error("invalid test case `{case}`: {source}")]
    InvalidCase {
        case: String,
        #[source]
        source: CaseError,
    },

    #[error("approval strategy misconfigured for `{case}`: {source}")]
    Approval {
        case: String,
        #[source]
        source: ApprovalError,
    },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("failed to parse YAML: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("invalid event log line {line}: {message}")]
    EventLog { line: usize, message: String },
}

/// Failures reported by an [`AgentRuntime`](crate::runtime::AgentRuntime).
#[derive(Debug, Clone, Error, PartialEq)]
pub enum RuntimeError {
    #[error("session creation failed: {0}")]
    SessionCreation(String),

    #[error("unknown session: {0}")]
    UnknownSession(String),

    #[error("unknown approval request: {0}")]
    UnknownApprovalRequest(String),

    #[error("event stream disconnected: {0}")]
    Disconnected(String),

    #[error("runtime transport error: {0}")]
    Transport(String),
}

/// Internal failure of a single evaluator. Isolated by the evaluator runner.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum EvaluatorError {
    #[error("malformed timeline entry #{index}: {reason}")]
    MalformedEntry { index: usize, reason: String },

    #[error("invalid evaluator configuration: {0}")]
    Configuration(String),
}
