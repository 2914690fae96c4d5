use std::pin::Pin;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures_core::Stream;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{approval::ApprovalDecision, error::RuntimeError};

pub mod scripted;

pub type EventStream = Pin<Box<dyn Stream<Item = Result<RawEvent, RuntimeError>> + Send>>;

/// One record of a session's event feed, in the order the runtime emitted it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawEvent {
    pub at: DateTime<Utc>,
    #[serde(flatten)]
    pub kind: RawEventKind,
}

impl RawEvent {
    pub fn new(kind: RawEventKind) -> Self {
        Self { at: Utc::now(), kind }
    }

    pub fn at(at: DateTime<Utc>, kind: RawEventKind) -> Self {
        Self { at, kind }
    }

    pub fn tag(&self) -> &'static str {
        self.kind.tag()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RawEventKind {
    SessionStarted {
        session_id: String,
    },
    /// Recorded by the executor right before a prompt is sent.
    TurnStarted {
        turn: usize,
        #[serde(default)]
        prompt: String,
    },
    ToolStarted {
        call_id: String,
        tool: String,
        #[serde(default)]
        arguments: Value,
        #[serde(default)]
        requires_approval: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        risk: Option<String>,
    },
    ToolFinished {
        call_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        output: Option<Value>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
    ApprovalRequested {
        request_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        call_id: Option<String>,
        tool: String,
        #[serde(default)]
        arguments: Value,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        risk: Option<String>,
    },
    /// Recorded by the executor when it answers a request.
    ApprovalResolved {
        request_id: String,
        decision: ApprovalDecision,
    },
    ContextLoaded {
        path: String,
    },
    TextDelta {
        text: String,
    },
    TurnCompleted,
    Error {
        message: String,
    },
    SessionEnded,
}

impl RawEventKind {
    pub fn tag(&self) -> &'static str {
        match self {
            RawEventKind::SessionStarted { .. } => "session_started",
            RawEventKind::TurnStarted { .. } => "turn_started",
            RawEventKind::ToolStarted { .. } => "tool_started",
            RawEventKind::ToolFinished { .. } => "tool_finished",
            RawEventKind::ApprovalRequested { .. } => "approval_requested",
            RawEventKind::ApprovalResolved { .. } => "approval_resolved",
            RawEventKind::ContextLoaded { .. } => "context_loaded",
            RawEventKind::TextDelta { .. } => "text_delta",
            RawEventKind::TurnCompleted => "turn_completed",
            RawEventKind::Error { .. } => "error",
            RawEventKind::SessionEnded => "session_ended",
        }
    }
}

/// Host runtime that runs the agent under test.
///
/// The harness only relies on this surface; wire formats stay behind the
/// implementation.
#[async_trait]
pub trait AgentRuntime: Send + Sync {
    async fn create_session(&self, agent: &str, model: Option<&str>) -> Result<String, RuntimeError>;

    /// Events of the session in arrival order. Called once per session.
    async fn subscribe(&self, session_id: &str) -> Result<EventStream, RuntimeError>;

    async fn send_prompt(&self, session_id: &str, text: &str) -> Result<(), RuntimeError>;

    async fn respond_approval(
        &self,
        session_id: &str,
        request_id: &str,
        decision: ApprovalDecision,
    ) -> Result<(), RuntimeError>;

    async fn teardown(&self, session_id: &str) -> Result<(), RuntimeError>;

    fn name(&self) -> &'static str;
}
