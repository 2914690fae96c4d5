use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicU64, AtomicUsize, Ordering},
        Arc, Mutex, MutexGuard, PoisonError,
    },
    time::Duration,
};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::{
    sync::{mpsc, oneshot},
    task::JoinHandle,
};

use crate::{
    approval::ApprovalDecision,
    error::RuntimeError,
    runtime::{AgentRuntime, EventStream, RawEvent, RawEventKind},
};

/// Behavior of a [`ScriptedRuntime`]: one entry per prompt it will receive.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RuntimeScript {
    #[serde(default)]
    pub turns: Vec<ScriptedTurn>,
    /// When set, every `create_session` call fails with this message.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fail_session_creation: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ScriptedTurn {
    #[serde(default)]
    pub steps: Vec<ScriptedStep>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub latency_ms: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "step", rename_all = "snake_case")]
pub enum ScriptedStep {
    Text {
        text: String,
    },
    Tool {
        tool: String,
        #[serde(default)]
        arguments: Value,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        output: Option<Value>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
        #[serde(default)]
        requires_approval: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        risk: Option<String>,
        /// Run a gated tool without asking for approval first.
        #[serde(default)]
        skip_approval: bool,
        /// Run the tool even when the approval was denied.
        #[serde(default)]
        ignore_denial: bool,
    },
    Context {
        path: String,
    },
    Error {
        message: String,
    },
    /// Stop producing events without completing the turn.
    Stall,
    Disconnect {
        #[serde(default)]
        reason: Option<String>,
    },
    EndSession,
}

impl ScriptedStep {
    pub fn text(text: impl Into<String>) -> Self {
        ScriptedStep::Text { text: text.into() }
    }

    pub fn tool(tool: impl Into<String>, arguments: Value) -> Self {
        ScriptedStep::Tool {
            tool: tool.into(),
            arguments,
            output: None,
            error: None,
            requires_approval: false,
            risk: None,
            skip_approval: false,
            ignore_denial: false,
        }
    }

    pub fn gated_tool(tool: impl Into<String>, arguments: Value) -> Self {
        ScriptedStep::Tool {
            tool: tool.into(),
            arguments,
            output: None,
            error: None,
            requires_approval: true,
            risk: Some("high".to_string()),
            skip_approval: false,
            ignore_denial: false,
        }
    }
}

impl ScriptedTurn {
    pub fn new(steps: Vec<ScriptedStep>) -> Self {
        Self {
            steps,
            latency_ms: None,
        }
    }

    pub fn with_latency_ms(mut self, latency_ms: u64) -> Self {
        self.latency_ms = Some(latency_ms);
        self
    }
}

type EventSender = mpsc::UnboundedSender<Result<RawEvent, RuntimeError>>;
type EventReceiver = mpsc::UnboundedReceiver<Result<RawEvent, RuntimeError>>;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

struct ScriptedSession {
    sender: EventSender,
    receiver: Mutex<Option<EventReceiver>>,
    next_turn: AtomicUsize,
    next_id: AtomicU64,
    approvals: Mutex<HashMap<String, oneshot::Sender<ApprovalDecision>>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl ScriptedSession {
    fn emit(&self, kind: RawEventKind) {
        let _ = self.sender.send(Ok(RawEvent::new(kind)));
    }

    fn fail(&self, error: RuntimeError) {
        let _ = self.sender.send(Err(error));
    }

    fn next_id(&self, prefix: &str) -> String {
        format!("{prefix}-{}", self.next_id.fetch_add(1, Ordering::SeqCst) + 1)
    }
}

/// In-process runtime that plays a [`RuntimeScript`].
///
/// Gated tools emit an approval request and wait for the harness' answer
/// before (not) running, like a real host does.
pub struct ScriptedRuntime {
    script: RuntimeScript,
    sessions: Mutex<HashMap<String, Arc<ScriptedSession>>>,
    next_session: AtomicU64,
}

impl ScriptedRuntime {
    pub fn new(script: RuntimeScript) -> Self {
        Self {
            script,
            sessions: Mutex::new(HashMap::new()),
            next_session: AtomicU64::new(0),
        }
    }

    pub fn from_turns(turns: Vec<ScriptedTurn>) -> Self {
        Self::new(RuntimeScript {
            turns,
            fail_session_creation: None,
        })
    }

    /// Sessions created and not yet torn down.
    pub fn active_sessions(&self) -> usize {
        lock(&self.sessions).len()
    }

    fn session(&self, session_id: &str) -> Result<Arc<ScriptedSession>, RuntimeError> {
        lock(&self.sessions)
            .get(session_id)
            .cloned()
            .ok_or_else(|| RuntimeError::UnknownSession(session_id.to_string()))
    }
}

#[async_trait]
impl AgentRuntime for ScriptedRuntime {
    async fn create_session(&self, _agent: &str, _model: Option<&str>) -> Result<String, RuntimeError> {
        if let Some(reason) = &self.script.fail_session_creation {
            return Err(RuntimeError::SessionCreation(reason.clone()));
        }

        let id = format!("scripted-{}", self.next_session.fetch_add(1, Ordering::SeqCst) + 1);
        let (sender, receiver) = mpsc::unbounded_channel();
        let session = Arc::new(ScriptedSession {
            sender,
            receiver: Mutex::new(Some(receiver)),
            next_turn: AtomicUsize::new(0),
            next_id: AtomicU64::new(0),
            approvals: Mutex::new(HashMap::new()),
            tasks: Mutex::new(Vec::new()),
        });
        session.emit(RawEventKind::SessionStarted {
            session_id: id.clone(),
        });
        lock(&self.sessions).insert(id.clone(), session);
        Ok(id)
    }

    async fn subscribe(&self, session_id: &str) -> Result<EventStream, RuntimeError> {
        let session = self.session(session_id)?;
        let mut receiver = lock(&session.receiver)
            .take()
            .ok_or_else(|| RuntimeError::Transport(format!("{session_id} already has a subscriber")))?;

        let stream = async_stream::stream! {
            while let Some(item) = receiver.recv().await {
                let failed = item.is_err();
                yield item;
                if failed {
                    break;
                }
            }
        };
        Ok(Box::pin(stream))
    }

    async fn send_prompt(&self, session_id: &str, _text: &str) -> Result<(), RuntimeError> {
        let session = self.session(session_id)?;
        let index = session.next_turn.fetch_add(1, Ordering::SeqCst);
        let turn = self.script.turns.get(index).cloned();
        let handle = tokio::spawn(play_turn(Arc::clone(&session), index, turn));
        lock(&session.tasks).push(handle);
        Ok(())
    }

    async fn respond_approval(
        &self,
        session_id: &str,
        request_id: &str,
        decision: ApprovalDecision,
    ) -> Result<(), RuntimeError> {
        let session = self.session(session_id)?;
        let waiter = lock(&session.approvals)
            .remove(request_id)
            .ok_or_else(|| RuntimeError::UnknownApprovalRequest(request_id.to_string()))?;
        let _ = waiter.send(decision);
        Ok(())
    }

    async fn teardown(&self, session_id: &str) -> Result<(), RuntimeError> {
        let session = lock(&self.sessions)
            .remove(session_id)
            .ok_or_else(|| RuntimeError::UnknownSession(session_id.to_string()))?;
        for task in lock(&session.tasks).drain(..) {
            task.abort();
        }
        lock(&session.approvals).clear();
        Ok(())
    }

    fn name(&self) -> &'static str {
        "scripted"
    }
}

async fn play_turn(session: Arc<ScriptedSession>, index: usize, turn: Option<ScriptedTurn>) {
    let Some(turn) = turn else {
        session.emit(RawEventKind::Error {
            message: format!("no scripted turn for prompt #{index}"),
        });
        session.emit(RawEventKind::TurnCompleted);
        return;
    };

    if let Some(latency) = turn.latency_ms {
        tokio::time::sleep(Duration::from_millis(latency)).await;
    }

    for step in turn.steps {
        match step {
            ScriptedStep::Text { text } => session.emit(RawEventKind::TextDelta { text }),
            ScriptedStep::Context { path } => session.emit(RawEventKind::ContextLoaded { path }),
            ScriptedStep::Error { message } => session.emit(RawEventKind::Error { message }),
            ScriptedStep::Stall => return,
            ScriptedStep::Disconnect { reason } => {
                session.fail(RuntimeError::Disconnected(
                    reason.unwrap_or_else(|| "scripted disconnect".to_string()),
                ));
                return;
            }
            ScriptedStep::EndSession => {
                session.emit(RawEventKind::SessionEnded);
                return;
            }
            ScriptedStep::Tool {
                tool,
                arguments,
                output,
                error,
                requires_approval,
                risk,
                skip_approval,
                ignore_denial,
            } => {
                let call_id = session.next_id("call");

                if requires_approval && !skip_approval {
                    let request_id = session.next_id("approval");
                    let (waiter, decision) = oneshot::channel();
                    lock(&session.approvals).insert(request_id.clone(), waiter);
                    session.emit(RawEventKind::ApprovalRequested {
                        request_id,
                        call_id: Some(call_id.clone()),
                        tool: tool.clone(),
                        arguments: arguments.clone(),
                        risk: risk.clone(),
                    });

                    let Ok(decision) = decision.await else {
                        return;
                    };
                    if !decision.is_grant() && !ignore_denial {
                        continue;
                    }
                }

                session.emit(RawEventKind::ToolStarted {
                    call_id: call_id.clone(),
                    tool,
                    arguments,
                    requires_approval,
                    risk,
                });
                session.emit(RawEventKind::ToolFinished {
                    call_id,
                    output,
                    error,
                });
            }
        }
    }

    session.emit(RawEventKind::TurnCompleted);
}

#[cfg(test)]
mod tests {
    use futures_util::StreamExt;
    use serde_json::json;

    use super::*;

    async fn next_kind(stream: &mut EventStream) -> RawEventKind {
        stream
            .next()
            .await
            .expect("stream open")
            .expect("event")
            .kind
    }

    #[tokio::test]
    async fn plays_turns_in_order() {
        let runtime = ScriptedRuntime::from_turns(vec![ScriptedTurn::new(vec![
            ScriptedStep::tool("read", json!({ "filePath": "README.md" })),
            ScriptedStep::text("Done reading."),
        ])]);

        let id = runtime.create_session("coder", None).await.unwrap();
        let mut stream = runtime.subscribe(&id).await.unwrap();
        runtime.send_prompt(&id, "read the readme").await.unwrap();

        assert!(matches!(next_kind(&mut stream).await, RawEventKind::SessionStarted { .. }));
        assert!(matches!(next_kind(&mut stream).await, RawEventKind::ToolStarted { .. }));
        assert!(matches!(next_kind(&mut stream).await, RawEventKind::ToolFinished { .. }));
        assert!(matches!(next_kind(&mut stream).await, RawEventKind::TextDelta { .. }));
        assert_eq!(next_kind(&mut stream).await, RawEventKind::TurnCompleted);
    }

    #[tokio::test]
    async fn denied_tool_does_not_run() {
        let runtime = ScriptedRuntime::from_turns(vec![ScriptedTurn::new(vec![
            ScriptedStep::gated_tool("bash", json!({ "command": "rm -rf target" })),
        ])]);

        let id = runtime.create_session("coder", None).await.unwrap();
        let mut stream = runtime.subscribe(&id).await.unwrap();
        runtime.send_prompt(&id, "clean up").await.unwrap();

        next_kind(&mut stream).await;
        let request_id = match next_kind(&mut stream).await {
            RawEventKind::ApprovalRequested { request_id, .. } => request_id,
            other => panic!("expected approval request, got {other:?}"),
        };
        runtime
            .respond_approval(&id, &request_id, ApprovalDecision::Deny)
            .await
            .unwrap();
        assert_eq!(next_kind(&mut stream).await, RawEventKind::TurnCompleted);
    }

    #[tokio::test]
    async fn teardown_releases_session() {
        let runtime = ScriptedRuntime::from_turns(vec![ScriptedTurn::new(vec![ScriptedStep::Stall])]);
        let id = runtime.create_session("coder", None).await.unwrap();
        assert_eq!(runtime.active_sessions(), 1);
        runtime.teardown(&id).await.unwrap();
        assert_eq!(runtime.active_sessions(), 0);
        assert!(matches!(
            runtime.send_prompt(&id, "hi").await,
            Err(RuntimeError::UnknownSession(_))
        ));
    }

    #[tokio::test]
    async fn creation_failure_is_reported() {
        let runtime = ScriptedRuntime::new(RuntimeScript {
            turns: Vec::new(),
            fail_session_creation: Some("agent not installed".to_string()),
        });
        let err = runtime.create_session("coder", None).await.unwrap_err();
        assert_eq!(err, RuntimeError::SessionCreation("agent not installed".to_string()));
    }
}
