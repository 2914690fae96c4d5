//! Drives one test case through a live [`AgentRuntime`] session and records
//! the raw event log.

use std::{sync::Arc, time::Duration};

use futures_util::StreamExt;
use tokio::{
    task::{JoinError, JoinSet},
    time::{sleep, sleep_until, timeout_at, Instant},
};
use tracing::{debug, info, warn};

use crate::{
    approval::{ApprovalDecision, ApprovalError, ApprovalRequest, ApprovalResolver},
    config::HarnessConfig,
    error::{EvalError, RuntimeError},
    eval::{
        report::RunStatus,
        scenario::{Prompt, TestCase},
    },
    runtime::{AgentRuntime, EventStream, RawEvent, RawEventKind},
};

/// Upper bound on a single teardown call.
const TEARDOWN_TIMEOUT: Duration = Duration::from_secs(5);

/// Owns a runtime session for the duration of one run.
///
/// Call [`SessionHandle::close`] when done. A handle dropped without being
/// closed (for example because the owning future was cancelled) spawns the
/// teardown on the current tokio runtime.
pub struct SessionHandle {
    runtime: Arc<dyn AgentRuntime>,
    id: String,
    closed: bool,
}

impl SessionHandle {
    pub async fn open(
        runtime: Arc<dyn AgentRuntime>,
        agent: &str,
        model: Option<&str>,
    ) -> Result<Self, RuntimeError> {
        let id = runtime.create_session(agent, model).await?;
        Ok(Self {
            runtime,
            id,
            closed: false,
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub async fn close(mut self) -> Result<(), RuntimeError> {
        self.closed = true;
        self.runtime.teardown(&self.id).await
    }
}

impl Drop for SessionHandle {
    fn drop(&mut self) {
        if self.closed {
            return;
        }
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            warn!(session = %self.id, "session dropped outside a tokio runtime; teardown skipped");
            return;
        };
        let runtime = Arc::clone(&self.runtime);
        let id = std::mem::take(&mut self.id);
        handle.spawn(async move {
            match tokio::time::timeout(TEARDOWN_TIMEOUT, runtime.teardown(&id)).await {
                Ok(Ok(())) => {}
                Ok(Err(err)) => warn!(session = %id, error = %err, "teardown after drop failed"),
                Err(_) => warn!(session = %id, "teardown after drop timed out"),
            }
        });
    }
}

/// Everything the executor observed for one run.
#[derive(Debug, Clone)]
pub struct SessionRecord {
    pub session_id: Option<String>,
    pub events: Vec<RawEvent>,
    pub status: RunStatus,
    pub errors: Vec<String>,
    pub duration: Duration,
}

impl SessionRecord {
    fn without_session(status: RunStatus, errors: Vec<String>, duration: Duration) -> Self {
        Self {
            session_id: None,
            events: Vec::new(),
            status,
            errors,
            duration,
        }
    }

    pub fn duration_ms(&self) -> u64 {
        u64::try_from(self.duration.as_millis()).unwrap_or(u64::MAX)
    }
}

/// Why the collection loop stopped.
#[derive(Debug)]
enum Pump {
    TurnDone,
    Woken,
    Ended,
    Closed,
    TimedOut,
    Failed(RuntimeError),
    Aborted(ApprovalError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Until {
    TurnEnd,
    Instant(Instant),
}

enum Signal {
    Deadline,
    Timer,
    Delayed(Option<Result<(String, ApprovalDecision), JoinError>>),
    Event(Option<Result<RawEvent, RuntimeError>>),
}

struct Collector {
    runtime: Arc<dyn AgentRuntime>,
    session_id: String,
    stream: EventStream,
    events: Vec<RawEvent>,
    resolver: ApprovalResolver,
    delay: Option<Duration>,
    delayed: JoinSet<(String, ApprovalDecision)>,
    deadline: Instant,
}

impl Collector {
    async fn drive(&mut self, prompts: &[Prompt]) -> Pump {
        for (turn, prompt) in prompts.iter().enumerate() {
            if let Some(delay) = prompt.delay() {
                match self.pump(Until::Instant(Instant::now() + delay)).await {
                    Pump::Woken => {}
                    other => return other,
                }
            }

            self.events.push(RawEvent::new(RawEventKind::TurnStarted {
                turn,
                prompt: prompt.text.clone(),
            }));
            debug!(session = %self.session_id, turn, "sending prompt");
            let send = self.runtime.send_prompt(&self.session_id, &prompt.text);
            match timeout_at(self.deadline, send).await {
                Err(_) => return Pump::TimedOut,
                Ok(Err(err)) => return Pump::Failed(err),
                Ok(Ok(())) => {}
            }

            match self.pump(Until::TurnEnd).await {
                Pump::TurnDone => {}
                other @ (Pump::Ended | Pump::Closed) => {
                    if turn + 1 < prompts.len() {
                        warn!(
                            session = %self.session_id,
                            turn,
                            remaining = prompts.len() - turn - 1,
                            "session ended before all prompts were sent"
                        );
                    }
                    return other;
                }
                other => return other,
            }
        }
        Pump::TurnDone
    }

    async fn pump(&mut self, until: Until) -> Pump {
        let wake = match until {
            Until::TurnEnd => None,
            Until::Instant(at) => Some(at),
        };

        loop {
            let signal = tokio::select! {
                biased;
                _ = sleep_until(self.deadline) => Signal::Deadline,
                _ = sleep_until(wake.unwrap_or(self.deadline)), if wake.is_some() => Signal::Timer,
                joined = self.delayed.join_next(), if !self.delayed.is_empty() => Signal::Delayed(joined),
                item = self.stream.next() => Signal::Event(item),
            };

            match signal {
                Signal::Deadline => return Pump::TimedOut,
                Signal::Timer => return Pump::Woken,
                Signal::Delayed(Some(Ok((request_id, decision)))) => {
                    if let Err(outcome) = self.deliver(request_id, decision).await {
                        return outcome;
                    }
                }
                Signal::Delayed(Some(Err(err))) => {
                    warn!(session = %self.session_id, error = %err, "delayed approval task failed");
                }
                Signal::Delayed(None) => {}
                Signal::Event(None) => return Pump::Closed,
                Signal::Event(Some(Err(err))) => return Pump::Failed(err),
                Signal::Event(Some(Ok(event))) => {
                    let request = match &event.kind {
                        RawEventKind::ApprovalRequested {
                            request_id,
                            tool,
                            arguments,
                            risk,
                            ..
                        } => Some(ApprovalRequest {
                            request_id: request_id.clone(),
                            tool: tool.clone(),
                            arguments: arguments.clone(),
                            risk: risk.clone(),
                        }),
                        _ => None,
                    };
                    let turn_done = until == Until::TurnEnd && event.kind == RawEventKind::TurnCompleted;
                    let ended = event.kind == RawEventKind::SessionEnded;
                    self.events.push(event);

                    if let Some(request) = request {
                        if let Err(outcome) = self.answer(request).await {
                            return outcome;
                        }
                    }
                    if ended {
                        return Pump::Ended;
                    }
                    if turn_done {
                        return Pump::TurnDone;
                    }
                }
            }
        }
    }

    async fn answer(&mut self, request: ApprovalRequest) -> Result<(), Pump> {
        let decision = self.resolver.resolve(&request).map_err(Pump::Aborted)?;
        info!(
            session = %self.session_id,
            request_id = %request.request_id,
            tool = %request.tool,
            %decision,
            "approval decided"
        );
        match self.delay {
            Some(delay) => {
                let request_id = request.request_id;
                self.delayed.spawn(async move {
                    sleep(delay).await;
                    (request_id, decision)
                });
                Ok(())
            }
            None => self.deliver(request.request_id, decision).await,
        }
    }

    /// Logs the resolution, then hands it to the runtime before the deadline.
    async fn deliver(&mut self, request_id: String, decision: ApprovalDecision) -> Result<(), Pump> {
        self.events.push(RawEvent::new(RawEventKind::ApprovalResolved {
            request_id: request_id.clone(),
            decision,
        }));
        let respond = self.runtime.respond_approval(&self.session_id, &request_id, decision);
        match timeout_at(self.deadline, respond).await {
            Err(_) => Err(Pump::TimedOut),
            Ok(Err(err)) => Err(Pump::Failed(err)),
            Ok(Ok(())) => Ok(()),
        }
    }
}

/// Runs test cases against a runtime, one isolated session per case.
#[derive(Clone)]
pub struct TestExecutor {
    runtime: Arc<dyn AgentRuntime>,
    config: Arc<HarnessConfig>,
}

impl TestExecutor {
    pub fn new(runtime: Arc<dyn AgentRuntime>, config: Arc<HarnessConfig>) -> Self {
        Self { runtime, config }
    }

    pub fn runtime(&self) -> &Arc<dyn AgentRuntime> {
        &self.runtime
    }

    /// Plays the prompts of `case` and collects events until the last turn
    /// completes, the session ends, or the deadline passes.
    ///
    /// Runtime failures and timeouts are reported in the record. Only a
    /// misconfigured approval script is an `Err`; the session is torn down
    /// first.
    pub async fn execute(&self, case: &TestCase) -> Result<SessionRecord, EvalError> {
        let started = Instant::now();
        let deadline = started + case.timeout(self.config.default_timeout());
        let model = case.model.as_deref().or(self.config.model.as_deref());

        let opened = timeout_at(
            deadline,
            SessionHandle::open(Arc::clone(&self.runtime), &case.agent, model),
        )
        .await;
        let handle = match opened {
            Ok(Ok(handle)) => handle,
            Ok(Err(err)) => {
                warn!(case = %case.id, runtime = self.runtime.name(), error = %err, "could not open session");
                return Ok(SessionRecord::without_session(
                    RunStatus::RuntimeError,
                    vec![err.to_string()],
                    started.elapsed(),
                ));
            }
            Err(_) => {
                warn!(case = %case.id, "timed out opening session");
                return Ok(SessionRecord::without_session(
                    RunStatus::TimedOut,
                    Vec::new(),
                    started.elapsed(),
                ));
            }
        };
        let session_id = handle.id().to_string();
        info!(case = %case.id, session = %session_id, runtime = self.runtime.name(), "session opened");

        let stream = match timeout_at(deadline, self.runtime.subscribe(&session_id)).await {
            Ok(Ok(stream)) => stream,
            Err(_) => {
                warn!(case = %case.id, session = %session_id, "timed out subscribing to session");
                close(handle).await;
                return Ok(SessionRecord {
                    session_id: Some(session_id),
                    events: Vec::new(),
                    status: RunStatus::TimedOut,
                    errors: Vec::new(),
                    duration: started.elapsed(),
                });
            }
            Ok(Err(err)) => {
                warn!(case = %case.id, session = %session_id, error = %err, "could not subscribe to session");
                close(handle).await;
                return Ok(SessionRecord {
                    session_id: Some(session_id),
                    events: Vec::new(),
                    status: RunStatus::RuntimeError,
                    errors: vec![err.to_string()],
                    duration: started.elapsed(),
                });
            }
        };

        let mut collector = Collector {
            runtime: Arc::clone(&self.runtime),
            session_id: session_id.clone(),
            stream,
            events: Vec::new(),
            resolver: case.approval.resolver(),
            delay: case.approval.delay(),
            delayed: JoinSet::new(),
            deadline,
        };
        let outcome = collector.drive(&case.prompts).await;
        let events = std::mem::take(&mut collector.events);
        drop(collector);
        close(handle).await;

        let (status, errors) = match outcome {
            Pump::Aborted(source) => {
                warn!(case = %case.id, session = %session_id, error = %source, "approval script exhausted");
                return Err(EvalError::Approval {
                    case: case.id.clone(),
                    source,
                });
            }
            Pump::TimedOut => {
                warn!(case = %case.id, session = %session_id, events = events.len(), "timed out");
                (RunStatus::TimedOut, Vec::new())
            }
            Pump::Failed(err) => {
                warn!(case = %case.id, session = %session_id, error = %err, "runtime failure");
                (RunStatus::RuntimeError, vec![err.to_string()])
            }
            Pump::TurnDone | Pump::Woken | Pump::Ended | Pump::Closed => (RunStatus::Completed, Vec::new()),
        };

        Ok(SessionRecord {
            session_id: Some(session_id),
            events,
            status,
            errors,
            duration: started.elapsed(),
        })
    }
}

async fn close(handle: SessionHandle) {
    let id = handle.id().to_string();
    match tokio::time::timeout(TEARDOWN_TIMEOUT, handle.close()).await {
        Ok(Ok(())) => debug!(session = %id, "session closed"),
        Ok(Err(err)) => warn!(session = %id, error = %err, "teardown failed"),
        Err(_) => warn!(session = %id, timeout_ms = TEARDOWN_TIMEOUT.as_millis() as u64, "teardown timed out"),
    }
}
