//! Ordered, typed reconstruction of a session's raw event feed.
//!
//! [`TimelineBuilder`] is a single forward pass: it never looks ahead, so the
//! same code reduces a live stream event by event or replays a finished log.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{
    approval::ApprovalDecision,
    config::HarnessConfig,
    runtime::{RawEvent, RawEventKind},
    tools::{path_matches, target_path, ToolCatalog, ToolClass},
};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCall {
    pub call_id: String,
    pub name: String,
    pub class: ToolClass,
    pub arguments: Value,
    pub turn: usize,
    /// Arrival position of the `tool_started` event in the raw feed.
    #[serde(default)]
    pub position: usize,
    pub started_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ended_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub requires_approval: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub risk: Option<String>,
    /// Entry index of the approval that gated this call.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub approval: Option<usize>,
}

impl ToolCall {
    pub fn path(&self) -> Option<&str> {
        target_path(&self.arguments)
    }

    pub fn is_named(&self, name: &str) -> bool {
        self.name.eq_ignore_ascii_case(name)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApprovalEvent {
    pub request_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub call_id: Option<String>,
    pub tool: String,
    pub turn: usize,
    pub requested_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resolution: Option<ApprovalDecision>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resolved_at: Option<DateTime<Utc>>,
    /// Arrival position of the resolution in the raw feed. Timestamps come
    /// from two clocks, so ordering against tool calls uses this instead.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resolved_position: Option<usize>,
    /// Entry index of the tool call this approval gated.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_call: Option<usize>,
}

impl ApprovalEvent {
    pub fn latency_ms(&self) -> Option<i64> {
        self.resolved_at
            .map(|resolved| (resolved - self.requested_at).num_milliseconds())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContextLoad {
    pub path: String,
    pub turn: usize,
    pub at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_call: Option<usize>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TextOutput {
    pub turn: usize,
    pub content: String,
    pub at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionError {
    pub turn: usize,
    pub message: String,
    pub at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "entry", rename_all = "snake_case")]
pub enum TimelineEntry {
    ToolCall(ToolCall),
    ApprovalEvent(ApprovalEvent),
    ContextLoad(ContextLoad),
    TextOutput(TextOutput),
    Error(SessionError),
}

impl TimelineEntry {
    pub fn at(&self) -> DateTime<Utc> {
        match self {
            TimelineEntry::ToolCall(call) => call.started_at,
            TimelineEntry::ApprovalEvent(approval) => approval.requested_at,
            TimelineEntry::ContextLoad(load) => load.at,
            TimelineEntry::TextOutput(text) => text.at,
            TimelineEntry::Error(error) => error.at,
        }
    }

    pub fn turn(&self) -> usize {
        match self {
            TimelineEntry::ToolCall(call) => call.turn,
            TimelineEntry::ApprovalEvent(approval) => approval.turn,
            TimelineEntry::ContextLoad(load) => load.turn,
            TimelineEntry::TextOutput(text) => text.turn,
            TimelineEntry::Error(error) => error.turn,
        }
    }
}

/// Irregularities in the raw feed. Recorded, never fatal.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "anomaly", rename_all = "snake_case")]
pub enum Anomaly {
    DanglingToolResult { call_id: String, position: usize },
    DuplicateToolStart { call_id: String, position: usize },
    DuplicateToolResult { call_id: String, position: usize },
    DuplicateApprovalRequest { request_id: String, position: usize },
    UnmatchedApprovalResolution { request_id: String, position: usize },
    DuplicateApprovalResolution { request_id: String, position: usize },
    OutOfOrderTimestamp { position: usize },
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Timeline {
    pub entries: Vec<TimelineEntry>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub anomalies: Vec<Anomaly>,
}

impl Timeline {
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<&TimelineEntry> {
        self.entries.get(index)
    }

    pub fn tool_calls(&self) -> impl Iterator<Item = (usize, &ToolCall)> {
        self.entries.iter().enumerate().filter_map(|(i, entry)| match entry {
            TimelineEntry::ToolCall(call) => Some((i, call)),
            _ => None,
        })
    }

    pub fn approvals(&self) -> impl Iterator<Item = (usize, &ApprovalEvent)> {
        self.entries.iter().enumerate().filter_map(|(i, entry)| match entry {
            TimelineEntry::ApprovalEvent(approval) => Some((i, approval)),
            _ => None,
        })
    }

    pub fn context_loads(&self) -> impl Iterator<Item = (usize, &ContextLoad)> {
        self.entries.iter().enumerate().filter_map(|(i, entry)| match entry {
            TimelineEntry::ContextLoad(load) => Some((i, load)),
            _ => None,
        })
    }

    pub fn text_outputs(&self) -> impl Iterator<Item = (usize, &TextOutput)> {
        self.entries.iter().enumerate().filter_map(|(i, entry)| match entry {
            TimelineEntry::TextOutput(text) => Some((i, text)),
            _ => None,
        })
    }

    pub fn first_code_producing_call(&self) -> Option<(usize, &ToolCall)> {
        self.tool_calls().find(|(_, call)| call.class.is_code_producing())
    }

    /// Text the agent produced in its last answering turn.
    pub fn final_text(&self) -> Option<&str> {
        self.text_outputs()
            .max_by_key(|(i, text)| (text.turn, *i))
            .map(|(_, text)| text.content.as_str())
    }
}

/// Reduces raw events to a [`Timeline`].
pub struct TimelineBuilder {
    catalog: ToolCatalog,
    context_markers: Vec<String>,
    timeline: Timeline,
    turn: usize,
    position: usize,
    last_at: Option<DateTime<Utc>>,
    calls: HashMap<String, usize>,
    approvals: HashMap<String, usize>,
    approvals_by_call: HashMap<String, usize>,
    unlinked_approvals: Vec<usize>,
    text_by_turn: HashMap<usize, usize>,
}

impl TimelineBuilder {
    pub fn new(catalog: ToolCatalog, context_markers: Vec<String>) -> Self {
        Self {
            catalog,
            context_markers,
            timeline: Timeline::default(),
            turn: 0,
            position: 0,
            last_at: None,
            calls: HashMap::new(),
            approvals: HashMap::new(),
            approvals_by_call: HashMap::new(),
            unlinked_approvals: Vec::new(),
            text_by_turn: HashMap::new(),
        }
    }

    pub fn from_config(config: &HarnessConfig) -> Self {
        Self::new(config.tools.clone(), config.context.markers.clone())
    }

    /// Builds a timeline from a complete log.
    pub fn build<'a>(mut self, events: impl IntoIterator<Item = &'a RawEvent>) -> Timeline {
        for event in events {
            self.push(event);
        }
        self.finish()
    }

    pub fn finish(self) -> Timeline {
        self.timeline
    }

    /// Current state of the reduction; usable while a session is still live.
    pub fn snapshot(&self) -> &Timeline {
        &self.timeline
    }

    pub fn push(&mut self, event: &RawEvent) {
        let position = self.position;
        self.position += 1;

        match self.last_at {
            Some(last) if event.at < last => {
                self.timeline
                    .anomalies
                    .push(Anomaly::OutOfOrderTimestamp { position });
            }
            _ => self.last_at = Some(event.at),
        }

        match &event.kind {
            RawEventKind::SessionStarted { .. }
            | RawEventKind::TurnCompleted
            | RawEventKind::SessionEnded => {}
            RawEventKind::TurnStarted { turn, .. } => self.turn = *turn,
            RawEventKind::ToolStarted {
                call_id,
                tool,
                arguments,
                requires_approval,
                risk,
            } => self.on_tool_started(position, event.at, call_id, tool, arguments, *requires_approval, risk),
            RawEventKind::ToolFinished {
                call_id,
                output,
                error,
            } => self.on_tool_finished(position, event.at, call_id, output, error),
            RawEventKind::ApprovalRequested {
                request_id,
                call_id,
                tool,
                ..
            } => self.on_approval_requested(position, event.at, request_id, call_id, tool),
            RawEventKind::ApprovalResolved {
                request_id,
                decision,
            } => self.on_approval_resolved(position, event.at, request_id, *decision),
            RawEventKind::ContextLoaded { path } => {
                self.timeline.entries.push(TimelineEntry::ContextLoad(ContextLoad {
                    path: path.clone(),
                    turn: self.turn,
                    at: event.at,
                    source_call: None,
                }));
            }
            RawEventKind::TextDelta { text } => self.on_text(event.at, text),
            RawEventKind::Error { message } => {
                self.timeline.entries.push(TimelineEntry::Error(SessionError {
                    turn: self.turn,
                    message: message.clone(),
                    at: event.at,
                }));
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn on_tool_started(
        &mut self,
        position: usize,
        at: DateTime<Utc>,
        call_id: &str,
        tool: &str,
        arguments: &Value,
        requires_approval: bool,
        risk: &Option<String>,
    ) {
        if self.calls.contains_key(call_id) {
            self.timeline.anomalies.push(Anomaly::DuplicateToolStart {
                call_id: call_id.to_string(),
                position,
            });
            return;
        }

        let index = self.timeline.entries.len();
        let approval = self.take_approval_for(call_id, tool);
        if let Some(approval_index) = approval {
            if let Some(TimelineEntry::ApprovalEvent(event)) =
                self.timeline.entries.get_mut(approval_index)
            {
                event.tool_call = Some(index);
            }
        }

        let class = self.catalog.classify(tool);
        let call = ToolCall {
            call_id: call_id.to_string(),
            name: tool.to_string(),
            class,
            arguments: arguments.clone(),
            turn: self.turn,
            position,
            started_at: at,
            ended_at: None,
            output: None,
            error: None,
            requires_approval: requires_approval || self.catalog.requires_approval(tool),
            risk: risk.clone(),
            approval,
        };
        let context_path = (class == ToolClass::Read)
            .then(|| call.path())
            .flatten()
            .filter(|path| self.is_context_path(path))
            .map(str::to_string);

        self.calls.insert(call_id.to_string(), index);
        self.timeline.entries.push(TimelineEntry::ToolCall(call));

        if let Some(path) = context_path {
            self.timeline.entries.push(TimelineEntry::ContextLoad(ContextLoad {
                path,
                turn: self.turn,
                at,
                source_call: Some(index),
            }));
        }
    }

    fn take_approval_for(&mut self, call_id: &str, tool: &str) -> Option<usize> {
        if let Some(index) = self.approvals_by_call.remove(call_id) {
            return Some(index);
        }
        // Requests without a call id gate the next call of the same tool;
        // the most recent one wins.
        let slot = self.unlinked_approvals.iter().rposition(|index| {
            matches!(
                self.timeline.entries.get(*index),
                Some(TimelineEntry::ApprovalEvent(approval)) if approval.tool.eq_ignore_ascii_case(tool)
            )
        })?;
        Some(self.unlinked_approvals.remove(slot))
    }

    fn on_tool_finished(
        &mut self,
        position: usize,
        at: DateTime<Utc>,
        call_id: &str,
        output: &Option<Value>,
        error: &Option<String>,
    ) {
        let Some(&index) = self.calls.get(call_id) else {
            self.timeline.anomalies.push(Anomaly::DanglingToolResult {
                call_id: call_id.to_string(),
                position,
            });
            return;
        };
        if let Some(TimelineEntry::ToolCall(call)) = self.timeline.entries.get_mut(index) {
            if call.ended_at.is_some() {
                self.timeline.anomalies.push(Anomaly::DuplicateToolResult {
                    call_id: call_id.to_string(),
                    position,
                });
                return;
            }
            call.ended_at = Some(at);
            call.output = output.clone();
            call.error = error.clone();
        }
    }

    fn on_approval_requested(
        &mut self,
        position: usize,
        at: DateTime<Utc>,
        request_id: &str,
        call_id: &Option<String>,
        tool: &str,
    ) {
        if self.approvals.contains_key(request_id) {
            self.timeline.anomalies.push(Anomaly::DuplicateApprovalRequest {
                request_id: request_id.to_string(),
                position,
            });
            return;
        }

        let index = self.timeline.entries.len();
        let mut event = ApprovalEvent {
            request_id: request_id.to_string(),
            call_id: call_id.clone(),
            tool: tool.to_string(),
            turn: self.turn,
            requested_at: at,
            resolution: None,
            resolved_at: None,
            resolved_position: None,
            tool_call: None,
        };

        match call_id {
            Some(call_id) => match self.calls.get(call_id).copied() {
                // The call already started: link it so the gate check can see
                // the request came too late.
                Some(call_index) => {
                    if let Some(TimelineEntry::ToolCall(call)) = self.timeline.entries.get_mut(call_index) {
                        if call.approval.is_none() {
                            call.approval = Some(index);
                            event.tool_call = Some(call_index);
                        }
                    }
                }
                None => {
                    self.approvals_by_call.insert(call_id.clone(), index);
                }
            },
            None => self.unlinked_approvals.push(index),
        }

        self.approvals.insert(request_id.to_string(), index);
        self.timeline.entries.push(TimelineEntry::ApprovalEvent(event));
    }

    fn on_approval_resolved(
        &mut self,
        position: usize,
        at: DateTime<Utc>,
        request_id: &str,
        decision: ApprovalDecision,
    ) {
        let Some(&index) = self.approvals.get(request_id) else {
            self.timeline.anomalies.push(Anomaly::UnmatchedApprovalResolution {
                request_id: request_id.to_string(),
                position,
            });
            return;
        };
        if let Some(TimelineEntry::ApprovalEvent(approval)) = self.timeline.entries.get_mut(index) {
            if approval.resolution.is_some() {
                self.timeline.anomalies.push(Anomaly::DuplicateApprovalResolution {
                    request_id: request_id.to_string(),
                    position,
                });
                return;
            }
            approval.resolution = Some(decision);
            approval.resolved_at = Some(at);
            approval.resolved_position = Some(position);
        }
    }

    fn on_text(&mut self, at: DateTime<Utc>, fragment: &str) {
        if let Some(&index) = self.text_by_turn.get(&self.turn) {
            if let Some(TimelineEntry::TextOutput(text)) = self.timeline.entries.get_mut(index) {
                text.content.push_str(fragment);
                return;
            }
        }
        self.text_by_turn.insert(self.turn, self.timeline.entries.len());
        self.timeline.entries.push(TimelineEntry::TextOutput(TextOutput {
            turn: self.turn,
            content: fragment.to_string(),
            at,
        }));
    }

    fn is_context_path(&self, path: &str) -> bool {
        self.context_markers
            .iter()
            .any(|marker| path_matches(path, marker))
    }
}
