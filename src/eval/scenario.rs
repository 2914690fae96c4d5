use std::{
    collections::BTreeSet,
    fs,
    path::Path,
    time::Duration,
};

use jsonschema::{Draft, JSONSchema};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::{
    approval::{ApprovalMode, ApprovalStrategy},
    error::EvalError,
    eval::evaluators::EvaluatorKind,
    runtime::{scripted::RuntimeScript, RawEvent},
};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CaseError {
    #[error("test case id is empty")]
    MissingId,
    #[error("target agent is empty")]
    MissingAgent,
    #[error("at least one prompt is required")]
    NoPrompts,
    #[error("prompt #{0} has no text")]
    EmptyPrompt(usize),
    #[error("timeout must be greater than zero")]
    ZeroTimeout,
    #[error("scripted approval strategy has no decisions")]
    EmptyApprovalScript,
    #[error("must_use_any_of set #{0} is empty")]
    EmptyToolSet(usize),
    #[error("tool `{0}` is both forbidden and allowed/required")]
    ConflictingTool(String),
    #[error("expected context file #{0} is empty")]
    EmptyContextFragment(usize),
    #[error("min_tool_calls ({min}) exceeds max_tool_calls ({max})")]
    ToolCallBounds { min: usize, max: usize },
    #[error("response_json_schema does not compile: {0}")]
    InvalidResponseSchema(String),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct Prompt {
    pub text: String,
    /// Wait this long before sending the prompt.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub delay_ms: Option<u64>,
}

impl Prompt {
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            delay_ms: None,
        }
    }

    pub fn with_delay_ms(mut self, delay_ms: u64) -> Self {
        self.delay_ms = Some(delay_ms);
        self
    }

    pub fn delay(&self) -> Option<Duration> {
        self.delay_ms.filter(|ms| *ms > 0).map(Duration::from_millis)
    }
}

/// Assertions on the shape of the agent's answer.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct ExpectedOutcome {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub response_contains: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub response_not_contains: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response_json_schema: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min_tool_calls: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_tool_calls: Option<usize>,
}

impl ExpectedOutcome {
    pub fn is_empty(&self) -> bool {
        self.response_contains.is_empty()
            && self.response_not_contains.is_empty()
            && self.response_json_schema.is_none()
            && self.min_tool_calls.is_none()
            && self.max_tool_calls.is_none()
    }
}

/// Declarative policy a test case asserts about the agent's behavior.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct BehaviorExpectation {
    #[serde(default, alias = "mustUseDedicatedTools")]
    pub must_use_dedicated_tools: bool,
    #[serde(default, alias = "mustNotUseTools")]
    pub must_not_use_tools: BTreeSet<String>,
    /// When non-empty, only these tools (and the must-use sets) may be called.
    #[serde(default, alias = "mayUseTools")]
    pub may_use_tools: BTreeSet<String>,
    /// At least one of these sets must be used in full.
    #[serde(default, alias = "mustUseAnyOf")]
    pub must_use_any_of: Vec<BTreeSet<String>>,
    #[serde(default, alias = "requiresApproval")]
    pub requires_approval: bool,
    #[serde(default, alias = "requiresContext")]
    pub requires_context: bool,
    #[serde(default, alias = "expectedContextFiles")]
    pub expected_context_files: Vec<String>,
}

impl BehaviorExpectation {
    /// Whether any option handled by the generic rule engine is set.
    pub fn has_rules(&self) -> bool {
        !self.must_not_use_tools.is_empty()
            || !self.may_use_tools.is_empty()
            || !self.must_use_any_of.is_empty()
            || self.requires_approval
            || self.requires_context
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct TestCase {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,
    pub agent: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    pub prompts: Vec<Prompt>,
    #[serde(default)]
    pub approval: ApprovalStrategy,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
    #[serde(default)]
    pub expected: ExpectedOutcome,
    #[serde(default)]
    pub behavior: BehaviorExpectation,
    /// Restricts the run to these evaluators. All of them run when unset.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub evaluators: Option<Vec<EvaluatorKind>>,
}

impl TestCase {
    pub fn new(id: impl Into<String>, agent: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            description: None,
            tags: Vec::new(),
            agent: agent.into(),
            model: None,
            prompts: Vec::new(),
            approval: ApprovalStrategy::default(),
            timeout_ms: None,
            expected: ExpectedOutcome::default(),
            behavior: BehaviorExpectation::default(),
            evaluators: None,
        }
    }

    pub fn with_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.prompts.push(Prompt::new(prompt));
        self
    }

    pub fn with_prompts<I>(mut self, prompts: I) -> Self
    where
        I: IntoIterator<Item = Prompt>,
    {
        self.prompts.extend(prompts);
        self
    }

    pub fn with_approval(mut self, approval: ApprovalStrategy) -> Self {
        self.approval = approval;
        self
    }

    pub fn with_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.timeout_ms = Some(timeout_ms);
        self
    }

    pub fn with_behavior(mut self, behavior: BehaviorExpectation) -> Self {
        self.behavior = behavior;
        self
    }

    pub fn with_expected(mut self, expected: ExpectedOutcome) -> Self {
        self.expected = expected;
        self
    }

    pub fn with_evaluators(mut self, evaluators: Vec<EvaluatorKind>) -> Self {
        self.evaluators = Some(evaluators);
        self
    }

    pub fn timeout(&self, default: Duration) -> Duration {
        self.timeout_ms.map(Duration::from_millis).unwrap_or(default)
    }

    pub fn runs(&self, kind: EvaluatorKind) -> bool {
        self.evaluators
            .as_ref()
            .map_or(true, |selected| selected.contains(&kind))
    }

    /// Rejects cases that cannot be run meaningfully. Called before any
    /// session is opened.
    pub fn validate(&self) -> Result<(), CaseError> {
        if self.id.trim().is_empty() {
            return Err(CaseError::MissingId);
        }
        if self.agent.trim().is_empty() {
            return Err(CaseError::MissingAgent);
        }
        if self.prompts.is_empty() {
            return Err(CaseError::NoPrompts);
        }
        if let Some(turn) = self.prompts.iter().position(|p| p.text.trim().is_empty()) {
            return Err(CaseError::EmptyPrompt(turn));
        }
        if self.timeout_ms == Some(0) {
            return Err(CaseError::ZeroTimeout);
        }
        if let ApprovalMode::Scripted { decisions } = &self.approval.mode {
            if decisions.is_empty() {
                return Err(CaseError::EmptyApprovalScript);
            }
        }

        let behavior = &self.behavior;
        if let Some(index) = behavior.must_use_any_of.iter().position(BTreeSet::is_empty) {
            return Err(CaseError::EmptyToolSet(index));
        }
        let allowed_or_required = behavior
            .may_use_tools
            .iter()
            .chain(behavior.must_use_any_of.iter().flatten());
        for tool in allowed_or_required {
            if behavior
                .must_not_use_tools
                .iter()
                .any(|forbidden| forbidden.eq_ignore_ascii_case(tool))
            {
                return Err(CaseError::ConflictingTool(tool.clone()));
            }
        }
        if let Some(index) = behavior
            .expected_context_files
            .iter()
            .position(|fragment| fragment.trim().is_empty())
        {
            return Err(CaseError::EmptyContextFragment(index));
        }

        if let (Some(min), Some(max)) = (self.expected.min_tool_calls, self.expected.max_tool_calls) {
            if min > max {
                return Err(CaseError::ToolCallBounds { min, max });
            }
        }
        if let Some(schema) = &self.expected.response_json_schema {
            JSONSchema::options()
                .with_draft(Draft::Draft7)
                .compile(schema)
                .map_err(|e| CaseError::InvalidResponseSchema(e.to_string()))?;
        }
        Ok(())
    }
}

/// A test case as stored on disk, optionally with the script a
/// [`ScriptedRuntime`](crate::runtime::scripted::ScriptedRuntime) should play.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CaseFile {
    #[serde(flatten)]
    pub case: TestCase,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub script: Option<RuntimeScript>,
}

fn parse_case_file(path: &Path) -> Result<CaseFile, EvalError> {
    let bytes = fs::read(path)?;
    let ext = path.extension().and_then(|s| s.to_str()).unwrap_or("");
    let case = if ext == "json" {
        serde_json::from_slice(&bytes)?
    } else {
        serde_yaml::from_slice(&bytes)?
    };
    Ok(case)
}

/// Loads one case file, or every YAML/JSON case in a directory sorted by id.
pub fn load_cases(path: impl AsRef<Path>) -> Result<Vec<CaseFile>, EvalError> {
    let path = path.as_ref();
    if !path.is_dir() {
        return Ok(vec![parse_case_file(path)?]);
    }

    let mut cases = Vec::new();
    for entry in fs::read_dir(path)? {
        let entry = entry?;
        let p = entry.path();
        let ext = p.extension().and_then(|s| s.to_str()).unwrap_or("");
        if !matches!(ext, "yaml" | "yml" | "json") {
            continue;
        }
        cases.push(parse_case_file(&p)?);
    }
    cases.sort_by(|a, b| a.case.id.cmp(&b.case.id));
    Ok(cases)
}

/// Parses a JSONL raw-event log. Blank lines are skipped.
pub fn parse_event_log(content: &str) -> Result<Vec<RawEvent>, EvalError> {
    content
        .lines()
        .enumerate()
        .filter(|(_, line)| !line.trim().is_empty())
        .map(|(i, line)| {
            serde_json::from_str(line).map_err(|e| EvalError::EventLog {
                line: i + 1,
                message: e.to_string(),
            })
        })
        .collect()
}

pub fn load_event_log(path: impl AsRef<Path>) -> Result<Vec<RawEvent>, EvalError> {
    parse_event_log(&fs::read_to_string(path)?)
}
